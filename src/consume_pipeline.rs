// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consume Pipeline
//!
//! A delivery body travels through an ordered list of middlewares before it
//! reaches the terminal stage. The standard chain is:
//!
//! 1. [`ExtractEnvelopeMiddleware`] reads the envelope, payload still raw
//! 2. [`TypeResolutionMiddleware`] looks the wire name up in the registry
//! 3. [`DeserializePayloadMiddleware`] decodes the payload into the set
//! 4. [`ScopeContextMiddleware`] opens a handler scope carrying the
//!    message context and tears it down once the inner stages return
//!
//! and [`DispatchTerminal`] hands the message to its handler.

use crate::{
    context::MessageContext,
    dispatcher::{HandlerScope, ScopeFactory},
    envelope::{self, Envelope},
    errors::MessagingError,
    registry::{MessageSet, MessageTypeRegistry, Registration},
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// State shared by the stages processing one delivery.
pub struct ConsumeContext<S> {
    pub body: Vec<u8>,
    pub envelope: Option<Envelope>,
    pub registration: Option<Registration<S>>,
    pub message: Option<S>,
    pub scope: Option<HandlerScope>,
    pub message_context: Option<MessageContext>,
}

impl<S> ConsumeContext<S> {
    pub fn new(body: &[u8]) -> ConsumeContext<S> {
        ConsumeContext {
            body: body.to_vec(),
            envelope: None,
            registration: None,
            message: None,
            scope: None,
            message_context: None,
        }
    }

    /// Wire name from the envelope, once extracted.
    pub fn message_type(&self) -> Option<&str> {
        self.envelope.as_ref().map(|e| e.message_type.as_str())
    }
}

#[async_trait]
pub trait ConsumeMiddleware<S: MessageSet>: Send + Sync {
    async fn invoke(
        &self,
        ctx: &mut ConsumeContext<S>,
        next: ConsumeNext<'_, S>,
        cancellation: &CancellationToken,
    ) -> Result<(), MessagingError>;
}

/// Last stage of the chain.
#[async_trait]
pub trait ConsumeTerminal<S: MessageSet>: Send + Sync {
    async fn dispatch(
        &self,
        ctx: &mut ConsumeContext<S>,
        cancellation: &CancellationToken,
    ) -> Result<(), MessagingError>;
}

/// The rest of the chain after the current middleware.
pub struct ConsumeNext<'a, S: MessageSet> {
    middlewares: &'a [Arc<dyn ConsumeMiddleware<S>>],
    terminal: &'a dyn ConsumeTerminal<S>,
}

impl<'a, S: MessageSet> ConsumeNext<'a, S> {
    pub fn run<'c>(
        self,
        ctx: &'c mut ConsumeContext<S>,
        cancellation: &'c CancellationToken,
    ) -> BoxFuture<'c, Result<(), MessagingError>>
    where
        'a: 'c,
    {
        Box::pin(async move {
            match self.middlewares.split_first() {
                Some((head, tail)) => {
                    let next = ConsumeNext {
                        middlewares: tail,
                        terminal: self.terminal,
                    };
                    head.invoke(ctx, next, cancellation).await
                }
                None => self.terminal.dispatch(ctx, cancellation).await,
            }
        })
    }
}

/// Ordered middlewares over one terminal stage; the first one added runs
/// outermost.
pub struct ConsumePipeline<S: MessageSet> {
    middlewares: Vec<Arc<dyn ConsumeMiddleware<S>>>,
    terminal: Arc<dyn ConsumeTerminal<S>>,
}

impl<S: MessageSet> ConsumePipeline<S> {
    pub fn new(terminal: Arc<dyn ConsumeTerminal<S>>) -> Self {
        ConsumePipeline {
            middlewares: vec![],
            terminal,
        }
    }

    pub fn with(mut self, middleware: impl ConsumeMiddleware<S> + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Envelope extraction, type resolution, payload decoding and scope
    /// management in front of handler dispatch.
    pub fn standard(
        registry: Arc<MessageTypeRegistry<S>>,
        scopes: Arc<dyn ScopeFactory>,
    ) -> Self {
        ConsumePipeline::new(Arc::new(DispatchTerminal))
            .with(ExtractEnvelopeMiddleware)
            .with(TypeResolutionMiddleware::new(registry))
            .with(DeserializePayloadMiddleware)
            .with(ScopeContextMiddleware::new(scopes))
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Runs one delivery body through the whole chain.
    pub async fn run(
        &self,
        body: &[u8],
        cancellation: &CancellationToken,
    ) -> Result<(), MessagingError> {
        let mut ctx = ConsumeContext::new(body);
        self.run_with(&mut ctx, cancellation).await
    }

    /// Same as [`ConsumePipeline::run`] on a caller-owned context.
    pub async fn run_with(
        &self,
        ctx: &mut ConsumeContext<S>,
        cancellation: &CancellationToken,
    ) -> Result<(), MessagingError> {
        ConsumeNext {
            middlewares: &self.middlewares,
            terminal: self.terminal.as_ref(),
        }
        .run(ctx, cancellation)
        .await
    }
}

pub struct ExtractEnvelopeMiddleware;

#[async_trait]
impl<S: MessageSet> ConsumeMiddleware<S> for ExtractEnvelopeMiddleware {
    async fn invoke(
        &self,
        ctx: &mut ConsumeContext<S>,
        next: ConsumeNext<'_, S>,
        cancellation: &CancellationToken,
    ) -> Result<(), MessagingError> {
        let envelope = envelope::decode(&ctx.body)?;

        debug!(
            envelope_id = envelope.envelope_id.to_string(),
            message_type = envelope.message_type.as_str(),
            correlation_id = envelope.correlation_id.to_string(),
            "envelope extracted"
        );

        ctx.message_context = Some(envelope.message_context());
        ctx.envelope = Some(envelope);

        next.run(ctx, cancellation).await
    }
}

pub struct TypeResolutionMiddleware<S: MessageSet> {
    registry: Arc<MessageTypeRegistry<S>>,
}

impl<S: MessageSet> TypeResolutionMiddleware<S> {
    pub fn new(registry: Arc<MessageTypeRegistry<S>>) -> Self {
        TypeResolutionMiddleware { registry }
    }
}

#[async_trait]
impl<S: MessageSet> ConsumeMiddleware<S> for TypeResolutionMiddleware<S> {
    async fn invoke(
        &self,
        ctx: &mut ConsumeContext<S>,
        next: ConsumeNext<'_, S>,
        cancellation: &CancellationToken,
    ) -> Result<(), MessagingError> {
        let name = ctx
            .message_type()
            .ok_or(MessagingError::PipelineState("type resolution"))?;

        let Some(registration) = self.registry.resolve(name) else {
            warn!(message_type = name, "unknown message type");
            return Err(MessagingError::UnknownMessageType(name.to_owned()));
        };

        ctx.registration = Some(*registration);
        next.run(ctx, cancellation).await
    }
}

pub struct DeserializePayloadMiddleware;

#[async_trait]
impl<S: MessageSet> ConsumeMiddleware<S> for DeserializePayloadMiddleware {
    async fn invoke(
        &self,
        ctx: &mut ConsumeContext<S>,
        next: ConsumeNext<'_, S>,
        cancellation: &CancellationToken,
    ) -> Result<(), MessagingError> {
        let (Some(envelope), Some(registration)) = (&ctx.envelope, &ctx.registration) else {
            return Err(MessagingError::PipelineState("payload deserialization"));
        };

        ctx.message = Some(registration.decode(&envelope.payload)?);
        next.run(ctx, cancellation).await
    }
}

/// Opens the per-delivery handler scope and restores the message context
/// into it. Whatever the inner stages return, the scope is dropped and its
/// context cleared before this middleware returns.
pub struct ScopeContextMiddleware {
    scopes: Arc<dyn ScopeFactory>,
}

impl ScopeContextMiddleware {
    pub fn new(scopes: Arc<dyn ScopeFactory>) -> Self {
        ScopeContextMiddleware { scopes }
    }
}

#[async_trait]
impl<S: MessageSet> ConsumeMiddleware<S> for ScopeContextMiddleware {
    async fn invoke(
        &self,
        ctx: &mut ConsumeContext<S>,
        next: ConsumeNext<'_, S>,
        cancellation: &CancellationToken,
    ) -> Result<(), MessagingError> {
        let context = ctx
            .message_context
            .ok_or(MessagingError::PipelineState("handler scope"))?;

        let mut scope = self.scopes.create_scope();
        scope.context_mut().set_current(context);
        ctx.scope = Some(scope);

        let result = next.run(ctx, cancellation).await;

        if let Some(mut scope) = ctx.scope.take() {
            scope.context_mut().clear();
        }

        result
    }
}

/// Sends the decoded message to the handler of its concrete type.
pub struct DispatchTerminal;

#[async_trait]
impl<S: MessageSet> ConsumeTerminal<S> for DispatchTerminal {
    async fn dispatch(
        &self,
        ctx: &mut ConsumeContext<S>,
        cancellation: &CancellationToken,
    ) -> Result<(), MessagingError> {
        let message = ctx
            .message
            .take()
            .ok_or(MessagingError::PipelineState("dispatch"))?;
        let (Some(scope), Some(context)) = (&ctx.scope, &ctx.message_context) else {
            return Err(MessagingError::PipelineState("dispatch"));
        };

        debug!(message_type = message.message_type(), "dispatching message");

        message
            .dispatch(scope, context, cancellation)
            .await
            .map_err(MessagingError::from)
    }
}
