// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publish Pipeline
//!
//! Cross-cutting publish behaviour as an ordered chain of middlewares in
//! front of a terminal stage that talks to the broker. Middlewares run in
//! registration order, the first registered being the outermost, and each
//! one decides whether the rest of the chain runs at all.

use crate::{
    context::ContextAccessor,
    errors::MessagingError,
    message::{OutboundMessage, Violations},
    routing::Route,
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// What the broker accepted for one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub envelope_id: Uuid,
    /// Publish sequence number on the channel, pending confirmation.
    pub sequence: u64,
    pub route: Route,
}

/// State carried through the chain for one publish.
pub struct PublishContext<'m> {
    pub message: &'m mut dyn OutboundMessage,
    pub context: &'m mut ContextAccessor,
    pub receipt: Option<PublishReceipt>,
}

impl<'m> PublishContext<'m> {
    pub fn new(
        message: &'m mut dyn OutboundMessage,
        context: &'m mut ContextAccessor,
    ) -> PublishContext<'m> {
        PublishContext {
            message,
            context,
            receipt: None,
        }
    }
}

#[async_trait]
pub trait PublishMiddleware: Send + Sync {
    async fn invoke(
        &self,
        ctx: &mut PublishContext<'_>,
        next: PublishNext<'_>,
        cancellation: &CancellationToken,
    ) -> Result<(), MessagingError>;
}

/// Stage at the end of the chain that hands the message to the broker.
#[async_trait]
pub trait PublishTerminal: Send + Sync {
    async fn publish(
        &self,
        ctx: &mut PublishContext<'_>,
        cancellation: &CancellationToken,
    ) -> Result<(), MessagingError>;
}

/// The rest of the chain after the current middleware.
pub struct PublishNext<'a> {
    middlewares: &'a [Arc<dyn PublishMiddleware>],
    terminal: &'a dyn PublishTerminal,
}

impl<'a> PublishNext<'a> {
    pub fn run<'c, 'm>(
        self,
        ctx: &'c mut PublishContext<'m>,
        cancellation: &'c CancellationToken,
    ) -> BoxFuture<'c, Result<(), MessagingError>>
    where
        'a: 'c,
        'm: 'c,
    {
        Box::pin(async move {
            match self.middlewares.split_first() {
                Some((head, tail)) => {
                    let next = PublishNext {
                        middlewares: tail,
                        terminal: self.terminal,
                    };
                    head.invoke(ctx, next, cancellation).await
                }
                None => self.terminal.publish(ctx, cancellation).await,
            }
        })
    }
}

/// Ordered middlewares; an empty pipeline goes straight to the terminal.
#[derive(Default, Clone)]
pub struct PublishPipeline {
    middlewares: Vec<Arc<dyn PublishMiddleware>>,
}

impl PublishPipeline {
    pub fn new() -> PublishPipeline {
        PublishPipeline::default()
    }

    pub fn with(mut self, middleware: impl PublishMiddleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Validation, then enrichment.
    pub fn standard() -> PublishPipeline {
        PublishPipeline::new()
            .with(ValidationMiddleware)
            .with(EnrichmentMiddleware)
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub async fn execute(
        &self,
        ctx: &mut PublishContext<'_>,
        terminal: &dyn PublishTerminal,
        cancellation: &CancellationToken,
    ) -> Result<(), MessagingError> {
        PublishNext {
            middlewares: &self.middlewares,
            terminal,
        }
        .run(ctx, cancellation)
        .await
    }
}

/// Rejects messages that break their declared constraints. Every violation
/// is collected before failing, and nothing after this stage runs.
pub struct ValidationMiddleware;

#[async_trait]
impl PublishMiddleware for ValidationMiddleware {
    async fn invoke(
        &self,
        ctx: &mut PublishContext<'_>,
        next: PublishNext<'_>,
        cancellation: &CancellationToken,
    ) -> Result<(), MessagingError> {
        let message_type = ctx.message.wire_name();
        let mut violations = Violations::new();
        ctx.message.collect_violations(&mut violations);

        if !violations.is_empty() {
            warn!(
                message_type,
                violations = violations.to_string(),
                "message failed validation"
            );
            return Err(MessagingError::Validation(violations));
        }

        debug!(message_type, "message passed validation");
        next.run(ctx, cancellation).await
    }
}

/// Gives messages without an id a fresh one and records it as the cause of
/// whatever the flow publishes next.
pub struct EnrichmentMiddleware;

#[async_trait]
impl PublishMiddleware for EnrichmentMiddleware {
    async fn invoke(
        &self,
        ctx: &mut PublishContext<'_>,
        next: PublishNext<'_>,
        cancellation: &CancellationToken,
    ) -> Result<(), MessagingError> {
        if ctx.message.current_id().is_nil() {
            let id = Uuid::new_v4();
            ctx.message.assign_id(id);
            ctx.context.set_causation_id(id)?;

            debug!(
                message_type = ctx.message.wire_name(),
                message_id = id.to_string(),
                "message id assigned"
            );
        }

        next.run(ctx, cancellation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{CreateClient, CreatePhone};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CountingTerminal {
        calls: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl PublishTerminal for CountingTerminal {
        async fn publish(
            &self,
            ctx: &mut PublishContext<'_>,
            _cancellation: &CancellationToken,
        ) -> Result<(), MessagingError> {
            self.calls.lock().push(ctx.message.current_id());
            Ok(())
        }
    }

    fn luke() -> CreateClient {
        CreateClient {
            first_name: "Luke".to_owned(),
            last_name: "Skywalker".to_owned(),
            email: "luke@x.com".to_owned(),
            ..CreateClient::default()
        }
    }

    async fn run(message: &mut CreateClient, context: &mut ContextAccessor) -> (Result<(), MessagingError>, Vec<Uuid>) {
        let terminal = CountingTerminal::default();
        let mut ctx = PublishContext::new(message, context);

        let result = PublishPipeline::standard()
            .execute(&mut ctx, &terminal, &CancellationToken::new())
            .await;

        let calls = terminal.calls.lock().clone();
        (result, calls)
    }

    #[tokio::test]
    async fn valid_message_reaches_the_terminal_once() {
        let mut message = luke();
        let mut context = ContextAccessor::new();
        context.get_or_create();

        let (result, calls) = run(&mut message, &mut context).await;

        assert!(result.is_ok());
        assert_eq!(calls.len(), 1);
    }

    #[tokio::test]
    async fn invalid_message_stops_the_chain_with_every_violation() {
        let mut message = CreateClient {
            email: "not-an-email".to_owned(),
            phones: vec![CreatePhone {
                phone_number: "555".to_owned(),
                ..CreatePhone::default()
            }],
            ..CreateClient::default()
        };
        let mut context = ContextAccessor::new();
        context.get_or_create();

        let (result, calls) = run(&mut message, &mut context).await;

        let Err(MessagingError::Validation(violations)) = result else {
            panic!("expected a validation error");
        };
        let fields = violations.fields();
        assert!(fields.contains(&"first_name"));
        assert!(fields.contains(&"last_name"));
        assert!(fields.contains(&"email"));
        assert!(violations.to_string().contains("first name"));
        assert!(fields.iter().any(|f| f.starts_with("phones[0]")));
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn enrichment_assigns_id_and_records_it_as_cause() {
        let mut message = luke();
        let mut context = ContextAccessor::new();
        let correlation_id = context.get_or_create().correlation_id;

        let (result, calls) = run(&mut message, &mut context).await;

        assert!(result.is_ok());
        assert!(!message.id.is_nil());
        assert_eq!(calls, vec![message.id]);
        let current = context.current().unwrap();
        assert_eq!(current.causation_id, Some(message.id));
        assert_eq!(current.correlation_id, correlation_id);
    }

    #[tokio::test]
    async fn existing_id_is_kept() {
        let id = Uuid::new_v4();
        let mut message = CreateClient { id, ..luke() };
        let mut context = ContextAccessor::new();
        context.get_or_create();

        let (result, _) = run(&mut message, &mut context).await;

        assert!(result.is_ok());
        assert_eq!(message.id, id);
        assert_eq!(context.current().unwrap().causation_id, None);
    }

    struct Recording(&'static str, Arc<Mutex<Vec<&'static str>>>);

    #[async_trait]
    impl PublishMiddleware for Recording {
        async fn invoke(
            &self,
            ctx: &mut PublishContext<'_>,
            next: PublishNext<'_>,
            cancellation: &CancellationToken,
        ) -> Result<(), MessagingError> {
            self.1.lock().push(self.0);
            let result = next.run(ctx, cancellation).await;
            self.1.lock().push(self.0);
            result
        }
    }

    #[tokio::test]
    async fn first_registered_middleware_is_outermost() {
        let log = Arc::new(Mutex::new(vec![]));
        let pipeline = PublishPipeline::new()
            .with(Recording("outer", log.clone()))
            .with(Recording("inner", log.clone()));
        let mut message = luke();
        let mut context = ContextAccessor::new();
        let mut ctx = PublishContext::new(&mut message, &mut context);

        pipeline
            .execute(&mut ctx, &CountingTerminal::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*log.lock(), vec!["outer", "inner", "inner", "outer"]);
    }
}
