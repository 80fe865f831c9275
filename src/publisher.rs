// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! [`MessagePublisher`] is the producer-facing entry point: it establishes
//! the flow context, runs the publish pipeline and ends in
//! [`TerminalPublish`], which routes the message, wraps it in an envelope
//! and writes it through a [`Broker`].
//!
//! A publish returns once the frame is written. The broker's confirmation
//! arrives later and is tracked by the channel manager. Cancellation aborts
//! any wait that happens before the write; a written frame stays written.

use crate::{
    channel::AmqpConnectionManager,
    consumer::AMQP_HEADERS_MESSAGE_TYPE,
    context::ContextAccessor,
    envelope::{self, Envelope},
    errors::{AmqpError, MessagingError},
    message::Message,
    otel,
    publish_pipeline::{PublishContext, PublishPipeline, PublishReceipt, PublishTerminal},
    routing::{DefaultRoutingConvention, Route, RoutingConvention},
};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode for messages that survive a broker restart
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// The broker operations a publisher needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Writes one message and returns its publish sequence number, already
    /// recorded as outstanding. Fails with [`AmqpError::Cancelled`] when
    /// `cancellation` fires before the write.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: BasicProperties,
        cancellation: &CancellationToken,
    ) -> Result<u64, AmqpError>;

    /// Declares the exchange, the queue and their binding. The queue must be
    /// declared with the same arguments its consumers use.
    async fn declare_topology(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;
}

/// Last publish stage: route, envelope, properties, write.
pub struct TerminalPublish {
    broker: Arc<dyn Broker>,
    routing: Arc<dyn RoutingConvention>,
    declared: Mutex<HashSet<Route>>,
}

impl TerminalPublish {
    pub fn new(broker: Arc<dyn Broker>, routing: Arc<dyn RoutingConvention>) -> Self {
        TerminalPublish {
            broker,
            routing,
            declared: Mutex::new(HashSet::new()),
        }
    }

    /// Declares the exchange and the queue of `route` the first time it is
    /// used. Declaring twice is harmless, so a race only costs a round trip.
    async fn ensure_topology(
        &self,
        route: &Route,
        cancellation: &CancellationToken,
    ) -> Result<(), AmqpError> {
        let known = self.declared.lock().contains(route);
        if known {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(AmqpError::Cancelled),
            declared = self.broker.declare_topology(
                &route.routing_key,
                &route.exchange,
                &route.routing_key,
            ) => declared?,
        }

        self.declared.lock().insert(route.clone());
        Ok(())
    }
}

#[async_trait]
impl PublishTerminal for TerminalPublish {
    async fn publish(
        &self,
        ctx: &mut PublishContext<'_>,
        cancellation: &CancellationToken,
    ) -> Result<(), MessagingError> {
        let route = self.routing.resolve_for(ctx.message.wire_name());
        let envelope = envelope::encode(&*ctx.message, ctx.context)?;
        let payload = envelope.to_bytes()?;

        if cancellation.is_cancelled() {
            return Err(MessagingError::Cancelled);
        }
        self.ensure_topology(&route, cancellation).await?;

        let sequence = self
            .broker
            .publish(
                &route.exchange,
                &route.routing_key,
                payload,
                properties_for(&envelope),
                cancellation,
            )
            .await?;

        debug!(
            message_type = envelope.message_type.as_str(),
            exchange = route.exchange.as_str(),
            routing_key = route.routing_key.as_str(),
            sequence,
            "message published"
        );

        ctx.receipt = Some(PublishReceipt {
            envelope_id: envelope.envelope_id,
            sequence,
            route,
        });

        Ok(())
    }
}

/// AMQP properties for an envelope, trace context included.
pub fn properties_for(envelope: &Envelope) -> BasicProperties {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
    otel::inject_current(&mut headers);

    headers.insert(
        ShortString::from(AMQP_HEADERS_MESSAGE_TYPE),
        AMQPValue::LongString(LongString::from(envelope.message_type.clone())),
    );

    BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_message_id(ShortString::from(envelope.envelope_id.to_string()))
        .with_correlation_id(ShortString::from(envelope.correlation_id.to_string()))
        .with_timestamp(u64::try_from(envelope.created_utc.timestamp()).unwrap_or_default())
        .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
        .with_kind(ShortString::from(envelope.message_type.clone()))
        .with_headers(FieldTable::from(headers))
}

/// Publishes messages through the pipeline.
pub struct MessagePublisher {
    pipeline: PublishPipeline,
    terminal: TerminalPublish,
}

impl MessagePublisher {
    /// Uses the standard pipeline: validation, then enrichment.
    pub fn new(broker: Arc<dyn Broker>, routing: Arc<dyn RoutingConvention>) -> Self {
        MessagePublisher {
            pipeline: PublishPipeline::standard(),
            terminal: TerminalPublish::new(broker, routing),
        }
    }

    /// Publishes to the manager's configured exchange.
    pub fn for_manager(manager: Arc<AmqpConnectionManager>) -> Self {
        let routing = Arc::new(DefaultRoutingConvention::new(&manager.configs().exchange));
        MessagePublisher::new(manager, routing)
    }

    pub fn with_pipeline(mut self, pipeline: PublishPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Validates, enriches and publishes `message` within the flow described
    /// by `context`, creating the flow's context when it has none.
    ///
    /// An id assigned during enrichment is written back into `message` and
    /// becomes the causation id of `context`.
    pub async fn publish<M: Message>(
        &self,
        message: &mut M,
        context: &mut ContextAccessor,
        cancellation: &CancellationToken,
    ) -> Result<PublishReceipt, MessagingError> {
        context.get_or_create();

        let mut ctx = PublishContext::new(message, context);
        self.pipeline
            .execute(&mut ctx, &self.terminal, cancellation)
            .await?;

        ctx.receipt
            .ok_or(MessagingError::PipelineState("publish terminal"))
    }
}
