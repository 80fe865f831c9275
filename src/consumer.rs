// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Runs one delivery through the consume pipeline and settles it with the
//! broker. Outcomes are decided by [`disposition`]:
//!
//! | pipeline | [`RetryPolicy::Requeue`] | [`RetryPolicy::DeadLetter`]         |
//! |----------|--------------------------|-------------------------------------|
//! | ok       | ack                      | ack                                 |
//! | error    | nack, requeue            | nack to retry queue, DLQ at the cap |
//!
//! Validation is a publish-side concern; every consume-side failure is
//! treated the same way.

use crate::{
    consume_pipeline::ConsumePipeline,
    errors::{AmqpError, MessagingError},
    otel,
    queue::QueueDefinition,
    registry::MessageSet,
};
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions},
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable},
    Channel,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::borrow::Cow;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Header carrying the wire type name next to the AMQP `type` property
pub const AMQP_HEADERS_MESSAGE_TYPE: &str = "x-message-type";

/// What happens to a delivery whose processing failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Put it back on the queue straight away, forever.
    #[default]
    Requeue,
    /// Park it in `<queue>-retry` for `retry_ttl_ms`, then redeliver; after
    /// `retries` rounds move it to `<queue>-dlq`.
    DeadLetter { retries: i32, retry_ttl_ms: i32 },
}

impl RetryPolicy {
    /// The queue a consumer with this policy needs: plain and durable, or
    /// with its retry queue and DLQ.
    pub fn queue_definition(self, name: &str) -> QueueDefinition {
        let def = QueueDefinition::new(name).durable();

        match self {
            RetryPolicy::Requeue => def,
            RetryPolicy::DeadLetter {
                retries,
                retry_ttl_ms,
            } => def.with_retry(retry_ttl_ms, retries).with_dlq(),
        }
    }
}

/// How a delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    /// Nack without requeue; the queue dead-letters it into the retry queue.
    Retry,
    DeadLetter,
}

/// Settlement for a pipeline outcome. `death_count` is how many times the
/// delivery already went through the retry queue.
pub fn disposition<T>(
    outcome: &Result<T, MessagingError>,
    policy: RetryPolicy,
    death_count: i64,
) -> Disposition {
    if outcome.is_ok() {
        return Disposition::Ack;
    }

    match policy {
        RetryPolicy::Requeue => Disposition::Requeue,
        RetryPolicy::DeadLetter { retries, .. } if death_count < i64::from(retries) => {
            Disposition::Retry
        }
        RetryPolicy::DeadLetter { .. } => Disposition::DeadLetter,
    }
}

/// Acknowledgement side of a delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl Acknowledge for Acker {
    async fn ack(&self) -> Result<(), AmqpError> {
        Acker::ack(self, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        Acker::nack(
            self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), requeue, "error whiling nack msg");
            if requeue {
                AmqpError::RequeuingMessageError
            } else {
                AmqpError::NackMessageError
            }
        })
    }
}

/// Applies every disposition except [`Disposition::DeadLetter`], which needs
/// a publish before the ack.
pub async fn settle<A>(acker: &A, disposition: Disposition) -> Result<(), AmqpError>
where
    A: Acknowledge + ?Sized,
{
    match disposition {
        Disposition::Ack => acker.ack().await,
        Disposition::Requeue => {
            warn!("error whiling handling msg, requeuing");
            acker.nack(true).await
        }
        Disposition::Retry => {
            warn!("error whiling handling msg, requeuing for latter");
            acker.nack(false).await
        }
        Disposition::DeadLetter => Err(AmqpError::InternalError),
    }
}

/// Processes one delivery end to end: span, pipeline, settlement.
pub(crate) async fn consume<S: MessageSet>(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    pipeline: &ConsumePipeline<S>,
    policy: RetryPolicy,
    queue_def: &QueueDefinition,
    channel: &Channel,
    cancellation: &CancellationToken,
) -> Result<(), AmqpError> {
    let (msg_type, count) = extract_header_properties(&delivery.properties);

    let mut span = otel::consumer_span(&delivery.properties, tracer, &msg_type);

    debug!(
        message_type = msg_type.as_str(),
        exchange = delivery.exchange.as_str(),
        redelivered = delivery.redelivered,
        "received"
    );

    let outcome = pipeline.run(&delivery.data, cancellation).await;

    let decided = disposition(&outcome, policy, count);

    match &outcome {
        Ok(()) => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                message_type = msg_type.as_str(),
                "failure to process msg"
            );
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
    }

    let settled = match decided {
        Disposition::DeadLetter => dead_letter(delivery, queue_def, channel).await,
        other => settle(&delivery.acker, other).await,
    };

    if let Err(err) = &settled {
        span.record_error(err);
        span.set_status(Status::Error {
            description: Cow::from(err.to_string()),
        });
    }

    settled
}

async fn dead_letter(
    delivery: &Delivery,
    queue_def: &QueueDefinition,
    channel: &Channel,
) -> Result<(), AmqpError> {
    let Some(dlq_name) = queue_def.dlq_name() else {
        return settle(&delivery.acker, Disposition::Retry).await;
    };

    error!(queue = queue_def.name(), "too many attempts, sending to dlq");

    channel
        .basic_publish(
            "",
            dlq_name,
            BasicPublishOptions::default(),
            &delivery.data,
            delivery.properties.clone(),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error whiling sending to dlq");
            AmqpError::PublishingToDQLError
        })?;

    settle(&delivery.acker, Disposition::Ack).await
}

/// Message type (AMQP `type` property, else the `x-message-type` header) and
/// the retry count from the `x-death` header.
pub(crate) fn extract_header_properties(props: &AMQPProperties) -> (String, i64) {
    let headers = props.headers().clone().unwrap_or_default();

    let msg_type = match props.kind() {
        Some(value) => value.to_string(),
        None => match headers.inner().get(AMQP_HEADERS_MESSAGE_TYPE) {
            Some(AMQPValue::LongString(value)) => {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            }
            _ => String::new(),
        },
    };

    (msg_type, death_count(&headers))
}

fn death_count(headers: &FieldTable) -> i64 {
    headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(|value| value.as_array())
        .and_then(|deaths| deaths.as_slice().first())
        .and_then(|death| death.as_field_table())
        .and_then(|death| death.inner().get(AMQP_HEADERS_COUNT))
        .and_then(|count| count.as_long_long_int())
        .unwrap_or_default()
}
