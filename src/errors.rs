// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Client Bus
//!
//! Two layers of errors live here. `AmqpError` covers everything that goes
//! wrong while talking to the broker (connections, channels, topology,
//! publishing and acknowledging). `MessagingError` covers the publish and
//! consume pipelines: validation, envelope decoding, type resolution and
//! handler failures. Broker errors travel through the pipelines untouched,
//! wrapped transparently in `MessagingError::Amqp`.

use crate::message::Violations;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// None of these are retried by this crate; retry and backoff belong to
/// the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error switching a channel to publisher-confirm mode
    #[error("failure to enable publisher confirms on channel `{0}`")]
    ConfirmSelectError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error requeuing a message
    #[error("failure to requeuing message")]
    RequeuingMessageError,

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq")]
    PublishingToDQLError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error closing a channel or the connection during shutdown
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// A consumer stream ended without being cancelled, usually because its
    /// channel was closed by the broker
    #[error("consumer of queue `{0}` stopped unexpectedly")]
    ConsumerLost(String),

    /// The caller's cancellation token fired before the frame was written
    #[error("operation cancelled")]
    Cancelled,
}

/// Failure raised by a message handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The per-message scope has no handler for the resolved type
    #[error("no handler registered for message type `{0}`")]
    NoHandler(&'static str),

    /// The handler ran and reported a failure
    #[error("handler failed: {0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }
}

/// Errors produced by the publish and consume pipelines.
#[derive(Error, Debug)]
pub enum MessagingError {
    /// Aggregated validation failures, raised before anything reaches the broker
    #[error("message validation failed: {0}")]
    Validation(Violations),

    /// A caller supplied an argument the operation cannot accept
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    /// Encoding was attempted outside of an established message context
    #[error("no message context established for the current flow")]
    MissingContext,

    /// The message body could not be serialized or deserialized
    #[error("failure to (de)serialize `{message_type}`: {source}")]
    Serialization {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// The delivery body is not a well-formed envelope
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),

    /// The envelope names a type the registry does not know
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),

    /// A pipeline stage ran before the stage it depends on
    #[error("pipeline stage `{0}` ran without its prerequisites")]
    PipelineState(&'static str),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The operation was cancelled before it touched the broker
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration value
    #[error("invalid configuration `{key}`: {reason}")]
    Config { key: &'static str, reason: String },

    #[error(transparent)]
    Amqp(AmqpError),
}

impl From<AmqpError> for MessagingError {
    fn from(err: AmqpError) -> Self {
        match err {
            AmqpError::Cancelled => MessagingError::Cancelled,
            err => MessagingError::Amqp(err),
        }
    }
}

impl MessagingError {
    /// Validation failures are never worth retrying.
    pub fn is_validation(&self) -> bool {
        matches!(self, MessagingError::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_cancellation_becomes_pipeline_cancellation() {
        assert!(matches!(
            MessagingError::from(AmqpError::Cancelled),
            MessagingError::Cancelled
        ));
        assert!(matches!(
            MessagingError::from(AmqpError::ConnectionError("refused".to_owned())),
            MessagingError::Amqp(AmqpError::ConnectionError(_))
        ));
    }
}
