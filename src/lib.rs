// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # client-bus
//!
//! RabbitMQ messaging substrate of the client manager: publisher-confirmed
//! publishing behind a middleware pipeline, envelope-wrapped messages that
//! carry their causal context, and type-name dispatch to per-message
//! handlers on the consuming side.

mod otel;

pub mod channel;
pub mod configs;
pub mod confirms;
pub mod consume_pipeline;
pub mod consumer;
pub mod context;
pub mod contracts;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod publish_pipeline;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod routing;
pub mod topology;

pub use channel::{AmqpConnectionManager, ChannelOptions};
pub use configs::AmqpConfigs;
pub use context::{ContextAccessor, MessageContext};
pub use dispatcher::{HandlerScope, MessageHandler, RabbitMQDispatcher, ScopeFactory};
pub use errors::{AmqpError, HandlerError, MessagingError};
pub use message::{Message, MessageKind, Validate, Violations};
pub use publisher::{Broker, MessagePublisher};
pub use registry::{MessageSet, MessageTypeRegistry};
pub use routing::{DefaultRoutingConvention, Route, RoutingConvention};
