// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Installation
//!
//! Declares exchanges, queues (with their retry queues and DLQs) and the
//! bindings between them. Every declaration is idempotent on the broker as
//! long as the arguments do not change, so installing the same topology
//! twice is safe.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel,
};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Interface for topology management.
#[async_trait]
pub trait Topology<'tp> {
    fn exchange(self, def: &'tp ExchangeDefinition) -> Self;

    fn queue(self, def: &'tp QueueDefinition) -> Self;

    fn queue_binding(self, binding: &'tp QueueBinding) -> Self;

    /// Declares exchanges, then queues, then bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology<'tp> {
    channel: Channel,
    pub(crate) queues: Vec<&'tp QueueDefinition>,
    pub(crate) queues_binding: Vec<&'tp QueueBinding>,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: Channel) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology<'_> {
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            self.channel
                .exchange_declare(
                    &exch.name,
                    exch.kind(),
                    ExchangeDeclareOptions {
                        passive: false,
                        durable: exch.durable,
                        auto_delete: false,
                        internal: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(
                        error = err.to_string(),
                        name = exch.name,
                        "error to declare the exchange"
                    );
                    AmqpError::DeclareExchangeError(exch.name.clone())
                })?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            if let Some(retry_name) = &def.retry_name {
                self.declare(def, retry_name, retry_queue_arguments(def))
                    .await?;
            }

            if let Some(dlq_name) = &def.dlq_name {
                self.declare(def, dlq_name, BTreeMap::new()).await?;
            }

            self.declare(def, &def.name, main_queue_arguments(def))
                .await?;

            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn declare(
        &self,
        def: &QueueDefinition,
        name: &str,
        args: BTreeMap<ShortString, AMQPValue>,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::from(args),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the queue");
                AmqpError::DeclareQueueError(name.to_owned())
            })
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            self.channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to bind queue to exchange");
                    AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    )
                })?;
        }

        Ok(())
    }
}

/// Arguments of the main queue: failed deliveries dead-letter into the
/// retry queue when there is one, otherwise into the DLQ.
pub(crate) fn main_queue_arguments(def: &QueueDefinition) -> BTreeMap<ShortString, AMQPValue> {
    let mut args = BTreeMap::new();

    if let Some(target) = def.retry_name.as_ref().or(def.dlq_name.as_ref()) {
        dead_letter_to(&mut args, target);
    }

    args
}

/// Arguments of the retry queue: hold for `retry_ttl`, then back to the main queue.
pub(crate) fn retry_queue_arguments(def: &QueueDefinition) -> BTreeMap<ShortString, AMQPValue> {
    let mut args = BTreeMap::new();
    dead_letter_to(&mut args, &def.name);

    if let Some(ttl) = def.retry_ttl {
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }

    args
}

fn dead_letter_to(args: &mut BTreeMap<ShortString, AMQPValue>, queue: &str) {
    // the default exchange routes by queue name
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from("")),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(queue)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routing_key_of(args: &BTreeMap<ShortString, AMQPValue>) -> Option<String> {
        match args.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)) {
            Some(AMQPValue::LongString(value)) => {
                Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
            }
            _ => None,
        }
    }

    #[test]
    fn plain_queue_has_no_arguments() {
        assert!(main_queue_arguments(&QueueDefinition::new("CreateClient").durable()).is_empty());
    }

    #[test]
    fn main_queue_dead_letters_into_retry_queue() {
        let def = QueueDefinition::new("CreateClient")
            .with_retry(1_000, 3)
            .with_dlq();

        let main = main_queue_arguments(&def);
        let retry = retry_queue_arguments(&def);

        assert_eq!(routing_key_of(&main).as_deref(), Some("CreateClient-retry"));
        assert_eq!(routing_key_of(&retry).as_deref(), Some("CreateClient"));
        assert!(matches!(
            retry.get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)),
            Some(AMQPValue::LongInt(1_000))
        ));
    }

    #[test]
    fn without_retry_failures_go_to_the_dlq() {
        let def = QueueDefinition::new("CreateClient").with_dlq();

        assert_eq!(
            routing_key_of(&main_queue_arguments(&def)).as_deref(),
            Some("CreateClient-dlq")
        );
    }
}
