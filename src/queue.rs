// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! One durable queue per message type, optionally paired with a retry queue
//! and a Dead Letter Queue (DLQ) when the consumer runs with a bounded
//! retry policy instead of requeueing forever.

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// The retry queue holds failed deliveries for `retry_ttl` milliseconds and
/// then dead-letters them back to the main queue; after `retries` round
/// trips the consumer moves the delivery to the DLQ.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) dlq_name: Option<String>,
    pub(crate) retry_name: Option<String>,
    pub(crate) retry_ttl: Option<i32>,
    pub(crate) retries: Option<i32>,
}

impl QueueDefinition {
    /// Creates a non-durable queue definition. Queues are never exclusive
    /// and never auto-deleted.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Adds a `<name>-dlq` Dead Letter Queue.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Adds a `<name>-retry` queue.
    ///
    /// # Parameters
    /// * `ttl` - Time in milliseconds to wait before redelivering
    /// * `retries` - Maximum number of retry attempts
    pub fn with_retry(mut self, ttl: i32, retries: i32) -> Self {
        self.retry_name = Some(format!("{}-retry", self.name));
        self.retries = Some(retries);
        self.retry_ttl = Some(ttl);
        self
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    pub fn retry_name(&self) -> Option<&str> {
        self.retry_name.as_deref()
    }

    pub fn retries(&self) -> Option<i32> {
        self.retries
    }
}

/// Binds a queue to an exchange under one routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_and_dlq_names_derive_from_the_queue() {
        let def = QueueDefinition::new("CreateClient")
            .durable()
            .with_retry(5_000, 3)
            .with_dlq();

        assert_eq!(def.retry_name(), Some("CreateClient-retry"));
        assert_eq!(def.dlq_name(), Some("CreateClient-dlq"));
        assert_eq!(def.retries(), Some(3));
        assert!(def.durable);
    }

    #[test]
    fn plain_queue_has_no_side_queues() {
        let def = QueueDefinition::new("ClientCreated");

        assert_eq!(def.retry_name(), None);
        assert_eq!(def.dlq_name(), None);
    }
}
