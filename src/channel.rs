// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! One lazily opened connection per manager and a cache of channels keyed
//! by logical name: the exchange name for publishing, the queue name for
//! consuming. Publishing channels run in confirm mode; every publish gets a
//! sequence number that is tracked in [`OutstandingConfirms`] until the
//! broker acks or nacks it.
//!
//! Sequence numbers restart at 1 whenever a channel is recreated, so each
//! channel instance tracks its confirms under its own key, see
//! [`confirm_key`].
//!
//! Nothing here retries. A broker that cannot be reached surfaces as
//! `AmqpError::ConnectionError` and the caller decides what to do.

use crate::{
    configs::AmqpConfigs,
    confirms::OutstandingConfirms,
    consumer::RetryPolicy,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    publisher::Broker,
    queue::{QueueBinding, QueueDefinition},
    topology::{AmqpTopology, Topology},
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, FutureExt};
use lapin::{
    message::BasicReturnMessage,
    options::{BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation,
    types::{AMQPValue, LongLongInt, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Header carrying the publish sequence number, so that a message returned
/// by the broker can be matched to the publish that sent it.
pub const PUBLISH_SEQUENCE_NUMBER_HEADER: &str = "x-publish-sequence-number";

const REPLY_SUCCESS: u16 = 200;

/// How a channel is configured when it is first created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    pub publisher_confirms: bool,
    /// Publishes allowed to wait for a confirmation at the same time.
    pub max_outstanding_confirms: usize,
}

impl ChannelOptions {
    pub fn publishing(max_outstanding_confirms: usize) -> ChannelOptions {
        ChannelOptions {
            publisher_confirms: true,
            max_outstanding_confirms: max_outstanding_confirms.max(1),
        }
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions::publishing(crate::configs::DEFAULT_MAX_OUTSTANDING_CONFIRMS)
    }
}

/// Tracker key of one channel instance: the logical key plus the generation
/// the manager assigned when it created the channel.
pub fn confirm_key(key: &str, generation: u64) -> String {
    format!("{key}#{generation}")
}

/// Broker confirmation of one written frame.
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation, AmqpError>>;

/// Writes a single frame on a confirm-mode channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RawPublish: Send + Sync {
    /// Publishes with the `mandatory` flag. Resolves once the frame is
    /// written; the returned future resolves with the broker's confirmation.
    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PendingConfirm, AmqpError>;
}

#[async_trait]
impl RawPublish for Channel {
    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PendingConfirm, AmqpError> {
        let confirm = self
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        Ok(async move {
            confirm
                .await
                .map_err(|err| AmqpError::PublishingError(err.to_string()))
        }
        .boxed())
    }
}

/// Allocates publish sequence numbers for one channel instance, bounds the
/// confirmation window and records every publish as outstanding.
pub struct SequencedPublisher<P> {
    key: String,
    raw: P,
    next_sequence: Mutex<u64>,
    in_flight: Arc<Semaphore>,
    confirms: Arc<OutstandingConfirms>,
}

impl<P: RawPublish> SequencedPublisher<P> {
    pub fn new(
        key: impl Into<String>,
        raw: P,
        max_outstanding_confirms: usize,
        confirms: Arc<OutstandingConfirms>,
    ) -> SequencedPublisher<P> {
        SequencedPublisher {
            key: key.into(),
            raw,
            // confirm-mode delivery tags start at 1 on every channel
            next_sequence: Mutex::new(1),
            in_flight: Arc::new(Semaphore::new(max_outstanding_confirms.max(1))),
            confirms,
        }
    }

    /// Key under which this publisher's sequences are tracked.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn raw(&self) -> &P {
        &self.raw
    }

    /// Publishes and returns the sequence number.
    ///
    /// The number is recorded as outstanding before the frame is written and
    /// only consumed when the write succeeds. Waiting for room in the confirm
    /// window or for the sequence lock ends early with
    /// [`AmqpError::Cancelled`] when `cancellation` fires; the write itself
    /// is never interrupted. The confirmation is handled by a watcher task.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
        cancellation: &CancellationToken,
    ) -> Result<u64, AmqpError> {
        let permit = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(AmqpError::Cancelled),
            permit = self.in_flight.clone().acquire_owned() => {
                permit.map_err(|_| AmqpError::ChannelError(self.key.clone()))?
            }
        };

        // held until the write completes so sequence order matches wire order
        let mut next_sequence = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(AmqpError::Cancelled),
            guard = self.next_sequence.lock() => guard,
        };
        let sequence = *next_sequence;

        self.confirms.track(&self.key, sequence);

        let confirm = match self
            .raw
            .send(
                exchange,
                routing_key,
                payload,
                with_sequence_header(properties, sequence),
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, sequence, "error publishing message"
                );
                self.confirms.forget(&self.key, sequence);
                return Err(err);
            }
        };

        *next_sequence += 1;
        drop(next_sequence);

        tokio::spawn(watch_confirm(
            self.key.clone(),
            sequence,
            confirm,
            self.confirms.clone(),
            permit,
        ));

        Ok(sequence)
    }
}

/// A cached channel together with its publish sequence and confirm window.
pub struct ConfirmChannel {
    key: String,
    generation: u64,
    publisher: SequencedPublisher<Channel>,
}

impl ConfirmChannel {
    fn new(
        key: &str,
        generation: u64,
        channel: Channel,
        options: ChannelOptions,
        confirms: Arc<OutstandingConfirms>,
    ) -> ConfirmChannel {
        ConfirmChannel {
            key: key.to_owned(),
            generation,
            publisher: SequencedPublisher::new(
                confirm_key(key, generation),
                channel,
                options.max_outstanding_confirms,
                confirms,
            ),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Key of this channel instance in the confirm tracker.
    pub fn confirm_key(&self) -> &str {
        self.publisher.key()
    }

    pub fn inner(&self) -> &Channel {
        self.publisher.raw()
    }

    pub fn is_open(&self) -> bool {
        self.inner().status().connected()
    }

    /// See [`SequencedPublisher::publish`].
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
        cancellation: &CancellationToken,
    ) -> Result<u64, AmqpError> {
        self.publisher
            .publish(exchange, routing_key, payload, properties, cancellation)
            .await
    }
}

async fn watch_confirm(
    key: String,
    sequence: u64,
    confirm: PendingConfirm,
    confirms: Arc<OutstandingConfirms>,
    _permit: OwnedSemaphorePermit,
) {
    match confirm.await {
        Ok(Confirmation::Ack(returned)) => {
            if let Some(returned) = returned {
                log_returned(&returned);
            }
            confirms.ack(&key, sequence, false);
        }
        Ok(Confirmation::Nack(returned)) => {
            if let Some(returned) = returned {
                log_returned(&returned);
            }
            warn!(channel = key.as_str(), sequence, "message nack-ed by the broker");
            confirms.nack(&key, sequence, false);
        }
        Ok(Confirmation::NotRequested) => {
            confirms.ack(&key, sequence, false);
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                channel = key.as_str(),
                sequence,
                "confirmation lost"
            );
            confirms.nack(&key, sequence, false);
        }
    }
}

/// Unroutable mandatory publishes come back here. The original publish has
/// already returned successfully, so this is reported and nothing more.
fn log_returned(returned: &BasicReturnMessage) {
    warn!(
        exchange = returned.delivery.exchange.as_str(),
        routing_key = returned.delivery.routing_key.as_str(),
        reply_text = returned.reply_text.as_str(),
        sequence = returned_sequence(&returned.delivery.properties),
        "message has been basic.return-ed"
    );
}

fn with_sequence_header(properties: BasicProperties, sequence: u64) -> BasicProperties {
    let mut headers = properties.headers().clone().unwrap_or_default();
    headers.insert(
        ShortString::from(PUBLISH_SEQUENCE_NUMBER_HEADER),
        AMQPValue::LongLongInt(LongLongInt::try_from(sequence).unwrap_or(LongLongInt::MAX)),
    );
    properties.with_headers(headers)
}

/// Sequence number carried by a returned message, 0 when absent.
pub fn returned_sequence(properties: &BasicProperties) -> u64 {
    let Some(headers) = properties.headers() else {
        return 0;
    };

    match headers.inner().get(PUBLISH_SEQUENCE_NUMBER_HEADER) {
        Some(AMQPValue::LongLongInt(v)) => u64::try_from(*v).unwrap_or_default(),
        Some(AMQPValue::LongInt(v)) => u64::try_from(*v).unwrap_or_default(),
        Some(AMQPValue::LongUInt(v)) => u64::from(*v),
        Some(AMQPValue::Timestamp(v)) => *v,
        Some(AMQPValue::ByteArray(bytes)) => <[u8; 8]>::try_from(bytes.as_slice())
            .map(u64::from_be_bytes)
            .unwrap_or_default(),
        _ => 0,
    }
}

/// Owns the broker connection and the channel cache.
pub struct AmqpConnectionManager {
    configs: AmqpConfigs,
    connection: Mutex<Option<Arc<Connection>>>,
    channels: Mutex<HashMap<String, Arc<ConfirmChannel>>>,
    generations: AtomicU64,
    confirms: Arc<OutstandingConfirms>,
    policy: RetryPolicy,
}

impl AmqpConnectionManager {
    pub fn new(configs: AmqpConfigs) -> AmqpConnectionManager {
        AmqpConnectionManager {
            configs,
            connection: Mutex::new(None),
            channels: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            confirms: Arc::new(OutstandingConfirms::new()),
            policy: RetryPolicy::default(),
        }
    }

    /// Sets how consumers settle failed deliveries. The policy shapes every
    /// queue this manager declares, for publishers and consumers alike.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn configs(&self) -> &AmqpConfigs {
        &self.configs
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    /// The queue declared for `name`. Every declaration of a queue goes
    /// through here, because the broker refuses a redeclaration whose
    /// arguments differ.
    pub fn queue_definition(&self, name: &str) -> QueueDefinition {
        self.policy.queue_definition(name)
    }

    /// Tracker shared by every channel of this manager.
    pub fn confirms(&self) -> Arc<OutstandingConfirms> {
        self.confirms.clone()
    }

    /// Returns the open connection, connecting first if there is none or the
    /// previous one was closed.
    pub async fn get_connection(&self) -> Result<Arc<Connection>, AmqpError> {
        let mut current = self.connection.lock().await;

        if let Some(conn) = current.as_ref() {
            if conn.status().connected() {
                return Ok(conn.clone());
            }
            warn!("amqp connection closed, reconnecting");
        }

        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.configs.app_name.clone()));

        let conn = Connection::connect(&self.configs.uri(), options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to connect");
                AmqpError::ConnectionError(err.to_string())
            })?;
        debug!("amqp connected");

        let conn = Arc::new(conn);
        *current = Some(conn.clone());
        Ok(conn)
    }

    /// Returns the cached channel for `key`, creating it when missing or
    /// closed. The cache lock is held across creation, so concurrent callers
    /// never build two channels for one key.
    pub async fn get_or_create_channel(
        &self,
        key: &str,
        options: ChannelOptions,
    ) -> Result<Arc<ConfirmChannel>, AmqpError> {
        let mut channels = self.channels.lock().await;

        if let Some(channel) = channels.get(key) {
            if channel.is_open() {
                return Ok(channel.clone());
            }
            debug!(key, "cached channel closed, recreating");
        }

        let conn = self.get_connection().await?;

        debug!(key, "creating amqp channel...");
        let raw = conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), key, "error to create the channel");
            AmqpError::ChannelError(key.to_owned())
        })?;

        if options.publisher_confirms {
            raw.confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), key, "error to enable confirms");
                    AmqpError::ConfirmSelectError(key.to_owned())
                })?;
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let channel = Arc::new(ConfirmChannel::new(
            key,
            generation,
            raw,
            options,
            self.confirms.clone(),
        ));
        channels.insert(key.to_owned(), channel.clone());
        debug!(key, generation, "channel created");

        Ok(channel)
    }

    /// Declares a durable direct exchange, the durable queue given by
    /// [`AmqpConnectionManager::queue_definition`] and the binding between
    /// them. Safe to call repeatedly.
    pub async fn declare_topology(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.declare_queue_topology(&self.queue_definition(queue), exchange, routing_key)
            .await
    }

    /// Same as [`AmqpConnectionManager::declare_topology`] for a queue that
    /// may carry retry and dead-letter queues.
    pub async fn declare_queue_topology(
        &self,
        queue: &QueueDefinition,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let channel = self
            .get_or_create_channel(queue.name(), ChannelOptions::default())
            .await?;

        let exchange_def = ExchangeDefinition::new(exchange).durable();
        let binding = QueueBinding::new(queue.name())
            .exchange(exchange)
            .routing_key(routing_key);

        AmqpTopology::new(channel.inner().clone())
            .exchange(&exchange_def)
            .queue(queue)
            .queue_binding(&binding)
            .install()
            .await
    }

    /// Limits unacknowledged deliveries on a consuming channel.
    pub async fn set_prefetch(&self, channel: &ConfirmChannel, prefetch: u16) -> Result<(), AmqpError> {
        channel
            .inner()
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(channel.key().to_owned())
            })
    }

    /// Closes every cached channel, then the connection.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        let drained: Vec<_> = self.channels.lock().await.drain().collect();

        for (key, channel) in drained {
            if !channel.is_open() {
                continue;
            }
            if let Err(err) = channel.inner().close(REPLY_SUCCESS, "OK").await {
                warn!(error = err.to_string(), key, "failure to close channel");
            }
        }

        let Some(conn) = self.connection.lock().await.take() else {
            return Ok(());
        };

        if conn.status().connected() {
            conn.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
                error!(error = err.to_string(), "failure to close connection");
                AmqpError::CloseError("connection".to_owned())
            })?;
        }

        debug!("amqp connection closed");
        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpConnectionManager {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: BasicProperties,
        cancellation: &CancellationToken,
    ) -> Result<u64, AmqpError> {
        let options = ChannelOptions::publishing(self.configs.max_outstanding_confirms);
        let channel = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(AmqpError::Cancelled),
            channel = self.get_or_create_channel(exchange, options) => channel?,
        };

        channel
            .publish(exchange, routing_key, &payload, properties, cancellation)
            .await
    }

    async fn declare_topology(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        AmqpConnectionManager::declare_topology(self, queue, exchange, routing_key).await
    }
}
