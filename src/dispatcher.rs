// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Handlers implement [`MessageHandler`] for the concrete message types they
//! accept. Each delivery gets a fresh [`HandlerScope`] from a
//! [`ScopeFactory`], so handler state never leaks between messages.
//!
//! [`RabbitMQDispatcher`] subscribes one consumer per registered message
//! type (the queue is named after the type) and feeds every delivery through
//! the consume pipeline until its cancellation token fires. A consumer whose
//! stream ends before that is reported as [`AmqpError::ConsumerLost`].

use crate::{
    channel::{AmqpConnectionManager, ChannelOptions},
    consume_pipeline::ConsumePipeline,
    consumer::consume,
    context::{ContextAccessor, MessageContext},
    errors::{AmqpError, HandlerError, MessagingError},
    message::Message,
    otel::TRACER_NAME,
    queue::QueueDefinition,
    registry::{MessageSet, MessageTypeRegistry},
    routing::{DefaultRoutingConvention, RoutingConvention},
};
use async_trait::async_trait;
use futures_util::{future::join_all, Stream, StreamExt};
use lapin::{options::BasicConsumeOptions, types::FieldTable};
use opentelemetry::global;
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Handles one concrete message type.
#[async_trait]
pub trait MessageHandler<M: Send + 'static>: Send + Sync {
    async fn handle(
        &self,
        message: M,
        context: &MessageContext,
        cancellation: &CancellationToken,
    ) -> Result<(), HandlerError>;
}

#[cfg(test)]
mockall::mock! {
    pub MessageHandler<M: Send + Sync + 'static> {}

    #[async_trait]
    impl<M: Send + Sync + 'static> MessageHandler<M> for MessageHandler<M> {
        async fn handle(
            &self,
            message: M,
            context: &MessageContext,
            cancellation: &CancellationToken,
        ) -> Result<(), HandlerError>;
    }
}

/// The handlers available to a single delivery, plus that delivery's flow
/// context. Dropped as soon as the delivery has been dispatched.
#[derive(Default)]
pub struct HandlerScope {
    handlers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    context: ContextAccessor,
}

impl HandlerScope {
    pub fn new() -> HandlerScope {
        HandlerScope::default()
    }

    pub fn with_handler<M, H>(self, handler: H) -> Self
    where
        M: Message,
        H: MessageHandler<M> + 'static,
    {
        self.with_shared_handler::<M>(Arc::new(handler))
    }

    /// Registers a handler instance shared with other scopes.
    pub fn with_shared_handler<M: Message>(mut self, handler: Arc<dyn MessageHandler<M>>) -> Self {
        self.handlers.insert(TypeId::of::<M>(), Box::new(handler));
        self
    }

    pub fn handler<M: Message>(&self) -> Option<Arc<dyn MessageHandler<M>>> {
        self.handlers
            .get(&TypeId::of::<M>())
            .and_then(|h| h.downcast_ref::<Arc<dyn MessageHandler<M>>>())
            .cloned()
    }

    /// Runs the handler registered for `M`.
    pub async fn invoke<M: Message>(
        &self,
        message: M,
        context: &MessageContext,
        cancellation: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let handler = self
            .handler::<M>()
            .ok_or(HandlerError::NoHandler(M::MESSAGE_TYPE))?;

        handler.handle(message, context, cancellation).await
    }

    pub fn context(&self) -> &ContextAccessor {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ContextAccessor {
        &mut self.context
    }
}

/// Builds a fresh [`HandlerScope`] for every delivery.
pub trait ScopeFactory: Send + Sync {
    fn create_scope(&self) -> HandlerScope;
}

impl<F> ScopeFactory for F
where
    F: Fn() -> HandlerScope + Send + Sync,
{
    fn create_scope(&self) -> HandlerScope {
        self()
    }
}

/// Consumes every queue of a [`MessageSet`] from RabbitMQ.
pub struct RabbitMQDispatcher<S: MessageSet> {
    manager: Arc<AmqpConnectionManager>,
    registry: Arc<MessageTypeRegistry<S>>,
    pipeline: Arc<ConsumePipeline<S>>,
    routing: Arc<dyn RoutingConvention>,
}

impl<S: MessageSet> RabbitMQDispatcher<S> {
    /// Creates a dispatcher running the standard consume pipeline.
    pub fn new(
        manager: Arc<AmqpConnectionManager>,
        registry: Arc<MessageTypeRegistry<S>>,
        scopes: Arc<dyn ScopeFactory>,
    ) -> Self {
        let routing = Arc::new(DefaultRoutingConvention::new(&manager.configs().exchange));

        RabbitMQDispatcher {
            manager,
            pipeline: Arc::new(ConsumePipeline::standard(registry.clone(), scopes)),
            registry,
            routing,
        }
    }

    pub fn with_pipeline(mut self, pipeline: ConsumePipeline<S>) -> Self {
        self.pipeline = Arc::new(pipeline);
        self
    }

    pub fn with_routing(mut self, routing: Arc<dyn RoutingConvention>) -> Self {
        self.routing = routing;
        self
    }

    /// Consumers settle failures with the manager's retry policy, and their
    /// queues are declared the way the manager declares them for publishers.
    fn queue_definition(&self, name: &str) -> QueueDefinition {
        self.manager.queue_definition(name)
    }

    /// Subscribes to every registered type and processes deliveries until
    /// `cancellation` fires. A failing delivery never stops its consumer.
    ///
    /// Returns [`AmqpError::ConsumerLost`] when a consumer stream ended
    /// without cancellation, once every consumer has stopped.
    pub async fn consume_until_cancelled(
        &self,
        cancellation: CancellationToken,
    ) -> Result<(), MessagingError> {
        let mut spawns = vec![];

        for name in self.registry.names() {
            let route = self.routing.resolve_for(name);
            let queue_def = self.queue_definition(name);

            self.manager
                .declare_queue_topology(&queue_def, &route.exchange, &route.routing_key)
                .await?;

            let channel = self
                .manager
                .get_or_create_channel(name, ChannelOptions::default())
                .await?;
            self.manager
                .set_prefetch(&channel, self.manager.configs().prefetch)
                .await?;

            let consumer_tag = format!("{}-{}", self.manager.configs().app_name, name);
            let mut consumer = channel
                .inner()
                .basic_consume(
                    name,
                    &consumer_tag,
                    BasicConsumeOptions {
                        no_local: false,
                        no_ack: false,
                        exclusive: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), queue = name, "failure to create the consumer");
                    AmqpError::BindingConsumerError(name.to_owned())
                })?;

            debug!(queue = name, "consumer started");

            let pipeline = self.pipeline.clone();
            let policy = self.manager.retry_policy();
            let cancellation = cancellation.clone();

            spawns.push(tokio::spawn(async move {
                let tracer = global::tracer(TRACER_NAME);

                let exit = loop {
                    let delivery =
                        match next_delivery(queue_def.name(), &mut consumer, &cancellation).await {
                            Ok(delivery) => delivery,
                            Err(exit) => break exit,
                        };

                    if let Err(err) = consume(
                        &tracer,
                        &delivery,
                        &pipeline,
                        policy,
                        &queue_def,
                        channel.inner(),
                        &cancellation,
                    )
                    .await
                    {
                        error!(error = err.to_string(), "error consume msg");
                    }
                };

                debug!(queue = queue_def.name(), "consumer stopped");
                exit.into_result(queue_def.name())
            }));
        }

        let mut outcome = Ok(());
        for res in join_all(spawns).await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if outcome.is_ok() {
                        outcome = Err(err.into());
                    }
                }
                Err(_) => {
                    error!("tokio process error");
                    return Err(AmqpError::InternalError.into());
                }
            }
        }

        outcome
    }
}

/// Why a consumer loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConsumerExit {
    Cancelled,
    StreamEnded,
}

impl ConsumerExit {
    fn into_result(self, queue: &str) -> Result<(), AmqpError> {
        match self {
            ConsumerExit::Cancelled => Ok(()),
            ConsumerExit::StreamEnded => Err(AmqpError::ConsumerLost(queue.to_owned())),
        }
    }
}

/// Next delivery of a consumer stream. Stream errors are logged and skipped.
/// A stream that ends after `cancellation` fired counts as cancelled, since
/// shutdown closes the channels under the consumers.
pub(crate) async fn next_delivery<St, T>(
    queue: &str,
    stream: &mut St,
    cancellation: &CancellationToken,
) -> Result<T, ConsumerExit>
where
    St: Stream<Item = Result<T, lapin::Error>> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(ConsumerExit::Cancelled),
            next = stream.next() => match next {
                Some(Ok(delivery)) => return Ok(delivery),
                Some(Err(err)) => error!(error = err.to_string(), queue, "errors consume msg"),
                None if cancellation.is_cancelled() => return Err(ConsumerExit::Cancelled),
                None => {
                    warn!(queue, "consumer stream ended, channel closed");
                    return Err(ConsumerExit::StreamEnded);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configs::AmqpConfigs,
        consumer::RetryPolicy,
        contracts::{ClientCreated, ClientMessage, CreateClient},
        topology::main_queue_arguments,
    };
    use futures_util::stream;
    use uuid::Uuid;

    #[tokio::test]
    async fn consumer_stream_end_is_reported_as_lost() {
        let mut consumer = stream::iter(vec![Ok::<u64, lapin::Error>(1)]);
        let cancellation = CancellationToken::new();

        let first = next_delivery("CreateClient", &mut consumer, &cancellation).await;
        let exit = next_delivery("CreateClient", &mut consumer, &cancellation)
            .await
            .unwrap_err();

        assert_eq!(first.unwrap(), 1);
        assert_eq!(exit, ConsumerExit::StreamEnded);
        assert_eq!(
            exit.into_result("CreateClient"),
            Err(AmqpError::ConsumerLost("CreateClient".to_owned()))
        );
    }

    #[tokio::test]
    async fn cancelled_consumer_stops_cleanly() {
        let mut idle = stream::pending::<Result<u64, lapin::Error>>();
        let mut closed = stream::empty::<Result<u64, lapin::Error>>();
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let idle_exit = next_delivery("CreateClient", &mut idle, &cancellation)
            .await
            .unwrap_err();
        let closed_exit = next_delivery("CreateClient", &mut closed, &cancellation)
            .await
            .unwrap_err();

        assert_eq!(idle_exit, ConsumerExit::Cancelled);
        assert_eq!(closed_exit, ConsumerExit::Cancelled);
        assert_eq!(idle_exit.into_result("CreateClient"), Ok(()));
    }

    #[test]
    fn consumers_declare_the_queues_publishers_declare() {
        let manager = Arc::new(
            AmqpConnectionManager::new(AmqpConfigs::default()).with_retry_policy(
                RetryPolicy::DeadLetter {
                    retries: 3,
                    retry_ttl_ms: 5_000,
                },
            ),
        );
        let dispatcher = RabbitMQDispatcher::<ClientMessage>::new(
            manager.clone(),
            Arc::new(MessageTypeRegistry::discover()),
            Arc::new(HandlerScope::new),
        );

        let consumer_side = dispatcher.queue_definition("CreateClient");
        let publisher_side = manager.queue_definition("CreateClient");

        assert_eq!(consumer_side, publisher_side);
        assert_eq!(
            main_queue_arguments(&consumer_side),
            main_queue_arguments(&publisher_side)
        );
        assert_eq!(consumer_side.dlq_name(), Some("CreateClient-dlq"));
    }

    #[tokio::test]
    async fn scope_invokes_the_registered_handler() {
        let mut handler = MockMessageHandler::<CreateClient>::new();
        handler
            .expect_handle()
            .withf(|message, _, _| message.first_name == "Luke")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let scope = HandlerScope::new().with_handler::<CreateClient, _>(handler);
        let message = CreateClient {
            id: Uuid::new_v4(),
            first_name: "Luke".to_owned(),
            ..CreateClient::default()
        };

        let result = scope
            .invoke(message, &MessageContext::new(), &CancellationToken::new())
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn missing_handler_names_the_message_type() {
        let scope = HandlerScope::new();

        let result = scope
            .invoke(
                ClientCreated::default(),
                &MessageContext::new(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result, Err(HandlerError::NoHandler("ClientCreated")));
    }

    #[test]
    fn closures_are_scope_factories() {
        let factory = || {
            HandlerScope::new().with_handler::<ClientCreated, _>(MockMessageHandler::<ClientCreated>::new())
        };

        let scope = factory.create_scope();

        assert!(scope.handler::<ClientCreated>().is_some());
        assert!(scope.handler::<CreateClient>().is_none());
        assert!(scope.context().current().is_none());
    }
}
