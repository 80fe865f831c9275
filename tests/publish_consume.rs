// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use async_trait::async_trait;
use client_bus::{
    channel::{confirm_key, returned_sequence, PendingConfirm, RawPublish, SequencedPublisher},
    confirms::OutstandingConfirms,
    consume_pipeline::ConsumePipeline,
    consumer::{disposition, settle, Acknowledge, Disposition, RetryPolicy},
    contracts::{ClientMessage, CreateClient},
    envelope, AmqpError, Broker, ContextAccessor, DefaultRoutingConvention, HandlerError,
    HandlerScope, MessageContext, MessageHandler, MessagePublisher, MessageTypeRegistry,
    MessagingError,
};
use futures_util::FutureExt;
use lapin::{publisher_confirm::Confirmation, BasicProperties};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

struct Published {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    sequence: u64,
}

/// Wire double: records every frame and holds its confirmation until the
/// test releases it.
#[derive(Clone, Default)]
struct InMemoryWire {
    published: Arc<Mutex<Vec<Published>>>,
    unconfirmed: Arc<Mutex<HashMap<u64, oneshot::Sender<Confirmation>>>>,
}

#[async_trait]
impl RawPublish for InMemoryWire {
    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PendingConfirm, AmqpError> {
        let sequence = returned_sequence(&properties);
        let (confirm, confirmed) = oneshot::channel();

        self.unconfirmed.lock().insert(sequence, confirm);
        self.published.lock().push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.to_vec(),
            sequence,
        });

        Ok(async move {
            confirmed
                .await
                .map_err(|_| AmqpError::ChannelError("in-memory".to_owned()))
        }
        .boxed())
    }
}

/// Broker double: one in-memory channel behind the library's sequencing.
struct InMemoryBroker {
    wire: InMemoryWire,
    confirms: Arc<OutstandingConfirms>,
    channel: SequencedPublisher<InMemoryWire>,
}

impl InMemoryBroker {
    fn new() -> Arc<InMemoryBroker> {
        let wire = InMemoryWire::default();
        let confirms = Arc::new(OutstandingConfirms::new());
        let channel = SequencedPublisher::new(
            confirm_key("client-manager", 1),
            wire.clone(),
            16,
            confirms.clone(),
        );

        Arc::new(InMemoryBroker {
            wire,
            confirms,
            channel,
        })
    }

    fn published(&self) -> parking_lot::MutexGuard<'_, Vec<Published>> {
        self.wire.published.lock()
    }

    fn confirm(&self, sequence: u64) {
        if let Some(confirm) = self.wire.unconfirmed.lock().remove(&sequence) {
            let _ = confirm.send(Confirmation::Ack(None));
        }
    }

    async fn until_settled(&self, sequence: u64) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while self.confirms.contains(self.channel.key(), sequence) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: BasicProperties,
        cancellation: &CancellationToken,
    ) -> Result<u64, AmqpError> {
        self.channel
            .publish(exchange, routing_key, &payload, properties, cancellation)
            .await
    }

    async fn declare_topology(
        &self,
        _queue: &str,
        _exchange: &str,
        _routing_key: &str,
    ) -> Result<(), AmqpError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Calls {
    received: Arc<Mutex<Vec<(CreateClient, MessageContext)>>>,
    failures_left: Arc<AtomicUsize>,
    scopes_created: Arc<AtomicUsize>,
}

struct CreateClientHandler {
    calls: Calls,
}

#[async_trait]
impl MessageHandler<CreateClient> for CreateClientHandler {
    async fn handle(
        &self,
        message: CreateClient,
        context: &MessageContext,
        _cancellation: &CancellationToken,
    ) -> Result<(), HandlerError> {
        self.calls.received.lock().push((message, *context));

        let failing = self
            .calls
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(HandlerError::failed("simulated failure"));
        }

        Ok(())
    }
}

fn consume_pipeline(calls: &Calls) -> ConsumePipeline<ClientMessage> {
    let calls = calls.clone();
    let scopes = move || {
        calls.scopes_created.fetch_add(1, Ordering::SeqCst);
        HandlerScope::new().with_handler::<CreateClient, _>(CreateClientHandler {
            calls: calls.clone(),
        })
    };

    ConsumePipeline::standard(Arc::new(MessageTypeRegistry::discover()), Arc::new(scopes))
}

#[derive(Default)]
struct RecordingAcker {
    settled: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl Acknowledge for RecordingAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.settled.lock().push("ack");
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.settled
            .lock()
            .push(if requeue { "nack-requeue" } else { "nack" });
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

fn publisher(broker: &Arc<InMemoryBroker>) -> MessagePublisher {
    MessagePublisher::new(broker.clone(), Arc::new(DefaultRoutingConvention::default()))
}

/// Delivers `body` once and settles it the way the consumer does.
async fn deliver(
    pipeline: &ConsumePipeline<ClientMessage>,
    body: &[u8],
    acker: &RecordingAcker,
) -> Result<(), MessagingError> {
    let outcome = pipeline.run(body, &CancellationToken::new()).await;
    settle(acker, disposition(&outcome, RetryPolicy::Requeue, 0))
        .await
        .unwrap();
    outcome
}

#[tokio::test]
async fn published_create_client_reaches_its_handler() {
    let broker = InMemoryBroker::new();
    let mut message = luke();
    let mut context = ContextAccessor::new();

    let receipt = publisher(&broker)
        .publish(&mut message, &mut context, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!message.id.is_nil());
    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "client-manager");
    assert_eq!(published[0].routing_key, "CreateClient");
    assert_eq!(published[0].sequence, receipt.sequence);

    let shell = envelope::decode(&published[0].payload).unwrap();
    assert_eq!(shell.message_type, "CreateClient");
    assert_eq!(shell.envelope_id, receipt.envelope_id);

    let calls = Calls::default();
    let acker = RecordingAcker::default();
    deliver(&consume_pipeline(&calls), &published[0].payload, &acker)
        .await
        .unwrap();

    let received = calls.received.lock();
    assert_eq!(received.len(), 1);
    let (delivered, delivered_context) = &received[0];
    assert_eq!(delivered, &message);
    assert!(!delivered_context.correlation_id.is_nil());
    assert_eq!(
        delivered_context.correlation_id,
        context.current().unwrap().correlation_id
    );
    assert_eq!(delivered_context.causation_id, Some(message.id));
    assert_eq!(*acker.settled.lock(), vec!["ack"]);
}

#[tokio::test]
async fn invalid_create_client_is_never_published() {
    let broker = InMemoryBroker::new();
    let mut message = CreateClient {
        first_name: String::new(),
        ..luke()
    };

    let result = publisher(&broker)
        .publish(&mut message, &mut ContextAccessor::new(), &CancellationToken::new())
        .await;

    let Err(err) = result else {
        panic!("expected the publish to fail");
    };
    assert!(err.is_validation());
    assert!(err.to_string().contains("first name"));
    assert!(broker.published().is_empty());
    assert!(broker.confirms.is_empty());
}

#[tokio::test]
async fn failing_handler_is_requeued_and_redelivery_runs_the_whole_pipeline() {
    let broker = InMemoryBroker::new();
    publisher(&broker)
        .publish(&mut luke(), &mut ContextAccessor::new(), &CancellationToken::new())
        .await
        .unwrap();
    let body = broker.published()[0].payload.clone();

    let calls = Calls::default();
    calls.failures_left.store(1, Ordering::SeqCst);
    let pipeline = consume_pipeline(&calls);
    let acker = RecordingAcker::default();

    let first = deliver(&pipeline, &body, &acker).await;
    let second = deliver(&pipeline, &body, &acker).await;

    assert!(matches!(
        first,
        Err(MessagingError::Handler(HandlerError::Failed(_)))
    ));
    assert!(second.is_ok());
    assert_eq!(*acker.settled.lock(), vec!["nack-requeue", "ack"]);
    assert_eq!(calls.received.lock().len(), 2);
    assert_eq!(calls.scopes_created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unknown_type_is_requeued_without_touching_handlers() {
    let calls = Calls::default();
    let acker = RecordingAcker::default();
    let body = br#"{
        "EnvelopeId": "6f1c1a8e-8e1e-4c57-9a3d-0f5f1f0d4b1a",
        "MessageType": "DestroyDeathStar",
        "CorrelationId": "0b7b6f1e-2b1a-4d36-8f6c-5a2f0b8e9c11",
        "CausationId": "00000000-0000-0000-0000-000000000000",
        "CreatedUtc": "2025-01-01T00:00:00Z",
        "Payload": {}
    }"#;

    let result = deliver(&consume_pipeline(&calls), body, &acker).await;

    assert!(matches!(result, Err(MessagingError::UnknownMessageType(_))));
    assert_eq!(*acker.settled.lock(), vec!["nack-requeue"]);
    assert!(calls.received.lock().is_empty());
    assert_eq!(calls.scopes_created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn published_sequences_stay_outstanding_until_acked() {
    let broker = InMemoryBroker::new();
    let publisher = publisher(&broker);
    let mut context = ContextAccessor::new();
    let cancellation = CancellationToken::new();
    let key = broker.channel.key().to_owned();

    let mut sequences = vec![];
    for _ in 0..3 {
        let receipt = publisher
            .publish(&mut luke(), &mut context, &cancellation)
            .await
            .unwrap();
        assert!(broker.confirms.contains(&key, receipt.sequence));
        sequences.push(receipt.sequence);
    }
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(
        broker.published().iter().map(|p| p.sequence).collect::<Vec<_>>(),
        sequences
    );

    broker.confirm(sequences[1]);
    broker.until_settled(sequences[1]).await;
    assert_eq!(broker.confirms.pending_for(&key), vec![1, 3]);

    broker.confirm(sequences[0]);
    broker.confirm(sequences[2]);
    tokio::time::timeout(Duration::from_secs(1), broker.confirms.wait_until_empty())
        .await
        .unwrap();
    assert_eq!(broker.confirms.acked_count(), 3);
}

#[tokio::test]
async fn cancelled_publish_leaves_nothing_outstanding() {
    let broker = InMemoryBroker::new();
    let cancellation = CancellationToken::new();
    cancellation.cancel();

    let result = broker
        .publish(
            "client-manager",
            "CreateClient",
            b"{}".to_vec(),
            BasicProperties::default(),
            &cancellation,
        )
        .await;

    assert_eq!(result, Err(AmqpError::Cancelled));
    assert!(broker.published().is_empty());
    assert!(broker.confirms.is_empty());
}

#[test]
fn dead_letter_policy_caps_retries() {
    let policy = RetryPolicy::DeadLetter {
        retries: 1,
        retry_ttl_ms: 500,
    };
    let failed: Result<(), MessagingError> = Err(MessagingError::Cancelled);

    assert_eq!(disposition(&failed, policy, 0), Disposition::Retry);
    assert_eq!(disposition(&failed, policy, 1), Disposition::DeadLetter);
}
