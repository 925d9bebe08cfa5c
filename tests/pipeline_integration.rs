//! End-to-end pipeline tests against the in-memory broker.
//!
//! Covers publishing, steady-state consumption, the retry chain, the
//! dead-letter topic and shutdown.

mod common;

use async_trait::async_trait;
use common::{broker_with_topic, wait_until, RecordingHandler, GROUP, TOPIC};
use kafka_events::broker::{
    Broker, BrokerResult, CreateOutcome, InboundRecord, MemoryBroker, OutboundRecord, RecordAck,
    RecordSink, RecordSource, TopicAdmin, TopicDescription, TopicSpec,
};
use kafka_events::consumer::retryable::{
    HEADER_ERROR, HEADER_ORIGINAL_OFFSET, HEADER_ORIGINAL_TOPIC, HEADER_RETRY_ATTEMPT,
    HEADER_RETRY_DUE_AT,
};
use kafka_events::consumer::{BackoffPolicy, RetryPolicy, RetryableConsumer};
use kafka_events::envelope::{EventEnvelope, UserRegistered};
use kafka_events::error::{BrokerError, ConsumeError, ProvisionError};
use kafka_events::producer::EventProducer;
use kafka_events::provisioner::TopicProvisioner;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(5);

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, BackoffPolicy::Fixed { delay_ms: 20 })
}

fn consumer(broker: &Arc<dyn Broker>, policy: RetryPolicy) -> RetryableConsumer {
    RetryableConsumer::new(Arc::clone(broker), policy)
        .with_handler_timeout(Duration::from_secs(2))
        .with_redelivery_backoff(Duration::from_millis(30))
}

fn producer(broker: &Arc<dyn Broker>) -> EventProducer {
    EventProducer::new(Arc::clone(broker).into_sink(), TOPIC)
}

#[tokio::test]
async fn test_published_event_reaches_handler() {
    let (_memory, broker) = broker_with_topic(1).await;
    let handler = RecordingHandler::succeeding();
    let subscription = consumer(&broker, fast_policy(3))
        .subscribe::<UserRegistered>(TOPIC, GROUP, handler.clone())
        .await
        .unwrap();

    let ack = producer(&broker)
        .publish(UserRegistered::new("alice", "a@x.com"))
        .await
        .unwrap();

    assert!(wait_until(WAIT, || handler.call_count() == 1).await);
    let events = handler.events();
    assert_eq!(events[0].id(), ack.event_id);
    assert_eq!(events[0].payload(), &UserRegistered::new("alice", "a@x.com"));

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_every_publish_gets_a_distinct_id() {
    let (memory, broker) = broker_with_topic(3).await;
    let producer = producer(&broker);

    let mut ids = HashSet::new();
    for i in 0..50 {
        let ack = assert_ok!(
            producer
                .publish(UserRegistered::new(format!("user{}", i), "u@x.com"))
                .await
        );
        ids.insert(ack.event_id);
    }

    assert_eq!(ids.len(), 50);
    assert_eq!(memory.records(TOPIC).len(), 50);
}

#[tokio::test]
async fn test_success_is_terminal() {
    let (memory, broker) = broker_with_topic(1).await;
    let handler = RecordingHandler::succeeding();
    let subscription = consumer(&broker, fast_policy(3))
        .subscribe::<UserRegistered>(TOPIC, GROUP, handler.clone())
        .await
        .unwrap();

    producer(&broker)
        .publish(UserRegistered::new("alice", "a@x.com"))
        .await
        .unwrap();

    assert!(wait_until(WAIT, || memory.committed_offset(GROUP, TOPIC, 0) == Some(1)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(handler.call_count(), 1);
    assert!(memory.records("user.emailevents-retry-1").is_empty());
    assert!(memory.records("user.emailevents-dlt").is_empty());

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let (memory, broker) = broker_with_topic(1).await;
    let handler = RecordingHandler::failing_times(1);
    let subscription = consumer(&broker, fast_policy(3))
        .subscribe::<UserRegistered>(TOPIC, GROUP, handler.clone())
        .await
        .unwrap();

    producer(&broker)
        .publish(UserRegistered::new("bob", "b@x.com"))
        .await
        .unwrap();

    assert!(wait_until(WAIT, || {
        memory.committed_offset(GROUP, "user.emailevents-retry-1", 0) == Some(1)
    })
    .await);

    assert_eq!(handler.call_count(), 2);
    let retries = memory.records("user.emailevents-retry-1");
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].header(HEADER_RETRY_ATTEMPT), Some("1"));
    assert_eq!(retries[0].header(HEADER_ORIGINAL_TOPIC), Some(TOPIC));
    assert!(retries[0].header(HEADER_RETRY_DUE_AT).is_some());
    assert!(memory.records("user.emailevents-dlt").is_empty());

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_once_with_unchanged_payload() {
    let (memory, broker) = broker_with_topic(1).await;
    let handler = RecordingHandler::always_failing();
    let subscription = consumer(&broker, fast_policy(3))
        .subscribe::<UserRegistered>(TOPIC, GROUP, handler.clone())
        .await
        .unwrap();

    producer(&broker)
        .publish(UserRegistered::new("carol", "c@x.com"))
        .await
        .unwrap();

    assert!(wait_until(WAIT, || memory.records("user.emailevents-dlt").len() == 1).await);
    assert!(wait_until(WAIT, || {
        memory.committed_offset(GROUP, "user.emailevents-retry-2", 0) == Some(1)
    })
    .await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(handler.call_count(), 3);
    let events = handler.events();
    assert!(events.iter().all(|e| e == &events[0]));
    assert_eq!(memory.records("user.emailevents-retry-1").len(), 1);
    assert_eq!(memory.records("user.emailevents-retry-2").len(), 1);

    let original = &memory.records(TOPIC)[0];
    let dead = &memory.records("user.emailevents-dlt")[0];
    assert_eq!(dead.payload, original.payload);
    assert_eq!(dead.key, original.key);
    assert_eq!(dead.header(HEADER_RETRY_ATTEMPT), Some("3"));
    assert_eq!(dead.header(HEADER_ORIGINAL_TOPIC), Some(TOPIC));
    assert_eq!(dead.header(HEADER_ORIGINAL_OFFSET), Some("0"));
    assert!(dead.header(HEADER_ERROR).unwrap().contains("simulated failure"));
    assert_eq!(memory.records("user.emailevents-dlt").len(), 1);

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_success_on_last_retry_passes_each_retry_topic_once() {
    let (memory, broker) = broker_with_topic(1).await;
    let handler = RecordingHandler::failing_times(2);
    let subscription = consumer(&broker, fast_policy(3))
        .subscribe::<UserRegistered>(TOPIC, GROUP, handler.clone())
        .await
        .unwrap();

    producer(&broker)
        .publish(UserRegistered::new("bob", "b@x.com"))
        .await
        .unwrap();

    assert!(wait_until(WAIT, || {
        memory.committed_offset(GROUP, "user.emailevents-retry-2", 0) == Some(1)
    })
    .await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(handler.call_count(), 3);
    assert_eq!(memory.records("user.emailevents-retry-1").len(), 1);
    assert_eq!(memory.records("user.emailevents-retry-2").len(), 1);
    assert!(memory.records("user.emailevents-dlt").is_empty());
    let second_hop = &memory.records("user.emailevents-retry-2")[0];
    assert_eq!(second_hop.header(HEADER_RETRY_ATTEMPT), Some("2"));

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_due_header_on_base_topic_does_not_stall_partition() {
    let (_memory, broker) = broker_with_topic(1).await;
    let handler = RecordingHandler::succeeding();
    let subscription = consumer(&broker, fast_policy(3))
        .subscribe::<UserRegistered>(TOPIC, GROUP, handler.clone())
        .await
        .unwrap();

    let envelope = EventEnvelope::new(UserRegistered::new("early", "e@x.com"));
    let an_hour_from_now = chrono::Utc::now().timestamp_millis() + 3_600_000;
    broker
        .send(
            OutboundRecord::new(TOPIC, Some(envelope.id().to_string()), envelope.to_bytes().unwrap())
                .with_header(HEADER_RETRY_DUE_AT, an_hour_from_now.to_string()),
        )
        .await
        .unwrap();
    producer(&broker)
        .publish(UserRegistered::new("next", "n@x.com"))
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || handler.call_count() == 2).await);

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_far_future_due_time_on_retry_topic_is_bounded_by_backoff() {
    let (memory, broker) = broker_with_topic(1).await;
    let handler = RecordingHandler::succeeding();
    let policy = RetryPolicy::new(2, BackoffPolicy::Fixed { delay_ms: 100 });
    let subscription = consumer(&broker, policy)
        .subscribe::<UserRegistered>(TOPIC, GROUP, handler.clone())
        .await
        .unwrap();

    let envelope = EventEnvelope::new(UserRegistered::new("skewed", "s@x.com"));
    let an_hour_from_now = chrono::Utc::now().timestamp_millis() + 3_600_000;
    broker
        .send(
            OutboundRecord::new(
                "user.emailevents-retry-1",
                Some(envelope.id().to_string()),
                envelope.to_bytes().unwrap(),
            )
            .with_header(HEADER_RETRY_DUE_AT, an_hour_from_now.to_string()),
        )
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || handler.call_count() == 1).await);
    assert!(wait_until(WAIT, || {
        memory.committed_offset(GROUP, "user.emailevents-retry-1", 0) == Some(1)
    })
    .await);

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_retry_waits_for_backoff() {
    let (_memory, broker) = broker_with_topic(1).await;
    let handler = RecordingHandler::failing_times(1);
    let policy = RetryPolicy::new(2, BackoffPolicy::Fixed { delay_ms: 200 });
    let subscription = consumer(&broker, policy)
        .subscribe::<UserRegistered>(TOPIC, GROUP, handler.clone())
        .await
        .unwrap();

    producer(&broker)
        .publish(UserRegistered::new("dave", "d@x.com"))
        .await
        .unwrap();

    assert!(wait_until(WAIT, || handler.call_count() == 2).await);
    let times = handler.call_times();
    assert!(times[1].duration_since(times[0]) >= Duration::from_millis(180));

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_delayed_retry_does_not_block_new_events() {
    let (_memory, broker) = broker_with_topic(1).await;
    let handler = RecordingHandler::failing_times(1);
    let policy = RetryPolicy::new(2, BackoffPolicy::Fixed { delay_ms: 60_000 });
    let subscription = consumer(&broker, policy)
        .subscribe::<UserRegistered>(TOPIC, GROUP, handler.clone())
        .await
        .unwrap();

    let producer = producer(&broker);
    producer
        .publish(UserRegistered::new("first", "f@x.com"))
        .await
        .unwrap();
    assert!(wait_until(WAIT, || handler.call_count() == 1).await);

    producer
        .publish(UserRegistered::new("second", "s@x.com"))
        .await
        .unwrap();
    assert!(wait_until(WAIT, || handler.call_count() == 2).await);
    assert_eq!(handler.events()[1].payload().username, "second");

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_undecodable_record_goes_straight_to_dlt() {
    let (memory, broker) = broker_with_topic(1).await;
    let handler = RecordingHandler::succeeding();
    let subscription = consumer(&broker, fast_policy(3))
        .subscribe::<UserRegistered>(TOPIC, GROUP, handler.clone())
        .await
        .unwrap();

    broker
        .send(OutboundRecord::new(TOPIC, None, b"{\"not\":\"an event\"}".to_vec()))
        .await
        .unwrap();

    assert!(wait_until(WAIT, || memory.records("user.emailevents-dlt").len() == 1).await);
    assert!(wait_until(WAIT, || memory.committed_offset(GROUP, TOPIC, 0) == Some(1)).await);

    assert_eq!(handler.call_count(), 0);
    assert!(memory.records("user.emailevents-retry-1").is_empty());
    let dead = &memory.records("user.emailevents-dlt")[0];
    assert_eq!(dead.header(HEADER_RETRY_ATTEMPT), Some("1"));

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_handler_timeout_counts_as_failure() {
    let (memory, broker) = broker_with_topic(1).await;
    let handler = RecordingHandler::slow(Duration::from_millis(500));
    let subscription = RetryableConsumer::new(Arc::clone(&broker), fast_policy(2))
        .with_handler_timeout(Duration::from_millis(50))
        .subscribe::<UserRegistered>(TOPIC, GROUP, handler.clone())
        .await
        .unwrap();

    producer(&broker)
        .publish(UserRegistered::new("slow", "s@x.com"))
        .await
        .unwrap();

    assert!(wait_until(WAIT, || memory.records("user.emailevents-dlt").len() == 1).await);
    assert_eq!(handler.call_count(), 2);
    let dead = &memory.records("user.emailevents-dlt")[0];
    assert!(dead.header(HEADER_ERROR).unwrap().contains("timed out"));

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_retry_chain_provisioned_with_base_shape() {
    let (memory, broker) = broker_with_topic(3).await;
    let subscription = consumer(&broker, fast_policy(3))
        .subscribe::<UserRegistered>(TOPIC, GROUP, RecordingHandler::succeeding())
        .await
        .unwrap();

    assert_eq!(
        subscription.topics(),
        &[
            TOPIC.to_string(),
            "user.emailevents-retry-1".to_string(),
            "user.emailevents-retry-2".to_string(),
        ]
    );
    for topic in [
        "user.emailevents-retry-1",
        "user.emailevents-retry-2",
        "user.emailevents-dlt",
    ] {
        let description = memory.describe_topic(topic).await.unwrap().unwrap();
        assert_eq!(description.partitions, 3, "{}", topic);
        assert_eq!(description.replication_factor, 1, "{}", topic);
    }

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_to_missing_topic_fails() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let result = consumer(&broker, fast_policy(3))
        .subscribe::<UserRegistered>(TOPIC, GROUP, RecordingHandler::succeeding())
        .await;

    assert!(matches!(
        result,
        Err(ConsumeError::Provision(ProvisionError::InvalidSpec(_)))
    ));
}

#[tokio::test]
async fn test_subscribe_reports_retry_topic_conflict() {
    let (memory, broker) = broker_with_topic(2).await;
    memory
        .create_topic(&TopicSpec::new("user.emailevents-retry-1", 1, 1))
        .await
        .unwrap();

    let result = consumer(&broker, fast_policy(3))
        .subscribe::<UserRegistered>(TOPIC, GROUP, RecordingHandler::succeeding())
        .await;
    assert!(matches!(
        result,
        Err(ConsumeError::Provision(ProvisionError::ConfigConflict { .. }))
    ));
}

#[tokio::test]
async fn test_shutdown_releases_partitions_and_keeps_offsets() {
    let (memory, broker) = broker_with_topic(1).await;
    let first = RecordingHandler::succeeding();
    let subscription = consumer(&broker, fast_policy(3))
        .subscribe::<UserRegistered>(TOPIC, GROUP, first.clone())
        .await
        .unwrap();

    let producer = producer(&broker);
    producer
        .publish(UserRegistered::new("a", "a@x.com"))
        .await
        .unwrap();
    assert!(wait_until(WAIT, || first.call_count() == 1).await);

    subscription.cancel();
    assert!(subscription.is_cancelled());
    subscription.shutdown().await;

    producer
        .publish(UserRegistered::new("b", "b@x.com"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(first.call_count(), 1);
    assert_eq!(memory.committed_offset(GROUP, TOPIC, 0), Some(1));

    let second = RecordingHandler::succeeding();
    let resumed = consumer(&broker, fast_policy(3))
        .subscribe::<UserRegistered>(TOPIC, GROUP, second.clone())
        .await
        .unwrap();
    assert!(wait_until(WAIT, || second.call_count() == 1).await);
    assert_eq!(second.events()[0].payload().username, "b");

    resumed.shutdown().await;
}

/// Broker whose first writes to retry topics fail.
struct FlakyRetryBroker {
    inner: MemoryBroker,
    failures_left: AtomicUsize,
}

#[async_trait]
impl TopicAdmin for FlakyRetryBroker {
    async fn describe_topic(&self, name: &str) -> BrokerResult<Option<TopicDescription>> {
        self.inner.describe_topic(name).await
    }

    async fn create_topic(&self, spec: &TopicSpec) -> BrokerResult<CreateOutcome> {
        self.inner.create_topic(spec).await
    }
}

#[async_trait]
impl RecordSink for FlakyRetryBroker {
    async fn send(&self, record: OutboundRecord) -> BrokerResult<RecordAck> {
        if record.topic.contains("-retry-")
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(BrokerError::Unavailable("leader not available".to_string()));
        }
        self.inner.send(record).await
    }
}

#[async_trait]
impl Broker for FlakyRetryBroker {
    async fn subscribe(
        &self,
        topics: &[String],
        group_id: &str,
    ) -> BrokerResult<Box<dyn RecordSource>> {
        self.inner.subscribe(topics, group_id).await
    }

    fn into_admin(self: Arc<Self>) -> Arc<dyn TopicAdmin> {
        self
    }

    fn into_sink(self: Arc<Self>) -> Arc<dyn RecordSink> {
        self
    }
}

#[tokio::test]
async fn test_failed_forward_is_redelivered_not_lost() {
    let (memory, _) = broker_with_topic(1).await;
    let broker: Arc<dyn Broker> = Arc::new(FlakyRetryBroker {
        inner: memory.clone(),
        failures_left: AtomicUsize::new(1),
    });
    let handler = RecordingHandler::always_failing();
    let subscription = consumer(&broker, fast_policy(2))
        .subscribe::<UserRegistered>(TOPIC, GROUP, handler.clone())
        .await
        .unwrap();

    producer(&broker)
        .publish(UserRegistered::new("eve", "e@x.com"))
        .await
        .unwrap();

    assert!(wait_until(WAIT, || memory.records("user.emailevents-dlt").len() == 1).await);
    assert_eq!(memory.records("user.emailevents-retry-1").len(), 1);
    assert_eq!(memory.committed_offset(GROUP, TOPIC, 0), Some(1));
    // First attempt ran twice: once before the failed forward, once after redelivery.
    assert_eq!(handler.call_count(), 3);

    subscription.shutdown().await;
}

/// Broker whose sources fail to rewind the first `failures` times.
struct StuckSeekBroker {
    inner: MemoryBroker,
    failures_left: Arc<AtomicUsize>,
}

struct StuckSeekSource {
    inner: Box<dyn RecordSource>,
    failures_left: Arc<AtomicUsize>,
}

#[async_trait]
impl RecordSource for StuckSeekSource {
    async fn recv(&mut self) -> BrokerResult<InboundRecord> {
        self.inner.recv().await
    }

    fn ack(&mut self, record: &InboundRecord) -> BrokerResult<()> {
        self.inner.ack(record)
    }

    fn rewind_and_pause(&mut self, record: &InboundRecord) -> BrokerResult<()> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BrokerError::Unavailable("Erroneous state".to_string()));
        }
        self.inner.rewind_and_pause(record)
    }

    fn resume(&mut self, topic: &str, partition: i32) -> BrokerResult<()> {
        self.inner.resume(topic, partition)
    }

    async fn close(self: Box<Self>) {
        self.inner.close().await
    }
}

#[async_trait]
impl TopicAdmin for StuckSeekBroker {
    async fn describe_topic(&self, name: &str) -> BrokerResult<Option<TopicDescription>> {
        self.inner.describe_topic(name).await
    }

    async fn create_topic(&self, spec: &TopicSpec) -> BrokerResult<CreateOutcome> {
        self.inner.create_topic(spec).await
    }
}

#[async_trait]
impl RecordSink for StuckSeekBroker {
    async fn send(&self, record: OutboundRecord) -> BrokerResult<RecordAck> {
        self.inner.send(record).await
    }
}

#[async_trait]
impl Broker for StuckSeekBroker {
    async fn subscribe(
        &self,
        topics: &[String],
        group_id: &str,
    ) -> BrokerResult<Box<dyn RecordSource>> {
        let inner = self.inner.subscribe(topics, group_id).await?;
        Ok(Box::new(StuckSeekSource {
            inner,
            failures_left: Arc::clone(&self.failures_left),
        }))
    }

    fn into_admin(self: Arc<Self>) -> Arc<dyn TopicAdmin> {
        self
    }

    fn into_sink(self: Arc<Self>) -> Arc<dyn RecordSink> {
        self
    }
}

#[tokio::test]
async fn test_failed_rewind_redelivers_instead_of_skipping() {
    let (memory, _) = broker_with_topic(1).await;
    let broker: Arc<dyn Broker> = Arc::new(StuckSeekBroker {
        inner: memory.clone(),
        failures_left: Arc::new(AtomicUsize::new(1)),
    });
    let handler = RecordingHandler::failing_times(1);
    let policy = RetryPolicy::new(2, BackoffPolicy::Fixed { delay_ms: 200 });
    let subscription = consumer(&broker, policy)
        .subscribe::<UserRegistered>(TOPIC, GROUP, handler.clone())
        .await
        .unwrap();

    let producer = producer(&broker);
    producer
        .publish(UserRegistered::new("first", "f@x.com"))
        .await
        .unwrap();
    assert!(wait_until(WAIT, || memory.records("user.emailevents-retry-1").len() == 1).await);
    producer
        .publish(UserRegistered::new("second", "s@x.com"))
        .await
        .unwrap();

    // The retry of "first" is not yet due and its rewind fails once; it must
    // still be handled and committed.
    assert!(wait_until(WAIT, || {
        memory.committed_offset(GROUP, "user.emailevents-retry-1", 0) == Some(1)
    })
    .await);
    let names: Vec<_> = handler
        .events()
        .iter()
        .map(|e| e.payload().username.clone())
        .collect();
    assert_eq!(names.iter().filter(|n| *n == "first").count(), 2);
    assert!(names.contains(&"second".to_string()));
    assert!(memory.records("user.emailevents-dlt").is_empty());

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_provisioning_is_idempotent_and_detects_conflicts() {
    let memory = MemoryBroker::new();
    let provisioner = TopicProvisioner::new(Arc::new(memory.clone()));

    provisioner
        .ensure_topic(&TopicSpec::new(TOPIC, 1, 1))
        .await
        .unwrap();
    provisioner
        .ensure_topic(&TopicSpec::new(TOPIC, 1, 1))
        .await
        .unwrap();
    assert_eq!(memory.topic_names(), vec![TOPIC.to_string()]);

    let err = provisioner
        .ensure_topic(&TopicSpec::new(TOPIC, 3, 1))
        .await
        .unwrap_err();
    match err {
        ProvisionError::ConfigConflict {
            existing_partitions,
            requested_partitions,
            ..
        } => {
            assert_eq!(existing_partitions, 1);
            assert_eq!(requested_partitions, 3);
        }
        other => panic!("expected conflict, got {:?}", other),
    }
}
