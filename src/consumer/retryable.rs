//! Retryable consumer
//!
//! Runs one loop per topic of a retry chain. Each loop owns its own broker
//! consumer (same group, one topic) and drives every record through
//!
//! ```text
//! Delivered -> HandlerRunning -> HandlerSucceeded
//!                             -> HandlerFailed -> RetryScheduled(n) | DeadLettered
//! ```
//!
//! Offsets are stored only once a record's outcome is durable: the handler
//! succeeded, or the record was written to its next topic. A record read from
//! a retry topic before its due time is rewound and its partition paused; the
//! loop keeps serving other partitions and resumes the paused one when due.
//! If a partition cannot be rewound, the loop rejoins the group so the record
//! is redelivered from the stored position instead of being skipped.

use chrono::Utc;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handler::EventHandler;
use super::retry::{BackoffPolicy, Destination, RetryPolicy, RetryTopology};
use crate::broker::{Broker, InboundRecord, OutboundRecord, RecordSink, RecordSource, TopicSpec};
use crate::envelope::EventEnvelope;
use crate::error::{ConsumeError, ProvisionError};
use crate::provisioner::TopicProvisioner;
use crate::telemetry;

/// Number of attempts already made when the record was forwarded
pub const HEADER_RETRY_ATTEMPT: &str = "x-retry-attempt";
/// Epoch milliseconds before which the record must not be handled
pub const HEADER_RETRY_DUE_AT: &str = "x-retry-due-at";
/// Topic the record was first published to
pub const HEADER_ORIGINAL_TOPIC: &str = "x-original-topic";
/// Partition of the first delivery
pub const HEADER_ORIGINAL_PARTITION: &str = "x-original-partition";
/// Offset of the first delivery
pub const HEADER_ORIGINAL_OFFSET: &str = "x-original-offset";
/// Last failure reason
pub const HEADER_ERROR: &str = "x-error";

/// Default bound on a single handler invocation
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);
/// Default pause before re-reading a record whose forward failed
pub const DEFAULT_REDELIVERY_BACKOFF: Duration = Duration::from_millis(1000);

/// Subscribes handlers to topics with bounded retry and dead-lettering.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use kafka_events::broker::{Broker, MemoryBroker};
/// use kafka_events::consumer::{ConfirmationEmailHandler, RetryPolicy, RetryableConsumer};
/// use kafka_events::envelope::UserRegistered;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
/// let consumer = RetryableConsumer::new(broker, RetryPolicy::default());
/// let subscription = consumer
///     .subscribe::<UserRegistered>("user.emailevents", "user-event-group", Arc::new(ConfirmationEmailHandler::new()))
///     .await?;
/// subscription.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct RetryableConsumer {
    broker: Arc<dyn Broker>,
    policy: RetryPolicy,
    handler_timeout: Duration,
    redelivery_backoff: Duration,
}

impl RetryableConsumer {
    /// Creates a consumer with default timeouts.
    pub fn new(broker: Arc<dyn Broker>, policy: RetryPolicy) -> Self {
        Self {
            broker,
            policy,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            redelivery_backoff: DEFAULT_REDELIVERY_BACKOFF,
        }
    }

    /// Sets the bound on a single handler invocation; exceeding it fails the attempt.
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Sets the pause applied when forwarding a failed record fails.
    pub fn with_redelivery_backoff(mut self, backoff: Duration) -> Self {
        self.redelivery_backoff = backoff;
        self
    }

    /// Retry policy applied to subscriptions
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Starts consuming `topic` and its retry chain under `group_id`.
    ///
    /// Retry and dead-letter topics are provisioned with the base topic's
    /// partition count and replication factor before any loop starts.
    ///
    /// # Arguments
    ///
    /// * `topic` - Base topic, which must already exist
    /// * `group_id` - Consumer group shared by every loop of the chain
    /// * `handler` - Side effect invoked once per attempt
    ///
    /// # Errors
    ///
    /// - `ConsumeError::Provision` if the base topic is missing or the chain
    ///   topics cannot be provisioned
    /// - `ConsumeError::BrokerUnavailable` if a loop cannot join the group
    pub async fn subscribe<T>(
        &self,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn EventHandler<T>>,
    ) -> Result<Subscription, ConsumeError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let topology = RetryTopology::new(topic, self.policy.max_attempts);
        self.provision_chain(&topology).await?;

        let cancel = CancellationToken::new();
        let topics = topology.topics();
        let mut sources = Vec::with_capacity(topics.len());
        for chain_topic in &topics {
            let source = self
                .broker
                .subscribe(std::slice::from_ref(chain_topic), group_id)
                .await?;
            sources.push((chain_topic.clone(), source));
        }

        let sink = Arc::clone(&self.broker).into_sink();
        let mut tasks = Vec::with_capacity(sources.len());
        for (chain_topic, source) in sources {
            let attempt = topology.attempt_for(&chain_topic).unwrap_or(1);
            let topic_loop = TopicLoop {
                topic: chain_topic,
                group_id: group_id.to_string(),
                attempt,
                topology: topology.clone(),
                backoff: self.policy.backoff.clone(),
                handler_timeout: self.handler_timeout,
                redelivery_backoff: self.redelivery_backoff,
                source,
                sink: Arc::clone(&sink),
                handler: Arc::clone(&handler),
                broker: Arc::clone(&self.broker),
                paused: HashMap::new(),
                needs_rejoin: false,
                cancel: cancel.child_token(),
            };
            tasks.push(tokio::spawn(topic_loop.run()));
        }

        info!(
            topic = %topic,
            group_id = %group_id,
            max_attempts = self.policy.max_attempts,
            loops = tasks.len(),
            "Subscribed with retry chain"
        );

        Ok(Subscription {
            cancel,
            tasks,
            topics,
            group_id: group_id.to_string(),
        })
    }

    async fn provision_chain(&self, topology: &RetryTopology) -> Result<(), ConsumeError> {
        let base = self
            .broker
            .describe_topic(topology.base())
            .await?
            .ok_or_else(|| {
                ProvisionError::InvalidSpec(format!(
                    "topic {} must exist before subscribing",
                    topology.base()
                ))
            })?;

        let shape = TopicSpec::new(topology.base(), base.partitions, base.replication_factor);
        let mut specs: Vec<TopicSpec> = topology
            .topics()
            .into_iter()
            .skip(1)
            .map(|name| shape.renamed(name))
            .collect();
        specs.push(shape.renamed(topology.dead_letter_topic()));

        let provisioner = TopicProvisioner::new(Arc::clone(&self.broker).into_admin());
        provisioner.ensure_all(&specs).await?;
        Ok(())
    }
}

/// Handle to the loops of one subscription.
///
/// Dropping the handle cancels the loops without waiting for them; call
/// [`Subscription::shutdown`] to wait until in-flight handlers finish and
/// partitions are released.
pub struct Subscription {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    topics: Vec<String>,
    group_id: String,
}

impl Subscription {
    /// Signals every loop to stop after its current record.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Topics consumed by this subscription
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Cancels the loops and waits for them to close their consumers.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut self.tasks);
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!(group_id = %self.group_id, error = %e, "Consumer loop panicked");
            }
        }
        info!(group_id = %self.group_id, "Subscription shut down");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Consumer loop for one topic of the chain.
struct TopicLoop<T> {
    topic: String,
    group_id: String,
    attempt: u32,
    topology: RetryTopology,
    backoff: BackoffPolicy,
    handler_timeout: Duration,
    redelivery_backoff: Duration,
    source: Box<dyn RecordSource>,
    sink: Arc<dyn RecordSink>,
    handler: Arc<dyn EventHandler<T>>,
    broker: Arc<dyn Broker>,
    paused: HashMap<(String, i32), Instant>,
    /// Set when a record could not be rewound; nothing is read or acked
    /// until the source is replaced.
    needs_rejoin: bool,
    cancel: CancellationToken,
}

enum Failure {
    Handler(String),
    Undecodable(String),
}

impl Failure {
    fn reason(&self) -> &str {
        match self {
            Self::Handler(reason) | Self::Undecodable(reason) => reason,
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<T> TopicLoop<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    async fn run(mut self) {
        debug!(topic = %self.topic, group_id = %self.group_id, attempt = self.attempt, "Consumer loop started");

        loop {
            if self.needs_rejoin && !self.rejoin().await {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.redelivery_backoff) => {}
                }
                continue;
            }

            let next_due = self.paused.values().min().copied();
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = wait_until(next_due) => {
                    self.resume_due();
                    continue;
                }
                received = self.source.recv() => received,
            };

            match received {
                Ok(record) => self.process(record).await,
                Err(e) => {
                    warn!(topic = %self.topic, group_id = %self.group_id, error = %e, "Receive failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.redelivery_backoff) => {}
                    }
                }
            }
        }

        debug!(topic = %self.topic, group_id = %self.group_id, "Consumer loop stopping");
        self.source.close().await;
    }

    async fn process(&mut self, record: InboundRecord) {
        if let Some(wait) = self.not_due_for(&record) {
            debug!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                wait_ms = wait.as_millis() as u64,
                "Record not yet due, pausing partition"
            );
            self.pause_for(&record, wait);
            return;
        }

        let envelope = match EventEnvelope::<T>::from_bytes(&record.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Undecodable record, dead-lettering"
                );
                self.route_failure(&record, Failure::Undecodable(e.to_string()))
                    .await;
                return;
            }
        };

        let outcome =
            match tokio::time::timeout(self.handler_timeout, self.handler.handle(&envelope)).await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!(
                    "handler timed out after {} ms",
                    self.handler_timeout.as_millis()
                )),
            };

        match outcome {
            Ok(()) => {
                debug!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    event_id = %envelope.id(),
                    attempt = self.attempt,
                    "Event handled"
                );
                telemetry::record_handled(self.topology.base());
                self.ack(&record);
            }
            Err(reason) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    event_id = %envelope.id(),
                    attempt = self.attempt,
                    max_attempts = self.topology.max_attempts(),
                    error = %reason,
                    "Handler failed"
                );
                self.route_failure(&record, Failure::Handler(reason)).await;
            }
        }
    }

    /// Forwards a failed record to its next topic and acknowledges it once
    /// the forward is durable.
    async fn route_failure(&mut self, record: &InboundRecord, failure: Failure) {
        let destination = match failure {
            Failure::Handler(_) => self.topology.next_destination(self.attempt),
            Failure::Undecodable(_) => {
                Destination::DeadLetter(self.topology.dead_letter_topic())
            }
        };

        let outbound = match &destination {
            Destination::Retry { topic, .. } => {
                let due_at = Utc::now().timestamp_millis()
                    + self.backoff.delay_for(self.attempt).as_millis() as i64;
                forward(record, topic, self.attempt, failure.reason())
                    .with_header(HEADER_RETRY_DUE_AT, due_at.to_string())
            }
            Destination::DeadLetter(topic) => {
                forward(record, topic, self.attempt, failure.reason())
            }
        };

        match self.sink.send(outbound).await {
            Ok(ack) => {
                match &destination {
                    Destination::Retry {
                        topic,
                        next_attempt,
                    } => {
                        info!(
                            topic = %record.topic,
                            partition = record.partition,
                            offset = record.offset,
                            retry_topic = %topic,
                            next_attempt,
                            "Retry scheduled"
                        );
                        telemetry::record_retried(self.topology.base(), *next_attempt);
                    }
                    Destination::DeadLetter(topic) => {
                        let reason = match failure {
                            Failure::Handler(_) => "exhausted",
                            Failure::Undecodable(_) => "deserialization",
                        };
                        error!(
                            topic = %record.topic,
                            partition = record.partition,
                            offset = record.offset,
                            dlt = %topic,
                            dlt_offset = ack.offset,
                            attempt = self.attempt,
                            reason,
                            "Record dead-lettered"
                        );
                        telemetry::record_dead_lettered(self.topology.base(), reason);
                    }
                }
                self.ack(record);
            }
            Err(e) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Forwarding failed record failed, will redeliver"
                );
                self.pause_for(record, self.redelivery_backoff);
            }
        }
    }

    fn ack(&mut self, record: &InboundRecord) {
        if let Err(e) = self.source.ack(record) {
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Failed to store offset"
            );
        }
    }

    /// Time left before a retry record may be handled.
    ///
    /// Only retry topics have due times, and a due time never defers a record
    /// longer than the backoff that scheduled it.
    fn not_due_for(&self, record: &InboundRecord) -> Option<Duration> {
        if self.attempt <= 1 {
            return None;
        }
        remaining_delay(record, self.backoff.delay_for(self.attempt - 1))
    }

    fn pause_for(&mut self, record: &InboundRecord, wait: Duration) {
        if let Err(e) = self.source.rewind_and_pause(record) {
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Failed to pause partition, rejoining group"
            );
            self.needs_rejoin = true;
            return;
        }
        self.paused.insert(
            (record.topic.clone(), record.partition),
            Instant::now() + wait,
        );
    }

    /// Replaces the source with a fresh group member, which restarts every
    /// partition from its stored position.
    async fn rejoin(&mut self) -> bool {
        match self
            .broker
            .subscribe(std::slice::from_ref(&self.topic), &self.group_id)
            .await
        {
            Ok(source) => {
                let stale = std::mem::replace(&mut self.source, source);
                stale.close().await;
                self.paused.clear();
                self.needs_rejoin = false;
                info!(topic = %self.topic, group_id = %self.group_id, "Rejoined group");
                true
            }
            Err(e) => {
                warn!(topic = %self.topic, group_id = %self.group_id, error = %e, "Rejoin failed");
                false
            }
        }
    }

    fn resume_due(&mut self) {
        let now = Instant::now();
        let due: Vec<(String, i32)> = self
            .paused
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(tp, _)| tp.clone())
            .collect();

        for (topic, partition) in due {
            self.paused.remove(&(topic.clone(), partition));
            if let Err(e) = self.source.resume(&topic, partition) {
                warn!(topic = %topic, partition, error = %e, "Failed to resume partition");
            }
        }
    }
}

/// Time left until the record's due time, at most `cap`.
fn remaining_delay(record: &InboundRecord, cap: Duration) -> Option<Duration> {
    let due_at: i64 = record.header(HEADER_RETRY_DUE_AT)?.parse().ok()?;
    let now = Utc::now().timestamp_millis();
    (due_at > now).then(|| Duration::from_millis((due_at - now) as u64).min(cap))
}

/// Copies the record's bytes and key to `topic` with diagnostic headers.
///
/// Origin headers are carried over from earlier hops so they always describe
/// the first delivery.
fn forward(record: &InboundRecord, topic: &str, attempts: u32, reason: &str) -> OutboundRecord {
    let original_topic = record
        .header(HEADER_ORIGINAL_TOPIC)
        .map(str::to_string)
        .unwrap_or_else(|| record.topic.clone());
    let original_partition = record
        .header(HEADER_ORIGINAL_PARTITION)
        .map(str::to_string)
        .unwrap_or_else(|| record.partition.to_string());
    let original_offset = record
        .header(HEADER_ORIGINAL_OFFSET)
        .map(str::to_string)
        .unwrap_or_else(|| record.offset.to_string());

    OutboundRecord::new(topic, record.key.clone(), record.payload.clone())
        .with_header(HEADER_RETRY_ATTEMPT, attempts.to_string())
        .with_header(HEADER_ORIGINAL_TOPIC, original_topic)
        .with_header(HEADER_ORIGINAL_PARTITION, original_partition)
        .with_header(HEADER_ORIGINAL_OFFSET, original_offset)
        .with_header(HEADER_ERROR, reason)
}
