//! Event producer
//!
//! Wraps domain payloads in an [`EventEnvelope`], serializes them to JSON and
//! writes them to a single topic keyed by the event id. Every call reports its
//! own outcome; nothing is retried internally, so the caller decides whether a
//! transient failure is worth another attempt.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::broker::{OutboundRecord, RecordSink};
use crate::envelope::{EventEnvelope, MonotonicClock};
use crate::error::PublishError;
use crate::telemetry;

/// Acknowledgement of a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Partition the event landed in
    pub partition: i32,
    /// Offset of the event within that partition
    pub offset: i64,
    /// Id assigned to the event
    pub event_id: String,
}

/// Publishes typed events to one topic.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use kafka_events::broker::{MemoryBroker, TopicAdmin, TopicSpec};
/// use kafka_events::envelope::UserRegistered;
/// use kafka_events::producer::EventProducer;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = MemoryBroker::new();
/// broker.create_topic(&TopicSpec::new("user.emailevents", 1, 1)).await?;
///
/// let producer = EventProducer::new(Arc::new(broker), "user.emailevents");
/// let ack = producer.publish(UserRegistered::new("alice", "a@x.com")).await?;
/// assert_eq!(ack.offset, 0);
/// # Ok(())
/// # }
/// ```
pub struct EventProducer {
    sink: Arc<dyn RecordSink>,
    topic: String,
    clock: MonotonicClock,
}

impl EventProducer {
    /// Creates a producer writing to `topic`.
    pub fn new(sink: Arc<dyn RecordSink>, topic: impl Into<String>) -> Self {
        Self {
            sink,
            topic: topic.into(),
            clock: MonotonicClock::new(),
        }
    }

    /// Destination topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wraps `payload` in a fresh envelope and publishes it.
    ///
    /// # Arguments
    ///
    /// * `payload` - Domain event; its fields are flattened into the envelope
    ///
    /// # Returns
    ///
    /// The partition, offset and generated event id
    ///
    /// # Errors
    ///
    /// - `PublishError::Transient` if the broker is unreachable or times out
    /// - `PublishError::Fatal` if serialization fails or the broker rejects
    ///   the record
    pub async fn publish<T: Serialize>(&self, payload: T) -> Result<Ack, PublishError> {
        let envelope = EventEnvelope::with_timestamp(payload, self.clock.now());
        self.publish_envelope(&envelope).await
    }

    /// Publishes an already-built envelope with the same contract as
    /// [`EventProducer::publish`].
    pub async fn publish_envelope<T: Serialize>(
        &self,
        envelope: &EventEnvelope<T>,
    ) -> Result<Ack, PublishError> {
        let bytes = envelope.to_bytes().map_err(|e| {
            telemetry::record_publish_failed(&self.topic, "fatal");
            PublishError::Fatal(format!("failed to serialize event: {}", e))
        })?;

        let record = OutboundRecord::new(&self.topic, Some(envelope.id().to_string()), bytes);
        match self.sink.send(record).await {
            Ok(ack) => {
                debug!(
                    topic = %self.topic,
                    partition = ack.partition,
                    offset = ack.offset,
                    event_id = %envelope.id(),
                    "Event published"
                );
                telemetry::record_published(&self.topic);
                Ok(Ack {
                    partition: ack.partition,
                    offset: ack.offset,
                    event_id: envelope.id().to_string(),
                })
            }
            Err(err) => {
                let err = PublishError::from(err);
                let kind = if err.is_transient() { "transient" } else { "fatal" };
                warn!(
                    topic = %self.topic,
                    event_id = %envelope.id(),
                    kind,
                    error = %err,
                    "Event publish failed"
                );
                telemetry::record_publish_failed(&self.topic, kind);
                Err(err)
            }
        }
    }
}
