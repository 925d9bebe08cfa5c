//! Manual drain
//!
//! One-shot, bounded reads for operators: pull whatever is waiting on a topic
//! and return it, or move dead-lettered records back onto a live topic.
//!
//! A drain reads every partition directly from its group's committed offsets
//! instead of joining the group, so it does not wait for a rebalance before
//! the deadline starts counting. Draining uses its own consumer group by
//! default. Pointing it at the steady-state group is allowed, but the drain
//! then reads and commits the same partitions the running consumers own.

use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::{Broker, InboundRecord, OutboundRecord, RecordSource};
use crate::envelope::EventEnvelope;
use crate::error::ConsumeError;
use crate::telemetry;

/// Default consumer group for manual drains
pub const DEFAULT_DRAIN_GROUP: &str = "user-event-drain";

/// Bounded batch reader over a broker.
#[derive(Clone)]
pub struct DrainEndpoint {
    broker: Arc<dyn Broker>,
    group_id: String,
}

impl DrainEndpoint {
    /// Creates an endpoint reading under `group_id`.
    pub fn new(broker: Arc<dyn Broker>, group_id: impl Into<String>) -> Self {
        Self {
            broker,
            group_id: group_id.into(),
        }
    }

    /// Consumer group used for draining
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Reads up to `max_records` events from `topic` within `timeout`.
    ///
    /// Returned events are acknowledged, so a second drain does not return
    /// them again. Records that are not valid envelopes are skipped with a
    /// warning and acknowledged as well.
    ///
    /// # Arguments
    ///
    /// * `topic` - Topic to read
    /// * `max_records` - Upper bound on returned events
    /// * `timeout` - Upper bound on the whole call
    ///
    /// # Returns
    ///
    /// Events in delivery order; empty when nothing arrived in time
    ///
    /// # Errors
    ///
    /// Returns `ConsumeError::BrokerUnavailable` if the broker cannot be read.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::time::Duration;
    /// use kafka_events::broker::{MemoryBroker, TopicAdmin, TopicSpec};
    /// use kafka_events::consumer::DrainEndpoint;
    /// use kafka_events::envelope::UserRegistered;
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let broker = MemoryBroker::new();
    /// broker.create_topic(&TopicSpec::new("user.emailevents", 1, 1)).await?;
    ///
    /// let drain = DrainEndpoint::new(Arc::new(broker), "user-event-drain");
    /// let events = drain
    ///     .drain_once::<UserRegistered>("user.emailevents", 10, Duration::from_millis(50))
    ///     .await?;
    /// assert!(events.is_empty());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn drain_once<T>(
        &self,
        topic: &str,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<EventEnvelope<T>>, ConsumeError>
    where
        T: DeserializeOwned,
    {
        let mut events = Vec::new();
        if max_records == 0 {
            return Ok(events);
        }

        let mut batch = self.open(topic, max_records, timeout).await?;
        let result = loop {
            let record = match batch.next().await {
                Ok(Some(record)) => record,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            match EventEnvelope::<T>::from_bytes(&record.payload) {
                Ok(envelope) => events.push(envelope),
                Err(e) => warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Skipping undecodable record"
                ),
            }
            batch.ack(&record);
        };
        batch.close().await;
        result?;

        info!(topic = %topic, group_id = %self.group_id, count = events.len(), "Drained topic");
        telemetry::record_drained(topic, events.len());
        Ok(events)
    }

    /// Moves up to `max_records` raw records from `from_topic` to `to_topic`.
    ///
    /// Payload and key are copied unchanged; diagnostic headers are dropped
    /// so replayed records start a fresh retry chain. A record is only
    /// acknowledged after its copy is written.
    ///
    /// # Returns
    ///
    /// Number of records replayed
    ///
    /// # Errors
    ///
    /// Returns `ConsumeError::BrokerUnavailable` if reading or writing fails;
    /// records replayed before the failure stay replayed.
    pub async fn replay(
        &self,
        from_topic: &str,
        to_topic: &str,
        max_records: usize,
        timeout: Duration,
    ) -> Result<usize, ConsumeError> {
        if max_records == 0 {
            return Ok(0);
        }

        let sink = Arc::clone(&self.broker).into_sink();
        let mut batch = self.open(from_topic, max_records, timeout).await?;
        let mut replayed = 0;
        let result = loop {
            let record = match batch.next().await {
                Ok(Some(record)) => record,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            let copy = OutboundRecord::new(to_topic, record.key.clone(), record.payload.clone());
            if let Err(e) = sink.send(copy).await {
                warn!(
                    from = %from_topic,
                    to = %to_topic,
                    offset = record.offset,
                    error = %e,
                    "Replay write failed"
                );
                break Err(ConsumeError::from(e));
            }
            batch.ack(&record);
            replayed += 1;
        };
        batch.close().await;
        result?;

        info!(from = %from_topic, to = %to_topic, count = replayed, "Replayed records");
        Ok(replayed)
    }

    async fn open(
        &self,
        topic: &str,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Batch, ConsumeError> {
        let source = self.broker.assign(topic, &self.group_id).await?;
        debug!(topic = %topic, group_id = %self.group_id, max_records, "Opened drain batch");
        Ok(Batch {
            source,
            deadline: Instant::now() + timeout,
            remaining: max_records,
        })
    }
}

/// Records of one bounded poll.
struct Batch {
    source: Box<dyn RecordSource>,
    deadline: Instant,
    remaining: usize,
}

impl Batch {
    async fn next(&mut self) -> Result<Option<InboundRecord>, ConsumeError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        match tokio::time::timeout_at(self.deadline, self.source.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(record)) => {
                self.remaining -= 1;
                Ok(Some(record))
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    fn ack(&mut self, record: &InboundRecord) {
        if let Err(e) = self.source.ack(record) {
            warn!(topic = %record.topic, offset = record.offset, error = %e, "Failed to store offset");
        }
    }

    async fn close(self) {
        self.source.close().await;
    }
}
