//! Broker seam
//!
//! The pipeline talks to the partitioned log only through the traits in this
//! module, so the same provisioning, publishing and consuming logic runs
//! against Kafka in production and against an in-process log in tests.
//!
//! # Implementations
//!
//! - [`kafka::KafkaBroker`]: rdkafka-backed admin, producer and consumers
//! - [`memory::MemoryBroker`]: in-memory partitioned log with per-group offsets
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use kafka_events::broker::{Broker, MemoryBroker};
//!
//! let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
//! ```

pub mod kafka;
pub mod kafka_config;
pub mod memory;

pub use kafka::KafkaBroker;
pub use kafka_config::{KafkaSettings, SaslConfig, SaslMechanism, SecurityProtocol, SslConfig};
pub use memory::MemoryBroker;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::BrokerError;

/// Result type for broker seam operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Record headers, kept ordered so logs and tests are stable.
pub type Headers = BTreeMap<String, String>;

/// Requested shape of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    /// Topic name
    pub name: String,
    /// Number of partitions
    pub partitions: i32,
    /// Replication factor
    pub replication_factor: i32,
}

impl TopicSpec {
    /// Creates a topic specification.
    pub fn new(name: impl Into<String>, partitions: i32, replication_factor: i32) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
        }
    }

    /// Same partition/replication settings under another name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: self.partitions,
            replication_factor: self.replication_factor,
        }
    }
}

/// Shape of a topic as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicDescription {
    /// Number of partitions
    pub partitions: i32,
    /// Replication factor
    pub replication_factor: i32,
}

/// Outcome of a create-topic request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Topic was created by this request
    Created,
    /// Another client created the topic first
    AlreadyExists,
}

/// Broker acknowledgement of a written record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordAck {
    /// Partition the record landed in
    pub partition: i32,
    /// Offset of the record within that partition
    pub offset: i64,
}

/// Record to be written to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    /// Destination topic
    pub topic: String,
    /// Partitioning key
    pub key: Option<String>,
    /// Serialized payload
    pub payload: Vec<u8>,
    /// Out-of-band metadata
    pub headers: Headers,
}

impl OutboundRecord {
    /// Creates a record without headers.
    pub fn new(topic: impl Into<String>, key: Option<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key,
            payload,
            headers: Headers::new(),
        }
    }

    /// Adds a header, replacing any previous value for the key.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Record delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRecord {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Partitioning key
    pub key: Option<String>,
    /// Serialized payload
    pub payload: Vec<u8>,
    /// Out-of-band metadata
    pub headers: Headers,
}

impl InboundRecord {
    /// Returns a header value if present.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Topic administration.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    /// Describes a topic, or `None` when it does not exist.
    async fn describe_topic(&self, name: &str) -> BrokerResult<Option<TopicDescription>>;

    /// Creates a topic. Existing topics report `CreateOutcome::AlreadyExists`.
    async fn create_topic(&self, spec: &TopicSpec) -> BrokerResult<CreateOutcome>;
}

/// Record writer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Writes one record and waits for the broker acknowledgement.
    async fn send(&self, record: OutboundRecord) -> BrokerResult<RecordAck>;
}

/// Group-managed record reader.
///
/// A source is owned by a single consumer loop. Offsets are only stored
/// through [`RecordSource::ack`]; anything not acknowledged is redelivered
/// after a restart or partition reassignment.
#[async_trait]
pub trait RecordSource: Send {
    /// Waits for the next record from the assigned partitions.
    ///
    /// Must be cancel-safe: dropping the future loses no record.
    async fn recv(&mut self) -> BrokerResult<InboundRecord>;

    /// Marks the record as processed; its offset + 1 becomes the group position.
    fn ack(&mut self, record: &InboundRecord) -> BrokerResult<()>;

    /// Rewinds the record's partition to the record and pauses fetching from it.
    fn rewind_and_pause(&mut self, record: &InboundRecord) -> BrokerResult<()>;

    /// Resumes a partition paused by [`RecordSource::rewind_and_pause`].
    fn resume(&mut self, topic: &str, partition: i32) -> BrokerResult<()>;

    /// Leaves the group and releases assigned partitions.
    async fn close(self: Box<Self>);
}

/// A complete broker: admin, writer and reader factory.
#[async_trait]
pub trait Broker: TopicAdmin + RecordSink {
    /// Joins `group_id` and subscribes to `topics`.
    async fn subscribe(
        &self,
        topics: &[String],
        group_id: &str,
    ) -> BrokerResult<Box<dyn RecordSource>>;

    /// Reads every partition of `topic` from `group_id`'s committed offsets
    /// without joining the group, so no rebalance delays the first record.
    ///
    /// Acknowledgements still store positions for `group_id`. Brokers without
    /// group coordination cost may fall back to a plain subscription.
    async fn assign(&self, topic: &str, group_id: &str) -> BrokerResult<Box<dyn RecordSource>> {
        self.subscribe(&[topic.to_string()], group_id).await
    }

    /// This broker viewed as an admin client.
    fn into_admin(self: std::sync::Arc<Self>) -> std::sync::Arc<dyn TopicAdmin>;

    /// This broker viewed as a record writer.
    fn into_sink(self: std::sync::Arc<Self>) -> std::sync::Arc<dyn RecordSink>;
}
