//! Error types for the event pipeline
//!
//! Each pipeline component reports failures through its own `thiserror`
//! enum so callers can branch on the failure class. `EventsError` gathers
//! them for the application layer, where `anyhow` carries context.

use thiserror::Error;

/// Errors raised by the broker seam (admin, producer and consumer clients).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker could not be reached or did not answer in time
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Broker refused the request itself (record too large, invalid request)
    #[error("Broker rejected request: {0}")]
    Rejected(String),

    /// Topic does not exist on the broker
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
}

/// Errors returned by `TopicProvisioner::ensure_topic`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    /// Topic exists with a different partition count or replication factor
    #[error(
        "Topic '{topic}' exists with partitions={existing_partitions}, replication={existing_replication}; requested partitions={requested_partitions}, replication={requested_replication}"
    )]
    ConfigConflict {
        /// Topic name
        topic: String,
        /// Partition count found on the broker
        existing_partitions: i32,
        /// Replication factor found on the broker
        existing_replication: i32,
        /// Partition count that was requested
        requested_partitions: i32,
        /// Replication factor that was requested
        requested_replication: i32,
    },

    /// Broker could not be reached while provisioning
    #[error("Broker unavailable while provisioning: {0}")]
    BrokerUnavailable(String),

    /// Requested topic specification is not usable
    #[error("Invalid topic specification: {0}")]
    InvalidSpec(String),
}

/// Errors returned by `EventProducer::publish`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Network or broker availability problem; the caller may retry
    #[error("Transient publish failure: {0}")]
    Transient(String),

    /// Serialization or record rejection; retrying will not help
    #[error("Fatal publish failure: {0}")]
    Fatal(String),
}

impl PublishError {
    /// Returns true when retrying the whole publish call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<BrokerError> for PublishError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Unavailable(msg) => Self::Transient(msg),
            BrokerError::Rejected(msg) => Self::Fatal(msg),
            BrokerError::UnknownTopic(topic) => Self::Fatal(format!("unknown topic {}", topic)),
        }
    }
}

/// Errors raised on the consuming side of the pipeline.
#[derive(Error, Debug)]
pub enum ConsumeError {
    /// Record payload is not a valid event envelope
    #[error("Deserialization failure: {0}")]
    DeserializationFailure(#[from] serde_json::Error),

    /// Broker could not be reached while consuming
    #[error("Broker unavailable while consuming: {0}")]
    BrokerUnavailable(String),

    /// Retry or dead-letter topics could not be provisioned
    #[error("Provisioning failed: {0}")]
    Provision(#[from] ProvisionError),
}

impl From<BrokerError> for ConsumeError {
    fn from(err: BrokerError) -> Self {
        Self::BrokerUnavailable(err.to_string())
    }
}

/// Opaque failure returned by user-supplied event handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Application-level error type
///
/// Wraps component errors together with configuration and I/O failures
/// for the binary and the HTTP boundary.
#[derive(Error, Debug)]
pub enum EventsError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Provisioning errors
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// Publish errors
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Consume errors
    #[error(transparent)]
    Consume(#[from] ConsumeError),

    /// Broker client construction errors
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for application-level operations
pub type Result<T> = anyhow::Result<T>;
