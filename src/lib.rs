//! kafka-events - retryable user-event pipeline library
//!
//! Publishes domain events ("a user registered") to a partitioned log and
//! consumes them with bounded, non-blocking retry through retry topics and a
//! dead-letter topic.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `broker`: Broker seam with Kafka and in-memory implementations
//! - `provisioner`: Idempotent topic creation
//! - `envelope`: Event envelope wire format and domain payloads
//! - `producer`: Event publishing
//! - `consumer`: Retryable consumer, handlers, drain and replay
//! - `http`: HTTP boundary
//! - `config`: Configuration management and validation
//! - `logging` / `telemetry`: Logging setup and counters
//! - `error`: Error types and result aliases
//! - `cli` / `commands`: Command-line interface and handlers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kafka_events::broker::{Broker, MemoryBroker, TopicSpec};
//! use kafka_events::consumer::{ConfirmationEmailHandler, RetryPolicy, RetryableConsumer};
//! use kafka_events::envelope::UserRegistered;
//! use kafka_events::producer::EventProducer;
//! use kafka_events::provisioner::TopicProvisioner;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
//!     TopicProvisioner::new(broker.clone().into_admin())
//!         .ensure_topic(&TopicSpec::new("user.emailevents", 1, 1))
//!         .await?;
//!
//!     let consumer = RetryableConsumer::new(broker.clone(), RetryPolicy::default());
//!     let subscription = consumer
//!         .subscribe::<UserRegistered>("user.emailevents", "user-event-group", Arc::new(ConfirmationEmailHandler::new()))
//!         .await?;
//!
//!     let producer = EventProducer::new(broker.into_sink(), "user.emailevents");
//!     producer.publish(UserRegistered::new("alice", "a@x.com")).await?;
//!
//!     subscription.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod cli;
pub mod commands;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod http;
pub mod logging;
pub mod producer;
pub mod provisioner;
pub mod telemetry;

// Re-export commonly used types
pub use config::Config;
pub use envelope::{EventEnvelope, UserRegistered};
pub use error::{EventsError, Result};
pub use producer::{Ack, EventProducer};
pub use provisioner::TopicProvisioner;
