//! Consuming side of the pipeline
//!
//! - [`retryable`]: steady-state consumption with retry topics and a
//!   dead-letter topic
//! - [`drain`]: bounded, on-demand reads and dead-letter replay
//! - [`handler`]: the side effect run per event
//! - [`retry`]: backoff policies and retry-topic naming

pub mod drain;
pub mod handler;
pub mod retry;
pub mod retryable;

pub use drain::{DrainEndpoint, DEFAULT_DRAIN_GROUP};
pub use handler::{ConfirmationEmailHandler, EventHandler};
pub use retry::{BackoffPolicy, Destination, RetryPolicy, RetryTopology};
pub use retryable::{RetryableConsumer, Subscription};
