//! Event handlers
//!
//! A handler performs the side effect for one event. Returning an error marks
//! the attempt as failed and sends the record down the retry chain; handlers
//! must therefore tolerate seeing the same event more than once.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

use crate::envelope::{EventEnvelope, UserRegistered};
use crate::error::HandlerError;

/// Side effect run for each consumed event.
#[async_trait]
pub trait EventHandler<T>: Send + Sync {
    /// Handles one event. Errors trigger a retry or dead-lettering.
    async fn handle(&self, event: &EventEnvelope<T>) -> Result<(), HandlerError>;
}

/// Sends the registration confirmation email.
///
/// Mail delivery is logged rather than performed; the handler counts sends
/// so callers can report how many confirmations went out.
#[derive(Debug, Default)]
pub struct ConfirmationEmailHandler {
    sent: AtomicUsize,
}

impl ConfirmationEmailHandler {
    /// Creates a handler with a zero send count.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of confirmations sent so far
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventHandler<UserRegistered> for ConfirmationEmailHandler {
    async fn handle(&self, event: &EventEnvelope<UserRegistered>) -> Result<(), HandlerError> {
        let user = event.payload();
        if user.email.trim().is_empty() {
            return Err(format!("user {} has no email address", user.username).into());
        }

        info!(
            event_id = %event.id(),
            username = %user.username,
            email = %user.email,
            "Sending confirmation email"
        );
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
