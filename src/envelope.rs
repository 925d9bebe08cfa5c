//! Event envelope and domain payloads
//!
//! The envelope is the wire representation of a domain event. On the wire it
//! is a flat JSON object: the payload fields sit next to `id` and
//! `occurredAt`, e.g.
//!
//! ```json
//! {"id":"4f1c…","username":"alice","email":"a@x.com","occurredAt":"2024-05-01T10:00:00.000000Z"}
//! ```
//!
//! Envelopes are immutable: fields are private and only readable through
//! accessors. The pipeline never edits a published envelope; retries forward
//! the original bytes to a new topic.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

/// Envelope wrapping a domain payload with delivery metadata.
///
/// # Type Parameter
///
/// * `T` - The domain payload; its fields are flattened into the envelope
///
/// # Examples
///
/// ```
/// use kafka_events::envelope::{EventEnvelope, UserRegistered};
///
/// let envelope = EventEnvelope::new(UserRegistered::new("alice", "a@x.com"));
/// assert!(!envelope.id().is_empty());
/// assert_eq!(envelope.payload().username, "alice");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    id: String,

    #[serde(flatten)]
    payload: T,

    #[serde(rename = "occurredAt")]
    occurred_at: String,
}

impl<T> EventEnvelope<T> {
    /// Wraps a payload with a fresh UUID v4 id and the current time.
    pub fn new(payload: T) -> Self {
        Self::with_timestamp(payload, Utc::now())
    }

    /// Wraps a payload with a fresh id and an explicit timestamp.
    pub fn with_timestamp(payload: T, occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            occurred_at: format_timestamp(occurred_at),
        }
    }

    /// Globally unique event id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Domain payload
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// RFC 3339 timestamp assigned at publish time
    pub fn occurred_at(&self) -> &str {
        &self.occurred_at
    }

    /// Consumes the envelope and returns the payload.
    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T: Serialize> EventEnvelope<T> {
    /// Serializes the envelope to its JSON wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<T: for<'de> Deserialize<'de>> EventEnvelope<T> {
    /// Parses an envelope from its JSON wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Clock handing out non-decreasing timestamps.
///
/// Wall clocks can step backwards; a producer instance clamps to the last
/// value it issued so `occurredAt` never decreases within that instance.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    /// Creates a clock with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `max(now, last issued)` and records it.
    pub fn now(&self) -> DateTime<Utc> {
        self.observe(Utc::now())
    }

    fn observe(&self, candidate: DateTime<Utc>) -> DateTime<Utc> {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let issued = match *last {
            Some(prev) if prev > candidate => prev,
            _ => candidate,
        };
        *last = Some(issued);
        issued
    }
}

/// Domain event emitted when a user registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegistered {
    /// Chosen username
    pub username: String,
    /// Address the confirmation email goes to
    pub email: String,
}

impl UserRegistered {
    /// Creates the payload from its fields.
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
        }
    }
}

/// Registration request as received from callers.
///
/// The id field is accepted for compatibility but never copied into the
/// event; event ids are always generated at publish time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Caller-side identifier, ignored by the pipeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Chosen username
    pub username: String,
    /// Email address
    pub email: String,
}

impl From<User> for UserRegistered {
    fn from(user: User) -> Self {
        Self {
            username: user.username,
            email: user.email,
        }
    }
}
