//! Retry policy and retry-topic topology
//!
//! A failed record is not retried in place. It is forwarded to the next topic
//! in a fixed chain, stamped with the earliest time it may be handled again:
//!
//! ```text
//! T  --fail-->  T-retry-1  --fail-->  ...  T-retry-(N-1)  --fail-->  T-dlt
//! ```
//!
//! Attempt 1 reads `T`, attempt `k + 1` reads `T-retry-k`, and a failure of
//! attempt `N` lands in the dead-letter topic.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::EventsError;

/// Delay between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Same delay after every failure
    Fixed {
        /// Delay in milliseconds
        delay_ms: u64,
    },
    /// `initial_ms + step_ms * (attempt - 1)`, capped
    Linear {
        /// Delay after the first failure
        initial_ms: u64,
        /// Added per further failure
        step_ms: u64,
        /// Upper bound
        max_delay_ms: u64,
    },
    /// `initial_ms * multiplier^(attempt - 1)`, capped
    Exponential {
        /// Delay after the first failure
        initial_ms: u64,
        /// Growth factor, at least 1.0
        multiplier: f64,
        /// Upper bound
        max_delay_ms: u64,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Fixed { delay_ms: 2000 }
    }
}

impl BackoffPolicy {
    /// Delay to apply after `failed_attempt` (1-based) has failed.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use kafka_events::consumer::BackoffPolicy;
    ///
    /// let backoff = BackoffPolicy::Exponential { initial_ms: 100, multiplier: 2.0, max_delay_ms: 300 };
    /// assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
    /// assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
    /// assert_eq!(backoff.delay_for(3), Duration::from_millis(300));
    /// ```
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let step = failed_attempt.saturating_sub(1);
        let millis = match *self {
            Self::Fixed { delay_ms } => delay_ms,
            Self::Linear {
                initial_ms,
                step_ms,
                max_delay_ms,
            } => initial_ms
                .saturating_add(step_ms.saturating_mul(u64::from(step)))
                .min(max_delay_ms),
            Self::Exponential {
                initial_ms,
                multiplier,
                max_delay_ms,
            } => {
                let scaled = initial_ms as f64 * multiplier.powi(step.min(i32::MAX as u32) as i32);
                if scaled.is_finite() && scaled < max_delay_ms as f64 {
                    scaled as u64
                } else {
                    max_delay_ms
                }
            }
        };
        Duration::from_millis(millis)
    }

    fn validate(&self) -> Result<(), EventsError> {
        match self {
            Self::Exponential { multiplier, .. } if !(*multiplier >= 1.0) => Err(
                EventsError::Config(format!("backoff multiplier must be >= 1.0, got {}", multiplier)),
            ),
            Self::Linear {
                initial_ms,
                max_delay_ms,
                ..
            }
            | Self::Exponential {
                initial_ms,
                max_delay_ms,
                ..
            } if max_delay_ms < initial_ms => Err(EventsError::Config(format!(
                "backoff max_delay_ms ({}) is below initial_ms ({})",
                max_delay_ms, initial_ms
            ))),
            _ => Ok(()),
        }
    }
}

/// Bounded retry behaviour of a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total handler invocations per record, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns `EventsError::Config` for zero attempts or an unusable backoff.
    pub fn validate(&self) -> Result<(), EventsError> {
        if self.max_attempts == 0 {
            return Err(EventsError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        self.backoff.validate()
    }
}

/// Where a failed record goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Retry topic feeding the given attempt
    Retry {
        /// Retry topic name
        topic: String,
        /// Attempt number the retry topic feeds
        next_attempt: u32,
    },
    /// Dead-letter topic
    DeadLetter(String),
}

/// Topic names derived from a base topic and an attempt budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTopology {
    base: String,
    max_attempts: u32,
}

impl RetryTopology {
    /// Creates the topology for `base` with `max_attempts` total attempts.
    pub fn new(base: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            base: base.into(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Base topic
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Total attempts per record
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Name of the `n`-th retry topic, holding records awaiting attempt `n + 1`.
    pub fn retry_topic(&self, n: u32) -> String {
        format!("{}-retry-{}", self.base, n)
    }

    /// Name of the dead-letter topic.
    pub fn dead_letter_topic(&self) -> String {
        format!("{}-dlt", self.base)
    }

    /// Topics consumed by the chain: the base topic then every retry topic.
    pub fn topics(&self) -> Vec<String> {
        std::iter::once(self.base.clone())
            .chain((1..self.max_attempts).map(|n| self.retry_topic(n)))
            .collect()
    }

    /// Attempt number served by a topic of the chain.
    ///
    /// Returns `None` for topics outside the chain, including the
    /// dead-letter topic.
    pub fn attempt_for(&self, topic: &str) -> Option<u32> {
        if topic == self.base {
            return Some(1);
        }
        let n: u32 = topic
            .strip_prefix(&self.base)?
            .strip_prefix("-retry-")?
            .parse()
            .ok()?;
        (1..self.max_attempts).contains(&n).then_some(n + 1)
    }

    /// Destination of a record whose attempt `failed_attempt` failed.
    pub fn next_destination(&self, failed_attempt: u32) -> Destination {
        if failed_attempt >= self.max_attempts {
            Destination::DeadLetter(self.dead_letter_topic())
        } else {
            Destination::Retry {
                topic: self.retry_topic(failed_attempt),
                next_attempt: failed_attempt + 1,
            }
        }
    }
}
