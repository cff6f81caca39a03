//! Queued request records, per-queue scheduling, and retry policy.

pub mod events;
pub mod record;
pub mod scheduler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::serializer::SerializeError;
use crate::storage::StorageError;
use crate::vdata::Value;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Serialize(#[from] SerializeError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("malformed queue record: {0}")]
    MalformedRecord(String),
}

/// How a submission executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    /// Bypass the queue entirely: forwarded to the transport with no
    /// persistence and no ordering guarantee relative to queued items.
    Immediate,
    /// In-memory FIFO, not persisted.
    Queued,
    /// Persisted FIFO, survives restarts.
    Durable,
}

impl Behavior {
    pub fn is_durable(self) -> bool {
        matches!(self, Behavior::Durable)
    }
}

/// Lifecycle state of one queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Active,
    Succeeded,
    Failed,
    Exhausted,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed | Status::Exhausted)
    }
}

/// Retry spacing parameters.
///
/// Delay for attempt N is computed from the retry count each time
/// (`delay * multiplier^N`), never compounded from the previous delay, so
/// edge multipliers (< 1) cannot drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub delay_ms: u64,
    pub multiplier: f64,
    /// Lower bound of the uniform jitter factor. Defaults to 0 when only
    /// the upper bound is given.
    pub jitter_start: Option<f64>,
    /// Upper bound of the uniform jitter factor. Defaults to 1 when only
    /// the lower bound is given.
    pub jitter_end: Option<f64>,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            delay_ms: 1_000,
            multiplier: 1.0,
            jitter_start: None,
            jitter_end: None,
        }
    }
}

impl Backoff {
    pub fn fixed(delay_ms: u64) -> Self {
        Backoff {
            delay_ms,
            ..Backoff::default()
        }
    }

    /// Delay before retry number `retry_count` (1-based).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1);
        let mut delay = self.delay_ms as f64 * self.multiplier.powi(exponent as i32);
        if self.jitter_start.is_some() || self.jitter_end.is_some() {
            let start = self.jitter_start.unwrap_or(0.0);
            let end = self.jitter_end.unwrap_or(1.0);
            let factor = if end >= start {
                rand::thread_rng().gen_range(start..=end)
            } else {
                start
            };
            delay += delay * factor;
        }
        Duration::from_millis(delay.max(0.0) as u64)
    }
}

/// Which transport errors are worth retrying.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMatcher {
    /// Every error retries.
    Any,
    /// Exact error name match.
    Name(String),
    /// Substring match against the error message.
    Message(String),
    /// Regex over both name and message.
    Pattern(String),
}

impl RetryMatcher {
    pub fn matches(&self, error: &TransportError) -> bool {
        match self {
            RetryMatcher::Any => true,
            RetryMatcher::Name(name) => error.name == *name,
            RetryMatcher::Message(needle) => error.message.contains(needle),
            RetryMatcher::Pattern(pattern) => regex::Regex::new(pattern)
                .map(|re| re.is_match(&error.name) || re.is_match(&error.message))
                .unwrap_or(false),
        }
    }
}

/// Retry policy for one queued request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub match_rule: RetryMatcher,
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            match_rule: RetryMatcher::Any,
            max_retries: 0,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(match_rule: RetryMatcher, max_retries: u32, backoff: Backoff) -> Self {
        RetryPolicy {
            match_rule,
            max_retries,
            backoff,
        }
    }
}

/// Error surfaced by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct TransportError {
    pub name: String,
    pub message: String,
}

impl TransportError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        TransportError {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn aborted() -> Self {
        TransportError::new("AbortError", "request aborted")
    }

    pub fn is_abort(&self) -> bool {
        self.name == "AbortError"
    }
}

/// Cooperative cancellation signal handed to the transport. A transport
/// that observes it mid-flight returns an error, which flows through the
/// normal retry evaluation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The request execution collaborator. Timeouts are its responsibility;
/// this crate only reacts to the success/error signals it returns.
pub trait Transport: Send + Sync {
    fn execute(
        &self,
        request: &record::RequestDescriptor,
        cancel: &CancelToken,
    ) -> Result<Value, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_computed_from_retry_count() {
        let backoff = Backoff {
            delay_ms: 100,
            multiplier: 2.0,
            ..Backoff::default()
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn backoff_jitter_defaults_missing_bound() {
        let backoff = Backoff {
            delay_ms: 100,
            multiplier: 1.0,
            jitter_start: Some(0.5),
            jitter_end: None,
        };
        for _ in 0..20 {
            let delay = backoff.delay_for(1).as_millis();
            assert!((150..=200).contains(&delay), "jittered delay {delay}");
        }

        let backoff = Backoff {
            delay_ms: 100,
            multiplier: 1.0,
            jitter_start: None,
            jitter_end: Some(0.3),
        };
        for _ in 0..20 {
            let delay = backoff.delay_for(1).as_millis();
            assert!((100..=130).contains(&delay), "jittered delay {delay}");
        }
    }

    #[test]
    fn equal_jitter_bounds_apply_exactly() {
        // the factor interval is closed, so equal bounds are a fixed factor
        let backoff = Backoff {
            delay_ms: 100,
            multiplier: 1.0,
            jitter_start: Some(0.5),
            jitter_end: Some(0.5),
        };
        for _ in 0..5 {
            assert_eq!(backoff.delay_for(1), Duration::from_millis(150));
        }
    }

    #[test]
    fn shrinking_multiplier_does_not_drift() {
        let backoff = Backoff {
            delay_ms: 1_000,
            multiplier: 0.5,
            ..Backoff::default()
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(250));
    }

    #[test]
    fn retry_matcher_variants() {
        let err = TransportError::new("NetworkError", "connection reset by peer");
        assert!(RetryMatcher::Any.matches(&err));
        assert!(RetryMatcher::Name("NetworkError".into()).matches(&err));
        assert!(!RetryMatcher::Name("Timeout".into()).matches(&err));
        assert!(RetryMatcher::Message("reset".into()).matches(&err));
        assert!(RetryMatcher::Pattern("^Network".into()).matches(&err));
        assert!(!RetryMatcher::Pattern("^Timeout".into()).matches(&err));
        // invalid patterns never match
        assert!(!RetryMatcher::Pattern("(".into()).matches(&err));
    }

    #[test]
    fn cancel_token_signals() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }
}
