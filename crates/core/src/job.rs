//! Job definition and related types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new random JobId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a job is in its lifecycle.
///
/// `Completed` and `Failed` are terminal. A job scheduled for retry goes
/// back to `Waiting` with its attempt count preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// A unit of work bound to one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,
    /// Name of the queue whose handler processes this job.
    pub queue: String,
    /// Handler-defined payload.
    pub payload: serde_json::Value,
    /// Number of times this job has been handed to a handler.
    pub attempts: u32,
    /// Current job state.
    pub state: JobState,
    /// Timestamp when the job was created (Unix timestamp in seconds).
    pub created_at: i64,
    /// Error message from the last failed attempt.
    pub last_error: Option<String>,
}

impl Job {
    /// Create a new waiting job for `queue`.
    pub fn new(queue: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            attempts: 0,
            state: JobState::Waiting,
            created_at: current_timestamp(),
            last_error: None,
        }
    }

    /// Serialize the job to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a job from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Retry policy applied when a handler returns a retryable error.
///
/// `max_attempts` counts every delivery, including the first one, so the
/// default of 3 means one initial run and at most two retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries: the first failure is terminal.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Check whether a job that has already been attempted `attempts` times may run again.
    pub fn can_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Exponential backoff: `base * 2^(attempts - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}

/// Result type for job handlers.
pub type JobResult = std::result::Result<(), JobError>;

/// Why a job attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobErrorKind {
    /// The handler returned an error.
    Handler,
    /// The handler did not finish within the job timeout.
    Timeout,
    /// The payload could not be decoded into the queue's payload type.
    Decode,
    /// The handler panicked.
    Panicked,
}

/// Error returned from job handlers.
#[derive(Debug, Clone)]
pub struct JobError {
    /// Error message.
    pub message: String,
    pub kind: JobErrorKind,
    /// Whether the job should be retried.
    pub retryable: bool,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: JobErrorKind::Handler,
            retryable: true,
        }
    }

    /// Create a new non-retryable error (job goes straight to the dead letter list).
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: JobErrorKind::Handler,
            retryable: false,
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self {
            message: format!("job timed out after {:?}", limit),
            kind: JobErrorKind::Timeout,
            retryable: true,
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: JobErrorKind::Decode,
            retryable: false,
        }
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: JobErrorKind::Panicked,
            retryable: false,
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl<E: std::error::Error> From<E> for JobError {
    fn from(err: E) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Get current Unix timestamp in seconds.
pub(crate) fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Get current Unix timestamp in milliseconds.
///
/// Claim leases are stamped with this.
pub fn current_timestamp_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
