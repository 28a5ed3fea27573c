//! Job outcome events.

use serde::Serialize;

use crate::job::{JobErrorKind, JobId};

/// Capacity of the event broadcast channel. Slow subscribers lag rather
/// than block the dispatcher.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Reported once per attempt outcome. Each job produces exactly one
/// terminal event (`Completed` or `Failed`), possibly preceded by
/// `Retrying` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Completed {
        queue: String,
        job_id: JobId,
    },
    Retrying {
        queue: String,
        job_id: JobId,
        attempt: u32,
        error: String,
        retry_at: i64,
    },
    Failed {
        queue: String,
        job_id: JobId,
        attempts: u32,
        kind: JobErrorKind,
        error: String,
    },
}

impl JobEvent {
    pub fn queue(&self) -> &str {
        match self {
            JobEvent::Completed { queue, .. }
            | JobEvent::Retrying { queue, .. }
            | JobEvent::Failed { queue, .. } => queue,
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            JobEvent::Completed { job_id, .. }
            | JobEvent::Retrying { job_id, .. }
            | JobEvent::Failed { job_id, .. } => job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::Retrying { .. })
    }
}
