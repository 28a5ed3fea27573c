//! Backend abstraction for job queue storage.
//!
//! The dispatcher talks to its broker only through the [`Backend`] trait, so
//! the same worker runs against Redis in production and against
//! [`MemoryBackend`](crate::MemoryBackend) in tests.
//!
//! Jobs are stored as JSON strings. Every queue has five areas:
//!
//! - **waiting**: FIFO list of jobs ready to run
//! - **active**: jobs claimed by a worker and not yet reported, each with a
//!   lease stamped at claim time and renewed while the job runs
//! - **retry**: jobs waiting for their backoff to expire, ordered by due time
//! - **dead**: jobs that failed terminally
//! - **completed**: a counter of successfully processed jobs

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Point-in-time counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Backend trait for job queue storage operations.
///
/// Implementations must be safe for concurrent use from every queue's
/// workers; the dispatcher shares a single backend value across all of them.
#[async_trait]
pub trait Backend: Send + Sync {
    // ========== Connection ==========

    /// Establish the connection to the broker.
    ///
    /// Implementations should fail with [`QueueError::Connection`](crate::QueueError::Connection)
    /// when the broker is unreachable. Bounding the attempt in time and
    /// retrying is the caller's job (see [`connect_with_retry`](crate::connect_with_retry)).
    async fn connect(&self) -> Result<()>;

    /// Close the connection. Calling this when already disconnected is a no-op.
    async fn disconnect(&self) -> Result<()>;

    // ========== Queue Registration ==========

    /// Record that this process consumes `queue` with the given concurrency.
    async fn register_queue(&self, queue: &str, concurrency: usize) -> Result<()>;

    /// List queues registered with this backend, with their concurrency.
    async fn registered_queues(&self) -> Result<Vec<(String, usize)>>;

    // ========== Queue Operations ==========

    /// Push a job onto the tail of a queue's waiting list.
    async fn push_job(&self, queue: &str, job_json: &str) -> Result<()>;

    /// Atomically move the oldest waiting job to the active list and start
    /// its lease.
    ///
    /// Returns `None` if no job becomes available within `timeout`. A claim
    /// waiting on one queue must not hold up claims or outcomes on another.
    async fn claim_job(&self, queue: &str, timeout: Duration) -> Result<Option<String>>;

    /// Return a claimed job to the head of the waiting list.
    ///
    /// Used when a claim races with shutdown and the job must not run.
    async fn requeue_job(&self, queue: &str, claimed_json: &str) -> Result<()>;

    // ========== Job Outcomes ==========

    /// Remove a claimed job from the active list and count it as completed.
    async fn complete_job(&self, queue: &str, claimed_json: &str) -> Result<()>;

    /// Move a claimed job to the retry set, due at `retry_at` (Unix seconds).
    async fn retry_job(
        &self,
        queue: &str,
        claimed_json: &str,
        updated_json: &str,
        retry_at: i64,
    ) -> Result<()>;

    /// Move a claimed job to the dead letter list.
    async fn fail_job(&self, queue: &str, claimed_json: &str, updated_json: &str) -> Result<()>;

    // ========== Stalled Jobs ==========

    /// Renew the lease on a claimed job. A no-op if the job is no longer
    /// active.
    async fn renew_lease(&self, queue: &str, claimed_json: &str) -> Result<()>;

    /// Move active jobs whose lease was last renewed before `stalled_before`
    /// (Unix milliseconds) back to the head of the waiting list.
    ///
    /// Returns how many jobs were recovered.
    async fn recover_stalled(&self, queue: &str, stalled_before: i64, limit: usize)
        -> Result<usize>;

    // ========== Retry Operations ==========

    /// Get retry jobs that are due (retry_at <= now).
    async fn get_due_retries(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<String>>;

    /// Move a due retry job back to the waiting list.
    async fn move_retry_to_queue(&self, queue: &str, job_json: &str) -> Result<()>;

    // ========== Inspection ==========

    /// Get counts for every area of a queue.
    async fn queue_stats(&self, queue: &str) -> Result<QueueStats>;

    /// List jobs in a queue's dead letter list, newest first.
    async fn list_dead(&self, queue: &str, limit: usize) -> Result<Vec<String>>;
}

/// A type-erased backend that can be shared across threads.
pub type DynBackend = Arc<dyn Backend>;

/// Wrapper around Arc<dyn Backend> for convenience.
#[derive(Clone)]
pub struct SharedBackend {
    inner: DynBackend,
}

impl SharedBackend {
    /// Create a new SharedBackend from any Backend implementation.
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    /// Get a reference to the inner backend.
    pub fn inner(&self) -> &DynBackend {
        &self.inner
    }
}

#[async_trait]
impl Backend for SharedBackend {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    async fn register_queue(&self, queue: &str, concurrency: usize) -> Result<()> {
        self.inner.register_queue(queue, concurrency).await
    }

    async fn registered_queues(&self) -> Result<Vec<(String, usize)>> {
        self.inner.registered_queues().await
    }

    async fn push_job(&self, queue: &str, job_json: &str) -> Result<()> {
        self.inner.push_job(queue, job_json).await
    }

    async fn claim_job(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        self.inner.claim_job(queue, timeout).await
    }

    async fn requeue_job(&self, queue: &str, claimed_json: &str) -> Result<()> {
        self.inner.requeue_job(queue, claimed_json).await
    }

    async fn complete_job(&self, queue: &str, claimed_json: &str) -> Result<()> {
        self.inner.complete_job(queue, claimed_json).await
    }

    async fn retry_job(
        &self,
        queue: &str,
        claimed_json: &str,
        updated_json: &str,
        retry_at: i64,
    ) -> Result<()> {
        self.inner
            .retry_job(queue, claimed_json, updated_json, retry_at)
            .await
    }

    async fn fail_job(&self, queue: &str, claimed_json: &str, updated_json: &str) -> Result<()> {
        self.inner.fail_job(queue, claimed_json, updated_json).await
    }

    async fn renew_lease(&self, queue: &str, claimed_json: &str) -> Result<()> {
        self.inner.renew_lease(queue, claimed_json).await
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        stalled_before: i64,
        limit: usize,
    ) -> Result<usize> {
        self.inner.recover_stalled(queue, stalled_before, limit).await
    }

    async fn get_due_retries(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<String>> {
        self.inner.get_due_retries(queue, now, limit).await
    }

    async fn move_retry_to_queue(&self, queue: &str, job_json: &str) -> Result<()> {
        self.inner.move_retry_to_queue(queue, job_json).await
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        self.inner.queue_stats(queue).await
    }

    async fn list_dead(&self, queue: &str, limit: usize) -> Result<Vec<String>> {
        self.inner.list_dead(queue, limit).await
    }
}
