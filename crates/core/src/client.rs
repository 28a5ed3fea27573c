//! Client for enqueueing jobs.

use crate::backend::{Backend, QueueStats, SharedBackend};
use crate::error::{QueueError, Result};
use crate::job::{Job, JobId};
use crate::payload::JobPayload;

/// Producer-side handle for pushing jobs and inspecting queues.
#[derive(Clone)]
pub struct Client<B: Backend + Clone = SharedBackend> {
    backend: B,
}

impl Client<SharedBackend> {
    /// Create a new client with a shared backend.
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self {
            backend: SharedBackend::new(backend),
        }
    }
}

impl<B: Backend + Clone> Client<B> {
    /// Create a new client with a specific backend.
    pub fn with_backend(backend: B) -> Self {
        Self { backend }
    }

    /// Enqueue a typed payload on its queue, `P::QUEUE`.
    pub async fn enqueue<P: JobPayload>(&self, payload: &P) -> Result<JobId> {
        let value = serde_json::to_value(payload)?;
        self.enqueue_job(Job::new(P::QUEUE, value)).await
    }

    /// Enqueue a raw JSON payload on `queue`.
    pub async fn enqueue_to(
        &self,
        queue: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<JobId> {
        self.enqueue_job(Job::new(queue, payload)).await
    }

    /// Enqueue a pre-built job.
    pub async fn enqueue_job(&self, job: Job) -> Result<JobId> {
        let job_id = job.id.clone();
        let json = job.to_json()?;

        self.backend.push_job(&job.queue, &json).await?;

        tracing::debug!(queue = %job.queue, job_id = %job_id, "Job enqueued");
        Ok(job_id)
    }

    /// Get point-in-time counts for a queue.
    pub async fn stats(&self, queue: &str) -> Result<QueueStats> {
        self.backend.queue_stats(queue).await
    }

    /// Most recently dead-lettered jobs of a queue, newest first.
    pub async fn list_dead(&self, queue: &str, limit: usize) -> Result<Vec<Job>> {
        self.backend
            .list_dead(queue, limit)
            .await?
            .iter()
            .map(|json| Job::from_json(json).map_err(QueueError::from))
            .collect()
    }
}
