//! Retrier for moving due retries back to their waiting lists.

use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::error::Result;
use crate::job::current_timestamp;

/// Moves jobs whose backoff has elapsed from each queue's retry set back
/// to that queue's waiting list.
pub struct Retrier<B: Backend> {
    backend: B,
    queues: Vec<String>,
    interval: Duration,
    batch_size: usize,
    stop: CancellationToken,
}

impl<B: Backend> Retrier<B> {
    /// Create a new Retrier.
    pub fn new(
        backend: B,
        queues: Vec<String>,
        interval: Duration,
        batch_size: usize,
        stop: CancellationToken,
    ) -> Self {
        Self {
            backend,
            queues,
            interval,
            batch_size,
            stop,
        }
    }

    /// Run the retrier loop until the stop token is cancelled.
    pub async fn run(&self) -> Result<()> {
        tracing::debug!(queues = self.queues.len(), "Retrier started");

        loop {
            for queue in &self.queues {
                if let Err(e) = self.tick(queue).await {
                    tracing::error!(queue = %queue, error = %e, "Retrier tick failed");
                }
            }

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = time::sleep(self.interval) => {}
            }
        }

        tracing::debug!("Retrier stopped");
        Ok(())
    }

    /// Process one tick for one queue. Returns how many jobs were moved.
    pub async fn tick(&self, queue: &str) -> Result<usize> {
        let now = current_timestamp();

        let jobs = self
            .backend
            .get_due_retries(queue, now, self.batch_size)
            .await?;

        if jobs.is_empty() {
            return Ok(0);
        }

        tracing::debug!(count = jobs.len(), queue = %queue, "Moving retry jobs to queue");

        let moved = jobs.len();
        for job_json in jobs {
            self.backend.move_retry_to_queue(queue, &job_json).await?;
        }

        Ok(moved)
    }
}
