//! Reaper component for stalled job recovery.
//!
//! A claimed job whose lease stops being renewed belongs to a worker that
//! crashed or abandoned it at shutdown. The reaper periodically returns such
//! jobs to the head of their queue so another claim picks them up.

use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::error::Result;
use crate::job::current_timestamp_millis;

/// Returns stalled jobs from each queue's active list to its waiting list.
pub struct Reaper<B: Backend> {
    backend: B,
    queues: Vec<String>,
    interval: Duration,
    stall_timeout: Duration,
    batch_size: usize,
    stop: CancellationToken,
}

impl<B: Backend> Reaper<B> {
    /// Create a new reaper.
    pub fn new(
        backend: B,
        queues: Vec<String>,
        interval: Duration,
        stall_timeout: Duration,
        batch_size: usize,
        stop: CancellationToken,
    ) -> Self {
        Self {
            backend,
            queues,
            interval,
            stall_timeout,
            batch_size,
            stop,
        }
    }

    /// Run the reaper loop until the stop token is cancelled.
    ///
    /// The first pass runs immediately, so jobs left behind by a previous
    /// process are recovered as soon as their lease has expired.
    pub async fn run(&self) -> Result<()> {
        tracing::debug!(queues = self.queues.len(), "Reaper started");

        loop {
            for queue in &self.queues {
                if let Err(e) = self.tick(queue).await {
                    tracing::error!(queue = %queue, error = %e, "Failed to recover stalled jobs");
                }
            }

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = time::sleep(self.interval) => {}
            }
        }

        tracing::debug!("Reaper stopped");
        Ok(())
    }

    /// Recover stalled jobs for one queue. Returns how many were recovered.
    pub async fn tick(&self, queue: &str) -> Result<usize> {
        let stalled_before = current_timestamp_millis() - self.stall_timeout.as_millis() as i64;

        let recovered = self
            .backend
            .recover_stalled(queue, stalled_before, self.batch_size)
            .await?;

        if recovered > 0 {
            tracing::warn!(queue = %queue, count = recovered, "Recovered stalled jobs");
        }
        Ok(recovered)
    }
}
