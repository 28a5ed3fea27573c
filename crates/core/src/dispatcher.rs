//! Multi-queue dispatcher.
//!
//! One claim loop per registered queue, each gated by its own semaphore,
//! plus a retrier that promotes due retries and a reaper that recovers
//! stalled jobs. Shutdown is two-phase: stop claiming, then wait for
//! in-flight jobs up to a grace timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::config::WorkerConfig;
use crate::error::{QueueError, Result};
use crate::events::JobEvent;
use crate::reaper::Reaper;
use crate::registry::Registry;
use crate::retrier::Retrier;
use crate::worker::{InFlight, QueueWorker};

/// How long aborted jobs get to unwind after the grace timeout.
const ABORT_SETTLE: Duration = Duration::from_millis(100);

/// Outcome of a dispatcher shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Jobs in flight when shutdown began that reached an outcome.
    pub drained: usize,
    /// Jobs still running when the grace timeout expired. They were aborted
    /// and stay in the backend's active list until a reaper recovers them.
    pub abandoned: usize,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned == 0
    }
}

/// Runs every registered queue against one shared backend.
pub struct Dispatcher<B: Backend + Clone + 'static> {
    backend: B,
    registry: Arc<Registry>,
    events: broadcast::Sender<JobEvent>,
    fetch_timeout: Duration,
    retrier_interval: Duration,
    batch_size: usize,
    stall_timeout: Duration,
    stall_check_interval: Duration,
    in_flight: Arc<InFlight>,
    active: HashMap<String, Arc<AtomicUsize>>,
    drain: CancellationToken,
    abort: CancellationToken,
    stop: CancellationToken,
    claim_loops: JoinSet<()>,
    retrier: Option<JoinHandle<Result<()>>>,
    reaper: Option<JoinHandle<Result<()>>>,
    started: bool,
}

impl<B: Backend + Clone + 'static> Dispatcher<B> {
    /// Create a dispatcher for `registry`. Nothing runs until [`start`](Self::start).
    pub fn new(
        backend: B,
        registry: Arc<Registry>,
        config: &WorkerConfig,
        events: broadcast::Sender<JobEvent>,
    ) -> Self {
        let active = registry
            .queues()
            .iter()
            .map(|q| (q.name.clone(), Arc::new(AtomicUsize::new(0))))
            .collect();

        Self {
            backend,
            registry,
            events,
            fetch_timeout: config.fetch_timeout,
            retrier_interval: config.retrier_interval,
            batch_size: config.batch_size,
            stall_timeout: config.stall_timeout,
            stall_check_interval: config.stall_check_interval,
            in_flight: Arc::new(InFlight::default()),
            active,
            drain: CancellationToken::new(),
            abort: CancellationToken::new(),
            stop: CancellationToken::new(),
            claim_loops: JoinSet::new(),
            retrier: None,
            reaper: None,
            started: false,
        }
    }

    /// Spawn one claim loop per queue, the retrier and the reaper.
    ///
    /// A dispatcher runs once; starting it again is an error.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(QueueError::Config(
                "dispatcher has already been started".to_string(),
            ));
        }
        self.started = true;

        for registration in self.registry.queues() {
            let worker = Arc::new(QueueWorker {
                backend: self.backend.clone(),
                registration: registration.clone(),
                slots: Arc::new(Semaphore::new(registration.concurrency)),
                active: self.active_counter(&registration.name),
                in_flight: Arc::clone(&self.in_flight),
                events: self.events.clone(),
                fetch_timeout: self.fetch_timeout,
                lease_renewal: self.stall_timeout / 3,
                drain: self.drain.clone(),
                abort: self.abort.clone(),
            });
            self.claim_loops.spawn(worker.run());
        }

        let queues: Vec<String> = self.registry.names().into_iter().map(String::from).collect();

        let retrier = Retrier::new(
            self.backend.clone(),
            queues.clone(),
            self.retrier_interval,
            self.batch_size,
            self.stop.clone(),
        );
        self.retrier = Some(tokio::spawn(async move { retrier.run().await }));

        let reaper = Reaper::new(
            self.backend.clone(),
            queues,
            self.stall_check_interval,
            self.stall_timeout,
            self.batch_size,
            self.stop.clone(),
        );
        self.reaper = Some(tokio::spawn(async move { reaper.run().await }));

        tracing::debug!(
            queues = self.registry.len(),
            total_concurrency = self.registry.total_concurrency(),
            "Dispatcher started"
        );
        Ok(())
    }

    fn active_counter(&self, queue: &str) -> Arc<AtomicUsize> {
        self.active
            .get(queue)
            .cloned()
            .unwrap_or_else(|| Arc::new(AtomicUsize::new(0)))
    }

    /// Jobs currently between claim and outcome, across all queues.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    /// Jobs currently active for `queue`; `0` for unknown queues.
    pub fn active(&self, queue: &str) -> usize {
        self.active
            .get(queue)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Check if the dispatcher has stopped claiming.
    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    /// Stop claiming and wait up to `grace` for in-flight jobs.
    ///
    /// Jobs still running at the deadline are aborted and left in the
    /// backend's active list. Calling this twice is harmless; the second
    /// call reports nothing in flight.
    pub async fn shutdown(&mut self, grace: Duration) -> DrainReport {
        let deadline = Instant::now() + grace;
        let pending = self.in_flight.count();

        // Enter draining mode - stop claiming new jobs
        self.drain.cancel();

        // Claim loops can be parked in a blocking claim for up to
        // `fetch_timeout`; a job they pick up is requeued, not run.
        loop {
            match tokio::time::timeout_at(deadline, self.claim_loops.join_next()).await {
                Ok(Some(Err(e))) => tracing::error!(error = %e, "Claim loop panicked"),
                Ok(Some(Ok(()))) => {}
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("Claim loops did not stop before the grace timeout");
                    self.claim_loops.abort_all();
                    break;
                }
            }
        }

        let remaining = self.in_flight.count();
        if remaining > 0 {
            tracing::info!(in_flight = remaining, "Waiting for in-flight jobs to finish");
        }

        let mut abandoned = 0;
        if !self.in_flight.wait_idle_until(deadline).await {
            abandoned = self.in_flight.count();
            tracing::warn!(
                in_flight = abandoned,
                grace_secs = grace.as_secs(),
                "Shutdown timeout reached, abandoning running jobs"
            );
            self.abort.cancel();
            self.in_flight
                .wait_idle_until(Instant::now() + ABORT_SETTLE)
                .await;
        }

        // Stop the retrier and the reaper
        self.stop.cancel();
        for (name, handle) in [("Retrier", self.retrier.take()), ("Reaper", self.reaper.take())] {
            let Some(handle) = handle else { continue };
            match handle.await {
                Ok(Err(e)) => tracing::error!(error = %e, "{} failed", name),
                Err(e) => tracing::error!(error = %e, "{} panicked", name),
                Ok(Ok(())) => {}
            }
        }

        let report = DrainReport {
            drained: pending.saturating_sub(abandoned),
            abandoned,
        };
        tracing::debug!(drained = report.drained, abandoned = report.abandoned, "Dispatcher stopped");
        report
    }
}
