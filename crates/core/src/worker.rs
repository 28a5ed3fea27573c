//! Per-queue claim loop and job execution.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::events::JobEvent;
use crate::job::{current_timestamp, Job, JobError, JobResult, JobState};
use crate::registry::QueueRegistration;

/// Process-wide count of jobs between claim and outcome report.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>, active: &Arc<AtomicUsize>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        active.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            tracker: Arc::clone(self),
            active: Arc::clone(active),
        }
    }

    /// Wait until no job is in flight or `deadline` passes. Returns whether idle.
    pub(crate) async fn wait_idle_until(&self, deadline: Instant) -> bool {
        loop {
            let notified = self.idle.notified();
            if self.count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count() == 0;
            }
        }
    }
}

struct InFlightGuard {
    tracker: Arc<InFlight>,
    active: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.tracker.count.fetch_sub(1, Ordering::SeqCst);
        self.tracker.idle.notify_waiters();
    }
}

/// Claims jobs for one queue and runs them, at most `concurrency` at a time.
pub(crate) struct QueueWorker<B: Backend + Clone + 'static> {
    pub(crate) backend: B,
    pub(crate) registration: QueueRegistration,
    pub(crate) slots: Arc<Semaphore>,
    pub(crate) active: Arc<AtomicUsize>,
    pub(crate) in_flight: Arc<InFlight>,
    pub(crate) events: broadcast::Sender<JobEvent>,
    pub(crate) fetch_timeout: Duration,
    /// How often a running job's lease is renewed.
    pub(crate) lease_renewal: Duration,
    /// Cancelled when the dispatcher stops claiming.
    pub(crate) drain: CancellationToken,
    /// Cancelled when the grace timeout expires; running handlers are abandoned.
    pub(crate) abort: CancellationToken,
}

impl<B: Backend + Clone + 'static> QueueWorker<B> {
    fn queue(&self) -> &str {
        &self.registration.name
    }

    pub(crate) async fn run(self: Arc<Self>) {
        tracing::debug!(queue = %self.queue(), concurrency = self.registration.concurrency, "Queue worker started");

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.drain.cancelled() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // The claim is not raced against `drain`: dropping a blocking
            // claim mid-flight could strand a job in the backend's active
            // list. It is bounded by `fetch_timeout` instead.
            match self.backend.claim_job(self.queue(), self.fetch_timeout).await {
                Ok(Some(job_json)) => {
                    if self.drain.is_cancelled() {
                        self.release_unstarted(&job_json).await;
                        break;
                    }
                    self.spawn_job(job_json, permit);
                }
                Ok(None) => {
                    // No job available, continue waiting
                }
                Err(e) => {
                    tracing::error!(queue = %self.queue(), error = %e, "Failed to claim job");
                    drop(permit);
                    tokio::select! {
                        _ = self.drain.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        tracing::debug!(queue = %self.queue(), "Queue worker stopped claiming");
    }

    /// Hand a job claimed after draining began back to the waiting list.
    async fn release_unstarted(&self, job_json: &str) {
        tracing::debug!(queue = %self.queue(), "Claimed job while draining, re-queuing");
        if let Err(e) = self.backend.requeue_job(self.queue(), job_json).await {
            tracing::error!(queue = %self.queue(), error = %e, "Failed to re-queue job during drain");
        }
    }

    fn spawn_job(self: &Arc<Self>, job_json: String, permit: OwnedSemaphorePermit) {
        // Counted before spawning so shutdown never misses a claimed job.
        let guard = self.in_flight.enter(&self.active);
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            worker.process(job_json).await;
        });
    }

    async fn process(&self, claimed_json: String) {
        let mut job = match Job::from_json(&claimed_json) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(queue = %self.queue(), error = %e, "Failed to parse job, moving to dead letter list");
                if let Err(e) = self
                    .backend
                    .fail_job(self.queue(), &claimed_json, &claimed_json)
                    .await
                {
                    tracing::error!(queue = %self.queue(), error = %e, "Failed to dead-letter unparseable job");
                }
                return;
            }
        };

        job.attempts += 1;
        job.state = JobState::Active;

        tracing::debug!(
            queue = %self.queue(),
            job_id = %job.id,
            attempt = job.attempts,
            "Processing job"
        );

        let Some(result) = self.run_handler(job.payload.clone(), &claimed_json).await else {
            tracing::warn!(
                queue = %self.queue(),
                job_id = %job.id,
                "Job abandoned at shutdown, left in active list until its lease expires"
            );
            return;
        };

        match result {
            Ok(()) => self.report_completed(&mut job, &claimed_json).await,
            Err(err) => self.report_failure(&mut job, &claimed_json, err).await,
        }
    }

    /// Run the handler in its own task, bounded by the queue timeout, and
    /// keep the job's lease alive while it runs.
    ///
    /// Returns `None` if the job was abandoned because the grace timeout expired.
    async fn run_handler(&self, payload: serde_json::Value, claimed_json: &str) -> Option<JobResult> {
        let mut task = tokio::spawn((self.registration.handler)(payload));
        let limit = self.registration.timeout;
        let deadline = sleep_for(limit);
        tokio::pin!(deadline);

        let every = self.lease_renewal.max(Duration::from_millis(1));
        let mut renew = tokio::time::interval_at(Instant::now() + every, every);
        renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                joined = &mut task => return Some(match joined {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(JobError::panicked(panic_message(e.into_panic()))),
                    Err(e) => Err(JobError::panicked(e.to_string())),
                }),
                _ = &mut deadline => {
                    task.abort();
                    return Some(Err(JobError::timeout(limit.unwrap_or_default())));
                }
                _ = self.abort.cancelled() => {
                    task.abort();
                    return None;
                }
                _ = renew.tick() => {
                    if let Err(e) = self.backend.renew_lease(self.queue(), claimed_json).await {
                        tracing::warn!(queue = %self.queue(), error = %e, "Failed to renew job lease");
                    }
                }
            }
        }
    }

    async fn report_completed(&self, job: &mut Job, claimed_json: &str) {
        job.state = JobState::Completed;

        if let Err(e) = self.backend.complete_job(self.queue(), claimed_json).await {
            tracing::error!(queue = %self.queue(), job_id = %job.id, error = %e, "Failed to mark job completed");
        }

        tracing::debug!(queue = %self.queue(), job_id = %job.id, "Job completed successfully");
        self.emit(JobEvent::Completed {
            queue: self.queue().to_string(),
            job_id: job.id.clone(),
        });
    }

    async fn report_failure(&self, job: &mut Job, claimed_json: &str, err: JobError) {
        job.last_error = Some(err.message.clone());
        let policy = &self.registration.retry;

        if err.retryable && policy.can_retry(job.attempts) {
            job.state = JobState::Waiting;
            let delay = policy.delay_for(job.attempts);
            let retry_at = current_timestamp() + whole_seconds(delay);

            match job.to_json() {
                Ok(updated) => {
                    if let Err(e) = self
                        .backend
                        .retry_job(self.queue(), claimed_json, &updated, retry_at)
                        .await
                    {
                        tracing::error!(queue = %self.queue(), job_id = %job.id, error = %e, "Failed to schedule retry");
                    }
                }
                Err(e) => {
                    tracing::error!(queue = %self.queue(), job_id = %job.id, error = %e, "Failed to serialize job for retry")
                }
            }

            tracing::debug!(
                queue = %self.queue(),
                job_id = %job.id,
                attempt = job.attempts,
                retry_at,
                error = %err,
                "Job scheduled for retry"
            );
            self.emit(JobEvent::Retrying {
                queue: self.queue().to_string(),
                job_id: job.id.clone(),
                attempt: job.attempts,
                error: err.message,
                retry_at,
            });
        } else {
            job.state = JobState::Failed;
            let updated = job.to_json().unwrap_or_else(|_| claimed_json.to_string());

            if let Err(e) = self.backend.fail_job(self.queue(), claimed_json, &updated).await {
                tracing::error!(queue = %self.queue(), job_id = %job.id, error = %e, "Failed to mark job failed");
            }

            tracing::warn!(
                queue = %self.queue(),
                job_id = %job.id,
                attempts = job.attempts,
                error = %err,
                "Job failed, moved to dead letter list"
            );
            self.emit(JobEvent::Failed {
                queue: self.queue().to_string(),
                job_id: job.id.clone(),
                attempts: job.attempts,
                kind: err.kind,
                error: err.message,
            });
        }
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn sleep_for(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

/// Round up so a sub-second backoff still lands strictly in the future
/// relative to the second it was scheduled in, never in the past.
fn whole_seconds(delay: Duration) -> i64 {
    let secs = delay.as_secs() as i64;
    if delay.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
