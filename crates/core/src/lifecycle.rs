//! Worker process lifecycle.
//!
//! [`WorkerProcess`] owns the process-wide state machine:
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//! ```
//!
//! `start` and `stop` take `&mut self`, so a second `stop` cannot run while
//! the first is still draining.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::backend::Backend;
use crate::config::WorkerConfig;
use crate::connection::connect_with_retry;
use crate::dispatcher::{Dispatcher, DrainReport};
use crate::error::{QueueError, Result};
use crate::events::{JobEvent, EVENT_CHANNEL_CAPACITY};
use crate::registry::{QueueSpec, Registry};

/// Lifecycle state of a [`WorkerProcess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// A worker process: one backend, a set of declared queues, and the
/// dispatcher that runs them.
pub struct WorkerProcess<B: Backend + Clone + 'static> {
    config: WorkerConfig,
    backend: B,
    queues: Vec<QueueSpec>,
    registry: Option<Arc<Registry>>,
    dispatcher: Option<Dispatcher<B>>,
    state: WorkerState,
    events: broadcast::Sender<JobEvent>,
    worker_id: String,
}

impl<B: Backend + Clone + 'static> WorkerProcess<B> {
    /// Create a stopped worker process.
    pub fn new(backend: B, config: WorkerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            backend,
            queues: Vec::new(),
            registry: None,
            dispatcher: None,
            state: WorkerState::Stopped,
            events,
            worker_id: generate_worker_id(),
        }
    }

    /// Declare a queue. Declarations are validated and registered on `start()`.
    pub fn queue(mut self, spec: QueueSpec) -> Self {
        self.queues.push(spec);
        self
    }

    /// Subscribe to job outcome events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Names of the queues registered by the last successful `start()`.
    pub fn registered_queues(&self) -> Vec<String> {
        self.registry
            .as_ref()
            .map(|r| r.names().into_iter().map(String::from).collect())
            .unwrap_or_default()
    }

    /// Jobs currently in flight across all queues.
    pub fn in_flight(&self) -> usize {
        self.dispatcher.as_ref().map(|d| d.in_flight()).unwrap_or(0)
    }

    /// Jobs currently active for `queue`.
    pub fn active(&self, queue: &str) -> usize {
        self.dispatcher.as_ref().map(|d| d.active(queue)).unwrap_or(0)
    }

    /// Connect, register every declared queue, and start consuming.
    ///
    /// Only valid from `Stopped`. On failure the process is back in
    /// `Stopped` with nothing registered; callers should treat the error as
    /// fatal.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != WorkerState::Stopped {
            return Err(QueueError::InvalidState {
                state: self.state,
                action: "start",
            });
        }

        self.state = WorkerState::Starting;
        tracing::info!(worker_id = %self.worker_id, "Worker starting");

        if let Err(e) = connect_with_retry(&self.backend, &self.config.reconnect).await {
            self.state = WorkerState::Stopped;
            tracing::error!(error = %e, "Failed to connect to backend");
            return Err(e);
        }

        let registry = match self.build_registry().await {
            Ok(registry) => Arc::new(registry),
            Err(e) => {
                tracing::error!(error = %e, "Failed to register queues");
                self.unwind_start().await;
                return Err(e);
            }
        };

        let mut dispatcher = Dispatcher::new(
            self.backend.clone(),
            Arc::clone(&registry),
            &self.config,
            self.events.clone(),
        );
        if let Err(e) = dispatcher.start() {
            tracing::error!(error = %e, "Failed to start dispatcher");
            self.unwind_start().await;
            return Err(e);
        }

        for queue in registry.queues() {
            tracing::info!(queue = %queue.name, concurrency = queue.concurrency, "Registered queue");
        }

        self.registry = Some(registry);
        self.dispatcher = Some(dispatcher);
        self.state = WorkerState::Running;

        tracing::info!(
            worker_id = %self.worker_id,
            namespace = %self.config.namespace,
            queues = self.queues.len(),
            "Worker started"
        );
        Ok(())
    }

    /// Start, unless `shutdown` resolves first.
    ///
    /// Returns `Ok(true)` once running and `Ok(false)` if startup was
    /// interrupted, in which case the process is back in `Stopped` and
    /// disconnected. Startup failures are returned as from [`start`](Self::start).
    pub async fn start_or_cancel<S>(&mut self, shutdown: S) -> Result<bool>
    where
        S: Future + Send,
    {
        let started = tokio::select! {
            result = self.start() => Some(result),
            _ = shutdown => None,
        };

        match started {
            Some(result) => result.map(|()| true),
            None => {
                tracing::info!("Startup interrupted by shutdown request");
                if self.state == WorkerState::Starting {
                    self.unwind_start().await;
                }
                Ok(false)
            }
        }
    }

    /// Undo a partial start: disconnect and return to `Stopped`.
    async fn unwind_start(&mut self) {
        if let Err(e) = self.backend.disconnect().await {
            tracing::warn!(error = %e, "Failed to disconnect after aborted startup");
        }
        self.state = WorkerState::Stopped;
    }

    /// Validate the declared queues and record them with the backend.
    async fn build_registry(&self) -> Result<Registry> {
        let mut registry = Registry::new(self.config.job_timeout, self.config.retry.clone());
        for spec in &self.queues {
            registry.insert(spec.clone())?;
        }
        for queue in registry.queues() {
            self.backend
                .register_queue(&queue.name, queue.concurrency)
                .await?;
        }
        Ok(registry)
    }

    /// Stop claiming, drain in-flight jobs up to the grace timeout, and
    /// disconnect.
    ///
    /// A no-op unless `Running`. The process always ends in `Stopped`; a
    /// failed disconnect is reported as [`QueueError::Shutdown`].
    pub async fn stop(&mut self) -> Result<()> {
        if self.state != WorkerState::Running {
            tracing::debug!(state = %self.state, "Stop requested while not running, ignoring");
            return Ok(());
        }

        self.state = WorkerState::Stopping;
        tracing::info!("Shutdown requested, draining...");

        let report = match self.dispatcher.take() {
            Some(mut dispatcher) => dispatcher.shutdown(self.config.shutdown_timeout).await,
            None => DrainReport::default(),
        };

        let result = self
            .backend
            .disconnect()
            .await
            .map_err(|e| QueueError::Shutdown(e.to_string()));

        self.state = WorkerState::Stopped;

        match &result {
            Ok(()) => tracing::info!(
                worker_id = %self.worker_id,
                drained = report.drained,
                abandoned = report.abandoned,
                "Worker stopped"
            ),
            Err(e) => tracing::error!(error = %e, "Worker stopped with errors"),
        }
        result
    }

    /// Start, run until `shutdown` resolves, then stop.
    pub async fn run_until<S>(&mut self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await
    }
}

/// Generate a worker identifier from the hostname and process id.
pub fn generate_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}-{}", host, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::job::Job;
    use crate::memory::MemoryBackend;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_config() -> WorkerConfig {
        WorkerConfig::builder()
            .fetch_timeout(Duration::from_millis(20))
            .shutdown_timeout(Duration::from_secs(5))
            .reconnect(ReconnectPolicy {
                max_attempts: 2,
                connect_timeout: Duration::from_millis(50),
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            })
            .build()
    }

    fn noop(name: &str, concurrency: usize) -> QueueSpec {
        QueueSpec::new(name, concurrency, |_| async { Ok(()) })
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let backend = MemoryBackend::new();
        let mut worker = WorkerProcess::new(backend.clone(), test_config())
            .queue(noop("emails", 3))
            .queue(noop("notifications", 5));

        assert_eq!(worker.state(), WorkerState::Stopped);
        worker.start().await.unwrap();

        assert_eq!(worker.state(), WorkerState::Running);
        assert!(backend.is_connected());
        assert_eq!(worker.registered_queues(), vec!["emails", "notifications"]);
        assert_eq!(
            backend.registered_queues().await.unwrap(),
            vec![("emails".to_string(), 3), ("notifications".to_string(), 5)]
        );

        worker.stop().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(!backend.is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_backend_registers_nothing() {
        let backend = MemoryBackend::unreachable();
        let mut worker = WorkerProcess::new(backend.clone(), test_config()).queue(noop("emails", 3));

        let err = worker.start().await.unwrap_err();

        assert!(matches!(err, QueueError::Connection(_)));
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(worker.registered_queues().is_empty());
        assert!(backend.registered_queues().await.unwrap().is_empty());
        assert_eq!(backend.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_queue_fails_start() {
        let backend = MemoryBackend::new();
        let mut worker = WorkerProcess::new(backend.clone(), test_config())
            .queue(noop("emails", 3))
            .queue(noop("emails", 1));

        let err = worker.start().await.unwrap_err();

        assert!(matches!(err, QueueError::DuplicateQueue(ref q) if q == "emails"));
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(backend.registered_queues().await.unwrap().is_empty());
        assert!(!backend.is_connected());
    }

    #[tokio::test]
    async fn test_start_while_running_is_invalid() {
        let mut worker = WorkerProcess::new(MemoryBackend::new(), test_config()).queue(noop("emails", 1));
        worker.start().await.unwrap();

        let err = worker.start().await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidState {
                state: WorkerState::Running,
                action: "start"
            }
        ));
        assert_eq!(err.to_string(), "Cannot start while worker is running");

        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut worker = WorkerProcess::new(MemoryBackend::new(), test_config()).queue(noop("emails", 1));

        // Never started
        worker.stop().await.unwrap();

        worker.start().await.unwrap();
        worker.stop().await.unwrap();
        worker.stop().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_disconnect_failure_is_shutdown_error() {
        let backend = MemoryBackend::new();
        let mut worker = WorkerProcess::new(backend.clone(), test_config()).queue(noop("emails", 1));
        worker.start().await.unwrap();

        backend.set_fail_disconnect(true);
        let err = worker.stop().await.unwrap_err();

        assert!(matches!(err, QueueError::Shutdown(_)));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_waits_for_active_jobs_then_disconnects() {
        let backend = MemoryBackend::new();
        let finished = Arc::new(AtomicUsize::new(0));

        let spec = {
            let finished = finished.clone();
            QueueSpec::new("vod-processing", 2, move |_| {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        let mut worker = WorkerProcess::new(backend.clone(), test_config()).queue(spec);
        let mut events = worker.subscribe();
        worker.start().await.unwrap();

        for _ in 0..2 {
            let job = Job::new("vod-processing", json!({ "vodId": "v" }));
            backend
                .push_job("vod-processing", &job.to_json().unwrap())
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while worker.in_flight() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(worker.active("vod-processing"), 2);

        worker.stop().await.unwrap();

        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert!(!backend.is_connected());
        for _ in 0..2 {
            assert!(matches!(events.try_recv().unwrap(), JobEvent::Completed { .. }));
        }
    }

    #[tokio::test]
    async fn test_run_until() {
        let backend = MemoryBackend::new();
        let mut worker = WorkerProcess::new(backend.clone(), test_config()).queue(noop("emails", 1));

        worker
            .run_until(tokio::time::sleep(Duration::from_millis(20)))
            .await
            .unwrap();

        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(!backend.is_connected());
    }

    #[tokio::test]
    async fn test_start_or_cancel_starts_normally() {
        let backend = MemoryBackend::new();
        let mut worker = WorkerProcess::new(backend.clone(), test_config()).queue(noop("emails", 1));

        let started = worker
            .start_or_cancel(std::future::pending::<()>())
            .await
            .unwrap();

        assert!(started);
        assert_eq!(worker.state(), WorkerState::Running);
        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_during_connect_retries_stops_immediately() {
        let backend = MemoryBackend::unreachable();
        let config = WorkerConfig::builder()
            .reconnect(ReconnectPolicy {
                max_attempts: 10,
                connect_timeout: Duration::from_millis(50),
                initial_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(5),
            })
            .build();
        let mut worker = WorkerProcess::new(backend.clone(), config).queue(noop("emails", 1));

        let started = tokio::time::timeout(
            Duration::from_secs(2),
            worker.start_or_cancel(tokio::time::sleep(Duration::from_millis(50))),
        )
        .await
        .expect("startup was not interrupted")
        .unwrap();

        assert!(!started);
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(backend.connect_attempts(), 1);
        assert!(backend.registered_queues().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registration_failure_disconnects_even_if_disconnect_fails() {
        let backend = MemoryBackend::new();
        backend.set_fail_disconnect(true);
        let mut worker = WorkerProcess::new(backend.clone(), test_config())
            .queue(noop("emails", 3))
            .queue(noop("emails", 1));

        let err = worker.start().await.unwrap_err();

        assert!(matches!(err, QueueError::DuplicateQueue(_)));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_worker_id_has_pid_suffix() {
        let id = generate_worker_id();
        assert!(id.ends_with(&format!("-{}", std::process::id())));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(WorkerState::Stopping.to_string(), "stopping");
    }
}
