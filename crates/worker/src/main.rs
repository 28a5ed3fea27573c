//! ClanForge background worker.
//!
//! Consumes the `vod-processing`, `notifications`, `emails` and
//! `discord-integration` queues from Redis until SIGINT or SIGTERM.
//!
//! Exit codes: `0` after shutdown (even if disconnecting failed), `1` if the
//! worker could not start.

mod jobs;
mod queues;
mod services;
mod signals;

use std::process::ExitCode;

use forge_queue::{Backend, WorkerConfig, WorkerProcess};
use forge_queue_redis::RedisBackend;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::services::Services;
use crate::signals::{ShutdownSignals, ShutdownSource};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to start worker: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut signals = match ShutdownSignals::install() {
        Ok(signals) => signals,
        Err(e) => {
            tracing::error!("Failed to install signal handlers: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let backend = RedisBackend::new(config.redis_url.clone(), config.namespace.clone());
    let mut worker = queues::declare(WorkerProcess::new(backend, config), Services::logging());

    run(&mut worker, &mut signals).await
}

/// Start `worker`, wait for a shutdown request, then stop it.
///
/// A request during startup abandons the start. Requests while stopping are
/// logged and ignored.
async fn run<B, S>(worker: &mut WorkerProcess<B>, signals: &mut S) -> ExitCode
where
    B: Backend + Clone + 'static,
    S: ShutdownSource,
{
    let interrupted = async {
        let signal = signals.recv().await;
        tracing::info!("{} received during startup, shutting down", signal);
    };
    match worker.start_or_cancel(interrupted).await {
        Ok(true) => {}
        Ok(false) => return ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Failed to start worker: {}", e);
            return ExitCode::FAILURE;
        }
    }
    tracing::info!("Connected to Redis");
    tracing::info!("All job queues initialized");
    tracing::info!("ClanForge Worker started successfully");

    let signal = signals.recv().await;
    tracing::info!("{} received, shutting down gracefully", signal);

    let stop = worker.stop();
    tokio::pin!(stop);
    let result = loop {
        tokio::select! {
            result = &mut stop => break result,
            signal = signals.recv() => {
                tracing::warn!("{} received while stopping, already shutting down", signal);
            }
        }
    };

    // A failed stop is logged but still exits 0.
    match result {
        Ok(()) => tracing::info!("Worker stopped gracefully"),
        Err(e) => tracing::error!("Error stopping worker: {}", e),
    }
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use forge_queue::{
        Client, MemoryBackend, QueueSpec, ReconnectPolicy, WorkerConfig, WorkerState,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Delivers whatever signal names are sent on the channel.
    struct ScriptedSignals(mpsc::UnboundedReceiver<&'static str>);

    #[async_trait]
    impl ShutdownSource for ScriptedSignals {
        async fn recv(&mut self) -> &'static str {
            match self.0.recv().await {
                Some(signal) => signal,
                None => std::future::pending().await,
            }
        }
    }

    fn scripted() -> (mpsc::UnboundedSender<&'static str>, ScriptedSignals) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, ScriptedSignals(rx))
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig::builder()
            .fetch_timeout(Duration::from_millis(20))
            .shutdown_timeout(Duration::from_secs(5))
            .reconnect(ReconnectPolicy::once(Duration::from_millis(100)))
            .build()
    }

    fn noop(name: &str) -> QueueSpec {
        QueueSpec::new(name, 1, |_| async { Ok(()) })
    }

    fn send_later(tx: &mpsc::UnboundedSender<&'static str>, signal: &'static str) {
        let tx = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(signal);
        });
    }

    #[tokio::test]
    async fn test_signal_waits_for_active_jobs_then_exits_zero() {
        let backend = MemoryBackend::new();
        let (tx, mut signals) = scripted();
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let spec = {
            let started = started.clone();
            let finished = finished.clone();
            QueueSpec::new("vod-processing", 2, move |_| {
                let started = started.clone();
                let finished = finished.clone();
                let tx = tx.clone();
                async move {
                    // Once both jobs are active, SIGTERM then a second SIGINT.
                    if started.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                        let _ = tx.send("SIGTERM");
                        let _ = tx.send("SIGINT");
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        let client = Client::with_backend(backend.clone());
        for vod in ["vod_1", "vod_2"] {
            client
                .enqueue_to("vod-processing", json!({ "vodId": vod }))
                .await
                .unwrap();
        }

        let mut worker = WorkerProcess::new(backend.clone(), test_config()).queue(spec);
        let code = tokio::time::timeout(Duration::from_secs(5), run(&mut worker, &mut signals))
            .await
            .expect("worker did not shut down");

        assert_eq!(code, ExitCode::SUCCESS);
        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(!backend.is_connected());
        assert_eq!(client.stats("vod-processing").await.unwrap().completed, 2);
        // The second signal was consumed while stopping, not acted on.
        assert!(signals.0.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_disconnect_still_exits_zero() {
        let backend = MemoryBackend::new();
        backend.set_fail_disconnect(true);
        let (tx, mut signals) = scripted();

        let mut worker = WorkerProcess::new(backend.clone(), test_config()).queue(noop("emails"));
        send_later(&tx, "SIGTERM");
        let code = tokio::time::timeout(Duration::from_secs(5), run(&mut worker, &mut signals))
            .await
            .expect("worker did not shut down");

        assert_eq!(code, ExitCode::SUCCESS);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_startup_failure_exits_one() {
        let backend = MemoryBackend::unreachable();
        let (_tx, mut signals) = scripted();

        let mut worker = WorkerProcess::new(backend, test_config()).queue(noop("emails"));
        let code = run(&mut worker, &mut signals).await;

        assert_eq!(code, ExitCode::FAILURE);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_signal_during_startup_stops_without_waiting_for_retries() {
        let backend = MemoryBackend::unreachable();
        let (tx, mut signals) = scripted();
        let config = WorkerConfig::builder()
            .reconnect(ReconnectPolicy {
                max_attempts: 10,
                connect_timeout: Duration::from_millis(50),
                initial_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(5),
            })
            .build();

        let mut worker = WorkerProcess::new(backend.clone(), config).queue(noop("emails"));
        send_later(&tx, "SIGTERM");
        let code = tokio::time::timeout(Duration::from_secs(2), run(&mut worker, &mut signals))
            .await
            .expect("startup was not interrupted");

        assert_eq!(code, ExitCode::SUCCESS);
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(backend.connect_attempts(), 1);
    }
}
