//! Configuration types for the worker process.

use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::job::RetryPolicy;

/// Broker address used when `REDIS_URL` is not set.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// How `connect_with_retry` retries an unreachable broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Total connection attempts before giving up.
    pub max_attempts: u32,
    /// Upper bound on a single connection attempt.
    pub connect_timeout: Duration,
    /// Delay after the first failed attempt; doubles after each failure.
    pub initial_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            connect_timeout: Duration::from_secs(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// A single attempt, no backoff.
    pub fn once(connect_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            connect_timeout,
            ..Default::default()
        }
    }

    /// Delay to wait after `failed` consecutive failures.
    pub fn delay_after(&self, failed: u32) -> Duration {
        let exponent = failed.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Configuration for the worker process and its dispatcher.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Broker connection URL.
    pub redis_url: String,
    /// Namespace prefix for backend keys.
    pub namespace: String,
    /// How long a single claim blocks waiting for a job.
    pub fetch_timeout: Duration,
    /// Grace period for in-flight jobs during shutdown.
    pub shutdown_timeout: Duration,
    /// Default per-job timeout; `None` lets handlers run indefinitely.
    pub job_timeout: Option<Duration>,
    /// Default retry policy for queues that do not set their own.
    pub retry: RetryPolicy,
    /// Reconnect policy used by `start()`.
    pub reconnect: ReconnectPolicy,
    /// Interval for the retrier loop.
    pub retrier_interval: Duration,
    /// Batch size for the retrier and the reaper.
    pub batch_size: usize,
    /// How long a claimed job may go without a lease renewal before it is
    /// considered stalled and returned to its queue. Running jobs renew
    /// their lease every third of this.
    pub stall_timeout: Duration,
    /// Interval for the reaper loop.
    pub stall_check_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            namespace: "clanforge".to_string(),
            fetch_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            job_timeout: Some(Duration::from_secs(300)),
            retry: RetryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            retrier_interval: Duration::from_secs(1),
            batch_size: 100,
            stall_timeout: Duration::from_secs(30),
            stall_check_interval: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    /// Create a new builder.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }

    /// Read configuration from the process environment.
    ///
    /// | Variable                       | Field              |
    /// |--------------------------------|--------------------|
    /// | `REDIS_URL`                    | `redis_url`        |
    /// | `WORKER_NAMESPACE`             | `namespace`        |
    /// | `WORKER_SHUTDOWN_TIMEOUT_SECS` | `shutdown_timeout` |
    /// | `WORKER_JOB_TIMEOUT_SECS`      | `job_timeout` (`0` disables) |
    /// | `WORKER_MAX_ATTEMPTS`          | `retry.max_attempts` |
    /// | `WORKER_STALL_TIMEOUT_SECS`    | `stall_timeout`    |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("REDIS_URL").filter(|v| !v.is_empty()) {
            config.redis_url = url;
        }
        if let Some(ns) = lookup("WORKER_NAMESPACE").filter(|v| !v.is_empty()) {
            config.namespace = ns;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "WORKER_SHUTDOWN_TIMEOUT_SECS")? {
            config.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "WORKER_JOB_TIMEOUT_SECS")? {
            config.job_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, "WORKER_MAX_ATTEMPTS")? {
            if attempts == 0 {
                return Err(QueueError::Config(
                    "WORKER_MAX_ATTEMPTS must be at least 1".to_string(),
                ));
            }
            config.retry.max_attempts = attempts;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "WORKER_STALL_TIMEOUT_SECS")? {
            if secs == 0 {
                return Err(QueueError::Config(
                    "WORKER_STALL_TIMEOUT_SECS must be at least 1".to_string(),
                ));
            }
            config.stall_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| QueueError::Config(format!("{} must be a number, got {:?}", key, raw))),
        _ => Ok(None),
    }
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broker URL.
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.config.redis_url = url.into();
        self
    }

    /// Set the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Set the fetch timeout.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Set the default per-job timeout.
    pub fn job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.job_timeout = timeout;
        self
    }

    /// Set the default retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Set the reconnect policy.
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Set the retrier interval.
    pub fn retrier_interval(mut self, interval: Duration) -> Self {
        self.config.retrier_interval = interval;
        self
    }

    /// Set the batch size for the retrier.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the stall timeout.
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.config.stall_timeout = timeout;
        self
    }

    /// Set the reaper interval.
    pub fn stall_check_interval(mut self, interval: Duration) -> Self {
        self.config.stall_check_interval = interval;
        self
    }

    /// Build the WorkerConfig.
    pub fn build(self) -> WorkerConfig {
        self.config
    }
}
