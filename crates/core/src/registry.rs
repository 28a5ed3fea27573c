//! Handler registry.
//!
//! Maps each queue name to its handler, concurrency limit, and per-queue
//! overrides. A [`Registry`] is filled once during startup and then frozen
//! behind an `Arc` for the dispatcher; there is no way to remove a queue.

use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::job::{JobError, JobResult, RetryPolicy};
use crate::payload::JobPayload;

/// Type-erased async handler.
///
/// Receives the raw JSON payload; typed handlers decode it before calling
/// the user function.
pub type BoxedHandler = Arc<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = JobResult> + Send>> + Send + Sync,
>;

/// Declaration of one queue: its name, concurrency budget, and handler.
#[derive(Clone)]
pub struct QueueSpec {
    name: String,
    concurrency: usize,
    handler: BoxedHandler,
    timeout: Option<Option<Duration>>,
    retry: Option<RetryPolicy>,
}

impl QueueSpec {
    /// Declare a queue whose handler takes the raw JSON payload.
    pub fn new<F, Fut>(name: impl Into<String>, concurrency: usize, handler: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let boxed: BoxedHandler = Arc::new(
            move |value: serde_json::Value| -> Pin<Box<dyn Future<Output = JobResult> + Send>> {
                Box::pin(handler(value))
            },
        );
        Self {
            name: name.into(),
            concurrency,
            handler: boxed,
            timeout: None,
            retry: None,
        }
    }

    /// Declare the queue for payload type `P`, named `P::QUEUE`.
    ///
    /// Payloads that do not decode as `P` fail the job with a non-retryable
    /// decode error without calling `handler`.
    pub fn typed<P, F, Fut>(concurrency: usize, handler: F) -> Self
    where
        P: JobPayload,
        F: Fn(P) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        Self::new(P::QUEUE, concurrency, move |value| {
            let handler = handler.clone();
            async move {
                let payload: P = decode_payload(P::QUEUE, value)?;
                handler(payload).await
            }
        })
    }

    /// Override the per-job timeout for this queue. `None` disables it.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the retry policy for this queue.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

impl fmt::Debug for QueueSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSpec")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn decode_payload<P: DeserializeOwned>(
    queue: &str,
    value: serde_json::Value,
) -> std::result::Result<P, JobError> {
    serde_json::from_value(value)
        .map_err(|e| JobError::decode(format!("invalid payload for queue {}: {}", queue, e)))
}

/// A registered queue with every default resolved.
#[derive(Clone)]
pub struct QueueRegistration {
    pub name: String,
    pub concurrency: usize,
    pub handler: BoxedHandler,
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl fmt::Debug for QueueRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueRegistration")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Write-once map from queue name to registration.
#[derive(Debug)]
pub struct Registry {
    queues: Vec<QueueRegistration>,
    names: HashSet<String>,
    default_timeout: Option<Duration>,
    default_retry: RetryPolicy,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(None, RetryPolicy::none())
    }
}

impl Registry {
    /// Create an empty registry whose queues inherit the given defaults.
    pub fn new(default_timeout: Option<Duration>, default_retry: RetryPolicy) -> Self {
        Self {
            queues: Vec::new(),
            names: HashSet::new(),
            default_timeout,
            default_retry,
        }
    }

    /// Register a queue with a raw JSON handler.
    pub fn register<F, Fut>(
        &mut self,
        name: impl Into<String>,
        concurrency: usize,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        self.insert(QueueSpec::new(name, concurrency, handler))
    }

    /// Register a declared queue.
    ///
    /// Fails with [`QueueError::DuplicateQueue`] if the name is taken, and
    /// with [`QueueError::Config`] for an empty name or zero concurrency. On
    /// failure the registry is left unchanged.
    pub fn insert(&mut self, spec: QueueSpec) -> Result<()> {
        if spec.name.is_empty() {
            return Err(QueueError::Config("queue name must not be empty".to_string()));
        }
        if spec.concurrency == 0 {
            return Err(QueueError::Config(format!(
                "queue {} must have a concurrency limit of at least 1",
                spec.name
            )));
        }
        if self.names.contains(&spec.name) {
            return Err(QueueError::DuplicateQueue(spec.name));
        }

        self.names.insert(spec.name.clone());
        self.queues.push(QueueRegistration {
            name: spec.name,
            concurrency: spec.concurrency,
            handler: spec.handler,
            timeout: spec.timeout.unwrap_or(self.default_timeout),
            retry: spec.retry.unwrap_or_else(|| self.default_retry.clone()),
        });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&QueueRegistration> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Registered queues, in registration order.
    pub fn queues(&self) -> &[QueueRegistration] {
        &self.queues
    }

    pub fn names(&self) -> Vec<&str> {
        self.queues.iter().map(|q| q.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Sum of every queue's concurrency limit; there is no global cap.
    pub fn total_concurrency(&self) -> usize {
        self.queues.iter().map(|q| q.concurrency).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobErrorKind;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SendEmail {
        to: String,
    }

    impl JobPayload for SendEmail {
        const QUEUE: &'static str = "emails";
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = Registry::default();
        registry.register("emails", 3, |_| async { Ok(()) }).unwrap();
        registry.register("notifications", 5, |_| async { Ok(()) }).unwrap();

        assert!(registry.contains("emails"));
        assert!(!registry.contains("unknown"));
        assert_eq!(registry.get("emails").unwrap().concurrency, 3);
        assert_eq!(registry.names(), vec!["emails", "notifications"]);
        assert_eq!(registry.total_concurrency(), 8);
    }

    #[test]
    fn test_duplicate_queue_leaves_registry_unchanged() {
        let mut registry = Registry::default();
        registry.register("emails", 3, |_| async { Ok(()) }).unwrap();

        let err = registry
            .register("emails", 7, |_| async { Err(JobError::fatal("never")) })
            .unwrap_err();

        assert!(matches!(err, QueueError::DuplicateQueue(ref name) if name == "emails"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("emails").unwrap().concurrency, 3);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut registry = Registry::default();
        let err = registry.register("emails", 0, |_| async { Ok(()) }).unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut registry = Registry::default();
        let err = registry.register("", 1, |_| async { Ok(()) }).unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
    }

    #[test]
    fn test_defaults_and_overrides() {
        let mut registry = Registry::new(Some(Duration::from_secs(300)), RetryPolicy::default());
        registry
            .insert(QueueSpec::new("emails", 3, |_| async { Ok(()) }))
            .unwrap();
        registry
            .insert(
                QueueSpec::new("vod-processing", 2, |_| async { Ok(()) })
                    .timeout(None)
                    .retry(RetryPolicy::none()),
            )
            .unwrap();

        let emails = registry.get("emails").unwrap();
        assert_eq!(emails.timeout, Some(Duration::from_secs(300)));
        assert_eq!(emails.retry.max_attempts, 3);

        let vods = registry.get("vod-processing").unwrap();
        assert_eq!(vods.timeout, None);
        assert_eq!(vods.retry.max_attempts, 1);
    }

    #[tokio::test]
    async fn test_typed_spec_uses_payload_queue_and_decodes() {
        let spec = QueueSpec::typed::<SendEmail, _, _>(3, |job: SendEmail| async move {
            if job.to.contains('@') {
                Ok(())
            } else {
                Err(JobError::fatal("bad address"))
            }
        });
        assert_eq!(spec.name(), "emails");
        assert_eq!(spec.concurrency(), 3);

        let mut registry = Registry::default();
        registry.insert(spec).unwrap();
        let handler = registry.get("emails").unwrap().handler.clone();

        assert!(handler(json!({"to": "a@example.com"})).await.is_ok());

        let err = handler(json!({"to": "nobody"})).await.unwrap_err();
        assert_eq!(err.kind, JobErrorKind::Handler);

        let err = handler(json!({"recipient": "a@example.com"})).await.unwrap_err();
        assert_eq!(err.kind, JobErrorKind::Decode);
        assert!(!err.retryable);
        assert!(err.message.contains("emails"));
    }
}
