//! In-process backend.
//!
//! `MemoryBackend` keeps every queue in a mutex-protected map and wakes
//! blocked claims through a [`Notify`]. It is what the test suites run on and
//! is handy for running the worker locally without a broker.
//!
//! Connection state is tracked so lifecycle code can be exercised (including
//! unreachable brokers and failing disconnects), but queue data stays
//! readable and writable regardless, so a test producer can share the same
//! backend value with a worker that has not started yet.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use crate::backend::{Backend, QueueStats};
use crate::error::{QueueError, Result};
use crate::job::current_timestamp_millis;

#[derive(Debug, Default)]
struct MemoryQueue {
    waiting: VecDeque<String>,
    active: Vec<String>,
    /// Last lease renewal of each active job, in Unix milliseconds.
    leases: HashMap<String, i64>,
    retry: Vec<(i64, String)>,
    dead: Vec<String>,
    completed: usize,
}

impl MemoryQueue {
    fn take_active(&mut self, claimed_json: &str) -> bool {
        match self.active.iter().position(|j| j == claimed_json) {
            Some(idx) => {
                self.active.remove(idx);
                self.leases.remove(claimed_json);
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct Inner {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    registered: Mutex<Vec<(String, usize)>>,
    notify: Notify,
    connected: AtomicBool,
    unreachable: bool,
    failing_connects: AtomicU32,
    connect_attempts: AtomicU32,
    fail_disconnect: AtomicBool,
}

/// In-memory [`Backend`] implementation. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose `connect()` always fails.
    pub fn unreachable() -> Self {
        Self {
            inner: Arc::new(Inner {
                unreachable: true,
                ..Default::default()
            }),
        }
    }

    /// A backend whose first `failures` connection attempts fail.
    pub fn failing_connects(failures: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                failing_connects: AtomicU32::new(failures),
                ..Default::default()
            }),
        }
    }

    /// Make subsequent `disconnect()` calls fail.
    pub fn set_fail_disconnect(&self, fail: bool) {
        self.inner.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Number of times `connect()` has been called.
    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn connect(&self) -> Result<()> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if self.inner.unreachable {
            return Err(QueueError::Connection(
                "memory backend is unreachable".to_string(),
            ));
        }

        let remaining = self.inner.failing_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner
                .failing_connects
                .store(remaining - 1, Ordering::SeqCst);
            return Err(QueueError::Connection(format!(
                "connection refused ({} failures left)",
                remaining - 1
            )));
        }

        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.inner.fail_disconnect.load(Ordering::SeqCst) {
            return Err(QueueError::Backend("disconnect failed".to_string()));
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn register_queue(&self, queue: &str, concurrency: usize) -> Result<()> {
        let mut registered = self.inner.registered.lock().await;
        match registered.iter_mut().find(|(name, _)| name == queue) {
            Some(entry) => entry.1 = concurrency,
            None => registered.push((queue.to_string(), concurrency)),
        }
        Ok(())
    }

    async fn registered_queues(&self) -> Result<Vec<(String, usize)>> {
        Ok(self.inner.registered.lock().await.clone())
    }

    async fn push_job(&self, queue: &str, job_json: &str) -> Result<()> {
        let mut queues = self.inner.queues.lock().await;
        queues
            .entry(queue.to_string())
            .or_default()
            .waiting
            .push_back(job_json.to_string());
        drop(queues);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn claim_job(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Created before the check so a push between the check and the
            // wait still wakes us.
            let notified = self.inner.notify.notified();

            {
                let mut queues = self.inner.queues.lock().await;
                let q = queues.entry(queue.to_string()).or_default();
                if let Some(job) = q.waiting.pop_front() {
                    q.leases.insert(job.clone(), current_timestamp_millis());
                    q.active.push(job.clone());
                    return Ok(Some(job));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn requeue_job(&self, queue: &str, claimed_json: &str) -> Result<()> {
        let mut queues = self.inner.queues.lock().await;
        let q = queues.entry(queue.to_string()).or_default();
        q.take_active(claimed_json);
        q.waiting.push_front(claimed_json.to_string());
        drop(queues);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn complete_job(&self, queue: &str, claimed_json: &str) -> Result<()> {
        let mut queues = self.inner.queues.lock().await;
        let q = queues.entry(queue.to_string()).or_default();
        q.take_active(claimed_json);
        q.completed += 1;
        Ok(())
    }

    async fn retry_job(
        &self,
        queue: &str,
        claimed_json: &str,
        updated_json: &str,
        retry_at: i64,
    ) -> Result<()> {
        let mut queues = self.inner.queues.lock().await;
        let q = queues.entry(queue.to_string()).or_default();
        q.take_active(claimed_json);
        q.retry.push((retry_at, updated_json.to_string()));
        Ok(())
    }

    async fn fail_job(&self, queue: &str, claimed_json: &str, updated_json: &str) -> Result<()> {
        let mut queues = self.inner.queues.lock().await;
        let q = queues.entry(queue.to_string()).or_default();
        q.take_active(claimed_json);
        q.dead.insert(0, updated_json.to_string());
        Ok(())
    }

    async fn renew_lease(&self, queue: &str, claimed_json: &str) -> Result<()> {
        let mut queues = self.inner.queues.lock().await;
        if let Some(lease) = queues
            .get_mut(queue)
            .and_then(|q| q.leases.get_mut(claimed_json))
        {
            *lease = current_timestamp_millis();
        }
        Ok(())
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        stalled_before: i64,
        limit: usize,
    ) -> Result<usize> {
        let mut queues = self.inner.queues.lock().await;
        let Some(q) = queues.get_mut(queue) else {
            return Ok(0);
        };

        let mut stalled: Vec<(i64, String)> = q
            .leases
            .iter()
            .filter(|(_, at)| **at < stalled_before)
            .map(|(job, at)| (*at, job.clone()))
            .collect();
        stalled.sort();
        stalled.truncate(limit);

        // Oldest lease ends up at the head.
        for (_, job) in stalled.iter().rev() {
            q.take_active(job);
            q.waiting.push_front(job.clone());
        }
        drop(queues);

        if !stalled.is_empty() {
            self.inner.notify.notify_waiters();
        }
        Ok(stalled.len())
    }

    async fn get_due_retries(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<String>> {
        let queues = self.inner.queues.lock().await;
        let Some(q) = queues.get(queue) else {
            return Ok(Vec::new());
        };

        let mut due: Vec<&(i64, String)> = q.retry.iter().filter(|(at, _)| *at <= now).collect();
        due.sort_by_key(|(at, _)| *at);
        Ok(due.into_iter().take(limit).map(|(_, j)| j.clone()).collect())
    }

    async fn move_retry_to_queue(&self, queue: &str, job_json: &str) -> Result<()> {
        let mut queues = self.inner.queues.lock().await;
        let q = queues.entry(queue.to_string()).or_default();
        if let Some(idx) = q.retry.iter().position(|(_, j)| j == job_json) {
            q.retry.remove(idx);
            q.waiting.push_back(job_json.to_string());
        }
        drop(queues);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        let queues = self.inner.queues.lock().await;
        Ok(queues
            .get(queue)
            .map(|q| QueueStats {
                waiting: q.waiting.len(),
                active: q.active.len(),
                retrying: q.retry.len(),
                completed: q.completed,
                failed: q.dead.len(),
            })
            .unwrap_or_default())
    }

    async fn list_dead(&self, queue: &str, limit: usize) -> Result<Vec<String>> {
        let queues = self.inner.queues.lock().await;
        Ok(queues
            .get(queue)
            .map(|q| q.dead.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_is_fifo() {
        let backend = MemoryBackend::new();
        backend.push_job("emails", "first").await.unwrap();
        backend.push_job("emails", "second").await.unwrap();

        let a = backend.claim_job("emails", Duration::from_millis(10)).await.unwrap();
        let b = backend.claim_job("emails", Duration::from_millis(10)).await.unwrap();
        assert_eq!(a.as_deref(), Some("first"));
        assert_eq!(b.as_deref(), Some("second"));

        let stats = backend.queue_stats("emails").await.unwrap();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.active, 2);
    }

    #[tokio::test]
    async fn test_claim_times_out_on_empty_queue() {
        let backend = MemoryBackend::new();
        let claimed = backend
            .claim_job("emails", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_blocked_claim_wakes_on_push() {
        let backend = MemoryBackend::new();
        let consumer = backend.clone();
        let handle =
            tokio::spawn(async move { consumer.claim_job("emails", Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.push_job("emails", "late").await.unwrap();

        let claimed = handle.await.unwrap().unwrap();
        assert_eq!(claimed.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let backend = MemoryBackend::new();
        backend.push_job("emails", "e1").await.unwrap();

        let claimed = backend
            .claim_job("notifications", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(claimed.is_none());
        assert_eq!(backend.queue_stats("emails").await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_requeue_goes_to_head() {
        let backend = MemoryBackend::new();
        backend.push_job("emails", "a").await.unwrap();
        backend.push_job("emails", "b").await.unwrap();

        let a = backend
            .claim_job("emails", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        backend.requeue_job("emails", &a).await.unwrap();

        let again = backend.claim_job("emails", Duration::from_millis(10)).await.unwrap();
        assert_eq!(again.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_outcomes_update_stats() {
        let backend = MemoryBackend::new();
        for job in ["ok", "retry", "dead"] {
            backend.push_job("q", job).await.unwrap();
        }
        for _ in 0..3 {
            backend.claim_job("q", Duration::from_millis(10)).await.unwrap();
        }

        backend.complete_job("q", "ok").await.unwrap();
        backend.retry_job("q", "retry", "retry-2", 100).await.unwrap();
        backend.fail_job("q", "dead", "dead-final").await.unwrap();

        let stats = backend.queue_stats("q").await.unwrap();
        assert_eq!(
            stats,
            QueueStats {
                waiting: 0,
                active: 0,
                retrying: 1,
                completed: 1,
                failed: 1,
            }
        );
        assert_eq!(backend.list_dead("q", 10).await.unwrap(), vec!["dead-final"]);
    }

    #[tokio::test]
    async fn test_due_retries_move_back_to_waiting() {
        let backend = MemoryBackend::new();
        backend.retry_job("q", "", "later", 200).await.unwrap();
        backend.retry_job("q", "", "sooner", 100).await.unwrap();

        assert!(backend.get_due_retries("q", 50, 10).await.unwrap().is_empty());

        let due = backend.get_due_retries("q", 150, 10).await.unwrap();
        assert_eq!(due, vec!["sooner"]);

        backend.move_retry_to_queue("q", "sooner").await.unwrap();
        let stats = backend.queue_stats("q").await.unwrap();
        assert_eq!(stats.retrying, 1);
        assert_eq!(stats.waiting, 1);
    }

    #[tokio::test]
    async fn test_recover_stalled_returns_jobs_to_head() {
        let backend = MemoryBackend::new();
        for job in ["stuck", "next"] {
            backend.push_job("q", job).await.unwrap();
        }
        backend.claim_job("q", Duration::from_millis(10)).await.unwrap();

        // Lease is fresh
        let cutoff = current_timestamp_millis() - 60_000;
        assert_eq!(backend.recover_stalled("q", cutoff, 10).await.unwrap(), 0);

        let cutoff = current_timestamp_millis() + 1;
        assert_eq!(backend.recover_stalled("q", cutoff, 10).await.unwrap(), 1);

        let stats = backend.queue_stats("q").await.unwrap();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.waiting, 2);
        let again = backend.claim_job("q", Duration::from_millis(10)).await.unwrap();
        assert_eq!(again.as_deref(), Some("stuck"));
    }

    #[tokio::test]
    async fn test_finished_jobs_are_not_recovered() {
        let backend = MemoryBackend::new();
        backend.push_job("q", "done").await.unwrap();
        backend.claim_job("q", Duration::from_millis(10)).await.unwrap();
        backend.complete_job("q", "done").await.unwrap();

        // Renewing a job that left the active list does nothing
        backend.renew_lease("q", "done").await.unwrap();

        let cutoff = current_timestamp_millis() + 1;
        assert_eq!(backend.recover_stalled("q", cutoff, 10).await.unwrap(), 0);
        assert_eq!(backend.queue_stats("q").await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_renewed_lease_is_not_stalled() {
        let backend = MemoryBackend::new();
        backend.push_job("q", "long").await.unwrap();
        backend.claim_job("q", Duration::from_millis(10)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let cutoff = current_timestamp_millis() - 10;
        backend.renew_lease("q", "long").await.unwrap();

        assert_eq!(backend.recover_stalled("q", cutoff, 10).await.unwrap(), 0);
        assert_eq!(backend.queue_stats("q").await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let backend = MemoryBackend::new();
        assert!(!backend.is_connected());

        backend.connect().await.unwrap();
        assert!(backend.is_connected());

        backend.disconnect().await.unwrap();
        backend.disconnect().await.unwrap();
        assert!(!backend.is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        let backend = MemoryBackend::unreachable();
        let err = backend.connect().await.unwrap_err();
        assert!(matches!(err, QueueError::Connection(_)));
        assert_eq!(backend.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_failing_connects_then_succeeds() {
        let backend = MemoryBackend::failing_connects(2);
        assert!(backend.connect().await.is_err());
        assert!(backend.connect().await.is_err());
        assert!(backend.connect().await.is_ok());
        assert_eq!(backend.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_register_queue_overwrites_concurrency() {
        let backend = MemoryBackend::new();
        backend.register_queue("emails", 3).await.unwrap();
        backend.register_queue("emails", 4).await.unwrap();
        assert_eq!(
            backend.registered_queues().await.unwrap(),
            vec![("emails".to_string(), 4)]
        );
    }
}
