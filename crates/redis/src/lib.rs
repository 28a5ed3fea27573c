//! Redis backend for forge-queue.
//!
//! Each queue gets its own set of keys under the namespace:
//!
//! | Key                              | Type | Contents                         |
//! |----------------------------------|------|----------------------------------|
//! | `_fq_<ns>:<queue>:waiting`       | LIST | jobs ready to run (LPUSH / tail) |
//! | `_fq_<ns>:<queue>:active`        | LIST | jobs claimed by a worker         |
//! | `_fq_<ns>:<queue>:leases`        | ZSET | active jobs scored by last lease renewal (ms) |
//! | `_fq_<ns>:<queue>:retry`         | ZSET | jobs scored by retry time        |
//! | `_fq_<ns>:<queue>:dead`          | LIST | terminally failed jobs, newest first |
//! | `_fq_<ns>:<queue>:completed`     | STR  | completion counter               |
//! | `_fq_<ns>:queues`                | HASH | queue name -> concurrency        |
//!
//! A claim moves a job from `waiting` to `active` and stamps its lease in one
//! script, so a job is never held only in worker memory. Claims poll rather
//! than block: every queue shares one multiplexed connection, and a blocking
//! command on it would stall the other queues' claims and outcomes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use forge_queue::{Backend, Client};
//! use forge_queue_redis::RedisBackend;
//!
//! #[tokio::main]
//! async fn main() -> forge_queue::Result<()> {
//!     let backend = RedisBackend::new("redis://localhost", "clanforge");
//!     backend.connect().await?;
//!     let client = Client::new(backend);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use forge_queue::{current_timestamp_millis, Backend, QueueError, QueueStats, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Prefix for all forge-queue keys.
const FQ_KEY_PREFIX: &str = "_fq_";

/// Default pause between claim attempts on an empty queue.
pub const DEFAULT_CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Oldest waiting job (at the right) to the left of active, with its lease.
const CLAIM_SCRIPT: &str = r#"
local job = redis.call('RPOP', KEYS[1])
if not job then
    return false
end
redis.call('LPUSH', KEYS[2], job)
redis.call('ZADD', KEYS[3], ARGV[1], job)
return job
"#;

/// Active jobs with a lease older than ARGV[1] go back to the right of waiting.
const RECOVER_SCRIPT: &str = r#"
local stalled = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1], 'LIMIT', 0, ARGV[2])
local recovered = 0
for i = #stalled, 1, -1 do
    local job = stalled[i]
    redis.call('ZREM', KEYS[1], job)
    if redis.call('LREM', KEYS[2], 1, job) > 0 then
        redis.call('RPUSH', KEYS[3], job)
        recovered = recovered + 1
    end
end
return recovered
"#;

/// Manages Redis keys with a namespace prefix.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    namespace: String,
}

impl RedisKeys {
    /// Create a new RedisKeys instance with the given namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Get the namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn queue_key(&self, queue: &str, area: &str) -> String {
        format!("{}{}:{}:{}", FQ_KEY_PREFIX, self.namespace, queue, area)
    }

    /// Key for a queue's waiting jobs (LIST).
    pub fn waiting(&self, queue: &str) -> String {
        self.queue_key(queue, "waiting")
    }

    /// Key for a queue's claimed jobs (LIST).
    pub fn active(&self, queue: &str) -> String {
        self.queue_key(queue, "active")
    }

    /// Key for a queue's lease set (ZSET, scored by last renewal in Unix ms).
    pub fn leases(&self, queue: &str) -> String {
        self.queue_key(queue, "leases")
    }

    /// Key for a queue's retry set (ZSET, scored by retry timestamp).
    pub fn retry(&self, queue: &str) -> String {
        self.queue_key(queue, "retry")
    }

    /// Key for a queue's dead letter list (LIST).
    pub fn dead(&self, queue: &str) -> String {
        self.queue_key(queue, "dead")
    }

    /// Key for a queue's completed counter.
    pub fn completed(&self, queue: &str) -> String {
        self.queue_key(queue, "completed")
    }

    /// Key for the registered queues hash (HASH).
    pub fn queues(&self) -> String {
        format!("{}{}:queues", FQ_KEY_PREFIX, self.namespace)
    }
}

/// Redis backend for job queue storage.
///
/// Created disconnected; [`Backend::connect`] opens a [`ConnectionManager`]
/// and [`Backend::disconnect`] drops it. Clones share the connection.
#[derive(Clone)]
pub struct RedisBackend {
    url: String,
    keys: RedisKeys,
    conn: Arc<RwLock<Option<ConnectionManager>>>,
    poll_interval: Duration,
}

impl RedisBackend {
    /// Create a new, not yet connected Redis backend.
    pub fn new(redis_url: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            url: redis_url.into(),
            keys: RedisKeys::new(namespace),
            conn: Arc::new(RwLock::new(None)),
            poll_interval: DEFAULT_CLAIM_POLL_INTERVAL,
        }
    }

    /// Create a Redis backend from an existing connection manager.
    pub fn with_connection(conn: ConnectionManager, namespace: impl Into<String>) -> Self {
        Self {
            url: String::new(),
            keys: RedisKeys::new(namespace),
            conn: Arc::new(RwLock::new(Some(conn))),
            poll_interval: DEFAULT_CLAIM_POLL_INTERVAL,
        }
    }

    /// Set the pause between claim attempts on an empty queue.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Get the Redis keys manager.
    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    async fn conn(&self) -> Result<ConnectionManager> {
        self.conn.read().await.clone().ok_or(QueueError::NotConnected)
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn connect(&self) -> Result<()> {
        let client =
            redis::Client::open(self.url.as_str()).map_err(|e| QueueError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        *self.conn.write().await = Some(conn);
        tracing::debug!(namespace = %self.keys.namespace(), "Connected to Redis");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.conn.write().await.take().is_some() {
            tracing::debug!(namespace = %self.keys.namespace(), "Disconnected from Redis");
        }
        Ok(())
    }

    async fn register_queue(&self, queue: &str, concurrency: usize) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.hset::<_, _, _, ()>(self.keys.queues(), queue, concurrency)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn registered_queues(&self) -> Result<Vec<(String, usize)>> {
        let mut conn = self.conn().await?;
        let mut queues: Vec<(String, usize)> = conn
            .hgetall(self.keys.queues())
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        queues.sort();
        Ok(queues)
    }

    async fn push_job(&self, queue: &str, job_json: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.lpush::<_, _, ()>(self.keys.waiting(queue), job_json)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn claim_job(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let script = redis::Script::new(CLAIM_SCRIPT);

        loop {
            let mut conn = self.conn().await?;
            let job: Option<String> = script
                .key(self.keys.waiting(queue))
                .key(self.keys.active(queue))
                .key(self.keys.leases(queue))
                .arg(current_timestamp_millis())
                .invoke_async(&mut conn)
                .await
                .map_err(|e| QueueError::Backend(e.to_string()))?;

            if job.is_some() {
                return Ok(job);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn requeue_job(&self, queue: &str, claimed_json: &str) -> Result<()> {
        let mut conn = self.conn().await?;

        // RPUSH puts it where the next claim (RPOP) will take it
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(self.keys.active(queue), 1, claimed_json)
            .zrem(self.keys.leases(queue), claimed_json)
            .rpush(self.keys.waiting(queue), claimed_json);

        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn complete_job(&self, queue: &str, claimed_json: &str) -> Result<()> {
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(self.keys.active(queue), 1, claimed_json)
            .zrem(self.keys.leases(queue), claimed_json)
            .incr(self.keys.completed(queue), 1);

        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn retry_job(
        &self,
        queue: &str,
        claimed_json: &str,
        updated_json: &str,
        retry_at: i64,
    ) -> Result<()> {
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(self.keys.active(queue), 1, claimed_json)
            .zrem(self.keys.leases(queue), claimed_json)
            .zadd(self.keys.retry(queue), updated_json, retry_at);

        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn fail_job(&self, queue: &str, claimed_json: &str, updated_json: &str) -> Result<()> {
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(self.keys.active(queue), 1, claimed_json)
            .zrem(self.keys.leases(queue), claimed_json)
            .lpush(self.keys.dead(queue), updated_json);

        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn renew_lease(&self, queue: &str, claimed_json: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        // XX: never re-create a lease for a job that has already left active
        redis::cmd("ZADD")
            .arg(self.keys.leases(queue))
            .arg("XX")
            .arg(current_timestamp_millis())
            .arg(claimed_json)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        stalled_before: i64,
        limit: usize,
    ) -> Result<usize> {
        let mut conn = self.conn().await?;
        let recovered: usize = redis::Script::new(RECOVER_SCRIPT)
            .key(self.keys.leases(queue))
            .key(self.keys.active(queue))
            .key(self.keys.waiting(queue))
            .arg(stalled_before)
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(recovered)
    }

    async fn get_due_retries(&self, queue: &str, now: i64, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let jobs: Vec<String> = conn
            .zrangebyscore_limit(self.keys.retry(queue), "-inf", now, 0, limit as isize)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(jobs)
    }

    async fn move_retry_to_queue(&self, queue: &str, job_json: &str) -> Result<()> {
        let mut conn = self.conn().await?;

        // Only push if this call removed it, so two retriers cannot both
        // promote the same job.
        let script = redis::Script::new(
            r#"
            if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
                redis.call('LPUSH', KEYS[2], ARGV[1])
                return 1
            end
            return 0
            "#,
        );

        script
            .key(self.keys.retry(queue))
            .key(self.keys.waiting(queue))
            .arg(job_json)
            .invoke_async::<i32>(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        pipe.llen(self.keys.waiting(queue))
            .llen(self.keys.active(queue))
            .zcard(self.keys.retry(queue))
            .get(self.keys.completed(queue))
            .llen(self.keys.dead(queue));

        let (waiting, active, retrying, completed, failed): (usize, usize, usize, Option<usize>, usize) =
            pipe.query_async(&mut conn)
                .await
                .map_err(|e| QueueError::Backend(e.to_string()))?;

        Ok(QueueStats {
            waiting,
            active,
            retrying,
            completed: completed.unwrap_or(0),
            failed,
        })
    }

    async fn list_dead(&self, queue: &str, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let jobs: Vec<String> = conn
            .lrange(self.keys.dead(queue), 0, (limit - 1) as isize)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_keys() {
        let keys = RedisKeys::new("clanforge");
        assert_eq!(keys.waiting("emails"), "_fq_clanforge:emails:waiting");
        assert_eq!(keys.active("emails"), "_fq_clanforge:emails:active");
        assert_eq!(keys.leases("emails"), "_fq_clanforge:emails:leases");
        assert_eq!(keys.retry("emails"), "_fq_clanforge:emails:retry");
        assert_eq!(keys.dead("emails"), "_fq_clanforge:emails:dead");
        assert_eq!(keys.completed("emails"), "_fq_clanforge:emails:completed");
        assert_eq!(keys.queues(), "_fq_clanforge:queues");
    }

    #[test]
    fn test_redis_keys_queue_with_dashes() {
        let keys = RedisKeys::new("staging");
        assert_eq!(
            keys.waiting("discord-integration"),
            "_fq_staging:discord-integration:waiting"
        );
    }

    #[test]
    fn test_redis_keys_empty_namespace() {
        let keys = RedisKeys::new("");
        assert_eq!(keys.waiting("emails"), "_fq_:emails:waiting");
        assert_eq!(keys.queues(), "_fq_:queues");
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let backend = RedisBackend::new("redis://127.0.0.1:6379", "test");
        let err = backend.push_job("emails", "{}").await.unwrap_err();
        assert!(matches!(err, QueueError::NotConnected));

        // Disconnecting while disconnected is a no-op
        backend.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_url_is_connection_error() {
        let backend = RedisBackend::new("not a url", "test");
        let err = backend.connect().await.unwrap_err();
        assert!(matches!(err, QueueError::Connection(_)));
    }
}

// ========== Integration Tests (require Redis) ==========
