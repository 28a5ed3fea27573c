//! Connecting to the broker with bounded, backed-off retries.

use crate::backend::Backend;
use crate::config::ReconnectPolicy;
use crate::error::{QueueError, Result};

/// Connect `backend`, retrying with exponential backoff.
///
/// Each attempt is bounded by `policy.connect_timeout`. After
/// `policy.max_attempts` failures the last error is surfaced as
/// [`QueueError::Connection`].
pub async fn connect_with_retry<B: Backend + ?Sized>(
    backend: &B,
    policy: &ReconnectPolicy,
) -> Result<()> {
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.connect_timeout, backend.connect()).await {
            Ok(Ok(())) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Connected to backend after retrying");
                }
                return Ok(());
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => {
                last_error = format!("connect timed out after {:?}", policy.connect_timeout)
            }
        }

        if attempt < attempts {
            let delay = policy.delay_after(attempt);
            tracing::warn!(
                attempt,
                max_attempts = attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %last_error,
                "Backend connection failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    Err(QueueError::Connection(format!(
        "gave up after {} attempt(s): {}",
        attempts, last_error
    )))
}
