//! Typed job payloads.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A payload type bound to exactly one queue.
///
/// Producers enqueue it with [`Client::enqueue`](crate::Client::enqueue) and
/// consumers register a handler for it with
/// [`QueueSpec::typed`](crate::QueueSpec::typed); both sides take the queue
/// name from `QUEUE`, so the pairing is fixed at compile time.
///
/// ```rust
/// use forge_queue::JobPayload;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// impl JobPayload for SendEmail {
///     const QUEUE: &'static str = "emails";
/// }
/// ```
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name of the queue this payload is delivered on.
    const QUEUE: &'static str;
}
