//! # forge-queue - Multi-queue job dispatcher
//!
//! This crate provides the core of the ClanForge worker:
//! - `Backend` trait for broker implementations, plus an in-memory backend
//! - `Job`, `JobId`, `JobState`, `RetryPolicy` and the `JobPayload` trait
//! - `Registry` / `QueueSpec` mapping queue names to handlers and concurrency limits
//! - `Dispatcher` running every queue within its limit, with retry promotion
//!   and stalled job recovery
//! - `WorkerProcess` lifecycle controller with graceful shutdown
//! - `Client` for enqueueing jobs
//! - Error types

mod backend;
mod client;
mod config;
mod connection;
mod dispatcher;
mod error;
mod events;
mod job;
mod lifecycle;
mod memory;
mod payload;
mod reaper;
mod registry;
mod retrier;
mod worker;

// Re-export main types
pub use backend::{Backend, DynBackend, QueueStats, SharedBackend};
pub use client::Client;
pub use config::{ReconnectPolicy, WorkerConfig, WorkerConfigBuilder, DEFAULT_REDIS_URL};
pub use connection::connect_with_retry;
pub use dispatcher::{Dispatcher, DrainReport};
pub use error::{QueueError, Result};
pub use events::{JobEvent, EVENT_CHANNEL_CAPACITY};
pub use job::{
    current_timestamp_millis, Job, JobError, JobErrorKind, JobId, JobResult, JobState, RetryPolicy,
};
pub use lifecycle::{generate_worker_id, WorkerProcess, WorkerState};
pub use memory::MemoryBackend;
pub use payload::JobPayload;
pub use reaper::Reaper;
pub use registry::{BoxedHandler, QueueRegistration, QueueSpec, Registry};
pub use retrier::Retrier;
