//! Termination signal handling.

use async_trait::async_trait;
use std::io;

/// Something that tells the worker to shut down.
#[async_trait]
pub trait ShutdownSource: Send {
    /// Wait for the next shutdown request and return its name.
    async fn recv(&mut self) -> &'static str;
}

/// Listens for SIGINT and SIGTERM. Both map to the same shutdown path.
pub struct ShutdownSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    /// Install the signal handlers.
    #[cfg(unix)]
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> io::Result<Self> {
        Ok(Self {})
    }
}

#[async_trait]
impl ShutdownSource for ShutdownSignals {
    #[cfg(unix)]
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            // Without a handler there is nothing to wait for.
            Err(_) => std::future::pending().await,
        }
    }
}
