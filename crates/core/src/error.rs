//! Error types for the forge-queue dispatcher.

use thiserror::Error;

use crate::lifecycle::WorkerState;

/// The main error type for the forge-queue library.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The backend could not be reached (after any reconnect attempts).
    #[error("Connection error: {0}")]
    Connection(String),

    /// A queue with the same name is already registered.
    #[error("Queue already registered: {0}")]
    DuplicateQueue(String),

    /// Disconnecting from the backend failed while stopping.
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    /// A backend operation was attempted before `connect()` or after `disconnect()`.
    #[error("Backend is not connected")]
    NotConnected,

    /// A lifecycle operation was called from a state that does not allow it.
    #[error("Cannot {action} while worker is {state}")]
    InvalidState {
        state: WorkerState,
        action: &'static str,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend-specific error.
    #[error("Backend error: {0}")]
    Backend(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using QueueError.
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_connection() {
        let err = QueueError::Connection("redis://localhost:6379 unreachable".to_string());
        assert_eq!(
            format!("{}", err),
            "Connection error: redis://localhost:6379 unreachable"
        );
    }

    #[test]
    fn test_error_display_duplicate_queue() {
        let err = QueueError::DuplicateQueue("emails".to_string());
        assert_eq!(format!("{}", err), "Queue already registered: emails");
    }

    #[test]
    fn test_error_display_shutdown() {
        let err = QueueError::Shutdown("quit failed".to_string());
        assert_eq!(format!("{}", err), "Shutdown error: quit failed");
    }

    #[test]
    fn test_error_display_invalid_state() {
        let err = QueueError::InvalidState {
            state: WorkerState::Running,
            action: "start",
        };
        assert_eq!(format!("{}", err), "Cannot start while worker is running");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: QueueError = json_err.into();
        assert!(matches!(err, QueueError::Serialization(_)));
        assert!(format!("{}", err).starts_with("Serialization error:"));
    }
}
