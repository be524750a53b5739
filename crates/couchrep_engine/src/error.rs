//! Error types for the replication controller.

use couchrep_protocol::ProtocolError;
use thiserror::Error;

/// Result type for controller operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur while controlling or observing a replication.
///
/// Errors are `Clone` so the most recent one can live in
/// [`ReplicationState::last_error`](crate::ReplicationState::last_error).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// The configuration cannot be turned into a start request.
    #[error("invalid replication config: {0}")]
    ConfigInvalid(String),

    /// The operation is not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server answered a start request with an error status.
    #[error("server rejected replication (HTTP {status}): {reason}")]
    ServerRejected {
        /// HTTP status code.
        status: u16,
        /// Reason reported by the server.
        reason: String,
    },

    /// The server stopped listing the task without a caller-initiated stop.
    #[error("replication task {task_id} disappeared from the server")]
    TaskVanished {
        /// Identifier of the vanished task.
        task_id: String,
    },

    /// A reply could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The request was cancelled before it completed.
    #[error("request cancelled")]
    Cancelled,

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// The controller task has shut down.
    #[error("replication controller is closed")]
    ControllerClosed,
}

/// Broad category of a [`ReplicationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Rejected locally before any request was made.
    ConfigInvalid,
    /// Operation not allowed in the current state.
    InvalidState,
    /// Network, HTTP, decoding or timeout failure.
    TransportFailure,
    /// Server refused to start the replication.
    ServerRejected,
    /// Task dropped by the server.
    TaskVanished,
    /// Cancelled by a stop or shutdown.
    Cancelled,
}

impl ReplicationError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::Transport { retryable, .. } => *retryable,
            ReplicationError::Timeout => true,
            ReplicationError::ServerRejected { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReplicationError::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            ReplicationError::InvalidState(_) => ErrorKind::InvalidState,
            ReplicationError::Transport { .. }
            | ReplicationError::Protocol(_)
            | ReplicationError::Timeout => ErrorKind::TransportFailure,
            ReplicationError::ServerRejected { .. } => ErrorKind::ServerRejected,
            ReplicationError::TaskVanished { .. } => ErrorKind::TaskVanished,
            ReplicationError::Cancelled | ReplicationError::ControllerClosed => {
                ErrorKind::Cancelled
            }
        }
    }
}

impl From<ProtocolError> for ReplicationError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidConfig(message) => ReplicationError::ConfigInvalid(message),
            other => ReplicationError::Protocol(other.to_string()),
        }
    }
}
