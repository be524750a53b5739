//! Error types for the replication wire format.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building or parsing replication messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The replication configuration cannot produce a valid request.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A response was missing a field the controller depends on.
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// A response had an unexpected JSON shape.
    #[error("unexpected structure: {0}")]
    InvalidStructure(String),
}

impl ProtocolError {
    /// Creates an invalid-configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Creates an invalid-structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure(message.into())
    }
}
