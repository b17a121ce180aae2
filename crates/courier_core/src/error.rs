//! Error types shared by every layer of the gateway core.

use thiserror::Error;

/// Result alias used throughout `courier_core`.
pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Failure reported by a [`CoordinationStore`](crate::store::CoordinationStore) backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend could not be reached or rejected the command.
    #[error("store backend error: {0}")]
    Backend(String),
    /// A stored value could not be interpreted.
    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Failure reported by a [`DuplexConnection`](crate::duplex::DuplexConnection).
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("receive failed: {0}")]
    ReceiveFailed(String),
}

/// Errors surfaced by gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The owning node answered with a non-zero code, or could not be reached.
    #[error("forward to {node} failed (code {code}): {message}")]
    Forward {
        node: String,
        code: i64,
        message: String,
    },

    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("invalid user id: {0}")]
    InvalidUser(i64),

    /// The coordinator task has stopped and no longer accepts events.
    #[error("coordinator is not running")]
    CoordinatorUnavailable,
}

impl GatewayError {
    /// A forwarding request that never produced a response envelope.
    pub fn forward_transport(node: &str, err: impl std::fmt::Display) -> Self {
        GatewayError::Forward {
            node: node.to_string(),
            code: -1,
            message: err.to_string(),
        }
    }
}
