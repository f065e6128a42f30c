//! Coordination adapter error types

/// Error type for coordination service operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordError {
    /// The coordination service could not be reached at all.
    #[error("connection error: {0}")]
    Connection(String),

    /// A single request lost its connection; it may or may not have been applied.
    #[error("connection lost during request: {0}")]
    ConnectionLoss(String),

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("session closed")]
    SessionClosed,

    #[error("node already exists: {path}")]
    NodeExists {
        path: String,
        /// Session token owning the node, `None` for persistent nodes
        owner: Option<String>,
    },

    #[error("node does not exist: {0}")]
    NoNode(String),

    #[error("request timeout")]
    Timeout,

    #[error("invalid path '{0}'")]
    InvalidPath(String),

    #[error("coordination backend error: {0}")]
    Backend(String),
}

impl CoordError {
    /// Failures the adapter absorbs with retry and backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordError::Connection(_) | CoordError::ConnectionLoss(_) | CoordError::Timeout
        )
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;
