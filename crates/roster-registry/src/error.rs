//! Membership registry error types

use roster_common::{BrokerId, CodecError};
use roster_coord::CoordError;

/// Error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The coordination service stayed unreachable after retries.
    #[error("connection error: {0}")]
    Connection(String),

    /// The session ended; its entries are gone and the broker must register again.
    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("broker id {0} is already registered by another live session")]
    DuplicateBrokerId(BrokerId),

    #[error("broker {0} not found")]
    BrokerNotFound(BrokerId),

    #[error("malformed record at {path}: {source}")]
    MalformedRecord {
        path: String,
        #[source]
        source: CodecError,
    },

    /// This session already registered the id with a different record.
    /// Changing metadata takes a deregister followed by a new register.
    #[error("broker {0} is already registered by this session with a different record")]
    RecordMismatch(BrokerId),

    /// The entry exists but belongs to another session.
    #[error("broker {0} is registered by another session")]
    NotOwner(BrokerId),

    #[error("request timeout")]
    Timeout,

    #[error("coordination error: {0}")]
    Coordination(#[source] CoordError),
}

impl RegistryError {
    /// Worth retrying later without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::Connection(_) | RegistryError::Timeout)
    }

    /// Ends the current registration: re-register on a new session, or fix
    /// the configuration.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RegistryError::SessionExpired(_) | RegistryError::DuplicateBrokerId(_)
        )
    }
}

impl From<CoordError> for RegistryError {
    fn from(e: CoordError) -> Self {
        match e {
            CoordError::Connection(msg) | CoordError::ConnectionLoss(msg) => {
                RegistryError::Connection(msg)
            }
            CoordError::SessionExpired(session) => RegistryError::SessionExpired(session),
            CoordError::SessionClosed => RegistryError::SessionExpired("session closed".to_string()),
            CoordError::Timeout => RegistryError::Timeout,
            other => RegistryError::Coordination(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coord_error_mapping() {
        let err: RegistryError = CoordError::ConnectionLoss("reset".to_string()).into();
        assert!(matches!(err, RegistryError::Connection(_)));
        assert!(err.is_retryable());
        assert!(!err.is_fatal());

        let err: RegistryError = CoordError::SessionExpired("s-1".to_string()).into();
        assert!(matches!(err, RegistryError::SessionExpired(_)));
        assert!(err.is_fatal());

        let err: RegistryError = CoordError::Timeout.into();
        assert!(err.is_retryable());

        let err: RegistryError = CoordError::Backend("boom".to_string()).into();
        assert!(matches!(err, RegistryError::Coordination(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_duplicate_is_fatal_not_retryable() {
        let id = BrokerId::new(3).unwrap();
        let err = RegistryError::DuplicateBrokerId(id);
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "broker id 3 is already registered by another live session"
        );

        assert!(!RegistryError::BrokerNotFound(id).is_fatal());
        assert!(!RegistryError::RecordMismatch(id).is_retryable());
    }
}
