//! Error types for the session guard

use common::StoreError;
use thiserror::Error;

use crate::models::SessionState;

/// Errors raised by session, blacklist and rotation operations
#[derive(Error, Debug)]
pub enum GuardError {
    /// The shared store failed or was unreachable
    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    /// A store call exceeded its deadline
    #[error("State store operation timed out after {0} ms")]
    Timeout(u64),

    /// No session exists under this id
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The session exists but can no longer authorize anything
    #[error("Session {0} is {1}")]
    SessionInactive(String, SessionState),

    /// A token failed signature, expiry or structural checks
    #[error("Invalid token: {0}")]
    TokenInvalid(String),

    /// A token of the wrong kind was presented
    #[error("Expected a {expected} token")]
    WrongTokenType { expected: &'static str },

    /// A single-use token was presented a second time
    #[error("Token has already been used")]
    TokenReused,

    /// Concurrent writers kept winning the compare-and-swap race
    #[error("Gave up updating {0} after repeated concurrent modification")]
    Contention(String),

    /// Minting a new token failed
    #[error("Token issuance failed: {0}")]
    Issuance(String),

    /// Stored data could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl GuardError {
    /// Infrastructure failures, as opposed to credential or data problems
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            GuardError::Store(_) | GuardError::Timeout(_) | GuardError::Contention(_)
        )
    }
}

/// Type alias for Result with GuardError
pub type GuardResult<T> = Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failures_are_classified() {
        assert!(GuardError::Timeout(100).is_store_failure());
        assert!(GuardError::Store(StoreError::Timeout(100)).is_store_failure());
        assert!(!GuardError::SessionNotFound("s".into()).is_store_failure());
        assert!(!GuardError::TokenReused.is_store_failure());
    }
}
