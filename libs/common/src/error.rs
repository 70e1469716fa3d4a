//! Custom error types for the common library
//!
//! This module defines the error type returned by every shared state store
//! operation, whichever backend serves it.

use redis::RedisError;
use thiserror::Error;

/// Custom error type for state store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or the connection dropped
    #[error("Store connection error: {0}")]
    Connection(#[source] RedisError),

    /// A command was rejected or failed while executing
    #[error("Store command error: {0}")]
    Command(#[source] RedisError),

    /// The operation did not complete within its deadline
    #[error("Store operation timed out after {0} ms")]
    Timeout(u64),

    /// Configuration error
    #[error("Store configuration error: {0}")]
    Configuration(String),
}

impl StoreError {
    /// Whether the error means the store itself is unavailable, as opposed to
    /// a bad request against a healthy store
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Connection(_) | StoreError::Timeout(_) => true,
            StoreError::Command(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            StoreError::Configuration(_) => false,
        }
    }
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            StoreError::Connection(err)
        } else {
            StoreError::Command(err)
        }
    }
}

/// Type alias for Result with StoreError
pub type StoreResult<T> = Result<T, StoreError>;
