//! Error types for the drhdb storage engine.

use std::io;
use thiserror::Error;

/// The result type used throughout drhdb.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for drhdb operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error occurred on one of the underlying files.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// On-disk data failed an integrity check.
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// The requested resource was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An invalid argument was provided (key, value, table name or options).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A file offset or field would exceed what the on-disk format can address.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The database is in a state that does not allow the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An internal invariant was violated.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Creates a new not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new capacity exceeded error.
    pub fn capacity_exceeded(msg: impl Into<String>) -> Self {
        Error::CapacityExceeded(msg.into())
    }

    /// Creates a new invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Creates a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
