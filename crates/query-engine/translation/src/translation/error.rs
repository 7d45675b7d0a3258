//! Errors for query and update translation.

use thiserror::Error;

/// A type for translation errors. Each variant carries the stable
/// numeric code surfaced to API clients.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("invalid nested key: {0}")]
    InvalidNestedKey(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("operation forbidden: {0}")]
    OperationForbidden(String),
}

impl Error {
    /// The stable numeric error code for this error kind.
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidJson(_) => 107,
            Error::InvalidNestedKey(_) => 121,
            Error::InvalidQuery(_) => 102,
            Error::OperationForbidden(_) => 119,
        }
    }
}
