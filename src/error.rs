// Error types shared by every layer of the object mapper

use crate::storage::session::SessionError;
use thiserror::Error;

/// Everything the mapper, generator, executor and migration engine can fail with.
///
/// Schema and constraint errors are raised before any statement is issued.
/// Transport faults from a session always arrive here as `Timeout`.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed schema document, or a query whose field set matches no index
    #[error("schema error: {0}")]
    Schema(String),

    /// A required (index composite) field is null and null inserts are disallowed
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Host unavailable or execution timed out
    #[error("timed out: {0}")]
    Timeout(String),

    /// Keyspace rebuild or migration could not proceed without force
    #[error("migration conflict: {0}")]
    MigrationConflict(String),

    /// The store rejected a statement (unknown table, existing keyspace, ...)
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<SessionError> for Error {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Unavailable(msg) | SessionError::Timeout(msg) => Error::Timeout(msg),
            SessionError::InvalidQuery(msg) => Error::InvalidQuery(msg),
        }
    }
}

impl Error {
    pub(crate) fn schema(msg: impl Into<String>) -> Self {
        Error::Schema(msg.into())
    }

    pub(crate) fn constraint(msg: impl Into<String>) -> Self {
        Error::Constraint(msg.into())
    }
}
