// Session and cluster contracts
// The object mapper never talks to a store directly. It goes through these
// two traits; the in-process MemoryCluster implements them, and a networked
// driver would too.

use super::Row;
use crate::query::statement::Statement;
use crate::schema::ConsistencyLevel;
use std::sync::Arc;
use thiserror::Error;

/// Failures a session reports
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no host available: {0}")]
    Unavailable(String),
    #[error("execution timed out: {0}")]
    Timeout(String),
    /// The store understood the statement and refused it
    #[error("{0}")]
    InvalidQuery(String),
}

/// Handle of a statement prepared on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreparedId(pub u64);

/// Rows returned by one statement
pub type ResultSet = Vec<Row>;

/// A connection to the cluster, optionally bound to a keyspace
pub trait Session: Send + Sync {
    fn keyspace(&self) -> Option<String>;

    fn prepare(&self, statement: &Statement) -> Result<PreparedId, SessionError>;

    fn execute(
        &self,
        statement: &Statement,
        consistency: ConsistencyLevel,
    ) -> Result<ResultSet, SessionError>;

    /// Send statements as one unlogged group; there is no atomicity across them
    fn execute_batch(
        &self,
        statements: &[Statement],
        consistency: ConsistencyLevel,
    ) -> Result<(), SessionError>;

    fn close(&self);
}

/// Entry point that hands out sessions
pub trait Cluster: Send + Sync {
    fn connect(&self, keyspace: Option<&str>) -> Result<Arc<dyn Session>, SessionError>;

    fn shutdown(&self);
}
