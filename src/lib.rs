// Rhombus - a schema-driven object mapper over a partitioned column store
// This is the library root that exposes the public API

pub mod config;
pub mod connection;
pub mod error;
pub mod mapper;
pub mod migration;
pub mod query;
pub mod schema;
pub mod sharding;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::SessionConfig;
pub use connection::ConnectionManager;
pub use error::{Error, Result};
pub use mapper::{Criteria, IndexUpdateRow, IndexUpdateRowKey, ObjectMapper, ScanCursor};
pub use migration::MigrationPlan;
pub use query::{CqlExecutor, ResultTable, Statement};
pub use schema::{DataType, Field, Index, KeyspaceDefinition, Object, ObjectDefinition};
pub use sharding::ShardingStrategy;
pub use storage::cluster::MemoryCluster;
pub use storage::{SortOrder, Value};
