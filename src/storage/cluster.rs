// In-process cluster
// MemoryCluster keeps keyspaces and tables in memory and executes structured
// statements against them. It follows the column store's rules closely
// enough for the mapper: keyspace DDL fails on existence conflicts, tables
// are keyed by partition and clustering columns, batches are not atomic.
// Fault injection lets tests exercise unavailable and timed out hosts.

use super::session::{Cluster, PreparedId, ResultSet, Session, SessionError};
use super::table::Table;
use crate::config::SessionConfig;
use crate::error::Result;
use crate::query::statement::{Replication, Statement};
use crate::schema::ConsistencyLevel;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type SharedTable = Arc<RwLock<Table>>;

#[derive(Debug)]
struct Keyspace {
    replication: Replication,
    tables: HashMap<String, SharedTable>,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    failing: usize,
}

#[derive(Debug, Default)]
struct Inner {
    keyspaces: RwLock<HashMap<String, Keyspace>>,
    faults: Mutex<Faults>,
    next_prepared: AtomicU64,
    shut_down: AtomicBool,
}

/// A whole cluster living in this process
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<Inner>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cluster for a validated session configuration
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        config.validate()?;
        debug!(contact_points = ?config.contact_points, "starting in-process cluster");
        Ok(Self::new())
    }

    /// While set, every request fails as if no host could be reached
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.faults.lock().unavailable = unavailable;
    }

    /// Make the next `count` requests time out
    pub fn fail_next(&self, count: usize) {
        self.inner.faults.lock().failing = count;
    }

    pub fn keyspace_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keyspaces.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn table_names(&self, keyspace: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .keyspaces
            .read()
            .get(keyspace)
            .map(|ks| ks.tables.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn replication(&self, keyspace: &str) -> Option<Replication> {
        self.inner
            .keyspaces
            .read()
            .get(keyspace)
            .map(|ks| ks.replication.clone())
    }

    /// Number of rows currently stored in a table
    pub fn row_count(&self, keyspace: &str, table: &str) -> Option<usize> {
        let keyspaces = self.inner.keyspaces.read();
        let table = keyspaces.get(keyspace)?.tables.get(table)?;
        let count = table.read().row_count();
        Some(count)
    }
}

impl Cluster for MemoryCluster {
    fn connect(
        &self,
        keyspace: Option<&str>,
    ) -> std::result::Result<Arc<dyn Session>, SessionError> {
        self.inner.check_faults()?;
        if let Some(name) = keyspace {
            if !self.inner.keyspaces.read().contains_key(name) {
                return Err(SessionError::InvalidQuery(format!(
                    "keyspace {name} does not exist"
                )));
            }
        }
        Ok(Arc::new(MemorySession {
            inner: Arc::clone(&self.inner),
            keyspace: keyspace.map(str::to_string),
            closed: AtomicBool::new(false),
        }))
    }

    fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
    }
}

impl Inner {
    fn check_faults(&self) -> std::result::Result<(), SessionError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SessionError::Unavailable("cluster is shut down".to_string()));
        }
        let mut faults = self.faults.lock();
        if faults.unavailable {
            return Err(SessionError::Unavailable(
                "all hosts tried for query failed".to_string(),
            ));
        }
        if faults.failing > 0 {
            faults.failing -= 1;
            return Err(SessionError::Timeout(
                "timed out waiting for server response".to_string(),
            ));
        }
        Ok(())
    }

    fn table(
        &self,
        keyspace: Option<&str>,
        table: &str,
    ) -> std::result::Result<SharedTable, SessionError> {
        let keyspace = keyspace.ok_or_else(|| {
            SessionError::InvalidQuery("no keyspace has been specified".to_string())
        })?;
        let keyspaces = self.keyspaces.read();
        let ks = keyspaces.get(keyspace).ok_or_else(|| {
            SessionError::InvalidQuery(format!("keyspace {keyspace} does not exist"))
        })?;
        ks.tables.get(table).cloned().ok_or_else(|| {
            SessionError::InvalidQuery(format!("unconfigured table {table}"))
        })
    }

    fn apply(
        &self,
        keyspace: Option<&str>,
        statement: &Statement,
    ) -> std::result::Result<ResultSet, SessionError> {
        match statement {
            Statement::CreateKeyspace { name, replication } => {
                let mut keyspaces = self.keyspaces.write();
                if keyspaces.contains_key(name) {
                    return Err(SessionError::InvalidQuery(format!(
                        "keyspace {name} already exists"
                    )));
                }
                debug!(keyspace = %name, %replication, "keyspace created");
                keyspaces.insert(
                    name.clone(),
                    Keyspace {
                        replication: replication.clone(),
                        tables: HashMap::new(),
                    },
                );
                Ok(Vec::new())
            }
            Statement::AlterKeyspace { name, replication } => {
                let mut keyspaces = self.keyspaces.write();
                let ks = keyspaces.get_mut(name).ok_or_else(|| {
                    SessionError::InvalidQuery(format!("keyspace {name} does not exist"))
                })?;
                ks.replication = replication.clone();
                Ok(Vec::new())
            }
            Statement::DropKeyspace { name } => {
                if self.keyspaces.write().remove(name).is_none() {
                    return Err(SessionError::InvalidQuery(format!(
                        "keyspace {name} does not exist"
                    )));
                }
                debug!(keyspace = %name, "keyspace dropped");
                Ok(Vec::new())
            }
            Statement::CreateTable {
                spec,
                if_not_exists,
            } => {
                let keyspace = keyspace.ok_or_else(|| {
                    SessionError::InvalidQuery("no keyspace has been specified".to_string())
                })?;
                let mut keyspaces = self.keyspaces.write();
                let ks = keyspaces.get_mut(keyspace).ok_or_else(|| {
                    SessionError::InvalidQuery(format!("keyspace {keyspace} does not exist"))
                })?;
                if ks.tables.contains_key(&spec.name) {
                    if *if_not_exists {
                        return Ok(Vec::new());
                    }
                    return Err(SessionError::InvalidQuery(format!(
                        "table {} already exists",
                        spec.name
                    )));
                }
                ks.tables
                    .insert(spec.name.clone(), Arc::new(RwLock::new(Table::new(spec.clone()))));
                Ok(Vec::new())
            }
            Statement::AddColumn { table, column } => {
                self.table(keyspace, table)?.write().add_column(column.clone())?;
                Ok(Vec::new())
            }
            Statement::Insert { table, values } => {
                self.table(keyspace, table)?.write().upsert(values)?;
                Ok(Vec::new())
            }
            Statement::Delete { table, key } => {
                self.table(keyspace, table)?.write().delete(key)?;
                Ok(Vec::new())
            }
            Statement::Select(select) => self.table(keyspace, &select.table)?.read().select(select),
        }
    }
}

/// Session handed out by [`MemoryCluster`]
#[derive(Debug)]
pub struct MemorySession {
    inner: Arc<Inner>,
    keyspace: Option<String>,
    closed: AtomicBool,
}

impl MemorySession {
    fn check_open(&self) -> std::result::Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Unavailable("session is closed".to_string()));
        }
        self.inner.check_faults()
    }
}

impl Session for MemorySession {
    fn keyspace(&self) -> Option<String> {
        self.keyspace.clone()
    }

    fn prepare(&self, statement: &Statement) -> std::result::Result<PreparedId, SessionError> {
        self.check_open()?;
        if !statement.is_preparable() {
            return Err(SessionError::InvalidQuery(format!(
                "cannot prepare {}",
                statement.cql()
            )));
        }
        if let Some(table) = statement.table() {
            self.inner.table(self.keyspace.as_deref(), table)?;
        }
        Ok(PreparedId(self.inner.next_prepared.fetch_add(1, Ordering::SeqCst)))
    }

    fn execute(
        &self,
        statement: &Statement,
        _consistency: ConsistencyLevel,
    ) -> std::result::Result<ResultSet, SessionError> {
        self.check_open()?;
        self.inner.apply(self.keyspace.as_deref(), statement)
    }

    fn execute_batch(
        &self,
        statements: &[Statement],
        _consistency: ConsistencyLevel,
    ) -> std::result::Result<(), SessionError> {
        self.check_open()?;
        for statement in statements {
            if !matches!(statement, Statement::Insert { .. } | Statement::Delete { .. }) {
                return Err(SessionError::InvalidQuery(
                    "only INSERT and DELETE statements are allowed in a batch".to_string(),
                ));
            }
            self.inner.apply(self.keyspace.as_deref(), statement)?;
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
