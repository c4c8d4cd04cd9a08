// Query Executor
// Runs generated statements against a session: prepares each statement shape
// once, executes synchronously, asynchronously or as an unlogged batch, and
// collapses every transport fault into one timeout error.

use super::statement::Statement;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::schema::ConsistencyLevel;
use crate::storage::session::{PreparedId, ResultSet, Session};
use crate::storage::Row;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A statement waiting for a worker, with where to send its result
struct Job {
    statement: Statement,
    reply: Sender<Result<ResultSet>>,
}

/// Fixed set of threads that run asynchronous statements
///
/// Jobs queue on a bounded channel; submitting blocks while it is full.
struct WorkerPool {
    jobs: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    fn spawn(
        session: &Arc<dyn Session>,
        consistency: ConsistencyLevel,
        workers: usize,
        queue: usize,
    ) -> Result<Self> {
        let (jobs, queued) = bounded::<Job>(queue.max(1));
        let mut handles = Vec::with_capacity(workers);
        for n in 0..workers.max(1) {
            let session = Arc::clone(session);
            let queued = queued.clone();
            let handle = thread::Builder::new()
                .name(format!("rhombus-cql-{n}"))
                .spawn(move || {
                    for job in queued.iter() {
                        let result = session
                            .execute(&job.statement, consistency)
                            .map_err(Error::from);
                        let _ = job.reply.send(result);
                    }
                })?;
            handles.push(handle);
        }
        Ok(Self {
            jobs: Mutex::new(Some(jobs)),
            handles: Mutex::new(handles),
        })
    }

    /// Queue a job; hands it back when the pool is shut down
    fn submit(&self, job: Job) -> std::result::Result<(), Job> {
        let Some(jobs) = self.jobs.lock().clone() else {
            return Err(job);
        };
        jobs.send(job).map_err(|err| err.into_inner())
    }

    fn worker_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Let the workers drain what is queued, then join them
    fn shutdown(&self) {
        self.jobs.lock().take();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                warn!("statement worker panicked");
            }
        }
    }
}

/// Handle to a statement running in the background
pub struct ResultFuture {
    receiver: Receiver<Result<ResultSet>>,
}

impl ResultFuture {
    fn ready(result: Result<ResultSet>) -> Self {
        let (sender, receiver) = bounded(1);
        let _ = sender.send(result);
        Self { receiver }
    }

    /// Block until the statement completes
    pub fn wait(self) -> Result<ResultSet> {
        self.receiver
            .recv()
            .map_err(|_| Error::Timeout("statement worker went away".to_string()))?
    }

    /// Block for at most `timeout`
    pub fn wait_timeout(self, timeout: Duration) -> Result<ResultSet> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(format!(
                "no result within {} ms",
                timeout.as_millis()
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Timeout("statement worker went away".to_string()))
            }
        }
    }
}

/// Executes statements for one keyspace session
pub struct CqlExecutor {
    session: Arc<dyn Session>,
    consistency: ConsistencyLevel,
    /// CQL text to prepared handle
    prepared: RwLock<HashMap<String, PreparedId>>,
    workers: WorkerPool,
    batch_timeout: Duration,
    log_cql: bool,
}

impl CqlExecutor {
    /// Wrap a session, starting one statement worker per local connection
    ///
    /// Up to `in_flight_capacity` asynchronous statements may queue before
    /// callers block.
    pub fn new(
        session: Arc<dyn Session>,
        consistency: ConsistencyLevel,
        config: &SessionConfig,
    ) -> Result<Self> {
        let workers = WorkerPool::spawn(
            &session,
            consistency,
            config.max_connection_per_host_local,
            config.in_flight_capacity(),
        )?;
        Ok(Self {
            session,
            consistency,
            prepared: RwLock::new(HashMap::new()),
            workers,
            batch_timeout: config.batch_timeout(),
            log_cql: config.log_cql,
        })
    }

    pub fn consistency(&self) -> ConsistencyLevel {
        self.consistency
    }

    /// Prepared handle for this statement's shape, preparing it on a miss
    ///
    /// Two threads missing at once both prepare; the first insert wins.
    pub fn prepare(&self, statement: &Statement) -> Result<PreparedId> {
        let cql = statement.cql();
        if let Some(id) = self.prepared.read().get(&cql) {
            return Ok(*id);
        }
        let id = self.session.prepare(statement)?;
        if self.log_cql {
            debug!(%cql, "prepared");
        }
        Ok(*self.prepared.write().entry(cql).or_insert(id))
    }

    pub fn prepared_statement_count(&self) -> usize {
        self.prepared.read().len()
    }

    pub fn clear_statement_cache(&self) {
        self.prepared.write().clear();
    }

    fn log(&self, statement: &Statement) {
        if self.log_cql {
            debug!(cql = %statement, values = ?statement.values(), "executing");
        }
    }

    pub fn execute_sync(&self, statement: &Statement) -> Result<ResultSet> {
        if statement.is_preparable() {
            self.prepare(statement)?;
        }
        self.log(statement);
        Ok(self.session.execute(statement, self.consistency)?)
    }

    /// Hand a statement to the worker pool
    ///
    /// Blocks only while the queue is full.
    pub fn execute_async(&self, statement: Statement) -> ResultFuture {
        if statement.is_preparable() {
            if let Err(err) = self.prepare(&statement) {
                return ResultFuture::ready(Err(err));
            }
        }
        self.log(&statement);
        let (reply, receiver) = bounded(1);
        if self.workers.submit(Job { statement, reply }).is_err() {
            return ResultFuture::ready(Err(Error::Timeout("executor is closed".to_string())));
        }
        ResultFuture { receiver }
    }

    /// Number of threads running asynchronous statements
    pub fn worker_count(&self) -> usize {
        self.workers.worker_count()
    }

    /// Run statements concurrently and wait for all of them within the batch timeout
    ///
    /// Results come back in statement order; the first failure is returned.
    pub fn execute_all(&self, statements: Vec<Statement>) -> Result<Vec<ResultSet>> {
        let deadline = Instant::now() + self.batch_timeout;
        let futures: Vec<ResultFuture> = statements
            .into_iter()
            .map(|statement| self.execute_async(statement))
            .collect();
        futures
            .into_iter()
            .map(|future| future.wait_timeout(deadline.saturating_duration_since(Instant::now())))
            .collect()
    }

    /// Send statements as one unlogged batch
    pub fn execute_batch(&self, statements: &[Statement]) -> Result<()> {
        if statements.is_empty() {
            return Ok(());
        }
        for statement in statements {
            self.prepare(statement)?;
        }
        if self.log_cql {
            debug!(statements = statements.len(), "executing unlogged batch");
        }
        Ok(self.session.execute_batch(statements, self.consistency)?)
    }

    /// Stop the workers once queued statements finish, then close the session
    pub fn close(&self) {
        self.workers.shutdown();
        self.session.close();
    }
}

impl Drop for CqlExecutor {
    fn drop(&mut self) {
        self.workers.shutdown();
    }
}

/// Rows plus the column order to print them in
#[derive(Debug)]
pub struct ResultTable {
    pub column_names: Vec<String>,
    pub rows: Vec<Row>,
}

impl ResultTable {
    /// Columns of every row, `id` first
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut column_names: Vec<String> = Vec::new();
        for row in &rows {
            for name in row.keys() {
                if !column_names.contains(name) {
                    column_names.push(name.clone());
                }
            }
        }
        column_names.sort_by_key(|name| (name != "id", name.clone()));
        Self { column_names, rows }
    }

    /// Format the rows as a box-drawn table
    pub fn format(&self) -> String {
        if self.rows.is_empty() {
            return "No rows found".to_string();
        }

        let cell = |row: &Row, name: &str| row.get(name).map(|v| v.to_string()).unwrap_or_default();
        let mut widths: Vec<usize> = self.column_names.iter().map(|c| c.chars().count()).collect();
        for row in &self.rows {
            for (i, name) in self.column_names.iter().enumerate() {
                widths[i] = widths[i].max(cell(row, name).chars().count());
            }
        }

        let border = |left: &str, mid: &str, right: &str| {
            let inner: Vec<String> = widths.iter().map(|w| "─".repeat(w + 2)).collect();
            format!("{left}{}{right}\n", inner.join(mid))
        };

        let mut result = border("┌", "┬", "┐");
        result.push('│');
        for (name, width) in self.column_names.iter().zip(widths.iter().copied()) {
            result.push_str(&format!(" {name:<width$} │"));
        }
        result.push('\n');
        result.push_str(&border("├", "┼", "┤"));
        for row in &self.rows {
            result.push('│');
            for (name, width) in self.column_names.iter().zip(widths.iter().copied()) {
                result.push_str(&format!(" {:<width$} │", cell(row, name)));
            }
            result.push('\n');
        }
        result.push_str(&border("└", "┴", "┘"));
        result.push_str(&format!("\n{} row(s) returned", self.rows.len()));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::statement::{Replication, Select};
    use crate::schema::DataType;
    use crate::storage::cluster::MemoryCluster;
    use crate::storage::session::{Cluster, SessionError};
    use crate::storage::{ColumnSpec, SortOrder, TableSpec, Value};
    use std::collections::HashSet;
    use std::thread::ThreadId;

    fn executor(config: &SessionConfig) -> (MemoryCluster, CqlExecutor) {
        let cluster = MemoryCluster::new();
        let admin = cluster.connect(None).unwrap();
        admin
            .execute(
                &Statement::CreateKeyspace {
                    name: "ks".into(),
                    replication: Replication {
                        class: "SimpleStrategy".into(),
                        factors: Default::default(),
                    },
                },
                ConsistencyLevel::One,
            )
            .unwrap();
        let session = cluster.connect(Some("ks")).unwrap();
        let executor = CqlExecutor::new(session, ConsistencyLevel::One, config).unwrap();
        executor
            .execute_sync(&Statement::CreateTable {
                spec: TableSpec {
                    name: "kv".into(),
                    columns: vec![
                        ColumnSpec::new("k", DataType::BigInt),
                        ColumnSpec::new("v", DataType::Text),
                    ],
                    partition_key: vec!["k".into()],
                    clustering_key: Vec::new(),
                    clustering_order: SortOrder::Desc,
                },
                if_not_exists: true,
            })
            .unwrap();
        (cluster, executor)
    }

    fn insert(k: i64) -> Statement {
        Statement::Insert {
            table: "kv".into(),
            values: vec![("k".into(), Value::BigInt(k)), ("v".into(), Value::from("x"))],
        }
    }

    fn config() -> SessionConfig {
        SessionConfig::new(vec!["127.0.0.1".to_string()])
    }

    #[test]
    fn test_statement_shapes_prepare_once() {
        let (_, executor) = executor(&config());
        for k in 0..5 {
            executor.execute_sync(&insert(k)).unwrap();
        }
        assert_eq!(executor.prepared_statement_count(), 1);
        executor
            .execute_sync(&Select::from("kv").eq("k", Value::BigInt(1)).build())
            .unwrap();
        assert_eq!(executor.prepared_statement_count(), 2);
        executor.clear_statement_cache();
        assert_eq!(executor.prepared_statement_count(), 0);
    }

    #[test]
    fn test_async_fan_out_respects_small_capacity() {
        let mut config = config();
        config.max_connection_per_host_local = 1;
        config.max_simultaneous_requests_per_connection_threshold = 2;
        let (cluster, executor) = executor(&config);
        let results = executor
            .execute_all((0..20).map(insert).collect())
            .unwrap();
        assert_eq!(results.len(), 20);
        assert_eq!(cluster.row_count("ks", "kv"), Some(20));
    }

    /// Delegating session that records which threads execute statements
    struct ThreadRecorder {
        inner: Arc<dyn Session>,
        threads: Mutex<HashSet<ThreadId>>,
    }

    impl Session for ThreadRecorder {
        fn keyspace(&self) -> Option<String> {
            self.inner.keyspace()
        }

        fn prepare(&self, statement: &Statement) -> std::result::Result<PreparedId, SessionError> {
            self.inner.prepare(statement)
        }

        fn execute(
            &self,
            statement: &Statement,
            consistency: ConsistencyLevel,
        ) -> std::result::Result<ResultSet, SessionError> {
            self.threads.lock().insert(thread::current().id());
            self.inner.execute(statement, consistency)
        }

        fn execute_batch(
            &self,
            statements: &[Statement],
            consistency: ConsistencyLevel,
        ) -> std::result::Result<(), SessionError> {
            self.inner.execute_batch(statements, consistency)
        }

        fn close(&self) {
            self.inner.close();
        }
    }

    #[test]
    fn test_fan_out_runs_on_a_fixed_set_of_workers() {
        let mut config = config();
        config.max_connection_per_host_local = 3;
        config.max_simultaneous_requests_per_connection_threshold = 2;
        let (cluster, setup) = executor(&config);
        let recorder = Arc::new(ThreadRecorder {
            inner: cluster.connect(Some("ks")).unwrap(),
            threads: Mutex::new(HashSet::new()),
        });
        let session: Arc<dyn Session> = recorder.clone();
        let executor = CqlExecutor::new(session, ConsistencyLevel::One, &config).unwrap();
        assert_eq!(executor.worker_count(), 3);

        for round in 0..4 {
            let statements = (0..50).map(|k| insert(round * 50 + k)).collect();
            assert_eq!(executor.execute_all(statements).unwrap().len(), 50);
        }
        assert_eq!(cluster.row_count("ks", "kv"), Some(200));
        let used = recorder.threads.lock().len();
        assert!((1..=3).contains(&used), "{used} threads ran statements");

        executor.close();
        assert_eq!(executor.worker_count(), 0);
        assert!(matches!(
            executor.execute_async(insert(999)).wait(),
            Err(Error::Timeout(_))
        ));
        drop(setup);
    }

    #[test]
    fn test_transport_faults_collapse_to_timeout() {
        let (cluster, executor) = executor(&config());
        cluster.fail_next(1);
        assert!(matches!(executor.execute_sync(&insert(1)), Err(Error::Timeout(_))));

        cluster.set_unavailable(true);
        assert!(matches!(
            executor.execute_async(insert(2)).wait(),
            Err(Error::Timeout(_))
        ));
        assert!(matches!(
            executor.execute_batch(&[insert(3)]),
            Err(Error::Timeout(_))
        ));
        cluster.set_unavailable(false);

        let missing = Select::from("nope").build();
        assert!(matches!(
            executor.execute_sync(&missing),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_format_table() {
        let mut row = Row::new();
        row.insert("name".into(), Value::from("alice"));
        row.insert("id".into(), Value::BigInt(1));
        let table = ResultTable::from_rows(vec![row]);
        assert_eq!(table.column_names, vec!["id", "name"]);
        let text = table.format();
        assert!(text.contains("│ id │ name  │"));
        assert!(text.ends_with("1 row(s) returned"));
        assert_eq!(ResultTable::from_rows(Vec::new()).format(), "No rows found");
    }
}
