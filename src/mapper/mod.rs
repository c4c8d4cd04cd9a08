// Object mapper
// The public face of the crate: CRUD, index queries, grouped batch inserts,
// full scans and the changelog, all for the object types of one keyspace.
// Every operation generates its statements first (so schema and constraint
// errors surface before anything is written) and then hands them to the
// executor.

pub mod changelog;
pub mod scan;

pub use changelog::{IndexSnapshot, IndexUpdateRow, IndexUpdateRowKey};
pub use scan::{ObjectScan, ScanCursor};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::migration::MigrationPlan;
use crate::query::executor::CqlExecutor;
use crate::query::generator::{self, IdRange};
use crate::query::statement::Statement;
use crate::schema::{Index, KeyspaceDefinition, Object, ObjectDefinition, ID_FIELD};
use crate::sharding::{ShardId, ShardSelection};
use crate::storage::session::ResultSet;
use crate::storage::{SortOrder, Value};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use ulid::{Generator, Ulid};

/// Rows fetched from the primary table per `id IN (...)` read
const FETCH_CHUNK: usize = 100;

/// Which index to read and how
///
/// The set of field names picks the index (in any order); the optional
/// timestamps bound the primary key's time component, both ends inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    pub index_keys: BTreeMap<String, Value>,
    pub start_timestamp: Option<u64>,
    pub end_timestamp: Option<u64>,
    pub ordering: SortOrder,
    pub limit: Option<usize>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.index_keys.insert(field.into(), value.into());
        self
    }

    pub fn start_timestamp(mut self, ms: u64) -> Self {
        self.start_timestamp = Some(ms);
        self
    }

    pub fn end_timestamp(mut self, ms: u64) -> Self {
        self.end_timestamp = Some(ms);
        self
    }

    pub fn ordering(mut self, ordering: SortOrder) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Maps objects of one keyspace onto their primary and index tables
pub struct ObjectMapper {
    executor: CqlExecutor,
    keyspace: RwLock<Arc<KeyspaceDefinition>>,
    consistency_horizon: Duration,
    scan_page_size: usize,
    scan_range_count: usize,
    ids: Mutex<Generator>,
}

impl ObjectMapper {
    pub fn new(
        executor: CqlExecutor,
        keyspace: KeyspaceDefinition,
        config: &SessionConfig,
    ) -> Self {
        Self {
            executor,
            keyspace: RwLock::new(Arc::new(keyspace)),
            consistency_horizon: config.consistency_horizon(),
            scan_page_size: config.scan_page_size,
            scan_range_count: config.scan_range_count,
            ids: Mutex::new(Generator::new()),
        }
    }

    /// The definition currently in force; migrations replace it wholesale
    pub fn keyspace_definition(&self) -> Arc<KeyspaceDefinition> {
        Arc::clone(&self.keyspace.read())
    }

    pub fn executor(&self) -> &CqlExecutor {
        &self.executor
    }

    fn next_id(&self) -> Ulid {
        self.ids.lock().generate().unwrap_or_else(|_| Ulid::new())
    }

    fn primary_key(def: &ObjectDefinition, id: &Value) -> Result<Value> {
        id.coerce(&def.primary_key_type()).ok_or_else(|| {
            Error::schema(format!(
                "`{id}` is not a valid {} key for `{}`",
                def.primary_key_type(),
                def.name()
            ))
        })
    }

    /// Run a write: primary statement first, then the fan-out
    fn write(&self, mut statements: Vec<Statement>) -> Result<()> {
        if statements.is_empty() {
            return Ok(());
        }
        let fan_out = statements.split_off(1);
        self.executor.execute_sync(&statements[0])?;
        self.execute_each(fan_out)?;
        Ok(())
    }

    fn execute_each(&self, mut statements: Vec<Statement>) -> Result<Vec<ResultSet>> {
        match statements.len() {
            0 => Ok(Vec::new()),
            1 => Ok(vec![self.executor.execute_sync(&statements.remove(0))?]),
            _ => self.executor.execute_all(statements),
        }
    }

    /// Coerced object, its key and the statements inserting it
    fn prepare_insert(
        &self,
        def: &ObjectDefinition,
        fields: &Object,
        timestamp_ms: Option<u64>,
    ) -> Result<(Value, Object, Vec<Statement>)> {
        let mut object = def.coerce_values(fields)?;
        let id = if def.generates_keys() {
            Value::TimeId(match timestamp_ms {
                Some(ms) => generator::key_at(ms),
                None => self.next_id(),
            })
        } else {
            match object.get(ID_FIELD) {
                Some(id) if !id.is_null() => id.clone(),
                _ => {
                    return Err(Error::constraint(format!(
                        "`{}` objects need a non-null `{ID_FIELD}`",
                        def.name()
                    )))
                }
            }
        };
        let statements = generator::insert_statements(def, &id, &object)?;
        object.insert(ID_FIELD.to_string(), id.clone());
        Ok((id, object, statements))
    }

    /// Insert a new object and return its primary key
    pub fn insert(&self, object_type: &str, fields: &Object) -> Result<Value> {
        self.insert_with(object_type, fields, None)
    }

    /// Insert with a key embedding `timestamp_ms`, for backfills
    ///
    /// Types with a caller-supplied key ignore the timestamp.
    pub fn insert_at(
        &self,
        object_type: &str,
        fields: &Object,
        timestamp_ms: u64,
    ) -> Result<Value> {
        self.insert_with(object_type, fields, Some(timestamp_ms))
    }

    fn insert_with(
        &self,
        object_type: &str,
        fields: &Object,
        timestamp_ms: Option<u64>,
    ) -> Result<Value> {
        let keyspace = self.keyspace_definition();
        let def = keyspace.require(object_type)?;
        let (id, object, mut statements) = self.prepare_insert(def, fields, timestamp_ms)?;
        statements.push(generator::changelog_insert(def, &id, self.next_id(), &object));
        self.write(statements)?;
        Ok(id)
    }

    pub fn get_by_key(&self, object_type: &str, id: &Value) -> Result<Option<Object>> {
        let keyspace = self.keyspace_definition();
        let def = keyspace.require(object_type)?;
        let id = Self::primary_key(def, id)?;
        let rows = self.executor.execute_sync(&generator::select_by_key(def, &id))?;
        Ok(rows.into_iter().next())
    }

    /// Merge `changes` onto a stored object and move its index rows
    ///
    /// Returns the object's key, which never changes. A null value clears
    /// the field.
    pub fn update(&self, object_type: &str, id: &Value, changes: &Object) -> Result<Value> {
        let keyspace = self.keyspace_definition();
        let def = keyspace.require(object_type)?;
        let id = Self::primary_key(def, id)?;
        let mut changes = def.coerce_values(changes)?;
        if let Some(new_id) = changes.remove(ID_FIELD) {
            if new_id != id {
                return Err(Error::schema(format!(
                    "the key of a `{}` object cannot be changed",
                    def.name()
                )));
            }
        }

        let before = self
            .executor
            .execute_sync(&generator::select_by_key(def, &id))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("`{}` object {id}", def.name())))?;
        let mut after = before.clone();
        for (name, value) in &changes {
            if value.is_null() {
                after.remove(name);
            } else {
                after.insert(name.clone(), value.clone());
            }
        }

        let mut statements = generator::update_statements(def, &id, &before, &after, &changes)?;
        statements.push(generator::changelog_insert(def, &id, self.next_id(), &after));
        self.write(statements)?;
        Ok(id)
    }

    /// Remove an object from every index it appears in, then its primary row
    ///
    /// Deleting an absent object is a no-op.
    pub fn delete(&self, object_type: &str, id: &Value) -> Result<()> {
        let keyspace = self.keyspace_definition();
        let def = keyspace.require(object_type)?;
        let id = Self::primary_key(def, id)?;
        let Some(current) = self
            .executor
            .execute_sync(&generator::select_by_key(def, &id))?
            .into_iter()
            .next()
        else {
            return Ok(());
        };
        let mut statements = generator::delete_statements(def, &id, &current);
        let primary = statements.pop();
        self.execute_each(statements)?;
        if let Some(primary) = primary {
            self.executor.execute_sync(&primary)?;
        }
        Ok(())
    }

    /// The index covering the criteria's fields and its key tuple
    fn resolve<'d>(
        def: &'d ObjectDefinition,
        criteria: &Criteria,
    ) -> Result<(&'d Index, Vec<Value>)> {
        let index = def
            .index_for_fields(criteria.index_keys.keys().map(String::as_str))
            .ok_or_else(|| {
                Error::schema(format!(
                    "`{}` has no index on fields ({})",
                    def.name(),
                    criteria
                        .index_keys
                        .keys()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })?;
        let mut values = Object::new();
        for (name, value) in &criteria.index_keys {
            values.insert(name.clone(), def.coerce_value(name, value)?);
        }
        let key = index.key_values(&values).ok_or_else(|| {
            Error::schema(format!("criteria on index `{}` contain a null value", index.name()))
        })?;
        Ok((index, key))
    }

    fn shards(
        &self,
        def: &ObjectDefinition,
        index: &Index,
        key: &[Value],
        criteria: &Criteria,
    ) -> Result<Vec<ShardId>> {
        match index
            .sharding()
            .shards_for_range(key, criteria.start_timestamp, criteria.end_timestamp)
        {
            ShardSelection::Exact(shards) => Ok(shards),
            selection @ ShardSelection::Span { .. } => {
                let rows = self
                    .executor
                    .execute_sync(&generator::select_shards(def, index, key))?;
                Ok(rows
                    .iter()
                    .filter_map(|row| row.get(generator::SHARD_COLUMN).and_then(Value::as_i64))
                    .filter(|shard| selection.contains(*shard))
                    .collect())
            }
        }
    }

    /// Matching keys across every shard, merged, ordered and limited
    fn matching_ids(&self, def: &ObjectDefinition, criteria: &Criteria) -> Result<Vec<Value>> {
        let (index, key) = Self::resolve(def, criteria)?;
        let range =
            IdRange::from_timestamps(def, criteria.start_timestamp, criteria.end_timestamp)?;
        let statements = self
            .shards(def, index, &key, criteria)?
            .into_iter()
            .map(|shard| {
                generator::select_index_ids(
                    def,
                    index,
                    shard,
                    &key,
                    &range,
                    criteria.ordering,
                    criteria.limit,
                )
            })
            .collect();
        let mut ids: Vec<Value> = self
            .execute_each(statements)?
            .into_iter()
            .flatten()
            .filter_map(|mut row| row.remove(ID_FIELD))
            .collect();
        ids.sort();
        ids.dedup();
        if criteria.ordering == SortOrder::Desc {
            ids.reverse();
        }
        if let Some(limit) = criteria.limit {
            ids.truncate(limit);
        }
        Ok(ids)
    }

    /// Objects matching `criteria`, newest key first unless ascending order is asked for
    pub fn list(&self, object_type: &str, criteria: &Criteria) -> Result<Vec<Object>> {
        let keyspace = self.keyspace_definition();
        let def = keyspace.require(object_type)?;
        let ids = self.matching_ids(def, criteria)?;

        let mut found: BTreeMap<Value, Object> = BTreeMap::new();
        for chunk in ids.chunks(FETCH_CHUNK) {
            let rows = self
                .executor
                .execute_sync(&generator::select_by_ids(def, chunk.to_vec()))?;
            for row in rows {
                if let Some(id) = row.get(ID_FIELD).cloned() {
                    found.insert(id, row);
                }
            }
        }
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    /// Number of objects `list` would return, read from the index tables only
    pub fn count(&self, object_type: &str, criteria: &Criteria) -> Result<u64> {
        let keyspace = self.keyspace_definition();
        let def = keyspace.require(object_type)?;
        let (index, key) = Self::resolve(def, criteria)?;
        let range =
            IdRange::from_timestamps(def, criteria.start_timestamp, criteria.end_timestamp)?;
        let statements = self
            .shards(def, index, &key, criteria)?
            .into_iter()
            .map(|shard| generator::count_index(def, index, shard, &key, &range, criteria.limit))
            .collect();
        let total: u64 = self
            .execute_each(statements)?
            .iter()
            .flatten()
            .filter_map(|row| row.get("count").and_then(Value::as_i64))
            .map(|n| n.max(0) as u64)
            .sum();
        Ok(match criteria.limit {
            Some(limit) => total.min(limit as u64),
            None => total,
        })
    }

    /// Insert objects of several types as one unlogged batch
    ///
    /// Every object is validated before the batch is sent. The batch is not
    /// atomic and does not append changelog entries.
    pub fn insert_batch_mixed(&self, objects: &BTreeMap<String, Vec<Object>>) -> Result<()> {
        let keyspace = self.keyspace_definition();
        let mut statements = Vec::new();
        for (object_type, batch) in objects {
            let def = keyspace.require(object_type)?;
            for fields in batch {
                let (_, _, generated) = self.prepare_insert(def, fields, None)?;
                statements.extend(generated);
            }
        }
        self.executor.execute_batch(&statements)
    }

    /// Lazy scan over every stored object of a type
    pub fn scan(&self, object_type: &str) -> Result<ObjectScan<'_>> {
        self.scan_from(object_type, ScanCursor::default())
    }

    /// Resume a scan where `cursor` left off
    pub fn scan_from(&self, object_type: &str, cursor: ScanCursor) -> Result<ObjectScan<'_>> {
        let keyspace = self.keyspace_definition();
        let def = keyspace.require(object_type)?.clone();
        Ok(ObjectScan::new(self, def, self.scan_range_count, self.scan_page_size, cursor))
    }

    /// Visit every object `should_include` accepts; returns how many were visited
    pub fn visit_objects<P, V>(
        &self,
        object_type: &str,
        mut should_include: P,
        mut visit: V,
    ) -> Result<u64>
    where
        P: FnMut(&Object) -> bool,
        V: FnMut(Object),
    {
        let mut visited = 0;
        for object in self.scan(object_type)? {
            let object = object?;
            if should_include(&object) {
                visit(object);
                visited += 1;
            }
        }
        Ok(visited)
    }

    /// Prepare every insert shape of the keyspace ahead of the first write
    pub fn pre_prepare_insert_statements(&self) -> Result<()> {
        self.prepare_insert_shapes(&self.keyspace_definition())
    }

    fn prepare_insert_shapes(&self, keyspace: &KeyspaceDefinition) -> Result<()> {
        for statement in generator::insert_shapes(keyspace) {
            self.executor.prepare(&statement)?;
        }
        Ok(())
    }

    /// Statements `run_migration` would execute, without executing them
    pub fn plan_migration(
        &self,
        next: &KeyspaceDefinition,
        force: bool,
    ) -> Result<MigrationPlan> {
        MigrationPlan::diff(&self.keyspace_definition(), next, force)
    }

    /// Apply the additive part of `next` and make the plan's target the definition in force
    ///
    /// The target is stored and swapped in only after every statement ran and
    /// every insert shape of it prepared, so a failed migration leaves the
    /// stored definition untouched.
    pub fn run_migration(&self, next: KeyspaceDefinition, force: bool) -> Result<MigrationPlan> {
        let plan = self.plan_migration(&next, force)?;
        for statement in plan.statements() {
            self.executor.execute_sync(statement)?;
        }
        let target = plan.target();
        self.prepare_insert_shapes(target)?;
        self.executor
            .execute_sync(&generator::store_keyspace_definition(target)?)?;
        info!(
            keyspace = target.name(),
            statements = plan.statements().len(),
            ignored = plan.ignored().len(),
            "migration applied"
        );
        *self.keyspace.write() = Arc::new(target.clone());
        Ok(plan)
    }

    /// Close the session behind this mapper
    pub fn teardown(&self) {
        self.executor.close();
    }
}
