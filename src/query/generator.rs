// Statement generator
// Turns a schema plus one logical operation into the physical statements
// that realise it: keyspace and table DDL, fan-out writes over the primary
// table and every index table, index deltas for updates, and the reads used
// by list/count/scan and the changelog. Nothing here touches a session.

use super::statement::{RangeOp, Replication, Select, Statement, TokenBound};
use crate::error::{Error, Result};
use crate::schema::{DataType, Field, Index, KeyspaceDefinition, Object, ObjectDefinition, ID_FIELD};
use crate::sharding::ShardId;
use crate::storage::page::{Token, TokenRange};
use crate::storage::{ColumnSpec, SortOrder, TableSpec, Value};
use std::time::{Duration, UNIX_EPOCH};
use ulid::Ulid;

pub const KEYSPACE_DEFINITIONS_TABLE: &str = "__keyspace_definitions";
pub const INDEX_UPDATES_TABLE: &str = "__index_updates";
pub const SHARD_INDEX_TABLE: &str = "__shardindex";

/// Shard column leading every index table's partition key
pub const SHARD_COLUMN: &str = "shardid";

/// Inclusive bounds on the primary key of a range read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdRange {
    pub lower: Option<Value>,
    pub upper: Option<Value>,
}

impl IdRange {
    /// Translate a millisecond time window into key bounds
    ///
    /// Only time-ordered keys can be bounded by time.
    pub fn from_timestamps(
        def: &ObjectDefinition,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<Self> {
        if (start.is_some() || end.is_some()) && !def.has_time_ordered_key() {
            return Err(Error::schema(format!(
                "`{}` has no time-ordered key to apply a timestamp range to",
                def.name()
            )));
        }
        Ok(Self {
            lower: start.map(|ms| Value::TimeId(Ulid::from_parts(ms, 0))),
            upper: end.map(|ms| Value::TimeId(Ulid::from_parts(ms, u128::MAX))),
        })
    }
}

/// Milliseconds embedded in a time-ordered key; 0 for any other key
pub fn key_timestamp(id: &Value) -> u64 {
    id.as_time_id().map_or(0, |ulid| ulid.timestamp_ms())
}

/// A generated key embedding `timestamp_ms`
pub fn key_at(timestamp_ms: u64) -> Ulid {
    Ulid::from_datetime(UNIX_EPOCH + Duration::from_millis(timestamp_ms))
}

fn replication(def: &KeyspaceDefinition) -> Replication {
    Replication {
        class: def.replication_class().to_string(),
        factors: def.replication_factors().clone(),
    }
}

pub fn create_keyspace(def: &KeyspaceDefinition) -> Statement {
    Statement::CreateKeyspace {
        name: def.name().to_string(),
        replication: replication(def),
    }
}

pub fn alter_keyspace(def: &KeyspaceDefinition) -> Statement {
    Statement::AlterKeyspace {
        name: def.name().to_string(),
        replication: replication(def),
    }
}

pub fn drop_keyspace(name: &str) -> Statement {
    Statement::DropKeyspace {
        name: name.to_string(),
    }
}

fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

/// Tables every keyspace carries besides its object tables
pub fn system_tables() -> Vec<Statement> {
    let specs = [
        TableSpec {
            name: KEYSPACE_DEFINITIONS_TABLE.to_string(),
            columns: vec![
                ColumnSpec::new("name", DataType::Varchar),
                ColumnSpec::new("def", DataType::Varchar),
            ],
            partition_key: keys(&["name"]),
            clustering_key: Vec::new(),
            clustering_order: SortOrder::Desc,
        },
        TableSpec {
            name: INDEX_UPDATES_TABLE.to_string(),
            columns: vec![
                ColumnSpec::new("statictablename", DataType::Varchar),
                ColumnSpec::new("instanceid", DataType::Varchar),
                ColumnSpec::new("id", DataType::TimeUuid),
                ColumnSpec::new("indexvalues", DataType::Varchar),
            ],
            partition_key: keys(&["statictablename", "instanceid"]),
            clustering_key: keys(&["id"]),
            clustering_order: SortOrder::Desc,
        },
        TableSpec {
            name: SHARD_INDEX_TABLE.to_string(),
            columns: vec![
                ColumnSpec::new("tablename", DataType::Varchar),
                ColumnSpec::new("indexvalues", DataType::Varchar),
                ColumnSpec::new(SHARD_COLUMN, DataType::BigInt),
            ],
            partition_key: keys(&["tablename", "indexvalues"]),
            clustering_key: keys(&[SHARD_COLUMN]),
            clustering_order: SortOrder::Desc,
        },
    ];
    specs
        .into_iter()
        .map(|spec| Statement::CreateTable {
            spec,
            if_not_exists: true,
        })
        .collect()
}

pub fn primary_table_spec(def: &ObjectDefinition) -> TableSpec {
    let mut columns = vec![ColumnSpec::new(ID_FIELD, def.primary_key_type())];
    columns.extend(
        def.fields()
            .filter(|f| f.name != ID_FIELD)
            .map(|f| ColumnSpec::new(f.name.clone(), f.data_type)),
    );
    TableSpec {
        name: def.name().to_string(),
        columns,
        partition_key: keys(&[ID_FIELD]),
        clustering_key: Vec::new(),
        clustering_order: SortOrder::Desc,
    }
}

/// `<type><16 hex digits of the canonical key's hash>`
pub fn index_table_name(def: &ObjectDefinition, index: &Index) -> String {
    let canonical = index.canonical_key().join(":");
    format!("{}{:016x}", def.name(), seahash::hash(canonical.as_bytes()))
}

pub fn index_table_spec(def: &ObjectDefinition, index: &Index) -> TableSpec {
    let mut columns = vec![ColumnSpec::new(SHARD_COLUMN, DataType::BigInt)];
    let mut partition_key = vec![SHARD_COLUMN.to_string()];
    for name in index.canonical_key() {
        let data_type = def.field(name).map_or(DataType::Varchar, |f| f.data_type);
        columns.push(ColumnSpec::new(name.clone(), data_type));
        partition_key.push(name.clone());
    }
    columns.push(ColumnSpec::new(ID_FIELD, def.primary_key_type()));
    TableSpec {
        name: index_table_name(def, index),
        columns,
        partition_key,
        clustering_key: keys(&[ID_FIELD]),
        clustering_order: SortOrder::Desc,
    }
}

pub fn create_index_table(def: &ObjectDefinition, index: &Index) -> Statement {
    Statement::CreateTable {
        spec: index_table_spec(def, index),
        if_not_exists: true,
    }
}

/// Primary table plus one table per index
pub fn create_object_tables(def: &ObjectDefinition) -> Vec<Statement> {
    let mut statements = vec![Statement::CreateTable {
        spec: primary_table_spec(def),
        if_not_exists: true,
    }];
    statements.extend(def.indexes().map(|index| create_index_table(def, index)));
    statements
}

pub fn add_field(def: &ObjectDefinition, field: &Field) -> Statement {
    Statement::AddColumn {
        table: def.name().to_string(),
        column: ColumnSpec::new(field.name.clone(), field.data_type),
    }
}

/// Every table DDL a keyspace needs, system tables first
pub fn keyspace_tables(def: &KeyspaceDefinition) -> Vec<Statement> {
    let mut statements = system_tables();
    for object in def.definitions() {
        statements.extend(create_object_tables(object));
    }
    statements
}

/// JSON text of a key tuple, used to address `__shardindex` rows
pub fn encode_index_values(key: &[Value]) -> String {
    serde_json::Value::Array(key.iter().map(Value::to_json).collect()).to_string()
}

fn shard_of(index: &Index, key: &[Value], id: &Value) -> ShardId {
    index.sharding().shard_id(key, key_timestamp(id))
}

fn index_row(index: &Index, shard: ShardId, key: &[Value], id: &Value) -> Vec<(String, Value)> {
    let mut values = vec![(SHARD_COLUMN.to_string(), Value::BigInt(shard))];
    values.extend(index.canonical_key().iter().cloned().zip(key.iter().cloned()));
    values.push((ID_FIELD.to_string(), id.clone()));
    values
}

fn index_insert(
    def: &ObjectDefinition,
    index: &Index,
    key: &[Value],
    id: &Value,
) -> Vec<Statement> {
    let shard = shard_of(index, key, id);
    let table = index_table_name(def, index);
    let mut statements = vec![Statement::Insert {
        table: table.clone(),
        values: index_row(index, shard, key, id),
    }];
    if index.sharding().needs_shard_index() {
        statements.push(Statement::Insert {
            table: SHARD_INDEX_TABLE.to_string(),
            values: vec![
                ("tablename".to_string(), Value::Text(table)),
                ("indexvalues".to_string(), Value::Text(encode_index_values(key))),
                (SHARD_COLUMN.to_string(), Value::BigInt(shard)),
            ],
        });
    }
    statements
}

fn index_delete(def: &ObjectDefinition, index: &Index, key: &[Value], id: &Value) -> Statement {
    let shard = shard_of(index, key, id);
    Statement::Delete {
        table: index_table_name(def, index),
        key: index_row(index, shard, key, id),
    }
}

fn missing_index_field(def: &ObjectDefinition, index: &Index) -> Error {
    Error::constraint(format!(
        "`{}` requires every field of index `{}` ({}) to be set",
        def.name(),
        index.name(),
        index.key_string()
    ))
}

/// Check every index can be written for `object`
///
/// Objects missing a composite field are rejected unless the type allows
/// null key inserts, in which case that index row is simply skipped.
pub fn check_constraints(def: &ObjectDefinition, object: &Object) -> Result<()> {
    if def.allow_null_primary_key_inserts() {
        return Ok(());
    }
    match def.indexes().find(|index| index.key_values(object).is_none()) {
        Some(index) => Err(missing_index_field(def, index)),
        None => Ok(()),
    }
}

/// Primary row write with every declared column, so all inserts of a type
/// share one statement shape
fn primary_insert(def: &ObjectDefinition, id: &Value, object: &Object) -> Statement {
    let mut values = vec![(ID_FIELD.to_string(), id.clone())];
    values.extend(
        def.fields()
            .filter(|f| f.name != ID_FIELD)
            .map(|f| (f.name.clone(), object.get(&f.name).cloned().unwrap_or(Value::Null))),
    );
    Statement::Insert {
        table: def.name().to_string(),
        values,
    }
}

/// Primary write followed by the fan-out to every eligible index
pub fn insert_statements(
    def: &ObjectDefinition,
    id: &Value,
    object: &Object,
) -> Result<Vec<Statement>> {
    check_constraints(def, object)?;
    let mut statements = vec![primary_insert(def, id, object)];
    for index in def.indexes() {
        if let Some(key) = index.key_values(object) {
            statements.extend(index_insert(def, index, &key, id));
        }
    }
    Ok(statements)
}

/// Primary merge of `changes` followed by index deltas between `before` and `after`
///
/// An index whose key tuple is the same before and after gets no statement.
pub fn update_statements(
    def: &ObjectDefinition,
    id: &Value,
    before: &Object,
    after: &Object,
    changes: &Object,
) -> Result<Vec<Statement>> {
    check_constraints(def, after)?;
    let mut values = vec![(ID_FIELD.to_string(), id.clone())];
    values.extend(
        changes
            .iter()
            .filter(|(name, _)| name.as_str() != ID_FIELD)
            .map(|(name, value)| (name.clone(), value.clone())),
    );
    let mut statements = vec![Statement::Insert {
        table: def.name().to_string(),
        values,
    }];
    for index in def.indexes() {
        let old_key = index.key_values(before);
        let new_key = index.key_values(after);
        if old_key == new_key {
            continue;
        }
        if let Some(key) = old_key {
            statements.push(index_delete(def, index, &key, id));
        }
        if let Some(key) = new_key {
            statements.extend(index_insert(def, index, &key, id));
        }
    }
    Ok(statements)
}

/// One delete per index holding `current`, then the primary row
pub fn delete_statements(def: &ObjectDefinition, id: &Value, current: &Object) -> Vec<Statement> {
    let mut statements: Vec<Statement> = def
        .indexes()
        .filter_map(|index| {
            index
                .key_values(current)
                .map(|key| index_delete(def, index, &key, id))
        })
        .collect();
    statements.push(Statement::Delete {
        table: def.name().to_string(),
        key: vec![(ID_FIELD.to_string(), id.clone())],
    });
    statements
}

pub fn select_by_key(def: &ObjectDefinition, id: &Value) -> Statement {
    Select::from(def.name()).eq(ID_FIELD, id.clone()).build()
}

pub fn select_by_ids(def: &ObjectDefinition, ids: Vec<Value>) -> Statement {
    Select::from(def.name()).any_of(ID_FIELD, ids).build()
}

/// Shards of a time-bucketed index that hold rows for `key`
pub fn select_shards(def: &ObjectDefinition, index: &Index, key: &[Value]) -> Statement {
    Select::from(SHARD_INDEX_TABLE)
        .columns(&[SHARD_COLUMN])
        .eq("tablename", Value::Text(index_table_name(def, index)))
        .eq("indexvalues", Value::Text(encode_index_values(key)))
        .build()
}

fn index_select(
    def: &ObjectDefinition,
    index: &Index,
    shard: ShardId,
    key: &[Value],
    range: &IdRange,
) -> Select {
    let mut select =
        Select::from(index_table_name(def, index)).eq(SHARD_COLUMN, Value::BigInt(shard));
    for (field, value) in index.canonical_key().iter().zip(key) {
        select = select.eq(field.clone(), value.clone());
    }
    if let Some(lower) = &range.lower {
        select = select.range(ID_FIELD, RangeOp::Gte, lower.clone());
    }
    if let Some(upper) = &range.upper {
        select = select.range(ID_FIELD, RangeOp::Lte, upper.clone());
    }
    select
}

/// Ids in one shard of an index, ordered by key
pub fn select_index_ids(
    def: &ObjectDefinition,
    index: &Index,
    shard: ShardId,
    key: &[Value],
    range: &IdRange,
    order: SortOrder,
    limit: Option<usize>,
) -> Statement {
    let mut select = index_select(def, index, shard, key, range)
        .columns(&[ID_FIELD])
        .order_by(ID_FIELD, order);
    if let Some(limit) = limit {
        select = select.limit(limit);
    }
    select.build()
}

pub fn count_index(
    def: &ObjectDefinition,
    index: &Index,
    shard: ShardId,
    key: &[Value],
    range: &IdRange,
    limit: Option<usize>,
) -> Statement {
    let mut select = index_select(def, index, shard, key, range).count();
    if let Some(limit) = limit {
        select = select.limit(limit);
    }
    select.build()
}

/// One bounded page of a primary table token range, after `after` when resuming
pub fn scan_page(
    def: &ObjectDefinition,
    range: &TokenRange,
    after: Option<Token>,
    limit: usize,
) -> Statement {
    let pk = keys(&[ID_FIELD]);
    Select::from(def.name())
        .with_token(&pk)
        .token_range(&pk, after.or(range.start).map(TokenBound::Token), Some(range.end))
        .limit(limit)
        .build()
}

/// Changelog append: one JSON snapshot of the index-relevant values
pub fn changelog_insert(
    def: &ObjectDefinition,
    instance: &Value,
    entry: Ulid,
    object: &Object,
) -> Statement {
    let snapshot: serde_json::Map<String, serde_json::Value> = def
        .index_values(object)
        .into_iter()
        .map(|(name, value)| (name, value.to_json()))
        .collect();
    Statement::Insert {
        table: INDEX_UPDATES_TABLE.to_string(),
        values: vec![
            ("statictablename".to_string(), Value::Text(def.name().to_string())),
            ("instanceid".to_string(), Value::Text(instance.to_string())),
            ("id".to_string(), Value::TimeId(entry)),
            (
                "indexvalues".to_string(),
                Value::Text(serde_json::Value::Object(snapshot).to_string()),
            ),
        ],
    }
}

fn changelog_key(object_name: &str, instance_id: &str) -> Vec<Value> {
    vec![
        Value::Text(object_name.to_string()),
        Value::Text(instance_id.to_string()),
    ]
}

/// First changelog partition whose token follows the cursor's
pub fn next_changelog_partition(after: Option<(&str, &str)>) -> Statement {
    let pk = keys(&["statictablename", "instanceid"]);
    Select::from(INDEX_UPDATES_TABLE)
        .columns(&["statictablename", "instanceid"])
        .token_range(
            &pk,
            after.map(|(name, instance)| TokenBound::OfKey(changelog_key(name, instance))),
            None,
        )
        .limit(1)
        .build()
}

/// Every snapshot of one instance, newest first
pub fn changelog_entries(object_name: &str, instance_id: &str) -> Statement {
    Select::from(INDEX_UPDATES_TABLE)
        .eq("statictablename", Value::Text(object_name.to_string()))
        .eq("instanceid", Value::Text(instance_id.to_string()))
        .order_by("id", SortOrder::Desc)
        .build()
}

pub fn changelog_delete(object_name: &str, instance_id: &str, entry: Ulid) -> Statement {
    Statement::Delete {
        table: INDEX_UPDATES_TABLE.to_string(),
        key: vec![
            ("statictablename".to_string(), Value::Text(object_name.to_string())),
            ("instanceid".to_string(), Value::Text(instance_id.to_string())),
            ("id".to_string(), Value::TimeId(entry)),
        ],
    }
}

pub fn store_keyspace_definition(def: &KeyspaceDefinition) -> Result<Statement> {
    Ok(Statement::Insert {
        table: KEYSPACE_DEFINITIONS_TABLE.to_string(),
        values: vec![
            ("name".to_string(), Value::Text(def.name().to_string())),
            ("def".to_string(), Value::Text(def.to_json()?)),
        ],
    })
}

pub fn load_keyspace_definition(name: &str) -> Statement {
    Select::from(KEYSPACE_DEFINITIONS_TABLE)
        .columns(&["def"])
        .eq("name", Value::Text(name.to_string()))
        .build()
}

/// Representative insert of every shape a keyspace writes, for statement warm-up
pub fn insert_shapes(def: &KeyspaceDefinition) -> Vec<Statement> {
    let mut shapes = Vec::new();
    for object in def.definitions() {
        let id = Value::Null;
        let empty = Object::new();
        shapes.push(primary_insert(object, &id, &empty));
        for index in object.indexes() {
            let key = vec![Value::Null; index.canonical_key().len()];
            shapes.extend(index_insert(object, index, &key, &id));
        }
        shapes.push(changelog_insert(object, &id, Ulid::nil(), &empty));
    }
    let mut seen = std::collections::HashSet::new();
    shapes.retain(|statement| seen.insert(statement.cql()));
    shapes
}
