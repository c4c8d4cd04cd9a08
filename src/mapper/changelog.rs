// Index changelog
// Every insert and update appends a snapshot of the object's index-relevant
// values to `__index_updates`, one partition per object. Consumers walk the
// partitions in token order with a cursor and only see a partition once its
// newest snapshot is older than the consistency horizon.

use super::ObjectMapper;
use crate::error::{Error, Result};
use crate::query::generator;
use crate::schema::{Object, ObjectDefinition};
use crate::storage::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use ulid::Ulid;

/// Cursor into the changelog: the partition last handed out
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexUpdateRowKey {
    pub object_name: String,
    pub instance_id: String,
}

/// One recorded state of an object's index values
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSnapshot {
    pub id: Ulid,
    pub values: Object,
}

impl IndexSnapshot {
    pub fn timestamp_ms(&self) -> u64 {
        self.id.timestamp_ms()
    }
}

/// Every snapshot of one object, newest first
#[derive(Debug, Clone, PartialEq)]
pub struct IndexUpdateRow {
    pub object_name: String,
    pub instance_id: String,
    pub snapshots: Vec<IndexSnapshot>,
}

impl IndexUpdateRow {
    pub fn row_key(&self) -> IndexUpdateRowKey {
        IndexUpdateRowKey {
            object_name: self.object_name.clone(),
            instance_id: self.instance_id.clone(),
        }
    }

    pub fn newest(&self) -> Option<&IndexSnapshot> {
        self.snapshots.first()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn text_column<'r>(row: &'r crate::storage::Row, column: &str) -> Result<&'r str> {
    row.get(column)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidQuery(format!("changelog row without `{column}`")))
}

/// Snapshot values typed by the current definition when the field still exists
fn snapshot_values(def: Option<&ObjectDefinition>, text: &str) -> Result<Object> {
    let json: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)?;
    let mut values = Object::new();
    for (name, raw) in json {
        let typed = def
            .and_then(|d| d.field(&name))
            .and_then(|field| Value::from_json(&raw, &field.data_type));
        let value = typed.unwrap_or_else(|| untyped(&raw));
        values.insert(name, value);
    }
    Ok(values)
}

fn untyped(raw: &serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match raw {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => n
            .as_i64()
            .map(Value::BigInt)
            .or_else(|| n.as_f64().map(Value::Double))
            .unwrap_or(Value::Null),
        other => Value::Text(other.as_str().map_or_else(|| other.to_string(), str::to_string)),
    }
}

impl ObjectMapper {
    /// The next changelog partition strictly after `after`
    ///
    /// None when there is no further partition, or when its newest snapshot
    /// is younger than the consistency horizon. In the second case callers
    /// retry later with the same cursor.
    pub fn get_next_update_index_row(
        &self,
        after: Option<&IndexUpdateRowKey>,
    ) -> Result<Option<IndexUpdateRow>> {
        let statement = generator::next_changelog_partition(
            after.map(|key| (key.object_name.as_str(), key.instance_id.as_str())),
        );
        let Some(partition) = self.executor.execute_sync(&statement)?.into_iter().next() else {
            return Ok(None);
        };
        let object_name = text_column(&partition, "statictablename")?.to_string();
        let instance_id = text_column(&partition, "instanceid")?.to_string();

        let keyspace = self.keyspace_definition();
        let def = keyspace.definition(&object_name);
        let rows = self
            .executor
            .execute_sync(&generator::changelog_entries(&object_name, &instance_id))?;
        let mut snapshots = Vec::with_capacity(rows.len());
        for row in &rows {
            let id = row
                .get("id")
                .and_then(Value::as_time_id)
                .ok_or_else(|| Error::InvalidQuery("changelog row without `id`".to_string()))?;
            let values = snapshot_values(def, text_column(row, "indexvalues")?)?;
            snapshots.push(IndexSnapshot { id, values });
        }

        let horizon = self.consistency_horizon.as_millis() as u64;
        match snapshots.first() {
            Some(newest) if newest.timestamp_ms().saturating_add(horizon) <= now_ms() => {
                Ok(Some(IndexUpdateRow {
                    object_name,
                    instance_id,
                    snapshots,
                }))
            }
            _ => {
                debug!(%object_name, %instance_id, "changelog entry inside consistency horizon");
                Ok(None)
            }
        }
    }

    /// Drop every snapshot of a consumed row except the newest
    pub fn delete_obsolete_update_index_rows(&self, row: &IndexUpdateRow) -> Result<()> {
        let deletes: Vec<_> = row
            .snapshots
            .iter()
            .skip(1)
            .map(|snapshot| {
                generator::changelog_delete(&row.object_name, &row.instance_id, snapshot.id)
            })
            .collect();
        self.executor.execute_batch(&deletes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, Field};

    #[test]
    fn test_snapshot_values_use_field_types() {
        let def = ObjectDefinition::new(
            "t",
            vec![Field::new("n", DataType::Int), Field::new("s", DataType::Text)],
            vec![],
            false,
        )
        .unwrap();
        let values = snapshot_values(Some(&def), r#"{"n": 3, "s": "x", "gone": 7}"#).unwrap();
        assert_eq!(values["n"], Value::Int(3));
        assert_eq!(values["s"], Value::from("x"));
        assert_eq!(values["gone"], Value::BigInt(7));

        let untyped = snapshot_values(None, r#"{"n": null}"#).unwrap();
        assert_eq!(untyped["n"], Value::Null);
    }
}
