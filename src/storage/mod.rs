// Storage module - the partitioned column store the mapper writes through
// Values and table layouts live here; the in-process cluster that executes
// statements against them lives in cluster.rs

pub mod cluster;
pub mod page;
pub mod session;
pub mod table;

use crate::schema::DataType;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use ulid::Ulid;
use uuid::Uuid;

/// One stored row: column name to value
pub type Row = BTreeMap<String, Value>;

/// A single cell value
///
/// Every field type in a schema document maps onto exactly one variant, see
/// [`Value::coerce`]. Values have a total order so they can be used as
/// partition and clustering keys.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i32),
    BigInt(i64),
    Double(f64),
    /// Milliseconds since the unix epoch
    Timestamp(i64),
    Text(String),
    Blob(Vec<u8>),
    Uuid(Uuid),
    /// Time-ordered unique id (generated primary keys, timeuuid fields)
    TimeId(Ulid),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_time_id(&self) -> Option<Ulid> {
        match self {
            Value::TimeId(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(i64::from(*i)),
            Value::BigInt(i) | Value::Timestamp(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Int(_) => 2,
            Value::BigInt(_) => 3,
            Value::Double(_) => 4,
            Value::Timestamp(_) => 5,
            Value::Text(_) => 6,
            Value::Blob(_) => 7,
            Value::Uuid(_) => 8,
            Value::TimeId(_) => 9,
        }
    }

    /// Normalise a caller-supplied value to the representation of `data_type`
    ///
    /// Returns None when the value cannot represent that type.
    pub fn coerce(&self, data_type: &DataType) -> Option<Value> {
        use DataType as T;
        let coerced = match (data_type, self) {
            (_, Value::Null) => Value::Null,
            (T::Ascii | T::Text | T::Varchar, Value::Text(s)) => Value::Text(s.clone()),
            (T::BigInt | T::Counter | T::Varint, Value::BigInt(i)) => Value::BigInt(*i),
            (T::BigInt | T::Counter | T::Varint, Value::Int(i)) => Value::BigInt(i64::from(*i)),
            (T::Int, Value::Int(i)) => Value::Int(*i),
            (T::Int, Value::BigInt(i)) => Value::Int(i32::try_from(*i).ok()?),
            (T::Double | T::Float | T::Decimal, Value::Double(f)) => Value::Double(*f),
            (T::Double | T::Float | T::Decimal, Value::Int(i)) => Value::Double(f64::from(*i)),
            (T::Double | T::Float | T::Decimal, Value::BigInt(i)) => Value::Double(*i as f64),
            (T::Boolean, Value::Boolean(b)) => Value::Boolean(*b),
            (T::Blob, Value::Blob(b)) => Value::Blob(b.clone()),
            (T::Timestamp, Value::Timestamp(t) | Value::BigInt(t)) => Value::Timestamp(*t),
            (T::Timestamp, Value::Int(t)) => Value::Timestamp(i64::from(*t)),
            (T::Uuid, Value::Uuid(u)) => Value::Uuid(*u),
            (T::Uuid, Value::Text(s)) => Value::Uuid(Uuid::parse_str(s).ok()?),
            (T::TimeUuid, Value::TimeId(id)) => Value::TimeId(*id),
            (T::TimeUuid, Value::Text(s)) => Value::TimeId(Ulid::from_string(s).ok()?),
            _ => return None,
        };
        Some(coerced)
    }

    /// Read a JSON document value as `data_type`
    pub fn from_json(json: &serde_json::Value, data_type: &DataType) -> Option<Value> {
        use serde_json::Value as Json;
        let raw = match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Boolean(*b),
            Json::String(s) => Value::Text(s.clone()),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::BigInt(i),
                None => Value::Double(n.as_f64()?),
            },
            Json::Array(items) => {
                let mut bytes = Vec::with_capacity(items.len());
                for item in items {
                    bytes.push(u8::try_from(item.as_u64()?).ok()?);
                }
                Value::Blob(bytes)
            }
            Json::Object(_) => return None,
        };
        raw.coerce(data_type)
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::BigInt(i) | Value::Timestamp(i) => Json::from(*i),
            Value::Double(f) => Json::from(*f),
            Value::Text(s) => Json::String(s.clone()),
            Value::Blob(b) => Json::Array(b.iter().map(|byte| Json::from(*byte)).collect()),
            Value::Uuid(u) => Json::String(u.to_string()),
            Value::TimeId(id) => Json::String(id.to_string()),
        }
    }

    /// Parse the textual form produced by `Display` back into `data_type`
    pub fn parse(text: &str, data_type: &DataType) -> Option<Value> {
        use DataType as T;
        let raw = match data_type {
            T::Ascii | T::Text | T::Varchar | T::Uuid | T::TimeUuid => {
                Value::Text(text.to_string())
            }
            T::BigInt | T::Counter | T::Varint | T::Int | T::Timestamp => {
                Value::BigInt(text.parse().ok()?)
            }
            T::Double | T::Float | T::Decimal => Value::Double(text.parse().ok()?),
            T::Boolean => Value::Boolean(text.parse().ok()?),
            T::Blob => return None,
        };
        raw.coerce(data_type)
    }

    /// Append a stable, type-tagged byte encoding of this value
    ///
    /// Used for shard hashing and partition tokens, so it must never change
    /// between releases.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.rank());
        match self {
            Value::Null => {}
            Value::Boolean(b) => out.push(u8::from(*b)),
            Value::Int(i) => out.extend_from_slice(&i.to_be_bytes()),
            Value::BigInt(i) | Value::Timestamp(i) => out.extend_from_slice(&i.to_be_bytes()),
            Value::Double(f) => out.extend_from_slice(&f.to_bits().to_be_bytes()),
            Value::Text(s) => {
                out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Blob(b) => {
                out.extend_from_slice(&(b.len() as u32).to_be_bytes());
                out.extend_from_slice(b);
            }
            Value::Uuid(u) => out.extend_from_slice(u.as_bytes()),
            Value::TimeId(id) => out.extend_from_slice(&id.0.to_be_bytes()),
        }
    }
}

/// Stable byte encoding of a key tuple
pub fn encode_key(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        value.encode_into(&mut out);
    }
    out
}

/// Hash a key tuple with SeaHash
pub fn hash_key(values: &[Value]) -> u64 {
    seahash::hash(&encode_key(values))
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::BigInt(a), Value::BigInt(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            (Value::Uuid(a), Value::Uuid(b)) => a.cmp(b),
            (Value::TimeId(a), Value::TimeId(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::BigInt(i) | Value::Timestamp(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Blob(b) => {
                write!(f, "0x")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::Uuid(u) => write!(f, "{u}"),
            Value::TimeId(id) => write!(f, "{id}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::BigInt(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<Ulid> for Value {
    fn from(id: Ulid) -> Self {
        Value::TimeId(id)
    }
}

impl From<Uuid> for Value {
    fn from(u: Uuid) -> Self {
        Value::Uuid(u)
    }
}

/// Clustering order of a table or a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortOrder::Asc => write!(f, "ASC"),
            SortOrder::Desc => write!(f, "DESC"),
        }
    }
}

/// A column declaration inside a table layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: DataType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Physical layout of one table: columns, partition key and clustering key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    pub partition_key: Vec<String>,
    pub clustering_key: Vec<String>,
    pub clustering_order: SortOrder,
}

impl TableSpec {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|col| col.name == name)
    }

    pub fn is_key_column(&self, name: &str) -> bool {
        self.partition_key.iter().any(|k| k == name)
            || self.clustering_key.iter().any(|k| k == name)
    }
}
