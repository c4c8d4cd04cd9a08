// Schema module - immutable description of object types and their indexes
// A keyspace definition is parsed once from a JSON document, validated, and
// then only ever replaced wholesale (never mutated in place)

pub mod definition;
pub mod document;
pub mod keyspace;

pub use definition::{Index, Object, ObjectDefinition};
pub use keyspace::KeyspaceDefinition;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of the field that, when declared, holds a caller-supplied primary key
pub const ID_FIELD: &str = "id";

/// Field types a schema document may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Ascii,
    BigInt,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Text,
    Timestamp,
    Uuid,
    TimeUuid,
    Varchar,
    Varint,
}

impl DataType {
    /// The column type name used in generated DDL
    pub fn cql_name(&self) -> &'static str {
        match self {
            DataType::Ascii => "ascii",
            DataType::BigInt => "bigint",
            DataType::Blob => "blob",
            DataType::Boolean => "boolean",
            DataType::Counter => "counter",
            DataType::Decimal => "decimal",
            DataType::Double => "double",
            DataType::Float => "float",
            DataType::Int => "int",
            DataType::Text => "text",
            DataType::Timestamp => "timestamp",
            DataType::Uuid => "uuid",
            DataType::TimeUuid => "timeuuid",
            DataType::Varchar => "varchar",
            DataType::Varint => "varint",
        }
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let data_type = match s.to_ascii_lowercase().as_str() {
            "ascii" => DataType::Ascii,
            "bigint" => DataType::BigInt,
            "blob" => DataType::Blob,
            "boolean" => DataType::Boolean,
            "counter" => DataType::Counter,
            "decimal" => DataType::Decimal,
            "double" => DataType::Double,
            "float" => DataType::Float,
            "int" => DataType::Int,
            "text" => DataType::Text,
            "timestamp" => DataType::Timestamp,
            "uuid" => DataType::Uuid,
            "timeuuid" => DataType::TimeUuid,
            "varchar" => DataType::Varchar,
            "varint" => DataType::Varint,
            other => return Err(Error::schema(format!("unknown field type `{other}`"))),
        };
        Ok(data_type)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cql_name())
    }
}

/// A named, typed field of an object type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Default consistency level applied to every statement in a keyspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyLevel {
    Any,
    #[default]
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    LocalOne,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_names_round_trip() {
        for name in ["bigint", "timeuuid", "varchar", "blob", "counter"] {
            let data_type: DataType = name.parse().unwrap();
            assert_eq!(data_type.to_string(), name);
        }
        assert_eq!("BIGINT".parse::<DataType>().unwrap(), DataType::BigInt);
    }

    #[test]
    fn test_unknown_type_is_schema_error() {
        let err = "tinyint".parse::<DataType>().unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }
}
