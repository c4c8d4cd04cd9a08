// Object definitions
// An object type is a set of typed fields plus composite-key indexes. Indexes
// are looked up by their canonical key (sorted field names), so the order a
// caller lists fields in never matters.

use super::{DataType, Field, ID_FIELD};
use crate::error::{Error, Result};
use crate::sharding::ShardingStrategy;
use crate::storage::Value;
use std::collections::{BTreeMap, BTreeSet};

/// An object instance: field name to value
pub type Object = BTreeMap<String, Value>;

/// A composite-key secondary index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    name: String,
    /// Fields in declaration order
    fields: Vec<String>,
    /// Fields sorted and deduplicated; this is the lookup key
    canonical: Vec<String>,
    sharding: ShardingStrategy,
}

impl Index {
    pub fn new(
        name: impl Into<String>,
        fields: Vec<String>,
        sharding: ShardingStrategy,
    ) -> Result<Self> {
        let name = name.into();
        if fields.is_empty() {
            return Err(Error::schema(format!("index `{name}` has an empty key")));
        }
        let canonical = canonical_key(fields.iter().map(String::as_str));
        if canonical.len() != fields.len() {
            return Err(Error::schema(format!("index `{name}` repeats a field")));
        }
        Ok(Self {
            name,
            fields,
            canonical,
            sharding,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Sorted field names; index table columns and key tuples use this order
    pub fn canonical_key(&self) -> &[String] {
        &self.canonical
    }

    /// Colon-joined declaration-order key, as written in schema documents
    pub fn key_string(&self) -> String {
        self.fields.join(":")
    }

    pub fn sharding(&self) -> &ShardingStrategy {
        &self.sharding
    }

    /// The index key tuple of `object` in canonical order
    ///
    /// None when any composite field is missing or null: such an object has
    /// no row in this index.
    pub fn key_values(&self, object: &Object) -> Option<Vec<Value>> {
        self.canonical
            .iter()
            .map(|field| object.get(field).filter(|v| !v.is_null()).cloned())
            .collect()
    }
}

/// Sort and deduplicate a set of field names
pub fn canonical_key<'a>(fields: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    fields
        .into_iter()
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// The immutable definition of one object type
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDefinition {
    name: String,
    fields: BTreeMap<String, Field>,
    indexes: BTreeMap<String, Index>,
    indexes_by_key: BTreeMap<Vec<String>, String>,
    required_fields: BTreeSet<String>,
    allow_null_primary_key_inserts: bool,
}

impl ObjectDefinition {
    /// Validate and assemble a definition
    ///
    /// Rejects duplicate field or index names, two indexes with the same
    /// canonical key, indexes over undeclared fields, and time bucketing on
    /// a type whose primary key is not time ordered.
    pub fn new(
        name: impl Into<String>,
        fields: Vec<Field>,
        indexes: Vec<Index>,
        allow_null_primary_key_inserts: bool,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::schema("object definition without a name"));
        }

        let mut field_map = BTreeMap::new();
        for field in fields {
            if field_map.contains_key(&field.name) {
                return Err(Error::schema(format!(
                    "duplicate field `{}` in `{name}`",
                    field.name
                )));
            }
            field_map.insert(field.name.clone(), field);
        }

        let time_key = field_map
            .get(ID_FIELD)
            .map_or(true, |f| f.data_type == DataType::TimeUuid);

        let mut index_map = BTreeMap::new();
        let mut indexes_by_key = BTreeMap::new();
        let mut required_fields = BTreeSet::new();
        for index in indexes {
            if index_map.contains_key(index.name()) {
                return Err(Error::schema(format!(
                    "duplicate index `{}` in `{name}`",
                    index.name()
                )));
            }
            for field in index.fields() {
                if !field_map.contains_key(field) {
                    return Err(Error::schema(format!(
                        "index `{}` of `{name}` references undeclared field `{field}`",
                        index.name()
                    )));
                }
            }
            if index.sharding().is_time_based() && !time_key {
                return Err(Error::schema(format!(
                    "index `{}` of `{name}` is time bucketed but `{name}` has no time-ordered key",
                    index.name()
                )));
            }
            if let Some(existing) = indexes_by_key.get(index.canonical_key()) {
                return Err(Error::schema(format!(
                    "indexes `{existing}` and `{}` of `{name}` share the same fields",
                    index.name()
                )));
            }
            required_fields.extend(index.fields().iter().cloned());
            indexes_by_key.insert(index.canonical_key().to_vec(), index.name().to_string());
            index_map.insert(index.name().to_string(), index);
        }

        Ok(Self {
            name,
            fields: field_map,
            indexes: index_map,
            indexes_by_key,
            required_fields,
            allow_null_primary_key_inserts,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.values()
    }

    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.get(name)
    }

    pub fn indexes(&self) -> impl Iterator<Item = &Index> {
        self.indexes.values()
    }

    /// Find the index covering exactly this set of fields, in any order
    pub fn index_for_fields<'a>(
        &self,
        fields: impl IntoIterator<Item = &'a str>,
    ) -> Option<&Index> {
        let key = canonical_key(fields);
        self.indexes_by_key
            .get(&key)
            .and_then(|name| self.indexes.get(name))
    }

    /// Union of every index's composite fields
    pub fn required_fields(&self) -> &BTreeSet<String> {
        &self.required_fields
    }

    pub fn allow_null_primary_key_inserts(&self) -> bool {
        self.allow_null_primary_key_inserts
    }

    /// The index-relevant subset of `values`; missing required fields become Null
    pub fn index_values(&self, values: &Object) -> Object {
        self.required_fields
            .iter()
            .map(|f| (f.clone(), values.get(f).cloned().unwrap_or(Value::Null)))
            .collect()
    }

    /// Type of the primary key column
    pub fn primary_key_type(&self) -> DataType {
        self.fields
            .get(ID_FIELD)
            .map_or(DataType::TimeUuid, |f| f.data_type)
    }

    /// True when the key is generated rather than supplied by callers
    pub fn generates_keys(&self) -> bool {
        !self.fields.contains_key(ID_FIELD)
    }

    pub fn has_time_ordered_key(&self) -> bool {
        self.primary_key_type() == DataType::TimeUuid
    }

    /// Coerce every value to its field's type, rejecting unknown fields
    pub fn coerce_values(&self, values: &Object) -> Result<Object> {
        values
            .iter()
            .map(|(name, value)| Ok((name.clone(), self.coerce_value(name, value)?)))
            .collect()
    }

    pub fn coerce_value(&self, name: &str, value: &Value) -> Result<Value> {
        let field = self.fields.get(name).ok_or_else(|| {
            Error::schema(format!("`{}` has no field `{name}`", self.name))
        })?;
        value.coerce(&field.data_type).ok_or_else(|| {
            Error::schema(format!(
                "value `{value}` for `{}.{name}` is not a {}",
                self.name, field.data_type
            ))
        })
    }

    /// Read an object from a JSON map using the declared field types
    pub fn object_from_json(
        &self,
        json: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Object> {
        let mut object = Object::new();
        for (name, raw) in json {
            let field = self.fields.get(name).ok_or_else(|| {
                Error::schema(format!("`{}` has no field `{name}`", self.name))
            })?;
            let value = Value::from_json(raw, &field.data_type).ok_or_else(|| {
                Error::schema(format!(
                    "json value {raw} for `{}.{name}` is not a {}",
                    self.name, field.data_type
                ))
            })?;
            object.insert(name.clone(), value);
        }
        Ok(object)
    }
}
