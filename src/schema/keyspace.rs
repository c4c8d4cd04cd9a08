// Keyspace definitions
// The top-level schema document: replication settings plus every object type

use super::document::KeyspaceDocument;
use super::{ConsistencyLevel, ObjectDefinition};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Replication settings and object types of one keyspace
#[derive(Debug, Clone, PartialEq)]
pub struct KeyspaceDefinition {
    name: String,
    replication_class: String,
    replication_factors: BTreeMap<String, u32>,
    consistency_level: ConsistencyLevel,
    definitions: BTreeMap<String, ObjectDefinition>,
}

impl KeyspaceDefinition {
    pub fn new(
        name: impl Into<String>,
        replication_class: impl Into<String>,
        replication_factors: BTreeMap<String, u32>,
        consistency_level: ConsistencyLevel,
        definitions: Vec<ObjectDefinition>,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::schema("keyspace definition without a name"));
        }
        let mut by_name = BTreeMap::new();
        for def in definitions {
            if by_name.contains_key(def.name()) {
                return Err(Error::schema(format!(
                    "duplicate object type `{}` in keyspace `{name}`",
                    def.name()
                )));
            }
            by_name.insert(def.name().to_string(), def);
        }
        Ok(Self {
            name,
            replication_class: replication_class.into(),
            replication_factors,
            consistency_level,
            definitions: by_name,
        })
    }

    /// Parse and validate a schema document
    ///
    /// Structural problems (bad JSON shape, unknown types, duplicates) are
    /// all reported as schema errors.
    pub fn from_json(json: &str) -> Result<Self> {
        let document: KeyspaceDocument =
            serde_json::from_str(json).map_err(|e| Error::schema(e.to_string()))?;
        document.into_definition()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Serialize back to the document format `from_json` reads
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&KeyspaceDocument::from_definition(self))?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn replication_class(&self) -> &str {
        &self.replication_class
    }

    pub fn replication_factors(&self) -> &BTreeMap<String, u32> {
        &self.replication_factors
    }

    pub fn consistency_level(&self) -> ConsistencyLevel {
        self.consistency_level
    }

    pub fn definition(&self, object_type: &str) -> Option<&ObjectDefinition> {
        self.definitions.get(object_type)
    }

    /// Like [`definition`](Self::definition) but unknown types are a schema error
    pub fn require(&self, object_type: &str) -> Result<&ObjectDefinition> {
        self.definitions.get(object_type).ok_or_else(|| {
            Error::schema(format!(
                "keyspace `{}` has no object type `{object_type}`",
                self.name
            ))
        })
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ObjectDefinition> {
        self.definitions.values()
    }

    /// A copy with `definition` added or replaced
    pub fn with_definition(&self, definition: ObjectDefinition) -> Self {
        let mut next = self.clone();
        next.definitions
            .insert(definition.name().to_string(), definition);
        next
    }
}
