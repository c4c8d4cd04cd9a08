// Schema documents
// Serde mirrors of the JSON format. Documents are converted into the
// validated definition types right after parsing and are never used beyond that.

use super::{ConsistencyLevel, DataType, Field, Index, KeyspaceDefinition, ObjectDefinition};
use crate::error::{Error, Result};
use crate::sharding::ShardingStrategy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KeyspaceDocument {
    name: String,
    #[serde(default = "default_replication_class")]
    replication_class: String,
    #[serde(default)]
    replication_factors: BTreeMap<String, u32>,
    #[serde(default)]
    consistency_level: ConsistencyLevel,
    #[serde(default)]
    definitions: Vec<DefinitionDocument>,
}

fn default_replication_class() -> String {
    "SimpleStrategy".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DefinitionDocument {
    name: String,
    #[serde(default)]
    allow_null_primary_key_inserts: bool,
    fields: Vec<FieldDocument>,
    #[serde(default)]
    indexes: Vec<IndexDocument>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FieldDocument {
    name: String,
    #[serde(rename = "type")]
    data_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IndexDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    /// Colon separated field names
    key: String,
    #[serde(default)]
    sharding_strategy: ShardingDocument,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ShardingDocument {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    width: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    buckets: Option<u64>,
}

impl Default for ShardingDocument {
    fn default() -> Self {
        Self {
            kind: "ShardingStrategyNone".to_string(),
            width: None,
            buckets: None,
        }
    }
}

impl ShardingDocument {
    fn into_strategy(self) -> Result<ShardingStrategy> {
        let strategy = match self.kind.as_str() {
            "ShardingStrategyNone" => ShardingStrategy::None,
            "ShardingStrategyHourly" => ShardingStrategy::TimeBucket {
                width: ShardingStrategy::HOUR_MS,
            },
            "ShardingStrategyDaily" => ShardingStrategy::TimeBucket {
                width: ShardingStrategy::DAY_MS,
            },
            "ShardingStrategyWeekly" => ShardingStrategy::TimeBucket {
                width: ShardingStrategy::WEEK_MS,
            },
            "ShardingStrategyTimeBucket" => ShardingStrategy::TimeBucket {
                width: self
                    .width
                    .ok_or_else(|| Error::schema("ShardingStrategyTimeBucket needs `width`"))?,
            },
            "ShardingStrategyHashBucket" => ShardingStrategy::HashBucket {
                buckets: self
                    .buckets
                    .ok_or_else(|| Error::schema("ShardingStrategyHashBucket needs `buckets`"))?,
            },
            other => return Err(Error::schema(format!("unknown sharding strategy `{other}`"))),
        };
        strategy.validate()?;
        Ok(strategy)
    }

    fn from_strategy(strategy: &ShardingStrategy) -> Self {
        match strategy {
            ShardingStrategy::None => Self::default(),
            ShardingStrategy::TimeBucket { width } => Self {
                kind: "ShardingStrategyTimeBucket".to_string(),
                width: Some(*width),
                buckets: None,
            },
            ShardingStrategy::HashBucket { buckets } => Self {
                kind: "ShardingStrategyHashBucket".to_string(),
                width: None,
                buckets: Some(*buckets),
            },
        }
    }
}

impl KeyspaceDocument {
    pub(crate) fn into_definition(self) -> Result<KeyspaceDefinition> {
        let definitions = self
            .definitions
            .into_iter()
            .map(DefinitionDocument::into_definition)
            .collect::<Result<Vec<_>>>()?;
        KeyspaceDefinition::new(
            self.name,
            self.replication_class,
            self.replication_factors,
            self.consistency_level,
            definitions,
        )
    }

    pub(crate) fn from_definition(keyspace: &KeyspaceDefinition) -> Self {
        Self {
            name: keyspace.name().to_string(),
            replication_class: keyspace.replication_class().to_string(),
            replication_factors: keyspace.replication_factors().clone(),
            consistency_level: keyspace.consistency_level(),
            definitions: keyspace
                .definitions()
                .map(DefinitionDocument::from_definition)
                .collect(),
        }
    }
}

impl DefinitionDocument {
    pub(crate) fn into_definition(self) -> Result<ObjectDefinition> {
        let fields = self
            .fields
            .into_iter()
            .map(|f| Ok(Field::new(f.name, f.data_type.parse::<DataType>()?)))
            .collect::<Result<Vec<_>>>()?;
        let indexes = self
            .indexes
            .into_iter()
            .map(|doc| {
                let fields: Vec<String> = doc
                    .key
                    .split(':')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect();
                let name = doc.name.unwrap_or_else(|| doc.key.clone());
                Index::new(name, fields, doc.sharding_strategy.into_strategy()?)
            })
            .collect::<Result<Vec<_>>>()?;
        ObjectDefinition::new(self.name, fields, indexes, self.allow_null_primary_key_inserts)
    }

    pub(crate) fn from_definition(def: &ObjectDefinition) -> Self {
        Self {
            name: def.name().to_string(),
            allow_null_primary_key_inserts: def.allow_null_primary_key_inserts(),
            fields: def
                .fields()
                .map(|f| FieldDocument {
                    name: f.name.clone(),
                    data_type: f.data_type.cql_name().to_string(),
                })
                .collect(),
            indexes: def
                .indexes()
                .map(|index| IndexDocument {
                    name: (index.name() != index.key_string()).then(|| index.name().to_string()),
                    key: index.key_string(),
                    sharding_strategy: ShardingDocument::from_strategy(index.sharding()),
                })
                .collect(),
        }
    }
}

/// Parse a single object definition document
pub fn definition_from_json(json: &str) -> Result<ObjectDefinition> {
    let document: DefinitionDocument =
        serde_json::from_str(json).map_err(|e| Error::schema(e.to_string()))?;
    document.into_definition()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYSPACE: &str = r#"{
        "name": "functional",
        "replicationClass": "NetworkTopologyStrategy",
        "replicationFactors": {"dc1": 3, "dc2": 2},
        "consistencyLevel": "LOCAL_QUORUM",
        "definitions": [{
            "name": "testtype",
            "fields": [
                {"name": "foreignid", "type": "bigint"},
                {"name": "type", "type": "int"},
                {"name": "instance", "type": "bigint"},
                {"name": "data1", "type": "varchar"}
            ],
            "indexes": [
                {"key": "foreignid", "shardingStrategy": {"type": "ShardingStrategyNone"}},
                {"key": "type:instance", "shardingStrategy": {"type": "ShardingStrategyDaily"}},
                {
                    "name": "by_data",
                    "key": "data1",
                    "shardingStrategy": {"type": "ShardingStrategyHashBucket", "buckets": 8}
                }
            ]
        }]
    }"#;

    #[test]
    fn test_parse_keyspace_document() {
        let ks = KeyspaceDefinition::from_json(KEYSPACE).unwrap();
        assert_eq!(ks.name(), "functional");
        assert_eq!(ks.replication_factors()["dc1"], 3);
        assert_eq!(ks.consistency_level(), ConsistencyLevel::LocalQuorum);

        let def = ks.definition("testtype").unwrap();
        assert_eq!(def.fields().count(), 4);
        assert_eq!(def.field("foreignid").unwrap().data_type, DataType::BigInt);
        assert_eq!(
            def.index("type:instance").unwrap().sharding(),
            &ShardingStrategy::TimeBucket {
                width: ShardingStrategy::DAY_MS
            }
        );
        assert_eq!(
            def.index("by_data").unwrap().sharding(),
            &ShardingStrategy::HashBucket { buckets: 8 }
        );
    }

    #[test]
    fn test_document_round_trip_preserves_equality() {
        let ks = KeyspaceDefinition::from_json(KEYSPACE).unwrap();
        let again = KeyspaceDefinition::from_json(&ks.to_json().unwrap()).unwrap();
        assert_eq!(ks, again);
    }

    #[test]
    fn test_renamed_field_breaks_equality() {
        let a = KeyspaceDefinition::from_json(KEYSPACE).unwrap();
        let b = KeyspaceDefinition::from_json(&KEYSPACE.replace("\"data1\"", "\"data2\"")).unwrap();
        assert_ne!(a.definition("testtype"), b.definition("testtype"));
    }

    #[test]
    fn test_structural_errors_are_schema_errors() {
        let duplicate_field = r#"{"name": "t", "fields": [
            {"name": "a", "type": "text"}, {"name": "a", "type": "int"}]}"#;
        assert!(matches!(definition_from_json(duplicate_field), Err(Error::Schema(_))));

        let unknown_type = r#"{"name": "t", "fields": [{"name": "a", "type": "widget"}]}"#;
        assert!(matches!(definition_from_json(unknown_type), Err(Error::Schema(_))));

        let unknown_field = r#"{"name": "t", "fields": [{"name": "a", "type": "text"}],
            "indexes": [{"key": "a:b"}]}"#;
        assert!(matches!(definition_from_json(unknown_field), Err(Error::Schema(_))));

        assert!(matches!(
            KeyspaceDefinition::from_json("{not json"),
            Err(Error::Schema(_))
        ));
    }
}
