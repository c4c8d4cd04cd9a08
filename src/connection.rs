// Connection manager
// Owns the cluster handle and one object mapper per keyspace. Building a
// keyspace creates it (or alters it when it already exists), creates the
// system and object tables and stores the definition; looking a keyspace up
// later always rehydrates the definition stored in the keyspace itself.

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::mapper::ObjectMapper;
use crate::query::executor::CqlExecutor;
use crate::query::generator;
use crate::schema::KeyspaceDefinition;
use crate::storage::session::{Cluster, SessionError};
use crate::storage::Value;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ConnectionManager {
    config: SessionConfig,
    cluster: Arc<dyn Cluster>,
    mappers: RwLock<HashMap<String, Arc<ObjectMapper>>>,
}

impl ConnectionManager {
    pub fn new(config: SessionConfig, cluster: Arc<dyn Cluster>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cluster,
            mappers: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create or rebuild a keyspace and return its mapper
    ///
    /// With `force` the keyspace is dropped first and a failing CREATE is an
    /// error. Without it, an existing keyspace is altered in place and only
    /// a failing ALTER is reported, as a migration conflict.
    pub fn build_keyspace(
        &self,
        def: KeyspaceDefinition,
        force: bool,
    ) -> Result<Arc<ObjectMapper>> {
        let name = def.name().to_string();
        let admin = CqlExecutor::new(
            self.cluster.connect(None)?,
            def.consistency_level(),
            &self.config,
        )?;

        if force {
            if let Some(previous) = self.mappers.write().remove(&name) {
                previous.teardown();
            }
            if let Err(err) = admin.execute_sync(&generator::drop_keyspace(&name)) {
                debug!(keyspace = %name, %err, "drop before rebuild failed");
            }
        }

        if let Err(err) = admin.execute_sync(&generator::create_keyspace(&def)) {
            if force {
                admin.close();
                return Err(err);
            }
            warn!(keyspace = %name, %err, "keyspace create failed, altering instead");
            let altered = admin.execute_sync(&generator::alter_keyspace(&def));
            if let Err(alter) = altered {
                admin.close();
                return Err(Error::MigrationConflict(format!(
                    "keyspace `{name}`: create failed ({err}) and alter failed ({alter})"
                )));
            }
        }
        admin.close();

        let executor = CqlExecutor::new(
            self.cluster.connect(Some(&name))?,
            def.consistency_level(),
            &self.config,
        )?;
        for statement in generator::keyspace_tables(&def) {
            executor.execute_sync(&statement)?;
        }
        executor.execute_sync(&generator::store_keyspace_definition(&def)?)?;

        let mapper = Arc::new(ObjectMapper::new(executor, def, &self.config));
        mapper.pre_prepare_insert_statements()?;
        info!(keyspace = %name, force, "keyspace built");
        self.mappers.write().insert(name, Arc::clone(&mapper));
        Ok(mapper)
    }

    /// Mapper for an existing keyspace, rehydrated from the stored definition
    pub fn object_mapper(&self, keyspace: &str) -> Result<Arc<ObjectMapper>> {
        if let Some(mapper) = self.mappers.read().get(keyspace) {
            return Ok(Arc::clone(mapper));
        }

        let not_found = |err: SessionError| match err {
            SessionError::InvalidQuery(_) => Error::NotFound(format!("keyspace `{keyspace}`")),
            other => other.into(),
        };
        let session = self.cluster.connect(Some(keyspace)).map_err(not_found)?;
        let loader = CqlExecutor::new(Arc::clone(&session), Default::default(), &self.config)?;
        let rows = match loader.execute_sync(&generator::load_keyspace_definition(keyspace)) {
            Ok(rows) => rows,
            Err(Error::InvalidQuery(msg)) => {
                warn!(%keyspace, %msg, "keyspace has no stored definition");
                session.close();
                return Err(Error::NotFound(format!("definition of keyspace `{keyspace}`")));
            }
            Err(err) => return Err(err),
        };
        let text = rows
            .first()
            .and_then(|row| row.get("def"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::NotFound(format!("definition of keyspace `{keyspace}`")))?;
        let def = KeyspaceDefinition::from_json(text).map_err(|err| {
            warn!(%keyspace, %err, "stored keyspace definition does not parse");
            err
        })?;

        let executor = CqlExecutor::new(session, def.consistency_level(), &self.config)?;
        let mapper = Arc::new(ObjectMapper::new(executor, def, &self.config));
        mapper.pre_prepare_insert_statements()?;
        info!(%keyspace, "object mapper rehydrated");

        let mut mappers = self.mappers.write();
        Ok(Arc::clone(
            mappers.entry(keyspace.to_string()).or_insert(mapper),
        ))
    }

    /// Close every mapper's session and shut the cluster down
    pub fn teardown(&self) {
        for (_, mapper) in self.mappers.write().drain() {
            mapper.teardown();
        }
        self.cluster.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cluster::MemoryCluster;

    const KEYSPACE: &str = r#"{
        "name": "conn",
        "replicationFactors": {"replication_factor": 1},
        "definitions": [{"name": "thing", "fields": [{"name": "a", "type": "text"}],
                         "indexes": [{"key": "a"}]}]
    }"#;

    fn manager() -> (MemoryCluster, ConnectionManager) {
        let cluster = MemoryCluster::new();
        let manager = ConnectionManager::new(
            SessionConfig::new(vec!["127.0.0.1".to_string()]),
            Arc::new(cluster.clone()),
        )
        .unwrap();
        (cluster, manager)
    }

    #[test]
    fn test_build_creates_system_and_object_tables() {
        let (cluster, manager) = manager();
        manager
            .build_keyspace(KeyspaceDefinition::from_json(KEYSPACE).unwrap(), false)
            .unwrap();
        let tables = cluster.table_names("conn");
        for system in [
            generator::KEYSPACE_DEFINITIONS_TABLE,
            generator::INDEX_UPDATES_TABLE,
            generator::SHARD_INDEX_TABLE,
            "thing",
        ] {
            assert!(tables.iter().any(|t| t == system), "{system} missing");
        }
        assert_eq!(tables.len(), 5);
    }

    #[test]
    fn test_rebuild_without_force_alters() {
        let (cluster, manager) = manager();
        let def = KeyspaceDefinition::from_json(KEYSPACE).unwrap();
        manager.build_keyspace(def.clone(), false).unwrap();
        let altered = KeyspaceDefinition::from_json(&KEYSPACE.replace(
            r#""replication_factor": 1"#,
            r#""replication_factor": 2"#,
        ))
        .unwrap();
        manager.build_keyspace(altered, false).unwrap();
        let replication = cluster.replication("conn").unwrap();
        assert_eq!(replication.factors["replication_factor"], 2);
    }

    #[test]
    fn test_unknown_keyspace_is_not_found() {
        let (_, manager) = manager();
        assert!(matches!(
            manager.object_mapper("missing"),
            Err(Error::NotFound(_))
        ));
    }
}
