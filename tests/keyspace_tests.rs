// Keyspace lifecycle tests: building, rebuilding, rehydrating and migrating

use rhombus::query::generator;
use rhombus::{
    ConnectionManager, Criteria, Error, KeyspaceDefinition, MemoryCluster, Object, SessionConfig,
    Value,
};
use std::path::PathBuf;
use std::sync::Arc;

const KEYSPACE: &str = "functional";

fn data(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

fn keyspace(file: &str) -> KeyspaceDefinition {
    KeyspaceDefinition::from_file(data(file)).unwrap()
}

fn connect(cluster: &MemoryCluster) -> ConnectionManager {
    let config = SessionConfig::from_file(data("cassconfig.json")).unwrap();
    ConnectionManager::new(config, Arc::new(cluster.clone())).unwrap()
}

fn object(fields: &[(&str, Value)]) -> Object {
    fields
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

fn testtype(foreignid: i64) -> Object {
    object(&[
        ("foreignid", Value::from(foreignid)),
        ("instance", Value::from(1i64)),
        ("type", Value::from(1i32)),
    ])
}

#[test]
fn test_stored_definition_round_trips() {
    let definition = keyspace("keyspace.json");
    let reparsed = KeyspaceDefinition::from_json(&definition.to_json().unwrap()).unwrap();
    assert_eq!(reparsed, definition);
}

#[test]
fn test_object_mapper_rehydrates_from_the_store() {
    let cluster = MemoryCluster::new();
    let builder = connect(&cluster);
    let mapper = builder.build_keyspace(keyspace("keyspace.json"), false).unwrap();
    let id = mapper.insert("testtype", &testtype(42)).unwrap();

    let reader = connect(&cluster);
    let rehydrated = reader.object_mapper(KEYSPACE).unwrap();
    assert_eq!(*rehydrated.keyspace_definition(), *mapper.keyspace_definition());
    let found = rehydrated
        .list("testtype", &Criteria::new().key("foreignid", 42i64))
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["id"], id);

    let again = reader.object_mapper(KEYSPACE).unwrap();
    assert!(Arc::ptr_eq(&rehydrated, &again));
}

#[test]
fn test_missing_keyspace_is_not_found() {
    let cluster = MemoryCluster::new();
    let manager = connect(&cluster);
    assert!(matches!(
        manager.object_mapper("nowhere"),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn test_rebuild_without_force_keeps_data() {
    let cluster = MemoryCluster::new();
    let manager = connect(&cluster);
    let first = manager.build_keyspace(keyspace("keyspace.json"), false).unwrap();
    let id = first.insert("testtype", &testtype(7)).unwrap();

    let second = manager.build_keyspace(keyspace("keyspace.json"), false).unwrap();
    assert!(second.get_by_key("testtype", &id).unwrap().is_some());
    assert_eq!(cluster.keyspace_names(), vec![KEYSPACE.to_string()]);
}

#[test]
fn test_forced_rebuild_starts_empty() {
    let cluster = MemoryCluster::new();
    let manager = connect(&cluster);
    let first = manager.build_keyspace(keyspace("keyspace.json"), false).unwrap();
    let id = first.insert("testtype", &testtype(7)).unwrap();

    let rebuilt = manager.build_keyspace(keyspace("keyspace.json"), true).unwrap();
    assert_eq!(rebuilt.get_by_key("testtype", &id).unwrap(), None);
    assert_eq!(cluster.row_count(KEYSPACE, "testtype"), Some(0));
    // the definition is stored again after the drop
    assert_eq!(
        cluster.row_count(KEYSPACE, generator::KEYSPACE_DEFINITIONS_TABLE),
        Some(1)
    );
}

#[test]
fn test_build_fails_while_cluster_unavailable() {
    let cluster = MemoryCluster::new();
    let manager = connect(&cluster);
    cluster.set_unavailable(true);
    assert!(matches!(
        manager.build_keyspace(keyspace("keyspace.json"), false),
        Err(Error::Timeout(_))
    ));
}

#[test]
fn test_additive_migration_keeps_old_data_queryable() {
    let cluster = MemoryCluster::new();
    let manager = connect(&cluster);
    let mapper = manager.build_keyspace(keyspace("keyspace.json"), false).unwrap();
    let old = mapper.insert("testtype", &testtype(11)).unwrap();

    let next = keyspace("keyspace_migrated.json");
    let planned = mapper.plan_migration(&next, false).unwrap();
    assert_eq!(planned.statements().len(), 4);
    let applied = mapper.run_migration(next, false).unwrap();
    assert_eq!(applied, planned);
    assert!(applied.ignored().is_empty());

    let found = mapper
        .list("testtype", &Criteria::new().key("foreignid", 11i64))
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["id"], old);

    let mut fresh = testtype(11);
    fresh.insert("data3".to_string(), Value::from("new"));
    let added = mapper.insert("testtype", &fresh).unwrap();
    let by_data3 = mapper
        .list("testtype", &Criteria::new().key("data3", "new"))
        .unwrap();
    assert_eq!(by_data3.len(), 1);
    assert_eq!(by_data3[0]["id"], added);
    assert_eq!(
        mapper
            .count("testtype", &Criteria::new().key("foreignid", 11i64))
            .unwrap(),
        2
    );

    let label = object(&[("label", Value::from("l"))]);
    mapper.insert("newtype", &label).unwrap();
    assert_eq!(
        mapper
            .count("newtype", &Criteria::new().key("label", "l"))
            .unwrap(),
        1
    );

    // a later lookup sees the migrated definition
    let reader = connect(&cluster);
    let rehydrated = reader.object_mapper(KEYSPACE).unwrap();
    assert!(rehydrated.keyspace_definition().definition("newtype").is_some());
    assert!(rehydrated
        .plan_migration(&keyspace("keyspace_migrated.json"), false)
        .unwrap()
        .is_empty());
}

#[test]
fn test_destructive_migration_needs_force() {
    let cluster = MemoryCluster::new();
    let manager = connect(&cluster);
    let mapper = manager.build_keyspace(keyspace("keyspace_migrated.json"), false).unwrap();

    let older = keyspace("keyspace.json");
    assert!(matches!(
        mapper.run_migration(older.clone(), false),
        Err(Error::MigrationConflict(_))
    ));
    assert!(mapper.keyspace_definition().definition("newtype").is_some());

    let forced = mapper.run_migration(older, true).unwrap();
    assert!(forced.statements().is_empty());
    assert_eq!(forced.ignored().len(), 3);
    assert!(cluster.table_names(KEYSPACE).iter().any(|t| t == "newtype"));
}

#[test]
fn test_forced_redefinition_keeps_keyspace_usable() {
    let cluster = MemoryCluster::new();
    let manager = connect(&cluster);
    let mapper = manager.build_keyspace(keyspace("keyspace.json"), false).unwrap();
    let old = mapper.insert("testtype", &testtype(5)).unwrap();

    let text = std::fs::read_to_string(data("keyspace.json")).unwrap();
    let redefined = KeyspaceDefinition::from_json(
        &text
            .replace(
                r#"{"key": "foreignid"}"#,
                r#"{"name": "foreignid", "key": "data1"}"#,
            )
            .replace(
                r#"{"name": "filtered", "type": "int"}"#,
                r#"{"name": "filtered", "type": "bigint"}"#,
            ),
    )
    .unwrap();
    assert!(matches!(
        mapper.run_migration(redefined.clone(), false),
        Err(Error::MigrationConflict(_))
    ));

    let forced = mapper.run_migration(redefined, true).unwrap();
    assert_eq!(forced.ignored().len(), 2);
    let testtype_def = forced.target().definition("testtype").unwrap();
    assert_eq!(testtype_def.index("foreignid").unwrap().fields(), ["foreignid"]);
    assert_eq!(*mapper.keyspace_definition(), *forced.target());

    let mut fresh = testtype(5);
    fresh.insert("filtered".to_string(), Value::from(3i32));
    let added = mapper.insert("testtype", &fresh).unwrap();
    assert_eq!(
        mapper
            .count("testtype", &Criteria::new().key("foreignid", 5i64))
            .unwrap(),
        2
    );

    let reader = connect(&cluster);
    let rehydrated = reader.object_mapper(KEYSPACE).unwrap();
    let found = rehydrated
        .list("testtype", &Criteria::new().key("foreignid", 5i64))
        .unwrap();
    let ids: Vec<&Value> = found.iter().map(|o| &o["id"]).collect();
    assert_eq!(ids, vec![&added, &old]);
}
