// Object mapper tests
// Every test builds the fixture keyspace on its own in-process cluster, so
// changelog and scan order never depend on other tests.

use rhombus::query::generator;
use rhombus::{
    ConnectionManager, Criteria, Error, KeyspaceDefinition, MemoryCluster, Object, ObjectMapper,
    ScanCursor, SessionConfig, SortOrder, Value,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const KEYSPACE: &str = "functional";
const BASE_MS: u64 = 1_600_000_000_000;

fn data(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

fn config() -> SessionConfig {
    SessionConfig::from_file(data("cassconfig.json")).unwrap()
}

fn setup_with(config: SessionConfig) -> (MemoryCluster, ConnectionManager, Arc<ObjectMapper>) {
    let cluster = MemoryCluster::new();
    let manager = ConnectionManager::new(config, Arc::new(cluster.clone())).unwrap();
    let keyspace = KeyspaceDefinition::from_file(data("keyspace.json")).unwrap();
    let mapper = manager.build_keyspace(keyspace, false).unwrap();
    (cluster, manager, mapper)
}

fn setup() -> (MemoryCluster, ConnectionManager, Arc<ObjectMapper>) {
    setup_with(config())
}

fn object(fields: &[(&str, Value)]) -> Object {
    fields
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

fn testtype(foreignid: i64, instance: i64, kind: i32) -> Object {
    object(&[
        ("foreignid", Value::from(foreignid)),
        ("instance", Value::from(instance)),
        ("type", Value::from(kind)),
        ("data1", Value::from("first")),
    ])
}

fn by_foreignid(foreignid: i64) -> Criteria {
    Criteria::new().key("foreignid", foreignid)
}

fn index_table(mapper: &ObjectMapper, object_type: &str, index: &str) -> String {
    let keyspace = mapper.keyspace_definition();
    let def = keyspace.definition(object_type).unwrap();
    generator::index_table_name(def, def.index(index).unwrap())
}

#[test]
fn test_insert_then_get_by_key() {
    let (_, _, mapper) = setup();
    let id = mapper.insert("testtype", &testtype(10, 1, 2)).unwrap();

    let stored = mapper.get_by_key("testtype", &id).unwrap().unwrap();
    assert_eq!(stored["id"], id);
    assert_eq!(stored["foreignid"], Value::BigInt(10));
    assert_eq!(stored["type"], Value::Int(2));
    assert_eq!(stored["data1"], Value::from("first"));
    assert!(!stored.contains_key("filtered"));

    let unknown = Value::TimeId(generator::key_at(BASE_MS));
    assert_eq!(mapper.get_by_key("testtype", &unknown).unwrap(), None);
}

#[test]
fn test_composite_index_in_any_field_order() {
    let (_, _, mapper) = setup();
    let id = mapper.insert("testtype", &testtype(10, 1, 2)).unwrap();

    let keyspace = mapper.keyspace_definition();
    let def = keyspace.definition("testtype").unwrap();
    let forward = def.index_for_fields(["instance", "type"]).unwrap();
    let reverse = def.index_for_fields(["type", "instance"]).unwrap();
    assert_eq!(forward.name(), reverse.name());

    let criteria = Criteria::new().key("type", 2i32).key("instance", 1i64);
    let found = mapper.list("testtype", &criteria).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["id"], id);

    let partial = Criteria::new().key("instance", 1i64);
    assert!(matches!(
        mapper.list("testtype", &partial),
        Err(Error::Schema(_))
    ));
}

#[test]
fn test_shared_index_key_lists_newest_first() {
    let (_, _, mapper) = setup();
    let first = mapper.insert("testtype", &testtype(77, 1, 1)).unwrap();
    let second = mapper.insert("testtype", &testtype(77, 2, 1)).unwrap();
    mapper.insert("testtype", &testtype(78, 3, 1)).unwrap();

    let found = mapper.list("testtype", &by_foreignid(77)).unwrap();
    let ids: Vec<Value> = found.iter().map(|o| o["id"].clone()).collect();
    assert_eq!(ids, vec![second.clone(), first.clone()]);
    assert_eq!(mapper.count("testtype", &by_foreignid(77)).unwrap(), 2);

    let ascending = by_foreignid(77).ordering(SortOrder::Asc);
    let ids: Vec<Value> = mapper
        .list("testtype", &ascending)
        .unwrap()
        .into_iter()
        .map(|o| o["id"].clone())
        .collect();
    assert_eq!(ids, vec![first, second]);
}

#[test]
fn test_delete_removes_object_from_every_index() {
    let (cluster, _, mapper) = setup();
    let kept = mapper.insert("testtype", &testtype(5, 1, 1)).unwrap();
    let removed = mapper.insert("testtype", &testtype(5, 2, 1)).unwrap();

    mapper.delete("testtype", &removed).unwrap();
    let found = mapper.list("testtype", &by_foreignid(5)).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["id"], kept);
    assert_eq!(mapper.get_by_key("testtype", &removed).unwrap(), None);
    let by_instance = Criteria::new().key("instance", 2i64).key("type", 1i32);
    assert_eq!(mapper.count("testtype", &by_instance).unwrap(), 0);

    let table = index_table(&mapper, "testtype", "foreignid");
    assert_eq!(cluster.row_count(KEYSPACE, &table), Some(1));

    // deleting twice is harmless
    mapper.delete("testtype", &removed).unwrap();
}

#[test]
fn test_update_moves_only_changed_index_rows() {
    let (cluster, _, mapper) = setup();
    let moved = mapper.insert("testtype", &testtype(1, 10, 1)).unwrap();
    mapper.insert("testtype", &testtype(1, 20, 1)).unwrap();
    let by_instance = Criteria::new().key("instance", 10i64).key("type", 1i32);

    mapper
        .update("testtype", &moved, &object(&[("foreignid", Value::from(2i64))]))
        .unwrap();
    assert_eq!(mapper.count("testtype", &by_foreignid(1)).unwrap(), 1);
    assert_eq!(mapper.count("testtype", &by_foreignid(2)).unwrap(), 1);
    assert_eq!(mapper.count("testtype", &by_instance).unwrap(), 1);

    let foreign_table = index_table(&mapper, "testtype", "foreignid");
    let instance_table = index_table(&mapper, "testtype", "instance:type");
    let before = (
        cluster.row_count(KEYSPACE, &foreign_table),
        cluster.row_count(KEYSPACE, &instance_table),
    );
    mapper
        .update("testtype", &moved, &object(&[("data2", Value::from("second"))]))
        .unwrap();
    let after = (
        cluster.row_count(KEYSPACE, &foreign_table),
        cluster.row_count(KEYSPACE, &instance_table),
    );
    assert_eq!(before, after);

    let stored = mapper.get_by_key("testtype", &moved).unwrap().unwrap();
    assert_eq!(stored["foreignid"], Value::BigInt(2));
    assert_eq!(stored["data1"], Value::from("first"));
    assert_eq!(stored["data2"], Value::from("second"));
}

#[test]
fn test_update_errors() {
    let (_, _, mapper) = setup();
    let missing = Value::TimeId(generator::key_at(BASE_MS));
    let changes = object(&[("data1", Value::from("x"))]);
    assert!(matches!(
        mapper.update("testtype", &missing, &changes),
        Err(Error::NotFound(_))
    ));

    let id = mapper.insert("testtype", &testtype(1, 1, 1)).unwrap();
    let clears_index = object(&[("instance", Value::Null)]);
    assert!(matches!(
        mapper.update("testtype", &id, &clears_index),
        Err(Error::Constraint(_))
    ));

    let key = mapper
        .insert(
            "keyed",
            &object(&[("id", Value::from("k1")), ("name", Value::from("n"))]),
        )
        .unwrap();
    assert_eq!(key, Value::from("k1"));
    let rekey = object(&[("id", Value::from("k2"))]);
    assert!(matches!(
        mapper.update("keyed", &key, &rekey),
        Err(Error::Schema(_))
    ));
}

#[test]
fn test_constraints_checked_before_any_write() {
    let (cluster, _, mapper) = setup();
    let incomplete = object(&[("foreignid", Value::from(1i64)), ("type", Value::from(1i32))]);
    assert!(matches!(
        mapper.insert("testtype", &incomplete),
        Err(Error::Constraint(_))
    ));
    assert_eq!(cluster.row_count(KEYSPACE, "testtype"), Some(0));

    let without_key = object(&[("name", Value::from("n"))]);
    assert!(matches!(
        mapper.insert("keyed", &without_key),
        Err(Error::Constraint(_))
    ));

    let unknown_field = object(&[("nope", Value::from(1i64))]);
    assert!(matches!(
        mapper.insert("testtype", &unknown_field),
        Err(Error::Schema(_))
    ));
    assert!(matches!(
        mapper.insert("missing", &Object::new()),
        Err(Error::Schema(_))
    ));
}

#[test]
fn test_changelog_respects_consistency_horizon() {
    let (_, _, mapper) = setup();
    let id = mapper.insert("testtype", &testtype(3, 1, 1)).unwrap();
    mapper
        .update("testtype", &id, &object(&[("foreignid", Value::from(4i64))]))
        .unwrap();

    assert!(mapper.get_next_update_index_row(None).unwrap().is_none());
    thread::sleep(Duration::from_millis(300));

    let row = mapper.get_next_update_index_row(None).unwrap().unwrap();
    assert_eq!(row.object_name, "testtype");
    assert_eq!(row.instance_id, id.to_string());
    assert_eq!(row.snapshots.len(), 2);
    let newest = row.newest().unwrap();
    assert_eq!(newest.values["foreignid"], Value::BigInt(4));
    assert_eq!(row.snapshots[1].values["foreignid"], Value::BigInt(3));
    assert!(!newest.values.contains_key("data1"));

    let key = row.row_key();
    assert!(mapper.get_next_update_index_row(Some(&key)).unwrap().is_none());

    mapper.delete_obsolete_update_index_rows(&row).unwrap();
    let row = mapper.get_next_update_index_row(None).unwrap().unwrap();
    assert_eq!(row.snapshots.len(), 1);
    assert_eq!(row.snapshots[0].values["foreignid"], Value::BigInt(4));
}

#[test]
fn test_timestamp_range_bounds_are_inclusive() {
    let (_, _, mapper) = setup();
    for step in 0..8 {
        mapper
            .insert_at("testtype", &testtype(500, step, 1), BASE_MS + step as u64 * 1000)
            .unwrap();
    }

    assert_eq!(mapper.count("testtype", &by_foreignid(500)).unwrap(), 8);
    let from_second = by_foreignid(500).start_timestamp(BASE_MS + 1000);
    assert_eq!(mapper.count("testtype", &from_second).unwrap(), 7);
    let from_fourth = by_foreignid(500).start_timestamp(BASE_MS + 3000);
    assert_eq!(mapper.count("testtype", &from_fourth).unwrap(), 5);
    let window = from_second.clone().end_timestamp(BASE_MS + 5000);
    assert_eq!(mapper.count("testtype", &window).unwrap(), 5);

    let listed = mapper
        .list("testtype", &window.clone().ordering(SortOrder::Asc))
        .unwrap();
    let stamps: Vec<u64> = listed.iter().map(|o| generator::key_timestamp(&o["id"])).collect();
    assert_eq!(stamps, (1..=5).map(|s| BASE_MS + s * 1000).collect::<Vec<_>>());

    assert_eq!(mapper.list("testtype", &window.limit(2)).unwrap().len(), 2);

    let keyed = Criteria::new().key("name", "n").start_timestamp(BASE_MS);
    assert!(matches!(mapper.list("keyed", &keyed), Err(Error::Schema(_))));
}

#[test]
fn test_time_bucketed_index_spans_buckets() {
    let (_, _, mapper) = setup();
    let note = |account: &str| {
        object(&[("account", Value::from(account)), ("note", Value::from("n"))])
    };
    let mut ids = Vec::new();
    for step in 0..6u64 {
        ids.push(mapper.insert_at("hourly", &note("acme"), BASE_MS + step * 1500).unwrap());
    }
    mapper.insert_at("hourly", &note("other"), BASE_MS).unwrap();

    let acme = Criteria::new().key("account", "acme");
    assert_eq!(mapper.count("hourly", &acme).unwrap(), 6);
    let listed: Vec<Value> = mapper
        .list("hourly", &acme)
        .unwrap()
        .into_iter()
        .map(|o| o["id"].clone())
        .collect();
    let mut newest_first = ids.clone();
    newest_first.reverse();
    assert_eq!(listed, newest_first);

    let window = acme
        .clone()
        .start_timestamp(BASE_MS + 1500)
        .end_timestamp(BASE_MS + 4500);
    assert_eq!(mapper.count("hourly", &window).unwrap(), 3);
    assert_eq!(mapper.list("hourly", &acme.limit(4)).unwrap().len(), 4);
}

#[test]
fn test_hash_bucketed_index() {
    let (_, _, mapper) = setup();
    let mut tagged_a = Vec::new();
    for n in 0..5 {
        let item = object(&[("tag", Value::from("a")), ("n", Value::from(n))]);
        tagged_a.push(mapper.insert("bucketed", &item).unwrap());
    }
    for n in 0..3 {
        let item = object(&[("tag", Value::from("b")), ("n", Value::from(n))]);
        mapper.insert("bucketed", &item).unwrap();
    }

    assert_eq!(mapper.count("bucketed", &Criteria::new().key("tag", "a")).unwrap(), 5);
    assert_eq!(mapper.list("bucketed", &Criteria::new().key("tag", "b")).unwrap().len(), 3);

    let newest: Vec<Value> = mapper
        .list("bucketed", &Criteria::new().key("tag", "a").limit(2))
        .unwrap()
        .into_iter()
        .map(|o| o["id"].clone())
        .collect();
    assert_eq!(newest, vec![tagged_a[4].clone(), tagged_a[3].clone()]);
}

#[test]
fn test_transport_faults_surface_as_timeouts() {
    let (cluster, _, mapper) = setup();
    let id = mapper.insert("testtype", &testtype(9, 1, 1)).unwrap();

    cluster.fail_next(1);
    assert!(matches!(
        mapper.insert("testtype", &testtype(9, 2, 1)),
        Err(Error::Timeout(_))
    ));

    cluster.set_unavailable(true);
    assert!(matches!(mapper.get_by_key("testtype", &id), Err(Error::Timeout(_))));
    assert!(matches!(
        mapper.list("testtype", &by_foreignid(9)),
        Err(Error::Timeout(_))
    ));
    cluster.set_unavailable(false);

    assert!(mapper.get_by_key("testtype", &id).unwrap().is_some());
}

#[test]
fn test_batch_insert_and_visit_every_object() {
    let (cluster, _, mapper) = setup();
    for batch in 0..400i64 {
        let items: Vec<Object> = (0..50)
            .map(|i| {
                let mut item = testtype(batch, i, 1);
                item.insert("filtered".to_string(), Value::from((i % 2) as i32));
                item
            })
            .collect();
        let mut objects = BTreeMap::new();
        objects.insert("testtype".to_string(), items);
        objects.insert(
            "keyed".to_string(),
            vec![object(&[
                ("id", Value::from(format!("k{batch}"))),
                ("name", Value::from("batch")),
            ])],
        );
        mapper.insert_batch_mixed(&objects).unwrap();
    }
    assert_eq!(cluster.row_count(KEYSPACE, "testtype"), Some(20_000));
    assert_eq!(cluster.row_count(KEYSPACE, generator::INDEX_UPDATES_TABLE), Some(0));

    let mut seen = 0u64;
    let mut ids = BTreeSet::new();
    let visited = mapper
        .visit_objects(
            "testtype",
            |o| {
                seen += 1;
                o["filtered"] == Value::Int(0)
            },
            |o| {
                ids.insert(o["id"].clone());
            },
        )
        .unwrap();
    assert_eq!(seen, 20_000);
    assert_eq!(visited, 10_000);
    assert_eq!(ids.len(), 10_000);
    assert_eq!(mapper.count("keyed", &Criteria::new().key("name", "batch")).unwrap(), 400);
}

#[test]
fn test_batch_rejects_invalid_objects_before_writing() {
    let (cluster, _, mapper) = setup();
    let mut objects = BTreeMap::new();
    objects.insert(
        "testtype".to_string(),
        vec![testtype(1, 1, 1), object(&[("foreignid", Value::from(1i64))])],
    );
    assert!(matches!(
        mapper.insert_batch_mixed(&objects),
        Err(Error::Constraint(_))
    ));
    assert_eq!(cluster.row_count(KEYSPACE, "testtype"), Some(0));
}

#[test]
fn test_scan_resumes_from_cursor() {
    let mut config = config();
    config.scan_page_size = 7;
    config.scan_range_count = 4;
    let (_, _, mapper) = setup_with(config);
    let mut inserted = BTreeSet::new();
    for n in 0..30 {
        let item = object(&[("tag", Value::from("s")), ("n", Value::from(n))]);
        inserted.insert(mapper.insert("bucketed", &item).unwrap());
    }

    let mut scan = mapper.scan("bucketed").unwrap();
    let mut seen: BTreeSet<Value> = scan
        .by_ref()
        .take(10)
        .map(|o| o.unwrap()["id"].clone())
        .collect();
    let cursor = scan.cursor();
    assert_ne!(cursor, ScanCursor::default());
    drop(scan);

    for object in mapper.scan_from("bucketed", cursor).unwrap() {
        assert!(seen.insert(object.unwrap()["id"].clone()));
    }
    assert_eq!(seen, inserted);
}

#[test]
fn test_prepared_statements_are_warmed_up() {
    let (_, _, mapper) = setup();
    let warmed = mapper.executor().prepared_statement_count();
    assert!(warmed > 0);
    mapper.insert("testtype", &testtype(1, 1, 1)).unwrap();
    mapper.insert("testtype", &testtype(2, 2, 1)).unwrap();
    let after_inserts = mapper.executor().prepared_statement_count();
    mapper.insert("testtype", &testtype(3, 3, 1)).unwrap();
    assert_eq!(mapper.executor().prepared_statement_count(), after_inserts);
}
