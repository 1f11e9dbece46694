//! Metadata table behavior through the public connection API: insert,
//! search, delete, permissions, uniqueness and purge.

mod common;

use common::TestDb;
use rtdb_core::{
    DbError, ObjectFlags, ObjectId, ObjectSpec, SearchQuery, Timestamp, TypeId,
};
use std::time::Duration;

fn spec(name: &str) -> ObjectSpec {
    ObjectSpec::new(name, TypeId(100))
        .size_max(64)
        .history_interval(Duration::from_secs(1))
        .cycle(Duration::from_millis(100))
}

#[test]
fn insert_assigns_unique_oids_and_search_finds_them() {
    let db = TestDb::new();
    let conn = db.connect("producer");

    let a = conn.insert(&spec("obj_a")).unwrap();
    let b = conn.insert(&spec("obj_b")).unwrap();
    assert_ne!(a, b);
    assert!(!a.is_none());

    assert_eq!(conn.find("obj_a").unwrap(), a);
    let q = SearchQuery::parse("~^obj_").unwrap().otype(TypeId(100));
    let found = conn.search(&q, 16).unwrap();
    assert!(found.contains(&a) && found.contains(&b));

    // oid literal syntax resolves too
    assert_eq!(conn.find(&format!("({})", b.0)).unwrap(), b);
}

#[test]
fn insert_rejects_unrepresentable_geometry() {
    let db = TestDb::new();
    let conn = db.connect("sizer");

    // payload so large the per-slot stride cannot be represented
    let res = conn.insert(&spec("vast").size_max(u32::MAX - 16));
    assert!(matches!(res, Err(DbError::Invalid(_))), "{res:?}");

    // interval/cycle ratio past the slot-count space
    let res = conn.insert(
        &spec("dense")
            .size_max(8)
            .history_interval(Duration::from_nanos(u32::MAX as u64 + 10))
            .cycle(Duration::from_nanos(1)),
    );
    assert!(matches!(res, Err(DbError::Invalid(_))), "{res:?}");
}

#[test]
fn read_info_snapshots_respect_time() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let before = conn.now();
    std::thread::sleep(Duration::from_millis(2));
    let oid = conn.insert(&spec("snap")).unwrap();

    let info = conn.read_info(oid, Timestamp::ZERO).unwrap();
    assert_eq!(info.name_str(), "snap");
    assert_eq!(info.otype, TypeId(100));

    // not yet created at `before`
    assert!(matches!(
        conn.read_info(oid, before),
        Err(DbError::NotFound)
    ));
}

#[test]
fn delete_marks_then_second_delete_is_notfound() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn.insert(&spec("victim")).unwrap();

    conn.delete(oid).unwrap();
    assert!(matches!(conn.delete(oid), Err(DbError::NotFound)));
    assert!(matches!(conn.find("victim"), Err(DbError::NotFound)));
}

#[test]
fn immediately_delete_reclaims_synchronously() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn
        .insert(&spec("ephemeral").flags(ObjectFlags::IMMEDIATELY_DELETE))
        .unwrap();

    // reclaimed synchronously: the oid resolves to nothing at all
    conn.delete(oid).unwrap();
    assert!(matches!(conn.delete(oid), Err(DbError::NotFound)));
    assert!(matches!(conn.find("ephemeral"), Err(DbError::NotFound)));
    assert!(matches!(
        conn.read_info(oid, Timestamp::ZERO),
        Err(DbError::NotFound)
    ));
}

#[test]
fn permissions_deny_foreign_readers_and_writers() {
    let db = TestDb::new();
    let owner = db.connect("owner");
    let other = db.connect("other");
    let admin = db.connect_admin("admin");

    let secret = owner
        .insert(&spec("secret").flags(ObjectFlags::READ_DENY))
        .unwrap();
    owner.write(secret, &[1u8; 8], Timestamp::ZERO).unwrap();

    let mut buf = [0u8; 64];
    assert!(matches!(
        other.read_latest(secret, &mut buf),
        Err(DbError::NoPerm)
    ));
    owner.read_latest(secret, &mut buf).unwrap();
    admin.read_latest(secret, &mut buf).unwrap();

    // not write-allow: only the owner commits
    assert!(matches!(
        other.write(secret, &[2u8; 8], Timestamp::ZERO),
        Err(DbError::NoPerm)
    ));

    let shared = owner
        .insert(&spec("shared").flags(ObjectFlags::WRITE_ALLOW))
        .unwrap();
    other.write(shared, &[3u8; 8], Timestamp::ZERO).unwrap();
}

#[test]
fn delete_needs_ownership() {
    let db = TestDb::new();
    let owner = db.connect("owner");
    let other = db.connect("other");
    let oid = owner.insert(&spec("mine")).unwrap();
    assert!(matches!(other.delete(oid), Err(DbError::NoPerm)));
    owner.delete(oid).unwrap();
}

#[test]
fn unique_insert_conflicts_until_purged() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let admin = db.connect_admin("keeper");
    let uspec = spec("singleton")
        .history_interval(Duration::from_millis(20))
        .flags(ObjectFlags::UNIQUE);

    let first = conn.insert(&uspec).unwrap();
    assert!(matches!(conn.insert(&uspec), Err(DbError::NotUnique)));

    // deleted but unpurged still blocks the unique insert
    conn.delete(first).unwrap();
    assert!(matches!(conn.insert(&uspec), Err(DbError::NotUnique)));

    // after the grace period a housekeeping pass frees the slot
    std::thread::sleep(Duration::from_millis(80));
    let mut keeper = admin.housekeeper().unwrap();
    let report = keeper.run_once(&db.view).unwrap();
    assert!(report.purged >= 1);

    let second = conn.insert(&uspec).unwrap();
    assert_ne!(second, first, "oids are never reused");
}

#[test]
fn parent_cascade_and_missing_parent() {
    let db = TestDb::new();
    let conn = db.connect("producer");

    let root = conn.insert(&spec("tree_root")).unwrap();
    let child = conn
        .insert(
            &spec("tree_child")
                .parent(root)
                .flags(ObjectFlags::PARENT_DELETE),
        )
        .unwrap();

    // inserting under a nonexistent parent is malformed
    assert!(matches!(
        conn.insert(&spec("stray").parent(ObjectId(99999))),
        Err(DbError::Invalid(_))
    ));

    conn.delete(root).unwrap();
    assert!(matches!(
        conn.read_info(child, Timestamp::ZERO),
        Err(DbError::NotFound)
    ));
}

#[test]
fn search_distinguishes_empty_from_bad_parent() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let root = conn.insert(&spec("sr_root")).unwrap();

    let empty = SearchQuery::parse("no_such_name").unwrap().parent(root);
    assert!(matches!(conn.search(&empty, 8), Err(DbError::NotFound)));

    let bad = SearchQuery::parse("no_such_name")
        .unwrap()
        .parent(ObjectId(99999));
    assert!(matches!(conn.search(&bad, 8), Err(DbError::Invalid(_))));
}

#[test]
fn reserved_names_need_admin() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let admin = db.connect_admin("manager");

    assert!(matches!(
        conn.insert(&spec("rtdb")),
        Err(DbError::NoPerm)
    ));
    admin.insert(&rtdb_core::wellknown::db_info_spec()).unwrap();
}

#[test]
fn dropped_connection_releases_its_objects() {
    let db = TestDb::new();
    let watcher = db.connect("watcher");

    let transient;
    let durable;
    {
        let conn = db.connect("short_lived");
        transient = conn.insert(&spec("transient")).unwrap();
        durable = conn
            .insert(&spec("durable").flags(ObjectFlags::PERSISTENT))
            .unwrap();
    }

    // non-persistent object is gone, persistent one is orphaned
    assert!(matches!(watcher.find("transient"), Err(DbError::NotFound)));
    let info = watcher.read_info(durable, Timestamp::ZERO).unwrap();
    assert_eq!(info.name_str(), "durable");
}

#[test]
fn keep_alloc_reuses_the_heap_range() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let kspec = spec("reusable").flags(ObjectFlags::KEEP_ALLOC);

    let first = conn.insert(&kspec).unwrap();
    let off1 = conn.read_info(first, Timestamp::ZERO).unwrap().heap_off;
    conn.delete(first).unwrap();

    let second = conn.insert(&kspec).unwrap();
    let off2 = conn.read_info(second, Timestamp::ZERO).unwrap().heap_off;
    assert_ne!(first, second);
    assert_eq!(off1, off2, "keep-alloc insert reuses the heap range");
}
