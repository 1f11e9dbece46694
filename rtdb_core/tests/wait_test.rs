//! Blocking behavior: wait-for-commit, deadline handling, search waits
//! and the trace feed, across threads sharing one segment.

mod common;

use common::TestDb;
use rtdb_core::{
    DbError, ObjectFlags, ObjectSpec, SearchQuery, Timestamp, TraceEventKind, TypeId,
};
use std::time::{Duration, Instant};

fn spec(name: &str) -> ObjectSpec {
    ObjectSpec::new(name, TypeId(100))
        .size_max(64)
        .history_interval(Duration::from_secs(1))
        .cycle(Duration::from_millis(10))
}

fn deadline_in(conn: &rtdb_core::Connection, d: Duration) -> Timestamp {
    conn.now().add(d)
}

#[test]
fn wait_next_returns_the_new_commit() {
    let db = TestDb::new();
    let producer = db.connect("producer");
    let consumer = db.connect("consumer");
    let oid = producer.insert(&spec("feed")).unwrap();
    let old = producer.write(oid, b"stale", Timestamp::ZERO).unwrap();

    // return the producer so it is not dropped (deleting its objects)
    // before the waiter observes the commit
    let writer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        let ts = producer.write(oid, b"fresh_payload", Timestamp::ZERO).unwrap();
        (ts, producer)
    });

    let mut buf = [0u8; 64];
    let deadline = deadline_in(&consumer, Duration::from_secs(2));
    let r = consumer.wait_next(oid, old, deadline, &mut buf).unwrap();
    let (written, _producer) = writer.join().unwrap();

    assert_eq!(r.commit_ts, written);
    assert_eq!(&buf[..13], b"fresh_payload");
}

#[test]
fn wait_next_times_out_at_the_deadline() {
    let db = TestDb::new();
    let conn = db.connect("consumer");
    let oid = conn.insert(&spec("silent")).unwrap();
    let old = conn.write(oid, b"only", Timestamp::ZERO).unwrap();

    let mut buf = [0u8; 64];
    let start = Instant::now();
    let res = conn.wait_next(oid, old, deadline_in(&conn, Duration::from_millis(50)), &mut buf);
    let elapsed = start.elapsed();

    assert!(matches!(res, Err(DbError::Timeout)));
    assert!(elapsed >= Duration::from_millis(45), "woke early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "woke far too late: {elapsed:?}");
}

#[test]
fn wait_next_skips_the_block_when_data_is_already_newer() {
    let db = TestDb::new();
    let conn = db.connect("consumer");
    let oid = conn.insert(&spec("ready")).unwrap();
    let t1 = conn.write(oid, b"one", Timestamp::ZERO).unwrap();
    conn.write(oid, b"two", Timestamp::ZERO).unwrap();

    let mut buf = [0u8; 64];
    let start = Instant::now();
    let r = conn
        .wait_next(oid, t1, deadline_in(&conn, Duration::from_secs(5)), &mut buf)
        .unwrap();
    assert!(r.commit_ts > t1);
    assert_eq!(&buf[..3], b"two");
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[test]
fn wait_next_on_no_notify_objects_polls() {
    let db = TestDb::new();
    let producer = db.connect("producer");
    let consumer = db.connect("consumer");
    let oid = producer
        .insert(&spec("quiet").flags(ObjectFlags::NO_NOTIFY))
        .unwrap();
    let old = producer.write(oid, b"v0", Timestamp::ZERO).unwrap();

    // keep the producer alive past the assertions (drop deletes its objects)
    let writer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        producer.write(oid, b"v1", Timestamp::ZERO).unwrap();
        producer
    });

    let mut buf = [0u8; 64];
    let r = consumer
        .wait_next(oid, old, deadline_in(&consumer, Duration::from_secs(2)), &mut buf)
        .unwrap();
    let _producer = writer.join().unwrap();
    assert_eq!(&buf[..2], b"v1");
    assert!(r.commit_ts > old);
}

#[test]
fn wait_next_reports_deletion() {
    let db = TestDb::new();
    let owner = db.connect("owner");
    let consumer = db.connect("consumer");
    let oid = owner.insert(&spec("doomed")).unwrap();
    let old = owner.write(oid, b"x", Timestamp::ZERO).unwrap();

    let killer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        owner.delete(oid).unwrap();
    });

    let mut buf = [0u8; 64];
    let res = consumer.wait_next(oid, old, deadline_in(&consumer, Duration::from_secs(2)), &mut buf);
    killer.join().unwrap();
    assert!(matches!(res, Err(DbError::NotFound)));
}

#[test]
fn search_wait_until_times_out_close_to_the_deadline() {
    let db = TestDb::new();
    let conn = db.connect("searcher");
    let q = SearchQuery::parse("never_appears").unwrap();

    let start = Instant::now();
    let res = conn.search_wait_until(&q, 8, deadline_in(&conn, Duration::from_millis(50)));
    let elapsed = start.elapsed();

    assert!(matches!(res, Err(DbError::Timeout)));
    assert!(elapsed >= Duration::from_millis(45), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "returned far too late: {elapsed:?}");
}

#[test]
fn search_wait_until_sees_a_late_insert() {
    let db = TestDb::new();
    let producer = db.connect("producer");
    let searcher = db.connect("searcher");

    // keep the producer alive past the assertions (drop deletes its objects)
    let inserter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(40));
        let oid = producer.insert(&spec("late_arrival")).unwrap();
        (oid, producer)
    });

    let q = SearchQuery::parse("late_arrival").unwrap();
    let found = searcher
        .search_wait_until(&q, 8, deadline_in(&searcher, Duration::from_secs(2)))
        .unwrap();
    let (oid, _producer) = inserter.join().unwrap();
    assert_eq!(found, vec![oid]);
}

#[test]
fn search_wait_next_reports_set_changes() {
    let db = TestDb::new();
    let producer = db.connect("producer");
    let watcher = db.connect("watcher");

    let a = producer.insert(&spec("set_a")).unwrap();
    let q = SearchQuery::parse("~^set_").unwrap();
    let mut known = watcher.search(&q, 16).unwrap();
    assert_eq!(known, vec![a]);

    // keep the producer alive past the assertions (drop deletes its objects)
    let mutator = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        let b = producer.insert(&spec("set_b")).unwrap();
        producer.delete(a).unwrap();
        (b, producer)
    });

    // collect diffs until both the add and the remove arrived
    let deadline = deadline_in(&watcher, Duration::from_secs(2));
    let mut added = Vec::new();
    let mut removed = Vec::new();
    while added.is_empty() || removed.is_empty() {
        let diff = watcher.search_wait_next(&q, &mut known, 16, deadline).unwrap();
        added.extend(diff.added);
        removed.extend(diff.removed);
    }
    let (b, _producer) = mutator.join().unwrap();
    assert_eq!(added, vec![b]);
    assert_eq!(removed, vec![a]);
    assert_eq!(known, vec![b]);
}

#[test]
fn wait_next_cycle_holds_to_the_boundary() {
    let db = TestDb::new();
    let conn = db.connect("cyclic"); // 10ms cycle
    let start = Instant::now();
    let b1 = conn.wait_next_cycle().unwrap();
    let b2 = conn.wait_next_cycle().unwrap();
    conn.cycle_done().unwrap();

    assert!(b2 > b1);
    assert_eq!((b2.as_nanos() - b1.as_nanos()) % 10_000_000, 0);
    assert!(start.elapsed() >= Duration::from_millis(10));
}

#[test]
fn trace_feed_carries_lifecycle_events() {
    let db = TestDb::new();
    let producer = db.connect("producer");
    let observer = db.connect("observer");

    let mut tracer = observer.start_trace().unwrap();
    let oid = producer.insert(&spec("traced")).unwrap();
    producer.write(oid, b"x", Timestamp::ZERO).unwrap();
    producer.delete(oid).unwrap();

    let mut kinds = Vec::new();
    while let Some(ev) = tracer.next_event().unwrap() {
        if ev.oid == oid {
            kinds.push(ev.kind);
        }
    }
    assert_eq!(
        kinds,
        vec![TraceEventKind::Add, TraceEventKind::Update, TraceEventKind::Del]
    );
    assert_eq!(tracer.dropped(), 0);
}

#[test]
fn housekeeper_reaps_and_publishes_stats() {
    let db = TestDb::new();
    let admin = db.connect_admin("manager");
    admin.insert(&rtdb_core::wellknown::db_info_spec()).unwrap();

    let mut keeper = admin.housekeeper().unwrap();
    keeper.run_once(&db.view).unwrap();

    let rtdb_oid = admin.find("rtdb").unwrap();
    let mut buf = [0u8; 64];
    let r = admin.read_latest(rtdb_oid, &mut buf).unwrap();
    assert_eq!(r.size as usize, std::mem::size_of::<rtdb_core::wellknown::DbInfo>());
    let info: rtdb_core::wellknown::DbInfo =
        bytemuck::pod_read_unaligned(&buf[..std::mem::size_of::<rtdb_core::wellknown::DbInfo>()]);
    assert!(info.objects_used >= 1);
    assert!(info.heap_used > 0);
    assert_eq!(info.heap_total, info.heap_used + info.heap_free);
}
