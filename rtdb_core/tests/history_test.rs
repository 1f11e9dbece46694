//! Commit/read protocol behavior: round trips, ring wrap detection,
//! temporal read modes, rate limiting and the slot cursor.

mod common;

use common::TestDb;
use rtdb_core::{
    DbError, ObjectFlags, ObjectSpec, ReadMode, SlotCursor, TimeBase, Timestamp, TypeId,
};
use std::time::Duration;

fn spec(name: &str) -> ObjectSpec {
    ObjectSpec::new(name, TypeId(100))
        .size_max(64)
        .history_interval(Duration::from_secs(1))
        .cycle(Duration::from_millis(100))
}

#[test]
fn write_read_round_trip() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn.insert(&spec("rt")).unwrap();

    let payload = b"velocity=12.5;yaw=0.03";
    let ts = conn.write(oid, payload, Timestamp::ZERO).unwrap();

    let mut buf = [0u8; 64];
    let r = conn.read_latest(oid, &mut buf).unwrap();
    assert_eq!(r.commit_ts, ts);
    assert_eq!(r.size as usize, payload.len());
    assert_eq!(&buf[..payload.len()], payload);
}

#[test]
fn short_buffer_truncates_but_reports_real_size() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn.insert(&spec("trunc")).unwrap();
    conn.write(oid, &[7u8; 40], Timestamp::ZERO).unwrap();

    let mut buf = [0u8; 16];
    let r = conn.read_latest(oid, &mut buf).unwrap();
    assert_eq!(r.size, 40);
    assert_eq!(buf, [7u8; 16]);
}

#[test]
fn oversized_payload_is_invalid() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn.insert(&spec("small")).unwrap();
    assert!(matches!(
        conn.write(oid, &[0u8; 65], Timestamp::ZERO),
        Err(DbError::Invalid(_))
    ));
}

#[test]
fn commit_timestamps_strictly_increase() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn.insert(&spec("mono")).unwrap();

    let mut last = Timestamp::ZERO;
    for i in 0..50u8 {
        let ts = conn.write(oid, &[i; 8], Timestamp::ZERO).unwrap();
        assert!(ts > last, "commit {i} did not advance");
        last = ts;
    }
}

#[test]
fn overwritten_history_reads_as_histwrap() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    // interval 1.0s / cycle 0.1s -> 11 slots
    let oid = conn.insert(&spec("wrap")).unwrap();

    let first = conn.write(oid, b"first", Timestamp::ZERO).unwrap();
    for i in 0..14u8 {
        conn.write(oid, &[i; 8], Timestamp::ZERO).unwrap();
    }

    let mut buf = [0u8; 64];
    let res = conn.read(
        oid,
        first,
        ReadMode::LatestAtOrBefore,
        TimeBase::Commit,
        &mut buf,
    );
    assert!(
        matches!(res, Err(DbError::HistWrap)),
        "overwritten slot must not read back, got {res:?}"
    );
}

#[test]
fn read_before_first_commit_is_notfound() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn.insert(&spec("young")).unwrap();

    let mut buf = [0u8; 64];
    assert!(matches!(
        conn.read_latest(oid, &mut buf),
        Err(DbError::NotFound)
    ));

    let ts = conn.write(oid, b"x", Timestamp::ZERO).unwrap();
    // a query older than every committed entry, with the ring not yet
    // wrapped, is "never existed", not a wrap
    assert!(matches!(
        conn.read(
            oid,
            Timestamp(ts.as_nanos() - 1),
            ReadMode::LatestAtOrBefore,
            TimeBase::Commit,
            &mut buf
        ),
        Err(DbError::NotFound)
    ));
}

#[test]
fn older_and_younger_modes_select_neighbors() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn.insert(&spec("modes")).unwrap();

    let t1 = conn.write(oid, b"one", Timestamp::ZERO).unwrap();
    let t2 = conn.write(oid, b"two", Timestamp::ZERO).unwrap();
    let t3 = conn.write(oid, b"three", Timestamp::ZERO).unwrap();

    let mut buf = [0u8; 64];
    let r = conn
        .read(oid, t2, ReadMode::LatestAtOrBefore, TimeBase::Commit, &mut buf)
        .unwrap();
    assert_eq!(r.commit_ts, t2);

    let r = conn
        .read(oid, t2, ReadMode::Older, TimeBase::Commit, &mut buf)
        .unwrap();
    assert_eq!(r.commit_ts, t1);
    assert_eq!(&buf[..3], b"one");

    // oldest strictly-younger entry, not the newest
    let r = conn
        .read(oid, t1, ReadMode::Younger, TimeBase::Commit, &mut buf)
        .unwrap();
    assert_eq!(r.commit_ts, t2);

    assert!(matches!(
        conn.read(oid, t3, ReadMode::Younger, TimeBase::Commit, &mut buf),
        Err(DbError::NotFound)
    ));
}

#[test]
fn data_timestamps_default_and_filter() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn.insert(&spec("dts")).unwrap();

    // explicit data time, older than the commit time
    let measured = Timestamp(conn.now().as_nanos() - 5_000_000);
    let commit = conn.write(oid, b"sample", measured).unwrap();

    let mut buf = [0u8; 64];
    let r = conn
        .read(oid, measured, ReadMode::LatestAtOrBefore, TimeBase::Data, &mut buf)
        .unwrap();
    assert_eq!(r.data_ts, measured);
    assert_eq!(r.commit_ts, commit);

    // unset data time defaults to the commit time
    let c2 = conn.write(oid, b"next", Timestamp::ZERO).unwrap();
    let r = conn.read_latest(oid, &mut buf).unwrap();
    assert_eq!(r.commit_ts, c2);
    assert_eq!(r.data_ts, c2);
}

#[test]
fn history_data_time_collision() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn.insert(&spec("collide")).unwrap();

    // two commits carrying the same explicit data timestamp
    let shared = Timestamp(conn.now().as_nanos() - 1_000_000);
    conn.write(oid, b"first", shared).unwrap();
    let c2 = conn.write(oid, b"second", shared).unwrap();

    let mut buf = [0u8; 64];
    // at-or-before resolves to the newest slot among equals
    let r = conn
        .read(oid, shared, ReadMode::LatestAtOrBefore, TimeBase::Data, &mut buf)
        .unwrap();
    assert_eq!(r.commit_ts, c2);
    assert_eq!(&buf[..6], b"second");

    // strict modes exclude the shared timestamp entirely
    assert!(matches!(
        conn.read(oid, shared, ReadMode::Older, TimeBase::Data, &mut buf),
        Err(DbError::NotFound)
    ));
    assert!(matches!(
        conn.read(oid, shared, ReadMode::Younger, TimeBase::Data, &mut buf),
        Err(DbError::NotFound)
    ));
}

#[test]
fn cycle_watch_rejects_fast_commits() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn
        .insert(
            &spec("paced")
                .cycle(Duration::from_millis(50))
                .flags(ObjectFlags::CYCLE_WATCH),
        )
        .unwrap();

    conn.write(oid, b"a", Timestamp::ZERO).unwrap();
    assert!(matches!(
        conn.write(oid, b"b", Timestamp::ZERO),
        Err(DbError::TooFast)
    ));

    std::thread::sleep(Duration::from_millis(60));
    conn.write(oid, b"c", Timestamp::ZERO).unwrap();
}

#[test]
fn withhold_stale_refuses_old_data() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn
        .insert(
            &spec("fresh")
                .cycle(Duration::from_millis(5))
                .max_cycle(Duration::from_millis(10))
                .flags(ObjectFlags::WITHHOLD_STALE),
        )
        .unwrap();

    conn.write(oid, b"hot", Timestamp::ZERO).unwrap();
    std::thread::sleep(Duration::from_millis(40));

    let mut buf = [0u8; 64];
    assert!(matches!(
        conn.read_latest(oid, &mut buf),
        Err(DbError::TooFast)
    ));
}

#[test]
fn two_phase_write_commits_in_place() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn.insert(&spec("inplace")).unwrap();

    let mut guard = conn.write_begin(oid).unwrap();
    guard.payload_mut()[..5].copy_from_slice(b"large");
    let ts = guard.commit(5, Timestamp::ZERO).unwrap();

    let mut buf = [0u8; 64];
    let r = conn.read_latest(oid, &mut buf).unwrap();
    assert_eq!(r.commit_ts, ts);
    assert_eq!(&buf[..5], b"large");
}

#[test]
fn abandoned_two_phase_write_stays_invisible() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn.insert(&spec("aborted")).unwrap();
    let before = conn.write(oid, b"kept", Timestamp::ZERO).unwrap();

    {
        let mut guard = conn.write_begin(oid).unwrap();
        guard.payload_mut()[0] = 0xFF;
        // dropped without commit
    }

    let mut buf = [0u8; 64];
    let r = conn.read_latest(oid, &mut buf).unwrap();
    assert_eq!(r.commit_ts, before);
    assert_eq!(&buf[..4], b"kept");
}

#[test]
fn two_phase_write_denied_on_public_objects() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn
        .insert(&spec("public").flags(ObjectFlags::WRITE_ALLOW))
        .unwrap();
    assert!(matches!(conn.write_begin(oid), Err(DbError::NoPerm)));
}

#[test]
fn slot_cursor_walks_every_commit() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn.insert(&spec("cursor")).unwrap();

    for i in 0..5u8 {
        conn.write(oid, &[i; 4], Timestamp::ZERO).unwrap();
    }

    let mut cursor = SlotCursor::new(oid);
    let mut buf = [0u8; 64];
    for i in 0..5u8 {
        let r = conn.read_slot(&mut cursor, 1, &mut buf).unwrap();
        assert_eq!(buf[0], i);
        assert!(r.size == 4);
    }
    assert_eq!(cursor.position(), 5);
    // past the newest commit
    assert!(matches!(
        conn.read_slot(&mut cursor, 1, &mut buf),
        Err(DbError::NotFound)
    ));
    assert_eq!(cursor.position(), 5, "failed step must not move the cursor");
    // step back
    conn.read_slot(&mut cursor, -1, &mut buf).unwrap();
    assert_eq!(buf[0], 3);
    assert_eq!(cursor.position(), 4);
}

#[test]
fn slot_cursor_detects_lapping() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn.insert(&spec("lapped")).unwrap(); // 11 slots

    let mut cursor = SlotCursor::new(oid);
    let mut buf = [0u8; 64];
    conn.write(oid, &[0; 4], Timestamp::ZERO).unwrap();
    conn.read_slot(&mut cursor, 1, &mut buf).unwrap();

    for i in 1..=14u8 {
        conn.write(oid, &[i; 4], Timestamp::ZERO).unwrap();
    }
    // commit 2 is long gone
    assert!(matches!(
        conn.read_slot(&mut cursor, 1, &mut buf),
        Err(DbError::HistWrap)
    ));
}

#[test]
fn zero_copy_read_revalidates() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn.insert(&spec("zc")).unwrap();
    conn.write(oid, b"stable", Timestamp::ZERO).unwrap();

    let r = conn
        .read_ref(oid, Timestamp::ZERO, ReadMode::LatestAtOrBefore, TimeBase::Commit)
        .unwrap();
    let bytes = unsafe { r.payload() }.to_vec();
    r.revalidate().unwrap();
    assert_eq!(&bytes[..6], b"stable");

    // overwrite the same ring slot: 11 more commits lap it
    for i in 0..11u8 {
        conn.write(oid, &[i; 4], Timestamp::ZERO).unwrap();
    }
    assert!(matches!(r.revalidate(), Err(DbError::HistWrap)));
}

#[test]
fn reborn_slot_does_not_serve_the_old_oid() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let old = conn
        .insert(&spec("ephemeral").flags(ObjectFlags::IMMEDIATELY_DELETE))
        .unwrap();
    conn.write(old, b"before", Timestamp::ZERO).unwrap();
    let r = conn
        .read_ref(old, Timestamp::ZERO, ReadMode::LatestAtOrBefore, TimeBase::Commit)
        .unwrap();
    r.revalidate().unwrap();

    // synchronous purge frees the table slot; the next insert of the same
    // geometry is reborn into it, committing into the same ring memory
    conn.delete(old).unwrap();
    let reborn = conn.insert(&spec("reborn")).unwrap();
    conn.write(reborn, b"after!", Timestamp::ZERO).unwrap();

    assert!(matches!(r.revalidate(), Err(DbError::NotFound)));

    let mut cursor = SlotCursor::new(old);
    let mut buf = [0u8; 64];
    assert!(matches!(
        conn.read_slot(&mut cursor, 1, &mut buf),
        Err(DbError::NotFound)
    ));
}

#[test]
fn deleted_object_stops_writes_and_reads() {
    let db = TestDb::new();
    let conn = db.connect("producer");
    let oid = conn.insert(&spec("gone")).unwrap();
    conn.write(oid, b"x", Timestamp::ZERO).unwrap();
    conn.delete(oid).unwrap();

    assert!(matches!(
        conn.write(oid, b"y", Timestamp::ZERO),
        Err(DbError::NotFound)
    ));
    let mut buf = [0u8; 64];
    assert!(matches!(
        conn.read_latest(oid, &mut buf),
        Err(DbError::NotFound)
    ));
}
