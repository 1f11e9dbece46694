//! Trace feed: fixed rings in the segment that mirror every metadata and
//! commit event for attached observers (recorders, debuggers).
//!
//! Each observer claims one ring. Emitters never block and never wait for
//! a slow observer: when a ring is full the event is counted as dropped
//! and the write proceeds. Events are published seqlock-style, sequence
//! number last with Release ordering.

use crate::error::{DbError, DbResult};
use crate::object::ObjectId;
use crate::shm::SegmentView;
use crate::time::Timestamp;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Events per tracer ring.
pub const TRACE_RING_EVENTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TraceEventKind {
    Add = 1,
    Del = 2,
    Update = 3,
    UpdateNext = 4,
    Refresh = 5,
    Change = 6,
    Error = 7,
}

impl TraceEventKind {
    pub fn from_raw(raw: u32) -> Option<TraceEventKind> {
        Some(match raw {
            1 => TraceEventKind::Add,
            2 => TraceEventKind::Del,
            3 => TraceEventKind::Update,
            4 => TraceEventKind::UpdateNext,
            5 => TraceEventKind::Refresh,
            6 => TraceEventKind::Change,
            7 => TraceEventKind::Error,
            _ => return None,
        })
    }
}

/// One event cell. `seq` is written last (Release) and checked before and
/// after reading the payload fields.
#[repr(C)]
pub struct TraceCell {
    seq: AtomicU64,
    ts: AtomicI64,
    oid: AtomicU32,
    kind: AtomicU32,
}

/// Decoded event handed to the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent {
    pub seq: u64,
    pub ts: Timestamp,
    pub oid: ObjectId,
    pub kind: TraceEventKind,
}

/// One tracer ring in the segment. The zeroed state (fresh mapping) is a
/// valid inactive ring.
#[repr(C, align(64))]
pub struct TraceRing {
    /// 0 = free, 1 = claimed.
    active: AtomicU32,
    owner_conn: AtomicU32,
    /// Next sequence number; emitters claim it before filling the cell.
    head: AtomicU64,
    /// Observer's consumption watermark, written by the observer only.
    tail: AtomicU64,
    /// Events discarded because the observer lagged a full ring behind.
    dropped: AtomicU64,
    cells: [TraceCell; TRACE_RING_EVENTS],
}

impl TraceRing {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn push(&self, kind: TraceEventKind, oid: ObjectId, ts: Timestamp) {
        // Claim an index first; concurrent emitters each own a distinct
        // cell and can never interleave writes into the same one.
        let head = loop {
            let head = self.head.load(Ordering::Acquire);
            if head - self.tail.load(Ordering::Acquire) >= TRACE_RING_EVENTS as u64 {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if self
                .head
                .compare_exchange_weak(head, head + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break head;
            }
        };
        let cell = &self.cells[(head % TRACE_RING_EVENTS as u64) as usize];
        cell.ts.store(ts.as_nanos(), Ordering::Relaxed);
        cell.oid.store(oid.0, Ordering::Relaxed);
        cell.kind.store(kind as u32, Ordering::Relaxed);
        // seq = head + 1 so a zeroed cell can never alias a real event
        cell.seq.store(head + 1, Ordering::Release);
    }
}

/// Mirror an event into every active ring. Called with the metadata lock
/// held for Add/Del/Change, lock-free from the commit path for Update.
pub fn emit(view: &SegmentView, kind: TraceEventKind, oid: ObjectId, ts: Timestamp) {
    for idx in 0..view.tracer_capacity() {
        let ring = view.tracer_ring(idx);
        if ring.is_active() {
            ring.push(kind, oid, ts);
        }
    }
}

/// Claim a free tracer ring for `conn_id`. Takes the metadata lock.
pub fn claim(view: &SegmentView, conn_id: u32) -> DbResult<usize> {
    let _guard = view.header().meta_lock.lock();
    for idx in 0..view.tracer_capacity() {
        let ring = view.tracer_ring(idx);
        if ring.is_active() {
            continue;
        }
        let head = ring.head.load(Ordering::Relaxed);
        ring.tail.store(head, Ordering::Relaxed);
        ring.dropped.store(0, Ordering::Relaxed);
        ring.owner_conn.store(conn_id, Ordering::Relaxed);
        ring.active.store(1, Ordering::Release);
        log::debug!("connection {conn_id} claimed tracer ring {idx}");
        return Ok(idx);
    }
    Err(DbError::OutOfObjects)
}

/// Release a ring so emitters stop writing into it.
pub fn release(view: &SegmentView, idx: usize) {
    if idx >= view.tracer_capacity() {
        return;
    }
    let ring = view.tracer_ring(idx);
    ring.active.store(0, Ordering::Release);
    ring.owner_conn.store(0, Ordering::Relaxed);
}

/// Release any rings still claimed by a (dead) connection.
pub fn release_owned(view: &SegmentView, conn_id: u32) {
    for idx in 0..view.tracer_capacity() {
        let ring = view.tracer_ring(idx);
        if ring.is_active() && ring.owner_conn.load(Ordering::Relaxed) == conn_id {
            release(view, idx);
        }
    }
}

/// Fetch the next event from ring `idx`, advancing `cursor`. Returns
/// `Ok(None)` when the ring is drained. Events lost to a lagging observer
/// are skipped and reported through the error count on the ring.
pub fn next_event(view: &SegmentView, idx: usize, cursor: &mut u64) -> DbResult<Option<TraceEvent>> {
    if idx >= view.tracer_capacity() {
        return Err(DbError::Invalid(format!("tracer ring {idx} out of range")));
    }
    let ring = view.tracer_ring(idx);
    loop {
        let head = ring.head.load(Ordering::Acquire);
        if *cursor >= head {
            // observer consumed everything written so far
            ring.tail.store(*cursor, Ordering::Release);
            return Ok(None);
        }
        let cell = &ring.cells[(*cursor % TRACE_RING_EVENTS as u64) as usize];
        let seq = cell.seq.load(Ordering::Acquire);
        if seq < *cursor + 1 {
            // claimed but not yet published by an in-flight emitter
            return Ok(None);
        }
        if seq > *cursor + 1 {
            // lapped: jump forward past the overwritten span
            *cursor = head.saturating_sub(TRACE_RING_EVENTS as u64);
            continue;
        }
        let ts = cell.ts.load(Ordering::Relaxed);
        let oid = cell.oid.load(Ordering::Relaxed);
        let kind_raw = cell.kind.load(Ordering::Relaxed);
        if cell.seq.load(Ordering::Acquire) != seq {
            continue;
        }
        *cursor += 1;
        ring.tail.store(*cursor, Ordering::Release);
        let kind = TraceEventKind::from_raw(kind_raw)
            .ok_or_else(|| DbError::Corrupt("trace ring holds an unknown event kind".into()))?;
        return Ok(Some(TraceEvent {
            seq,
            ts: Timestamp(ts),
            oid: ObjectId(oid),
            kind,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{SegmentConfig, SegmentView};
    use crate::sync::LockMode;

    fn test_view() -> (tempfile::TempDir, SegmentView) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SegmentConfig {
            lock_mode: LockMode::Emulated,
            ..SegmentConfig::default()
        };
        let view = SegmentView::create(&dir.path().join("trace_test"), &cfg).unwrap();
        view.mark_ready();
        (dir, view)
    }

    #[test]
    fn claim_emit_drain() {
        let (_dir, view) = test_view();
        let idx = claim(&view, 7).unwrap();
        let mut cursor = 0u64;
        assert!(next_event(&view, idx, &mut cursor).unwrap().is_none());

        emit(&view, TraceEventKind::Add, ObjectId(42), Timestamp(1000));
        emit(&view, TraceEventKind::Update, ObjectId(42), Timestamp(2000));

        let e1 = next_event(&view, idx, &mut cursor).unwrap().unwrap();
        assert_eq!(e1.kind, TraceEventKind::Add);
        assert_eq!(e1.oid, ObjectId(42));
        let e2 = next_event(&view, idx, &mut cursor).unwrap().unwrap();
        assert_eq!(e2.kind, TraceEventKind::Update);
        assert_eq!(e2.ts, Timestamp(2000));
        assert!(next_event(&view, idx, &mut cursor).unwrap().is_none());
    }

    #[test]
    fn inactive_rings_ignore_events() {
        let (_dir, view) = test_view();
        emit(&view, TraceEventKind::Del, ObjectId(1), Timestamp(1));
        let idx = claim(&view, 3).unwrap();
        let mut cursor = view.tracer_ring(idx).head.load(Ordering::Acquire);
        assert!(next_event(&view, idx, &mut cursor).unwrap().is_none());
    }

    #[test]
    fn full_ring_drops_new_events() {
        let (_dir, view) = test_view();
        let idx = claim(&view, 1).unwrap();
        for i in 0..TRACE_RING_EVENTS as u64 + 10 {
            emit(&view, TraceEventKind::Update, ObjectId(5), Timestamp(i as i64 + 1));
        }
        assert_eq!(view.tracer_ring(idx).dropped(), 10);
        let mut cursor = 0u64;
        let mut n = 0;
        while next_event(&view, idx, &mut cursor).unwrap().is_some() {
            n += 1;
        }
        assert_eq!(n, TRACE_RING_EVENTS);
    }

    #[test]
    fn concurrent_emitters_keep_exact_accounting() {
        let (_dir, view) = test_view();
        let idx = claim(&view, 1).unwrap();

        const WRITERS: u32 = 4;
        const PER_WRITER: u32 = 2000;
        std::thread::scope(|s| {
            for w in 0..WRITERS {
                let view = &view;
                s.spawn(move || {
                    for i in 1..=PER_WRITER {
                        emit(
                            view,
                            TraceEventKind::Update,
                            ObjectId(w + 1),
                            Timestamp(i as i64),
                        );
                    }
                });
            }
        });

        // nothing consumed while emitting, so exactly one ring's worth
        // was published; every event must be whole, nothing uncounted
        let mut cursor = 0u64;
        let mut delivered = 0u64;
        while let Some(e) = next_event(&view, idx, &mut cursor).unwrap() {
            delivered += 1;
            assert_eq!(e.kind, TraceEventKind::Update);
            assert!((1..=WRITERS).contains(&e.oid.0), "torn oid {:?}", e.oid);
            assert!(
                (1..=PER_WRITER as i64).contains(&e.ts.as_nanos()),
                "torn ts {:?}",
                e.ts
            );
        }
        assert_eq!(delivered, TRACE_RING_EVENTS as u64);
        assert_eq!(
            delivered + view.tracer_ring(idx).dropped(),
            (WRITERS * PER_WRITER) as u64
        );
    }

    #[test]
    fn release_stops_delivery() {
        let (_dir, view) = test_view();
        let idx = claim(&view, 2).unwrap();
        release(&view, idx);
        emit(&view, TraceEventKind::Add, ObjectId(9), Timestamp(1));
        assert!(!view.tracer_ring(idx).is_active());
    }
}
