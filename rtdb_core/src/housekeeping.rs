//! Periodic maintenance: purge expired deleted objects, reap dead
//! processes, publish database stats to the well-known "rtdb" object.
//!
//! Everything here takes the same metadata lock ordinary mutators take
//! and never holds a per-object lock across more than one purge step, so
//! a housekeeper pass is safe against concurrent inserts and commits.

use crate::error::DbResult;
use crate::history;
use crate::object::ObjectId;
use crate::process::{pid_alive, Caller};
use crate::shm::SegmentView;
use crate::table;
use crate::time::Timestamp;
use crate::trace;
use crate::wellknown::{DbInfo, NAME_RTDB};
use std::sync::atomic::Ordering;

/// What one pass accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub purged: usize,
    pub reaped: usize,
}

/// Housekeeper state carried across passes by the privileged process.
pub struct Housekeeper {
    caller: Caller,
    purged_total: u32,
    rtdb: Option<(ObjectId, usize)>,
}

impl Housekeeper {
    pub fn new(caller: Caller) -> Housekeeper {
        Housekeeper {
            caller,
            purged_total: 0,
            rtdb: None,
        }
    }

    /// One full pass: purge, reap, stats.
    pub fn run_once(&mut self, view: &SegmentView) -> DbResult<PassReport> {
        let now = view.db_now();
        let mut report = PassReport::default();

        {
            let guard = view.header().meta_lock.lock();
            report.purged = table::purge_expired_locked(view, &guard, now);
            report.reaped = reap_dead_locked(view, &guard, now);
            if report.purged > 0 || report.reaped > 0 {
                view.header().meta_cond.broadcast();
            }
        }
        self.purged_total = self.purged_total.saturating_add(report.purged as u32);

        if let Err(e) = self.publish_stats(view, now) {
            // the feed is best-effort; a missing rtdb object is not fatal
            log::warn!("stats publication failed: {e}");
        }
        if report.purged > 0 || report.reaped > 0 {
            log::debug!(
                "housekeeping pass purged {} object(s), reaped {} process(es)",
                report.purged,
                report.reaped
            );
        }
        Ok(report)
    }

    fn publish_stats(&mut self, view: &SegmentView, now: Timestamp) -> DbResult<()> {
        let (oid, slot_idx) = match self.resolve_rtdb(view) {
            Some(pair) => pair,
            None => return Ok(()),
        };
        let info = gather_stats(view, self.purged_total);
        history::write(
            view,
            self.caller,
            slot_idx,
            oid,
            bytemuck::bytes_of(&info),
            now,
        )?;
        Ok(())
    }

    fn resolve_rtdb(&mut self, view: &SegmentView) -> Option<(ObjectId, usize)> {
        if let Some((oid, idx)) = self.rtdb {
            let slot = view.object_slot(idx);
            if slot.oid.load(Ordering::Acquire) == oid.0 {
                return self.rtdb;
            }
            self.rtdb = None;
        }
        for idx in 0..view.object_capacity() {
            let slot = view.object_slot(idx);
            if slot.oid.load(Ordering::Acquire) == 0 || slot.is_deleted() {
                continue;
            }
            if unsafe { slot.meta() }.name_str() == NAME_RTDB {
                let oid = ObjectId(slot.oid.load(Ordering::Acquire));
                self.rtdb = Some((oid, idx));
                return self.rtdb;
            }
        }
        None
    }
}

/// Probe every registered process and tear down the dead ones: delete
/// their non-persistent objects, orphan the persistent ones, free the
/// slot and any tracer rings they held.
fn reap_dead_locked(
    view: &SegmentView,
    guard: &crate::sync::LockGuard<'_>,
    now: Timestamp,
) -> usize {
    let mut reaped = 0;
    for idx in 0..view.process_capacity() {
        let slot = view.process_slot(idx);
        let pid = slot.pid.load(Ordering::Acquire);
        if pid == 0 || pid_alive(pid) {
            continue;
        }
        let conn_id = idx as u32 + 1;
        log::info!(
            "reaping dead process {:?} (pid {pid}, connection {conn_id})",
            slot.name_str()
        );
        table::release_owned_locked(view, guard, conn_id, now);
        trace::release_owned(view, conn_id);
        slot.pid.store(0, Ordering::Release);
        reaped += 1;
    }
    reaped
}

fn gather_stats(view: &SegmentView, purged_total: u32) -> DbInfo {
    let heap = view.heap().stats();
    let mut objects_used = 0;
    for idx in 0..view.object_capacity() {
        if view.object_slot(idx).oid.load(Ordering::Acquire) != 0 {
            objects_used += 1;
        }
    }
    let mut processes_used = 0;
    for idx in 0..view.process_capacity() {
        if !view.process_slot(idx).is_free() {
            processes_used += 1;
        }
    }
    DbInfo {
        heap_total: heap.total as u64,
        heap_used: heap.used as u64,
        heap_free: heap.free as u64,
        objects_total: view.object_capacity() as u32,
        objects_used,
        processes_total: view.process_capacity() as u32,
        processes_used,
        oid_high_water: view.header().next_oid.load(Ordering::Acquire).saturating_sub(1),
        purged_total,
    }
}

/// Convenience for callers without housekeeper state: purge and reap only.
pub fn sweep(view: &SegmentView) -> DbResult<PassReport> {
    let now = view.db_now();
    let guard = view.header().meta_lock.lock();
    let purged = table::purge_expired_locked(view, &guard, now);
    let reaped = reap_dead_locked(view, &guard, now);
    if purged > 0 || reaped > 0 {
        view.header().meta_cond.broadcast();
    }
    Ok(PassReport { purged, reaped })
}
