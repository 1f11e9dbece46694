//! Metadata table: insert, delete, info queries and purge.
//!
//! The table is a fixed-capacity array of `ObjectSlot`s in the segment.
//! Every structural mutation happens under the single global metadata
//! lock and is bounded by one O(table) scan. Fields the lock-free data
//! path needs are mirrored as atomics in the slot, published with Release
//! ordering after the plain `ObjectMeta` record is complete.
//!
//! Lifecycle per slot: free (oid == 0) → active → deleted (pending purge)
//! → free again. Oids are never reused, so a stale cached slot index is
//! always detected by an oid mismatch.

use crate::error::{DbError, DbResult};
use crate::object::{ObjectFlags, ObjectId, ObjectMeta, ObjectSpec};
use crate::process::Caller;
use crate::shm::SegmentView;
use crate::sync::{LockGuard, LockMode, SharedCondVar, SharedLock};
use crate::time::Timestamp;
use crate::trace::{self, TraceEventKind};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Deleted keep-alloc objects wait out this multiple of the normal grace
/// period before their heap range is reclaimed, giving the owner time to
/// re-insert into it.
pub const KEEP_ALLOC_GRACE_FACTOR: i64 = 4;

/// One object descriptor slot.
///
/// The atomics mirror the `ObjectMeta` fields that the lock-free history
/// path reads; the table keeps them in sync under the metadata lock.
/// The remaining meta fields the data path touches (heap geometry,
/// size_max) are immutable from oid publication to slot reuse.
#[repr(C, align(64))]
pub struct ObjectSlot {
    /// 0 = free slot. Published last with Release on (re)birth.
    pub oid: AtomicU32,
    /// Mirror of `meta.created_conn`; 0 once orphaned.
    pub owner_conn: AtomicU32,
    /// Mirror of `meta.flags`.
    pub flags: AtomicU32,
    /// Ring index of the newest committed slot; -1 = none yet.
    pub history_slot: AtomicI32,
    /// Mirror of `meta.deleted_ts`.
    pub deleted_ts: AtomicI64,
    /// Newest committed commit-timestamp; cycle-watch and waiters read it.
    pub last_commit_ts: AtomicI64,
    /// Total commits since birth; the slot-cursor's absolute index space.
    pub commit_count: AtomicU64,
    pub min_cycle_ns: AtomicI64,
    pub max_cycle_ns: AtomicI64,
    meta: UnsafeCell<ObjectMeta>,
    /// Taken by writers only when the object is publicly writable.
    pub write_lock: SharedLock,
    pub notify_lock: SharedLock,
    pub notify_cond: SharedCondVar,
}

unsafe impl Send for ObjectSlot {}
unsafe impl Sync for ObjectSlot {}

impl ObjectSlot {
    /// Initialize the embedded locks. Called once per slot at segment
    /// creation.
    ///
    /// # Safety
    /// Slot memory must be zeroed and not yet shared.
    pub unsafe fn init(&self, mode: LockMode) -> DbResult<()> {
        self.write_lock.init(mode)?;
        self.notify_lock.init(mode)?;
        self.notify_cond.init(mode)?;
        self.history_slot.store(-1, Ordering::Relaxed);
        Ok(())
    }

    /// # Safety
    /// Caller holds the metadata lock, or relies only on fields that are
    /// immutable while `self.oid` matches the oid it resolved.
    pub unsafe fn meta(&self) -> &ObjectMeta {
        &*self.meta.get()
    }

    /// # Safety
    /// Caller holds the metadata lock.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn meta_mut(&self) -> &mut ObjectMeta {
        &mut *self.meta.get()
    }

    pub fn object_flags(&self) -> ObjectFlags {
        ObjectFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_ts.load(Ordering::Acquire) != 0
    }
}

/// Permission to publish data to / delete an object.
pub fn can_write(slot: &ObjectSlot, caller: Caller) -> bool {
    caller.admin
        || slot.owner_conn.load(Ordering::Acquire) == caller.conn_id
        || slot.object_flags().contains(ObjectFlags::WRITE_ALLOW)
}

/// Permission to read an object's data.
pub fn can_read(slot: &ObjectSlot, caller: Caller) -> bool {
    caller.admin
        || slot.owner_conn.load(Ordering::Acquire) == caller.conn_id
        || !slot.object_flags().contains(ObjectFlags::READ_DENY)
}

/// Lock-free slot lookup by oid. A hit is authoritative: oids are never
/// reused, so `slot.oid == oid` pins the slot's identity.
pub fn slot_index_of(view: &SegmentView, oid: ObjectId) -> Option<usize> {
    if oid.is_none() {
        return None;
    }
    (0..view.object_capacity()).find(|&i| view.object_slot(i).oid.load(Ordering::Acquire) == oid.0)
}

/// Insert a new object. Takes the metadata lock; wakes metadata waiters.
pub fn insert(view: &SegmentView, caller: Caller, spec: &ObjectSpec) -> DbResult<ObjectId> {
    let geom = spec.validate()?;
    let now = view.db_now();
    let guard = view.header().meta_lock.lock();

    // Uniqueness: an active or not-yet-purged object with the same
    // (name, type) blocks the insert if either side asks for uniqueness.
    let unique_requested = spec.flags.contains(ObjectFlags::UNIQUE);
    for i in 0..view.object_capacity() {
        let slot = view.object_slot(i);
        if slot.oid.load(Ordering::Relaxed) == 0 {
            continue;
        }
        let meta = unsafe { slot.meta() };
        if meta.name == geom.name
            && meta.otype == spec.otype
            && (unique_requested || meta.flags().contains(ObjectFlags::UNIQUE))
        {
            return Err(DbError::NotUnique);
        }
    }

    if !spec.parent.is_none() {
        let alive = slot_index_of(view, spec.parent)
            .map(|i| !view.object_slot(i).is_deleted())
            .unwrap_or(false);
        if !alive {
            return Err(DbError::Invalid(format!(
                "parent {} does not exist",
                spec.parent
            )));
        }
    }

    let heap_len: u32 = (geom.history_size as u64 * geom.slot_stride as u64)
        .try_into()
        .map_err(|_| DbError::Invalid("history buffer exceeds arena addressing".into()))?;

    // (a) reuse an expired keep-alloc range of matching size owned by us
    let mut target: Option<(usize, u32)> = None;
    if spec.size_max != 0 {
        for i in 0..view.object_capacity() {
            let slot = view.object_slot(i);
            if slot.oid.load(Ordering::Relaxed) == 0 || !slot.is_deleted() {
                continue;
            }
            let meta = unsafe { slot.meta() };
            if meta.flags().contains(ObjectFlags::KEEP_ALLOC)
                && meta.created_conn == caller.conn_id
                && meta.heap_len() == heap_len
            {
                target = Some((i, meta.heap_off));
                break;
            }
        }
    }

    // (b) fresh slot + fresh heap, retrying once after an opportunistic
    // purge on either form of exhaustion
    let (slot_idx, heap_off) = match target {
        Some(t) => t,
        None => {
            let mut slot_idx = find_free_slot(view);
            if slot_idx.is_none() {
                purge_expired_locked(view, &guard, now);
                slot_idx = find_free_slot(view);
            }
            let slot_idx = slot_idx.ok_or(DbError::OutOfObjects)?;

            let heap_off = if heap_len == 0 {
                0
            } else {
                match view.heap().alloc(heap_len) {
                    Ok(off) => off,
                    Err(DbError::NoMemory) => {
                        purge_expired_locked(view, &guard, now);
                        view.heap().alloc(heap_len)?
                    }
                    Err(e) => return Err(e),
                }
            };
            (slot_idx, heap_off)
        }
    };

    let oid = view.next_oid();
    let slot = view.object_slot(slot_idx);
    {
        let meta = unsafe { slot.meta_mut() };
        *meta = ObjectMeta {
            oid,
            otype: spec.otype,
            parent: spec.parent,
            flags: spec.flags.bits(),
            name: geom.name,
            created_ts: now.as_nanos(),
            created_conn: caller.conn_id,
            deleted_conn: 0,
            deleted_ts: 0,
            size_max: spec.size_max,
            history_size: geom.history_size,
            history_interval_ns: geom.interval_ns,
            min_cycle_ns: geom.min_cycle_ns,
            max_cycle_ns: geom.max_cycle_ns,
            heap_off,
            slot_stride: geom.slot_stride,
        };
    }
    if heap_off != 0 {
        crate::history::clear_ring(view, heap_off, geom.history_size, geom.slot_stride)?;
    }
    slot.owner_conn.store(caller.conn_id, Ordering::Relaxed);
    slot.flags.store(spec.flags.bits(), Ordering::Relaxed);
    slot.deleted_ts.store(0, Ordering::Relaxed);
    slot.history_slot.store(-1, Ordering::Relaxed);
    slot.last_commit_ts.store(0, Ordering::Relaxed);
    slot.commit_count.store(0, Ordering::Relaxed);
    slot.min_cycle_ns.store(geom.min_cycle_ns, Ordering::Relaxed);
    slot.max_cycle_ns.store(geom.max_cycle_ns, Ordering::Relaxed);
    slot.oid.store(oid.0, Ordering::Release);

    reparent_orphans_locked(view, &guard);

    trace::emit(view, TraceEventKind::Add, oid, now);
    view.header().meta_cond.broadcast();
    log::debug!("inserted object {:?} as {oid}", spec.name);
    Ok(oid)
}

fn find_free_slot(view: &SegmentView) -> Option<usize> {
    (0..view.object_capacity()).find(|&i| view.object_slot(i).oid.load(Ordering::Relaxed) == 0)
}

/// Point objects whose parent is gone back at the implicit root.
fn reparent_orphans_locked(view: &SegmentView, _guard: &LockGuard<'_>) {
    for i in 0..view.object_capacity() {
        let slot = view.object_slot(i);
        if slot.oid.load(Ordering::Relaxed) == 0 {
            continue;
        }
        let parent = unsafe { slot.meta() }.parent;
        if parent.is_none() {
            continue;
        }
        let parent_alive = slot_index_of(view, parent)
            .map(|p| !view.object_slot(p).is_deleted())
            .unwrap_or(false);
        if !parent_alive {
            unsafe { slot.meta_mut() }.parent = ObjectId::NONE;
        }
    }
}

/// Mark an object deleted (or synchronously reclaim it when the
/// immediately-delete flag is set). Takes the metadata lock; cascades to
/// parent-delete children; wakes per-object and metadata waiters.
pub fn delete(view: &SegmentView, caller: Caller, oid: ObjectId) -> DbResult<()> {
    let now = view.db_now();
    let guard = view.header().meta_lock.lock();

    let idx = slot_index_of(view, oid).ok_or(DbError::NotFound)?;
    let slot = view.object_slot(idx);
    if !can_write(slot, caller) {
        return Err(DbError::NoPerm);
    }

    if slot.is_deleted() {
        if slot.object_flags().contains(ObjectFlags::IMMEDIATELY_DELETE) {
            purge_slot_locked(view, &guard, idx);
            view.header().meta_cond.broadcast();
            return Ok(());
        }
        return Err(DbError::NotFound);
    }

    // Iterative cascade: children flagged parent-delete go with us.
    let mut pending = vec![idx];
    while let Some(i) = pending.pop() {
        let s = view.object_slot(i);
        if s.oid.load(Ordering::Relaxed) == 0 || s.is_deleted() {
            continue;
        }
        let victim_oid = ObjectId(s.oid.load(Ordering::Relaxed));
        {
            let meta = unsafe { s.meta_mut() };
            meta.deleted_ts = now.as_nanos();
            meta.deleted_conn = caller.conn_id;
        }
        s.deleted_ts.store(now.as_nanos(), Ordering::Release);

        // wake blocked readers so they observe the deletion
        if !s.object_flags().contains(ObjectFlags::NO_NOTIFY) {
            let ng = s.notify_lock.lock();
            s.notify_cond.broadcast();
            drop(ng);
        }
        trace::emit(view, TraceEventKind::Del, victim_oid, now);

        for j in 0..view.object_capacity() {
            let child = view.object_slot(j);
            if child.oid.load(Ordering::Relaxed) == 0 || child.is_deleted() {
                continue;
            }
            let cm = unsafe { child.meta() };
            if cm.parent == victim_oid && cm.flags().contains(ObjectFlags::PARENT_DELETE) {
                pending.push(j);
            }
        }

        if s.object_flags().contains(ObjectFlags::IMMEDIATELY_DELETE) {
            purge_slot_locked(view, &guard, i);
        }
    }

    view.header().meta_cond.broadcast();
    Ok(())
}

/// Metadata snapshot valid at `ts` (0 = now).
pub fn read_info(view: &SegmentView, oid: ObjectId, ts: Timestamp) -> DbResult<ObjectMeta> {
    let _guard = view.header().meta_lock.lock();
    let idx = slot_index_of(view, oid).ok_or(DbError::NotFound)?;
    let meta = unsafe { *view.object_slot(idx).meta() };
    let at = if ts.is_set() { ts } else { view.db_now() };
    if !meta.alive_at(at) {
        return Err(DbError::NotFound);
    }
    Ok(meta)
}

/// The limited set of fields an owner (or admin) may change after insert.
/// Ring geometry is fixed at insert; the interval only affects grace and
/// staleness accounting from here on.
#[derive(Debug, Clone, Default)]
pub struct ChangeInfo {
    pub history_interval: Option<Duration>,
    pub min_cycle: Option<Duration>,
    pub max_cycle: Option<Duration>,
    pub flags: Option<ObjectFlags>,
}

pub fn change_info(
    view: &SegmentView,
    caller: Caller,
    oid: ObjectId,
    change: &ChangeInfo,
) -> DbResult<()> {
    let now = view.db_now();
    let _guard = view.header().meta_lock.lock();
    let idx = slot_index_of(view, oid).ok_or(DbError::NotFound)?;
    let slot = view.object_slot(idx);
    if slot.is_deleted() {
        return Err(DbError::NotFound);
    }
    if !(caller.admin || slot.owner_conn.load(Ordering::Relaxed) == caller.conn_id) {
        return Err(DbError::NoPerm);
    }

    let meta = unsafe { slot.meta_mut() };
    if let Some(iv) = change.history_interval {
        meta.history_interval_ns = iv.as_nanos() as i64;
    }
    if let Some(c) = change.min_cycle {
        meta.min_cycle_ns = c.as_nanos() as i64;
        slot.min_cycle_ns.store(meta.min_cycle_ns, Ordering::Release);
    }
    if let Some(c) = change.max_cycle {
        meta.max_cycle_ns = c.as_nanos() as i64;
        slot.max_cycle_ns.store(meta.max_cycle_ns, Ordering::Release);
    }
    if let Some(f) = change.flags {
        meta.flags = f.bits();
        slot.flags.store(f.bits(), Ordering::Release);
    }

    trace::emit(view, TraceEventKind::Change, oid, now);
    view.header().meta_cond.broadcast();
    Ok(())
}

/// Reclaim one slot: return its heap range and mark the slot free.
pub fn purge_slot_locked(view: &SegmentView, _guard: &LockGuard<'_>, idx: usize) {
    let slot = view.object_slot(idx);
    let (heap_off, heap_len) = {
        let meta = unsafe { slot.meta() };
        (meta.heap_off, meta.heap_len())
    };
    // Free the slot first so lookups stop resolving to it.
    slot.oid.store(0, Ordering::Release);
    slot.history_slot.store(-1, Ordering::Relaxed);
    slot.last_commit_ts.store(0, Ordering::Relaxed);
    slot.deleted_ts.store(0, Ordering::Relaxed);
    slot.owner_conn.store(0, Ordering::Relaxed);
    slot.commit_count.store(0, Ordering::Relaxed);
    unsafe {
        *slot.meta_mut() = bytemuck::Zeroable::zeroed();
    }
    if heap_off != 0 {
        view.heap().free(heap_off, heap_len);
    }
}

/// Purge every deleted object whose grace period has elapsed. Returns the
/// number of slots reclaimed. Keep-alloc objects wait out a longer
/// threshold so their owner can re-insert into the range.
pub fn purge_expired_locked(view: &SegmentView, guard: &LockGuard<'_>, now: Timestamp) -> usize {
    let mut purged = 0;
    for i in 0..view.object_capacity() {
        let slot = view.object_slot(i);
        if slot.oid.load(Ordering::Relaxed) == 0 {
            continue;
        }
        let meta = unsafe { slot.meta() };
        if meta.deleted_ts == 0 {
            continue;
        }
        let mut grace = meta.history_interval_ns.max(view.min_grace_ns());
        if meta.flags().contains(ObjectFlags::KEEP_ALLOC) {
            grace = grace.saturating_mul(KEEP_ALLOC_GRACE_FACTOR);
        }
        if now.as_nanos() - meta.deleted_ts >= grace {
            purge_slot_locked(view, guard, i);
            purged += 1;
        }
    }
    if purged > 0 {
        log::debug!("purged {purged} expired objects");
    }
    purged
}

/// Drop everything a dying connection owned: non-persistent objects are
/// deleted, persistent ones are orphaned (owner becomes nobody). Caller
/// holds the metadata lock.
pub fn release_owned_locked(
    view: &SegmentView,
    _guard: &LockGuard<'_>,
    conn_id: u32,
    now: Timestamp,
) {
    for i in 0..view.object_capacity() {
        let slot = view.object_slot(i);
        if slot.oid.load(Ordering::Relaxed) == 0 {
            continue;
        }
        if slot.owner_conn.load(Ordering::Relaxed) != conn_id {
            continue;
        }
        if slot.object_flags().contains(ObjectFlags::PERSISTENT) {
            // orphan: access is governed by flags alone from here on
            unsafe { slot.meta_mut() }.created_conn = 0;
            slot.owner_conn.store(0, Ordering::Release);
            continue;
        }
        if !slot.is_deleted() {
            let meta = unsafe { slot.meta_mut() };
            meta.deleted_ts = now.as_nanos();
            meta.deleted_conn = conn_id;
            slot.deleted_ts.store(now.as_nanos(), Ordering::Release);
            let oid = ObjectId(slot.oid.load(Ordering::Relaxed));
            if !slot.object_flags().contains(ObjectFlags::NO_NOTIFY) {
                let ng = slot.notify_lock.lock();
                slot.notify_cond.broadcast();
                drop(ng);
            }
            trace::emit(view, TraceEventKind::Del, oid, now);
        }
    }
}
