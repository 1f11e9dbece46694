//! Per-object history ring and the lock-light commit/read protocol.
//!
//! Each slot carries a tagged commit marker in one atomic word:
//! 0 = empty, -1 = pending (a writer owns it), >0 = committed at that
//! commit timestamp. A writer marks the slot pending *before* touching
//! payload or header fields and publishes the committed marker with
//! Release ordering as its *last* write; a reader loads the marker with
//! Acquire before and after copying and treats any difference as a torn
//! read (`HistWrap`). A reader that observes a partially published marker
//! therefore sees "still invalid", never "falsely valid".
//!
//! Committed timestamps are strictly increasing per object: a same-tick
//! collision is forged forward by one tick. The read side never takes a
//! lock; writers absorb the ordering cost.

use crate::error::{DbError, DbResult};
use crate::object::{ObjectFlags, ObjectId};
use crate::process::Caller;
use crate::shm::SegmentView;
use crate::table::{can_read, can_write, ObjectSlot};
use crate::time::Timestamp;
use crate::trace::{self, TraceEventKind};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

/// Fixed per-slot header preceding the payload bytes.
pub const SLOT_HEADER_SIZE: usize = std::mem::size_of::<SlotHeader>();

pub const COMMIT_EMPTY: i64 = 0;
pub const COMMIT_PENDING: i64 = -1;

/// Bounded sleep-poll interval limits for no-notify / poll-mode waits.
const POLL_MIN: Duration = Duration::from_micros(500);
const POLL_MAX: Duration = Duration::from_millis(50);

/// Internal retries when a wait's final latest-read races an overwrite.
const WAIT_READ_RETRIES: usize = 64;

#[repr(C)]
pub struct SlotHeader {
    /// Tagged marker: `COMMIT_EMPTY`, `COMMIT_PENDING` or the commit
    /// timestamp in nanoseconds.
    pub commit: AtomicI64,
    /// Data timestamp; defaults to the commit timestamp when unset.
    pub data_ts: AtomicI64,
    /// Committed payload size in bytes.
    pub size: AtomicU32,
    /// Connection id of the committing process.
    pub committed_by: AtomicU32,
}

/// Which timestamp a history scan compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBase {
    Commit,
    Data,
}

/// Temporal selection relative to the query timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Newest entry at or before the timestamp.
    LatestAtOrBefore,
    /// Newest entry strictly older than the timestamp.
    Older,
    /// Oldest entry strictly younger than the timestamp.
    Younger,
}

/// Outcome of a successful read: the slot's stamps and the copied size.
/// `size` is the committed size, which may exceed what fit in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadResult {
    pub commit_ts: Timestamp,
    pub data_ts: Timestamp,
    pub size: u32,
}

fn slot_header<'a>(
    view: &'a SegmentView,
    heap_off: u32,
    stride: u32,
    idx: usize,
) -> DbResult<&'a SlotHeader> {
    let off = heap_off + idx as u32 * stride;
    let p = view.heap_ptr(off, SLOT_HEADER_SIZE)?;
    Ok(unsafe { &*(p as *const SlotHeader) })
}

fn payload_ptr(
    view: &SegmentView,
    heap_off: u32,
    stride: u32,
    idx: usize,
    size_max: u32,
) -> DbResult<*mut u8> {
    let off = heap_off + idx as u32 * stride + SLOT_HEADER_SIZE as u32;
    view.heap_ptr(off, size_max as usize)
}

/// Zero every slot header of a (fresh or reused) ring.
pub fn clear_ring(view: &SegmentView, heap_off: u32, size: u32, stride: u32) -> DbResult<()> {
    for i in 0..size as usize {
        let hdr = slot_header(view, heap_off, stride, i)?;
        hdr.commit.store(COMMIT_EMPTY, Ordering::Relaxed);
        hdr.data_ts.store(0, Ordering::Relaxed);
        hdr.size.store(0, Ordering::Relaxed);
        hdr.committed_by.store(0, Ordering::Relaxed);
    }
    Ok(())
}

/// Revalidate that `slot` still carries `oid` and is not deleted.
fn check_identity(slot: &ObjectSlot, oid: ObjectId) -> DbResult<()> {
    if slot.oid.load(Ordering::Acquire) != oid.0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Publish a new value. Returns the commit timestamp.
pub fn write(
    view: &SegmentView,
    caller: Caller,
    slot_idx: usize,
    oid: ObjectId,
    payload: &[u8],
    data_ts: Timestamp,
) -> DbResult<Timestamp> {
    let slot = view.object_slot(slot_idx);
    check_identity(slot, oid)?;
    if slot.is_deleted() {
        return Err(DbError::NotFound);
    }
    if !can_write(slot, caller) {
        return Err(DbError::NoPerm);
    }

    // Geometry is immutable while the slot carries this oid.
    let (heap_off, stride, history_size, size_max) = {
        let meta = unsafe { slot.meta() };
        (meta.heap_off, meta.slot_stride, meta.history_size, meta.size_max)
    };
    if size_max == 0 || history_size == 0 {
        return Err(DbError::Invalid("object carries no data".into()));
    }
    if payload.len() > size_max as usize {
        return Err(DbError::Invalid(format!(
            "payload of {} bytes exceeds size_max {}",
            payload.len(),
            size_max
        )));
    }

    let flags = slot.object_flags();
    // Only publicly writable objects need the write lock; an
    // owner-exclusive object has exactly one writer by construction.
    let _wg = flags
        .contains(ObjectFlags::WRITE_ALLOW)
        .then(|| slot.write_lock.lock());

    let now = view.db_now();
    if flags.contains(ObjectFlags::CYCLE_WATCH) {
        let prev = slot.last_commit_ts.load(Ordering::Acquire);
        if prev != 0 && now.as_nanos() - prev < slot.min_cycle_ns.load(Ordering::Relaxed) {
            return Err(DbError::TooFast);
        }
    }

    let cur = slot.history_slot.load(Ordering::Acquire);
    let next = ((cur + 1) as usize) % history_size as usize;
    let hdr = slot_header(view, heap_off, stride, next)?;

    // Pending first: readers must treat the slot as invalid from here on.
    hdr.commit.store(COMMIT_PENDING, Ordering::Release);

    unsafe {
        std::ptr::copy_nonoverlapping(
            payload.as_ptr(),
            payload_ptr(view, heap_off, stride, next, size_max)?,
            payload.len(),
        );
    }

    let mut ts = now;
    let last = slot.last_commit_ts.load(Ordering::Relaxed);
    if ts.as_nanos() <= last {
        // same-tick collision: forge strictly increasing commit times
        ts = Timestamp(last).next_tick();
    }
    let dts = if data_ts.is_set() { data_ts } else { ts };

    hdr.data_ts.store(dts.as_nanos(), Ordering::Relaxed);
    hdr.size.store(payload.len() as u32, Ordering::Relaxed);
    hdr.committed_by.store(caller.conn_id, Ordering::Relaxed);
    // Committed(ts) last, Release-paired with the readers' Acquire loads.
    hdr.commit.store(ts.as_nanos(), Ordering::Release);

    slot.history_slot.store(next as i32, Ordering::Release);
    slot.last_commit_ts.store(ts.as_nanos(), Ordering::Release);
    slot.commit_count.fetch_add(1, Ordering::AcqRel);

    if !flags.contains(ObjectFlags::NO_NOTIFY) {
        // acquired only for the signal
        let ng = slot.notify_lock.lock();
        slot.notify_cond.broadcast();
        drop(ng);
    }
    trace::emit(view, TraceEventKind::Update, oid, ts);
    Ok(ts)
}

/// Two-phase in-place write for a sole non-public owner: the guard hands
/// out the slot's payload bytes directly, avoiding a copy for large
/// payloads, at the cost of all protection if misused.
pub struct WriteGuard<'a> {
    view: &'a SegmentView,
    slot_idx: usize,
    oid: ObjectId,
    ring_idx: usize,
    caller: Caller,
    size_max: u32,
    heap_off: u32,
    stride: u32,
    payload: *mut u8,
    committed: bool,
}

impl<'a> WriteGuard<'a> {
    /// The slot's raw payload region. Nothing else may read it until
    /// [`WriteGuard::commit`] runs.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.payload, self.size_max as usize) }
    }

    /// Publish the filled slot.
    pub fn commit(mut self, size: u32, data_ts: Timestamp) -> DbResult<Timestamp> {
        if size > self.size_max {
            return Err(DbError::Invalid(format!(
                "committed size {size} exceeds size_max {}",
                self.size_max
            )));
        }
        let slot = self.view.object_slot(self.slot_idx);
        check_identity(slot, self.oid)?;

        let flags = slot.object_flags();
        let now = self.view.db_now();
        if flags.contains(ObjectFlags::CYCLE_WATCH) {
            let prev = slot.last_commit_ts.load(Ordering::Acquire);
            if prev != 0 && now.as_nanos() - prev < slot.min_cycle_ns.load(Ordering::Relaxed) {
                return Err(DbError::TooFast);
            }
        }

        let hdr = slot_header(self.view, self.heap_off, self.stride, self.ring_idx)?;
        let mut ts = now;
        let last = slot.last_commit_ts.load(Ordering::Relaxed);
        if ts.as_nanos() <= last {
            ts = Timestamp(last).next_tick();
        }
        let dts = if data_ts.is_set() { data_ts } else { ts };
        hdr.data_ts.store(dts.as_nanos(), Ordering::Relaxed);
        hdr.size.store(size, Ordering::Relaxed);
        hdr.committed_by.store(self.caller.conn_id, Ordering::Relaxed);
        hdr.commit.store(ts.as_nanos(), Ordering::Release);

        slot.history_slot.store(self.ring_idx as i32, Ordering::Release);
        slot.last_commit_ts.store(ts.as_nanos(), Ordering::Release);
        slot.commit_count.fetch_add(1, Ordering::AcqRel);
        self.committed = true;

        if !flags.contains(ObjectFlags::NO_NOTIFY) {
            let ng = slot.notify_lock.lock();
            slot.notify_cond.broadcast();
            drop(ng);
        }
        trace::emit(self.view, TraceEventKind::Update, self.oid, ts);
        Ok(ts)
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            // abandoned: return the slot to "empty" so readers skip it
            if let Ok(hdr) = slot_header(self.view, self.heap_off, self.stride, self.ring_idx) {
                hdr.commit.store(COMMIT_EMPTY, Ordering::Release);
            }
        }
    }
}

/// Start a two-phase write. Only the owner of a non-publicly-writable
/// object may hold a direct pointer into the ring.
pub fn write_begin<'a>(
    view: &'a SegmentView,
    caller: Caller,
    slot_idx: usize,
    oid: ObjectId,
) -> DbResult<WriteGuard<'a>> {
    let slot = view.object_slot(slot_idx);
    check_identity(slot, oid)?;
    if slot.is_deleted() {
        return Err(DbError::NotFound);
    }
    let flags = slot.object_flags();
    let owner = slot.owner_conn.load(Ordering::Acquire) == caller.conn_id;
    if flags.contains(ObjectFlags::WRITE_ALLOW) || !(owner || caller.admin) {
        return Err(DbError::NoPerm);
    }
    let (heap_off, stride, history_size, size_max) = {
        let meta = unsafe { slot.meta() };
        (meta.heap_off, meta.slot_stride, meta.history_size, meta.size_max)
    };
    if size_max == 0 || history_size == 0 {
        return Err(DbError::Invalid("object carries no data".into()));
    }
    let cur = slot.history_slot.load(Ordering::Acquire);
    let next = ((cur + 1) as usize) % history_size as usize;
    let hdr = slot_header(view, heap_off, stride, next)?;
    let payload = payload_ptr(view, heap_off, stride, next, size_max)?;
    hdr.commit.store(COMMIT_PENDING, Ordering::Release);
    Ok(WriteGuard {
        view,
        slot_idx,
        oid,
        ring_idx: next,
        caller,
        size_max,
        heap_off,
        stride,
        payload,
        committed: false,
    })
}

struct Selected {
    ring_idx: usize,
    marker: i64,
}

/// Backward scan over the ring, lock-free. Returns the selected slot and
/// the marker observed at selection time, or the scan verdict.
fn scan(
    view: &SegmentView,
    slot: &ObjectSlot,
    target: Timestamp,
    mode: ReadMode,
    base: TimeBase,
) -> DbResult<Selected> {
    let (heap_off, stride, history_size) = {
        let meta = unsafe { slot.meta() };
        (meta.heap_off, meta.slot_stride, meta.history_size)
    };
    let newest = slot.history_slot.load(Ordering::Acquire);
    if newest < 0 || history_size == 0 {
        return Err(DbError::NotFound);
    }

    let mut younger_candidate: Option<Selected> = None;
    let mut hit_empty = false;
    let mut saw_committed = false;

    for k in 0..history_size as usize {
        let i = (newest as usize + history_size as usize - k) % history_size as usize;
        let hdr = slot_header(view, heap_off, stride, i)?;
        let marker = hdr.commit.load(Ordering::Acquire);
        if marker == COMMIT_EMPTY {
            hit_empty = true;
            break;
        }
        if marker == COMMIT_PENDING {
            continue;
        }
        saw_committed = true;
        let t = match base {
            TimeBase::Commit => marker,
            TimeBase::Data => hdr.data_ts.load(Ordering::Acquire),
        };
        match mode {
            ReadMode::LatestAtOrBefore => {
                if t <= target.as_nanos() {
                    return Ok(Selected { ring_idx: i, marker });
                }
            }
            ReadMode::Older => {
                if t < target.as_nanos() {
                    return Ok(Selected { ring_idx: i, marker });
                }
            }
            ReadMode::Younger => {
                if t > target.as_nanos() {
                    // keep scanning: the oldest younger entry wins
                    younger_candidate = Some(Selected { ring_idx: i, marker });
                } else {
                    break;
                }
            }
        }
    }

    if let Some(sel) = younger_candidate {
        return Ok(sel);
    }
    match mode {
        ReadMode::Younger => Err(DbError::NotFound),
        _ => {
            // Every committed entry was newer than the target. If the ring
            // still shows an empty tail the value never existed; otherwise
            // it was overwritten.
            if saw_committed && !hit_empty {
                Err(DbError::HistWrap)
            } else {
                Err(DbError::NotFound)
            }
        }
    }
}

/// Read a historical (or the latest) value into `buf`. `ts == 0` means
/// "now". Truncates to the buffer and reports the real committed size.
pub fn read(
    view: &SegmentView,
    caller: Caller,
    slot_idx: usize,
    oid: ObjectId,
    ts: Timestamp,
    mode: ReadMode,
    base: TimeBase,
    buf: &mut [u8],
) -> DbResult<ReadResult> {
    let slot = view.object_slot(slot_idx);
    check_identity(slot, oid)?;
    if !can_read(slot, caller) {
        return Err(DbError::NoPerm);
    }
    let now = view.db_now();
    let del = slot.deleted_ts.load(Ordering::Acquire);
    let target = if ts.is_set() { ts } else { now };
    if del != 0 && target.as_nanos() >= del {
        return Err(DbError::NotFound);
    }

    let (heap_off, stride, size_max) = {
        let meta = unsafe { slot.meta() };
        (meta.heap_off, meta.slot_stride, meta.size_max)
    };

    let sel = scan(view, slot, target, mode, base)?;
    let hdr = slot_header(view, heap_off, stride, sel.ring_idx)?;
    let size = hdr.size.load(Ordering::Acquire);
    let data_ts = hdr.data_ts.load(Ordering::Acquire);
    let n = (size as usize).min(buf.len());
    unsafe {
        std::ptr::copy_nonoverlapping(
            payload_ptr(view, heap_off, stride, sel.ring_idx, size_max)?,
            buf.as_mut_ptr(),
            n,
        );
    }
    // The marker must be exactly what the scan saw; a writer would have
    // flipped it to Pending and then to a strictly larger timestamp.
    if hdr.commit.load(Ordering::Acquire) != sel.marker {
        return Err(DbError::HistWrap);
    }
    // The table slot itself may have been purged and reborn mid-read,
    // handing the ring memory to another object.
    check_identity(slot, oid)?;

    if slot.object_flags().contains(ObjectFlags::WITHHOLD_STALE) {
        let max_cycle = slot.max_cycle_ns.load(Ordering::Relaxed);
        if max_cycle > 0 && now.as_nanos() - sel.marker > max_cycle {
            return Err(DbError::TooFast);
        }
    }

    Ok(ReadResult {
        commit_ts: Timestamp(sel.marker),
        data_ts: Timestamp(data_ts),
        size,
    })
}

/// A validated, zero-copy view of one committed slot. The payload pointer
/// stays valid only as long as [`SlotRef::revalidate`] keeps succeeding.
pub struct SlotRef<'a> {
    slot: &'a ObjectSlot,
    hdr: &'a SlotHeader,
    payload: *const u8,
    oid: ObjectId,
    marker: i64,
    pub commit_ts: Timestamp,
    pub data_ts: Timestamp,
    pub size: u32,
}

impl SlotRef<'_> {
    /// # Safety
    /// The bytes may be overwritten concurrently; the caller must call
    /// [`SlotRef::revalidate`] after consuming them and discard the data
    /// on failure.
    pub unsafe fn payload(&self) -> &[u8] {
        std::slice::from_raw_parts(self.payload, self.size as usize)
    }

    /// `HistWrap` if the slot was overwritten since the ref was taken,
    /// `NotFound` if the object itself was purged out from under it.
    pub fn revalidate(&self) -> DbResult<()> {
        check_identity(self.slot, self.oid)?;
        if self.hdr.commit.load(Ordering::Acquire) != self.marker {
            return Err(DbError::HistWrap);
        }
        Ok(())
    }
}

/// Pointer variant of [`read`]: no copy, for very large payloads.
pub fn read_ref<'a>(
    view: &'a SegmentView,
    caller: Caller,
    slot_idx: usize,
    oid: ObjectId,
    ts: Timestamp,
    mode: ReadMode,
    base: TimeBase,
) -> DbResult<SlotRef<'a>> {
    let slot = view.object_slot(slot_idx);
    check_identity(slot, oid)?;
    if !can_read(slot, caller) {
        return Err(DbError::NoPerm);
    }
    let now = view.db_now();
    let del = slot.deleted_ts.load(Ordering::Acquire);
    let target = if ts.is_set() { ts } else { now };
    if del != 0 && target.as_nanos() >= del {
        return Err(DbError::NotFound);
    }
    let (heap_off, stride, size_max) = {
        let meta = unsafe { slot.meta() };
        (meta.heap_off, meta.slot_stride, meta.size_max)
    };
    let sel = scan(view, slot, target, mode, base)?;
    let hdr = slot_header(view, heap_off, stride, sel.ring_idx)?;
    let size = hdr.size.load(Ordering::Acquire).min(size_max);
    let data_ts = hdr.data_ts.load(Ordering::Acquire);
    let payload = payload_ptr(view, heap_off, stride, sel.ring_idx, size_max)? as *const u8;
    let r = SlotRef {
        slot,
        hdr,
        payload,
        oid,
        marker: sel.marker,
        commit_ts: Timestamp(sel.marker),
        data_ts: Timestamp(data_ts),
        size,
    };
    r.revalidate()?;
    Ok(r)
}

/// Caller-held cursor over an object's absolute commit sequence, for
/// consumers that need every commit rather than only the latest.
#[derive(Debug, Clone, Copy)]
pub struct SlotCursor {
    pub oid: ObjectId,
    /// Absolute 1-based commit number of the entry the cursor sits on;
    /// 0 = before the first commit.
    abs: u64,
}

impl SlotCursor {
    pub fn new(oid: ObjectId) -> SlotCursor {
        SlotCursor { oid, abs: 0 }
    }

    pub fn position(&self) -> u64 {
        self.abs
    }
}

/// Step the cursor by a signed offset and read that commit.
/// `NotFound` past the newest commit (nothing there yet), `HistWrap` when
/// the requested commit has been overwritten.
pub fn read_slot(
    view: &SegmentView,
    caller: Caller,
    slot_idx: usize,
    cursor: &mut SlotCursor,
    step: i64,
    buf: &mut [u8],
) -> DbResult<ReadResult> {
    let slot = view.object_slot(slot_idx);
    check_identity(slot, cursor.oid)?;
    if !can_read(slot, caller) {
        return Err(DbError::NoPerm);
    }

    let target = cursor.abs as i64 + step;
    if target < 1 {
        return Err(DbError::Invalid(format!("cursor step to {target}")));
    }
    let target = target as u64;

    let (heap_off, stride, history_size, size_max) = {
        let meta = unsafe { slot.meta() };
        (meta.heap_off, meta.slot_stride, meta.history_size, meta.size_max)
    };
    if history_size == 0 {
        return Err(DbError::NotFound);
    }

    let count = slot.commit_count.load(Ordering::Acquire);
    if target > count {
        return Err(DbError::NotFound);
    }
    if count - target >= history_size as u64 {
        return Err(DbError::HistWrap);
    }

    let ring_idx = ((target - 1) % history_size as u64) as usize;
    let hdr = slot_header(view, heap_off, stride, ring_idx)?;
    let marker = hdr.commit.load(Ordering::Acquire);
    if marker <= 0 {
        return Err(DbError::HistWrap);
    }
    let size = hdr.size.load(Ordering::Acquire);
    let data_ts = hdr.data_ts.load(Ordering::Acquire);
    let n = (size as usize).min(buf.len());
    unsafe {
        std::ptr::copy_nonoverlapping(
            payload_ptr(view, heap_off, stride, ring_idx, size_max)?,
            buf.as_mut_ptr(),
            n,
        );
    }
    if hdr.commit.load(Ordering::Acquire) != marker {
        return Err(DbError::HistWrap);
    }
    // The writer may have lapped us between the count check and the copy.
    let count_now = slot.commit_count.load(Ordering::Acquire);
    if count_now >= target && count_now - target >= history_size as u64 {
        return Err(DbError::HistWrap);
    }
    // A purge and rebirth resets the count; catch it by identity.
    check_identity(slot, cursor.oid)?;

    cursor.abs = target;
    Ok(ReadResult {
        commit_ts: Timestamp(marker),
        data_ts: Timestamp(data_ts),
        size,
    })
}

/// Block until the object has a commit newer than `old_ts`, then return
/// it. Prepare/check/wait/done: the notify lock is taken before the
/// check, so a signal between check and wait cannot be missed. With
/// `poll` (caller in poll mode, or the object flagged no-notify) this
/// degrades to a bounded-interval sleep-poll.
#[allow(clippy::too_many_arguments)]
pub fn wait_next(
    view: &SegmentView,
    caller: Caller,
    slot_idx: usize,
    oid: ObjectId,
    old_ts: Timestamp,
    deadline: Timestamp,
    poll: bool,
    buf: &mut [u8],
) -> DbResult<ReadResult> {
    let slot = view.object_slot(slot_idx);
    check_identity(slot, oid)?;
    if !can_read(slot, caller) {
        return Err(DbError::NoPerm);
    }

    let use_poll = poll || slot.object_flags().contains(ObjectFlags::NO_NOTIFY);
    if use_poll {
        let cycle = slot.min_cycle_ns.load(Ordering::Relaxed).max(0) as u64;
        let interval = Duration::from_nanos(cycle / 2).clamp(POLL_MIN, POLL_MAX);
        loop {
            if slot.is_deleted() {
                return Err(DbError::NotFound);
            }
            if slot.last_commit_ts.load(Ordering::Acquire) > old_ts.as_nanos() {
                return read_latest_retrying(view, caller, slot_idx, oid, buf);
            }
            if view.db_now() >= deadline {
                return Err(DbError::Timeout);
            }
            std::thread::sleep(interval);
        }
    }

    let guard = slot.notify_lock.lock();
    loop {
        if slot.is_deleted() {
            return Err(DbError::NotFound);
        }
        if slot.last_commit_ts.load(Ordering::Acquire) > old_ts.as_nanos() {
            drop(guard);
            return read_latest_retrying(view, caller, slot_idx, oid, buf);
        }
        slot.notify_cond
            .wait_until(&guard, deadline, || view.db_now())?;
    }
}

/// Latest-value read that absorbs HISTWRAP races from fast writers.
fn read_latest_retrying(
    view: &SegmentView,
    caller: Caller,
    slot_idx: usize,
    oid: ObjectId,
    buf: &mut [u8],
) -> DbResult<ReadResult> {
    let mut last_err = DbError::HistWrap;
    for _ in 0..WAIT_READ_RETRIES {
        match read(
            view,
            caller,
            slot_idx,
            oid,
            Timestamp::ZERO,
            ReadMode::LatestAtOrBefore,
            TimeBase::Commit,
            buf,
        ) {
            Err(DbError::HistWrap) => {
                last_err = DbError::HistWrap;
                std::hint::spin_loop();
            }
            other => return other,
        }
    }
    Err(last_err)
}
