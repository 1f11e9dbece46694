//! Process table: registration slots, the per-cycle liveness protocol and
//! caller identity.
//!
//! Each participating OS process registers one slot and receives a small
//! positive connection id. The slot carries the declared cycle time and a
//! free-running status word that watchers poll to detect stalled
//! producers. Dead processes are detected by the housekeeper with a
//! `kill(pid, 0)` probe.

use crate::error::{DbError, DbResult};
use crate::object::pack_name;
use crate::shm::SegmentView;
use crate::time::Timestamp;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

/// Process registration flags.
pub const PROC_ADMIN: u32 = 1 << 0;
/// Never block on condvars; poll instead (also forced by `NO_NOTIFY`
/// objects).
pub const PROC_POLL: u32 = 1 << 1;

/// Published per-cycle status, for stall watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcessStatus {
    Unknown = 0,
    Busy = 1,
    CycleDone = 2,
    Waiting = 3,
    Warning = 4,
    Failure = 5,
}

impl ProcessStatus {
    pub fn from_raw(raw: u32) -> ProcessStatus {
        match raw {
            1 => ProcessStatus::Busy,
            2 => ProcessStatus::CycleDone,
            3 => ProcessStatus::Waiting,
            4 => ProcessStatus::Warning,
            5 => ProcessStatus::Failure,
            _ => ProcessStatus::Unknown,
        }
    }
}

/// Caller identity carried through every store operation.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    /// Connection id (process-table slot index + 1); never 0.
    pub conn_id: u32,
    pub admin: bool,
}

/// One registration slot in the segment. Registration and teardown happen
/// under the metadata lock; the status fields are free-running atomics.
#[repr(C, align(64))]
pub struct ProcessSlot {
    /// OS pid; 0 marks a free slot.
    pub pid: AtomicU32,
    pub flags: AtomicU32,
    pub status: AtomicU32,
    _pad: u32,
    pub cycle_ns: AtomicI64,
    pub registered_ts: AtomicI64,
    pub last_cycle_ts: AtomicI64,
    name: UnsafeCell<[u8; 32]>,
    status_msg: UnsafeCell<[u8; 32]>,
}

unsafe impl Send for ProcessSlot {}
unsafe impl Sync for ProcessSlot {}

impl ProcessSlot {
    pub fn is_free(&self) -> bool {
        self.pid.load(Ordering::Acquire) == 0
    }

    pub fn name_str(&self) -> String {
        let bytes = unsafe { *self.name.get() };
        crate::object::unpack_name(&bytes).to_string()
    }

    /// Best-effort status message; may be torn if read concurrently with
    /// an update, which watchers tolerate.
    pub fn status_msg_str(&self) -> String {
        let bytes = unsafe { *self.status_msg.get() };
        crate::object::unpack_name(&bytes).to_string()
    }
}

/// Register the calling process. Takes the metadata lock.
pub fn register(
    view: &SegmentView,
    name: &str,
    pid: u32,
    cycle: Duration,
    flags: u32,
) -> DbResult<u32> {
    let packed = pack_name(name)?;
    let now = view.db_now();
    let _guard = view.header().meta_lock.lock();
    for idx in 0..view.process_capacity() {
        let slot = view.process_slot(idx);
        if !slot.is_free() {
            continue;
        }
        slot.flags.store(flags, Ordering::Relaxed);
        slot.status.store(ProcessStatus::Unknown as u32, Ordering::Relaxed);
        slot.cycle_ns.store(cycle.as_nanos() as i64, Ordering::Relaxed);
        slot.registered_ts.store(now.as_nanos(), Ordering::Relaxed);
        slot.last_cycle_ts.store(0, Ordering::Relaxed);
        unsafe {
            *slot.name.get() = packed;
            *slot.status_msg.get() = [0; 32];
        }
        // pid last: publishing it makes the slot visible to the reaper
        slot.pid.store(pid, Ordering::Release);
        let conn_id = idx as u32 + 1;
        log::debug!("registered process {name:?} pid {pid} as connection {conn_id}");
        view.header().meta_cond.broadcast();
        return Ok(conn_id);
    }
    Err(DbError::OutOfObjects)
}

/// Release a registration slot and this connection's objects: delete the
/// non-persistent ones, orphan the persistent ones. Takes the metadata
/// lock. Used by `Connection::drop` and by the dead-process reaper.
pub fn deregister(view: &SegmentView, conn_id: u32) {
    let now = view.db_now();
    let guard = view.header().meta_lock.lock();
    crate::table::release_owned_locked(view, &guard, conn_id, now);
    let idx = conn_id as usize - 1;
    if idx < view.process_capacity() {
        let slot = view.process_slot(idx);
        slot.pid.store(0, Ordering::Release);
    }
    view.header().meta_cond.broadcast();
    drop(guard);
    log::debug!("connection {conn_id} deregistered");
}

/// Publish a cycle status (WAITING/WARNING/FAILURE with a short message).
pub fn set_status(view: &SegmentView, conn_id: u32, status: ProcessStatus, msg: &str) {
    let idx = conn_id as usize - 1;
    if idx >= view.process_capacity() {
        return;
    }
    let slot = view.process_slot(idx);
    let mut packed = [0u8; 32];
    let n = msg.len().min(31);
    packed[..n].copy_from_slice(&msg.as_bytes()[..n]);
    unsafe {
        *slot.status_msg.get() = packed;
    }
    slot.status.store(status as u32, Ordering::Release);
}

/// Block until the process's next declared cycle boundary, then report
/// BUSY. Boundaries are counted from the registration timestamp, so an
/// overrunning cycle skips ahead instead of accumulating debt.
pub fn wait_next_cycle(view: &SegmentView, conn_id: u32) -> DbResult<Timestamp> {
    let idx = conn_id as usize - 1;
    if idx >= view.process_capacity() {
        return Err(DbError::NotConnected);
    }
    let slot = view.process_slot(idx);
    let cycle = slot.cycle_ns.load(Ordering::Relaxed);
    if cycle <= 0 {
        return Err(DbError::Invalid("process declared no cycle time".into()));
    }
    let base = slot.registered_ts.load(Ordering::Relaxed);
    let now = view.db_now().as_nanos();
    let elapsed = (now - base).max(0);
    let boundary = Timestamp(base + (elapsed / cycle + 1) * cycle);

    // Chunked sleep against db time, which can jump in simulation mode.
    loop {
        let t = view.db_now();
        if t >= boundary {
            break;
        }
        let remaining = boundary.saturating_sub(t);
        std::thread::sleep(remaining.min(Duration::from_millis(10)));
    }
    slot.last_cycle_ts.store(boundary.as_nanos(), Ordering::Release);
    slot.status.store(ProcessStatus::Busy as u32, Ordering::Release);
    Ok(boundary)
}

/// Report the cycle's work as finished.
pub fn cycle_done(view: &SegmentView, conn_id: u32) -> DbResult<()> {
    let idx = conn_id as usize - 1;
    if idx >= view.process_capacity() {
        return Err(DbError::NotConnected);
    }
    view.process_slot(idx)
        .status
        .store(ProcessStatus::CycleDone as u32, Ordering::Release);
    Ok(())
}

/// Liveness probe. ESRCH means the pid is gone; EPERM means it exists but
/// belongs to another user, which still counts as alive.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
