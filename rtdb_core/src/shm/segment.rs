//! The shared segment: one mapped file holding the metadata table, the
//! process table, the tracer rings and the heap arena.
//!
//! Nothing in the segment ever stores a raw address; regions are located
//! by offsets recorded in the header, and the heap hands out arena-relative
//! offsets, so each process may map the segment at a different address.

use crate::alloc::{AllocKind, SharedHeap};
use crate::error::{DbError, DbResult};
use crate::process::ProcessSlot;
use crate::sync::{LockMode, SharedCondVar, SharedLock};
use crate::table::ObjectSlot;
use crate::time::{wall_now, Timestamp};
use crate::trace::TraceRing;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

/// Segment signature ("RTDBSEG1"). A mismatch on open is fatal for the
/// opener: shared-state integrity cannot be locally repaired.
pub const SEGMENT_MAGIC: u64 = u64::from_le_bytes(*b"RTDBSEG1");

/// Bumped on any layout-affecting change.
pub const SEGMENT_VERSION: u32 = 1;

const REGION_ALIGN: usize = 64;

/// Sizing and capability knobs fixed at segment creation.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    pub object_capacity: u32,
    pub process_capacity: u32,
    pub tracer_capacity: u32,
    pub heap_size: u64,
    pub lock_mode: LockMode,
    pub alloc_kind: AllocKind,
    /// Database-wide minimum grace period before a deleted object may be
    /// purged; each object's own history interval can extend it.
    pub min_grace: Duration,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        SegmentConfig {
            object_capacity: 1024,
            process_capacity: 64,
            tracer_capacity: 4,
            heap_size: 64 * 1024 * 1024,
            lock_mode: LockMode::Native,
            alloc_kind: AllocKind::FreeList,
            min_grace: Duration::from_secs(1),
        }
    }
}

/// Segment header at offset 0. Plain fields are written once by the
/// creator before `ready` is published and are read-only afterwards.
#[repr(C, align(64))]
pub struct SegmentHeader {
    pub magic: u64,
    pub version: u32,
    pub lock_mode: u32,
    pub alloc_kind: u32,
    pub object_capacity: u32,
    pub process_capacity: u32,
    pub tracer_capacity: u32,
    pub process_table_off: u64,
    pub object_table_off: u64,
    pub tracer_table_off: u64,
    pub heap_off: u64,
    pub heap_size: u64,
    pub min_grace_ns: i64,
    /// Next oid to assign; oids start at 1 and are never reused.
    pub next_oid: AtomicU32,
    /// Set by the manager once tables, locks and well-known objects exist.
    pub ready: AtomicU32,
    /// Simulation/playback time; 0 = follow the wall clock.
    pub sim_time_ns: AtomicI64,
    /// Global metadata lock: insert/delete/search/changeinfo, O(table) only.
    pub meta_lock: SharedLock,
    /// Signaled on any metadata change; search waiters block here.
    pub meta_cond: SharedCondVar,
}

/// The raw file mapping.
#[derive(Debug)]
pub struct ShmSegment {
    mmap: MmapMut,
    path: PathBuf,
    owner: bool,
}

impl ShmSegment {
    /// Create a new zero-filled segment file of `size` bytes.
    pub fn create(path: &Path, size: usize) -> DbResult<ShmSegment> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size as u64)?;
        let mut mmap = unsafe { memmap2::MmapOptions::new().len(size).map_mut(&file)? };
        mmap.fill(0);
        Ok(ShmSegment {
            mmap,
            path: path.to_path_buf(),
            owner: true,
        })
    }

    /// Map an existing segment file at its current size.
    pub fn open(path: &Path) -> DbResult<ShmSegment> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len() as usize;
        if size < std::mem::size_of::<SegmentHeader>() {
            return Err(DbError::Corrupt(format!(
                "segment file too small: {size} bytes"
            )));
        }
        let mmap = unsafe { memmap2::MmapOptions::new().len(size).map_mut(&file)? };
        Ok(ShmSegment {
            mmap,
            path: path.to_path_buf(),
            owner: false,
        })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    fn base(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }
}

unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

struct Layout {
    process_table_off: usize,
    object_table_off: usize,
    tracer_table_off: usize,
    heap_off: usize,
    total: usize,
}

fn compute_layout(cfg: &SegmentConfig) -> Layout {
    let mut off = align_up(std::mem::size_of::<SegmentHeader>(), REGION_ALIGN);
    let process_table_off = off;
    off += cfg.process_capacity as usize * std::mem::size_of::<ProcessSlot>();
    off = align_up(off, REGION_ALIGN);
    let object_table_off = off;
    off += cfg.object_capacity as usize * std::mem::size_of::<ObjectSlot>();
    off = align_up(off, REGION_ALIGN);
    let tracer_table_off = off;
    off += cfg.tracer_capacity as usize * std::mem::size_of::<TraceRing>();
    off = align_up(off, REGION_ALIGN);
    let heap_off = off;
    off += cfg.heap_size as usize;
    Layout {
        process_table_off,
        object_table_off,
        tracer_table_off,
        heap_off,
        total: off,
    }
}

/// A process's view over the segment: typed, bounds-checked accessors
/// resolving header offsets against this mapping's base address.
#[derive(Debug)]
pub struct SegmentView {
    seg: ShmSegment,
}

unsafe impl Send for SegmentView {}
unsafe impl Sync for SegmentView {}

impl SegmentView {
    /// Create and initialize a fresh segment. The returned view is not yet
    /// marked ready; the manager inserts the well-known objects first and
    /// then calls [`SegmentView::mark_ready`].
    pub fn create(path: &Path, cfg: &SegmentConfig) -> DbResult<SegmentView> {
        if cfg.object_capacity == 0 || cfg.process_capacity == 0 {
            return Err(DbError::Invalid("capacities must be non-zero".into()));
        }
        let layout = compute_layout(cfg);
        let seg = ShmSegment::create(path, layout.total)?;
        let view = SegmentView { seg };

        {
            let hdr = view.header_mut();
            hdr.version = SEGMENT_VERSION;
            hdr.lock_mode = cfg.lock_mode as u32;
            hdr.alloc_kind = cfg.alloc_kind as u32;
            hdr.object_capacity = cfg.object_capacity;
            hdr.process_capacity = cfg.process_capacity;
            hdr.tracer_capacity = cfg.tracer_capacity;
            hdr.process_table_off = layout.process_table_off as u64;
            hdr.object_table_off = layout.object_table_off as u64;
            hdr.tracer_table_off = layout.tracer_table_off as u64;
            hdr.heap_off = layout.heap_off as u64;
            hdr.heap_size = cfg.heap_size;
            hdr.min_grace_ns = cfg.min_grace.as_nanos() as i64;
            hdr.next_oid.store(1, Ordering::Relaxed);
            hdr.ready.store(0, Ordering::Relaxed);
            hdr.sim_time_ns.store(0, Ordering::Relaxed);
            unsafe {
                hdr.meta_lock.init(cfg.lock_mode)?;
                hdr.meta_cond.init(cfg.lock_mode)?;
            }
        }

        for i in 0..cfg.object_capacity as usize {
            unsafe { view.object_slot(i).init(cfg.lock_mode)? };
        }
        view.heap().init();

        // Magic last: an opener that sees it can trust the layout fields.
        view.header_mut().magic = SEGMENT_MAGIC;
        log::info!(
            "created segment {} ({} bytes, {} object slots, {} process slots)",
            path.display(),
            layout.total,
            cfg.object_capacity,
            cfg.process_capacity
        );
        Ok(view)
    }

    /// Map an existing segment and wait (until `deadline`) for the manager
    /// to mark it ready.
    pub fn open(path: &Path, deadline: Timestamp) -> DbResult<SegmentView> {
        let seg = ShmSegment::open(path)?;
        let view = SegmentView { seg };
        {
            let hdr = view.header();
            if hdr.magic != SEGMENT_MAGIC {
                return Err(DbError::Corrupt(format!(
                    "bad segment signature {:#x}",
                    hdr.magic
                )));
            }
            if hdr.version != SEGMENT_VERSION {
                return Err(DbError::Corrupt(format!(
                    "segment layout version {} != {}",
                    hdr.version, SEGMENT_VERSION
                )));
            }
            let need = hdr.heap_off + hdr.heap_size;
            if need > view.seg.len() as u64 {
                return Err(DbError::Corrupt("segment shorter than its layout".into()));
            }
        }
        while view.header().ready.load(Ordering::Acquire) == 0 {
            if wall_now() >= deadline {
                return Err(DbError::Timeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(view)
    }

    pub fn mark_ready(&self) {
        self.header().ready.store(1, Ordering::Release);
    }

    fn base(&self) -> *mut u8 {
        self.seg.base()
    }

    pub fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.base() as *const SegmentHeader) }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut SegmentHeader {
        // Only used during creation, before the segment is shared.
        unsafe { &mut *(self.base() as *mut SegmentHeader) }
    }

    pub fn lock_mode(&self) -> LockMode {
        LockMode::from_raw(self.header().lock_mode).unwrap_or(LockMode::Emulated)
    }

    pub fn object_capacity(&self) -> usize {
        self.header().object_capacity as usize
    }

    pub fn process_capacity(&self) -> usize {
        self.header().process_capacity as usize
    }

    pub fn tracer_capacity(&self) -> usize {
        self.header().tracer_capacity as usize
    }

    pub fn object_slot(&self, idx: usize) -> &ObjectSlot {
        assert!(idx < self.object_capacity(), "object slot {idx} out of range");
        unsafe {
            let p = self
                .base()
                .add(self.header().object_table_off as usize)
                .add(idx * std::mem::size_of::<ObjectSlot>());
            &*(p as *const ObjectSlot)
        }
    }

    pub fn process_slot(&self, idx: usize) -> &ProcessSlot {
        assert!(idx < self.process_capacity(), "process slot {idx} out of range");
        unsafe {
            let p = self
                .base()
                .add(self.header().process_table_off as usize)
                .add(idx * std::mem::size_of::<ProcessSlot>());
            &*(p as *const ProcessSlot)
        }
    }

    pub fn tracer_ring(&self, idx: usize) -> &TraceRing {
        assert!(idx < self.tracer_capacity(), "tracer ring {idx} out of range");
        unsafe {
            let p = self
                .base()
                .add(self.header().tracer_table_off as usize)
                .add(idx * std::mem::size_of::<TraceRing>());
            &*(p as *const TraceRing)
        }
    }

    /// Heap arena handle.
    pub fn heap(&self) -> SharedHeap<'_> {
        let hdr = self.header();
        unsafe {
            SharedHeap::from_raw(
                self.base().add(hdr.heap_off as usize),
                hdr.heap_size as usize,
                AllocKind::from_raw(hdr.alloc_kind),
            )
        }
    }

    /// Resolve an arena-relative offset to a pointer, bounds-checked
    /// against the heap region.
    pub fn heap_ptr(&self, off: u32, len: usize) -> DbResult<*mut u8> {
        let hdr = self.header();
        let end = off as u64 + len as u64;
        if off == 0 || end > hdr.heap_size {
            return Err(DbError::Corrupt(format!(
                "heap range {off}+{len} outside arena of {} bytes",
                hdr.heap_size
            )));
        }
        Ok(unsafe { self.base().add(hdr.heap_off as usize + off as usize) })
    }

    /// Database time: the simulation cell when set, else the wall clock.
    pub fn db_now(&self) -> Timestamp {
        let sim = self.header().sim_time_ns.load(Ordering::Relaxed);
        if sim != 0 {
            Timestamp(sim)
        } else {
            wall_now()
        }
    }

    /// Enter/advance simulation time (player/playback control).
    pub fn set_sim_time(&self, ts: Timestamp) {
        self.header().sim_time_ns.store(ts.as_nanos(), Ordering::Relaxed);
    }

    /// Leave simulation mode.
    pub fn clear_sim_time(&self) {
        self.header().sim_time_ns.store(0, Ordering::Relaxed);
    }

    pub fn min_grace_ns(&self) -> i64 {
        self.header().min_grace_ns
    }

    /// Assign the next monotonic oid. Never reused within a segment's
    /// lifetime; wraparound is not handled.
    pub fn next_oid(&self) -> crate::object::ObjectId {
        crate::object::ObjectId(self.header().next_oid.fetch_add(1, Ordering::Relaxed))
    }
}
