//! Heap arena allocator.
//!
//! One fixed-size arena inside the segment backs every object's history
//! ring. `alloc`/`free` speak arena-relative offsets, never pointers, so
//! the arena can be mapped at different addresses per process. All
//! allocator state (bins, block headers, stats) lives inside the arena
//! itself for the same reason.
//!
//! Two implementations behind one interface, selected at segment creation:
//! a segregated-fit free-list allocator with boundary-tag coalescing
//! (default), and a no-free bump allocator kept as a fallback.
//!
//! Calls are made under the global metadata lock; block metadata is plain
//! (non-atomic) words.

use crate::error::{DbError, DbResult};
use std::marker::PhantomData;

/// Which allocator manages the arena. Recorded in the segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AllocKind {
    FreeList = 0,
    Bump = 1,
}

impl AllocKind {
    pub fn from_raw(raw: u32) -> AllocKind {
        if raw == AllocKind::Bump as u32 {
            AllocKind::Bump
        } else {
            AllocKind::FreeList
        }
    }
}

/// Free/used heap accounting for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

const NBINS: usize = 26;
/// Block head/foot: u32 size, u32 flags.
const TAG_SIZE: usize = 8;
/// Smallest block: head + two freelist links + foot.
const MIN_BLOCK: u32 = 32;
const FLAG_FREE: u32 = 0;
const FLAG_USED: u32 = 1;

/// Arena state at heap offset 0.
#[repr(C)]
struct ArenaHeader {
    kind: u32,
    _pad: u32,
    total: u64,
    used: u64,
    bump: u64,
    bins: [u32; NBINS],
}

fn data_start() -> usize {
    (std::mem::size_of::<ArenaHeader>() + 15) & !15
}

/// Size class of a block: bin 0 holds 32..63, each further bin doubles.
fn class_of(size: u32) -> usize {
    debug_assert!(size >= MIN_BLOCK);
    (((31 - size.leading_zeros()) as usize).saturating_sub(5)).min(NBINS - 1)
}

fn align8(v: u32) -> u32 {
    (v + 7) & !7
}

/// Handle over the mapped arena. Cheap to construct from a `SegmentView`.
pub struct SharedHeap<'a> {
    base: *mut u8,
    len: usize,
    kind: AllocKind,
    _marker: PhantomData<&'a ()>,
}

impl<'a> SharedHeap<'a> {
    /// # Safety
    /// `base..base+len` must be the segment's heap region, valid for the
    /// lifetime `'a`, and callers must hold the metadata lock for any
    /// mutating call.
    pub unsafe fn from_raw(base: *mut u8, len: usize, kind: AllocKind) -> SharedHeap<'a> {
        SharedHeap {
            base,
            len,
            kind,
            _marker: PhantomData,
        }
    }

    fn hdr(&self) -> &mut ArenaHeader {
        unsafe { &mut *(self.base as *mut ArenaHeader) }
    }

    fn get_u32(&self, off: usize) -> u32 {
        debug_assert!(off + 4 <= self.len);
        unsafe { *(self.base.add(off) as *const u32) }
    }

    fn set_u32(&self, off: usize, v: u32) {
        debug_assert!(off + 4 <= self.len);
        unsafe { *(self.base.add(off) as *mut u32) = v }
    }

    /// Initialize a fresh (zeroed) arena. Called once by the creator.
    pub fn init(&self) {
        let hdr = self.hdr();
        hdr.kind = self.kind as u32;
        hdr.total = (self.len - data_start()) as u64;
        hdr.used = 0;
        hdr.bump = 0;
        hdr.bins = [0; NBINS];
        if self.kind == AllocKind::FreeList {
            let size = (self.len - data_start()) as u32 & !7;
            if size >= MIN_BLOCK {
                self.write_tags(data_start() as u32, size, FLAG_FREE);
                self.bin_insert(data_start() as u32, size);
            }
        }
    }

    /// Allocate `size` payload bytes; returns the arena-relative offset.
    pub fn alloc(&self, size: u32) -> DbResult<u32> {
        if size == 0 {
            return Err(DbError::Invalid("zero-size heap allocation".into()));
        }
        match self.kind {
            AllocKind::FreeList => FreeListAllocator.alloc(self, size),
            AllocKind::Bump => BumpAllocator.alloc(self, size),
        }
    }

    /// Return a previously allocated range. `size` is the payload size the
    /// range was allocated with.
    pub fn free(&self, off: u32, size: u32) {
        match self.kind {
            AllocKind::FreeList => FreeListAllocator.free(self, off, size),
            AllocKind::Bump => BumpAllocator.free(self, off, size),
        }
    }

    pub fn stats(&self) -> HeapStats {
        let hdr = self.hdr();
        HeapStats {
            total: hdr.total,
            used: hdr.used,
            free: hdr.total - hdr.used,
        }
    }

    // --- free-list internals -------------------------------------------

    fn write_tags(&self, block: u32, size: u32, flags: u32) {
        self.set_u32(block as usize, size);
        self.set_u32(block as usize + 4, flags);
        let foot = block as usize + size as usize - TAG_SIZE;
        self.set_u32(foot, size);
        self.set_u32(foot + 4, flags);
    }

    fn bin_insert(&self, block: u32, size: u32) {
        let bin = class_of(size);
        let head = self.hdr().bins[bin];
        // links live in the free block's payload
        self.set_u32(block as usize + TAG_SIZE, head); // next
        self.set_u32(block as usize + TAG_SIZE + 4, 0); // prev
        if head != 0 {
            self.set_u32(head as usize + TAG_SIZE + 4, block);
        }
        self.hdr().bins[bin] = block;
    }

    fn bin_remove(&self, block: u32) {
        let size = self.get_u32(block as usize);
        let next = self.get_u32(block as usize + TAG_SIZE);
        let prev = self.get_u32(block as usize + TAG_SIZE + 4);
        if prev != 0 {
            self.set_u32(prev as usize + TAG_SIZE, next);
        } else {
            self.hdr().bins[class_of(size)] = next;
        }
        if next != 0 {
            self.set_u32(next as usize + TAG_SIZE + 4, prev);
        }
    }
}

/// The swappable allocation strategy interface.
pub trait ArenaAllocator {
    fn alloc(&self, heap: &SharedHeap<'_>, size: u32) -> DbResult<u32>;
    fn free(&self, heap: &SharedHeap<'_>, off: u32, size: u32);
}

/// Segregated-fit free lists with boundary tags: O(1) free with in-place
/// coalescing, bounded bin walk on alloc.
pub struct FreeListAllocator;

impl ArenaAllocator for FreeListAllocator {
    fn alloc(&self, heap: &SharedHeap<'_>, size: u32) -> DbResult<u32> {
        // widen before rounding: sizes near u32::MAX must not wrap
        let need = ((size.max(16) as u64 + 7) & !7) + 2 * TAG_SIZE as u64;
        let need = u32::try_from(need.max(MIN_BLOCK as u64)).map_err(|_| DbError::NoMemory)?;
        let mut found = 0u32;
        'bins: for bin in class_of(need)..NBINS {
            let mut cur = heap.hdr().bins[bin];
            while cur != 0 {
                let bsize = heap.get_u32(cur as usize);
                if bsize >= need {
                    found = cur;
                    break 'bins;
                }
                cur = heap.get_u32(cur as usize + TAG_SIZE);
            }
        }
        if found == 0 {
            return Err(DbError::NoMemory);
        }

        heap.bin_remove(found);
        let bsize = heap.get_u32(found as usize);
        let remainder = bsize - need;
        let take = if remainder >= MIN_BLOCK {
            let rest = found + need;
            heap.write_tags(rest, remainder, FLAG_FREE);
            heap.bin_insert(rest, remainder);
            need
        } else {
            bsize
        };
        heap.write_tags(found, take, FLAG_USED);
        heap.hdr().used += take as u64;
        Ok(found + TAG_SIZE as u32)
    }

    fn free(&self, heap: &SharedHeap<'_>, off: u32, size: u32) {
        let mut block = off - TAG_SIZE as u32;
        let mut bsize = heap.get_u32(block as usize);
        debug_assert_eq!(heap.get_u32(block as usize + 4), FLAG_USED);
        debug_assert!(bsize >= align8(size.max(16)));
        heap.hdr().used -= bsize as u64;

        // coalesce with the following block
        let next = block + bsize;
        if (next as usize) + TAG_SIZE <= heap.len
            && heap.get_u32(next as usize + 4) == FLAG_FREE
            && heap.get_u32(next as usize) != 0
        {
            heap.bin_remove(next);
            bsize += heap.get_u32(next as usize);
        }

        // coalesce with the preceding block via its footer
        if block as usize >= data_start() + MIN_BLOCK as usize {
            let foot = block as usize - TAG_SIZE;
            if heap.get_u32(foot + 4) == FLAG_FREE {
                let prev_size = heap.get_u32(foot);
                let prev = block - prev_size;
                heap.bin_remove(prev);
                block = prev;
                bsize += prev_size;
            }
        }

        heap.write_tags(block, bsize, FLAG_FREE);
        heap.bin_insert(block, bsize);
    }
}

/// No-free fallback: a single cursor that only moves forward. Kept for
/// platforms/debug runs where freelist corruption is suspected.
pub struct BumpAllocator;

impl ArenaAllocator for BumpAllocator {
    fn alloc(&self, heap: &SharedHeap<'_>, size: u32) -> DbResult<u32> {
        let need = (size.max(8) as u64 + 7) & !7;
        let hdr = heap.hdr();
        let off = data_start() as u64 + hdr.bump;
        if off + need > heap.len as u64 {
            return Err(DbError::NoMemory);
        }
        hdr.bump += need;
        hdr.used += need;
        Ok(off as u32)
    }

    fn free(&self, _heap: &SharedHeap<'_>, off: u32, _size: u32) {
        log::debug!("bump allocator: leaking freed range at {off}");
    }
}
