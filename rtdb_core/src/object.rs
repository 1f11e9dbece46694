//! Object model: ids, flags, metadata records and insert specifications.
//!
//! `ObjectMeta` is a flat `#[repr(C)]` record that lives verbatim in the
//! shared segment and in recording containers, so its layout is part of
//! the wire contract: fields are ordered to be padding-free and the whole
//! struct is `bytemuck::Pod`.

use crate::error::{DbError, DbResult};
use crate::time::Timestamp;
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use std::fmt;
use std::time::Duration;

/// Longest object name, in bytes. Names are stored NUL-padded in a fixed
/// array; embedded NULs are rejected.
pub const MAX_NAME: usize = 31;

/// Smallest admissible non-zero `size_max`: one base record granule.
pub const MIN_RECORD_SIZE: u32 = 8;

/// Unique-while-alive object identifier. Monotonically assigned, never 0,
/// never reused while the segment lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Pod, Zeroable)]
#[repr(transparent)]
pub struct ObjectId(pub u32);

impl ObjectId {
    pub const NONE: ObjectId = ObjectId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0)
    }
}

/// Opaque 32-bit type tag; 0 is the search wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
#[repr(transparent)]
pub struct TypeId(pub u32);

impl TypeId {
    pub const ANY: TypeId = TypeId(0);
}

bitflags! {
    /// Per-object behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ObjectFlags: u32 {
        /// Non-owners may not read.
        const READ_DENY = 1 << 0;
        /// Processes other than the owner may write (takes the write lock).
        const WRITE_ALLOW = 1 << 1;
        /// Reject inserts of another active object with the same (name, type).
        const UNIQUE = 1 << 2;
        /// Enforce the minimum cycle time on commits (TOOFAST).
        const CYCLE_WATCH = 1 << 3;
        /// Object outlives its owning process (orphaned, not deleted).
        const PERSISTENT = 1 << 4;
        /// Delete this object when its parent is deleted.
        const PARENT_DELETE = 1 << 5;
        /// Never signal waiters; they fall back to sleep-polling.
        const NO_NOTIFY = 1 << 6;
        /// Delete reclaims the slot synchronously, skipping the grace period.
        const IMMEDIATELY_DELETE = 1 << 7;
        /// Keep the heap range after deletion for same-owner same-size reuse.
        const KEEP_ALLOC = 1 << 8;
        /// Reads fail TOOFAST instead of returning data older than max cycle.
        const WITHHOLD_STALE = 1 << 9;
    }
}

/// Flat object descriptor. Guarded by the global metadata lock except for
/// the mirrored hot-path fields kept as atomics in the table slot.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ObjectMeta {
    pub oid: ObjectId,
    pub otype: TypeId,
    pub parent: ObjectId,
    pub flags: u32,
    pub name: [u8; 32],
    pub created_ts: i64,
    /// Connection id of the creator; 0 once the owner is gone (orphaned).
    pub created_conn: u32,
    pub deleted_conn: u32,
    pub deleted_ts: i64,
    /// Payload capacity per history slot; 0 = metadata-only object.
    pub size_max: u32,
    /// Ring capacity derived from interval and cycle time at insert.
    pub history_size: u32,
    pub history_interval_ns: i64,
    pub min_cycle_ns: i64,
    pub max_cycle_ns: i64,
    /// Heap offset of the ring, 0 = none.
    pub heap_off: u32,
    /// Bytes per ring slot (header + payload, 8-aligned).
    pub slot_stride: u32,
}

impl ObjectMeta {
    pub fn flags(&self) -> ObjectFlags {
        ObjectFlags::from_bits_truncate(self.flags)
    }

    pub fn name_str(&self) -> &str {
        unpack_name(&self.name)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_ts != 0
    }

    /// Total heap bytes owned by this object.
    pub fn heap_len(&self) -> u32 {
        self.history_size * self.slot_stride
    }

    /// Alive at `ts` (0 = alive now).
    pub fn alive_at(&self, ts: Timestamp) -> bool {
        if self.oid.is_none() {
            return false;
        }
        if !ts.is_set() {
            return !self.is_deleted();
        }
        self.created_ts <= ts.as_nanos() && (!self.is_deleted() || self.deleted_ts > ts.as_nanos())
    }
}

/// Insert request. Built by the caller, validated and completed by the
/// table (oid assignment, history geometry, heap placement).
#[derive(Debug, Clone)]
pub struct ObjectSpec {
    pub name: String,
    pub otype: TypeId,
    pub parent: ObjectId,
    pub size_max: u32,
    pub history_interval: Duration,
    pub min_cycle: Duration,
    pub max_cycle: Duration,
    pub flags: ObjectFlags,
}

impl ObjectSpec {
    pub fn new(name: &str, otype: TypeId) -> ObjectSpec {
        ObjectSpec {
            name: name.to_string(),
            otype,
            parent: ObjectId::NONE,
            size_max: 0,
            history_interval: Duration::from_secs(1),
            min_cycle: Duration::from_millis(100),
            max_cycle: Duration::ZERO,
            flags: ObjectFlags::empty(),
        }
    }

    pub fn parent(mut self, parent: ObjectId) -> Self {
        self.parent = parent;
        self
    }

    pub fn size_max(mut self, size: u32) -> Self {
        self.size_max = size;
        self
    }

    pub fn history_interval(mut self, interval: Duration) -> Self {
        self.history_interval = interval;
        self
    }

    pub fn cycle(mut self, min: Duration) -> Self {
        self.min_cycle = min;
        self
    }

    pub fn max_cycle(mut self, max: Duration) -> Self {
        self.max_cycle = max;
        self
    }

    pub fn flags(mut self, flags: ObjectFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Validate and derive the on-segment geometry.
    pub fn validate(&self) -> DbResult<SpecGeometry> {
        if self.name.is_empty() {
            return Err(DbError::Invalid("object name must not be empty".into()));
        }
        let name = pack_name(&self.name)?;
        if self.size_max != 0 && self.size_max < MIN_RECORD_SIZE {
            return Err(DbError::Invalid(format!(
                "size_max {} below base record size {}",
                self.size_max, MIN_RECORD_SIZE
            )));
        }
        let min_cycle_ns = self.min_cycle.as_nanos() as i64;
        let interval_ns = self.history_interval.as_nanos() as i64;
        if self.size_max != 0 && (min_cycle_ns <= 0 || interval_ns <= 0) {
            return Err(DbError::Invalid(
                "history interval and cycle time must be positive".into(),
            ));
        }
        let max_cycle_ns = if self.max_cycle.is_zero() {
            min_cycle_ns
        } else {
            self.max_cycle.as_nanos() as i64
        };
        let history_size = if self.size_max == 0 {
            0
        } else {
            let slots = history_slots(interval_ns, min_cycle_ns);
            u32::try_from(slots).map_err(|_| {
                DbError::Invalid(format!(
                    "interval/cycle ratio needs {slots} history slots"
                ))
            })?
        };
        let slot_stride = u32::try_from(slot_stride(self.size_max)).map_err(|_| {
            DbError::Invalid(format!(
                "size_max {} overflows the slot stride",
                self.size_max
            ))
        })?;
        Ok(SpecGeometry {
            name,
            history_size,
            slot_stride,
            min_cycle_ns,
            max_cycle_ns,
            interval_ns,
        })
    }
}

/// Derived geometry for one insert.
#[derive(Debug, Clone, Copy)]
pub struct SpecGeometry {
    pub name: [u8; 32],
    pub history_size: u32,
    pub slot_stride: u32,
    pub min_cycle_ns: i64,
    pub max_cycle_ns: i64,
    pub interval_ns: i64,
}

/// capacity = ceil(interval / cycle) + 1; the extra slot is the one a
/// writer may hold Pending while readers scan the rest. The count is
/// range-checked against u32 by [`ObjectSpec::validate`].
pub fn history_slots(interval_ns: i64, cycle_ns: i64) -> i64 {
    let n = interval_ns / cycle_ns + i64::from(interval_ns % cycle_ns != 0);
    n.max(1).saturating_add(1)
}

/// Bytes per ring slot: fixed slot header plus payload, 8-aligned. Wide
/// enough that no `size_max` can wrap it; range-checked at validation.
pub fn slot_stride(size_max: u32) -> u64 {
    if size_max == 0 {
        return 0;
    }
    (crate::history::SLOT_HEADER_SIZE as u64 + size_max as u64 + 7) & !7
}

pub fn pack_name(name: &str) -> DbResult<[u8; 32]> {
    let bytes = name.as_bytes();
    if bytes.len() > MAX_NAME {
        return Err(DbError::Invalid(format!(
            "name longer than {MAX_NAME} bytes: {name:?}"
        )));
    }
    if bytes.contains(&0) {
        return Err(DbError::Invalid("name contains NUL".into()));
    }
    let mut out = [0u8; 32];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

pub fn unpack_name(name: &[u8; 32]) -> &str {
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    std::str::from_utf8(&name[..end]).unwrap_or("")
}
