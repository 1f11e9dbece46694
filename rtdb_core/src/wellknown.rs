//! Reserved object names, type ids and their flat record layouts. These
//! are fixed: recordings and foreign tools address them by name and type.

use crate::object::{ObjectFlags, ObjectSpec, TypeId, MIN_RECORD_SIZE};
use bytemuck::{Pod, Zeroable};
use std::time::Duration;

pub const NAME_RTDB: &str = "rtdb";
pub const NAME_PROCESSES: &str = "processes";
pub const NAME_PLAYER_CTRL: &str = "playerctrl";
pub const NAME_PLAYER_STAT: &str = "playerstat";
pub const NAME_RECORDER_STAT: &str = "recorderstat";

pub const TYPE_RTDB: TypeId = TypeId(0x0000_0001);
pub const TYPE_PROCESS_LIST: TypeId = TypeId(0x0000_0002);
pub const TYPE_PROCESS: TypeId = TypeId(0x0000_0003);
pub const TYPE_PLAYER_CTRL: TypeId = TypeId(0x0000_0004);
pub const TYPE_PLAYER_STAT: TypeId = TypeId(0x0000_0005);
pub const TYPE_RECORDER_STAT: TypeId = TypeId(0x0000_0006);

/// Names no ordinary caller may claim.
pub const RESERVED_NAMES: [&str; 5] = [
    NAME_RTDB,
    NAME_PROCESSES,
    NAME_PLAYER_CTRL,
    NAME_PLAYER_STAT,
    NAME_RECORDER_STAT,
];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// Introspection record committed to the "rtdb" object by the
/// housekeeper each pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DbInfo {
    pub heap_total: u64,
    pub heap_used: u64,
    pub heap_free: u64,
    pub objects_total: u32,
    pub objects_used: u32,
    pub processes_total: u32,
    pub processes_used: u32,
    /// Highest oid handed out so far.
    pub oid_high_water: u32,
    /// Slots reclaimed by purge passes since segment creation.
    pub purged_total: u32,
}

/// Spec for the database-info object the manager inserts at startup.
pub fn db_info_spec() -> ObjectSpec {
    ObjectSpec::new(NAME_RTDB, TYPE_RTDB)
        .size_max(std::mem::size_of::<DbInfo>() as u32)
        .history_interval(Duration::from_secs(10))
        .cycle(Duration::from_secs(1))
        .flags(ObjectFlags::PERSISTENT | ObjectFlags::UNIQUE | ObjectFlags::NO_NOTIFY)
}

/// Spec for the process-list root object. Metadata-only: process state
/// itself lives in the process table, children hang off this node.
pub fn process_list_spec() -> ObjectSpec {
    ObjectSpec::new(NAME_PROCESSES, TYPE_PROCESS_LIST)
        .size_max(MIN_RECORD_SIZE)
        .history_interval(Duration::from_secs(1))
        .cycle(Duration::from_secs(1))
        .flags(ObjectFlags::PERSISTENT | ObjectFlags::UNIQUE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names_cover_wellknown() {
        assert!(is_reserved("rtdb"));
        assert!(is_reserved("recorderstat"));
        assert!(!is_reserved("my_sensor"));
    }

    #[test]
    fn db_info_layout_is_stable() {
        assert_eq!(std::mem::size_of::<DbInfo>(), 48);
    }
}
