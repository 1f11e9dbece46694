//! # RTDB Core
//!
//! A process-shared, real-time object database in one shared-memory
//! segment. Cooperating OS processes insert flat byte-record objects,
//! commit cyclic updates into per-object history rings and read each
//! other's data lock-free, with torn reads detected rather than
//! prevented:
//!
//! - **Objects**: named, typed descriptors in a fixed metadata table,
//!   arranged in a parent tree
//! - **History**: per-object circular slot buffer sized from the
//!   object's retention interval and cycle time
//! - **Commit/read protocol**: writers publish a tagged commit marker
//!   last; readers re-check it after copying and retry on `HistWrap`
//! - **Wait/notify**: process-shared condvars (or a sleep-poll
//!   emulation) with absolute deadlines, robust against simulation-time
//!   jumps
//! - **Search**: filterable linear scans with blocking variants
//! - **Housekeeping**: purge of expired deletions, dead-process reaping,
//!   stats publication
//! - **Trace feed**: best-effort event fan-out to recorders
//!
//! ## Quick Start
//!
//! ```no_run
//! use rtdb_core::{ConnectOptions, Connection, ObjectSpec, Timestamp, TypeId};
//! use std::time::Duration;
//!
//! let conn = Connection::connect(&ConnectOptions::new("car1", "lidar_driver"))?;
//! let oid = conn.insert(
//!     &ObjectSpec::new("lidar_front", TypeId(100))
//!         .size_max(64)
//!         .history_interval(Duration::from_secs(1))
//!         .cycle(Duration::from_millis(100)),
//! )?;
//! conn.write(oid, &[0u8; 64], Timestamp::ZERO)?;
//! # Ok::<(), rtdb_core::DbError>(())
//! ```

pub mod alloc;
pub mod connection;
pub mod error;
pub mod history;
pub mod housekeeping;
pub mod object;
pub mod process;
pub mod record;
pub mod search;
pub mod shm;
pub mod sync;
pub mod table;
pub mod time;
pub mod trace;
pub mod wellknown;

pub use connection::{ConnectOptions, Connection, Tracer};
pub use error::{DbError, DbResult};
pub use history::{ReadMode, ReadResult, SlotCursor, TimeBase};
pub use object::{ObjectFlags, ObjectId, ObjectMeta, ObjectSpec, TypeId};
pub use process::{Caller, ProcessStatus, PROC_ADMIN, PROC_POLL};
pub use search::{SearchQuery, SetDiff};
pub use shm::{SegmentConfig, SegmentView};
pub use table::ChangeInfo;
pub use time::Timestamp;
pub use trace::{TraceEvent, TraceEventKind};
