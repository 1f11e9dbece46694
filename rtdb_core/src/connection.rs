//! Per-process database handle: attaches to a named segment, registers in
//! the process table and carries the caller identity through every
//! operation. Dropping the handle deregisters the process and releases
//! everything it owned.

use crate::error::{DbError, DbResult};
use crate::history::{self, ReadMode, ReadResult, SlotCursor, TimeBase, WriteGuard};
use crate::housekeeping::Housekeeper;
use crate::object::{ObjectId, ObjectMeta, ObjectSpec};
use crate::process::{self, Caller, ProcessStatus, PROC_ADMIN, PROC_POLL};
use crate::search::{self, SearchQuery, SetDiff};
use crate::shm::{segment_path, SegmentView};
use crate::table::{self, ChangeInfo};
use crate::time::Timestamp;
use crate::trace::{self, TraceEvent};
use crate::wellknown;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How long `connect` waits for the manager to mark the segment ready.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters for attaching to a database segment.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Segment name, usually derived from a host identifier.
    pub db_name: String,
    /// This process's name in the process table.
    pub process_name: String,
    /// Declared cycle time for the liveness protocol.
    pub cycle: Duration,
    /// `PROC_ADMIN` and/or `PROC_POLL`.
    pub flags: u32,
    /// Override the segment directory, mainly for tests.
    pub base_dir: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl ConnectOptions {
    pub fn new(db_name: &str, process_name: &str) -> ConnectOptions {
        ConnectOptions {
            db_name: db_name.to_string(),
            process_name: process_name.to_string(),
            cycle: Duration::from_millis(100),
            flags: 0,
            base_dir: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn cycle(mut self, cycle: Duration) -> Self {
        self.cycle = cycle;
        self
    }

    pub fn admin(mut self) -> Self {
        self.flags |= PROC_ADMIN;
        self
    }

    pub fn poll_mode(mut self) -> Self {
        self.flags |= PROC_POLL;
        self
    }

    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub fn connect_timeout(mut self, t: Duration) -> Self {
        self.connect_timeout = t;
        self
    }
}

/// An attached, registered database handle.
pub struct Connection {
    view: Arc<SegmentView>,
    caller: Caller,
    poll: bool,
    /// oid -> table slot index; entries self-validate because oids are
    /// never reused while the segment lives.
    slot_cache: Mutex<HashMap<u32, usize>>,
}

impl Connection {
    /// Map the named segment, wait for readiness and register.
    pub fn connect(opts: &ConnectOptions) -> DbResult<Connection> {
        let path = segment_path(opts.base_dir.as_deref(), &opts.db_name);
        let deadline = crate::time::wall_now().add(opts.connect_timeout);
        let view = SegmentView::open(&path, deadline)?;
        Self::register_on(Arc::new(view), opts)
    }

    /// Register on an already-mapped segment. The manager uses this on
    /// the view it just created.
    pub fn register_on(view: Arc<SegmentView>, opts: &ConnectOptions) -> DbResult<Connection> {
        let conn_id = process::register(
            &view,
            &opts.process_name,
            std::process::id(),
            opts.cycle,
            opts.flags,
        )?;
        Ok(Connection {
            view,
            caller: Caller {
                conn_id,
                admin: opts.flags & PROC_ADMIN != 0,
            },
            poll: opts.flags & PROC_POLL != 0,
            slot_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn conn_id(&self) -> u32 {
        self.caller.conn_id
    }

    pub fn is_admin(&self) -> bool {
        self.caller.admin
    }

    pub fn view(&self) -> &SegmentView {
        &self.view
    }

    /// Current database time: simulation time when set, wall time else.
    pub fn now(&self) -> Timestamp {
        self.view.db_now()
    }

    fn resolve(&self, oid: ObjectId) -> DbResult<usize> {
        let mut cache = self
            .slot_cache
            .lock()
            .map_err(|_| DbError::Internal("slot cache poisoned".into()))?;
        if let Some(&idx) = cache.get(&oid.0) {
            let slot = self.view.object_slot(idx);
            if slot.oid.load(std::sync::atomic::Ordering::Acquire) == oid.0 {
                return Ok(idx);
            }
            cache.remove(&oid.0);
        }
        let idx = table::slot_index_of(&self.view, oid).ok_or(DbError::NotFound)?;
        cache.insert(oid.0, idx);
        Ok(idx)
    }

    // ----- metadata -----

    pub fn insert(&self, spec: &ObjectSpec) -> DbResult<ObjectId> {
        if wellknown::is_reserved(&spec.name) && !self.caller.admin {
            return Err(DbError::NoPerm);
        }
        table::insert(&self.view, self.caller, spec)
    }

    pub fn delete(&self, oid: ObjectId) -> DbResult<()> {
        table::delete(&self.view, self.caller, oid)
    }

    /// Metadata snapshot valid at `ts` (0 = now).
    pub fn read_info(&self, oid: ObjectId, ts: Timestamp) -> DbResult<ObjectMeta> {
        table::read_info(&self.view, oid, ts)
    }

    pub fn change_info(&self, oid: ObjectId, change: &ChangeInfo) -> DbResult<()> {
        table::change_info(&self.view, self.caller, oid, change)
    }

    // ----- data -----

    pub fn write(&self, oid: ObjectId, payload: &[u8], data_ts: Timestamp) -> DbResult<Timestamp> {
        let idx = self.resolve(oid)?;
        history::write(&self.view, self.caller, idx, oid, payload, data_ts)
    }

    /// Two-phase in-place write; owner-exclusive objects only.
    pub fn write_begin(&self, oid: ObjectId) -> DbResult<WriteGuard<'_>> {
        let idx = self.resolve(oid)?;
        history::write_begin(&self.view, self.caller, idx, oid)
    }

    pub fn read(
        &self,
        oid: ObjectId,
        ts: Timestamp,
        mode: ReadMode,
        base: TimeBase,
        buf: &mut [u8],
    ) -> DbResult<ReadResult> {
        let idx = self.resolve(oid)?;
        history::read(&self.view, self.caller, idx, oid, ts, mode, base, buf)
    }

    pub fn read_latest(&self, oid: ObjectId, buf: &mut [u8]) -> DbResult<ReadResult> {
        self.read(
            oid,
            Timestamp::ZERO,
            ReadMode::LatestAtOrBefore,
            TimeBase::Commit,
            buf,
        )
    }

    /// Zero-copy read; the returned ref must be revalidated after use.
    pub fn read_ref(
        &self,
        oid: ObjectId,
        ts: Timestamp,
        mode: ReadMode,
        base: TimeBase,
    ) -> DbResult<history::SlotRef<'_>> {
        let idx = self.resolve(oid)?;
        history::read_ref(&self.view, self.caller, idx, oid, ts, mode, base)
    }

    /// Step a commit cursor by `step` and read that commit.
    pub fn read_slot(
        &self,
        cursor: &mut SlotCursor,
        step: i64,
        buf: &mut [u8],
    ) -> DbResult<ReadResult> {
        let idx = self.resolve(cursor.oid)?;
        history::read_slot(&self.view, self.caller, idx, cursor, step, buf)
    }

    /// Block until a commit newer than `old_ts` lands, then return it.
    pub fn wait_next(
        &self,
        oid: ObjectId,
        old_ts: Timestamp,
        deadline: Timestamp,
        buf: &mut [u8],
    ) -> DbResult<ReadResult> {
        let idx = self.resolve(oid)?;
        history::wait_next(
            &self.view,
            self.caller,
            idx,
            oid,
            old_ts,
            deadline,
            self.poll,
            buf,
        )
    }

    // ----- search -----

    pub fn search(&self, query: &SearchQuery, limit: usize) -> DbResult<Vec<ObjectId>> {
        search::search(&self.view, query, limit)
    }

    pub fn search_nth(&self, query: &SearchQuery, nth: usize) -> DbResult<ObjectId> {
        search::search_nth(&self.view, query, nth)
    }

    /// First match by name, the common lookup.
    pub fn find(&self, name: &str) -> DbResult<ObjectId> {
        search::search_nth(&self.view, &SearchQuery::parse(name)?, 0)
    }

    pub fn search_wait_until(
        &self,
        query: &SearchQuery,
        limit: usize,
        deadline: Timestamp,
    ) -> DbResult<Vec<ObjectId>> {
        search::search_wait_until(&self.view, query, limit, deadline)
    }

    pub fn search_diff(
        &self,
        query: &SearchQuery,
        known: &[ObjectId],
        limit: usize,
    ) -> DbResult<SetDiff> {
        search::search_diff(&self.view, query, known, limit)
    }

    pub fn search_wait_next(
        &self,
        query: &SearchQuery,
        known: &mut Vec<ObjectId>,
        limit: usize,
        deadline: Timestamp,
    ) -> DbResult<SetDiff> {
        search::search_wait_next(&self.view, query, known, limit, deadline)
    }

    // ----- liveness -----

    /// Block to the next declared cycle boundary, reporting BUSY.
    pub fn wait_next_cycle(&self) -> DbResult<Timestamp> {
        process::wait_next_cycle(&self.view, self.caller.conn_id)
    }

    pub fn cycle_done(&self) -> DbResult<()> {
        process::cycle_done(&self.view, self.caller.conn_id)
    }

    pub fn set_status(&self, status: ProcessStatus, msg: &str) {
        process::set_status(&self.view, self.caller.conn_id, status, msg);
    }

    // ----- privileged -----

    /// Housekeeper state for periodic maintenance passes. Admin only.
    pub fn housekeeper(&self) -> DbResult<Housekeeper> {
        if !self.caller.admin {
            return Err(DbError::NoPerm);
        }
        Ok(Housekeeper::new(self.caller))
    }

    /// Enter simulation time. Admin only; waiters re-check the clock.
    pub fn set_sim_time(&self, ts: Timestamp) -> DbResult<()> {
        if !self.caller.admin {
            return Err(DbError::NoPerm);
        }
        self.view.set_sim_time(ts);
        Ok(())
    }

    pub fn clear_sim_time(&self) -> DbResult<()> {
        if !self.caller.admin {
            return Err(DbError::NoPerm);
        }
        self.view.clear_sim_time();
        Ok(())
    }

    /// Claim a tracer ring and start consuming the event feed.
    pub fn start_trace(&self) -> DbResult<Tracer<'_>> {
        let ring = trace::claim(&self.view, self.caller.conn_id)?;
        Ok(Tracer {
            conn: self,
            ring,
            cursor: 0,
            released: false,
        })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace::release_owned(&self.view, self.caller.conn_id);
        process::deregister(&self.view, self.caller.conn_id);
    }
}

/// A claimed trace ring. Dropping it releases the ring.
pub struct Tracer<'a> {
    conn: &'a Connection,
    ring: usize,
    cursor: u64,
    released: bool,
}

impl Tracer<'_> {
    /// Next event, or `None` when the feed is drained.
    pub fn next_event(&mut self) -> DbResult<Option<TraceEvent>> {
        trace::next_event(&self.conn.view, self.ring, &mut self.cursor)
    }

    /// Events lost because this consumer lagged a full ring behind.
    pub fn dropped(&self) -> u64 {
        self.conn.view.tracer_ring(self.ring).dropped()
    }
}

impl Drop for Tracer<'_> {
    fn drop(&mut self) {
        if !self.released {
            trace::release(&self.conn.view, self.ring);
            self.released = true;
        }
    }
}
