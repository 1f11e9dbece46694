//! Linear, filterable scans over the metadata table, with blocking
//! wait-until-found and wait-until-changed variants on the global
//! metadata condvar.

use crate::error::{DbError, DbResult};
use crate::object::{ObjectId, TypeId};
use crate::shm::SegmentView;
use crate::sync::LockGuard;
use crate::time::Timestamp;
use regex::Regex;
use std::sync::atomic::Ordering;

/// Name selector, parsed from the query text.
#[derive(Debug, Clone)]
pub enum NamePattern {
    Exact(String),
    Regex(Regex),
    /// `(digits)` literal: match the object id itself.
    Oid(ObjectId),
}

/// AND-combined filter set. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub name: Option<NamePattern>,
    pub otype: TypeId,
    pub parent: ObjectId,
    pub owner: u32,
    /// Point in time the object must be alive at; 0 = now.
    pub ts: Timestamp,
}

impl SearchQuery {
    /// Parse the query text syntax: a leading `~` makes the rest an
    /// extended regex, `(digits)` selects by literal oid, a trailing
    /// `#digits` selects the type id, an empty name matches all.
    pub fn parse(text: &str) -> DbResult<SearchQuery> {
        let mut q = SearchQuery::default();
        let mut name = text;
        if let Some(pos) = name.rfind('#') {
            let (head, tail) = (&name[..pos], &name[pos + 1..]);
            let raw: u32 = tail
                .parse()
                .map_err(|_| DbError::Invalid(format!("bad type id suffix {tail:?}")))?;
            q.otype = TypeId(raw);
            name = head;
        }
        q.name = parse_name(name)?;
        Ok(q)
    }

    pub fn otype(mut self, otype: TypeId) -> Self {
        self.otype = otype;
        self
    }

    pub fn parent(mut self, parent: ObjectId) -> Self {
        self.parent = parent;
        self
    }

    pub fn owner(mut self, conn_id: u32) -> Self {
        self.owner = conn_id;
        self
    }

    pub fn at(mut self, ts: Timestamp) -> Self {
        self.ts = ts;
        self
    }
}

fn parse_name(name: &str) -> DbResult<Option<NamePattern>> {
    if name.is_empty() {
        return Ok(None);
    }
    if let Some(expr) = name.strip_prefix('~') {
        let re = Regex::new(expr)
            .map_err(|e| DbError::Invalid(format!("bad search regex {expr:?}: {e}")))?;
        return Ok(Some(NamePattern::Regex(re)));
    }
    if name.len() > 2 && name.starts_with('(') && name.ends_with(')') {
        let inner = &name[1..name.len() - 1];
        if inner.bytes().all(|b| b.is_ascii_digit()) {
            let raw: u32 = inner
                .parse()
                .map_err(|_| DbError::Invalid(format!("bad oid literal {name:?}")))?;
            return Ok(Some(NamePattern::Oid(ObjectId(raw))));
        }
    }
    Ok(Some(NamePattern::Exact(name.to_string())))
}

/// Run the scan with the metadata lock already held.
fn search_locked(
    view: &SegmentView,
    _guard: &LockGuard<'_>,
    query: &SearchQuery,
    limit: usize,
) -> DbResult<Vec<ObjectId>> {
    let ts = if query.ts.is_set() {
        query.ts
    } else {
        view.db_now()
    };

    // A missing parent is a malformed query, not an empty result.
    if !query.parent.is_none() {
        let alive = (0..view.object_capacity()).any(|idx| {
            let slot = view.object_slot(idx);
            if slot.oid.load(Ordering::Acquire) != query.parent.0 {
                return false;
            }
            unsafe { slot.meta() }.alive_at(ts)
        });
        if !alive {
            return Err(DbError::Invalid(format!(
                "search parent {} does not exist",
                query.parent.0
            )));
        }
    }

    let mut out = Vec::new();
    for idx in 0..view.object_capacity() {
        let slot = view.object_slot(idx);
        let oid = slot.oid.load(Ordering::Acquire);
        if oid == 0 {
            continue;
        }
        let meta = unsafe { slot.meta() };
        if !meta.alive_at(ts) {
            continue;
        }
        if query.otype != TypeId::ANY && meta.otype != query.otype {
            continue;
        }
        if !query.parent.is_none() && meta.parent != query.parent {
            continue;
        }
        if query.owner != 0 && slot.owner_conn.load(Ordering::Acquire) != query.owner {
            continue;
        }
        match &query.name {
            None => {}
            Some(NamePattern::Exact(s)) => {
                if meta.name_str() != s {
                    continue;
                }
            }
            Some(NamePattern::Regex(re)) => {
                if !re.is_match(meta.name_str()) {
                    continue;
                }
            }
            Some(NamePattern::Oid(want)) => {
                if meta.oid != *want {
                    continue;
                }
            }
        }
        out.push(meta.oid);
        if out.len() >= limit {
            break;
        }
    }
    if out.is_empty() {
        return Err(DbError::NotFound);
    }
    Ok(out)
}

/// Collect up to `limit` matches. `NotFound` on an empty result,
/// `Invalid` when the queried parent does not exist.
pub fn search(view: &SegmentView, query: &SearchQuery, limit: usize) -> DbResult<Vec<ObjectId>> {
    let guard = view.header().meta_lock.lock();
    search_locked(view, &guard, query, limit)
}

/// The nth match (0-based) of the scan order.
pub fn search_nth(view: &SegmentView, query: &SearchQuery, nth: usize) -> DbResult<ObjectId> {
    let guard = view.header().meta_lock.lock();
    let found = search_locked(view, &guard, query, nth + 1)?;
    found.get(nth).copied().ok_or(DbError::NotFound)
}

/// Block until the query matches or `deadline` passes. Empty results and
/// still-missing parents both keep waiting; the parent may yet appear.
pub fn search_wait_until(
    view: &SegmentView,
    query: &SearchQuery,
    limit: usize,
    deadline: Timestamp,
) -> DbResult<Vec<ObjectId>> {
    let guard = view.header().meta_lock.lock();
    loop {
        match search_locked(view, &guard, query, limit) {
            Err(DbError::NotFound) | Err(DbError::Invalid(_)) => {}
            other => return other,
        }
        view.header()
            .meta_cond
            .wait_until(&guard, deadline, || view.db_now())?;
    }
}

/// Additions and removals of the matching set relative to a known list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetDiff {
    pub added: Vec<ObjectId>,
    pub removed: Vec<ObjectId>,
}

impl SetDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

fn diff_locked(
    view: &SegmentView,
    guard: &LockGuard<'_>,
    query: &SearchQuery,
    known: &[ObjectId],
    limit: usize,
) -> DbResult<SetDiff> {
    let current = match search_locked(view, guard, query, limit) {
        Ok(v) => v,
        Err(DbError::NotFound) => Vec::new(),
        Err(e) => return Err(e),
    };
    let added = current
        .iter()
        .filter(|oid| !known.contains(oid))
        .copied()
        .collect();
    let removed = known
        .iter()
        .filter(|oid| !current.contains(oid))
        .copied()
        .collect();
    Ok(SetDiff { added, removed })
}

/// One non-blocking diff pass: how the matching set differs from `known`.
pub fn search_diff(
    view: &SegmentView,
    query: &SearchQuery,
    known: &[ObjectId],
    limit: usize,
) -> DbResult<SetDiff> {
    let guard = view.header().meta_lock.lock();
    diff_locked(view, &guard, query, known, limit)
}

/// Block until the matching set differs from `known`, then apply the diff
/// to `known` and return it. `Timeout` once `deadline` passes.
pub fn search_wait_next(
    view: &SegmentView,
    query: &SearchQuery,
    known: &mut Vec<ObjectId>,
    limit: usize,
    deadline: Timestamp,
) -> DbResult<SetDiff> {
    let guard = view.header().meta_lock.lock();
    loop {
        let diff = diff_locked(view, &guard, query, known, limit)?;
        if !diff.is_empty() {
            known.retain(|oid| !diff.removed.contains(oid));
            known.extend_from_slice(&diff.added);
            return Ok(diff);
        }
        view.header()
            .meta_cond
            .wait_until(&guard, deadline, || view.db_now())?;
    }
}
