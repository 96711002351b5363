//! Reference-counted pool of open RRD file handles.
//!
//! Opening an RRD file is expensive (header parse, archive-header read,
//! possible memory mapping), yet the same file is frequently accessed by
//! several concurrent tasks: one updater thread and a handful of reader or
//! grapher threads. The pool amortises the open cost by holding handles
//! across request cycles, serving repeat requests from memory and reclaiming
//! handles lazily through a background collector.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      RrdDbPool (one monitor)                     │
//! │                                                                  │
//! │   table: FxHashMap<PathBuf, RrdEntry>     point lookup by key    │
//! │   idle:  VecDeque<PathBuf>                FIFO by release time   │
//! │   cond:  Condvar                          broadcast wake-ups     │
//! │                                                                  │
//! │   request(path) ──hit──▶ usage += 1, dequeue from idle           │
//! │                └─miss──▶ open via factory, insert LIVE(1)        │
//! │   release(&db) ────────▶ usage -= 1; at 0 enqueue idle tail      │
//! │                                                                  │
//! │   reclaimer thread: while table.len() >= capacity and idle       │
//! │   is non-empty, close the oldest idle entry                      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Per-entry state machine: `LIVE(n>0)` ⇄ `IDLE(0)`, and only `IDLE`
//! entries are reclaimed or replaced by a create request.
//!
//! ## Usage discipline
//!
//! Handles returned by the request methods stay owned by the pool. Callers
//! hold a lease: they must return it with [`RrdDbPool::release`] and must
//! not call `close` on it. The pool guarantees the handle stays open from
//! the request returning until the matching release.
//!
//! ```no_run
//! use rrdpool::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let pool = RrdDbPool::new();
//!     let db = pool.request("metrics/router1.rrd")?;
//!     // update or fetch through the handle...
//!     pool.release(&db)?;
//!     Ok(())
//! }
//! ```
//!
//! With `limited_capacity` enabled the capacity becomes a hard ceiling and
//! requests for unseen paths block until a release (or reclamation) makes
//! room. By default the pool is flexible: it may briefly exceed capacity and
//! relies on the collector to shrink back.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::backend::{self, RrdBackendFactory};
use crate::db::RrdDb;
use crate::def::RrdDef;
use crate::error::{PoolError, Result};
use crate::metrics::PoolStats;
use crate::path::canonical_path;

/// Maximum number of open handles that does not arm the collector.
pub const DEFAULT_CAPACITY: usize = 500;

/// Default for the hard-ceiling behaviour; the pool starts out flexible.
pub const DEFAULT_LIMITED_CAPACITY: bool = false;

const RECLAIMER_THREAD_NAME: &str = "rrdpool-reclaimer";

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

struct RrdEntry {
    db: RrdDb,
    usage_count: u32,
}

impl RrdEntry {
    fn new(db: RrdDb) -> Self {
        Self { db, usage_count: 1 }
    }

    fn dump(&self, canonical: &Path) -> String {
        format!("{} [{}]", canonical.display(), self.usage_count)
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

enum FactorySource {
    /// Resolve `backend::default_factory()` lazily on first open.
    Default,
    /// Use an injected factory, still gated on being file-based.
    Injected(Arc<dyn RrdBackendFactory>),
}

struct PoolState {
    table: FxHashMap<PathBuf, RrdEntry>,
    idle: VecDeque<PathBuf>,
    source: FactorySource,
    factory: Option<Arc<dyn RrdBackendFactory>>,
    capacity: usize,
    limited_capacity: bool,
    max_used_capacity: usize,
    hits: u64,
    requests: u64,
    stop: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

enum NewSpec<'a> {
    Xml(&'a Path),
    Def(&'a RrdDef),
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Thread-safe pool of open [`RrdDb`] handles, keyed by canonical path.
pub struct RrdDbPool {
    shared: Arc<PoolShared>,
    reclaimer: Mutex<Option<JoinHandle<()>>>,
}

impl RrdDbPool {
    /// Creates a pool that resolves the process default backend factory on
    /// first use. Starts the reclamation worker.
    pub fn new() -> Self {
        Self::from_source(FactorySource::Default)
    }

    /// Creates a pool using `factory` instead of the process default. The
    /// factory is still required to be file-based, checked on first open.
    pub fn with_factory(factory: Arc<dyn RrdBackendFactory>) -> Self {
        Self::from_source(FactorySource::Injected(factory))
    }

    /// Process-wide pool instance, constructed lazily on first access.
    ///
    /// Prefer an explicit pool value threaded through callers; this
    /// accessor exists for applications that want one shared pool for the
    /// whole process. The instance is never dropped, so its reclamation
    /// worker exits with the process.
    pub fn instance() -> &'static RrdDbPool {
        static INSTANCE: OnceLock<RrdDbPool> = OnceLock::new();
        INSTANCE.get_or_init(RrdDbPool::new)
    }

    fn from_source(source: FactorySource) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                table: FxHashMap::default(),
                idle: VecDeque::new(),
                source,
                factory: None,
                capacity: DEFAULT_CAPACITY,
                limited_capacity: DEFAULT_LIMITED_CAPACITY,
                max_used_capacity: 0,
                hits: 0,
                requests: 0,
                stop: false,
            }),
            cond: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(RECLAIMER_THREAD_NAME.into())
            .spawn(move || reclaim_loop(&worker_shared))
            .expect("failed to spawn rrdpool reclamation thread");
        Self {
            shared,
            reclaimer: Mutex::new(Some(handle)),
        }
    }

    // -- request / release --------------------------------------------------

    /// Returns a handle to an existing file.
    ///
    /// On a cache hit the entry's usage count is bumped and the already
    /// open handle is returned; otherwise the file is opened through the
    /// backend factory and inserted with usage count 1. Under
    /// `limited_capacity` a request for an unseen path blocks while the
    /// table is full and fails with [`PoolError::Interrupted`] if the pool
    /// shuts down while it waits.
    pub fn request(&self, path: impl AsRef<Path>) -> Result<RrdDb> {
        let path = path.as_ref();
        let mut state = self.shared.state.lock();
        state.requests += 1;
        let canonical = canonical_path(path)?;
        loop {
            let st = &mut *state;
            if st.stop {
                return Err(PoolError::Interrupted {
                    path: path.to_path_buf(),
                });
            }
            if let Some(entry) = st.table.get_mut(&canonical) {
                entry.usage_count += 1;
                if entry.usage_count == 1 {
                    // was idle until this request
                    remove_idle(&mut st.idle, &canonical);
                }
                st.hits += 1;
                debug!(path = %canonical.display(), usage = entry.usage_count, "pool hit");
                let db = entry.db.clone();
                self.shared.cond.notify_all();
                return Ok(db);
            }
            if !st.limited_capacity || st.table.len() < st.capacity {
                let factory = Self::factory(st)?;
                let db = RrdDb::open(path, factory.as_ref())?;
                Self::insert_entry(st, canonical, db.clone());
                self.shared.cond.notify_all();
                return Ok(db);
            }
            self.shared.cond.wait(&mut state);
        }
    }

    /// Returns a handle to a new file restored from an XML dump.
    ///
    /// An idle entry under the same canonical path is closed and replaced;
    /// a live one fails with [`PoolError::InUse`].
    pub fn request_import(
        &self,
        path: impl AsRef<Path>,
        xml_dump_path: impl AsRef<Path>,
    ) -> Result<RrdDb> {
        self.request_new(path.as_ref(), NewSpec::Xml(xml_dump_path.as_ref()))
    }

    /// Returns a handle to a new file created from a structured definition.
    ///
    /// An idle entry under the same canonical path is closed and replaced;
    /// a live one fails with [`PoolError::InUse`].
    pub fn request_create(&self, def: &RrdDef) -> Result<RrdDb> {
        self.request_new(def.path(), NewSpec::Def(def))
    }

    fn request_new(&self, path: &Path, spec: NewSpec<'_>) -> Result<RrdDb> {
        let mut state = self.shared.state.lock();
        state.requests += 1;
        let canonical = canonical_path(path)?;
        loop {
            let st = &mut *state;
            if st.stop {
                return Err(PoolError::Interrupted {
                    path: path.to_path_buf(),
                });
            }
            if let Some(entry) = st.table.get(&canonical) {
                if entry.usage_count > 0 {
                    return Err(PoolError::InUse { path: canonical });
                }
                // idle under the same key: safe to replace
                let removed = Self::remove_entry(st, &canonical);
                // the table shrank even when the close failed
                self.shared.cond.notify_all();
                removed?;
                continue;
            }
            if !st.limited_capacity || st.table.len() < st.capacity {
                let factory = Self::factory(st)?;
                let db = match spec {
                    NewSpec::Xml(xml) => RrdDb::import(path, xml, factory.as_ref())?,
                    NewSpec::Def(def) => RrdDb::create(def, factory.as_ref())?,
                };
                Self::insert_entry(st, canonical, db.clone());
                self.shared.cond.notify_all();
                return Ok(db);
            }
            self.shared.cond.wait(&mut state);
        }
    }

    /// Returns a lease obtained from a request method.
    ///
    /// The usage count drops by one; at zero the entry joins the idle-queue
    /// tail, eligible for reclamation. Releasing a handle the pool does not
    /// hold fails with [`PoolError::NotInPool`]; releasing one that was
    /// closed externally fails with [`PoolError::AlreadyClosed`]. An
    /// unmatched release of an already idle entry also fails with
    /// [`PoolError::NotInPool`].
    pub fn release(&self, db: &RrdDb) -> Result<()> {
        if db.is_closed() {
            return Err(PoolError::AlreadyClosed {
                path: db.path().to_path_buf(),
            });
        }
        let canonical = canonical_path(db.path())?;
        let mut state = self.shared.state.lock();
        let st = &mut *state;
        let Some(entry) = st.table.get_mut(&canonical) else {
            return Err(PoolError::NotInPool { path: canonical });
        };
        if entry.usage_count == 0 {
            // no outstanding lease to return
            return Err(PoolError::NotInPool { path: canonical });
        }
        entry.usage_count -= 1;
        debug!(path = %canonical.display(), usage = entry.usage_count, "released");
        if entry.usage_count == 0 {
            st.idle.push_back(canonical);
        }
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Closes every handle in the pool and clears the table and idle queue.
    ///
    /// Every close is attempted; the first failure is surfaced after the
    /// sweep completes. Counters are unchanged.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        let st = &mut *state;
        let mut first_err = None;
        for (canonical, entry) in st.table.drain() {
            if let Err(err) = entry.db.close() {
                warn!(path = %canonical.display(), error = %err, "close failed during reset");
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        st.idle.clear();
        self.shared.cond.notify_all();
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stops the reclamation worker and closes every pooled handle.
    ///
    /// Waiters blocked on admission fail with [`PoolError::Interrupted`].
    /// Called automatically (best-effort) when the pool is dropped.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.reclaimer.lock().take() {
            let _ = handle.join();
        }
        self.reset()
    }

    // -- configuration ------------------------------------------------------

    /// Maximum number of open handles that does not arm the collector.
    pub fn capacity(&self) -> usize {
        self.shared.state.lock().capacity
    }

    /// Changes the capacity threshold and wakes the collector so a lowered
    /// threshold takes effect promptly.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.shared.state.lock();
        state.capacity = capacity;
        self.shared.cond.notify_all();
    }

    /// Whether the capacity is a hard ceiling (requests block) rather than
    /// a soft threshold (collector shrinks later).
    pub fn limited_capacity(&self) -> bool {
        self.shared.state.lock().limited_capacity
    }

    pub fn set_limited_capacity(&self, limited: bool) {
        let mut state = self.shared.state.lock();
        state.limited_capacity = limited;
        self.shared.cond.notify_all();
    }

    // -- metrics & introspection --------------------------------------------

    /// Number of requests served from already open handles.
    pub fn hits(&self) -> u64 {
        self.shared.state.lock().hits
    }

    /// Total number of requests made against this pool.
    pub fn requests(&self) -> u64 {
        self.shared.state.lock().requests
    }

    /// Largest table size observed since construction.
    pub fn max_used_capacity(&self) -> usize {
        self.shared.state.lock().max_used_capacity
    }

    /// `hits / requests` rounded to three decimals; 1.0 when no request was
    /// ever made.
    pub fn efficiency(&self) -> f64 {
        let state = self.shared.state.lock();
        efficiency_of(state.hits, state.requests)
    }

    /// Snapshot of all counters and gauges, taken under the monitor.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            hits: state.hits,
            requests: state.requests,
            efficiency: efficiency_of(state.hits, state.requests),
            max_used_capacity: state.max_used_capacity,
            open: state.table.len(),
            idle: state.idle.len(),
            capacity: state.capacity,
            limited_capacity: state.limited_capacity,
        }
    }

    /// Canonical paths of all handles currently held, sorted.
    pub fn cached_paths(&self) -> Vec<PathBuf> {
        let state = self.shared.state.lock();
        let mut paths: Vec<PathBuf> = state.table.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Human-readable snapshot of the pool state, with the per-file usage
    /// list when `include_files` is set.
    pub fn dump(&self, include_files: bool) -> String {
        let state = self.shared.state.lock();
        let mut out = String::new();
        let _ = writeln!(out, "==== POOL DUMP ===========================");
        let _ = writeln!(out, "open={}, idle={}", state.table.len(), state.idle.len());
        let _ = writeln!(
            out,
            "capacity={}, max_used_capacity={}",
            state.capacity, state.max_used_capacity
        );
        let _ = writeln!(out, "hits={}, requests={}", state.hits, state.requests);
        let _ = writeln!(out, "efficiency={}", efficiency_of(state.hits, state.requests));
        if include_files {
            let _ = writeln!(out, "---- CACHED FILES ------------------------");
            for (canonical, entry) in &state.table {
                let _ = writeln!(out, "{}", entry.dump(canonical));
            }
        }
        out
    }

    // -- internals ----------------------------------------------------------

    /// Resolves the backend factory, lazily on first open. A factory that
    /// is not file-based is rejected and the slot stays unset, so a
    /// corrected default is picked up on a later request.
    fn factory(st: &mut PoolState) -> Result<Arc<dyn RrdBackendFactory>> {
        if let Some(factory) = &st.factory {
            return Ok(Arc::clone(factory));
        }
        let candidate = match &st.source {
            FactorySource::Default => backend::default_factory(),
            FactorySource::Injected(factory) => Arc::clone(factory),
        };
        if !candidate.is_file_based() {
            return Err(PoolError::UnsupportedBackend {
                name: candidate.name(),
            });
        }
        st.factory = Some(Arc::clone(&candidate));
        Ok(candidate)
    }

    fn insert_entry(st: &mut PoolState, canonical: PathBuf, db: RrdDb) {
        debug!(path = %canonical.display(), "added to pool");
        st.table.insert(canonical, RrdEntry::new(db));
        st.max_used_capacity = st.max_used_capacity.max(st.table.len());
    }

    /// Removes an entry from both structures and closes its handle.
    fn remove_entry(st: &mut PoolState, canonical: &Path) -> Result<()> {
        if let Some(entry) = st.table.remove(canonical) {
            remove_idle(&mut st.idle, canonical);
            debug!(path = %canonical.display(), "removed from pool");
            entry.db.close()?;
        }
        Ok(())
    }
}

impl Default for RrdDbPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RrdDbPool {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "pool shutdown during drop failed");
        }
    }
}

fn remove_idle(idle: &mut VecDeque<PathBuf>, canonical: &Path) {
    if let Some(pos) = idle.iter().position(|p| p.as_path() == canonical) {
        idle.remove(pos);
    }
}

fn efficiency_of(hits: u64, requests: u64) -> f64 {
    if requests == 0 {
        return 1.0;
    }
    let ratio = hits as f64 / requests as f64;
    (ratio * 1000.0).round() / 1000.0
}

/// Body of the reclamation worker.
///
/// Parked on the pool condition; whenever the table has grown to capacity
/// and idle entries exist, closes the oldest idle entry. Close failures are
/// reported and do not stop the loop. Exits when the stop flag is set.
fn reclaim_loop(shared: &PoolShared) {
    let mut state = shared.state.lock();
    loop {
        if state.stop {
            break;
        }
        let st = &mut *state;
        if st.table.len() >= st.capacity {
            if let Some(canonical) = st.idle.pop_front() {
                debug!(path = %canonical.display(), "reclaiming idle handle");
                if let Some(entry) = st.table.remove(&canonical) {
                    if let Err(err) = entry.db.close() {
                        warn!(path = %canonical.display(), error = %err, "failed to close reclaimed handle");
                    }
                }
                shared.cond.notify_all();
                continue;
            }
        }
        shared.cond.wait(&mut state);
    }
}
