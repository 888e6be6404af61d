//! Shared, reference-counted cache of open database handles.
//!
//! A [`HandlePool`] hands out `Arc<RrdDatabase>` handles keyed by canonical
//! file path, so every caller that goes through the same pool shares one
//! in-memory view of each file. Each entry counts outstanding requests.
//! Releasing the last one keeps the file open and stamps the entry with a
//! release time; once the pool holds more entries than its capacity, idle
//! entries are closed oldest release first. Entries in use are never
//! evicted.
//!
//! All bookkeeping runs under one pool-wide mutex. Database I/O on the
//! returned handles does not touch that mutex.
//!
//! # Example
//!
//! ```rust,no_run
//! use rrdb::pool::{HandlePool, PoolConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = HandlePool::new(PoolConfig::default());
//! let db = pool.request("/var/lib/rrd/load.rrd")?;
//! db.update(1_700_000_000, &[0.42])?;
//! pool.release(&db)?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::database::{DbOptions, RrdDatabase};
use crate::definition::RrdDef;
use crate::error::{PoolError, Result};

/// Default number of entries kept before idle handles are evicted.
pub const DEFAULT_CAPACITY: usize = 50;

/// Pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Entry count above which idle handles are closed.
    pub capacity: usize,
    /// Options for every handle the pool opens.
    pub options: DbOptions,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            options: DbOptions::default(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    db: Arc<RrdDatabase>,
    usage: usize,
    released_at: Option<u64>,
}

#[derive(Debug, Default)]
struct PoolState {
    entries: HashMap<PathBuf, Entry>,
    /// Logical clock for release stamps.
    clock: u64,
}

impl PoolState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, path: PathBuf, db: RrdDatabase) -> Arc<RrdDatabase> {
        let db = Arc::new(db);
        self.entries.insert(
            path,
            Entry {
                db: Arc::clone(&db),
                usage: 1,
                released_at: None,
            },
        );
        db
    }

    /// Closes idle entries, oldest release first, while the pool is over
    /// `capacity`. Returns the evicted paths in eviction order.
    ///
    /// An evicted entry leaves the pool even if closing it fails; the
    /// failure is only logged.
    fn collect_garbage(&mut self, capacity: usize) -> Vec<PathBuf> {
        let mut evicted = Vec::new();
        while self.entries.len() > capacity {
            let oldest = self
                .entries
                .iter()
                .filter(|(_, entry)| entry.usage == 0)
                .filter_map(|(path, entry)| entry.released_at.map(|stamp| (stamp, path)))
                .min()
                .map(|(_, path)| path.clone());
            let Some(path) = oldest else {
                break;
            };
            if let Some(entry) = self.entries.remove(&path) {
                debug!(path = %path.display(), "evicting idle handle");
                if let Err(err) = entry.db.close() {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to close evicted handle"
                    );
                }
            }
            evicted.push(path);
        }
        evicted
    }
}

/// Reference-counted handle cache.
#[derive(Debug, Default)]
pub struct HandlePool {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl HandlePool {
    /// Creates an empty pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Entry count above which idle handles are closed.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Number of entries, idle or in use.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the pool holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outstanding requests for `path`, or `None` if it is not pooled.
    pub fn usage<P: AsRef<Path>>(&self, path: P) -> Option<usize> {
        let path = canonical_path(path.as_ref()).ok()?;
        self.state.lock().entries.get(&path).map(|entry| entry.usage)
    }

    /// Returns the pooled handle for an existing file, opening it if needed.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`RrdDatabase::open_with`] when the file is not
    /// pooled yet.
    pub fn request<P: AsRef<Path>>(&self, path: P) -> Result<Arc<RrdDatabase>> {
        let path = canonical_path(path.as_ref())?;
        let mut state = self.state.lock();

        if let Some(entry) = state.entries.get_mut(&path) {
            if !entry.db.is_closed() {
                entry.usage += 1;
                entry.released_at = None;
                debug!(path = %path.display(), usage = entry.usage, "pool hit");
                return Ok(Arc::clone(&entry.db));
            }
            state.entries.remove(&path);
        }

        debug!(path = %path.display(), "pool miss");
        let db = RrdDatabase::open_with(&path, self.config.options)?;
        let db = state.insert(path, db);
        state.collect_garbage(self.config.capacity);
        Ok(db)
    }

    /// Creates a database from `def` and pools it.
    ///
    /// An idle entry for the same path is closed and replaced.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::PathInUse`] if the path is pooled and in use,
    /// or the errors of [`RrdDatabase::create_with`].
    pub fn request_with_def(&self, def: &RrdDef) -> Result<Arc<RrdDatabase>> {
        def.validate()?;
        let path = canonical_path(&def.path)?;
        let mut def = def.clone();
        def.path.clone_from(&path);
        self.create_entry(path, |options| RrdDatabase::create_with(&def, options))
    }

    /// Creates a database at `path` from the XML dump at `xml_path` and
    /// pools it.
    ///
    /// An idle entry for the same path is closed and replaced.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::PathInUse`] if the path is pooled and in use,
    /// or the errors of [`RrdDatabase::import_xml_with`].
    pub fn request_from_dump<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        path: P,
        xml_path: Q,
    ) -> Result<Arc<RrdDatabase>> {
        let path = canonical_path(path.as_ref())?;
        let target = path.clone();
        self.create_entry(path, |options| {
            RrdDatabase::import_xml_with(&target, xml_path, options)
        })
    }

    fn create_entry<F>(&self, path: PathBuf, create: F) -> Result<Arc<RrdDatabase>>
    where
        F: FnOnce(DbOptions) -> Result<RrdDatabase>,
    {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(&path) {
            if entry.usage > 0 && !entry.db.is_closed() {
                return Err(PoolError::PathInUse {
                    path,
                    usage: entry.usage,
                }
                .into());
            }
            if let Some(stale) = state.entries.remove(&path) {
                debug!(path = %path.display(), "replacing idle handle");
                stale.db.close()?;
            }
        }

        let db = create(self.config.options)?;
        debug!(path = %path.display(), "pooled new database");
        let db = state.insert(path, db);
        state.collect_garbage(self.config.capacity);
        Ok(db)
    }

    /// Gives back one request for `db`.
    ///
    /// The handle stays open for reuse after its last release.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::UnknownHandle`] if `db` did not come from this
    /// pool, [`PoolError::HandleClosed`] if it was closed, or
    /// [`PoolError::NotInUse`] if it has no outstanding requests.
    pub fn release(&self, db: &Arc<RrdDatabase>) -> Result<()> {
        let path = db.path().to_path_buf();
        let mut state = self.state.lock();
        let stamp = state.tick();

        let Some(entry) = state
            .entries
            .get_mut(&path)
            .filter(|entry| Arc::ptr_eq(&entry.db, db))
        else {
            return Err(PoolError::UnknownHandle { path }.into());
        };
        if entry.db.is_closed() {
            return Err(PoolError::HandleClosed { path }.into());
        }
        if entry.usage == 0 {
            return Err(PoolError::NotInUse { path }.into());
        }

        entry.usage -= 1;
        if entry.usage == 0 {
            entry.released_at = Some(stamp);
            debug!(path = %path.display(), "handle idle");
        }
        state.collect_garbage(self.config.capacity);
        Ok(())
    }

    /// Closes every pooled handle and empties the pool.
    ///
    /// # Errors
    ///
    /// Returns the first close error; every handle is closed regardless.
    pub fn reset(&self) -> Result<()> {
        let entries: Vec<Entry> = {
            let mut state = self.state.lock();
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        debug!(count = entries.len(), "resetting pool");

        let mut first_error = None;
        for entry in entries {
            if let Err(err) = entry.db.close() {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Resolves `path` to an absolute, symlink-free key. A missing file is
/// keyed by its canonical parent directory plus its file name.
fn canonical_path(path: &Path) -> Result<PathBuf> {
    match fs::canonicalize(path) {
        Ok(path) => Ok(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let name = path.file_name().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("'{}' has no file name", path.display()),
                )
            })?;
            let parent = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            Ok(fs::canonicalize(parent)?.join(name))
        }
        Err(err) => Err(err.into()),
    }
}
