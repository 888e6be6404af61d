//! The database handle: create, open, update, fetch.
//!
//! # Design
//!
//! A database is a header, then every datasource, then every archive, all
//! visited through the same [`Fields`] implementation for sizing, writing
//! and reading. The decoded object graph lives in memory; each successful
//! update changes it and then flushes only the mutable parts (last update
//! time, datasource state, archive accumulators, robin pointers and the
//! slots written) back to the slab.
//!
//! # Thread Safety
//!
//! [`RrdDatabase`] is `Send + Sync`. Every operation takes the handle's own
//! mutex, so updates through one handle never interleave. Two handles on
//! the same file are only kept apart by the advisory file lock selected in
//! [`DbOptions::lock_mode`].
//!
//! # Example
//!
//! ```rust,no_run
//! use rrdb::database::RrdDatabase;
//! use rrdb::definition::{ArcDef, ConsolFun, DsDef, DsType, RrdDef};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut def = RrdDef::new("/tmp/traffic.rrd", 300);
//! def.set_start_time(920_804_400);
//! def.add_datasource(DsDef::new("in", DsType::Counter, 600, Some(0.0), None)?);
//! def.add_archive(ArcDef::new(ConsolFun::Average, 0.5, 1, 288)?);
//!
//! let db = RrdDatabase::create(&def)?;
//! let mut sample = db.create_sample(920_804_700)?;
//! sample.set_value("in", 12_345.0)?;
//! sample.update()?;
//!
//! let data = db
//!     .create_fetch_request(ConsolFun::Average, 920_804_400, 920_805_000)?
//!     .fetch_data()?;
//! println!("{:?}", data.values("in")?);
//! db.close()?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::archive::{Archive, ArchiveInfo};
use crate::datasource::{DataSource, DsRef};
use crate::definition::{ConsolFun, RrdDef};
use crate::error::{FormatError, LookupError, Result, RrdError, ValidationError};
use crate::fetch::{FetchData, FetchRequest};
use crate::field::{Decoder, Encoder, FieldVisitor, Fields, encoded_size};
use crate::header::Header;
use crate::sample::Sample;
use crate::slab::{BackendKind, LockMode, Slab};

/// Storage options for one handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbOptions {
    /// How the file is accessed.
    pub backend: BackendKind,
    /// Advisory locking behavior.
    pub lock_mode: LockMode,
}

/// The decoded object graph of one file.
#[derive(Debug, Clone)]
pub(crate) struct Rrd {
    pub(crate) header: Header,
    pub(crate) datasources: Vec<DataSource>,
    pub(crate) archives: Vec<Archive>,
}

impl Rrd {
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn from_def(def: &RrdDef) -> Self {
        let ds_count = def.datasources.len();
        Self {
            header: Header::new(
                def.step,
                ds_count as u32,
                def.archives.len() as u32,
                def.start_time,
            ),
            datasources: def
                .datasources
                .iter()
                .map(|ds| DataSource::new(ds, def.start_time, def.step))
                .collect(),
            archives: def
                .archives
                .iter()
                .map(|arc| Archive::new(arc, ds_count, def.step, def.start_time))
                .collect(),
        }
    }

    fn empty() -> Self {
        Self {
            header: Header::empty(),
            datasources: Vec::new(),
            archives: Vec::new(),
        }
    }

    fn decode(slab: &mut Slab) -> Result<Self> {
        let path = slab.path().to_path_buf();
        let mut rrd = Self::empty();
        let mut decoder = Decoder::at(slab, 0);
        rrd.visit(&mut decoder)?;
        let trailing = decoder.remaining();
        if trailing > 0 {
            return Err(FormatError::TrailingBytes { path, trailing }.into());
        }
        Ok(rrd)
    }

    pub(crate) fn ds_names(&self) -> Vec<String> {
        self.datasources
            .iter()
            .map(|ds| ds.name().to_string())
            .collect()
    }

    pub(crate) fn to_def(&self, path: &Path) -> RrdDef {
        RrdDef {
            path: path.to_path_buf(),
            start_time: self.header.last_update_time(),
            step: self.header.step(),
            datasources: self.datasources.iter().map(DataSource::to_def).collect(),
            archives: self.archives.iter().map(Archive::to_def).collect(),
        }
    }

    fn update(&mut self, time: u64, values: &[f64]) -> Result<()> {
        if values.len() != self.datasources.len() {
            return Err(ValidationError::SampleWidth {
                expected: self.datasources.len(),
                found: values.len(),
            }
            .into());
        }
        let last_update = self.header.last_update_time();
        if time <= last_update {
            return Err(RrdError::TimestampOrder {
                timestamp: time,
                last_update,
            });
        }

        let step = self.header.step();
        for (index, (ds, &value)) in self.datasources.iter_mut().zip(values).enumerate() {
            let (pdp, steps) = ds.process(last_update, step, time, value);
            if steps > 0 {
                for archive in &mut self.archives {
                    archive.archive(index, pdp, steps, last_update);
                }
            }
        }
        self.header.set_last_update_time(time);
        Ok(())
    }

    fn flush(&mut self, slab: &mut Slab) -> Result<()> {
        self.header.flush(slab)?;
        for ds in &mut self.datasources {
            ds.flush(slab)?;
        }
        for archive in &mut self.archives {
            archive.flush(slab)?;
        }
        Ok(())
    }

    fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchData> {
        let names = self.ds_names();
        let indices: Vec<usize> = match request.filter() {
            Some(filter) => filter
                .iter()
                .map(|name| DsRef::from(name).resolve(&names))
                .collect::<Result<_>>()?,
            None => (0..names.len()).collect(),
        };

        let last_update = self.header.last_update_time();
        let index = find_matching_archive(
            &self.archives,
            request.consol_fun(),
            request.start(),
            request.end(),
            request.resolution(),
            last_update,
        )?;
        let archive = &self.archives[index];
        let (timestamps, columns) =
            archive.fetch(request.start(), request.end(), &indices, last_update)?;

        Ok(FetchData::new(
            archive.info(last_update),
            request.start(),
            request.end(),
            indices.iter().map(|&i| names[i].clone()).collect(),
            timestamps,
            columns,
        ))
    }
}

impl Fields for Rrd {
    #[allow(clippy::cast_possible_truncation)]
    fn visit<V: FieldVisitor>(&mut self, v: &mut V) -> Result<()> {
        self.header.visit(v)?;
        let ds_count = self.header.ds_count() as usize;
        let arc_count = self.header.arc_count() as usize;

        if self.datasources.len() != ds_count {
            v.expect_remaining(ds_count as u64 * DataSource::ENCODED_SIZE)?;
            self.datasources = (0..ds_count).map(|_| DataSource::empty()).collect();
        }
        for ds in &mut self.datasources {
            ds.visit(v)?;
        }

        if self.archives.len() != arc_count {
            v.expect_remaining(arc_count as u64 * Archive::min_encoded_size(ds_count))?;
            let step = self.header.step();
            self.archives = (0..arc_count)
                .map(|_| Archive::empty(ds_count, step))
                .collect();
        }
        for archive in &mut self.archives {
            archive.visit(v)?;
        }
        Ok(())
    }
}

/// Picks the archive that best serves a fetch.
///
/// Among archives with `consol_fun`, one whose coverage (extended by one
/// archive step at the old end) contains `[start, end]` always wins; ties
/// between full matches go to the archive step closest to `resolution`.
/// Without a full match, the archive with the largest overlap wins. Earlier
/// archives win ties.
///
/// # Errors
///
/// Returns [`RrdError::NoMatchingArchive`] if no archive uses `consol_fun`.
pub(crate) fn find_matching_archive(
    archives: &[Archive],
    consol_fun: ConsolFun,
    start: u64,
    end: u64,
    resolution: u64,
    last_update: u64,
) -> Result<usize> {
    let mut best_full: Option<(usize, u64)> = None;
    let mut best_partial: Option<(usize, i128)> = None;
    let span = i128::from(end) - i128::from(start);

    for (index, archive) in archives.iter().enumerate() {
        if archive.consol_fun() != consol_fun {
            continue;
        }
        let arc_step = archive.arc_step();
        let coverage = archive.coverage(last_update);
        let arc_start = coverage.start.saturating_sub(arc_step);
        let arc_end = coverage.end;

        if arc_start <= start && arc_end >= end {
            let distance = arc_step.abs_diff(resolution);
            if best_full.is_none_or(|(_, best)| distance < best) {
                best_full = Some((index, distance));
            }
        } else {
            let mut overlap = span;
            if arc_start > start {
                overlap -= i128::from(arc_start - start);
            }
            if arc_end < end {
                overlap -= i128::from(end - arc_end);
            }
            if best_partial.is_none_or(|(_, best)| overlap > best) {
                best_partial = Some((index, overlap));
            }
        }
    }

    best_full
        .map(|(index, _)| index)
        .or(best_partial.map(|(index, _)| index))
        .ok_or(RrdError::NoMatchingArchive { consol_fun })
}

/// The storage of an open handle.
#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) rrd: Rrd,
    pub(crate) slab: Slab,
}

/// A handle on one round-robin database file.
#[derive(Debug)]
pub struct RrdDatabase {
    path: PathBuf,
    options: DbOptions,
    inner: Mutex<Option<Inner>>,
}

impl RrdDatabase {
    /// Creates a new database file from a definition with default options.
    ///
    /// # Errors
    ///
    /// See [`create_with`](Self::create_with).
    pub fn create(def: &RrdDef) -> Result<Self> {
        Self::create_with(def, DbOptions::default())
    }

    /// Creates a new database file from a definition.
    ///
    /// An existing file at the path is overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] before touching the file if the
    /// definition is invalid, [`RrdError::LockContention`] in fail-fast mode
    /// if the file is locked, or an I/O error.
    pub fn create_with(def: &RrdDef, options: DbOptions) -> Result<Self> {
        def.validate()?;
        Self::create_from(&def.path, Rrd::from_def(def), options)
    }

    pub(crate) fn create_from(path: &Path, mut rrd: Rrd, options: DbOptions) -> Result<Self> {
        let size = encoded_size(&mut rrd)?;
        let mut slab = Slab::create(path, size, options.backend, options.lock_mode)?;
        rrd.visit(&mut Encoder::at(&mut slab, 0))?;
        slab.sync()?;
        debug!(
            path = %path.display(),
            size,
            datasources = rrd.datasources.len(),
            archives = rrd.archives.len(),
            "created database"
        );
        Ok(Self::from_parts(path, options, rrd, slab))
    }

    /// Opens an existing database file with default options.
    ///
    /// # Errors
    ///
    /// See [`open_with`](Self::open_with).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, DbOptions::default())
    }

    /// Opens an existing database file.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError`] if the file is not a database written by this
    /// crate (bad signature, truncated, trailing bytes, corrupt fields),
    /// [`RrdError::LockContention`] in fail-fast mode, or an I/O error.
    pub fn open_with<P: AsRef<Path>>(path: P, options: DbOptions) -> Result<Self> {
        let path = path.as_ref();
        let mut slab = Slab::open(path, options.backend, options.lock_mode)?;
        let rrd = Rrd::decode(&mut slab)?;
        debug!(
            path = %path.display(),
            last_update = rrd.header.last_update_time(),
            "opened database"
        );
        Ok(Self::from_parts(path, options, rrd, slab))
    }

    fn from_parts(path: &Path, options: DbOptions, rrd: Rrd, slab: Slab) -> Self {
        Self {
            path: path.to_path_buf(),
            options,
            inner: Mutex::new(Some(Inner { rrd, slab })),
        }
    }

    /// Runs `f` on the open storage under the handle's lock.
    pub(crate) fn with<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or_else(|| RrdError::Closed {
            path: self.path.clone(),
        })?;
        f(inner)
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Options this handle was opened with.
    pub fn options(&self) -> DbOptions {
        self.options
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    /// Flushes and closes the file and releases its lock.
    ///
    /// Closing an already closed handle does nothing.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the final sync fails.
    pub fn close(&self) -> Result<()> {
        let Some(inner) = self.inner.lock().take() else {
            return Ok(());
        };
        inner.slab.close()?;
        debug!(path = %self.path.display(), "closed database");
        Ok(())
    }

    /// Commits one update: `values` holds one raw reading per datasource.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::SampleWidth`] if `values` has the wrong
    /// length, [`RrdError::TimestampOrder`] if `time` is not newer than the
    /// last update, [`RrdError::Closed`] after `close()`, or an I/O error.
    ///
    /// If writing the update fails, the in-memory state is reloaded from
    /// storage, so the handle never reports an update the file lacks.
    pub fn update(&self, time: u64, values: &[f64]) -> Result<()> {
        self.with(|inner| {
            inner.rrd.update(time, values)?;
            let Err(err) = inner.rrd.flush(&mut inner.slab) else {
                return Ok(());
            };
            match Rrd::decode(&mut inner.slab) {
                Ok(rrd) => inner.rrd = rrd,
                Err(reload) => warn!(
                    path = %self.path.display(),
                    error = %reload,
                    "failed to reload database after a failed write"
                ),
            }
            Err(err)
        })
    }

    /// Creates a NaN-filled sample stamped with `time`.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after `close()`.
    pub fn create_sample(&self, time: u64) -> Result<Sample<'_>> {
        Ok(Sample::new(self, time, self.ds_names()?))
    }

    /// Creates a NaN-filled sample stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after `close()`.
    pub fn create_sample_now(&self) -> Result<Sample<'_>> {
        self.create_sample(crate::unix_now())
    }

    /// Creates a fetch request for `[start, end]` with resolution 1.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidFetchWindow`] if `start > end`.
    pub fn create_fetch_request(
        &self,
        consol_fun: ConsolFun,
        start: u64,
        end: u64,
    ) -> Result<FetchRequest<'_>> {
        FetchRequest::new(self, consol_fun, start, end)
    }

    pub(crate) fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchData> {
        self.with(|inner| inner.rrd.fetch(request))
    }

    /// Time of the last accepted update.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after `close()`.
    pub fn last_update_time(&self) -> Result<u64> {
        self.with(|inner| Ok(inner.rrd.header.last_update_time()))
    }

    /// Base step in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after `close()`.
    pub fn step(&self) -> Result<u64> {
        self.with(|inner| Ok(inner.rrd.header.step()))
    }

    /// Number of datasources.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after `close()`.
    pub fn ds_count(&self) -> Result<usize> {
        self.with(|inner| Ok(inner.rrd.datasources.len()))
    }

    /// Number of archives.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after `close()`.
    pub fn arc_count(&self) -> Result<usize> {
        self.with(|inner| Ok(inner.rrd.archives.len()))
    }

    /// Datasource names in definition order.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after `close()`.
    pub fn ds_names(&self) -> Result<Vec<String>> {
        self.with(|inner| Ok(inner.rrd.ds_names()))
    }

    /// Position of the datasource called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::DatasourceName`] if there is none, or
    /// [`RrdError::Closed`] after `close()`.
    pub fn ds_index(&self, name: &str) -> Result<usize> {
        self.with(|inner| DsRef::Name(name).resolve(&inner.rrd.ds_names()))
    }

    /// Last raw reading of every datasource, NaN before its first update.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after `close()`.
    pub fn last_values(&self) -> Result<Vec<f64>> {
        self.with(|inner| {
            Ok(inner
                .rrd
                .datasources
                .iter()
                .map(DataSource::last_value)
                .collect())
        })
    }

    /// Rebuilds the definition of this file.
    ///
    /// The returned start time is the current last update time, so creating
    /// a database from it yields an empty copy that accepts the next update.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after `close()`.
    pub fn definition(&self) -> Result<RrdDef> {
        self.with(|inner| Ok(inner.rrd.to_def(&self.path)))
    }

    /// Shape and coverage of the archive with `consol_fun` and `steps`.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::Archive`] if there is no such archive, or
    /// [`RrdError::Closed`] after `close()`.
    pub fn archive_info(&self, consol_fun: ConsolFun, steps: u32) -> Result<ArchiveInfo> {
        self.with(|inner| {
            let last_update = inner.rrd.header.last_update_time();
            inner
                .rrd
                .archives
                .iter()
                .find(|arc| arc.consol_fun() == consol_fun && arc.steps() == steps)
                .map(|arc| arc.info(last_update))
                .ok_or_else(|| LookupError::Archive { consol_fun, steps }.into())
        })
    }

    /// Forces written data to stable storage.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after `close()`, or an I/O error.
    pub fn sync(&self) -> Result<()> {
        self.with(|inner| inner.slab.sync())
    }
}

impl RrdDef {
    /// Exact size in bytes of the file this definition produces.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the definition is invalid.
    pub fn estimated_size(&self) -> Result<u64> {
        self.validate()?;
        encoded_size(&mut Rrd::from_def(self))
    }
}

#[cfg(test)]
impl RrdDatabase {
    /// Creates an in-memory database whose storage fails while the returned
    /// switch is on.
    pub(crate) fn create_flaky(
        def: &RrdDef,
    ) -> (Self, std::sync::Arc<std::sync::atomic::AtomicBool>) {
        let options = DbOptions {
            backend: BackendKind::Memory,
            lock_mode: LockMode::Disabled,
        };
        let db = Self::create_with(def, options).unwrap();
        let Inner { rrd, mut slab } = db.inner.into_inner().unwrap();
        let (slab, failing) = crate::slab::testing::flaky_copy(&mut slab);
        (Self::from_parts(&def.path, options, rrd, slab), failing)
    }
}
