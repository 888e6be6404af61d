//! Fixed-size random-access storage for rrdb database files.
//!
//! A [`Slab`] is a byte region of fixed length addressed by offset. It knows
//! nothing about the fields stored in it; the [`field`](crate::field) module
//! decides what lives where. The region is backed by one of three
//! [`Backend`]s:
//!
//! - [`FileBackend`] — seek-based reads and writes on a `File`
//! - [`MmapBackend`] — a `memmap2` mapping of the file
//! - [`MemoryBackend`] — a heap buffer, for throwaway databases
//!
//! File-backed slabs can hold an advisory exclusive lock (see [`LockMode`])
//! for as long as the slab is open.
//!
//! # Sizing
//!
//! A slab is sized exactly once, at creation, to the length the field
//! layout requires. Every access is bounds-checked against that length;
//! nothing ever grows the file.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};

use crate::error::{FormatError, Result, RrdError};

/// Poll interval while waiting for a contended lock.
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Advisory locking behavior for file-backed slabs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// No lock is taken.
    #[default]
    Disabled,
    /// Block until the lock is free, polling every [`LOCK_RETRY_INTERVAL`].
    Wait,
    /// Fail with [`RrdError::LockContention`] if the lock is held.
    FailFast,
}

/// Which backend a slab uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Seek-based file I/O.
    File,
    /// Memory-mapped file.
    #[default]
    Mmap,
    /// Heap buffer; nothing touches the filesystem.
    Memory,
}

/// Random-access byte storage behind a [`Slab`].
///
/// Implementations do not bounds-check against the logical slab size; the
/// slab does that before delegating.
pub trait Backend: Send + fmt::Debug {
    /// Reads `buf.len()` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes all of `buf` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Current length in bytes.
    fn len(&self) -> u64;

    /// Returns `true` if the backend holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resizes the storage; new bytes are zero.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Flushes pending writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn sync(&mut self) -> io::Result<()>;

    /// The file behind this backend, if any. Used for advisory locking.
    fn file(&self) -> Option<&File>;
}

/// Seek-based file backend.
///
/// In safe mode every access saves the current file position and restores
/// it afterwards, so an offset-addressed access never disturbs a caller
/// that is writing the file sequentially through the same descriptor.
#[derive(Debug)]
pub struct FileBackend {
    file: File,
    len: u64,
    safe_mode: bool,
}

impl FileBackend {
    /// Wraps an open file. Safe mode is on.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file metadata cannot be read.
    pub fn new(file: File) -> io::Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            len,
            safe_mode: true,
        })
    }

    /// Turns position save/restore on or off.
    pub fn set_safe_mode(&mut self, safe_mode: bool) {
        self.safe_mode = safe_mode;
    }

    /// Current position of the underlying file cursor.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub fn position(&mut self) -> io::Result<u64> {
        self.file.stream_position()
    }

    fn with_position<T>(
        &mut self,
        offset: u64,
        op: impl FnOnce(&mut File) -> io::Result<T>,
    ) -> io::Result<T> {
        let saved = if self.safe_mode {
            Some(self.file.stream_position()?)
        } else {
            None
        };
        self.file.seek(SeekFrom::Start(offset))?;
        let result = op(&mut self.file);
        if let Some(position) = saved {
            self.file.seek(SeekFrom::Start(position))?;
        }
        result
    }
}

impl Backend for FileBackend {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.with_position(offset, |file| file.read_exact(buf))
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.with_position(offset, |file| file.write_all(buf))
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn file(&self) -> Option<&File> {
        Some(&self.file)
    }
}

/// Memory-mapped file backend.
///
/// The mapping is (re)created whenever the length changes; a zero-length
/// file has no mapping.
#[derive(Debug)]
pub struct MmapBackend {
    file: File,
    mmap: Option<MmapMut>,
}

impl MmapBackend {
    /// Maps an open file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be mapped.
    pub fn new(file: File) -> io::Result<Self> {
        let mut backend = Self { file, mmap: None };
        backend.remap()?;
        Ok(backend)
    }

    fn remap(&mut self) -> io::Result<()> {
        self.mmap = None;
        if self.file.metadata()?.len() == 0 {
            return Ok(());
        }
        // SAFETY: The file is open read/write for the lifetime of the mapping.
        // Truncation by other processes is excluded by the advisory lock when
        // one is held; without a lock the caller accepts the shared-file risk,
        // exactly as with any mapped file.
        let mmap = unsafe { MmapMut::map_mut(&self.file)? };
        self.mmap = Some(mmap);
        Ok(())
    }

    fn region(&self, offset: u64, length: usize) -> io::Result<&[u8]> {
        let start = usize::try_from(offset).map_err(io::Error::other)?;
        self.mmap
            .as_deref()
            .and_then(|map| map.get(start..start.checked_add(length)?))
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))
    }

    fn region_mut(&mut self, offset: u64, length: usize) -> io::Result<&mut [u8]> {
        let start = usize::try_from(offset).map_err(io::Error::other)?;
        self.mmap
            .as_deref_mut()
            .and_then(|map| map.get_mut(start..start.checked_add(length)?))
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))
    }
}

impl Backend for MmapBackend {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        buf.copy_from_slice(self.region(offset, buf.len())?);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.region_mut(offset, buf.len())?.copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.mmap.as_ref().map_or(0, |map| map.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.mmap = None;
        self.file.set_len(len)?;
        self.remap()
    }

    fn sync(&mut self) -> io::Result<()> {
        match &self.mmap {
            Some(map) => map.flush(),
            None => Ok(()),
        }
    }

    fn file(&self) -> Option<&File> {
        Some(&self.file)
    }
}

/// Heap-buffer backend. Contents are lost when the slab is dropped.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Vec<u8>,
}

impl MemoryBackend {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    fn range(&self, offset: u64, length: usize) -> io::Result<std::ops::Range<usize>> {
        let start = usize::try_from(offset).map_err(io::Error::other)?;
        match start.checked_add(length) {
            Some(end) if end <= self.data.len() => Ok(start..end),
            _ => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
        }
    }
}

impl Backend for MemoryBackend {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let range = self.range(offset, buf.len())?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len).map_err(io::Error::other)?;
        self.data.resize(len, 0);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn file(&self) -> Option<&File> {
        None
    }
}

/// A fixed-size, offset-addressed storage region for one database.
#[derive(Debug)]
pub struct Slab {
    /// Path of the database (also the identity of in-memory slabs).
    path: PathBuf,
    /// The storage behind this slab.
    backend: Box<dyn Backend>,
    /// Whether this slab holds an advisory lock on its file.
    locked: bool,
}

impl Slab {
    /// Creates (or overwrites) the storage for a new database of `size` bytes.
    ///
    /// The file is locked, if requested, before it is truncated, so a
    /// database held by another handle is never clobbered in
    /// [`LockMode::FailFast`] or [`LockMode::Wait`].
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be created or sized, or
    /// [`RrdError::LockContention`] if a fail-fast lock is refused.
    pub fn create<P: AsRef<Path>>(
        path: P,
        size: u64,
        kind: BackendKind,
        lock_mode: LockMode,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut slab = match kind {
            BackendKind::Memory => Self {
                path,
                backend: Box::new(MemoryBackend::new()),
                locked: false,
            },
            BackendKind::File | BackendKind::Mmap => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)?;
                let locked = acquire_lock(&file, &path, lock_mode)?;
                file.set_len(0)?;
                Self {
                    backend: file_backend(file, kind)?,
                    path,
                    locked,
                }
            }
        };

        slab.backend.set_len(size)?;
        tracing::debug!(path = %slab.path.display(), size, ?kind, "created slab");
        Ok(slab)
    }

    /// Opens the storage of an existing database file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened, or
    /// [`RrdError::LockContention`] if a fail-fast lock is refused.
    /// In-memory slabs cannot be reopened; `NotFound` is returned.
    pub fn open<P: AsRef<Path>>(path: P, kind: BackendKind, lock_mode: LockMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if kind == BackendKind::Memory {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "in-memory databases cannot be reopened",
            )
            .into());
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let locked = acquire_lock(&file, &path, lock_mode)?;
        let backend = file_backend(file, kind)?;
        tracing::debug!(path = %path.display(), size = backend.len(), ?kind, "opened slab");

        Ok(Self {
            path,
            backend,
            locked,
        })
    }

    /// Path of the database this slab stores.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total size in bytes.
    pub fn len(&self) -> u64 {
        self.backend.len()
    }

    /// Returns `true` if the slab holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.backend.is_empty()
    }

    /// Whether an advisory lock is held.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Reads `buf.len()` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Truncated`] if the range runs past the end of
    /// the slab, or the backend's I/O error.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        self.backend.read_at(offset, buf)?;
        Ok(())
    }

    /// Writes `buf` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Truncated`] if the range runs past the end of
    /// the slab, or the backend's I/O error.
    pub fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        self.backend.write_at(offset, buf)?;
        Ok(())
    }

    /// Flushes pending writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns the backend's I/O error.
    pub fn sync(&mut self) -> Result<()> {
        self.backend.sync()?;
        Ok(())
    }

    /// Syncs, releases the lock, and drops the backend.
    ///
    /// # Errors
    ///
    /// Returns the backend's I/O error from the final sync or unlock.
    pub fn close(mut self) -> Result<()> {
        self.backend.sync()?;
        if self.locked
            && let Some(file) = self.backend.file()
        {
            FileExt::unlock(file)?;
        }
        tracing::debug!(path = %self.path.display(), "closed slab");
        Ok(())
    }

    fn check_bounds(&self, offset: u64, length: usize) -> Result<()> {
        let length = length as u64;
        let file_size = self.backend.len();
        match offset.checked_add(length) {
            Some(end) if end <= file_size => Ok(()),
            _ => Err(FormatError::Truncated {
                offset,
                length,
                file_size,
            }
            .into()),
        }
    }
}

fn file_backend(file: File, kind: BackendKind) -> Result<Box<dyn Backend>> {
    Ok(match kind {
        BackendKind::Mmap => Box::new(MmapBackend::new(file)?),
        _ => Box::new(FileBackend::new(file)?),
    })
}

/// Takes the advisory lock according to `mode`. Returns whether a lock is held.
fn acquire_lock(file: &File, path: &Path, mode: LockMode) -> Result<bool> {
    match mode {
        LockMode::Disabled => Ok(false),
        LockMode::FailFast => match FileExt::try_lock_exclusive(file) {
            Ok(()) => Ok(true),
            Err(e) if is_contended(&e) => Err(RrdError::LockContention {
                path: path.to_path_buf(),
            }),
            Err(e) => Err(e.into()),
        },
        LockMode::Wait => loop {
            match FileExt::try_lock_exclusive(file) {
                Ok(()) => return Ok(true),
                // An interrupted attempt is spurious; keep waiting.
                Err(e) if is_contended(&e) || e.kind() == io::ErrorKind::Interrupted => {
                    tracing::warn!(path = %path.display(), "database locked, retrying");
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        },
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.kind() == fs2::lock_contended_error().kind()
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_sizes_file_exactly() {
        let dir = tempdir().unwrap();
        for kind in [BackendKind::File, BackendKind::Mmap] {
            let path = dir.path().join(format!("{kind:?}.rrd"));
            let slab = Slab::create(&path, 1234, kind, LockMode::Disabled).unwrap();
            assert_eq!(slab.len(), 1234);
            slab.close().unwrap();
            assert_eq!(std::fs::metadata(&path).unwrap().len(), 1234);
        }
    }

    #[test]
    fn test_create_truncates_existing_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.rrd");
        std::fs::write(&path, vec![0xAB; 64]).unwrap();

        let mut slab = Slab::create(&path, 16, BackendKind::File, LockMode::Disabled).unwrap();
        let mut buf = [0xFF; 16];
        slab.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0; 16]);
    }

    #[test]
    fn test_write_then_read_across_backends() {
        let dir = tempdir().unwrap();
        for kind in [BackendKind::File, BackendKind::Mmap, BackendKind::Memory] {
            let path = dir.path().join(format!("rw_{kind:?}.rrd"));
            let mut slab = Slab::create(&path, 32, kind, LockMode::Disabled).unwrap();
            slab.write(8, &[1, 2, 3, 4]).unwrap();
            let mut buf = [0; 4];
            slab.read(8, &mut buf).unwrap();
            assert_eq!(buf, [1, 2, 3, 4], "backend {kind:?}");
        }
    }

    #[test]
    fn test_reopen_sees_written_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.rrd");
        let mut slab = Slab::create(&path, 16, BackendKind::Mmap, LockMode::Disabled).unwrap();
        slab.write(12, &[9, 9, 9, 9]).unwrap();
        slab.close().unwrap();

        let mut slab = Slab::open(&path, BackendKind::File, LockMode::Disabled).unwrap();
        let mut buf = [0; 4];
        slab.read(12, &mut buf).unwrap();
        assert_eq!(buf, [9, 9, 9, 9]);
    }

    #[test]
    fn test_out_of_bounds_access_is_truncation() {
        let mut slab =
            Slab::create("memory", 8, BackendKind::Memory, LockMode::Disabled).unwrap();
        let mut buf = [0; 4];
        let err = slab.read(6, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            RrdError::Format(FormatError::Truncated {
                offset: 6,
                length: 4,
                file_size: 8
            })
        ));
        assert!(slab.write(u64::MAX, &[1]).is_err());
    }

    #[test]
    fn test_memory_slab_cannot_be_reopened() {
        let err = Slab::open("memory", BackendKind::Memory, LockMode::Disabled).unwrap_err();
        assert!(matches!(err, RrdError::Io(e) if e.kind() == io::ErrorKind::NotFound));
    }

    #[test]
    fn test_fail_fast_lock_contention() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locked.rrd");
        let first = Slab::create(&path, 8, BackendKind::File, LockMode::FailFast).unwrap();
        assert!(first.is_locked());

        let err = Slab::open(&path, BackendKind::File, LockMode::FailFast).unwrap_err();
        assert!(matches!(err, RrdError::LockContention { .. }));

        // Unlocked access is not affected by the advisory lock.
        assert!(Slab::open(&path, BackendKind::File, LockMode::Disabled).is_ok());

        first.close().unwrap();
        assert!(Slab::open(&path, BackendKind::File, LockMode::FailFast).is_ok());
    }

    #[test]
    fn test_wait_lock_acquires_after_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wait.rrd");
        let first = Slab::create(&path, 8, BackendKind::File, LockMode::FailFast).unwrap();

        let waiter_path = path.clone();
        let waiter = thread::spawn(move || {
            Slab::open(&waiter_path, BackendKind::File, LockMode::Wait).map(|s| s.is_locked())
        });

        thread::sleep(Duration::from_millis(100));
        first.close().unwrap();
        assert!(waiter.join().unwrap().unwrap());
    }

    #[test]
    fn test_safe_mode_preserves_file_position() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("safe.rrd");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        let mut backend = FileBackend::new(file).unwrap();
        backend.set_len(32).unwrap();
        backend.file.seek(SeekFrom::Start(4)).unwrap();

        backend.write_at(20, &[7; 4]).unwrap();
        assert_eq!(backend.position().unwrap(), 4);

        backend.set_safe_mode(false);
        backend.write_at(20, &[8; 4]).unwrap();
        assert_eq!(backend.position().unwrap(), 24);
    }
}
