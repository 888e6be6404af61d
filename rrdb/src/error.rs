//! Error types for the rrdb round-robin database engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::definition::ConsolFun;

/// The main error type for all rrdb operations.
///
/// Every failure is fatal to the call that triggered it. The only internal
/// retry in the crate is advisory lock acquisition in
/// [`LockMode::Wait`](crate::slab::LockMode::Wait).
#[derive(Error, Debug)]
pub enum RrdError {
    /// A definition, sample, or request failed validation.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// An update was not newer than the last committed update.
    #[error("bad sample timestamp {timestamp}: last update time was {last_update}, at least one second step is required")]
    TimestampOrder {
        /// The rejected sample timestamp.
        timestamp: u64,
        /// The database's last update time.
        last_update: u64,
    },

    /// A datasource or archive lookup failed.
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(#[from] LookupError),

    /// No archive uses the requested consolidation function.
    #[error("database does not contain an archive with consolidation function {consol_fun}")]
    NoMatchingArchive {
        /// The requested consolidation function.
        consol_fun: ConsolFun,
    },

    /// The file or dump is not a valid database.
    #[error("storage format error: {0}")]
    Format(#[from] FormatError),

    /// A fail-fast lock request found the file already locked.
    #[error("file '{}' is locked by another handle or process", path.display())]
    LockContention {
        /// The locked file.
        path: PathBuf,
    },

    /// A handle pool operation was not permitted in the pool's current state.
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// The handle was used after `close()`.
    #[error("database '{}' is closed", path.display())]
    Closed {
        /// Path of the closed database.
        path: PathBuf,
    },

    /// Underlying I/O failure, propagated unmodified.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while validating definitions, samples, and fetch requests.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// The database path is empty.
    #[error("database path must not be empty")]
    EmptyPath,

    /// The base step is zero.
    #[error("step must be positive")]
    ZeroStep,

    /// No datasource was defined.
    #[error("no datasources defined")]
    NoDatasources,

    /// No archive was defined.
    #[error("no archives defined")]
    NoArchives,

    /// A datasource name is empty, too long, or contains whitespace.
    #[error("invalid datasource name '{name}': {reason}")]
    InvalidName {
        /// The offending name.
        name: String,
        /// Why the name was rejected.
        reason: String,
    },

    /// Two datasources share a name.
    #[error("duplicate datasource name '{name}'")]
    DuplicateDatasource {
        /// The duplicated name.
        name: String,
    },

    /// Two archives share a consolidation function and step count.
    #[error("duplicate archive {consol_fun} with {steps} steps")]
    DuplicateArchive {
        /// Consolidation function of the duplicate.
        consol_fun: ConsolFun,
        /// Steps per row of the duplicate.
        steps: u32,
    },

    /// A heartbeat of zero was supplied.
    #[error("heartbeat of datasource '{name}' must be positive")]
    ZeroHeartbeat {
        /// The datasource name.
        name: String,
    },

    /// Both bounds are set and `min >= max`.
    #[error("datasource '{name}': min {min} must be less than max {max}")]
    InvalidRange {
        /// The datasource name.
        name: String,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },

    /// An unrecognized datasource type string.
    #[error("unknown datasource type '{0}'")]
    UnknownDsType(String),

    /// An unrecognized consolidation function string.
    #[error("unknown consolidation function '{0}'")]
    UnknownConsolFun(String),

    /// The xff is outside `[0, 1)`.
    #[error("xff {xff} must be in [0, 1)")]
    InvalidXff {
        /// The offending value.
        xff: f64,
    },

    /// An archive with zero steps or zero rows.
    #[error("archive {consol_fun}: {field} must be positive")]
    ZeroArchiveSize {
        /// Consolidation function of the archive.
        consol_fun: ConsolFun,
        /// Which field was zero (`steps` or `rows`).
        field: &'static str,
    },

    /// A fetch window with `start > end`.
    #[error("invalid fetch window: start {start} > end {end}")]
    InvalidFetchWindow {
        /// Requested start.
        start: u64,
        /// Requested end.
        end: u64,
    },

    /// A fetch window that cannot be laid out on an archive's step grid.
    #[error("fetch window [{start}, {end}] is too large for a {step} s archive")]
    FetchWindowTooLarge {
        /// Requested start.
        start: u64,
        /// Requested end.
        end: u64,
        /// Step of the selected archive.
        step: u64,
    },

    /// A sample carries the wrong number of values.
    #[error("sample has {found} values, database has {expected} datasources")]
    SampleWidth {
        /// Number of datasources in the database.
        expected: usize,
        /// Number of values supplied.
        found: usize,
    },

    /// A fetch resolution of zero.
    #[error("fetch resolution must be positive")]
    ZeroResolution,

    /// A definition or dump could not be read as JSON.
    #[error("malformed definition: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised when a name or index does not resolve.
#[derive(Error, Debug)]
pub enum LookupError {
    /// No datasource with this name.
    #[error("no datasource named '{0}'")]
    DatasourceName(String),

    /// Datasource index out of range.
    #[error("datasource index {index} out of range (datasource count {count})")]
    DatasourceIndex {
        /// The requested index.
        index: usize,
        /// Number of datasources in the database.
        count: usize,
    },

    /// No archive with this consolidation function and step count.
    #[error("no archive {consol_fun} with {steps} steps")]
    Archive {
        /// Requested consolidation function.
        consol_fun: ConsolFun,
        /// Requested steps per row.
        steps: u32,
    },
}

/// Errors raised when stored bytes or a dump do not describe a valid database.
#[derive(Error, Debug)]
pub enum FormatError {
    /// The signature field does not identify an rrdb file.
    #[error("not an RRD file: bad signature '{signature}'")]
    BadSignature {
        /// The signature that was found.
        signature: String,
    },

    /// A read ran past the end of the file.
    #[error("unexpected end of file: {length} bytes at offset {offset}, file size {file_size}")]
    Truncated {
        /// Offset of the failed read.
        offset: u64,
        /// Length of the failed read.
        length: u64,
        /// Actual file size.
        file_size: u64,
    },

    /// Bytes remain after the last field was read.
    #[error("'{}' is not an RRD file: {trailing} trailing bytes", path.display())]
    TrailingBytes {
        /// The file being opened.
        path: PathBuf,
        /// Number of unread bytes.
        trailing: u64,
    },

    /// A field holds a value that no writer produces.
    #[error("corrupt field: {reason}")]
    CorruptField {
        /// Description of the corruption.
        reason: String,
    },

    /// The interchange dump uses an unsupported version.
    #[error("unsupported dump version '{found}', expected '{expected}'")]
    DumpVersion {
        /// Version found in the dump.
        found: String,
        /// Version this crate reads and writes.
        expected: &'static str,
    },

    /// The interchange dump is not well-formed.
    #[error("malformed dump: {0}")]
    Xml(#[from] quick_xml::de::DeError),

    /// The dump disagrees with itself (e.g. row width vs. datasource count).
    #[error("inconsistent dump: {reason}")]
    InconsistentDump {
        /// Description of the inconsistency.
        reason: String,
    },
}

/// Errors raised by [`HandlePool`](crate::pool::HandlePool) bookkeeping.
#[derive(Error, Debug)]
pub enum PoolError {
    /// A creation request named a path whose handle is still referenced.
    #[error("cannot create '{}': an open handle is still in use ({usage} references)", path.display())]
    PathInUse {
        /// The contested path.
        path: PathBuf,
        /// Current usage count of the existing handle.
        usage: usize,
    },

    /// The released handle was not handed out by this pool.
    #[error("handle for '{}' is not registered in this pool", path.display())]
    UnknownHandle {
        /// Path of the released handle.
        path: PathBuf,
    },

    /// The released handle has no outstanding references.
    #[error("handle for '{}' released more times than requested", path.display())]
    NotInUse {
        /// Path of the released handle.
        path: PathBuf,
    },

    /// The released handle was already closed.
    #[error("handle for '{}' is already closed", path.display())]
    HandleClosed {
        /// Path of the released handle.
        path: PathBuf,
    },
}

/// Type alias for `Result<T, RrdError>`.
pub type Result<T> = std::result::Result<T, RrdError>;
