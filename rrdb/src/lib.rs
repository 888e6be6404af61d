//! # rrdb
//!
//! Embedded round-robin time-series database.
//!
//! rrdb stores one or more numeric datasources in a single fixed-size file.
//! Raw readings are normalized into primary data points of one base step,
//! then consolidated (average, min, max or last) into round-robin archives
//! of fixed length. The file never grows: the oldest row of each archive is
//! overwritten by the newest.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Size fixed at creation, determined only by the definition
//! - Time-weighted normalization with heartbeat-based unknown detection
//! - Several storage backends behind one interface (file, mmap, memory)
//! - Portable big-endian layout, plus an XML dump for import and export
//! - A reference-counted handle pool for sharing open files
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rrdb::{ArcDef, ConsolFun, DsDef, DsType, RrdDatabase, RrdDef};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // 5 minute step, one gauge, one day of 5 minute averages
//! let mut def = RrdDef::new("./load.rrd", 300);
//! def.add_datasource(DsDef::new("load", DsType::Gauge, 600, Some(0.0), None)?);
//! def.add_archive(ArcDef::new(ConsolFun::Average, 0.5, 1, 288)?);
//!
//! let db = RrdDatabase::create(&def)?;
//!
//! // Record readings
//! let mut sample = db.create_sample_now()?;
//! sample.set_value("load", 0.42)?;
//! sample.update()?;
//!
//! // Read back the last hour
//! let end = db.last_update_time()?;
//! let data = db
//!     .create_fetch_request(ConsolFun::Average, end - 3600, end)?
//!     .fetch_data()?;
//! for point in data.rows() {
//!     println!("{}: {:?}", point.time(), point.values());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`RrdDatabase`] — Open file handle; update, fetch, dump
//! - [`RrdDef`] — Declarative definition used to create a file
//! - [`Sample`] — Staged readings for one timestamp
//! - [`FetchRequest`] / [`FetchData`] — Range queries and their results
//! - [`HandlePool`] — Shared handles keyed by path
//!
//! ## Modules
//!
//! For lower-level access, the individual modules are also public:
//!
//! - [`definition`] — Definitions and their validation
//! - [`database`] — Database lifecycle, update and fetch
//! - [`datasource`] — Per-datasource normalization state
//! - [`archive`] — Consolidation and round-robin archives
//! - [`robin`] — Circular row storage
//! - [`header`] — File header
//! - [`field`] — Typed field layout, encoding and decoding
//! - [`slab`] — Storage backends and file locking
//! - [`dump`] — XML import and export
//! - [`pool`] — Handle pool
//! - [`error`] — Error types

pub mod archive;
pub mod database;
pub mod datasource;
pub mod definition;
pub mod dump;
pub mod error;
pub mod fetch;
pub mod field;
pub mod header;
pub mod pool;
pub mod robin;
pub mod sample;
pub mod slab;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export primary API types at crate root for convenience.
pub use database::{DbOptions, RrdDatabase};
pub use datasource::DsRef;
pub use definition::{ArcDef, ConsolFun, DsDef, DsType, RrdDef};
pub use dump::RrdDump;
pub use error::{Result, RrdError};
pub use fetch::{FetchData, FetchPoint, FetchRequest};
pub use pool::{HandlePool, PoolConfig};
pub use sample::Sample;
pub use slab::{BackendKind, LockMode};

/// Current time in whole seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

/// Rounds `time` down to a multiple of `step`.
pub(crate) fn normalize(time: u64, step: u64) -> u64 {
    time - time % step
}
