//! Range queries.
//!
//! A [`FetchRequest`] names a consolidation function, a time window and a
//! preferred resolution. [`FetchRequest::fetch_data`] picks the best archive
//! and returns a [`FetchData`] table with one row per aligned timestamp of
//! that archive's grid, widened outward to cover the whole window.
//!
//! The table owns its data; nothing in it aliases the database.

use crate::archive::ArchiveInfo;
use crate::database::RrdDatabase;
use crate::datasource::DsRef;
use crate::definition::ConsolFun;
use crate::error::{Result, ValidationError};

/// A query against one database.
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    db: &'a RrdDatabase,
    consol_fun: ConsolFun,
    start: u64,
    end: u64,
    resolution: u64,
    filter: Option<Vec<String>>,
}

impl<'a> FetchRequest<'a> {
    pub(crate) fn new(
        db: &'a RrdDatabase,
        consol_fun: ConsolFun,
        start: u64,
        end: u64,
    ) -> Result<Self> {
        if start > end {
            return Err(ValidationError::InvalidFetchWindow { start, end }.into());
        }
        Ok(Self {
            db,
            consol_fun,
            start,
            end,
            resolution: 1,
            filter: None,
        })
    }

    /// Requested consolidation function.
    pub fn consol_fun(&self) -> ConsolFun {
        self.consol_fun
    }

    /// Requested window start.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Requested window end.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Preferred row length in seconds.
    pub fn resolution(&self) -> u64 {
        self.resolution
    }

    /// Datasources to return, `None` for all of them.
    pub fn filter(&self) -> Option<&[String]> {
        self.filter.as_deref()
    }

    /// Sets the preferred row length in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::ZeroResolution`] for zero.
    pub fn set_resolution(mut self, resolution: u64) -> Result<Self> {
        if resolution == 0 {
            return Err(ValidationError::ZeroResolution.into());
        }
        self.resolution = resolution;
        Ok(self)
    }

    /// Restricts the result to the named datasources, in this order.
    pub fn set_filter<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Runs the query.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::NoMatchingArchive`](crate::error::RrdError::NoMatchingArchive)
    /// if no archive uses the consolidation function, a
    /// [`LookupError`](crate::error::LookupError) if the filter names an
    /// unknown datasource, [`ValidationError::FetchWindowTooLarge`] if the
    /// window does not fit the selected archive's grid, or
    /// [`RrdError::Closed`](crate::error::RrdError::Closed).
    pub fn fetch_data(&self) -> Result<FetchData> {
        self.db.fetch(self)
    }
}

/// One row of a [`FetchData`] table.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchPoint {
    time: u64,
    values: Vec<f64>,
}

impl FetchPoint {
    /// Row timestamp.
    pub fn time(&self) -> u64 {
        self.time
    }

    /// One value per column.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Value of column `index`, if it exists.
    pub fn value(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied()
    }
}

/// Result of a fetch: evenly spaced timestamps and one column per datasource.
#[derive(Debug, Clone)]
pub struct FetchData {
    archive: ArchiveInfo,
    request_start: u64,
    request_end: u64,
    ds_names: Vec<String>,
    timestamps: Vec<u64>,
    columns: Vec<Vec<f64>>,
}

impl FetchData {
    pub(crate) fn new(
        archive: ArchiveInfo,
        request_start: u64,
        request_end: u64,
        ds_names: Vec<String>,
        timestamps: Vec<u64>,
        columns: Vec<Vec<f64>>,
    ) -> Self {
        Self {
            archive,
            request_start,
            request_end,
            ds_names,
            timestamps,
            columns,
        }
    }

    /// The archive the rows were read from.
    pub fn archive(&self) -> &ArchiveInfo {
        &self.archive
    }

    /// Spacing between rows in seconds.
    pub fn step(&self) -> u64 {
        self.archive.arc_step
    }

    /// Window start as requested, before alignment.
    pub fn request_start(&self) -> u64 {
        self.request_start
    }

    /// Window end as requested, before alignment.
    pub fn request_end(&self) -> u64 {
        self.request_end
    }

    /// Column names.
    pub fn ds_names(&self) -> &[String] {
        &self.ds_names
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.timestamps.len()
    }

    /// Number of columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Row timestamps, strictly increasing.
    pub fn timestamps(&self) -> &[u64] {
        &self.timestamps
    }

    /// One column by index or name.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError`](crate::error::LookupError) if the column does
    /// not exist.
    pub fn values<'r, R: Into<DsRef<'r>>>(&self, ds: R) -> Result<&[f64]> {
        let index = ds.into().resolve(&self.ds_names)?;
        Ok(&self.columns[index])
    }

    /// Row `index`, if it exists.
    pub fn row(&self, index: usize) -> Option<FetchPoint> {
        let time = *self.timestamps.get(index)?;
        Some(FetchPoint {
            time,
            values: self.columns.iter().map(|column| column[index]).collect(),
        })
    }

    /// All rows in time order.
    pub fn rows(&self) -> impl Iterator<Item = FetchPoint> + '_ {
        (0..self.row_count()).filter_map(|index| self.row(index))
    }

    /// Aggregates the known values of one column.
    ///
    /// `Average` is the mean, `Min`/`Max` the extremes and `Last` the newest
    /// known value. NaN if the column has no known value.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError`](crate::error::LookupError) if the column does
    /// not exist.
    #[allow(clippy::cast_precision_loss)]
    pub fn aggregate<'r, R: Into<DsRef<'r>>>(&self, ds: R, consol_fun: ConsolFun) -> Result<f64> {
        let known = self.values(ds)?.iter().copied().filter(|v| !v.is_nan());
        let (count, folded) = known.fold((0usize, f64::NAN), |(count, acc), value| {
            (count + 1, consol_fun.fold(acc, value))
        });
        Ok(match consol_fun {
            ConsolFun::Average if count > 0 => folded / count as f64,
            _ => folded,
        })
    }
}
