//! Update staging.
//!
//! A [`Sample`] collects one raw reading per datasource for a single
//! timestamp and commits them with [`Sample::update`]. Unset readings stay
//! NaN and produce unknown data.

use crate::database::RrdDatabase;
use crate::datasource::DsRef;
use crate::error::{Result, ValidationError};

/// Readings for one timestamp, committed atomically.
#[derive(Debug)]
pub struct Sample<'a> {
    db: &'a RrdDatabase,
    time: u64,
    names: Vec<String>,
    values: Vec<f64>,
}

impl<'a> Sample<'a> {
    pub(crate) fn new(db: &'a RrdDatabase, time: u64, names: Vec<String>) -> Self {
        let values = vec![f64::NAN; names.len()];
        Self {
            db,
            time,
            names,
            values,
        }
    }

    /// Timestamp the readings will be committed at.
    pub fn time(&self) -> u64 {
        self.time
    }

    /// Changes the timestamp.
    pub fn set_time(&mut self, time: u64) -> &mut Self {
        self.time = time;
        self
    }

    /// Sets one reading by datasource index or name.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError`](crate::error::LookupError) if the datasource
    /// does not exist.
    pub fn set_value<'r, R: Into<DsRef<'r>>>(&mut self, ds: R, value: f64) -> Result<&mut Self> {
        let index = ds.into().resolve(&self.names)?;
        self.values[index] = value;
        Ok(self)
    }

    /// Sets every reading, in datasource order.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::SampleWidth`] unless there is exactly one
    /// value per datasource; the readings are left unchanged.
    pub fn set_values(&mut self, values: &[f64]) -> Result<&mut Self> {
        if values.len() != self.values.len() {
            return Err(ValidationError::SampleWidth {
                expected: self.values.len(),
                found: values.len(),
            }
            .into());
        }
        self.values.copy_from_slice(values);
        Ok(self)
    }

    /// Current readings in datasource order.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Datasource names in the order of [`values`](Self::values).
    pub fn ds_names(&self) -> &[String] {
        &self.names
    }

    /// Resets every reading to NaN.
    pub fn clear(&mut self) -> &mut Self {
        self.values.fill(f64::NAN);
        self
    }

    /// Commits the readings under the database lock, then resets them to NaN.
    ///
    /// On failure the readings are kept so the caller can correct the
    /// timestamp and retry.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::TimestampOrder`](crate::error::RrdError::TimestampOrder)
    /// if the timestamp is not newer than the last update, or any error of
    /// [`RrdDatabase::update`].
    pub fn update(&mut self) -> Result<()> {
        self.db.update(self.time, &self.values)?;
        self.clear();
        Ok(())
    }

    /// Sets the timestamp and every reading, then commits.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::SampleWidth`] for the wrong number of
    /// values, otherwise see [`update`](Self::update).
    pub fn set_and_update(&mut self, time: u64, values: &[f64]) -> Result<()> {
        self.set_time(time).set_values(values)?;
        self.update()
    }
}
