//! Datasources: conversion of raw readings into primary data points.
//!
//! Each update turns a raw reading into a per-second rate according to the
//! datasource type, then spreads that rate over the seconds elapsed since
//! the previous update. Seconds are accumulated until a base-step boundary
//! is crossed; at that point the accumulated rate becomes one primary data
//! point (PDP) that is handed to every archive.
//!
//! # Rate rules
//!
//! | Type | Rate |
//! |---|---|
//! | `GAUGE` | the reading |
//! | `ABSOLUTE` | reading / elapsed |
//! | `DERIVE` | (reading - previous) / elapsed |
//! | `COUNTER` | as `DERIVE`, but a decrease is unknown |
//!
//! A rate is unknown when the gap since the previous update exceeds the
//! heartbeat, when it falls outside `[min, max]`, or when the type needs a
//! previous reading that does not exist yet.
//!
//! # Persistent state
//!
//! After the definition fields, every datasource stores the last raw
//! reading, the accumulated `rate * seconds` of the current step, and the
//! number of unknown seconds in the current step. This state survives
//! reopening the file.

use crate::definition::{DsDef, DsType};
use crate::error::{LookupError, Result};
use crate::field::{Encoder, FieldKind, FieldVisitor, Fields};
use crate::normalize;
use crate::slab::Slab;

/// A datasource reference, by position or by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsRef<'a> {
    /// Position in definition order.
    Index(usize),
    /// Datasource name.
    Name(&'a str),
}

impl From<usize> for DsRef<'_> {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl<'a> From<&'a str> for DsRef<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

impl<'a> From<&'a String> for DsRef<'a> {
    fn from(name: &'a String) -> Self {
        Self::Name(name)
    }
}

impl DsRef<'_> {
    /// Resolves this reference against an ordered list of names.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError`] if the index is out of range or no name
    /// matches.
    pub fn resolve<S: AsRef<str>>(self, names: &[S]) -> Result<usize> {
        match self {
            Self::Index(index) if index < names.len() => Ok(index),
            Self::Index(index) => Err(LookupError::DatasourceIndex {
                index,
                count: names.len(),
            }
            .into()),
            Self::Name(name) => names
                .iter()
                .position(|candidate| candidate.as_ref() == name)
                .ok_or_else(|| LookupError::DatasourceName(name.to_string()).into()),
        }
    }
}

/// One datasource: definition plus PDP accumulation state.
#[derive(Debug, Clone)]
pub struct DataSource {
    name: String,
    ds_type: DsType,
    heartbeat: u64,
    min: f64,
    max: f64,
    last_value: f64,
    accum_value: f64,
    nan_seconds: u64,
    state_offset: u64,
}

impl DataSource {
    /// Encoded size of one datasource.
    pub(crate) const ENCODED_SIZE: u64 =
        2 * FieldKind::Str.size() + 4 * FieldKind::Double.size() + 2 * FieldKind::Int64.size();

    /// Creates the runtime state for a new database.
    ///
    /// Seconds between the start of the first base step and `start_time`
    /// predate the database and count as unknown.
    pub(crate) fn new(def: &DsDef, start_time: u64, step: u64) -> Self {
        Self {
            name: def.name.clone(),
            ds_type: def.ds_type,
            heartbeat: def.heartbeat,
            min: def.min.unwrap_or(f64::NAN),
            max: def.max.unwrap_or(f64::NAN),
            last_value: f64::NAN,
            accum_value: 0.0,
            nan_seconds: start_time - normalize(start_time, step),
            state_offset: 0,
        }
    }

    /// Placeholder filled in by a decoder.
    pub(crate) fn empty() -> Self {
        Self {
            name: String::new(),
            ds_type: DsType::Gauge,
            heartbeat: 0,
            min: f64::NAN,
            max: f64::NAN,
            last_value: f64::NAN,
            accum_value: 0.0,
            nan_seconds: 0,
            state_offset: 0,
        }
    }

    /// Datasource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Datasource type.
    pub fn ds_type(&self) -> DsType {
        self.ds_type
    }

    /// Heartbeat in seconds.
    pub fn heartbeat(&self) -> u64 {
        self.heartbeat
    }

    /// Lower bound, NaN when unset.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Upper bound, NaN when unset.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Last raw reading, NaN before the first update.
    pub fn last_value(&self) -> f64 {
        self.last_value
    }

    /// Accumulated `rate * seconds` of the current base step.
    pub fn accum_value(&self) -> f64 {
        self.accum_value
    }

    /// Unknown seconds in the current base step.
    pub fn nan_seconds(&self) -> u64 {
        self.nan_seconds
    }

    /// Rebuilds the definition this datasource was created from.
    pub fn to_def(&self) -> DsDef {
        DsDef {
            name: self.name.clone(),
            ds_type: self.ds_type,
            heartbeat: self.heartbeat,
            min: (!self.min.is_nan()).then_some(self.min),
            max: (!self.max.is_nan()).then_some(self.max),
        }
    }

    pub(crate) fn restore_state(&mut self, last_value: f64, accum_value: f64, nan_seconds: u64) {
        self.last_value = last_value;
        self.accum_value = accum_value;
        self.nan_seconds = nan_seconds;
    }

    /// Feeds one raw reading taken at `time`.
    ///
    /// `last_update` is the database's previous update time and must be
    /// strictly less than `time`. Returns the completed PDP and the number
    /// of base steps it covers; the step count is zero when no base-step
    /// boundary was crossed and the PDP is still accumulating.
    pub fn process(&mut self, last_update: u64, step: u64, time: u64, raw: f64) -> (f64, u64) {
        debug_assert!(time > last_update);
        let step_start = normalize(last_update, step);
        let step_end = step_start + step;
        let rate = self.rate(time - last_update, raw);

        if time < step_end {
            self.accumulate(time - last_update, rate);
            return (f64::NAN, 0);
        }

        let boundary = normalize(time, step);
        self.accumulate(boundary - last_update, rate);
        let pdp = self.take_pdp(boundary - step_start);
        let steps = (boundary - step_end) / step + 1;
        self.accumulate(time - boundary, rate);
        (pdp, steps)
    }

    #[allow(clippy::cast_precision_loss)]
    fn rate(&mut self, elapsed: u64, raw: f64) -> f64 {
        let seconds = elapsed as f64;
        let rate = if elapsed > self.heartbeat {
            f64::NAN
        } else {
            match self.ds_type {
                DsType::Gauge => raw,
                DsType::Absolute => raw / seconds,
                DsType::Derive => (raw - self.last_value) / seconds,
                DsType::Counter => {
                    let delta = raw - self.last_value;
                    if delta < 0.0 { f64::NAN } else { delta / seconds }
                }
            }
        };
        self.last_value = raw;

        if rate < self.min || rate > self.max {
            f64::NAN
        } else {
            rate
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn accumulate(&mut self, seconds: u64, rate: f64) {
        if rate.is_nan() {
            self.nan_seconds += seconds;
        } else {
            self.accum_value += rate * seconds as f64;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn take_pdp(&mut self, span: u64) -> f64 {
        let known = span.saturating_sub(self.nan_seconds);
        let pdp = if self.nan_seconds <= self.heartbeat && known > 0 {
            self.accum_value / known as f64
        } else {
            f64::NAN
        };
        self.accum_value = 0.0;
        self.nan_seconds = 0;
        pdp
    }

    fn visit_state<V: FieldVisitor>(&mut self, v: &mut V) -> Result<()> {
        v.double(&mut self.last_value)?;
        v.double(&mut self.accum_value)?;
        v.int64(&mut self.nan_seconds)
    }

    /// Writes the accumulation state back to storage.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the slab.
    pub(crate) fn flush(&mut self, slab: &mut Slab) -> Result<()> {
        let offset = self.state_offset;
        self.visit_state(&mut Encoder::at(slab, offset))
    }
}

impl Fields for DataSource {
    fn visit<V: FieldVisitor>(&mut self, v: &mut V) -> Result<()> {
        v.string(&mut self.name)?;
        v.tag(&mut self.ds_type)?;
        v.int64(&mut self.heartbeat)?;
        v.double(&mut self.min)?;
        v.double(&mut self.max)?;
        self.state_offset = v.position();
        self.visit_state(v)
    }
}
