//! Archives: one consolidation tier over every datasource.
//!
//! An archive folds `steps` consecutive primary data points into one row
//! with its consolidation function and keeps the last `rows` rows per
//! datasource in a [`Robin`]. The row covering `(t - arc_step, t]` is
//! stamped with `t`, where `t` is a multiple of the archive step.
//!
//! # Design
//!
//! Each (archive, datasource) pair owns an [`ArcState`] accumulator:
//!
//! ```text
//! PDP ──fold──▶ ArcState ──boundary──▶ finalize ──store──▶ Robin
//!                  ▲                       │
//!                  └──────── reset ────────┘
//! ```
//!
//! A row is known only if its unknown PDP count is at most `xff * steps`.
//! After a long gap the same PDP is repeated for many base steps; once the
//! first boundary is crossed, whole rows are written straight into the
//! robin instead of being folded tick by tick.

use tracing::trace;

use crate::definition::{ArcDef, ConsolFun};
use crate::error::{FormatError, Result, ValidationError};
use crate::field::{Encoder, FieldKind, FieldVisitor, Fields};
use crate::normalize;
use crate::robin::Robin;
use crate::slab::Slab;

/// Encoded size of the archive definition fields.
const DEF_SIZE: u64 = FieldKind::Str.size()
    + FieldKind::Double.size()
    + FieldKind::Int32.size()
    + FieldKind::Int32.size();

/// Largest number of points a single fetch may produce.
pub const MAX_FETCH_POINTS: u64 = 1 << 24;

/// Encoded size of one [`ArcState`].
const STATE_SIZE: u64 = FieldKind::Double.size() + FieldKind::Int32.size();

/// Consolidation accumulator for one (archive, datasource) pair.
#[derive(Debug, Clone)]
pub struct ArcState {
    accum_value: f64,
    nan_steps: u32,
    offset: u64,
}

impl ArcState {
    fn new(nan_steps: u32) -> Self {
        Self {
            accum_value: f64::NAN,
            nan_steps,
            offset: 0,
        }
    }

    /// Folded value of the current row, NaN if nothing known was folded.
    pub fn accum_value(&self) -> f64 {
        self.accum_value
    }

    /// Unknown PDPs folded into the current row.
    pub fn nan_steps(&self) -> u32 {
        self.nan_steps
    }

    pub(crate) fn restore(&mut self, accum_value: f64, nan_steps: u32) {
        self.accum_value = accum_value;
        self.nan_steps = nan_steps;
    }

    fn fold(&mut self, consol_fun: ConsolFun, value: f64) {
        if value.is_nan() {
            self.nan_steps += 1;
        } else {
            self.accum_value = consol_fun.fold(self.accum_value, value);
        }
    }

    fn finalize(&mut self, consol_fun: ConsolFun, xff: f64, steps: u32) -> f64 {
        let tolerated = f64::from(self.nan_steps) <= xff * f64::from(steps);
        let value = if tolerated && !self.accum_value.is_nan() {
            match consol_fun {
                ConsolFun::Average => {
                    self.accum_value / f64::from(steps.saturating_sub(self.nan_steps))
                }
                ConsolFun::Min | ConsolFun::Max | ConsolFun::Last => self.accum_value,
            }
        } else {
            f64::NAN
        };
        self.accum_value = f64::NAN;
        self.nan_steps = 0;
        value
    }

    fn flush(&mut self, slab: &mut Slab) -> Result<()> {
        let mut encoder = Encoder::at(slab, self.offset);
        encoder.double(&mut self.accum_value)?;
        encoder.int32(&mut self.nan_steps)
    }
}

impl Fields for ArcState {
    fn visit<V: FieldVisitor>(&mut self, v: &mut V) -> Result<()> {
        self.offset = v.position();
        v.double(&mut self.accum_value)?;
        v.int32(&mut self.nan_steps)
    }
}

/// Time window an archive currently covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coverage {
    /// Timestamp of the oldest row.
    pub start: u64,
    /// Timestamp of the newest row.
    pub end: u64,
}

/// Snapshot of one archive's shape and coverage.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveInfo {
    /// Consolidation function.
    pub consol_fun: ConsolFun,
    /// Unknown-fraction tolerance.
    pub xff: f64,
    /// Base steps per row.
    pub steps: u32,
    /// Rows per datasource.
    pub rows: u32,
    /// Seconds per row.
    pub arc_step: u64,
    /// Timestamp of the oldest row.
    pub start_time: u64,
    /// Timestamp of the newest row.
    pub end_time: u64,
}

/// One consolidation tier.
#[derive(Debug, Clone)]
pub struct Archive {
    consol_fun: ConsolFun,
    xff: f64,
    steps: u32,
    rows: u32,
    base_step: u64,
    ds_count: usize,
    states: Vec<ArcState>,
    robins: Vec<Robin>,
}

impl Archive {
    /// Creates an empty archive for a new database.
    ///
    /// Base steps between the start of the first archive row and
    /// `start_time` predate the database and count as unknown.
    pub(crate) fn new(def: &ArcDef, ds_count: usize, base_step: u64, start_time: u64) -> Self {
        let arc_step = base_step * u64::from(def.steps);
        let skipped = (normalize(start_time, base_step) - normalize(start_time, arc_step)) / base_step;
        // Always below `steps`, which is a u32.
        #[allow(clippy::cast_possible_truncation)]
        let state = ArcState::new(skipped as u32);
        Self {
            consol_fun: def.consol_fun,
            xff: def.xff,
            steps: def.steps,
            rows: def.rows,
            base_step,
            ds_count,
            states: vec![state; ds_count],
            robins: vec![Robin::new(def.rows); ds_count],
        }
    }

    /// Placeholder filled in by a decoder.
    pub(crate) fn empty(ds_count: usize, base_step: u64) -> Self {
        Self {
            consol_fun: ConsolFun::Average,
            xff: 0.0,
            steps: 0,
            rows: 0,
            base_step,
            ds_count,
            states: Vec::new(),
            robins: Vec::new(),
        }
    }

    /// Smallest possible encoding of one archive.
    pub(crate) fn min_encoded_size(ds_count: usize) -> u64 {
        DEF_SIZE + ds_count as u64 * (STATE_SIZE + Robin::encoded_size(1))
    }

    /// Consolidation function.
    pub fn consol_fun(&self) -> ConsolFun {
        self.consol_fun
    }

    /// Unknown-fraction tolerance.
    pub fn xff(&self) -> f64 {
        self.xff
    }

    /// Base steps per row.
    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// Rows per datasource.
    pub fn rows(&self) -> u32 {
        self.rows
    }

    /// Seconds per row.
    pub fn arc_step(&self) -> u64 {
        self.base_step * u64::from(self.steps)
    }

    /// Rows currently held, oldest first, for the given last update time.
    pub fn coverage(&self, last_update: u64) -> Coverage {
        let arc_step = self.arc_step();
        let end = normalize(last_update, arc_step);
        let start = end.saturating_sub(u64::from(self.rows - 1) * arc_step);
        Coverage { start, end }
    }

    /// Shape and coverage for the given last update time.
    pub fn info(&self, last_update: u64) -> ArchiveInfo {
        let coverage = self.coverage(last_update);
        ArchiveInfo {
            consol_fun: self.consol_fun,
            xff: self.xff,
            steps: self.steps,
            rows: self.rows,
            arc_step: self.arc_step(),
            start_time: coverage.start,
            end_time: coverage.end,
        }
    }

    /// Accumulator of datasource `ds`.
    pub fn state(&self, ds: usize) -> &ArcState {
        &self.states[ds]
    }

    /// Robin of datasource `ds`.
    pub fn robin(&self, ds: usize) -> &Robin {
        &self.robins[ds]
    }

    pub(crate) fn state_mut(&mut self, ds: usize) -> &mut ArcState {
        &mut self.states[ds]
    }

    pub(crate) fn robin_mut(&mut self, ds: usize) -> &mut Robin {
        &mut self.robins[ds]
    }

    /// Rebuilds the definition this archive was created from.
    pub fn to_def(&self) -> ArcDef {
        ArcDef {
            consol_fun: self.consol_fun,
            xff: self.xff,
            steps: self.steps,
            rows: self.rows,
        }
    }

    /// Folds `num_updates` copies of the PDP `value` for datasource `ds`.
    ///
    /// `last_update` is the database time before the update that produced
    /// the PDP; the first folded tick is the base step right after it.
    pub fn archive(&mut self, ds: usize, value: f64, num_updates: u64, last_update: u64) {
        let arc_step = self.arc_step();
        let steps = u64::from(self.steps);
        let (consol_fun, xff) = (self.consol_fun, self.xff);
        let state = &mut self.states[ds];
        let robin = &mut self.robins[ds];

        let mut tick = normalize(last_update, self.base_step) + self.base_step;
        let mut remaining = num_updates;
        while remaining > 0 {
            state.fold(consol_fun, value);
            remaining -= 1;
            if tick % arc_step == 0 {
                let row = state.finalize(consol_fun, xff, self.steps);
                trace!(consol_fun = %consol_fun, steps, ds, tick, row, "archive row");
                robin.store(row);
                break;
            }
            tick += self.base_step;
        }

        let bulk = (remaining / steps).min(u64::from(self.rows));
        if bulk > 0 {
            trace!(consol_fun = %consol_fun, steps, ds, bulk, "bulk archive rows");
            robin.bulk_store(value, bulk);
        }

        for _ in 0..remaining % steps {
            state.fold(consol_fun, value);
        }
    }

    /// Extracts one point per aligned timestamp in `[start, end]`.
    ///
    /// The window is widened outward to this archive's step grid. Timestamps
    /// outside the coverage window yield NaN. Returns the timestamps and one
    /// column per entry of `ds_indices`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::FetchWindowTooLarge`] if the widened window
    /// overflows or holds more than [`MAX_FETCH_POINTS`] points.
    #[allow(clippy::cast_possible_truncation)]
    pub fn fetch(
        &self,
        start: u64,
        end: u64,
        ds_indices: &[usize],
        last_update: u64,
    ) -> Result<(Vec<u64>, Vec<Vec<f64>>)> {
        let arc_step = self.arc_step();
        let too_large = || ValidationError::FetchWindowTooLarge {
            start,
            end,
            step: arc_step,
        };
        let (fetch_start, fetch_end) = align_window(start, end, arc_step).ok_or_else(too_large)?;
        let points = (fetch_end - fetch_start) / arc_step + 1;
        if points > MAX_FETCH_POINTS {
            return Err(too_large().into());
        }
        let timestamps: Vec<u64> = (0..points).map(|i| fetch_start + i * arc_step).collect();

        let coverage = self.coverage(last_update);
        let columns = ds_indices
            .iter()
            .map(|&ds| {
                let robin = &self.robins[ds];
                timestamps
                    .iter()
                    .map(|&time| {
                        if time < coverage.start || time > coverage.end {
                            f64::NAN
                        } else {
                            let from_newest = ((coverage.end - time) / arc_step) as u32;
                            robin.get_value(self.rows - 1 - from_newest)
                        }
                    })
                    .collect()
            })
            .collect();
        Ok((timestamps, columns))
    }

    /// Writes every accumulator and robin back to storage.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the slab.
    pub(crate) fn flush(&mut self, slab: &mut Slab) -> Result<()> {
        for state in &mut self.states {
            state.flush(slab)?;
        }
        for robin in &mut self.robins {
            robin.flush(slab)?;
        }
        Ok(())
    }

    fn check_definition(&self) -> Result<()> {
        if self.steps > 0 && self.rows > 0 && (0.0..1.0).contains(&self.xff) {
            return Ok(());
        }
        Err(FormatError::CorruptField {
            reason: format!(
                "archive {}: steps {}, rows {}, xff {}",
                self.consol_fun, self.steps, self.rows, self.xff
            ),
        }
        .into())
    }
}

impl Fields for Archive {
    fn visit<V: FieldVisitor>(&mut self, v: &mut V) -> Result<()> {
        v.tag(&mut self.consol_fun)?;
        v.double(&mut self.xff)?;
        v.int32(&mut self.steps)?;
        v.int32(&mut self.rows)?;
        self.check_definition()?;

        let ds_count = self.ds_count as u64;
        v.expect_remaining(ds_count * (STATE_SIZE + Robin::encoded_size(self.rows)))?;
        if self.states.len() != self.ds_count {
            self.states = vec![ArcState::new(0); self.ds_count];
        }
        if self.robins.len() != self.ds_count {
            self.robins = vec![Robin::new(self.rows); self.ds_count];
        }

        for state in &mut self.states {
            state.visit(v)?;
        }
        for robin in &mut self.robins {
            robin.visit(v)?;
        }
        Ok(())
    }
}

/// Widens `[start, end]` outward to multiples of `step`, or `None` if the
/// widened end does not fit in a `u64`.
pub(crate) fn align_window(start: u64, end: u64, step: u64) -> Option<(u64, u64)> {
    let fetch_start = normalize(start, step);
    let fetch_end = normalize(end, step);
    if fetch_end < end {
        return Some((fetch_start, fetch_end.checked_add(step)?));
    }
    Some((fetch_start, fetch_end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RrdError;

    const STEP: u64 = 300;
    const T0: u64 = 920_805_000;

    fn archive(consol_fun: ConsolFun, xff: f64, steps: u32, rows: u32) -> Archive {
        let def = ArcDef::new(consol_fun, xff, steps, rows).unwrap();
        // Start on an archive boundary so no tick predates the database.
        let start = normalize(T0, STEP * u64::from(steps));
        Archive::new(&def, 1, STEP, start)
    }

    /// Feeds one PDP per base step, starting right after `start`.
    fn feed(arc: &mut Archive, start: u64, values: &[f64]) -> u64 {
        let mut last = start;
        for &value in values {
            arc.archive(0, value, 1, last);
            last += STEP;
        }
        last
    }

    fn same(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len()
            && a.iter()
                .zip(b)
                .all(|(x, y)| x == y || (x.is_nan() && y.is_nan()))
    }

    #[test]
    fn test_consolidation_functions() {
        let values = [4.0, f64::NAN, 2.0, 8.0];
        let expected = [
            (ConsolFun::Average, 14.0 / 3.0),
            (ConsolFun::Min, 2.0),
            (ConsolFun::Max, 8.0),
            (ConsolFun::Last, 8.0),
        ];
        for (cf, want) in expected {
            let mut arc = archive(cf, 0.5, 4, 3);
            let start = normalize(T0, STEP * 4);
            feed(&mut arc, start, &values);
            let newest = arc.robin(0).get_value(2);
            assert!((newest - want).abs() < 1e-12, "{cf}: {newest}");
        }
    }

    #[test]
    fn test_tolerance_boundary() {
        // steps 4, xff 0.5: two unknown ticks are tolerated, three are not.
        let start = normalize(T0, STEP * 4);
        let mut arc = archive(ConsolFun::Average, 0.5, 4, 2);
        feed(&mut arc, start, &[f64::NAN, 1.0, f64::NAN, 3.0]);
        assert_eq!(arc.robin(0).get_value(1), 2.0);

        let mut arc = archive(ConsolFun::Average, 0.5, 4, 2);
        feed(&mut arc, start, &[f64::NAN, 1.0, f64::NAN, f64::NAN]);
        assert!(arc.robin(0).get_value(1).is_nan());
    }

    #[test]
    fn test_row_flushes_on_archive_boundary_only() {
        let start = normalize(T0, STEP * 3);
        let mut arc = archive(ConsolFun::Max, 0.0, 3, 2);
        feed(&mut arc, start, &[1.0, 5.0]);
        assert!(arc.robin(0).values().iter().all(|v| v.is_nan()));
        assert_eq!(arc.state(0).accum_value(), 5.0);

        feed(&mut arc, start + 2 * STEP, &[2.0]);
        assert_eq!(arc.robin(0).get_value(1), 5.0);
        assert!(arc.state(0).accum_value().is_nan());
        assert_eq!(arc.state(0).nan_steps(), 0);
    }

    #[test]
    fn test_bulk_path_matches_tick_by_tick() {
        for (steps, rows, lead, count) in [(1, 4, 0, 9), (3, 5, 1, 14), (4, 3, 2, 40), (2, 6, 0, 5)] {
            let start = normalize(T0, STEP * u64::from(steps));
            let mut bulk = archive(ConsolFun::Average, 0.5, steps, rows);
            let mut ticks = archive(ConsolFun::Average, 0.5, steps, rows);

            let leading = vec![1.0; lead];
            let last = feed(&mut bulk, start, &leading);
            feed(&mut ticks, start, &leading);

            bulk.archive(0, 6.0, count, last);
            feed(&mut ticks, last, &vec![6.0; count as usize]);

            assert!(
                same(&bulk.robin(0).values(), &ticks.robin(0).values()),
                "steps {steps} rows {rows} lead {lead} count {count}"
            );
            assert_eq!(bulk.state(0).nan_steps(), ticks.state(0).nan_steps());
            assert!(same(
                &[bulk.state(0).accum_value()],
                &[ticks.state(0).accum_value()]
            ));
        }
    }

    #[test]
    fn test_start_inside_archive_step_counts_unknown_ticks() {
        let def = ArcDef::new(ConsolFun::Average, 0.5, 4, 2).unwrap();
        let row_start = normalize(T0, STEP * 4);
        let arc = Archive::new(&def, 1, STEP, row_start + 2 * STEP + 17);
        assert_eq!(arc.state(0).nan_steps(), 2);
    }

    #[test]
    fn test_coverage_window() {
        let arc = archive(ConsolFun::Average, 0.5, 2, 5);
        let last = normalize(T0, 600) + 450;
        let coverage = arc.coverage(last);
        assert_eq!(coverage.end, normalize(T0, 600));
        assert_eq!(coverage.start, coverage.end - 4 * 600);
    }

    #[test]
    fn test_fetch_pads_outside_coverage_with_nan() {
        let start = normalize(T0, STEP);
        let mut arc = archive(ConsolFun::Last, 0.5, 1, 3);
        let last = feed(&mut arc, start, &[1.0, 2.0, 3.0, 4.0]);

        let (timestamps, columns) = arc
            .fetch(last - 3 * STEP, last + 2 * STEP, &[0], last)
            .unwrap();
        assert_eq!(timestamps.len(), 6);
        assert!(timestamps.windows(2).all(|w| w[1] - w[0] == STEP));
        assert!(same(
            &columns[0],
            &[f64::NAN, 2.0, 3.0, 4.0, f64::NAN, f64::NAN]
        ));
    }

    #[test]
    fn test_align_window_rounds_outward() {
        assert_eq!(align_window(650, 1250, 300), Some((600, 1500)));
        assert_eq!(align_window(600, 1200, 300), Some((600, 1200)));
        assert_eq!(align_window(0, 0, 300), Some((0, 0)));
        assert_eq!(align_window(0, u64::MAX, 300), None);
    }

    #[test]
    fn test_oversized_fetch_is_rejected() {
        let start = normalize(T0, STEP);
        let mut arc = archive(ConsolFun::Average, 0.5, 1, 3);
        let last = feed(&mut arc, start, &[1.0, 2.0]);

        for end in [u64::MAX, u64::MAX - STEP + 1] {
            assert!(matches!(
                arc.fetch(start, end, &[0], last),
                Err(RrdError::Validation(ValidationError::FetchWindowTooLarge { .. }))
            ));
        }
        // Representable, but one point more than a single fetch may hold.
        let wide = start + MAX_FETCH_POINTS * STEP;
        assert!(arc.fetch(start, wide, &[0], last).is_err());
    }
}
