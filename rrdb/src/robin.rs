//! Fixed-capacity circular buffer of consolidated values.
//!
//! A robin is always logically full: it starts NaN-filled and every store
//! overwrites the oldest slot. There is no length field, only a write
//! pointer, so `get_value(0)` is always the oldest row and
//! `get_value(rows - 1)` the newest.
//!
//! # Design
//!
//! Values live in memory. Stores mark a contiguous (possibly wrapping)
//! dirty segment starting at the first slot written since the last flush,
//! and [`Robin::flush`] writes only that segment plus the pointer.

use crate::error::{FormatError, Result};
use crate::field::{Encoder, FieldKind, FieldVisitor, Fields};
use crate::slab::Slab;

/// One circular buffer.
#[derive(Debug, Clone)]
pub struct Robin {
    pointer: u32,
    values: Vec<f64>,
    offset: u64,
    dirty: Option<Dirty>,
}

/// Slots written since the last flush: `count` slots from `start`, wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Dirty {
    start: usize,
    count: usize,
}

impl Robin {
    /// Creates a NaN-filled robin with `rows` slots.
    pub(crate) fn new(rows: u32) -> Self {
        Self {
            pointer: 0,
            values: vec![f64::NAN; rows as usize],
            offset: 0,
            dirty: None,
        }
    }

    /// Encoded size of a robin with `rows` slots.
    pub(crate) fn encoded_size(rows: u32) -> u64 {
        FieldKind::Int32.size() + u64::from(rows) * FieldKind::Double.size()
    }

    /// Number of slots.
    #[allow(clippy::cast_possible_truncation)]
    pub fn rows(&self) -> u32 {
        // Never exceeds the u32 row count it was built from.
        self.values.len() as u32
    }

    /// Physical index of the next slot to be written.
    pub fn pointer(&self) -> u32 {
        self.pointer
    }

    /// Stores `value` in the oldest slot and advances the pointer.
    pub fn store(&mut self, value: f64) {
        let slot = self.pointer as usize;
        self.values[slot] = value;
        self.mark_dirty(slot);
        self.pointer = (self.pointer + 1) % self.rows();
    }

    /// Stores `value` `count` times.
    ///
    /// Only the last `rows` stores are observable, so at most `rows` slots
    /// are written; the pointer still advances as if all `count` happened.
    pub fn bulk_store(&mut self, value: f64, count: u64) {
        let rows = u64::from(self.rows());
        let skipped = count.saturating_sub(rows);
        if skipped > 0 {
            #[allow(clippy::cast_possible_truncation)]
            let advance = (skipped % rows) as u32;
            self.pointer = (self.pointer + advance) % self.rows();
        }
        for _ in 0..count.min(rows) {
            self.store(value);
        }
    }

    /// Returns the `index`-th value in oldest-to-newest order.
    ///
    /// # Panics
    ///
    /// Panics if `index >= rows`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn get_value(&self, index: u32) -> f64 {
        assert!(index < self.rows(), "robin index {index} out of range");
        let slot = (u64::from(self.pointer) + u64::from(index)) % u64::from(self.rows());
        self.values[slot as usize]
    }

    /// Returns all values, oldest first.
    pub fn values(&self) -> Vec<f64> {
        let split = self.pointer as usize;
        let mut ordered = Vec::with_capacity(self.values.len());
        ordered.extend_from_slice(&self.values[split..]);
        ordered.extend_from_slice(&self.values[..split]);
        ordered
    }

    /// Returns `count` values starting at logical index `start`, or `None`
    /// if the range runs past the newest row.
    pub fn get_values(&self, start: u32, count: u32) -> Option<Vec<f64>> {
        let end = start.checked_add(count).filter(|&end| end <= self.rows())?;
        Some((start..end).map(|index| self.get_value(index)).collect())
    }

    fn mark_dirty(&mut self, slot: usize) {
        let rows = self.values.len();
        self.dirty = Some(match self.dirty {
            None => Dirty {
                start: slot,
                count: 1,
            },
            Some(dirty) => Dirty {
                start: dirty.start,
                count: (dirty.count + 1).min(rows),
            },
        });
    }

    /// Writes the pointer and any dirty slots back to storage.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the slab.
    pub(crate) fn flush(&mut self, slab: &mut Slab) -> Result<()> {
        Encoder::at(slab, self.offset).int32(&mut self.pointer)?;

        let Some(dirty) = self.dirty.take() else {
            return Ok(());
        };
        let rows = self.values.len();
        let values_offset = self.offset + FieldKind::Int32.size();
        let end = dirty.start + dirty.count;
        let mut write = |from: usize, to: usize, values: &mut [f64]| {
            let offset = values_offset + from as u64 * FieldKind::Double.size();
            Encoder::at(slab, offset).doubles(&mut values[from..to])
        };
        if end <= rows {
            write(dirty.start, end, self.values.as_mut_slice())?;
        } else {
            write(dirty.start, rows, self.values.as_mut_slice())?;
            write(0, end - rows, self.values.as_mut_slice())?;
        }
        Ok(())
    }
}

impl Fields for Robin {
    fn visit<V: FieldVisitor>(&mut self, v: &mut V) -> Result<()> {
        self.offset = v.position();
        v.int32(&mut self.pointer)?;
        if self.pointer >= self.rows() {
            return Err(FormatError::CorruptField {
                reason: format!(
                    "robin at offset {}: pointer {} outside {} rows",
                    self.offset,
                    self.pointer,
                    self.rows()
                ),
            }
            .into());
        }
        v.doubles(&mut self.values)?;
        self.dirty = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{Decoder, encoded_size};
    use crate::slab::{BackendKind, LockMode};

    fn logical(robin: &Robin) -> Vec<f64> {
        (0..robin.rows()).map(|i| robin.get_value(i)).collect()
    }

    fn written(rows: u32, stores: &[f64]) -> (Robin, Slab) {
        let mut robin = Robin::new(rows);
        let size = encoded_size(&mut robin).unwrap();
        let mut slab = Slab::create("memory", size, BackendKind::Memory, LockMode::Disabled).unwrap();
        robin.visit(&mut Encoder::at(&mut slab, 0)).unwrap();
        for &value in stores {
            robin.store(value);
        }
        robin.flush(&mut slab).unwrap();
        (robin, slab)
    }

    #[test]
    fn test_new_robin_is_nan_filled() {
        let robin = Robin::new(4);
        assert_eq!(robin.rows(), 4);
        assert!(robin.values().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_ring_returns_last_n_in_order() {
        let mut robin = Robin::new(3);
        for value in 1..=7 {
            robin.store(f64::from(value));
        }
        assert_eq!(logical(&robin), vec![5.0, 6.0, 7.0]);
        assert_eq!(robin.values(), vec![5.0, 6.0, 7.0]);
        assert_eq!(robin.pointer(), 1);
        assert_eq!(robin.get_values(1, 2), Some(vec![6.0, 7.0]));
    }

    #[test]
    fn test_get_values_outside_the_ring() {
        let mut robin = Robin::new(3);
        for value in 1..=4 {
            robin.store(f64::from(value));
        }
        assert_eq!(robin.get_values(0, 3), Some(vec![2.0, 3.0, 4.0]));
        assert_eq!(robin.get_values(3, 0), Some(vec![]));
        assert_eq!(robin.get_values(2, 2), None);
        assert_eq!(robin.get_values(4, 0), None);
        assert_eq!(robin.get_values(1, u32::MAX), None);
    }

    #[test]
    fn test_partially_filled_ring_keeps_nan_prefix() {
        let mut robin = Robin::new(4);
        robin.store(1.0);
        robin.store(2.0);
        let values = robin.values();
        assert!(values[0].is_nan() && values[1].is_nan());
        assert_eq!(&values[2..], &[1.0, 2.0]);
    }

    #[test]
    fn test_bulk_store_matches_repeated_store() {
        for count in [0, 1, 3, 5, 11] {
            let mut bulk = Robin::new(5);
            let mut ticks = Robin::new(5);
            for robin in [&mut bulk, &mut ticks] {
                robin.store(1.0);
                robin.store(2.0);
            }
            bulk.bulk_store(9.0, count);
            for _ in 0..count {
                ticks.store(9.0);
            }
            assert_eq!(bulk.pointer(), ticks.pointer(), "count {count}");
            let (b, t) = (bulk.values(), ticks.values());
            for (x, y) in b.iter().zip(&t) {
                assert!(x == y || (x.is_nan() && y.is_nan()), "count {count}");
            }
        }
    }

    #[test]
    fn test_flush_writes_wrapping_segment() {
        let (robin, mut slab) = written(4, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let mut decoded = Robin::new(4);
        decoded.visit(&mut Decoder::at(&mut slab, 0)).unwrap();
        assert_eq!(decoded.pointer(), robin.pointer());
        assert_eq!(decoded.values(), vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_incremental_flushes_persist_everything() {
        let (mut robin, mut slab) = written(3, &[1.0]);
        robin.store(2.0);
        robin.flush(&mut slab).unwrap();
        robin.store(3.0);
        robin.store(4.0);
        robin.flush(&mut slab).unwrap();

        let mut decoded = Robin::new(3);
        decoded.visit(&mut Decoder::at(&mut slab, 0)).unwrap();
        assert_eq!(decoded.values(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_out_of_range_pointer_is_corrupt() {
        let (_, mut slab) = written(2, &[]);
        let mut pointer = 7u32;
        Encoder::at(&mut slab, 0).int32(&mut pointer).unwrap();

        let mut decoded = Robin::new(2);
        assert!(decoded.visit(&mut Decoder::at(&mut slab, 0)).is_err());
    }
}
