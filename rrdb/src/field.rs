//! Typed fixed-width fields and the ordered-field descriptor.
//!
//! The database file has no embedded schema: its layout is the order in
//! which fields are visited. Every persistent struct implements [`Fields`]
//! once, and that single `visit` method drives all three passes:
//!
//! - [`Allocator`] walks the fields to compute offsets and the file size
//! - [`Encoder`] writes the in-memory values into a [`Slab`]
//! - [`Decoder`] reads them back in the same order
//!
//! Because the same code produces both directions, the read path cannot
//! drift from the write path.
//!
//! # Field Encoding
//!
//! ```text
//! int32   4 bytes, big-endian
//! int64   8 bytes, big-endian
//! double  8 bytes, IEEE-754 big-endian
//! string  40 bytes: 20 UTF-16 code units, big-endian, space-padded
//! ```

use std::fmt::Display;
use std::str::FromStr;

use crate::error::{FormatError, Result, ValidationError};
use crate::slab::Slab;

/// Number of UTF-16 code units in a string field.
pub const STRING_LENGTH: usize = 20;

/// Padding unit for string fields.
const PAD: u16 = b' ' as u16;

/// Primitive field types and their encoded widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// 32-bit unsigned integer.
    Int32,
    /// 64-bit unsigned integer.
    Int64,
    /// 64-bit float.
    Double,
    /// Fixed-width string.
    Str,
}

impl FieldKind {
    /// Encoded width in bytes.
    pub const fn size(self) -> u64 {
        match self {
            Self::Int32 => 4,
            Self::Int64 | Self::Double => 8,
            Self::Str => (STRING_LENGTH * 2) as u64,
        }
    }
}

/// One pass over an ordered sequence of fields.
pub trait FieldVisitor {
    /// Offset of the next field.
    fn position(&self) -> u64;

    /// Visits a 32-bit integer field.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the underlying slab.
    fn int32(&mut self, value: &mut u32) -> Result<()>;

    /// Visits a 64-bit integer field.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the underlying slab.
    fn int64(&mut self, value: &mut u64) -> Result<()>;

    /// Visits a double field.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the underlying slab.
    fn double(&mut self, value: &mut f64) -> Result<()>;

    /// Visits a fixed-width string field.
    ///
    /// # Errors
    ///
    /// Returns storage errors, or [`FormatError::CorruptField`] if the value
    /// does not fit or does not decode.
    fn string(&mut self, value: &mut String) -> Result<()>;

    /// Visits a run of consecutive double fields.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the underlying slab.
    fn doubles(&mut self, values: &mut [f64]) -> Result<()> {
        for value in values {
            self.double(value)?;
        }
        Ok(())
    }

    /// Checks that `bytes` more bytes can be visited. Only the decoder can
    /// fail here; it uses this to reject corrupt sizes before allocating.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Truncated`] if the bytes are not there.
    fn expect_remaining(&self, bytes: u64) -> Result<()> {
        let _ = bytes;
        Ok(())
    }

    /// Visits an enum stored as its string name.
    ///
    /// # Errors
    ///
    /// Returns the string field's errors, or the parse error of `T`.
    fn tag<T>(&mut self, value: &mut T) -> Result<()>
    where
        T: Display + FromStr<Err = ValidationError>,
    {
        let mut text = value.to_string();
        self.string(&mut text)?;
        *value = text.parse()?;
        Ok(())
    }
}

/// A struct with a fixed, ordered field layout.
pub trait Fields {
    /// Visits every persistent field in file order.
    ///
    /// # Errors
    ///
    /// Returns the visitor's errors.
    fn visit<V: FieldVisitor>(&mut self, visitor: &mut V) -> Result<()>;
}

/// Computes offsets without touching storage.
#[derive(Debug, Default, Clone, Copy)]
pub struct Allocator {
    cursor: u64,
}

impl Allocator {
    /// Starts allocating at offset zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves one field and returns its offset.
    pub fn allocate(&mut self, kind: FieldKind) -> u64 {
        let offset = self.cursor;
        self.cursor += kind.size();
        offset
    }

    /// Total bytes allocated so far.
    pub fn size(&self) -> u64 {
        self.cursor
    }
}

impl FieldVisitor for Allocator {
    fn position(&self) -> u64 {
        self.cursor
    }

    fn int32(&mut self, _value: &mut u32) -> Result<()> {
        self.allocate(FieldKind::Int32);
        Ok(())
    }

    fn int64(&mut self, _value: &mut u64) -> Result<()> {
        self.allocate(FieldKind::Int64);
        Ok(())
    }

    fn double(&mut self, _value: &mut f64) -> Result<()> {
        self.allocate(FieldKind::Double);
        Ok(())
    }

    fn string(&mut self, _value: &mut String) -> Result<()> {
        self.allocate(FieldKind::Str);
        Ok(())
    }

    fn doubles(&mut self, values: &mut [f64]) -> Result<()> {
        self.cursor += values.len() as u64 * FieldKind::Double.size();
        Ok(())
    }
}

/// Computes the encoded size of a field sequence.
///
/// # Errors
///
/// Only propagates errors a `visit` implementation raises on its own.
pub fn encoded_size<F: Fields>(fields: &mut F) -> Result<u64> {
    let mut allocator = Allocator::new();
    fields.visit(&mut allocator)?;
    Ok(allocator.size())
}

/// Writes fields sequentially into a slab.
#[derive(Debug)]
pub struct Encoder<'a> {
    slab: &'a mut Slab,
    cursor: u64,
}

impl<'a> Encoder<'a> {
    /// Starts writing at `offset`.
    pub fn at(slab: &'a mut Slab, offset: u64) -> Self {
        Self {
            slab,
            cursor: offset,
        }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.slab.write(self.cursor, bytes)?;
        self.cursor += bytes.len() as u64;
        Ok(())
    }
}

impl FieldVisitor for Encoder<'_> {
    fn position(&self) -> u64 {
        self.cursor
    }

    fn int32(&mut self, value: &mut u32) -> Result<()> {
        self.put(&value.to_be_bytes())
    }

    fn int64(&mut self, value: &mut u64) -> Result<()> {
        self.put(&value.to_be_bytes())
    }

    fn double(&mut self, value: &mut f64) -> Result<()> {
        self.put(&value.to_be_bytes())
    }

    fn string(&mut self, value: &mut String) -> Result<()> {
        let units: Vec<u16> = value.encode_utf16().collect();
        if units.len() > STRING_LENGTH {
            return Err(FormatError::CorruptField {
                reason: format!("string '{value}' exceeds {STRING_LENGTH} characters"),
            }
            .into());
        }

        let mut bytes = [0u8; STRING_LENGTH * 2];
        let padded = units
            .into_iter()
            .chain(std::iter::repeat(PAD))
            .take(STRING_LENGTH);
        for (chunk, unit) in bytes.chunks_exact_mut(2).zip(padded) {
            chunk.copy_from_slice(&unit.to_be_bytes());
        }
        self.put(&bytes)
    }

    fn doubles(&mut self, values: &mut [f64]) -> Result<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
        self.put(&bytes)
    }
}

/// Reads fields sequentially from a slab.
#[derive(Debug)]
pub struct Decoder<'a> {
    slab: &'a mut Slab,
    cursor: u64,
}

impl<'a> Decoder<'a> {
    /// Starts reading at `offset`.
    pub fn at(slab: &'a mut Slab, offset: u64) -> Self {
        Self {
            slab,
            cursor: offset,
        }
    }

    /// Bytes left between the cursor and the end of the slab.
    pub fn remaining(&self) -> u64 {
        self.slab.len().saturating_sub(self.cursor)
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.slab.read(self.cursor, &mut buf)?;
        self.cursor += N as u64;
        Ok(buf)
    }
}

impl FieldVisitor for Decoder<'_> {
    fn position(&self) -> u64 {
        self.cursor
    }

    fn int32(&mut self, value: &mut u32) -> Result<()> {
        *value = u32::from_be_bytes(self.take()?);
        Ok(())
    }

    fn int64(&mut self, value: &mut u64) -> Result<()> {
        *value = u64::from_be_bytes(self.take()?);
        Ok(())
    }

    fn double(&mut self, value: &mut f64) -> Result<()> {
        *value = f64::from_be_bytes(self.take()?);
        Ok(())
    }

    fn string(&mut self, value: &mut String) -> Result<()> {
        let bytes: [u8; STRING_LENGTH * 2] = self.take()?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        let text = String::from_utf16(&units).map_err(|e| FormatError::CorruptField {
            reason: format!("string field at offset {}: {e}", self.cursor),
        })?;
        *value = text.trim().to_string();
        Ok(())
    }

    fn doubles(&mut self, values: &mut [f64]) -> Result<()> {
        let length = values.len() * 8;
        let mut bytes = vec![0u8; length];
        self.slab.read(self.cursor, &mut bytes)?;
        self.cursor += length as u64;
        for (value, chunk) in values.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *value = f64::from_be_bytes(raw);
        }
        Ok(())
    }

    fn expect_remaining(&self, bytes: u64) -> Result<()> {
        if bytes > self.remaining() {
            return Err(FormatError::Truncated {
                offset: self.cursor,
                length: bytes,
                file_size: self.slab.len(),
            }
            .into());
        }
        Ok(())
    }
}
