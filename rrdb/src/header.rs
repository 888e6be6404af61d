//! Database header: the first fields of every file.
//!
//! The header is the only place the file identifies itself. There is no
//! embedded schema version beyond the signature string, so [`Header::visit`]
//! rejects a foreign signature as soon as it is decoded, before any count
//! is trusted.

use crate::error::{FormatError, Result};
use crate::field::{Encoder, FieldVisitor, Fields};
use crate::slab::Slab;

/// Signature written into every new file.
pub const SIGNATURE: &str = "RRDB, version 0.1";

/// Prefix every readable signature starts with.
const SIGNATURE_PREFIX: &str = "RRDB";

/// Global metadata: step, counts, and last update time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    signature: String,
    step: u64,
    ds_count: u32,
    arc_count: u32,
    last_update_time: u64,
    last_update_offset: u64,
}

impl Header {
    /// Creates a header for a new file.
    pub(crate) fn new(step: u64, ds_count: u32, arc_count: u32, last_update_time: u64) -> Self {
        Self {
            signature: SIGNATURE.to_string(),
            step,
            ds_count,
            arc_count,
            last_update_time,
            last_update_offset: 0,
        }
    }

    /// Placeholder filled in by a decoder.
    pub(crate) fn empty() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// The signature read from or written to the file.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Base step in seconds.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Number of datasources.
    pub fn ds_count(&self) -> u32 {
        self.ds_count
    }

    /// Number of archives.
    pub fn arc_count(&self) -> u32 {
        self.arc_count
    }

    /// Time of the last accepted update.
    pub fn last_update_time(&self) -> u64 {
        self.last_update_time
    }

    pub(crate) fn set_last_update_time(&mut self, time: u64) {
        self.last_update_time = time;
    }

    /// Writes the only mutable header field back to storage.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the slab.
    pub(crate) fn flush(&mut self, slab: &mut Slab) -> Result<()> {
        Encoder::at(slab, self.last_update_offset).int64(&mut self.last_update_time)
    }

    fn check_signature(&self) -> Result<()> {
        if self.signature.starts_with(SIGNATURE_PREFIX) {
            return Ok(());
        }
        Err(FormatError::BadSignature {
            signature: self.signature.clone(),
        }
        .into())
    }

    fn check_counts(&self) -> Result<()> {
        let reason = if self.step == 0 {
            "step is zero"
        } else if self.ds_count == 0 {
            "datasource count is zero"
        } else if self.arc_count == 0 {
            "archive count is zero"
        } else {
            return Ok(());
        };
        Err(FormatError::CorruptField {
            reason: format!("header: {reason}"),
        }
        .into())
    }
}

impl Fields for Header {
    fn visit<V: FieldVisitor>(&mut self, v: &mut V) -> Result<()> {
        v.string(&mut self.signature)?;
        self.check_signature()?;
        v.int64(&mut self.step)?;
        v.int32(&mut self.ds_count)?;
        v.int32(&mut self.arc_count)?;
        self.last_update_offset = v.position();
        v.int64(&mut self.last_update_time)?;
        self.check_counts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RrdError;
    use crate::field::{Decoder, encoded_size};
    use crate::slab::{BackendKind, LockMode};

    fn memory_slab(size: u64) -> Slab {
        Slab::create("memory", size, BackendKind::Memory, LockMode::Disabled).unwrap()
    }

    #[test]
    fn test_header_size() {
        let mut header = Header::new(300, 2, 3, 1000);
        assert_eq!(encoded_size(&mut header).unwrap(), 40 + 8 + 4 + 4 + 8);
    }

    #[test]
    fn test_flush_only_rewrites_last_update() {
        let mut header = Header::new(300, 2, 3, 1000);
        let mut slab = memory_slab(64);
        header.visit(&mut Encoder::at(&mut slab, 0)).unwrap();

        header.set_last_update_time(1300);
        header.flush(&mut slab).unwrap();

        let mut decoded = Header::empty();
        decoded.visit(&mut Decoder::at(&mut slab, 0)).unwrap();
        assert_eq!(decoded.signature(), SIGNATURE);
        assert_eq!(decoded.step(), 300);
        assert_eq!(decoded.ds_count(), 2);
        assert_eq!(decoded.arc_count(), 3);
        assert_eq!(decoded.last_update_time(), 1300);
    }

    #[test]
    fn test_foreign_signature_is_rejected() {
        let mut slab = memory_slab(64);
        let mut text = "TSDB, version 2.0".to_string();
        Encoder::at(&mut slab, 0).string(&mut text).unwrap();

        let err = Header::empty()
            .visit(&mut Decoder::at(&mut slab, 0))
            .unwrap_err();
        assert!(matches!(
            err,
            RrdError::Format(FormatError::BadSignature { .. })
        ));
    }

    #[test]
    fn test_zero_counts_are_corrupt() {
        let mut slab = memory_slab(64);
        let mut text = SIGNATURE.to_string();
        Encoder::at(&mut slab, 0).string(&mut text).unwrap();

        let err = Header::empty()
            .visit(&mut Decoder::at(&mut slab, 0))
            .unwrap_err();
        assert!(matches!(
            err,
            RrdError::Format(FormatError::CorruptField { .. })
        ));
    }
}
