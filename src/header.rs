//! The fixed 24-byte archive header (spec.md §3).
//!
//! ```text
//! magic:       4 bytes = "COMT"
//! version:     uint32 LE = 1
//! metaLen:     uint32 LE
//! pyramidLen:  uint32 LE  (compressed byte length of pyramid index)
//! fragmentLen: uint64 LE  (total byte length of fragment index)
//! ```

use bytes::{Buf, BufMut};

use crate::error::{ComtError, ComtResult};

/// Size in bytes of the fixed header.
pub const HEADER_SIZE: usize = 24;

/// Magic bytes at the start of every archive.
pub const MAGIC: &[u8; 4] = b"COMT";

/// The only archive version this crate reads or writes.
pub const VERSION: u32 = 1;

/// The fixed 24-byte archive header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub meta_len: u32,
    pub pyramid_len: u32,
    pub fragment_len: u64,
}

impl Header {
    /// A placeholder header with zeroed lengths, written first by the
    /// streaming writer and patched once the real lengths are known
    /// (spec.md §4.3 step 1 / step 6).
    #[must_use]
    pub fn placeholder() -> Self {
        Self {
            version: VERSION,
            meta_len: 0,
            pyramid_len: 0,
            fragment_len: 0,
        }
    }

    /// Decodes a header from exactly [`HEADER_SIZE`] bytes.
    ///
    /// # Errors
    /// Returns [`ComtError::InvalidMagicNumber`] if the magic bytes don't
    /// match, or [`ComtError::UnsupportedVersion`] if `version != 1`.
    pub fn try_from_bytes(raw: &[u8]) -> ComtResult<Self> {
        if raw.len() < HEADER_SIZE {
            return Err(ComtError::UnexpectedByteCount {
                expected: HEADER_SIZE,
                actual: raw.len(),
            });
        }
        if &raw[0..4] != MAGIC {
            return Err(ComtError::InvalidMagicNumber);
        }
        let mut buf = &raw[4..HEADER_SIZE];
        let version = buf.get_u32_le();
        if version != VERSION {
            return Err(ComtError::UnsupportedVersion(version));
        }
        let meta_len = buf.get_u32_le();
        let pyramid_len = buf.get_u32_le();
        let fragment_len = buf.get_u64_le();

        Ok(Self {
            version,
            meta_len,
            pyramid_len,
            fragment_len,
        })
    }

    /// Encodes this header to exactly [`HEADER_SIZE`] bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.put_slice(MAGIC);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.meta_len);
        buf.put_u32_le(self.pyramid_len);
        buf.put_u64_le(self.fragment_len);
        buf.try_into().expect("header buffer is exactly HEADER_SIZE bytes")
    }

    /// Absolute offset of the metadata section: right after the header.
    #[must_use]
    pub fn metadata_offset(&self) -> u64 {
        HEADER_SIZE as u64
    }

    /// Absolute offset of the pyramid index section.
    #[must_use]
    pub fn pyramid_offset(&self) -> u64 {
        self.metadata_offset() + u64::from(self.meta_len)
    }

    /// Absolute offset of the fragment index section.
    #[must_use]
    pub fn fragment_offset(&self) -> u64 {
        self.pyramid_offset() + u64::from(self.pyramid_len)
    }

    /// Absolute offset of the tile data section.
    #[must_use]
    pub fn data_offset(&self) -> u64 {
        self.fragment_offset() + self.fragment_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let h = Header {
            version: 1,
            meta_len: 42,
            pyramid_len: 1000,
            fragment_len: 5_000_000_000,
        };
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let parsed = Header::try_from_bytes(&bytes).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = Header::placeholder().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            Header::try_from_bytes(&bytes),
            Err(ComtError::InvalidMagicNumber)
        ));
    }

    #[test]
    fn rejects_bad_version() {
        let mut h = Header::placeholder();
        h.version = 2;
        let bytes = h.to_bytes();
        assert!(matches!(
            Header::try_from_bytes(&bytes),
            Err(ComtError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn section_offsets_compose() {
        let h = Header {
            version: 1,
            meta_len: 100,
            pyramid_len: 50,
            fragment_len: 200,
        };
        assert_eq!(h.metadata_offset(), 24);
        assert_eq!(h.pyramid_offset(), 124);
        assert_eq!(h.fragment_offset(), 174);
        assert_eq!(h.data_offset(), 374);
    }
}
