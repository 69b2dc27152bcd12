//! Range-capable byte sources consumed by [`crate::reader::ArchiveReader`]
//! (spec.md §6: "range-capable object store (consumed)").
//!
//! One native async-fn-in-trait, `RangeSource`, covers every backend
//! (HTTP, mmap); COMTiles standardizes on the native async-fn-in-trait form
//! throughout rather than mixing it with `#[async_trait]`.

#[cfg(feature = "http-async")]
mod http;
#[cfg(feature = "mmap-async-tokio")]
mod mmap;

#[cfg(feature = "http-async")]
pub use http::HttpBackend;
#[cfg(feature = "mmap-async-tokio")]
pub use mmap::MmapBackend;

use bytes::Bytes;

use crate::error::ComtResult;

/// A byte-addressable source supporting ranged reads.
pub trait RangeSource: Send + Sync {
    /// Reads up to `length` bytes starting at `offset`, clamped to however
    /// many bytes are actually available past `offset` — a short read past
    /// EOF is not an error, since `ArchiveReader`'s header bootstrap
    /// deliberately over-requests a fixed-size initial chunk and checks
    /// sufficiency itself against the parsed header lengths.
    ///
    /// # Errors
    /// Returns [`crate::error::ComtError::UnexpectedByteCount`] if *more*
    /// bytes come back than requested, or a transport-specific error.
    fn read_range(
        &self,
        offset: u64,
        length: u64,
    ) -> impl Future<Output = ComtResult<Bytes>> + Send;
}
