use thiserror::Error;

/// All failure modes surfaced by this crate.
///
/// `OutOfRange` is a special case: `ArchiveReader::get_tile` collapses it to
/// `Ok(None)` rather than propagating it, since an out-of-range address is a
/// normal "no such tile" outcome, not an exceptional one (see spec.md §7).
#[derive(Debug, Error)]
pub enum ComtError {
    /// Header magic bytes were not `"COMT"`.
    #[error("invalid magic number")]
    InvalidMagicNumber,

    /// Header version was not `1`.
    #[error("unsupported archive version {0}")]
    UnsupportedVersion(u32),

    /// Metadata's `tileMatrixCRS` was not `"WebMercatorQuad"`.
    #[error("unsupported CRS: {0}")]
    UnsupportedCrs(String),

    /// Metadata's fragment or tile ordering was not `RowMajor`/default.
    #[error("unsupported ordering: {0}")]
    UnsupportedOrdering(String),

    /// Metadata's `tileFormat` was not `"pbf"`.
    #[error("unsupported tile format: {0}")]
    UnsupportedTileFormat(String),

    /// The pyramid index extends beyond the initial header+metadata chunk.
    #[error("pyramid index truncated: needs {needed} bytes, initial chunk has {available}")]
    PyramidTruncated {
        /// Bytes required to hold header + metadata + pyramid.
        needed: u64,
        /// Bytes actually fetched in the initial chunk.
        available: u64,
    },

    /// Requested `(z, x, y)` lies outside the zoom's `tileMatrixLimits`.
    #[error("tile ({0}, {1}, {2}) is out of range")]
    OutOfRange(u8, u64, u64),

    /// Producer: a tile's encoded size exceeds this writer's stricter cap,
    /// well under the format's actual 24-bit (2^24 - 1) capacity.
    #[error("tile size {0} exceeds the producer limit (2^20 - 1)")]
    TileTooLarge(u64),

    /// Producer: the cumulative data-section offset does not fit in 40 bits.
    #[error("data section offset {0} exceeds the 40-bit limit (2^40 - 1)")]
    OffsetOverflow(u64),

    /// A value destined for a 40-bit field did not fit.
    #[error("value {0} does not fit in 40 bits")]
    U40Overflow(u64),

    /// A value destined for a 24-bit field did not fit.
    #[error("value {0} does not fit in 24 bits")]
    U24Overflow(u32),

    /// A metadata document failed structural validation.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// A range request returned fewer or more bytes than requested.
    #[error("expected {expected} bytes, got {actual}")]
    UnexpectedByteCount {
        /// Bytes requested.
        expected: usize,
        /// Bytes actually returned.
        actual: usize,
    },

    /// The backend does not honor ranged requests (e.g. server ignored `Range`).
    #[error("range requests are not supported by this backend")]
    RangeRequestsUnsupported,

    /// A suspending operation was cancelled by its caller.
    ///
    /// Caches are left consistent: a cancelled fetch never poisons the
    /// pending-fetch entry for other waiters (spec.md §7).
    #[error("operation cancelled")]
    Cancelled,

    /// JSON (de)serialization of the metadata document failed.
    ///
    /// The metadata format itself is an external collaborator (spec.md §1);
    /// this variant just wraps whatever `serde_json` reports.
    #[error("metadata JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local filesystem or mmap I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport failure.
    #[cfg(feature = "http-async")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Some other internal invariant broke.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the crate.
pub type ComtResult<T> = Result<T, ComtError>;
