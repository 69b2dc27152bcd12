//! Index geometry and archive I/O engine for the COMTiles cloud-optimized
//! vector tile archive format (spec.md §1).
//!
//! [`geometry`] is the pure address-to-offset arithmetic shared by the
//! producer and the consumer; [`writer::ArchiveWriter`] lays out an archive
//! from an ordered tile stream; [`reader::ArchiveReader`] resolves
//! individual tiles against a range-capable backend through a two-tier
//! index cache.

mod backend;
mod batch;
mod bitcodec;
mod cache;
mod error;
mod geometry;
mod header;
mod metadata;
mod reader;
mod tile;
mod writer;

pub use backend::RangeSource;
#[cfg(feature = "http-async")]
pub use backend::HttpBackend;
#[cfg(feature = "mmap-async-tokio")]
pub use backend::MmapBackend;
pub use batch::{BatchDispatcher, BatchWaiter};
pub use bitcodec::{
    MAX_OFFSET, MAX_TILE_SIZE, encode_fragment_byte_aligned, read_u24_le, read_u40_le,
    write_u24_le, write_u40_le,
};
pub use error::{ComtError, ComtResult};
pub use geometry::{FragmentRange, IndexOffset, fragment_range_for_tile, local_fragment_index, offset_in_index};
pub use header::{HEADER_SIZE, Header, MAGIC, VERSION};
pub use metadata::{Ordering, TileMatrix, TileMatrixCrs, TileMatrixLimits, TileMatrixSet};
pub use reader::{ArchiveReader, Cancellation};
pub use tile::TileCoord;
pub use writer::{ArchiveWriter, MAX_PRODUCER_TILE_SIZE, TileRecord, TileSource, WriterStats};

/// Re-export of crate exposed in our API to simplify dependency management.
#[cfg(feature = "http-async")]
pub use reqwest;
