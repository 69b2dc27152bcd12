//! The producer side: streams header → metadata → compressed pyramid index
//! → fragment index → tile data to `W`, then back-patches the header's
//! length fields (spec.md §4.3).
//!
//! Streams through a `countio::Counter` to track bytes written, wraps a
//! `BufWriter` underneath, and finishes with a seek-back-and-patch step —
//! the same shape as a single sorted directory writer, generalized to the
//! pyramid/fragment two-part index.

use std::io::{BufWriter, Seek, SeekFrom, Write};

use bytes::Bytes;
use countio::Counter;
use flate2::Compression as ZlibCompression;
use flate2::write::ZlibEncoder;

use crate::bitcodec::{write_u24_le, write_u40_le};
use crate::error::{ComtError, ComtResult};
use crate::geometry;
use crate::header::Header;
use crate::metadata::TileMatrixSet;
use crate::tile::TileCoord;

/// Largest tile payload the producer will accept, per spec.md §4.3
/// (`size <= maxTileSize = 2^20 - 1`). Stricter than the 24-bit field width
/// [`crate::bitcodec::MAX_TILE_SIZE`] allows, by design.
pub const MAX_PRODUCER_TILE_SIZE: u32 = (1 << 20) - 1;

/// One tile yielded by a [`TileSource`]: its address, declared size, and
/// (unless it's a missing/padding tile) payload bytes.
///
/// A `size == 0` entry denotes a missing tile regardless of whether
/// `payload` is `None` or `Some(empty)` — both are treated identically.
pub struct TileRecord {
    pub coord: TileCoord,
    pub size: u32,
    pub payload: Option<Bytes>,
}

/// An ordered, restartable source of [`TileRecord`]s, row-major within each
/// zoom and ascending across zooms (spec.md §6 "`TileProvider` (consumed)").
///
/// `ArchiveWriter` calls [`records`](Self::records) three separate times —
/// to size the pyramid buffer, to lay out the fragment index, and to stream
/// payload bytes — so a fresh iterator must be obtainable repeatedly rather
/// than consumed once. The concrete MBTiles-backed source is out of scope
/// (spec.md §1); this crate ships only the trait.
pub trait TileSource: Send + Sync {
    /// Returns a fresh iterator over this source's tile stream.
    fn records(&self) -> Box<dyn Iterator<Item = ComtResult<TileRecord>> + '_>;
}

/// Summary returned by [`ArchiveWriter::write_all_tiles`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Tiles with a non-zero size (i.e. not padding).
    pub tiles_written: u64,
    /// Total payload bytes written to the data section.
    pub bytes_written: u64,
    /// Missing-tile (size == 0) entries encountered, pyramid and fragment
    /// combined.
    pub padding_entries: u64,
}

/// Streams a COMTiles archive to `W`.
pub struct ArchiveWriter<W: Write + Seek> {
    out: Counter<BufWriter<W>>,
    meta_len: u32,
    metadata: TileMatrixSet,
    /// Running absolute offset into the (not-yet-written) data section.
    /// Advances as pyramid and fragment sizes are processed, ahead of the
    /// actual payload bytes being written (spec.md §4.3 steps 3-4).
    data_section_offset: u64,
}

impl<W: Write + Seek> ArchiveWriter<W> {
    /// Begins writing: a placeholder header (patched in
    /// [`write_all_tiles`](Self::write_all_tiles)), then the metadata JSON.
    ///
    /// # Errors
    /// Propagates I/O errors and metadata JSON-serialization failures.
    pub fn create(writer: W, metadata: TileMatrixSet) -> ComtResult<Self> {
        let mut out = Counter::new(BufWriter::new(writer));
        out.write_all(&Header::placeholder().to_bytes())?;

        let meta_bytes = serde_json::to_vec(&metadata)?;
        out.write_all(&meta_bytes)?;
        let meta_len = u32::try_from(meta_bytes.len())
            .map_err(|_| ComtError::Internal("metadata document exceeds 4 GiB".into()))?;

        Ok(Self {
            out,
            meta_len,
            metadata,
            data_section_offset: 0,
        })
    }

    /// Writes the pyramid index, fragment index, and tile payloads from
    /// `source`, then back-patches the header's `pyramidLen`/`fragmentLen`
    /// fields.
    ///
    /// # Errors
    /// Returns [`ComtError::TileTooLarge`] if a tile's declared size exceeds
    /// [`MAX_PRODUCER_TILE_SIZE`], [`ComtError::OffsetOverflow`] if the
    /// cumulative data-section offset would exceed
    /// [`crate::bitcodec::MAX_OFFSET`], or propagates I/O errors.
    pub fn write_all_tiles(mut self, source: &dyn TileSource) -> ComtResult<WriterStats> {
        let mut stats = WriterStats::default();

        let pyramid_len = self.write_pyramid(source, &mut stats)?;
        let fragment_len = self.write_fragment_index(source, &mut stats)?;
        self.write_tile_data(source, &mut stats)?;
        self.patch_header(pyramid_len, fragment_len)?;
        self.out.flush()?;

        Ok(stats)
    }

    /// Step 3: allocates a zero-filled buffer of `3 * numPyramidTiles`
    /// bytes, writes each pyramid tile's size at its `IndexGeometry` slot,
    /// zlib-compresses it, and streams it out. Returns the compressed
    /// length.
    fn write_pyramid(&mut self, source: &dyn TileSource, stats: &mut WriterStats) -> ComtResult<u32> {
        let pyramid_tiles: u64 = self
            .metadata
            .tile_matrix_set
            .iter()
            .filter(|tm| tm.is_pyramid())
            .map(crate::metadata::TileMatrix::num_tiles)
            .sum();
        let mut buf = vec![0u8; usize::try_from(pyramid_tiles * 3).unwrap_or(usize::MAX)];

        for record in source.records() {
            let record = record?;
            let Some(tm) = self.metadata.tile_matrix(record.coord.z) else {
                continue;
            };
            if !tm.is_pyramid() {
                continue;
            }
            validate_size(record.size)?;

            let slot = geometry::offset_in_index(&self.metadata, record.coord.z, record.coord.x, record.coord.y)?;
            write_u24_le(&mut buf, slot.offset as usize, record.size)?;

            self.advance_data_offset(record.size)?;
            if record.size == 0 {
                stats.padding_entries += 1;
            } else {
                stats.tiles_written += 1;
            }
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), ZlibCompression::default());
        encoder.write_all(&buf)?;
        let compressed = encoder.finish()?;

        let pos = self.out.writer_bytes();
        self.out.write_all(&compressed)?;
        let compressed_len = u32::try_from(self.out.writer_bytes() - pos)
            .map_err(|_| ComtError::Internal("pyramid index exceeds 4 GiB compressed".into()))?;
        Ok(compressed_len)
    }

    /// Step 4: streams the fragment index, one 5-byte absolute data offset
    /// per fragment followed by that fragment's 3-byte tile-size entries,
    /// inserting zero-size padding entries for any gap in the global
    /// ordinal index (spec.md §4.3 step 4, §9 first Open Question).
    fn write_fragment_index(
        &mut self,
        source: &dyn TileSource,
        stats: &mut WriterStats,
    ) -> ComtResult<u64> {
        let pyramid_tiles: u64 = self
            .metadata
            .tile_matrix_set
            .iter()
            .filter(|tm| tm.is_pyramid())
            .map(crate::metadata::TileMatrix::num_tiles)
            .sum();

        let mut previous_fragment_index: Option<u64> = None;
        let mut previous_index: u64 = pyramid_tiles;
        let pos = self.out.writer_bytes();

        for record in source.records() {
            let record = record?;
            let Some(tm) = self.metadata.tile_matrix(record.coord.z) else {
                continue;
            };
            if tm.is_pyramid() {
                continue;
            }
            validate_size(record.size)?;

            // Only `fragment_index` is used here (to detect a fragment
            // boundary); `start_offset`/`end_offset` are archive-absolute
            // and not needed until the reader side resolves a tile, so the
            // base offset argument is irrelevant.
            let range = geometry::fragment_range_for_tile(
                &self.metadata,
                record.coord.z,
                record.coord.x,
                record.coord.y,
                0,
            )?;

            if previous_fragment_index != Some(range.fragment_index) {
                let mut prefix = [0u8; 5];
                write_u40_le(&mut prefix, 0, self.data_section_offset)?;
                self.out.write_all(&prefix)?;
                previous_fragment_index = Some(range.fragment_index);
            }

            let index = geometry::offset_in_index(&self.metadata, record.coord.z, record.coord.x, record.coord.y)?.index;
            let padding = index.saturating_sub(previous_index + 1);
            for _ in 0..padding {
                self.out.write_all(&[0u8; 3])?;
                stats.padding_entries += 1;
            }

            let mut size_entry = [0u8; 3];
            write_u24_le(&mut size_entry, 0, record.size)?;
            self.out.write_all(&size_entry)?;

            self.advance_data_offset(record.size)?;
            if record.size == 0 {
                stats.padding_entries += 1;
            } else {
                stats.tiles_written += 1;
            }
            previous_index = index;
        }

        Ok((self.out.writer_bytes() - pos) as u64)
    }

    /// Step 5: streams tile payload bytes in row-major order; missing
    /// tiles (size 0) contribute nothing.
    fn write_tile_data(&mut self, source: &dyn TileSource, stats: &mut WriterStats) -> ComtResult<()> {
        for record in source.records() {
            let record = record?;
            if record.size == 0 {
                continue;
            }
            let Some(payload) = record.payload else {
                return Err(ComtError::Internal(format!(
                    "tile ({}, {}, {}) declares size {} but has no payload",
                    record.coord.z, record.coord.x, record.coord.y, record.size
                )));
            };
            if payload.len() != record.size as usize {
                return Err(ComtError::Internal(format!(
                    "tile ({}, {}, {}) payload length {} does not match declared size {}",
                    record.coord.z,
                    record.coord.x,
                    record.coord.y,
                    payload.len(),
                    record.size
                )));
            }
            self.out.write_all(&payload)?;
            stats.bytes_written += payload.len() as u64;
        }
        Ok(())
    }

    fn advance_data_offset(&mut self, size: u32) -> ComtResult<()> {
        self.data_section_offset += u64::from(size);
        if self.data_section_offset > crate::bitcodec::MAX_OFFSET {
            return Err(ComtError::OffsetOverflow(self.data_section_offset));
        }
        Ok(())
    }

    fn patch_header(&mut self, pyramid_len: u32, fragment_len: u64) -> ComtResult<()> {
        let header = Header {
            version: crate::header::VERSION,
            meta_len: self.meta_len,
            pyramid_len,
            fragment_len,
        };
        self.out.flush()?;
        self.out.seek(SeekFrom::Start(0))?;
        self.out.write_all(&header.to_bytes())?;
        self.out.seek(SeekFrom::End(0))?;
        Ok(())
    }
}

fn validate_size(size: u32) -> ComtResult<()> {
    if size > MAX_PRODUCER_TILE_SIZE {
        return Err(ComtError::TileTooLarge(u64::from(size)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::metadata::{Ordering, TileMatrix, TileMatrixCrs, TileMatrixLimits};

    fn limits(min_col: u64, min_row: u64, max_col: u64, max_row: u64) -> TileMatrixLimits {
        TileMatrixLimits {
            min_tile_col: min_col,
            min_tile_row: min_row,
            max_tile_col: max_col,
            max_tile_row: max_row,
        }
    }

    struct FixtureSource {
        tiles: Vec<(TileCoord, u32, Option<Vec<u8>>)>,
    }

    impl TileSource for FixtureSource {
        fn records(&self) -> Box<dyn Iterator<Item = ComtResult<TileRecord>> + '_> {
            Box::new(self.tiles.iter().map(|(coord, size, payload)| {
                Ok(TileRecord {
                    coord: *coord,
                    size: *size,
                    payload: payload.clone().map(Bytes::from),
                })
            }))
        }
    }

    /// spec.md §8 scenario (a): single pyramid zoom, 2x2 tiles.
    #[test]
    fn pyramid_only_roundtrip_offsets() {
        let metadata = TileMatrixSet {
            tile_matrix_crs: TileMatrixCrs::WebMercatorQuad,
            tile_format: "pbf".into(),
            fragment_ordering: Some(Ordering::RowMajor),
            tile_ordering: Some(Ordering::RowMajor),
            tile_matrix_set: vec![TileMatrix {
                zoom: 1,
                aggregation_coefficient: -1,
                tile_matrix_limits: limits(0, 0, 1, 1),
            }],
            extra: serde_json::Map::new(),
        };

        let source = FixtureSource {
            tiles: vec![
                (TileCoord::new(1, 0, 0), 100, Some(vec![1u8; 100])),
                (TileCoord::new(1, 1, 0), 200, Some(vec![2u8; 200])),
                (TileCoord::new(1, 0, 1), 300, Some(vec![3u8; 300])),
                (TileCoord::new(1, 1, 1), 400, Some(vec![4u8; 400])),
            ],
        };

        let buf = Cursor::new(Vec::new());
        let writer = ArchiveWriter::create(buf, metadata).unwrap();
        let stats = writer.write_all_tiles(&source).unwrap();

        assert_eq!(stats.tiles_written, 4);
        assert_eq!(stats.bytes_written, 1000);
        assert_eq!(stats.padding_entries, 0);
    }

    #[test]
    fn rejects_oversized_tile() {
        let metadata = TileMatrixSet {
            tile_matrix_crs: TileMatrixCrs::WebMercatorQuad,
            tile_format: "pbf".into(),
            fragment_ordering: Some(Ordering::RowMajor),
            tile_ordering: Some(Ordering::RowMajor),
            tile_matrix_set: vec![TileMatrix {
                zoom: 0,
                aggregation_coefficient: -1,
                tile_matrix_limits: limits(0, 0, 0, 0),
            }],
            extra: serde_json::Map::new(),
        };
        let source = FixtureSource {
            tiles: vec![(
                TileCoord::new(0, 0, 0),
                MAX_PRODUCER_TILE_SIZE + 1,
                Some(vec![0u8; (MAX_PRODUCER_TILE_SIZE + 1) as usize]),
            )],
        };
        let buf = Cursor::new(Vec::new());
        let writer = ArchiveWriter::create(buf, metadata).unwrap();
        assert!(matches!(
            writer.write_all_tiles(&source),
            Err(ComtError::TileTooLarge(_))
        ));
    }

    /// spec.md §8 scenario (d): a missing tile (size 0) writes no payload.
    #[test]
    fn missing_tile_contributes_no_bytes() {
        let metadata = TileMatrixSet {
            tile_matrix_crs: TileMatrixCrs::WebMercatorQuad,
            tile_format: "pbf".into(),
            fragment_ordering: Some(Ordering::RowMajor),
            tile_ordering: Some(Ordering::RowMajor),
            tile_matrix_set: vec![TileMatrix {
                zoom: 2,
                aggregation_coefficient: -1,
                tile_matrix_limits: limits(0, 0, 1, 1),
            }],
            extra: serde_json::Map::new(),
        };
        let source = FixtureSource {
            tiles: vec![
                (TileCoord::new(2, 0, 0), 50, Some(vec![9u8; 50])),
                (TileCoord::new(2, 1, 0), 0, None),
                (TileCoord::new(2, 0, 1), 60, Some(vec![9u8; 60])),
                (TileCoord::new(2, 1, 1), 70, Some(vec![9u8; 70])),
            ],
        };
        let buf = Cursor::new(Vec::new());
        let writer = ArchiveWriter::create(buf, metadata).unwrap();
        let stats = writer.write_all_tiles(&source).unwrap();
        assert_eq!(stats.tiles_written, 3);
        assert_eq!(stats.padding_entries, 1);
        assert_eq!(stats.bytes_written, 180);
    }

    /// spec.md §8 scenario (b): fragmented zoom, single fragment, F=8.
    #[test]
    fn fragmented_zoom_writes_single_fragment_prefix() {
        let metadata = TileMatrixSet {
            tile_matrix_crs: TileMatrixCrs::WebMercatorQuad,
            tile_format: "pbf".into(),
            fragment_ordering: Some(Ordering::RowMajor),
            tile_ordering: Some(Ordering::RowMajor),
            tile_matrix_set: vec![TileMatrix {
                zoom: 3,
                aggregation_coefficient: 3,
                tile_matrix_limits: limits(0, 0, 7, 7),
            }],
            extra: serde_json::Map::new(),
        };
        let mut tiles = Vec::new();
        for row in 0..8u64 {
            for col in 0..8u64 {
                tiles.push((TileCoord::new(3, col, row), 10, Some(vec![1u8; 10])));
            }
        }
        let source = FixtureSource { tiles };
        let buf = Cursor::new(Vec::new());
        let writer = ArchiveWriter::create(buf, metadata).unwrap();
        let stats = writer.write_all_tiles(&source).unwrap();
        assert_eq!(stats.tiles_written, 64);
        assert_eq!(stats.bytes_written, 640);
        assert_eq!(stats.padding_entries, 0);
    }
}
