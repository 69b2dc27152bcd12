//! The consumer side: header bootstrap, metadata validation, and tile
//! resolution through the two-tier index cache (spec.md §4.4).
//!
//! Generalizes a directory-tree walk into `IndexGeometry`'s pyramid/
//! fragment split, resolving tiles through the native async-fn-in-trait
//! `RangeSource`.

use std::future::Future;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use flate2::read::{GzDecoder, ZlibDecoder};
use tokio::sync::Notify;

use crate::backend::RangeSource;
use crate::batch::BatchDispatcher;
use crate::bitcodec::{read_u24_le, read_u40_le};
use crate::cache::FragmentCache;
use crate::error::{ComtError, ComtResult};
use crate::geometry::{self, IndexOffset};
use crate::header::Header;
use crate::metadata::TileMatrixSet;

/// Bytes fetched by the single header-bootstrap range request (spec.md §4.4).
const INITIAL_CHUNK_SIZE: u64 = 512 * 1024;

/// A best-effort cooperative cancellation signal for suspending calls
/// (spec.md §5). `cancel` is idempotent; waiters already parked when it
/// fires wake immediately, and later callers observe the flag without
/// suspending at all.
#[derive(Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Cancellation {
    /// Creates a fresh, unfired cancellation signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal. Safe to call more than once.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn fired(&self) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        self.notify.notified().await;
    }
}

/// A byte-exact reader over a COMTiles archive.
pub struct ArchiveReader<B: RangeSource + 'static> {
    backend: Arc<B>,
    header: Header,
    metadata: TileMatrixSet,
    /// Decompressed pyramid index: `3 * numPyramidTiles` bytes.
    pyramid: Bytes,
    /// `pyramid_offsets[i]` = cumulative data-section offset of the `i`-th
    /// pyramid tile; `pyramid_offsets[numPyramidTiles]` is the data-section
    /// offset of the first fragmented-zone tile. Precomputed once at open
    /// so `get_tile` never re-sums a prefix of the pyramid buffer.
    pyramid_offsets: Vec<u64>,
    fragments: FragmentCache,
    batch: Option<Arc<BatchDispatcher<B>>>,
}

impl<B: RangeSource + 'static> ArchiveReader<B> {
    /// Opens an archive over `backend`: one range request for the header,
    /// metadata, and pyramid index, followed by validation.
    ///
    /// # Errors
    /// Returns `InvalidMagicNumber`/`UnsupportedVersion` for a malformed
    /// header, `UnsupportedCrs`/`UnsupportedOrdering`/`UnsupportedTileFormat`
    /// for an unsupported metadata document, or `PyramidTruncated` if the
    /// pyramid index extends beyond the initial chunk.
    pub async fn open(backend: B) -> ComtResult<Self> {
        Self::open_with(backend, None).await
    }

    /// Like [`open`](Self::open), additionally arming a [`BatchDispatcher`]
    /// with the given throttle window for use by
    /// [`get_tile_batched`](Self::get_tile_batched).
    ///
    /// # Errors
    /// See [`open`](Self::open).
    pub async fn open_with_batching(backend: B, throttle: Duration) -> ComtResult<Self> {
        Self::open_with(backend, Some(throttle)).await
    }

    async fn open_with(backend: B, throttle: Option<Duration>) -> ComtResult<Self> {
        log::debug!("bootstrapping archive header from the initial {INITIAL_CHUNK_SIZE}-byte chunk");
        let backend = Arc::new(backend);
        let chunk = backend.read_range(0, INITIAL_CHUNK_SIZE).await?;
        let header = Header::try_from_bytes(&chunk)?;

        let needed = header.pyramid_offset() + u64::from(header.pyramid_len);
        let available = chunk.len() as u64;
        if needed > available {
            return Err(ComtError::PyramidTruncated { needed, available });
        }

        let meta_start = header.metadata_offset() as usize;
        let meta_end = meta_start + header.meta_len as usize;
        let metadata: TileMatrixSet = serde_json::from_slice(&chunk[meta_start..meta_end])?;
        metadata.validate()?;
        log::debug!(
            "archive metadata validated: pyramid_max_zoom={:?}, tile_matrices={}",
            metadata.pyramid_max_zoom(),
            metadata.tile_matrix_set.len()
        );

        let pyramid_start = header.pyramid_offset() as usize;
        let pyramid_end = pyramid_start + header.pyramid_len as usize;
        let mut decoder = ZlibDecoder::new(&chunk[pyramid_start..pyramid_end]);
        let mut pyramid = Vec::with_capacity(metadata.pyramid_index_len() as usize);
        decoder.read_to_end(&mut pyramid)?;
        let pyramid = Bytes::from(pyramid);

        let num_pyramid_tiles = pyramid.len() / 3;
        let mut pyramid_offsets = Vec::with_capacity(num_pyramid_tiles + 1);
        let mut running = 0u64;
        pyramid_offsets.push(0);
        for i in 0..num_pyramid_tiles {
            running += u64::from(read_u24_le(&pyramid, i * 3));
            pyramid_offsets.push(running);
        }

        let batch = throttle.map(|t| BatchDispatcher::new(backend.clone(), t));

        Ok(Self {
            backend,
            header,
            metadata,
            pyramid,
            pyramid_offsets,
            fragments: FragmentCache::default(),
            batch,
        })
    }

    /// The validated metadata document.
    #[must_use]
    pub fn metadata(&self) -> &TileMatrixSet {
        &self.metadata
    }

    /// The archive's fixed 24-byte header, decoded.
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Resolves `(z, x, y)` (XYZ) to its raw data-section offset and size,
    /// without fetching the payload. `None` means the tile is out of range
    /// or marked missing (`size == 0`). Exposed for the offset-agreement
    /// property test (spec.md §8 property 2).
    ///
    /// # Errors
    /// Propagates I/O or transport errors from fetching the containing
    /// fragment.
    pub async fn resolve_absolute_tile_offset(
        &self,
        z: u8,
        x: u64,
        y: u64,
    ) -> ComtResult<Option<(u64, u32)>> {
        let tms_y = to_tms_row(z, y);
        let Some(tm) = self.metadata.tile_matrix(z) else {
            return Ok(None);
        };
        let offset = match geometry::offset_in_index(&self.metadata, z, x, tms_y) {
            Ok(o) => o,
            Err(ComtError::OutOfRange(..)) => return Ok(None),
            Err(e) => return Err(e),
        };

        if tm.is_pyramid() {
            Ok(self.resolve_pyramid(offset))
        } else {
            self.resolve_fragment(z, x, tms_y).await
        }
    }

    fn resolve_pyramid(&self, offset: IndexOffset) -> Option<(u64, u32)> {
        let idx = offset.index as usize;
        let size = read_u24_le(&self.pyramid, idx * 3);
        if size == 0 {
            return None;
        }
        Some((self.pyramid_offsets[idx], size))
    }

    async fn resolve_fragment(&self, z: u8, x: u64, tms_y: u64) -> ComtResult<Option<(u64, u32)>> {
        let tm = self
            .metadata
            .tile_matrix(z)
            .ok_or(ComtError::OutOfRange(z, x, tms_y))?;
        let range = geometry::fragment_range_for_tile(
            &self.metadata,
            z,
            x,
            tms_y,
            self.header.fragment_offset(),
        )?;

        let backend = self.backend.clone();
        let start = range.start_offset;
        let len = range.end_offset - range.start_offset;
        log::trace!("resolving tile ({z}, {x}, {tms_y}) via fragment at offset {start} ({len} bytes)");
        let fragment = self
            .fragments
            .get_or_fetch(start, async move {
                log::debug!("fetching fragment at offset {start} ({len} bytes)");
                backend.read_range(start, len).await
            })
            .await?;

        let local_idx = geometry::local_fragment_index(tm, x, tms_y) as usize;
        let base_offset = read_u40_le(&fragment, 0);
        let mut offset = base_offset;
        for i in 0..local_idx {
            offset += u64::from(read_u24_le(&fragment, 5 + 3 * i));
        }
        let size = read_u24_le(&fragment, 5 + 3 * local_idx);
        if size == 0 {
            return Ok(None);
        }
        Ok(Some((offset, size)))
    }

    /// Fetches a tile's raw payload bytes, or `None` if it's out of range
    /// or marked missing. A returned payload is gunzipped before being
    /// handed back.
    ///
    /// # Errors
    /// Propagates I/O/transport errors, or [`ComtError::Cancelled`] if
    /// `cancel` fires before the operation completes.
    pub async fn get_tile(
        &self,
        z: u8,
        x: u64,
        y: u64,
        cancel: Option<&Cancellation>,
    ) -> ComtResult<Option<Bytes>> {
        self.get_tile_inner(z, x, y, cancel, false).await
    }

    /// Like [`get_tile`](Self::get_tile), but routes the final data-section
    /// fetch through this reader's [`BatchDispatcher`] so it can be merged
    /// with other concurrent requests (spec.md §4.4 "Batch mode").
    ///
    /// # Errors
    /// Returns [`ComtError::Internal`] if this reader was not opened with
    /// batching enabled. Otherwise see [`get_tile`](Self::get_tile).
    pub async fn get_tile_batched(
        &self,
        z: u8,
        x: u64,
        y: u64,
        cancel: Option<&Cancellation>,
    ) -> ComtResult<Option<Bytes>> {
        if self.batch.is_none() {
            return Err(ComtError::Internal(
                "get_tile_batched called on a reader opened without batching".into(),
            ));
        }
        self.get_tile_inner(z, x, y, cancel, true).await
    }

    async fn get_tile_inner(
        &self,
        z: u8,
        x: u64,
        y: u64,
        cancel: Option<&Cancellation>,
        batched: bool,
    ) -> ComtResult<Option<Bytes>> {
        let tms_y = to_tms_row(z, y);
        let located = match self.locate(z, x, tms_y, cancel).await {
            Ok(located) => located,
            Err(ComtError::OutOfRange(..)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let Some((offset, size)) = located else {
            return Ok(None);
        };

        let absolute = self.header.data_offset() + offset;
        let raw = if batched {
            #[expect(clippy::unwrap_used)]
            let dispatcher = self.batch.as_ref().unwrap();
            let waiter = dispatcher.enqueue(absolute, u64::from(size));
            await_with_cancel(waiter.wait(), cancel).await?
        } else {
            await_with_cancel(self.backend.read_range(absolute, u64::from(size)), cancel).await?
        };

        let mut gz = GzDecoder::new(&raw[..]);
        let mut out = Vec::new();
        gz.read_to_end(&mut out)?;
        Ok(Some(Bytes::from(out)))
    }

    async fn locate(
        &self,
        z: u8,
        x: u64,
        tms_y: u64,
        cancel: Option<&Cancellation>,
    ) -> ComtResult<Option<(u64, u32)>> {
        let Some(tm) = self.metadata.tile_matrix(z) else {
            return Ok(None);
        };
        if tm.is_pyramid() {
            let offset = geometry::offset_in_index(&self.metadata, z, x, tms_y)?;
            Ok(self.resolve_pyramid(offset))
        } else {
            await_with_cancel(self.resolve_fragment(z, x, tms_y), cancel).await
        }
    }
}

fn to_tms_row(z: u8, y: u64) -> u64 {
    (1u64 << z) - y - 1
}

async fn await_with_cancel<F, T>(fut: F, cancel: Option<&Cancellation>) -> ComtResult<T>
where
    F: Future<Output = ComtResult<T>>,
{
    let Some(cancel) = cancel else {
        return fut.await;
    };
    tokio::select! {
        biased;
        () = cancel.fired() => Err(ComtError::Cancelled),
        result = fut => result,
    }
}
