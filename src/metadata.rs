//! The metadata document: `TileMatrixSet`, `TileMatrix`, and the CRS/ordering
//! enums validated by [`crate::geometry`].
//!
//! JSON (de)serialization itself is treated as an external collaborator
//! (spec.md §1) — this module defines the shape of the document and leans on
//! `serde`/`serde_json` to do the actual parsing rather than hand-rolling a
//! JSON parser.

use serde::{Deserialize, Serialize};

use crate::error::{ComtError, ComtResult};

/// Inclusive tile bounds for one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileMatrixLimits {
    pub min_tile_col: u64,
    pub min_tile_row: u64,
    pub max_tile_col: u64,
    pub max_tile_row: u64,
}

impl TileMatrixLimits {
    #[must_use]
    pub fn contains(&self, x: u64, y: u64) -> bool {
        x >= self.min_tile_col
            && x <= self.max_tile_col
            && y >= self.min_tile_row
            && y <= self.max_tile_row
    }

    #[must_use]
    pub fn num_cols(&self) -> u64 {
        self.max_tile_col - self.min_tile_col + 1
    }

    #[must_use]
    pub fn num_rows(&self) -> u64 {
        self.max_tile_row - self.min_tile_row + 1
    }

    #[must_use]
    pub fn num_tiles(&self) -> u64 {
        self.num_cols() * self.num_rows()
    }

    /// Intersects two (non-negative) bounds, as used for sparse fragment
    /// bounds (spec.md §4.1).
    #[must_use]
    pub fn intersect(&self, other: &TileMatrixLimits) -> TileMatrixLimits {
        TileMatrixLimits {
            min_tile_col: self.min_tile_col.max(other.min_tile_col),
            min_tile_row: self.min_tile_row.max(other.min_tile_row),
            max_tile_col: self.max_tile_col.min(other.max_tile_col),
            max_tile_row: self.max_tile_row.min(other.max_tile_row),
        }
    }
}

/// Describes one zoom level: its extent and fragmentation policy.
///
/// `aggregation_coefficient == -1` marks a *pyramid* zoom; otherwise the
/// fragment side length is `2^coeff` tiles (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileMatrix {
    pub zoom: u8,
    pub aggregation_coefficient: i32,
    pub tile_matrix_limits: TileMatrixLimits,
}

impl TileMatrix {
    /// Whether this zoom's index lives in the always-resident pyramid buffer.
    #[must_use]
    pub fn is_pyramid(&self) -> bool {
        self.aggregation_coefficient == -1
    }

    /// Fragment side length in tiles (`2^coeff`). Only meaningful when
    /// `!is_pyramid()`.
    #[must_use]
    pub fn fragment_side(&self) -> u64 {
        debug_assert!(!self.is_pyramid());
        1u64 << self.aggregation_coefficient
    }

    #[must_use]
    pub fn num_tiles(&self) -> u64 {
        self.tile_matrix_limits.num_tiles()
    }

    /// Number of distinct fragment cells this zoom's limits touch.
    #[must_use]
    pub fn num_fragments(&self) -> u64 {
        debug_assert!(!self.is_pyramid());
        let f = self.fragment_side();
        let limits = &self.tile_matrix_limits;
        let min_fc = limits.min_tile_col / f;
        let max_fc = limits.max_tile_col / f;
        let min_fr = limits.min_tile_row / f;
        let max_fr = limits.max_tile_row / f;
        (max_fc - min_fc + 1) * (max_fr - min_fr + 1)
    }

    /// Dense fragment bounds (before intersecting with `tile_matrix_limits`)
    /// for the fragment containing `(x, y)`.
    #[must_use]
    pub fn dense_fragment_bounds(&self, x: u64, y: u64) -> TileMatrixLimits {
        let f = self.fragment_side();
        let fc = x / f;
        let fr = y / f;
        TileMatrixLimits {
            min_tile_col: fc * f,
            min_tile_row: fr * f,
            max_tile_col: fc * f + f - 1,
            max_tile_row: fr * f + f - 1,
        }
    }

    /// Sparse (in-range) fragment bounds for the fragment containing `(x, y)`.
    #[must_use]
    pub fn sparse_fragment_bounds(&self, x: u64, y: u64) -> TileMatrixLimits {
        self.dense_fragment_bounds(x, y)
            .intersect(&self.tile_matrix_limits)
    }
}

/// Coordinate reference system of the tile matrix set. Only
/// `WebMercatorQuad` is supported (spec.md §3 invariant 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileMatrixCrs {
    WebMercatorQuad,
    #[serde(other)]
    Other,
}

/// Fragment/tile enumeration order. Only `RowMajor` (or unset, which
/// defaults to `RowMajor`) is supported (spec.md §3 invariant 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Ordering {
    #[default]
    RowMajor,
    #[serde(other)]
    Other,
}

/// The full COMTiles metadata document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileMatrixSet {
    #[serde(rename = "tileMatrixCRS")]
    pub tile_matrix_crs: TileMatrixCrs,
    pub tile_format: String,
    #[serde(default)]
    pub fragment_ordering: Option<Ordering>,
    #[serde(default)]
    pub tile_ordering: Option<Ordering>,
    pub tile_matrix_set: Vec<TileMatrix>,

    /// Fields beyond what `IndexGeometry` consumes (title, bounds, vector
    /// layers, ...) are preserved verbatim rather than reimplemented, since
    /// the metadata document's JSON shape is an external collaborator
    /// (spec.md §1).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TileMatrixSet {
    /// Validates the document against spec.md §3 invariant 7 / §4.1 failure
    /// modes. Called once by `ArchiveReader` during header bootstrap.
    ///
    /// # Errors
    /// Returns `UnsupportedCrs`, `UnsupportedOrdering`, or
    /// `UnsupportedTileFormat` as appropriate.
    pub fn validate(&self) -> ComtResult<()> {
        if self.tile_matrix_crs != TileMatrixCrs::WebMercatorQuad {
            return Err(ComtError::UnsupportedCrs(format!(
                "{:?}",
                self.tile_matrix_crs
            )));
        }
        for ordering in [self.fragment_ordering, self.tile_ordering]
            .into_iter()
            .flatten()
        {
            if ordering != Ordering::RowMajor {
                return Err(ComtError::UnsupportedOrdering(format!("{ordering:?}")));
            }
        }
        if self.tile_format != "pbf" {
            return Err(ComtError::UnsupportedTileFormat(self.tile_format.clone()));
        }
        Ok(())
    }

    #[must_use]
    pub fn tile_matrix(&self, zoom: u8) -> Option<&TileMatrix> {
        self.tile_matrix_set.iter().find(|tm| tm.zoom == zoom)
    }

    /// Highest zoom whose tiles live in the pyramid (compressed, always
    /// resident) portion of the index.
    #[must_use]
    pub fn pyramid_max_zoom(&self) -> Option<u8> {
        self.tile_matrix_set
            .iter()
            .filter(|tm| tm.is_pyramid())
            .map(|tm| tm.zoom)
            .max()
    }

    /// Total decompressed pyramid index length in bytes (spec.md §3
    /// invariant 2): `3 * sum(numTiles(z))` for `z <= pyramidMaxZoom`.
    #[must_use]
    pub fn pyramid_index_len(&self) -> u64 {
        self.tile_matrix_set
            .iter()
            .filter(|tm| tm.is_pyramid())
            .map(|tm| tm.num_tiles() * 3)
            .sum()
    }
}
