//! A directory-tree stand-in for a real tile database.
//!
//! The MBTiles reader spec.md §6's `comtiles-convert` front-end normally
//! sits on is explicitly out of scope (spec.md §1 Non-goals). This module
//! walks a `{z}/{x}/{y}.pbf[.gz]` directory tree instead, so the `convert`
//! subcommand and its tests have a `TileSource` to drive without pulling in
//! an MBTiles/SQLite dependency. It is not a substitute for one.

use std::fs;
use std::io::{Read, Write as _};
use std::path::{Path, PathBuf};

use comtiles::{ComtError, ComtResult, Ordering, TileCoord, TileMatrix, TileMatrixCrs, TileMatrixLimits, TileMatrixSet, TileRecord, TileSource};
use flate2::Compression;
use flate2::write::GzEncoder;

/// Fragment side length (`2^3 = 8`) used for every zoom above
/// `pyramidMaxZoom`. A fixed coefficient keeps this stand-in simple; a real
/// producer would likely pick it per zoom based on expected tile density.
const FRAGMENT_AGGREGATION_COEFFICIENT: i32 = 3;

/// A `{z}/{x}/{y}.pbf` (optionally `.pbf.gz`) tree read as a [`TileSource`].
pub struct DirTileSource {
    root: PathBuf,
    metadata: TileMatrixSet,
    /// Tile addresses in the exact row-major / fragment-major order
    /// `IndexGeometry` expects, precomputed once so every call to
    /// [`TileSource::records`] replays the same sequence.
    plan: Vec<TileCoord>,
}

impl DirTileSource {
    /// Walks `root` and builds a `TileMatrixSet` from the zoom/col/row
    /// directories actually present on disk, splitting zooms at
    /// `pyramid_max_zoom`: `z <= pyramid_max_zoom` becomes a pyramid zoom,
    /// everything above becomes fragmented.
    ///
    /// # Errors
    /// Returns an I/O error if `root` cannot be walked, or
    /// [`ComtError::InvalidMetadata`] if no tiles are found at all.
    pub fn discover(root: &Path, pyramid_max_zoom: u8) -> ComtResult<Self> {
        let mut bounds: Vec<(u8, TileMatrixLimits)> = Vec::new();

        for zoom_entry in read_numeric_dirs(root)? {
            let (zoom_name, zoom_path) = zoom_entry;
            let Ok(zoom) = zoom_name.parse::<u8>() else {
                continue;
            };
            let mut min_col = u64::MAX;
            let mut max_col = 0u64;
            let mut min_row = u64::MAX;
            let mut max_row = 0u64;
            let mut found = false;

            for (col_name, col_path) in read_numeric_dirs(&zoom_path)? {
                let Ok(col) = col_name.parse::<u64>() else {
                    continue;
                };
                for entry in fs::read_dir(&col_path)? {
                    let entry = entry?;
                    let Some(row) = tile_row_from_filename(&entry.path()) else {
                        continue;
                    };
                    found = true;
                    min_col = min_col.min(col);
                    max_col = max_col.max(col);
                    min_row = min_row.min(row);
                    max_row = max_row.max(row);
                }
            }

            if found {
                bounds.push((
                    zoom,
                    TileMatrixLimits {
                        min_tile_col: min_col,
                        min_tile_row: min_row,
                        max_tile_col: max_col,
                        max_tile_row: max_row,
                    },
                ));
            }
        }

        if bounds.is_empty() {
            return Err(ComtError::InvalidMetadata(format!(
                "no tiles found under {}",
                root.display()
            )));
        }
        bounds.sort_by_key(|(zoom, _)| *zoom);

        let tile_matrix_set: Vec<TileMatrix> = bounds
            .into_iter()
            .map(|(zoom, tile_matrix_limits)| TileMatrix {
                zoom,
                aggregation_coefficient: if zoom <= pyramid_max_zoom {
                    -1
                } else {
                    FRAGMENT_AGGREGATION_COEFFICIENT
                },
                tile_matrix_limits,
            })
            .collect();

        let metadata = TileMatrixSet {
            tile_matrix_crs: TileMatrixCrs::WebMercatorQuad,
            tile_format: "pbf".into(),
            fragment_ordering: Some(Ordering::RowMajor),
            tile_ordering: Some(Ordering::RowMajor),
            tile_matrix_set,
            extra: serde_json::Map::new(),
        };

        let plan = build_plan(&metadata);

        Ok(Self {
            root: root.to_path_buf(),
            metadata,
            plan,
        })
    }

    #[must_use]
    pub fn metadata(&self) -> &TileMatrixSet {
        &self.metadata
    }

    fn tile_path(&self, coord: TileCoord) -> Option<PathBuf> {
        let dir = self.root.join(coord.z.to_string()).join(coord.x.to_string());
        for candidate in [
            dir.join(format!("{}.pbf.gz", coord.y)),
            dir.join(format!("{}.pbf", coord.y)),
            dir.join(format!("{}.mvt.gz", coord.y)),
            dir.join(format!("{}.mvt", coord.y)),
        ] {
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    fn load_record(&self, coord: TileCoord) -> ComtResult<TileRecord> {
        let Some(path) = self.tile_path(coord) else {
            return Ok(TileRecord {
                coord,
                size: 0,
                payload: None,
            });
        };

        let raw = fs::read(&path)?;
        let gzipped = if raw.starts_with(&[0x1f, 0x8b]) {
            raw
        } else {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&raw)?;
            encoder.finish()?
        };

        let size = u32::try_from(gzipped.len())
            .map_err(|_| ComtError::TileTooLarge(gzipped.len() as u64))?;
        Ok(TileRecord {
            coord,
            size,
            payload: Some(gzipped.into()),
        })
    }
}

impl TileSource for DirTileSource {
    fn records(&self) -> Box<dyn Iterator<Item = ComtResult<TileRecord>> + '_> {
        Box::new(self.plan.iter().map(|&coord| self.load_record(coord)))
    }
}

/// Lays out the TMS-row/col addresses for every zoom in `metadata`, in the
/// exact ordinal order `IndexGeometry::offset_in_index` assigns: ascending
/// zoom, row-major within a pyramid zoom, fragment-row-major-then-tile-
/// row-major within a fragmented one.
fn build_plan(metadata: &TileMatrixSet) -> Vec<TileCoord> {
    let mut plan = Vec::new();
    for tm in &metadata.tile_matrix_set {
        if tm.is_pyramid() {
            let limits = &tm.tile_matrix_limits;
            for row in limits.min_tile_row..=limits.max_tile_row {
                for col in limits.min_tile_col..=limits.max_tile_col {
                    plan.push(TileCoord::new(tm.zoom, col, row));
                }
            }
        } else {
            let f = tm.fragment_side();
            let limits = &tm.tile_matrix_limits;
            let min_fc = limits.min_tile_col / f;
            let max_fc = limits.max_tile_col / f;
            let min_fr = limits.min_tile_row / f;
            let max_fr = limits.max_tile_row / f;
            for fr in min_fr..=max_fr {
                for fc in min_fc..=max_fc {
                    let sfb = tm.sparse_fragment_bounds(fc * f, fr * f);
                    for row in sfb.min_tile_row..=sfb.max_tile_row {
                        for col in sfb.min_tile_col..=sfb.max_tile_col {
                            plan.push(TileCoord::new(tm.zoom, col, row));
                        }
                    }
                }
            }
        }
    }
    plan
}

fn read_numeric_dirs(dir: &Path) -> ComtResult<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir()
            && let Some(name) = entry.file_name().to_str()
        {
            out.push((name.to_string(), entry.path()));
        }
    }
    Ok(out)
}

fn tile_row_from_filename(path: &Path) -> Option<u64> {
    let stem = path.file_name()?.to_str()?;
    let stem = stem.strip_suffix(".gz").unwrap_or(stem);
    let stem = stem.strip_suffix(".pbf").or_else(|| stem.strip_suffix(".mvt"))?;
    stem.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_tile(root: &Path, z: u8, x: u64, y: u64, data: &[u8]) {
        let dir = root.join(z.to_string()).join(x.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{y}.pbf")), data).unwrap();
    }

    #[test]
    fn discovers_bounds_and_plans_row_major_pyramid_order() {
        let dir = tempfile::tempdir().unwrap();
        write_tile(dir.path(), 1, 0, 0, b"a");
        write_tile(dir.path(), 1, 1, 0, b"b");
        write_tile(dir.path(), 1, 0, 1, b"c");
        write_tile(dir.path(), 1, 1, 1, b"d");

        let source = DirTileSource::discover(dir.path(), 7).unwrap();
        assert_eq!(source.metadata().tile_matrix_set.len(), 1);
        assert_eq!(
            source.plan,
            vec![
                TileCoord::new(1, 0, 0),
                TileCoord::new(1, 1, 0),
                TileCoord::new(1, 0, 1),
                TileCoord::new(1, 1, 1),
            ]
        );
    }

    #[test]
    fn missing_tile_in_bounds_yields_zero_size_record() {
        let dir = tempfile::tempdir().unwrap();
        write_tile(dir.path(), 1, 0, 0, b"a");
        write_tile(dir.path(), 1, 1, 1, b"d");

        let source = DirTileSource::discover(dir.path(), 7).unwrap();
        let records: Vec<_> = source.records().collect::<ComtResult<_>>().unwrap();
        let gap = records
            .iter()
            .find(|r| r.coord == TileCoord::new(1, 1, 0))
            .unwrap();
        assert_eq!(gap.size, 0);
        assert!(gap.payload.is_none());
    }

    #[test]
    fn rejects_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DirTileSource::discover(dir.path(), 7).is_err());
    }
}
