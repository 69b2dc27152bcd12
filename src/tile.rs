//! Tile coordinates and the XYZ/TMS axis convention (spec.md §3 invariant 6).
//!
//! COMTiles mandates plain row-major ordering (spec.md §1 Non-goals: "other
//! CRSs and space-filling curves are explicit non-goals") — there is no
//! tile-id curve to compute here, just the XYZ/TMS row flip.

/// An XYZ tile address, as used by web map clients (origin north).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub z: u8,
    pub x: u64,
    pub y: u64,
}

impl TileCoord {
    #[must_use]
    pub fn new(z: u8, x: u64, y: u64) -> Self {
        Self { z, x, y }
    }

    /// Converts this XYZ address to the archive's TMS (origin south) row
    /// convention: `tmsY = (1 << z) - y - 1`.
    #[must_use]
    pub fn to_tms_row(self) -> u64 {
        (1u64 << self.z) - self.y - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_flip() {
        // spec.md §8 scenario (f): z=3, x=4, y=2 -> tms row 5.
        let coord = TileCoord::new(3, 4, 2);
        assert_eq!(coord.to_tms_row(), 5);
    }

    #[test]
    fn axis_flip_is_involutive_at_same_zoom() {
        let z = 4u8;
        for y in 0..(1u64 << z) {
            let coord = TileCoord::new(z, 0, y);
            let tms_row = coord.to_tms_row();
            let back = TileCoord::new(z, 0, tms_row).to_tms_row();
            assert_eq!(back, y);
        }
    }
}
