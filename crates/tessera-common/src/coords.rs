//! Coordinate types for tiles and per-level sample grids.
//!
//! Every clip level has its own integer sample grid. Sample `(i, j)` of level
//! `L` sits at terrain-local position `(i * 2^L, j * 2^L)`; `2^L` is the
//! level's vertex distance. Tiles partition a level's sample grid into
//! `tile_size × tile_size` blocks.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Tile coordinate within one clip level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Pod, Zeroable)]
#[repr(C)]
pub struct TileCoord {
    /// X coordinate in tile space
    pub x: i32,
    /// Y coordinate in tile space
    pub y: i32,
}

impl TileCoord {
    /// Creates a new tile coordinate.
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Returns the tile containing the given sample.
    #[must_use]
    pub const fn containing(sample_x: i32, sample_y: i32, tile_size: u32) -> Self {
        let size = tile_size as i32;
        Self {
            x: sample_x.div_euclid(size),
            y: sample_y.div_euclid(size),
        }
    }

    /// Returns the first sample covered by this tile.
    #[must_use]
    pub const fn sample_origin(self, tile_size: u32) -> (i32, i32) {
        let size = tile_size as i32;
        (self.x * size, self.y * size)
    }

    /// Converts a sample to its linear index inside this tile, if it is covered.
    #[must_use]
    pub fn local_index(self, sample_x: i32, sample_y: i32, tile_size: u32) -> Option<usize> {
        let (ox, oy) = self.sample_origin(tile_size);
        let size = tile_size as i32;
        let lx = sample_x - ox;
        let ly = sample_y - oy;
        if lx < 0 || ly < 0 || lx >= size || ly >= size {
            return None;
        }
        Some((ly * size + lx) as usize)
    }

    /// Returns whether both coordinates are non-negative.
    #[must_use]
    pub const fn is_positive_quadrant(self) -> bool {
        self.x >= 0 && self.y >= 0
    }
}

/// A fixed-size block of data at a given clip level. Used as an immutable key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile {
    /// Clip level (0 = finest)
    pub level: u32,
    /// Tile coordinate inside the level
    pub coord: TileCoord,
}

impl Tile {
    /// Creates a new tile key.
    #[must_use]
    pub const fn new(level: u32, x: i32, y: i32) -> Self {
        Self {
            level,
            coord: TileCoord::new(x, y),
        }
    }
}

impl std::fmt::Display for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}({}, {})", self.level, self.coord.x, self.coord.y)
    }
}

/// Returns the vertex distance of a level in terrain-local units.
#[must_use]
pub const fn vertex_distance(level: u32) -> i32 {
    1 << level
}

/// Wraps a sample coordinate into a toroidal buffer of the given side length.
#[must_use]
pub const fn wrap(coord: i32, size: u32) -> usize {
    coord.rem_euclid(size as i32) as usize
}

/// Integer division rounding towards positive infinity.
#[must_use]
pub const fn div_ceil(value: i32, divisor: i32) -> i32 {
    let quotient = value.div_euclid(divisor);
    if value.rem_euclid(divisor) == 0 {
        quotient
    } else {
        quotient + 1
    }
}
