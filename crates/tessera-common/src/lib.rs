//! # Tessera Common
//!
//! Shared value types for the Tessera clipmap terrain.
//!
//! This crate provides the types every other crate agrees on:
//! - Tile and sample coordinates
//! - Dirty regions and their level-to-level propagation
//! - Dataset configuration and runtime settings
//! - Common error types
//! - Rays, bounding boxes and the terrain transform

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod coords;
pub mod error;
pub mod math;
pub mod region;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::*;
    pub use crate::coords::*;
    pub use crate::error::*;
    pub use crate::math::*;
    pub use crate::region::*;
}

pub use prelude::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_coord_conversion() {
        let tile = TileCoord::containing(300, -5, 128);
        assert_eq!(tile, TileCoord::new(2, -1));
        assert_eq!(tile.sample_origin(128), (256, -128));
        assert_eq!(tile.local_index(300, -5, 128), Some(123 * 128 + 44));
        assert_eq!(tile.local_index(0, 0, 128), None);
    }

    #[test]
    fn test_toroidal_wrap() {
        assert_eq!(wrap(-1, 129), 128);
        assert_eq!(wrap(129, 129), 0);
        assert_eq!(wrap(5, 129), 5);
    }

    #[test]
    fn test_div_ceil() {
        assert_eq!(div_ceil(9, 2), 5);
        assert_eq!(div_ceil(8, 2), 4);
        assert_eq!(div_ceil(-3, 2), -1);
        assert_eq!(div_ceil(-4, 2), -2);
    }

    #[test]
    fn test_tile_display() {
        assert_eq!(Tile::new(3, -1, 2).to_string(), "L3(-1, 2)");
        assert_eq!(vertex_distance(3), 8);
    }
}
