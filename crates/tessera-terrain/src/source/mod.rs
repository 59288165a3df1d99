//! Data sources feeding the tile caches.
//!
//! Sources are called from fetch workers and may be slow. They report tiles
//! outside their dataset as `Ok(None)`.

mod array;
mod procedural;

pub use array::ArrayTerrainSource;
pub use procedural::{HeightFunction, NoiseConfig, ProceduralTerrainSource, ProceduralTextureSource};

use tessera_common::{SourceError, TerrainConfiguration, TextureConfiguration, TileCoord};

/// Provider of height tiles.
pub trait TerrainSource: Send + Sync {
    /// Describes the dataset.
    fn configuration(&self) -> TerrainConfiguration;

    /// Produces the `tile_size²` heights of one tile, row-major.
    fn tile(&self, level: u32, tile: TileCoord) -> Result<Option<Vec<f32>>, SourceError>;
}

/// Provider of RGBA texel tiles.
pub trait TextureSource: Send + Sync {
    /// Name used to look the texture clipmap up.
    fn name(&self) -> &str;

    /// Describes the dataset.
    fn configuration(&self) -> TextureConfiguration;

    /// Produces the `tile_size²` texels of one tile, row-major.
    fn tile(&self, level: u32, tile: TileCoord) -> Result<Option<Vec<[u8; 4]>>, SourceError>;
}
