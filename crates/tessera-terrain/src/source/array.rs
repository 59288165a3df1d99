//! In-memory height field source.

use tessera_common::{SourceError, TerrainConfiguration, TerrainError, TerrainResult, TileCoord};

/// Serves tiles from a height array held in memory.
///
/// Coarser levels are point decimated: sample `(i, j)` of level `L` is base
/// sample `(i << L, j << L)`. Samples outside the array belong to tiles that
/// are reported as missing when the whole tile is out of range, and are
/// clamped to the edge otherwise.
#[derive(Debug, Clone)]
pub struct ArrayTerrainSource {
    heights: Vec<f32>,
    width: u32,
    height: u32,
    configuration: TerrainConfiguration,
}

impl ArrayTerrainSource {
    /// Wraps a `width × height` row-major height array.
    pub fn new(
        heights: Vec<f32>,
        width: u32,
        height: u32,
        configuration: TerrainConfiguration,
    ) -> TerrainResult<Self> {
        let expected = width as usize * height as usize;
        if expected == 0 || heights.len() != expected {
            return Err(TerrainError::InvalidConfiguration(format!(
                "height array holds {} samples, expected {width}x{height}",
                heights.len()
            )));
        }
        let (min, max) = heights
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), &h| (lo.min(h), hi.max(h)));
        let configuration = configuration
            .with_height_range(min, max)
            .with_only_positive_quadrant(true);
        Ok(Self {
            heights,
            width,
            height,
            configuration,
        })
    }

    /// Base array dimensions.
    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn base_sample(&self, x: i64, y: i64) -> f32 {
        let x = x.clamp(0, i64::from(self.width) - 1) as usize;
        let y = y.clamp(0, i64::from(self.height) - 1) as usize;
        self.heights[y * self.width as usize + x]
    }
}

impl super::TerrainSource for ArrayTerrainSource {
    fn configuration(&self) -> TerrainConfiguration {
        self.configuration.clone()
    }

    fn tile(&self, level: u32, tile: TileCoord) -> Result<Option<Vec<f32>>, SourceError> {
        if level >= self.configuration.clipmap_levels {
            return Err(SourceError::TileUnavailable {
                level,
                x: tile.x,
                y: tile.y,
            });
        }
        let ts = i64::from(self.configuration.tile_size);
        let origin_x = i64::from(tile.x) * ts;
        let origin_y = i64::from(tile.y) * ts;
        let level_width = ((i64::from(self.width) - 1) >> level) + 1;
        let level_height = ((i64::from(self.height) - 1) >> level) + 1;
        if origin_x < 0 || origin_y < 0 || origin_x >= level_width || origin_y >= level_height {
            return Ok(None);
        }

        let mut samples = Vec::with_capacity((ts * ts) as usize);
        for j in 0..ts {
            for i in 0..ts {
                samples.push(self.base_sample((origin_x + i) << level, (origin_y + j) << level));
            }
        }
        Ok(Some(samples))
    }
}
