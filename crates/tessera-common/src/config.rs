//! Dataset descriptions and runtime tuning for the clipmap terrain.
//!
//! [`TerrainConfiguration`] and [`TextureConfiguration`] describe a dataset and
//! are immutable once a terrain is built. [`TerrainSettings`] carries the
//! timing and sizing knobs of the update loop and is typically loaded from a
//! TOML file with every field defaulted.

use std::time::Duration;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::coords::div_ceil;
use crate::error::{TerrainError, TerrainResult};

/// Description of a height dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfiguration {
    /// Number of clip levels the source can serve
    pub clipmap_levels: u32,
    /// Samples per tile side
    pub tile_size: u32,
    /// Tiles per side kept resident around the window
    pub cache_grid_size: u32,
    /// World units per level-0 sample on x/z, height scale on y
    pub scale: Vec3,
    /// Lowest height the source produces
    pub height_range_min: f32,
    /// Highest height the source produces
    pub height_range_max: f32,
    /// Treat tiles with negative coordinates as empty
    pub only_positive_quadrant: bool,
}

impl Default for TerrainConfiguration {
    fn default() -> Self {
        Self {
            clipmap_levels: 8,
            tile_size: 128,
            cache_grid_size: 4,
            scale: Vec3::ONE,
            height_range_min: 0.0,
            height_range_max: 1.0,
            only_positive_quadrant: false,
        }
    }
}

impl TerrainConfiguration {
    /// Creates a configuration with the given level count and tile size.
    #[must_use]
    pub fn new(clipmap_levels: u32, tile_size: u32, scale: Vec3) -> Self {
        Self {
            clipmap_levels,
            tile_size,
            scale,
            ..Self::default()
        }
    }

    /// Sets the number of tiles per side kept resident.
    #[must_use]
    pub fn with_cache_grid_size(mut self, cache_grid_size: u32) -> Self {
        self.cache_grid_size = cache_grid_size;
        self
    }

    /// Sets the height range of the dataset.
    #[must_use]
    pub fn with_height_range(mut self, min: f32, max: f32) -> Self {
        self.height_range_min = min;
        self.height_range_max = max;
        self
    }

    /// Restricts the dataset to non-negative tile coordinates.
    #[must_use]
    pub fn with_only_positive_quadrant(mut self, only_positive_quadrant: bool) -> Self {
        self.only_positive_quadrant = only_positive_quadrant;
        self
    }

    /// Number of samples in one tile.
    #[must_use]
    pub fn tile_samples(&self) -> usize {
        (self.tile_size as usize) * (self.tile_size as usize)
    }

    /// Validates the configuration against a clip side size.
    pub fn validate(&self, clip_side_size: u32) -> TerrainResult<()> {
        if self.clipmap_levels == 0 {
            return Err(TerrainError::InvalidConfiguration(
                "terrain needs at least one clip level".into(),
            ));
        }
        if self.tile_size == 0 {
            return Err(TerrainError::InvalidConfiguration(
                "tile size must be positive".into(),
            ));
        }
        if self.scale.x <= 0.0 || self.scale.z <= 0.0 {
            return Err(TerrainError::InvalidConfiguration(format!(
                "horizontal scale must be positive, got {}",
                self.scale
            )));
        }
        if self.height_range_max < self.height_range_min {
            return Err(TerrainError::InvalidConfiguration(format!(
                "height range is inverted ({} > {})",
                self.height_range_min, self.height_range_max
            )));
        }
        let needed = min_cache_grid_size(clip_side_size, self.tile_size);
        if self.cache_grid_size < needed {
            return Err(TerrainError::InvalidConfiguration(format!(
                "cache grid of {} tiles cannot cover a {clip_side_size} sample window \
                 with {} sample tiles (need {needed})",
                self.cache_grid_size, self.tile_size
            )));
        }
        Ok(())
    }
}

/// Pixel layout used when uploading texels to the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TextureStoreFormat {
    /// Four 8-bit channels
    #[default]
    Rgba8,
    /// Three 8-bit channels, alpha dropped on upload
    Rgb8,
}

impl TextureStoreFormat {
    /// Bytes per uploaded texel.
    #[must_use]
    pub const fn bytes_per_texel(self) -> usize {
        match self {
            Self::Rgba8 => 4,
            Self::Rgb8 => 3,
        }
    }
}

/// Description of a texture dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextureConfiguration {
    /// Number of levels the source can serve
    pub valid_levels: u32,
    /// Texels per tile side
    pub tile_size: u32,
    /// Tiles per side kept resident around the window
    pub cache_grid_size: u32,
    /// Level-0 texels per terrain unit
    pub texture_density: f32,
    /// Upload layout
    pub store_format: TextureStoreFormat,
    /// Treat tiles with negative coordinates as empty
    pub only_positive_quadrant: bool,
}

impl Default for TextureConfiguration {
    fn default() -> Self {
        Self {
            valid_levels: 8,
            tile_size: 128,
            cache_grid_size: 4,
            texture_density: 1.0,
            store_format: TextureStoreFormat::Rgba8,
            only_positive_quadrant: false,
        }
    }
}

impl TextureConfiguration {
    /// Number of texels in one tile.
    #[must_use]
    pub fn tile_samples(&self) -> usize {
        (self.tile_size as usize) * (self.tile_size as usize)
    }

    /// Validates the configuration against a texture clipmap size.
    pub fn validate(&self, texture_clipmap_size: u32) -> TerrainResult<()> {
        if self.valid_levels == 0 || self.tile_size == 0 {
            return Err(TerrainError::InvalidConfiguration(
                "texture source needs at least one level and a positive tile size".into(),
            ));
        }
        if self.texture_density <= 0.0 {
            return Err(TerrainError::InvalidConfiguration(format!(
                "texture density must be positive, got {}",
                self.texture_density
            )));
        }
        let needed = min_cache_grid_size(texture_clipmap_size, self.tile_size);
        if self.cache_grid_size < needed {
            return Err(TerrainError::InvalidConfiguration(format!(
                "texture cache grid of {} tiles is too small (need {needed})",
                self.cache_grid_size
            )));
        }
        Ok(())
    }
}

/// Smallest tile grid that always covers a `window`-sample window.
#[must_use]
pub fn min_cache_grid_size(window: u32, tile_size: u32) -> u32 {
    if tile_size == 0 {
        return u32::MAX;
    }
    div_ceil(window as i32, tile_size as i32) as u32 + 1
}

/// Runtime tuning of the clipmap update loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainSettings {
    /// Vertices per clip level side, `2^k + 1` with `k >= 4`
    pub clip_side_size: u32,
    /// Texels per texture clipmap layer side
    pub texture_clipmap_size: u32,
    /// Background cache poll period in milliseconds
    pub cache_poll_interval_ms: u64,
    /// Accumulated time before the mailbox is drained, in milliseconds
    pub mailbox_update_threshold_ms: u64,
    /// Minimum period between refreshes of levels finer than the visible one
    pub non_visible_update_rate_ms: u64,
    /// Coordinate divisor applied when a region is propagated one level down
    pub region_coarsening_ratio: u32,
    /// Fetch worker threads (0 = fetch inline)
    pub fetch_workers: usize,
    /// Maximum queued fetch jobs
    pub fetch_queue_capacity: usize,
}

impl Default for TerrainSettings {
    fn default() -> Self {
        Self {
            clip_side_size: 129,
            texture_clipmap_size: 128,
            cache_poll_interval_ms: 250,
            mailbox_update_threshold_ms: 300,
            non_visible_update_rate_ms: 500,
            region_coarsening_ratio: 2,
            fetch_workers: 2,
            fetch_queue_capacity: 256,
        }
    }
}

impl TerrainSettings {
    /// Background cache poll period.
    #[must_use]
    pub fn cache_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cache_poll_interval_ms)
    }

    /// Mailbox drain threshold.
    #[must_use]
    pub fn mailbox_update_threshold(&self) -> Duration {
        Duration::from_millis(self.mailbox_update_threshold_ms)
    }

    /// Refresh period of non-visible levels.
    #[must_use]
    pub fn non_visible_update_rate(&self) -> Duration {
        Duration::from_millis(self.non_visible_update_rate_ms)
    }

    /// Checks the settings and fails on the first invalid value.
    pub fn validate(&self) -> TerrainResult<()> {
        validate_clip_side_size(self.clip_side_size)?;
        if self.texture_clipmap_size < 16 {
            return Err(TerrainError::InvalidConfiguration(format!(
                "texture clipmap size {} is below 16",
                self.texture_clipmap_size
            )));
        }
        if self.region_coarsening_ratio == 0 {
            return Err(TerrainError::InvalidConfiguration(
                "region coarsening ratio must be at least 1".into(),
            ));
        }
        if self.cache_poll_interval_ms == 0 {
            return Err(TerrainError::InvalidConfiguration(
                "cache poll interval must be positive".into(),
            ));
        }
        if self.mailbox_update_threshold_ms == 0 {
            return Err(TerrainError::InvalidConfiguration(
                "mailbox update threshold must be positive".into(),
            ));
        }
        if self.fetch_queue_capacity == 0 {
            return Err(TerrainError::InvalidConfiguration(
                "fetch queue capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Checks that a clip side size has the form `2^k + 1` with `k >= 4`.
pub fn validate_clip_side_size(size: u32) -> TerrainResult<()> {
    let inner = size.wrapping_sub(1);
    if size < 17 || !inner.is_power_of_two() {
        return Err(TerrainError::InvalidConfiguration(format!(
            "clip side size {size} must be 2^k + 1 with k >= 4"
        )));
    }
    Ok(())
}
