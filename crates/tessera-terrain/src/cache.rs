//! Height caches: one windowed tile store per clip level.

use std::sync::Arc;

use tessera_common::{vertex_distance, wrap, Region, TerrainConfiguration};

use crate::clipmap_level::ClipVertex;
use crate::fetch::FetchPool;
use crate::source::TerrainSource;
use crate::tile_window::{FetchFn, RegionMailbox, TileWindow, TileWindowConfig};

/// Height used where no level has data.
pub const DEFAULT_HEIGHT: f32 = 0.0;

/// Height data of one clip level.
///
/// Caches are shared between the main thread, which writes vertices from
/// them, and the background updater, which polls completed fetches.
pub trait TerrainCache: Send + Sync {
    /// Clip level served by this cache.
    fn level(&self) -> u32;

    /// Installs the mailbox that receives regions of newly resident tiles.
    fn set_mailbox(&self, mailbox: RegionMailbox);

    /// Centers the cache window on level sample `(x, y)`.
    fn set_current_position(&self, x: i32, y: i32) -> bool;

    /// Promotes completed fetches. Returns the number of new resident tiles.
    fn check_for_updates(&self) -> usize;

    /// Writes the vertices of a sub-rectangle into a toroidal buffer of side
    /// `target_size`. Never fetches.
    fn update_region(
        &self,
        target: &mut [ClipVertex],
        target_size: u32,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    );

    /// Bilinear height at terrain-local `(x, z)` from this level only.
    fn sub_height(&self, x: f32, z: f32) -> Option<f32>;

    /// Returns `true` when the whole window is backed by valid tiles.
    fn is_valid(&self) -> bool;

    /// Largest valid rectangle inside the window.
    fn valid_region(&self) -> Option<Region>;

    /// Next coarser cache.
    fn parent(&self) -> Option<&Arc<dyn TerrainCache>>;

    /// Number of resident tiles.
    fn resident_tiles(&self) -> usize {
        0
    }

    /// Height at terrain-local `(x, z)`, falling back to coarser levels.
    fn get_sub_height(&self, x: f32, z: f32, try_parent: bool) -> f32 {
        if let Some(height) = self.sub_height(x, z) {
            return height;
        }
        match self.parent() {
            Some(parent) if try_parent => parent.get_sub_height(x, z, true),
            _ => DEFAULT_HEIGHT,
        }
    }
}

/// Tile-grid backed [`TerrainCache`].
pub struct TerrainGridCache {
    level: u32,
    configuration: Arc<TerrainConfiguration>,
    tiles: TileWindow<f32>,
    parent: Option<Arc<dyn TerrainCache>>,
}

impl TerrainGridCache {
    /// Creates the cache of `level`, fetching from `source` on `pool`.
    pub fn new(
        parent: Option<Arc<dyn TerrainCache>>,
        source: Arc<dyn TerrainSource>,
        level: u32,
        window_size: u32,
        configuration: Arc<TerrainConfiguration>,
        pool: Arc<FetchPool>,
    ) -> Self {
        let fetch: FetchFn<f32> = Arc::new(move |level, coord| source.tile(level, coord));
        Self::with_fetch(parent, fetch, level, window_size, configuration, pool)
    }

    /// Creates the cache with a custom fetch function.
    pub fn with_fetch(
        parent: Option<Arc<dyn TerrainCache>>,
        fetch: FetchFn<f32>,
        level: u32,
        window_size: u32,
        configuration: Arc<TerrainConfiguration>,
        pool: Arc<FetchPool>,
    ) -> Self {
        let tiles = TileWindow::new(
            TileWindowConfig {
                level,
                tile_size: configuration.tile_size,
                window_size,
                cache_grid_size: configuration.cache_grid_size,
                only_positive_quadrant: configuration.only_positive_quadrant,
            },
            fetch,
            pool,
        );
        Self {
            level,
            configuration,
            tiles,
            parent,
        }
    }

    /// Underlying tile window.
    #[must_use]
    pub fn tiles(&self) -> &TileWindow<f32> {
        &self.tiles
    }
}

impl TerrainCache for TerrainGridCache {
    fn level(&self) -> u32 {
        self.level
    }

    fn set_mailbox(&self, mailbox: RegionMailbox) {
        self.tiles.set_mailbox(mailbox);
    }

    fn set_current_position(&self, x: i32, y: i32) -> bool {
        self.tiles.set_current_position(x, y)
    }

    fn check_for_updates(&self) -> usize {
        self.tiles.check_for_updates()
    }

    fn update_region(
        &self,
        target: &mut [ClipVertex],
        target_size: u32,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    ) {
        let view = self.tiles.view();
        let vd = vertex_distance(self.level) as f32;
        let scale_y = self.configuration.scale.y;
        let stride = target_size as usize;

        for sy in y..y + height {
            let row = wrap(sy, target_size) * stride;
            for sx in x..x + width {
                let local_x = sx as f32 * vd;
                let local_z = sy as f32 * vd;
                let coarse = self
                    .parent
                    .as_ref()
                    .map(|parent| parent.get_sub_height(local_x, local_z, true));
                let sample = view
                    .sample(sx, sy)
                    .or(coarse)
                    .unwrap_or(DEFAULT_HEIGHT);

                if let Some(vertex) = target.get_mut(row + wrap(sx, target_size)) {
                    *vertex = ClipVertex {
                        position: [local_x, sample * scale_y, local_z],
                        coarse_height: coarse.unwrap_or(sample) * scale_y,
                    };
                }
            }
        }
    }

    fn sub_height(&self, x: f32, z: f32) -> Option<f32> {
        let vd = vertex_distance(self.level) as f32;
        let fx = x / vd;
        let fz = z / vd;
        let x0 = fx.floor();
        let z0 = fz.floor();
        let tx = fx - x0;
        let tz = fz - z0;
        let (x0, z0) = (x0 as i32, z0 as i32);

        let view = self.tiles.view();
        let h00 = view.sample(x0, z0)?;
        let h10 = view.sample(x0 + 1, z0)?;
        let h01 = view.sample(x0, z0 + 1)?;
        let h11 = view.sample(x0 + 1, z0 + 1)?;

        let top = h00 + (h10 - h00) * tx;
        let bottom = h01 + (h11 - h01) * tx;
        Some(top + (bottom - top) * tz)
    }

    fn is_valid(&self) -> bool {
        self.tiles.is_valid()
    }

    fn valid_region(&self) -> Option<Region> {
        self.tiles.valid_region()
    }

    fn parent(&self) -> Option<&Arc<dyn TerrainCache>> {
        self.parent.as_ref()
    }

    fn resident_tiles(&self) -> usize {
        self.tiles.resident_count()
    }
}

impl std::fmt::Debug for TerrainGridCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerrainGridCache")
            .field("level", &self.level)
            .field("window", &self.tiles.window())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}
