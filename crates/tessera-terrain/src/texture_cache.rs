//! Texel caches for texture clipmaps.

use std::sync::Arc;

use tessera_common::{wrap, Region, TextureConfiguration};

use crate::fetch::FetchPool;
use crate::source::TextureSource;
use crate::tile_window::{FetchFn, RegionMailbox, TileWindow, TileWindowConfig};

/// Texel used where no level has data.
pub const DEFAULT_TEXEL: [u8; 4] = [128, 128, 128, 255];

/// Texel data of one texture clipmap level.
pub trait TextureCache: Send + Sync {
    /// Level served by this cache.
    fn level(&self) -> u32;

    /// Installs the mailbox that receives regions of newly resident tiles.
    fn set_mailbox(&self, mailbox: RegionMailbox);

    /// Centers the cache window on texel `(x, y)` of this level.
    fn set_current_position(&self, x: i32, y: i32) -> bool;

    /// Promotes completed fetches. Returns the number of new resident tiles.
    fn check_for_updates(&self) -> usize;

    /// Writes a sub-rectangle of texels into a toroidal layer of side
    /// `target_size`.
    fn update_region(
        &self,
        target: &mut [[u8; 4]],
        target_size: u32,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    );

    /// Texel at `(x, y)` of this level, if resident.
    fn texel(&self, x: i32, y: i32) -> Option<[u8; 4]>;

    /// Returns `true` when the whole window is backed by valid tiles.
    fn is_valid(&self) -> bool;

    /// Largest valid rectangle inside the window.
    fn valid_region(&self) -> Option<Region>;

    /// Next coarser cache.
    fn parent(&self) -> Option<&Arc<dyn TextureCache>>;

    /// Texel at `(x, y)`, falling back to coarser levels.
    fn get_texel(&self, x: i32, y: i32, try_parent: bool) -> [u8; 4] {
        if let Some(texel) = self.texel(x, y) {
            return texel;
        }
        match self.parent() {
            Some(parent) if try_parent => parent.get_texel(x.div_euclid(2), y.div_euclid(2), true),
            _ => DEFAULT_TEXEL,
        }
    }
}

/// Tile-grid backed [`TextureCache`].
pub struct TextureGridCache {
    level: u32,
    tiles: TileWindow<[u8; 4]>,
    parent: Option<Arc<dyn TextureCache>>,
}

impl TextureGridCache {
    /// Creates the cache of `level`, fetching from `source` on `pool`.
    pub fn new(
        parent: Option<Arc<dyn TextureCache>>,
        source: Arc<dyn TextureSource>,
        level: u32,
        window_size: u32,
        configuration: &TextureConfiguration,
        pool: Arc<FetchPool>,
    ) -> Self {
        let fetch: FetchFn<[u8; 4]> = Arc::new(move |level, coord| source.tile(level, coord));
        Self::with_fetch(parent, fetch, level, window_size, configuration, pool)
    }

    /// Creates the cache with a custom fetch function.
    pub fn with_fetch(
        parent: Option<Arc<dyn TextureCache>>,
        fetch: FetchFn<[u8; 4]>,
        level: u32,
        window_size: u32,
        configuration: &TextureConfiguration,
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
            tiles,
            parent,
        }
    }

    /// Underlying tile window.
    #[must_use]
    pub fn tiles(&self) -> &TileWindow<[u8; 4]> {
        &self.tiles
    }
}

impl TextureCache for TextureGridCache {
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
        target: &mut [[u8; 4]],
        target_size: u32,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    ) {
        let view = self.tiles.view();
        let stride = target_size as usize;
        for ty in y..y + height {
            let row = wrap(ty, target_size) * stride;
            for tx in x..x + width {
                let texel = view.sample(tx, ty).unwrap_or_else(|| match &self.parent {
                    Some(parent) => parent.get_texel(tx.div_euclid(2), ty.div_euclid(2), true),
                    None => DEFAULT_TEXEL,
                });
                if let Some(slot) = target.get_mut(row + wrap(tx, target_size)) {
                    *slot = texel;
                }
            }
        }
    }

    fn texel(&self, x: i32, y: i32) -> Option<[u8; 4]> {
        self.tiles.view().sample(x, y)
    }

    fn is_valid(&self) -> bool {
        self.tiles.is_valid()
    }

    fn valid_region(&self) -> Option<Region> {
        self.tiles.valid_region()
    }

    fn parent(&self) -> Option<&Arc<dyn TextureCache>> {
        self.parent.as_ref()
    }
}

impl std::fmt::Debug for TextureGridCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureGridCache")
            .field("level", &self.level)
            .field("window", &self.tiles.window())
            .finish_non_exhaustive()
    }
}
