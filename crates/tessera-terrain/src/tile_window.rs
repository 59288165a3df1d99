//! Windowed tile store shared by the height and texture caches.
//!
//! A [`TileWindow`] keeps the tiles around an `n × n` sample window of one
//! clip level. Repositioning the window evicts tiles that fell out of range
//! and queues fetches for newly exposed ones on the shared [`FetchPool`].
//! Completed fetches wait in an unbounded channel until
//! [`check_for_updates`](TileWindow::check_for_updates) promotes them, which
//! also posts the tile footprint to the mailbox.

use std::sync::Arc;

use ahash::AHashMap;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{RwLock, RwLockReadGuard};
use tessera_common::{min_cache_grid_size, Region, SourceError, Tile, TileCoord};
use tracing::{debug, trace, warn};

use crate::fetch::FetchPool;
use crate::mailbox::DoubleBufferedList;

/// Produces the samples of one tile. Runs on fetch workers.
pub type FetchFn<S> =
    Arc<dyn Fn(u32, TileCoord) -> Result<Option<Vec<S>>, SourceError> + Send + Sync>;

/// Shared dirty-region mailbox.
pub type RegionMailbox = Arc<DoubleBufferedList<Region>>;

/// Lifecycle of a tile inside the window.
#[derive(Debug, Clone)]
pub enum TileState<S> {
    /// Fetch submitted, no result yet
    Pending,
    /// Samples available, row-major `tile_size²`
    Resident(Arc<[S]>),
    /// The source had no data or failed; not retried while in range
    Failed,
    /// Outside the dataset by construction; valid but without samples
    Empty,
}

impl<S> TileState<S> {
    /// Returns `true` for tiles that count towards the valid region.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Resident(_) | Self::Empty)
    }
}

struct Completion<S> {
    coord: TileCoord,
    result: Result<Option<Vec<S>>, SourceError>,
}

struct WindowState<S> {
    tiles: AHashMap<TileCoord, TileState<S>>,
    center: Option<(i32, i32)>,
    window: Option<Region>,
}

/// Inclusive tile range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TileRange {
    min: TileCoord,
    max: TileCoord,
}

impl TileRange {
    fn covering(region: &Region, tile_size: i32) -> Self {
        Self {
            min: TileCoord::containing(region.x, region.y, tile_size as u32),
            max: TileCoord::containing(region.right() - 1, region.bottom() - 1, tile_size as u32),
        }
    }

    fn widened(self, margin: i32) -> Self {
        Self {
            min: TileCoord::new(self.min.x - margin, self.min.y - margin),
            max: TileCoord::new(self.max.x + margin, self.max.y + margin),
        }
    }

    fn contains(&self, coord: TileCoord) -> bool {
        coord.x >= self.min.x && coord.x <= self.max.x && coord.y >= self.min.y && coord.y <= self.max.y
    }

    fn iter(self) -> impl Iterator<Item = TileCoord> {
        (self.min.y..=self.max.y)
            .flat_map(move |y| (self.min.x..=self.max.x).map(move |x| TileCoord::new(x, y)))
    }
}

/// Parameters of a [`TileWindow`].
#[derive(Debug, Clone, Copy)]
pub struct TileWindowConfig {
    /// Clip level served by the window
    pub level: u32,
    /// Samples per tile side
    pub tile_size: u32,
    /// Window side in samples
    pub window_size: u32,
    /// Tiles per side kept resident
    pub cache_grid_size: u32,
    /// Negative tiles are empty instead of fetched
    pub only_positive_quadrant: bool,
}

/// Tile store for one clip level around a moving window.
pub struct TileWindow<S> {
    config: TileWindowConfig,
    state: RwLock<WindowState<S>>,
    fetch: FetchFn<S>,
    completions_tx: Sender<Completion<S>>,
    completions_rx: Receiver<Completion<S>>,
    pool: Arc<FetchPool>,
    mailbox: RwLock<Option<RegionMailbox>>,
}

impl<S: Copy + Send + Sync + 'static> TileWindow<S> {
    /// Creates an empty window. Nothing is fetched until it is positioned.
    pub fn new(config: TileWindowConfig, fetch: FetchFn<S>, pool: Arc<FetchPool>) -> Self {
        let (completions_tx, completions_rx) = unbounded();
        Self {
            config,
            state: RwLock::new(WindowState {
                tiles: AHashMap::new(),
                center: None,
                window: None,
            }),
            fetch,
            completions_tx,
            completions_rx,
            pool,
            mailbox: RwLock::new(None),
        }
    }

    /// Window parameters.
    #[must_use]
    pub fn config(&self) -> &TileWindowConfig {
        &self.config
    }

    /// Clip level served by this window.
    #[must_use]
    pub fn level(&self) -> u32 {
        self.config.level
    }

    /// Installs the mailbox that receives regions of newly resident tiles.
    pub fn set_mailbox(&self, mailbox: RegionMailbox) {
        *self.mailbox.write() = Some(mailbox);
    }

    /// Current window, once positioned.
    #[must_use]
    pub fn window(&self) -> Option<Region> {
        self.state.read().window
    }

    /// Current window center in level samples.
    #[must_use]
    pub fn center(&self) -> Option<(i32, i32)> {
        self.state.read().center
    }

    /// Current state of a tile, if it is tracked.
    #[must_use]
    pub fn tile_state(&self, coord: TileCoord) -> Option<TileState<S>> {
        self.state.read().tiles.get(&coord).cloned()
    }

    /// Number of resident tiles.
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.state
            .read()
            .tiles
            .values()
            .filter(|t| matches!(t, TileState::Resident(_)))
            .count()
    }

    fn prefetch_margin(&self) -> i32 {
        let needed = min_cache_grid_size(self.config.window_size, self.config.tile_size);
        (self.config.cache_grid_size.saturating_sub(needed) / 2) as i32
    }

    /// Centers the window on sample `(cx, cy)`.
    ///
    /// Evicts tiles outside the wanted range and queues fetches for new
    /// ones. Returns `false` if the center did not change.
    pub fn set_current_position(&self, cx: i32, cy: i32) -> bool {
        let n = self.config.window_size as i32;
        let ts = self.config.tile_size as i32;
        let half = n / 2;
        let window = Region::new(self.config.level, cx - half, cy - half, n, n);
        let wanted = TileRange::covering(&window, ts).widened(self.prefetch_margin());

        let mut to_fetch = Vec::new();
        {
            let mut state = self.state.write();
            if state.center == Some((cx, cy)) {
                return false;
            }
            state.center = Some((cx, cy));
            state.window = Some(window);

            let before = state.tiles.len();
            state.tiles.retain(|coord, _| wanted.contains(*coord));
            let evicted = before - state.tiles.len();
            if evicted > 0 {
                trace!("L{} evicted {evicted} tiles", self.config.level);
            }

            for coord in wanted.iter() {
                if state.tiles.contains_key(&coord) {
                    continue;
                }
                if self.config.only_positive_quadrant && !coord.is_positive_quadrant() {
                    state.tiles.insert(coord, TileState::Empty);
                } else {
                    state.tiles.insert(coord, TileState::Pending);
                    to_fetch.push(coord);
                }
            }
        }

        let mut rejected = Vec::new();
        for coord in to_fetch {
            if !self.submit_fetch(coord) {
                rejected.push(coord);
            }
        }
        if !rejected.is_empty() {
            debug!(
                "L{} could not queue {} fetches, retrying on next move",
                self.config.level,
                rejected.len()
            );
            let mut state = self.state.write();
            for coord in rejected {
                if matches!(state.tiles.get(&coord), Some(TileState::Pending)) {
                    state.tiles.remove(&coord);
                }
            }
        }
        true
    }

    fn submit_fetch(&self, coord: TileCoord) -> bool {
        let fetch = Arc::clone(&self.fetch);
        let tx = self.completions_tx.clone();
        let level = self.config.level;
        self.pool.submit(Box::new(move || {
            let result = fetch(level, coord);
            let _ = tx.send(Completion { coord, result });
        }))
    }

    /// Promotes completed fetches. Never blocks on the source.
    ///
    /// Returns the number of tiles that became resident.
    pub fn check_for_updates(&self) -> usize {
        let completions: Vec<_> = self.completions_rx.try_iter().collect();
        if completions.is_empty() {
            return 0;
        }

        let level = self.config.level;
        let ts = self.config.tile_size as i32;
        let expected = (self.config.tile_size as usize).pow(2);
        let mut posted = Vec::new();
        {
            let mut state = self.state.write();
            for Completion { coord, result } in completions {
                let tile = Tile::new(level, coord.x, coord.y);
                let slot = match state.tiles.get_mut(&coord) {
                    Some(slot) if matches!(slot, TileState::Pending) => slot,
                    _ => {
                        trace!("Discarding result for evicted tile {tile}");
                        continue;
                    },
                };
                *slot = match result {
                    Ok(Some(samples)) if samples.len() == expected => {
                        let (x, y) = coord.sample_origin(self.config.tile_size);
                        posted.push(Region::new(level, x, y, ts, ts));
                        TileState::Resident(samples.into())
                    },
                    Ok(Some(samples)) => {
                        warn!(
                            "Tile {tile}: {}",
                            SourceError::InvalidTileData {
                                expected,
                                actual: samples.len(),
                            }
                        );
                        TileState::Failed
                    },
                    Ok(None) => {
                        debug!("Tile {tile} has no data");
                        TileState::Failed
                    },
                    Err(e) => {
                        warn!("Failed to fetch tile {tile}: {e}");
                        TileState::Failed
                    },
                };
            }
        }

        if !posted.is_empty() {
            if let Some(mailbox) = self.mailbox.read().as_ref() {
                for region in &posted {
                    mailbox.add(*region);
                }
            }
            debug!("L{level} promoted {} tiles", posted.len());
        }
        posted.len()
    }

    /// Largest solid rectangle of valid tiles inside the window.
    #[must_use]
    pub fn valid_region(&self) -> Option<Region> {
        let state = self.state.read();
        let window = state.window?;
        let ts = self.config.tile_size as i32;
        let range = TileRange::covering(&window, ts);
        let cols = (range.max.x - range.min.x + 1) as usize;
        let rows = (range.max.y - range.min.y + 1) as usize;

        let mut heights = vec![0usize; cols];
        let mut best: Option<(usize, usize, usize, usize)> = None;
        let mut best_area = 0;
        for row in 0..rows {
            for (col, height) in heights.iter_mut().enumerate() {
                let coord = TileCoord::new(range.min.x + col as i32, range.min.y + row as i32);
                let valid = state.tiles.get(&coord).is_some_and(TileState::is_valid);
                *height = if valid { *height + 1 } else { 0 };
            }
            if let Some((left, width, height)) = largest_rectangle(&heights) {
                let area = width * height;
                if area > best_area {
                    best_area = area;
                    best = Some((left, row + 1 - height, width, height));
                }
            }
        }

        let (left, top, width, height) = best?;
        let tiles = Region::new(
            window.level,
            (range.min.x + left as i32) * ts,
            (range.min.y + top as i32) * ts,
            width as i32 * ts,
            height as i32 * ts,
        );
        window.intersection(&tiles)
    }

    /// Returns `true` when every tile overlapping the window is valid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let state = self.state.read();
        let Some(window) = state.window else {
            return false;
        };
        TileRange::covering(&window, self.config.tile_size as i32)
            .iter()
            .all(|coord| state.tiles.get(&coord).is_some_and(TileState::is_valid))
    }

    /// Locks the tile map for reading and returns a sampler.
    #[must_use]
    pub fn view(&self) -> WindowView<'_, S> {
        WindowView {
            state: self.state.read(),
            tile_size: self.config.tile_size,
        }
    }
}

/// Largest rectangle under a histogram, as `(left, width, height)`.
fn largest_rectangle(heights: &[usize]) -> Option<(usize, usize, usize)> {
    let mut stack: Vec<usize> = Vec::with_capacity(heights.len());
    let mut best: Option<(usize, usize, usize)> = None;
    let mut best_area = 0;
    for i in 0..=heights.len() {
        let current = heights.get(i).copied().unwrap_or(0);
        while let Some(&top) = stack.last() {
            if heights[top] < current {
                break;
            }
            stack.pop();
            let height = heights[top];
            let left = stack.last().map_or(0, |&s| s + 1);
            let width = i - left;
            if height > 0 && width * height > best_area {
                best_area = width * height;
                best = Some((left, width, height));
            }
        }
        stack.push(i);
    }
    best
}

/// Read access to the resident samples of a window.
pub struct WindowView<'a, S> {
    state: RwLockReadGuard<'a, WindowState<S>>,
    tile_size: u32,
}

impl<S: Copy> WindowView<'_, S> {
    /// Sample at level coordinate `(x, y)`, if its tile is resident.
    #[must_use]
    pub fn sample(&self, x: i32, y: i32) -> Option<S> {
        let coord = TileCoord::containing(x, y, self.tile_size);
        match self.state.tiles.get(&coord) {
            Some(TileState::Resident(samples)) => {
                let index = coord.local_index(x, y, self.tile_size)?;
                samples.get(index).copied()
            },
            _ => None,
        }
    }

    /// Current window, once positioned.
    #[must_use]
    pub fn window(&self) -> Option<Region> {
        self.state.window
    }
}
