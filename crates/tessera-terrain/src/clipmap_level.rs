//! One level of the geometry clipmap.
//!
//! A level owns an `n × n` vertex grid stored toroidally: sample `(x, y)` of
//! the level lives at index `wrap(y) * n + wrap(x)`. When the eye moves, only
//! the strips that entered the window are rewritten; the rest of the buffer
//! stays in place. Indices are rebuilt whenever the window or the nested
//! finer level moves.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use tessera_common::{
    validate_clip_side_size, vertex_distance, wrap, Aabb, Region, TerrainResult,
};
use tracing::trace;

use crate::cache::TerrainCache;
use crate::renderer::{BufferHandle, BufferKind, DrawCall, TerrainRenderer};

/// Vertex layout of a clip level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct ClipVertex {
    /// Terrain-local position, height already scaled
    pub position: [f32; 3],
    /// Height of the next coarser level at the same position, for geomorphing
    pub coarse_height: f32,
}

/// Readiness of a level's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipmapState {
    /// No part of the window is backed by cache data
    Unpopulated,
    /// Part of the window is backed by cache data
    PartiallyReady,
    /// The whole window is backed by cache data
    Ready,
}

/// Perimeter of a 2×2 block around its center, counter-clockwise seen from +Y.
const FAN: [(i32, i32); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
    (1, 0),
    (1, -1),
    (0, -1),
];

/// A single level of detail of the terrain geometry.
pub struct ClipmapLevel {
    level: u32,
    n: u32,
    vertex_distance: i32,
    height_scale: f32,
    height_range: (f32, f32),
    cache: Arc<dyn TerrainCache>,
    vertices: Vec<ClipVertex>,
    indices: Vec<u32>,
    center: Option<(i32, i32)>,
    dirty_rows: Vec<bool>,
    index_key: Option<(Region, Option<Region>)>,
    indices_uploaded: bool,
    bounds: Option<Aabb>,
    bounds_dirty: bool,
    coarsest: bool,
    vertex_buffer: Option<BufferHandle>,
    index_buffer: Option<(BufferHandle, usize)>,
    vertex_updates: u64,
}

impl ClipmapLevel {
    /// Creates a level of side `n` over `cache`.
    ///
    /// `n` must be `2^k + 1` with `k >= 4`.
    pub fn new(
        cache: Arc<dyn TerrainCache>,
        n: u32,
        height_scale: f32,
        height_range: (f32, f32),
        coarsest: bool,
    ) -> TerrainResult<Self> {
        validate_clip_side_size(n)?;
        let level = cache.level();
        Ok(Self {
            level,
            n,
            vertex_distance: vertex_distance(level),
            height_scale,
            height_range,
            cache,
            vertices: vec![ClipVertex::default(); (n * n) as usize],
            indices: Vec::new(),
            center: None,
            dirty_rows: vec![false; n as usize],
            index_key: None,
            indices_uploaded: false,
            bounds: None,
            bounds_dirty: true,
            coarsest,
            vertex_buffer: None,
            index_buffer: None,
            vertex_updates: 0,
        })
    }

    /// Clip level of this ring (0 = finest).
    #[must_use]
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Side length in vertices.
    #[must_use]
    pub fn side_size(&self) -> u32 {
        self.n
    }

    /// Terrain-local distance between neighbouring vertices.
    #[must_use]
    pub fn vertex_distance(&self) -> i32 {
        self.vertex_distance
    }

    /// Scale applied to cache heights.
    #[must_use]
    pub fn height_scale(&self) -> f32 {
        self.height_scale
    }

    /// Cache feeding this level.
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn TerrainCache> {
        &self.cache
    }

    /// Toroidal vertex storage.
    #[must_use]
    pub fn vertices(&self) -> &[ClipVertex] {
        &self.vertices
    }

    /// Current triangle list, indexing toroidal storage.
    #[must_use]
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Number of indices of the current triangle list.
    #[must_use]
    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    /// Number of [`update_vertices`](Self::update_vertices) calls so far.
    #[must_use]
    pub fn vertex_update_count(&self) -> u64 {
        self.vertex_updates
    }

    /// Window center in level samples, once positioned.
    #[must_use]
    pub fn center(&self) -> Option<(i32, i32)> {
        self.center
    }

    /// The `n × n` window in level samples, once positioned.
    #[must_use]
    pub fn window(&self) -> Option<Region> {
        self.center.map(|center| self.window_at(center))
    }

    fn window_at(&self, (cx, cy): (i32, i32)) -> Region {
        let half = (self.n / 2) as i32;
        let n = self.n as i32;
        Region::new(self.level, cx - half, cy - half, n, n)
    }

    /// Part of the window currently backed by resident cache data.
    #[must_use]
    pub fn intersection_region(&self) -> Option<Region> {
        let window = self.window()?;
        let valid = self.cache.valid_region()?;
        window.intersection(&valid)
    }

    /// Returns `true` when the whole window is backed by cache data.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.window().is_some() && self.intersection_region() == self.window()
    }

    /// Readiness of the level.
    #[must_use]
    pub fn state(&self) -> ClipmapState {
        match (self.window(), self.intersection_region()) {
            (Some(window), Some(valid)) if valid == window => ClipmapState::Ready,
            (_, Some(_)) => ClipmapState::PartiallyReady,
            _ => ClipmapState::Unpopulated,
        }
    }

    /// Sets the height range used for bounds.
    pub fn set_height_range(&mut self, min: f32, max: f32) {
        self.height_range = (min.min(max), min.max(max));
        self.bounds_dirty = true;
    }

    /// Marks this level as the coarsest one, whose border is not stitched.
    pub fn set_coarsest(&mut self, coarsest: bool) {
        if self.coarsest != coarsest {
            self.coarsest = coarsest;
            self.index_key = None;
        }
    }

    /// Follows the eye and rewrites the strips that entered the window.
    pub fn update_vertices(&mut self, eye_local: Vec3) {
        let vd = self.vertex_distance as f32;
        let cx = ((eye_local.x / vd).floor() as i32) & !1;
        let cy = ((eye_local.z / vd).floor() as i32) & !1;
        self.vertex_updates += 1;

        self.cache.set_current_position(cx, cy);
        let new_window = self.window_at((cx, cy));
        let n = self.n as i32;

        match self.center {
            Some(old) if old == (cx, cy) => return,
            Some((ox, oy)) if (cx - ox).abs() < n && (cy - oy).abs() < n => {
                let old_window = self.window_at((ox, oy));
                let dx = cx - ox;
                let dy = cy - oy;
                if dx > 0 {
                    self.write_rect(old_window.right(), new_window.y, dx, n);
                } else if dx < 0 {
                    self.write_rect(new_window.x, new_window.y, -dx, n);
                }
                if dy > 0 {
                    self.write_rect(new_window.x, old_window.bottom(), n, dy);
                } else if dy < 0 {
                    self.write_rect(new_window.x, new_window.y, n, -dy);
                }
            },
            _ => {
                self.write_rect(new_window.x, new_window.y, n, n);
            },
        }

        self.center = Some((cx, cy));
        self.bounds_dirty = true;
    }

    /// Rewrites the part of `region` inside the window.
    pub fn update_region(&mut self, region: &Region) {
        let Some(window) = self.window() else {
            return;
        };
        match region.with_level(self.level).intersection(&window) {
            Some(r) => self.write_rect(r.x, r.y, r.width, r.height),
            None => trace!("L{} ignoring region {region} outside window", self.level),
        }
        self.bounds_dirty = true;
    }

    /// Rewrites the whole window from the cache.
    pub fn regenerate(&mut self) {
        if let Some(window) = self.window() {
            self.write_rect(window.x, window.y, window.width, window.height);
            self.bounds_dirty = true;
        }
    }

    fn write_rect(&mut self, x: i32, y: i32, width: i32, height: i32) {
        if width <= 0 || height <= 0 {
            return;
        }
        self.cache
            .update_region(&mut self.vertices, self.n, x, y, width, height);
        for row in y..y + height.min(self.n as i32) {
            self.dirty_rows[wrap(row, self.n)] = true;
        }
    }

    /// Rebuilds indices around `nested`, the next finer visible level.
    ///
    /// Without a nested level the window is triangulated solid. Unless this
    /// is the coarsest level, the outer border uses every other vertex so it
    /// meets the hole of the surrounding coarser level edge to edge.
    pub fn update_indices(&mut self, nested: Option<&ClipmapLevel>) {
        let Some(window) = self.window() else {
            return;
        };
        let nested_window = nested.and_then(ClipmapLevel::window);
        let key = (window, nested_window);
        if self.index_key == Some(key) {
            return;
        }
        self.index_key = Some(key);

        let half_cells = ((self.n - 1) / 2) as i32;
        let hole = nested_window.map(|w| {
            let x = w.x.div_euclid(2);
            let y = w.y.div_euclid(2);
            (x, y, x + half_cells, y + half_cells)
        });
        let in_hole = |cx: i32, cy: i32| {
            hole.is_some_and(|(x0, y0, x1, y1)| cx >= x0 && cx < x1 && cy >= y0 && cy < y1)
        };

        let n = self.n;
        let index = |x: i32, y: i32| (wrap(y, n) * n as usize + wrap(x, n)) as u32;
        let on_border = |x: i32, y: i32| {
            x == window.x || x == window.right() - 1 || y == window.y || y == window.bottom() - 1
        };
        let stitch = !self.coarsest;

        self.indices.clear();
        for by in 0..half_cells {
            for bx in 0..half_cells {
                let x = window.x + bx * 2;
                let y = window.y + by * 2;
                let cells = [(x, y), (x + 1, y), (x, y + 1), (x + 1, y + 1)];
                let covered = cells.iter().filter(|&&(cx, cy)| in_hole(cx, cy)).count();

                if covered == cells.len() {
                    continue;
                }
                if covered > 0 {
                    for &(cx, cy) in cells.iter().filter(|&&(cx, cy)| !in_hole(cx, cy)) {
                        let p00 = index(cx, cy);
                        let p01 = index(cx, cy + 1);
                        let p10 = index(cx + 1, cy);
                        let p11 = index(cx + 1, cy + 1);
                        self.indices.extend_from_slice(&[p00, p01, p10, p10, p01, p11]);
                    }
                    continue;
                }

                let (mx, my) = (x + 1, y + 1);
                let ring: Vec<u32> = FAN
                    .iter()
                    .filter(|&&(dx, dy)| {
                        let mid_edge = dx == 0 || dy == 0;
                        !(stitch && mid_edge && on_border(mx + dx, my + dy))
                    })
                    .map(|&(dx, dy)| index(mx + dx, my + dy))
                    .collect();
                let center = index(mx, my);
                for i in 0..ring.len() {
                    let next = ring[(i + 1) % ring.len()];
                    self.indices.extend_from_slice(&[center, ring[i], next]);
                }
            }
        }
        self.indices_uploaded = false;
    }

    /// Recomputes bounds if the window or height range changed.
    pub fn update_bounds(&mut self) {
        if !self.bounds_dirty {
            return;
        }
        self.bounds_dirty = false;
        self.bounds = self.window().map(|window| {
            let vd = self.vertex_distance as f32;
            let (min_h, max_h) = self.height_range;
            Aabb::new(
                Vec3::new(window.x as f32 * vd, min_h * self.height_scale, window.y as f32 * vd),
                Vec3::new(
                    (window.right() - 1) as f32 * vd,
                    max_h * self.height_scale,
                    (window.bottom() - 1) as f32 * vd,
                ),
            )
        });
    }

    /// Terrain-local bounds as of the last [`update_bounds`](Self::update_bounds).
    #[must_use]
    pub fn bounds(&self) -> Option<Aabb> {
        self.bounds
    }

    /// Uploads dirty data and issues one indexed draw.
    ///
    /// Returns `false` if there was nothing to draw.
    pub fn draw(&mut self, renderer: &mut dyn TerrainRenderer) -> bool {
        let stride = std::mem::size_of::<ClipVertex>();
        let row_len = self.n as usize;

        let vertex_buffer = match self.vertex_buffer {
            Some(handle) => handle,
            None => {
                let handle = renderer.create_buffer(BufferKind::Vertex, self.vertices.len() * stride);
                self.vertex_buffer = Some(handle);
                self.dirty_rows.iter_mut().for_each(|d| *d = true);
                handle
            },
        };

        let mut row = 0;
        while row < row_len {
            if !self.dirty_rows[row] {
                row += 1;
                continue;
            }
            let start = row;
            while row < row_len && self.dirty_rows[row] {
                self.dirty_rows[row] = false;
                row += 1;
            }
            let vertices = &self.vertices[start * row_len..row * row_len];
            renderer.write_buffer(vertex_buffer, start * row_len * stride, bytemuck::cast_slice(vertices));
        }

        if self.indices.is_empty() {
            return false;
        }

        let index_bytes = self.indices.len() * std::mem::size_of::<u32>();
        let index_buffer = match self.index_buffer {
            Some((handle, capacity)) if capacity >= index_bytes => handle,
            _ => {
                let handle = renderer.create_buffer(BufferKind::Index, index_bytes);
                self.index_buffer = Some((handle, index_bytes));
                self.indices_uploaded = false;
                handle
            },
        };
        if !self.indices_uploaded {
            renderer.write_buffer(index_buffer, 0, bytemuck::cast_slice(&self.indices));
            self.indices_uploaded = true;
        }

        renderer.draw_indexed(&DrawCall {
            level: self.level,
            vertex_buffer,
            index_buffer,
            index_count: self.indices.len() as u32,
            vertex_distance: self.vertex_distance as f32,
        });
        true
    }
}

impl std::fmt::Debug for ClipmapLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipmapLevel")
            .field("level", &self.level)
            .field("n", &self.n)
            .field("center", &self.center)
            .field("indices", &self.indices.len())
            .field("coarsest", &self.coarsest)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::TerrainGridCache;
    use crate::fetch::FetchPool;
    use crate::renderer::{RecordingRenderer, RenderCommand};
    use crate::tile_window::{FetchFn, TileState};
    use std::time::{Duration, Instant};
    use tessera_common::{TerrainConfiguration, TileCoord};

    pub(crate) fn flat_cache(level: u32, tile_size: u32, n: u32) -> Arc<TerrainGridCache> {
        let config = Arc::new(
            TerrainConfiguration::new(8, tile_size, Vec3::ONE).with_cache_grid_size(8),
        );
        let samples = (tile_size * tile_size) as usize;
        let fetch: FetchFn<f32> = Arc::new(move |_, _| Ok(Some(vec![1.0; samples])));
        Arc::new(TerrainGridCache::with_fetch(
            None,
            fetch,
            level,
            n,
            config,
            Arc::new(FetchPool::inline()),
        ))
    }

    fn level(level: u32, coarsest: bool) -> ClipmapLevel {
        ClipmapLevel::new(flat_cache(level, 8, 17), 17, 1.0, (0.0, 1.0), coarsest).expect("valid size")
    }

    fn sample_of(level: &ClipmapLevel, index: u32) -> (i32, i32) {
        let window = level.window().expect("positioned");
        let n = level.side_size() as i32;
        let (ix, iy) = (index as i32 % n, index as i32 / n);
        let x = window.x + (ix - window.x).rem_euclid(n);
        let y = window.y + (iy - window.y).rem_euclid(n);
        (x, y)
    }

    #[test]
    fn test_rejects_bad_side_size() {
        assert!(ClipmapLevel::new(flat_cache(0, 8, 16), 16, 1.0, (0.0, 1.0), true).is_err());
        assert!(ClipmapLevel::new(flat_cache(0, 8, 9), 9, 1.0, (0.0, 1.0), true).is_err());
    }

    #[test]
    fn test_ready_after_cache_poll() {
        let mut clip = level(1, true);
        assert_eq!(clip.state(), ClipmapState::Unpopulated);
        clip.update_vertices(Vec3::new(10.0, 0.0, 10.0));
        assert_eq!(clip.center(), Some((4, 4)));
        assert!(!clip.is_ready());

        clip.cache().check_for_updates();
        assert!(clip.is_ready());
        assert_eq!(clip.state(), ClipmapState::Ready);
        assert_eq!(clip.intersection_region(), clip.window());
    }

    #[test]
    fn test_strip_update_only_touches_new_columns() {
        let mut clip = level(0, true);
        clip.cache().check_for_updates();
        clip.update_vertices(Vec3::ZERO);
        clip.cache().check_for_updates();
        clip.regenerate();
        let before = clip.vertices().to_vec();

        clip.update_vertices(Vec3::new(2.0, 0.0, 0.0));
        let window = clip.window().expect("positioned");
        for (i, (old, new)) in before.iter().zip(clip.vertices()).enumerate() {
            let (x, _) = sample_of(&clip, i as u32);
            if x >= window.right() - 2 {
                assert_eq!(new.position[0], x as f32);
            } else {
                assert_eq!(old, new);
            }
        }
        assert_eq!(clip.vertex_update_count(), 2);
    }

    #[test]
    fn test_solid_level_covers_window() {
        let mut clip = level(0, true);
        clip.update_vertices(Vec3::ZERO);
        clip.update_indices(None);
        // 8 triangles per 2x2 block, 8x8 blocks.
        assert_eq!(clip.index_count(), 8 * 8 * 8 * 3);
    }

    #[test]
    fn test_triangles_face_up() {
        let mut clip = level(0, false);
        clip.update_vertices(Vec3::ZERO);
        clip.update_indices(None);
        for tri in clip.indices().chunks(3) {
            let p: Vec<Vec3> = tri
                .iter()
                .map(|&i| {
                    let (x, y) = sample_of(&clip, i);
                    Vec3::new(x as f32, 0.0, y as f32)
                })
                .collect();
            let normal = (p[1] - p[0]).cross(p[2] - p[0]);
            assert!(normal.y > 0.0, "triangle {tri:?} faces down");
        }
    }

    #[test]
    fn test_ring_skips_nested_footprint() {
        let mut fine = level(0, false);
        let mut coarse = level(1, true);
        let eye = Vec3::new(6.0, 0.0, -2.0);
        fine.update_vertices(eye);
        coarse.update_vertices(eye);
        coarse.update_indices(Some(&fine));

        let fine_window = fine.window().expect("positioned");
        let hole = Region::new(
            1,
            fine_window.x / 2,
            fine_window.y / 2,
            (fine_window.width - 1) / 2,
            (fine_window.height - 1) / 2,
        );
        for tri in coarse.indices().chunks(3) {
            let pts: Vec<(i32, i32)> = tri.iter().map(|&i| sample_of(&coarse, i)).collect();
            let min_x = pts.iter().map(|p| p.0).min().unwrap_or(0);
            let min_y = pts.iter().map(|p| p.1).min().unwrap_or(0);
            let max_x = pts.iter().map(|p| p.0).max().unwrap_or(0);
            let max_y = pts.iter().map(|p| p.1).max().unwrap_or(0);
            let cell = Region::new(1, min_x, min_y, max_x - min_x, max_y - min_y);
            assert!(
                !hole.contains(&cell),
                "triangle {pts:?} lies under the nested level"
            );
        }
        assert!(coarse.index_count() < 8 * 8 * 8 * 3);
    }

    #[test]
    fn test_border_is_stitched_at_coarse_resolution() {
        let mut fine = level(0, false);
        fine.update_vertices(Vec3::new(6.0, 0.0, -2.0));
        fine.update_indices(None);
        let window = fine.window().expect("positioned");

        for &i in fine.indices() {
            let (x, y) = sample_of(&fine, i);
            let on_vertical_edge = x == window.x || x == window.right() - 1;
            let on_horizontal_edge = y == window.y || y == window.bottom() - 1;
            if on_vertical_edge {
                assert_eq!((y - window.y) % 2, 0, "odd vertex on border at ({x}, {y})");
            }
            if on_horizontal_edge {
                assert_eq!((x - window.x) % 2, 0, "odd vertex on border at ({x}, {y})");
            }
        }
    }

    #[test]
    fn test_indices_rebuilt_only_on_change() {
        let mut clip = level(0, true);
        clip.update_vertices(Vec3::ZERO);
        clip.update_indices(None);
        let mut renderer = RecordingRenderer::new();
        assert!(clip.draw(&mut renderer));
        let first = renderer.take_commands();
        assert!(first
            .iter()
            .any(|c| matches!(c, RenderCommand::CreateBuffer { kind: BufferKind::Index, .. })));

        clip.update_indices(None);
        assert!(clip.draw(&mut renderer));
        let second = renderer.take_commands();
        assert_eq!(second.len(), 1);
        assert!(matches!(second[0], RenderCommand::Draw(_)));
    }

    #[test]
    fn test_region_update_marks_rows_for_upload() {
        let mut clip = level(0, true);
        clip.update_vertices(Vec3::ZERO);
        clip.update_indices(None);
        let mut renderer = RecordingRenderer::new();
        clip.draw(&mut renderer);
        renderer.take_commands();

        clip.cache().check_for_updates();
        clip.update_region(&Region::new(0, -2, 3, 4, 2));
        clip.draw(&mut renderer);
        let uploads: Vec<_> = renderer
            .commands()
            .iter()
            .filter_map(|c| match c {
                RenderCommand::WriteBuffer { offset, len, .. } => Some((*offset, *len)),
                _ => None,
            })
            .collect();
        let row_bytes = 17 * std::mem::size_of::<ClipVertex>();
        assert_eq!(uploads, vec![(3 * row_bytes, 2 * row_bytes)]);
        let vertex = clip.vertices()[3 * 17 + wrap(-2, 17)];
        assert_eq!(vertex.position, [-2.0, 1.0, 3.0]);
    }

    #[test]
    fn test_ready_exactly_when_window_tiles_are_resident() {
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded::<()>();
        let config = Arc::new(
            TerrainConfiguration::new(1, 8, Vec3::ONE)
                .with_cache_grid_size(4)
                .with_only_positive_quadrant(false),
        );
        let fetch: FetchFn<f32> = Arc::new(move |_, _| {
            let _ = gate_rx.recv();
            Ok(Some(vec![1.0; 64]))
        });
        let pool = Arc::new(FetchPool::new(1, 16).expect("pool"));
        let cache = Arc::new(TerrainGridCache::with_fetch(None, fetch, 0, 17, config, pool));
        let mut clip =
            ClipmapLevel::new(cache.clone(), 17, 1.0, (0.0, 1.0), true).expect("valid size");
        clip.update_vertices(Vec3::ZERO);

        let window = clip.window().expect("positioned");
        let first = TileCoord::containing(window.x, window.y, 8);
        let last = TileCoord::containing(window.right() - 1, window.bottom() - 1, 8);
        let needed: Vec<TileCoord> = (first.y..=last.y)
            .flat_map(|y| (first.x..=last.x).map(move |x| TileCoord::new(x, y)))
            .collect();
        assert_eq!(needed.len(), 9);
        assert!(!clip.is_ready());

        let mut resident = 0;
        for _ in 0..needed.len() {
            gate_tx.send(()).expect("gate open");
            let deadline = Instant::now() + Duration::from_secs(5);
            while resident == cache.resident_tiles() && Instant::now() < deadline {
                cache.check_for_updates();
                std::thread::yield_now();
            }
            resident = cache.resident_tiles();
            let all_resident = needed.iter().all(|coord| {
                matches!(cache.tiles().tile_state(*coord), Some(TileState::Resident(_)))
            });
            assert_eq!(clip.is_ready(), all_resident, "after {resident} tiles");
        }
        assert_eq!(resident, 9);
        assert!(clip.is_ready());
        assert_eq!(clip.state(), ClipmapState::Ready);
        drop(gate_tx);
    }
}
