//! The terrain: clip levels, texture clipmaps and the per-frame update loop.
//!
//! All vertex, index and texture mutation happens on the thread calling
//! [`Terrain::update_children`] and [`Terrain::draw`]. The background
//! updater only polls caches, which report newly resident tiles through the
//! shared region mailbox.

use std::sync::Arc;
use std::time::Duration;

use glam::{Affine3A, Vec3};
use parking_lot::Mutex;
use tessera_common::{
    Aabb, Ray3, Region, TerrainConfiguration, TerrainError, TerrainResult, TerrainSettings,
    TerrainTransform,
};
use tracing::{debug, info, warn};

use crate::cache::TerrainCache;
use crate::clipmap_level::ClipmapLevel;
use crate::listener::{ListenerId, Listeners, RegionUpdateListener};
use crate::mailbox::DoubleBufferedList;
use crate::picker::{ClipmapTerrainPicker, GridTracer, PickResult};
use crate::renderer::TerrainRenderer;
use crate::texture_clipmap::TextureClipmap;
use crate::tile_window::RegionMailbox;
use crate::updater::{poll_once, CacheUpdater, SharedTexturePolls};

/// Texture unit colour clipmaps are bound to.
pub const TEXTURE_UNIT: u32 = 0;

/// Default texture unit of the normal-map clipmap.
pub const DEFAULT_NORMAL_UNIT: u32 = 5;

/// Geometry clipmap terrain following a camera.
pub struct Terrain {
    clips: Vec<ClipmapLevel>,
    caches: Vec<Arc<dyn TerrainCache>>,
    configuration: Arc<TerrainConfiguration>,
    settings: TerrainSettings,
    mailbox: RegionMailbox,

    visible_levels: usize,
    min_visible_level: usize,

    texture_clipmaps: Vec<TextureClipmap>,
    texture_polls: SharedTexturePolls,
    normal_clipmap: Option<TextureClipmap>,
    normal_unit: u32,

    listeners: Listeners,
    picker: Option<ClipmapTerrainPicker>,
    transform: TerrainTransform,

    updater: Option<CacheUpdater>,
    background_updates: bool,

    /// Sum of all elapsed times passed to `update_children`
    clock: Duration,
    /// Last refresh of each level finer than the visible one
    timers: Vec<Duration>,
    /// Time accumulated towards the next mailbox drain
    update_timer: Duration,
    /// Regions inside their level's window whose tiles were not all valid yet
    pending_regions: Vec<Region>,
}

impl Terrain {
    /// Creates a terrain over `caches`, finest level first.
    ///
    /// Every cache must serve the level equal to its index.
    pub fn new(
        settings: TerrainSettings,
        configuration: Arc<TerrainConfiguration>,
        caches: Vec<Arc<dyn TerrainCache>>,
    ) -> TerrainResult<Self> {
        settings.validate()?;
        if caches.is_empty() {
            return Err(TerrainError::InvalidConfiguration(
                "terrain needs at least one clip level".into(),
            ));
        }

        let mailbox: RegionMailbox = Arc::new(DoubleBufferedList::new());
        let coarsest = caches.len() - 1;
        let height_range = (configuration.height_range_min, configuration.height_range_max);

        let mut clips = Vec::with_capacity(caches.len());
        for (index, cache) in caches.iter().enumerate() {
            if cache.level() as usize != index {
                return Err(TerrainError::InvalidConfiguration(format!(
                    "cache {index} serves level {}",
                    cache.level()
                )));
            }
            cache.set_mailbox(Arc::clone(&mailbox));
            clips.push(ClipmapLevel::new(
                Arc::clone(cache),
                settings.clip_side_size,
                configuration.scale.y,
                height_range,
                index == coarsest,
            )?);
        }

        info!(
            "Created terrain: {} levels, clip size {}, tile size {}",
            clips.len(),
            settings.clip_side_size,
            configuration.tile_size
        );

        Ok(Self {
            clips,
            caches,
            transform: TerrainTransform::from_scale(configuration.scale),
            configuration,
            settings,
            mailbox,
            visible_levels: 0,
            min_visible_level: 0,
            texture_clipmaps: Vec::new(),
            texture_polls: Arc::new(Mutex::new(Vec::new())),
            normal_clipmap: None,
            normal_unit: DEFAULT_NORMAL_UNIT,
            listeners: Listeners::new(),
            picker: None,
            updater: None,
            background_updates: true,
            clock: Duration::ZERO,
            timers: Vec::new(),
            update_timer: Duration::ZERO,
            pending_regions: Vec::new(),
        })
    }

    /// Advances the terrain by one frame for a camera at `camera_world`.
    pub fn update_children(&mut self, camera_world: Vec3, elapsed: Duration) {
        self.clock += elapsed;
        let eye = self.transform.world_to_local(camera_world);

        self.select_visible_level();
        self.check_non_visible_clips(eye);
        self.update_from_mailbox(elapsed);

        for clip in self.clips[self.visible_levels..].iter_mut().rev() {
            clip.update_vertices(eye);
        }
        self.update_indices();

        self.ensure_updater();

        for clip in &mut self.clips[self.visible_levels..] {
            clip.update_bounds();
        }
    }

    fn select_visible_level(&mut self) {
        let coarsest = self.clips.len() - 1;
        let visible = (self.min_visible_level..self.clips.len())
            .find(|&i| self.clips[i].is_ready())
            .unwrap_or(coarsest);
        if visible != self.visible_levels {
            debug!("Visible level {} -> {visible}", self.visible_levels);
        }
        self.visible_levels = visible;
    }

    /// Refreshes levels finer than the visible one at a throttled rate, so
    /// their caches keep following the eye until they become ready.
    fn check_non_visible_clips(&mut self, eye: Vec3) {
        let now = self.clock;
        let rate = self.settings.non_visible_update_rate();

        while self.timers.len() < self.visible_levels {
            let unit = self.timers.len();
            self.timers.push(now);
            if self.clips[unit].window().is_none() {
                self.clips[unit].update_vertices(eye);
            }
        }

        for unit in 0..self.visible_levels {
            if now.saturating_sub(self.timers[unit]) > rate {
                self.timers[unit] = now;
                self.clips[unit].update_vertices(eye);
            }
        }
    }

    fn update_from_mailbox(&mut self, elapsed: Duration) {
        let threshold = self.settings.mailbox_update_threshold();
        if self.update_timer > threshold {
            let mut regions = self.mailbox.switch_and_get();
            regions.append(&mut self.pending_regions);
            if !regions.is_empty() {
                self.apply_regions(regions);
            }
            let remainder = self.update_timer.as_nanos() % threshold.as_nanos().max(1);
            self.update_timer = Duration::from_nanos(remainder as u64);
        }
        self.update_timer += elapsed;
    }

    fn apply_regions(&mut self, mut regions: Vec<Region>) {
        let received = regions.len();
        self.keep_unwritten(&regions);
        self.trim_regions(&mut regions);

        let ratio = self.settings.region_coarsening_ratio as i32;
        for i in (0..regions.len()).rev() {
            let region = regions[i];
            add_coarsened_regions(&mut regions, region, ratio);
        }
        self.trim_regions(&mut regions);

        for region in &regions {
            if let Some(clip) = self.clips.get_mut(region.level as usize) {
                clip.update_region(region);
            }
        }
        debug!(
            "Applied {} regions from {received} mailbox entries, {} pending",
            regions.len(),
            self.pending_regions.len()
        );

        if !regions.is_empty() && !self.listeners.is_empty() {
            self.listeners.notify(&regions, &self.transform.to_affine());
        }
    }

    /// Holds back the part of each region that lies inside its level's
    /// window but outside the valid rectangle, so it is written once the
    /// surrounding tiles make it valid. Regions that left the window are
    /// forgotten.
    fn keep_unwritten(&mut self, regions: &[Region]) {
        for region in regions {
            let Some(clip) = self.clips.get(region.level as usize) else {
                continue;
            };
            let Some(in_window) = clip.window().and_then(|window| window.intersection(region))
            else {
                continue;
            };
            let writable = clip
                .intersection_region()
                .and_then(|valid| valid.intersection(region));
            if writable != Some(in_window) && !self.pending_regions.contains(&in_window) {
                self.pending_regions.push(in_window);
            }
        }
    }

    /// Clips each region to its level's valid window and sorts by level.
    fn trim_regions(&self, regions: &mut Vec<Region>) {
        regions.retain_mut(|region| {
            let trimmed = self
                .clips
                .get(region.level as usize)
                .and_then(ClipmapLevel::intersection_region)
                .and_then(|valid| valid.intersection(region));
            match trimmed {
                Some(trimmed) => {
                    *region = trimmed;
                    true
                },
                None => false,
            }
        });
        regions.sort_by_key(|region| region.level);
    }

    fn update_indices(&mut self) {
        let visible = self.visible_levels;
        for i in (visible..self.clips.len()).rev() {
            if i == visible {
                self.clips[i].update_indices(None);
            } else {
                let (finer, coarser) = self.clips.split_at_mut(i);
                coarser[0].update_indices(Some(&finer[i - 1]));
            }
        }
    }

    fn ensure_updater(&mut self) {
        if !self.background_updates || self.updater.is_some() {
            return;
        }
        match CacheUpdater::spawn(
            self.caches.clone(),
            Arc::clone(&self.texture_polls),
            self.settings.cache_poll_interval(),
        ) {
            Ok(updater) => self.updater = Some(updater),
            Err(e) => {
                warn!("Background cache updates disabled: {e}");
                self.background_updates = false;
            },
        }
    }

    /// Uploads pending data and draws the visible levels.
    ///
    /// Returns the number of draw calls issued.
    pub fn draw(&mut self, renderer: &mut dyn TerrainRenderer, camera_world: Vec3) -> usize {
        let eye = self.transform.world_to_local(camera_world);
        renderer.set_eye_position(eye);

        if let Some(normal) = self.normal_clipmap.as_mut() {
            normal.update(renderer, eye);
            if let Some(texture) = normal.texture() {
                renderer.bind_texture(self.normal_unit, texture);
            }
        }

        let layered = self.texture_clipmaps.len() > 1;
        let mut first_pass = true;
        let mut draws = 0;
        for clipmap in &mut self.texture_clipmaps {
            if !clipmap.is_enabled() {
                continue;
            }
            clipmap.update(renderer, eye);
            renderer.bind_texture_clipmap(TEXTURE_UNIT, &clipmap.prepare_to_draw_clips());

            renderer.set_blend_enabled(!first_pass);
            first_pass = false;

            if layered {
                renderer.push_buckets();
            }
            draws += draw_levels(&mut self.clips[self.visible_levels..], renderer);
            if layered {
                renderer.render_buckets();
                renderer.pop_buckets();
            }
        }

        if self.texture_clipmaps.is_empty() {
            draws += draw_levels(&mut self.clips[self.visible_levels..], renderer);
        }
        draws
    }

    /// Rewrites geometry and/or textures from the caches.
    pub fn regenerate(&mut self, geometry: bool, textures: bool) {
        if geometry {
            let last = self.clips.len() - 1;
            if let Some(i) = (0..self.clips.len()).rev().find(|&i| !self.clips[i].is_ready()) {
                self.visible_levels = (i + 1).min(last);
            }
            for clip in self.clips[self.visible_levels..].iter_mut().rev() {
                clip.regenerate();
            }
            self.update_indices();
        }

        if textures {
            for clipmap in &mut self.texture_clipmaps {
                clipmap.regenerate();
            }
            if let Some(normal) = self.normal_clipmap.as_mut() {
                normal.regenerate();
            }
        }
    }

    /// Finest level drawn this frame.
    #[must_use]
    pub fn visible_levels(&self) -> usize {
        self.visible_levels
    }

    /// Overrides the finest drawn level until the next update.
    pub fn set_visible_levels(&mut self, level: usize) {
        self.visible_levels = level.min(self.clips.len() - 1);
    }

    /// Finest level that may become visible.
    #[must_use]
    pub fn min_visible_level(&self) -> usize {
        self.min_visible_level
    }

    /// Sets the finest level that may become visible, clamped to the levels.
    pub fn set_min_visible_level(&mut self, level: usize) {
        self.min_visible_level = level.min(self.clips.len() - 1);
    }

    /// Sets the unscaled height range of every level.
    pub fn set_height_range(&mut self, min: f32, max: f32) {
        for clip in &mut self.clips {
            clip.set_height_range(min, max);
        }
    }

    /// Enables [`pick`](Self::pick).
    pub fn make_pickable(
        &mut self,
        tracer: Box<dyn GridTracer>,
        max_checks: usize,
        initial_spacing: f32,
    ) {
        self.picker = Some(ClipmapTerrainPicker::new(tracer, max_checks, initial_spacing));
    }

    /// Picker installed by [`make_pickable`](Self::make_pickable).
    #[must_use]
    pub fn picker(&self) -> Option<&ClipmapTerrainPicker> {
        self.picker.as_ref()
    }

    /// Intersects a world ray with the terrain surface.
    pub fn pick(&mut self, world_ray: &Ray3) -> Option<PickResult> {
        self.picker
            .as_mut()?
            .pick(&self.clips, &self.transform, world_ray)
    }

    /// Adds a texture clipmap drawn after the existing ones.
    pub fn add_texture_clipmap(&mut self, clipmap: TextureClipmap) {
        self.texture_polls.lock().push(clipmap.poll_handle());
        info!("Added texture clipmap '{}'", clipmap.name());
        self.texture_clipmaps.push(clipmap);
    }

    /// First texture clipmap.
    #[must_use]
    pub fn texture_clipmap(&self) -> Option<&TextureClipmap> {
        self.texture_clipmaps.first()
    }

    /// All texture clipmaps in draw order.
    #[must_use]
    pub fn texture_clipmaps(&self) -> &[TextureClipmap] {
        &self.texture_clipmaps
    }

    /// Finds a texture clipmap by name.
    #[must_use]
    pub fn find_texture_clipmap(&self, name: &str) -> Option<&TextureClipmap> {
        self.texture_clipmaps.iter().find(|c| c.name() == name)
    }

    /// Finds a texture clipmap by name for modification.
    pub fn find_texture_clipmap_mut(&mut self, name: &str) -> Option<&mut TextureClipmap> {
        self.texture_clipmaps.iter_mut().find(|c| c.name() == name)
    }

    /// Sets the finest sampled layer of every texture clipmap.
    pub fn set_texture_min_visible_level(&mut self, level: u32) {
        for clipmap in &mut self.texture_clipmaps {
            clipmap.set_min_visible_level(level);
        }
        if let Some(normal) = self.normal_clipmap.as_mut() {
            normal.set_min_visible_level(level);
        }
    }

    /// Finest sampled layer of the first texture clipmap, 0 without one.
    #[must_use]
    pub fn texture_min_visible_level(&self) -> u32 {
        self.texture_clipmap()
            .map_or(0, TextureClipmap::min_visible_level)
    }

    /// Replaces the normal-map clipmap.
    pub fn set_normal_clipmap(&mut self, clipmap: Option<TextureClipmap>) {
        let mut polls = self.texture_polls.lock();
        if let Some(old) = self.normal_clipmap.take() {
            let enabled = old.poll_handle().enabled;
            polls.retain(|poll| !Arc::ptr_eq(&poll.enabled, &enabled));
        }
        if let Some(clipmap) = &clipmap {
            polls.push(clipmap.poll_handle());
        }
        drop(polls);
        self.normal_clipmap = clipmap;
    }

    /// Normal-map clipmap.
    #[must_use]
    pub fn normal_clipmap(&self) -> Option<&TextureClipmap> {
        self.normal_clipmap.as_ref()
    }

    /// Texture unit of the normal-map clipmap.
    #[must_use]
    pub fn normal_unit(&self) -> u32 {
        self.normal_unit
    }

    /// Sets the texture unit of the normal-map clipmap.
    pub fn set_normal_unit(&mut self, unit: u32) {
        self.normal_unit = unit;
    }

    /// Registers a listener for regions applied from the mailbox.
    pub fn add_listener(&mut self, listener: Arc<dyn RegionUpdateListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    /// Unregisters a listener.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// World height at world `(x, z)`, falling back to coarser levels.
    #[must_use]
    pub fn height_at(&self, x: f32, z: f32) -> f32 {
        self.sample_height(&self.clips[0], x, z, true)
    }

    /// World height at world `(x, z)` from `level`.
    pub fn height_at_level(&self, x: f32, z: f32, level: usize, try_parent: bool) -> TerrainResult<f32> {
        let clip = self.clips.get(level).ok_or(TerrainError::LevelOutOfRange {
            level,
            count: self.clips.len(),
        })?;
        Ok(self.sample_height(clip, x, z, try_parent))
    }

    fn sample_height(&self, clip: &ClipmapLevel, x: f32, z: f32, try_parent: bool) -> f32 {
        let local = self.transform.world_to_local(Vec3::new(x, 0.0, z));
        let height = clip.cache().get_sub_height(local.x, local.z, try_parent);
        height * clip.height_scale() + self.transform.translation.y
    }

    /// World bounds of everything the terrain can draw around the camera.
    #[must_use]
    pub fn world_bound(&self, camera_world: Vec3) -> Aabb {
        let eye = self.transform.world_to_local(camera_world);
        let coarsest = (self.clips.len() - 1) as u32;
        let half_edge = self.settings.clip_side_size as f32 * (1u32 << coarsest) as f32 * 0.5;
        let scale = self.configuration.scale.y;
        let min = self.configuration.height_range_min * scale;
        let max = self.configuration.height_range_max * scale;
        let local = Aabb::new(
            Vec3::new(eye.x - half_edge, min, eye.z - half_edge),
            Vec3::new(eye.x + half_edge, max, eye.z + half_edge),
        );
        local.transformed(&self.transform.to_affine())
    }

    /// Moves the terrain in world space.
    pub fn set_translation(&mut self, translation: Vec3) {
        self.transform.translation = translation;
    }

    /// Terrain placement.
    #[must_use]
    pub fn transform(&self) -> &TerrainTransform {
        &self.transform
    }

    /// Local to world matrix handed to listeners.
    #[must_use]
    pub fn world_transform(&self) -> Affine3A {
        self.transform.to_affine()
    }

    /// Clip levels, finest first.
    #[must_use]
    pub fn clipmaps(&self) -> &[ClipmapLevel] {
        &self.clips
    }

    /// Dataset description.
    #[must_use]
    pub fn configuration(&self) -> &TerrainConfiguration {
        &self.configuration
    }

    /// Runtime settings.
    #[must_use]
    pub fn settings(&self) -> &TerrainSettings {
        &self.settings
    }

    /// Enables or disables the background updater. Disabling stops a running one.
    pub fn set_background_updates(&mut self, enabled: bool) {
        self.background_updates = enabled;
        if !enabled {
            if let Some(mut updater) = self.updater.take() {
                updater.stop();
            }
        }
    }

    /// Returns `true` while the background updater thread runs.
    #[must_use]
    pub fn is_updating_in_background(&self) -> bool {
        self.updater.as_ref().is_some_and(CacheUpdater::is_running)
    }

    /// Runs one polling cycle on the calling thread.
    pub fn poll_caches(&self) -> usize {
        poll_once(&self.caches, &self.texture_polls)
    }

    /// Stops the background updater for good.
    pub fn shutdown(&mut self) {
        self.set_background_updates(false);
    }
}

impl Drop for Terrain {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Terrain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terrain")
            .field("levels", &self.clips.len())
            .field("visible_levels", &self.visible_levels)
            .field("texture_clipmaps", &self.texture_clipmaps.len())
            .field("updater", &self.updater)
            .finish_non_exhaustive()
    }
}

/// Adds the region's footprint on every finer level, stopping at the first
/// one already present.
pub(crate) fn add_coarsened_regions(regions: &mut Vec<Region>, region: Region, ratio: i32) {
    let mut current = region;
    while let Some(next) = current.coarsened(ratio) {
        if regions.contains(&next) {
            break;
        }
        regions.push(next);
        current = next;
    }
}

fn draw_levels(clips: &mut [ClipmapLevel], renderer: &mut dyn TerrainRenderer) -> usize {
    let mut draws = 0;
    for clip in clips.iter_mut().rev() {
        if clip.index_count() > 0 && clip.draw(renderer) {
            draws += 1;
        }
    }
    draws
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    use crate::cache::{TerrainGridCache, DEFAULT_HEIGHT};
    use crate::clipmap_level::ClipVertex;
    use crate::fetch::FetchPool;
    use crate::listener::tests::RecordingListener;
    use crate::picker::BresenhamTracer;
    use crate::renderer::{RecordingRenderer, RenderCommand};
    use crate::texture_cache::{TextureCache, TextureGridCache};
    use crate::tile_window::{FetchFn, TileState};
    use tessera_common::{
        vertex_distance, wrap, TextureConfiguration, TextureStoreFormat, TileCoord,
    };

    /// Cache that is either fully valid with height `level + 1` or empty.
    struct MockCache {
        level: u32,
        valid: bool,
        parent: Option<Arc<dyn TerrainCache>>,
    }

    impl MockCache {
        fn height(&self) -> f32 {
            self.level as f32 + 1.0
        }
    }

    impl TerrainCache for MockCache {
        fn level(&self) -> u32 {
            self.level
        }

        fn set_mailbox(&self, _mailbox: RegionMailbox) {}

        fn set_current_position(&self, _x: i32, _y: i32) -> bool {
            true
        }

        fn check_for_updates(&self) -> usize {
            0
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
            let vd = vertex_distance(self.level) as f32;
            let h = if self.valid { self.height() } else { DEFAULT_HEIGHT };
            for sy in y..y + height {
                for sx in x..x + width {
                    let index = wrap(sy, target_size) * target_size as usize + wrap(sx, target_size);
                    target[index] = ClipVertex {
                        position: [sx as f32 * vd, h, sy as f32 * vd],
                        coarse_height: h,
                    };
                }
            }
        }

        fn sub_height(&self, _x: f32, _z: f32) -> Option<f32> {
            self.valid.then(|| self.height())
        }

        fn is_valid(&self) -> bool {
            self.valid
        }

        fn valid_region(&self) -> Option<Region> {
            self.valid
                .then(|| Region::new(self.level, -(1 << 16), -(1 << 16), 1 << 17, 1 << 17))
        }

        fn parent(&self) -> Option<&Arc<dyn TerrainCache>> {
            self.parent.as_ref()
        }
    }

    fn settings() -> TerrainSettings {
        TerrainSettings {
            clip_side_size: 17,
            ..TerrainSettings::default()
        }
    }

    /// Terrain over mock caches; `valid[i]` says whether level `i` has data.
    fn mock_terrain(valid: &[bool]) -> Terrain {
        let mut caches: Vec<Arc<dyn TerrainCache>> = Vec::new();
        let mut parent: Option<Arc<dyn TerrainCache>> = None;
        for level in (0..valid.len()).rev() {
            let cache: Arc<dyn TerrainCache> = Arc::new(MockCache {
                level: level as u32,
                valid: valid[level],
                parent: parent.clone(),
            });
            parent = Some(Arc::clone(&cache));
            caches.insert(0, cache);
        }
        let configuration = Arc::new(
            TerrainConfiguration::new(valid.len() as u32, 8, Vec3::new(1.0, 2.0, 1.0))
                .with_height_range(0.0, 8.0),
        );
        let mut terrain = Terrain::new(settings(), configuration, caches).expect("terrain");
        terrain.set_background_updates(false);
        terrain
    }

    const FRAME: Duration = Duration::from_millis(100);

    #[test]
    fn test_rejects_empty_and_misordered_caches() {
        let configuration = Arc::new(TerrainConfiguration::default());
        assert!(Terrain::new(settings(), Arc::clone(&configuration), Vec::new()).is_err());

        let cache: Arc<dyn TerrainCache> = Arc::new(MockCache {
            level: 1,
            valid: true,
            parent: None,
        });
        assert!(Terrain::new(settings(), configuration, vec![cache]).is_err());
    }

    #[test]
    fn test_visible_level_and_non_visible_throttling() {
        let mut terrain = mock_terrain(&[false, false, true, true]);
        for _ in 0..30 {
            terrain.update_children(Vec3::ZERO, FRAME);
        }
        assert_eq!(terrain.visible_levels(), 2);

        let clips = terrain.clipmaps();
        assert_eq!(clips[2].vertex_update_count(), 30);
        assert_eq!(clips[3].vertex_update_count(), 30);
        // Three seconds at one refresh per 500 ms, plus the initial placement.
        for clip in &clips[..2] {
            let updates = clip.vertex_update_count();
            assert!((2..=7).contains(&updates), "level {} updated {updates} times", clip.level());
        }

        let mut renderer = RecordingRenderer::new();
        assert_eq!(terrain.draw(&mut renderer, Vec3::ZERO), 2);
        let levels: Vec<u32> = renderer.draw_calls().map(|call| call.level).collect();
        assert_eq!(levels, vec![3, 2]);
    }

    #[test]
    fn test_visible_level_falls_back_to_coarsest() {
        let mut terrain = mock_terrain(&[false, false, false]);
        for _ in 0..5 {
            terrain.update_children(Vec3::ZERO, FRAME);
        }
        assert_eq!(terrain.visible_levels(), 2);

        let mut terrain = mock_terrain(&[true, true, true]);
        terrain.set_min_visible_level(10);
        assert_eq!(terrain.min_visible_level(), 2);
        terrain.set_min_visible_level(1);
        for _ in 0..3 {
            terrain.update_children(Vec3::ZERO, FRAME);
        }
        assert_eq!(terrain.visible_levels(), 1);
    }

    #[test]
    fn test_coarsened_regions_chain_to_level_zero() {
        let start = Region::new(3, 16, 16, 8, 8);
        let mut regions = vec![start];
        add_coarsened_regions(&mut regions, start, 2);
        assert_eq!(
            regions,
            vec![
                Region::new(3, 16, 16, 8, 8),
                Region::new(2, 8, 8, 4, 4),
                Region::new(1, 4, 4, 2, 2),
                Region::new(0, 2, 2, 1, 1),
            ]
        );

        // Present regions stop the chain.
        let mut regions = vec![Region::new(1, 4, 4, 2, 2), Region::new(2, 8, 8, 4, 4)];
        add_coarsened_regions(&mut regions, Region::new(2, 8, 8, 4, 4), 2);
        assert_eq!(regions.len(), 2);
    }

    #[test]
    fn test_mailbox_is_drained_after_threshold() {
        let mut terrain = mock_terrain(&[true, true, true, true]);
        let recorder = Arc::new(RecordingListener::default());
        terrain.add_listener(recorder.clone());

        terrain.update_children(Vec3::ZERO, FRAME);
        terrain.mailbox.add(Region::new(3, 2, 2, 4, 4));
        terrain.mailbox.add(Region::new(3, 500, 500, 4, 4));

        for _ in 0..3 {
            terrain.update_children(Vec3::ZERO, FRAME);
        }
        assert!(recorder.batches.lock().is_empty());
        terrain.update_children(Vec3::ZERO, FRAME);

        let batches = recorder.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0],
            vec![
                Region::new(0, 0, 0, 1, 1),
                Region::new(1, 0, 0, 2, 2),
                Region::new(2, 1, 1, 2, 2),
                Region::new(3, 2, 2, 4, 4),
            ]
        );
    }

    #[test]
    fn test_trimming_twice_changes_nothing() {
        let mut terrain = mock_terrain(&[true, true, true]);
        terrain.update_children(Vec3::ZERO, FRAME);

        let mut regions = vec![
            Region::new(2, 4, -20, 8, 30),
            Region::new(7, 0, 0, 1, 1),
            Region::new(0, -3, 2, 4, 4),
            Region::new(1, 400, 400, 2, 2),
            Region::new(1, -12, -12, 8, 8),
        ];
        terrain.trim_regions(&mut regions);
        let once = regions.clone();
        terrain.trim_regions(&mut regions);

        assert_eq!(regions, once);
        let levels: Vec<u32> = once.iter().map(|r| r.level).collect();
        assert_eq!(levels, vec![0, 1, 2]);
        for region in &once {
            let window = terrain.clipmaps()[region.level as usize].window().expect("positioned");
            assert_eq!(window.intersection(region), Some(*region));
        }
    }

    /// Polls until every tile in `coords` is resident, then runs enough
    /// frames for at least one mailbox drain.
    fn settle(terrain: &mut Terrain, cache: &TerrainGridCache, coords: &[TileCoord]) {
        let resident = |coord: &TileCoord| {
            matches!(cache.tiles().tile_state(*coord), Some(TileState::Resident(_)))
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while !coords.iter().all(resident) && Instant::now() < deadline {
            terrain.poll_caches();
            std::thread::yield_now();
        }
        assert!(coords.iter().all(resident), "tiles never arrived");
        for _ in 0..5 {
            terrain.update_children(Vec3::ZERO, FRAME);
        }
    }

    #[test]
    fn test_tiles_arriving_apart_are_all_written() {
        let early = [TileCoord::new(-1, -1), TileCoord::new(1, 1)];
        let open = Arc::new(AtomicBool::new(false));
        let gate = Arc::clone(&open);
        let fetch: FetchFn<f32> = Arc::new(move |_, coord| {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !early.contains(&coord)
                && !gate.load(Ordering::Acquire)
                && Instant::now() < deadline
            {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(Some(vec![1.0; 64]))
        });
        let configuration = Arc::new(
            TerrainConfiguration::new(1, 8, Vec3::ONE)
                .with_cache_grid_size(4)
                .with_only_positive_quadrant(false)
                .with_height_range(0.0, 1.0),
        );
        let pool = Arc::new(FetchPool::new(16, 64).expect("pool"));
        let cache = Arc::new(TerrainGridCache::with_fetch(
            None,
            fetch,
            0,
            17,
            Arc::clone(&configuration),
            pool,
        ));
        let level: Arc<dyn TerrainCache> = cache.clone();
        let mut terrain = Terrain::new(settings(), configuration, vec![level]).expect("terrain");
        terrain.set_background_updates(false);
        terrain.update_children(Vec3::ZERO, FRAME);

        let window = terrain.clipmaps()[0].window().expect("positioned");
        let first = TileCoord::containing(window.x, window.y, 8);
        let last = TileCoord::containing(window.right() - 1, window.bottom() - 1, 8);
        assert_eq!((first, last), (early[0], early[1]));
        let needed: Vec<TileCoord> = (first.y..=last.y)
            .flat_map(|y| (first.x..=last.x).map(move |x| TileCoord::new(x, y)))
            .collect();

        // Two diagonal tiles: the valid rectangle can only hold one of them.
        settle(&mut terrain, &cache, &early);
        assert!(!terrain.clipmaps()[0].is_ready());

        open.store(true, Ordering::Release);
        settle(&mut terrain, &cache, &needed);

        let clip = &terrain.clipmaps()[0];
        assert!(clip.is_ready());
        for (i, vertex) in clip.vertices().iter().enumerate() {
            assert!((vertex.position[1] - 1.0).abs() < 1e-6, "vertex {i} is {vertex:?}");
        }
    }

    #[test]
    fn test_height_falls_back_through_levels() {
        let mut terrain = mock_terrain(&[false, false, true, true]);
        terrain.set_translation(Vec3::new(10.0, 1.0, 0.0));

        // Level 2 answers with 3.0, scaled by 2 and lifted by 1.
        assert_eq!(terrain.height_at(3.0, 4.0), 7.0);
        assert_eq!(terrain.height_at_level(3.0, 4.0, 3, true).expect("level"), 9.0);
        assert_eq!(terrain.height_at_level(3.0, 4.0, 0, false).expect("level"), 1.0);
        assert!(matches!(
            terrain.height_at_level(0.0, 0.0, 9, true),
            Err(TerrainError::LevelOutOfRange { level: 9, count: 4 })
        ));
    }

    #[test]
    fn test_world_bound_follows_camera() {
        let mut terrain = mock_terrain(&[true, true]);
        terrain.set_translation(Vec3::new(0.0, 5.0, 0.0));
        let bound = terrain.world_bound(Vec3::new(100.0, 50.0, -20.0));
        assert_eq!(bound.center(), Vec3::new(100.0, 13.0, -20.0));
        assert_eq!(bound.extents(), Vec3::new(17.0, 8.0, 17.0));
    }

    #[test]
    fn test_pick_requires_make_pickable() {
        let mut terrain = mock_terrain(&[true, true]);
        terrain.update_children(Vec3::ZERO, FRAME);
        let ray = Ray3::new(Vec3::new(2.5, 20.0, 3.5), Vec3::NEG_Y);
        assert!(terrain.pick(&ray).is_none());

        terrain.make_pickable(Box::new(BresenhamTracer::new()), 32, 1.0);
        let hit = terrain.pick(&ray).expect("hit");
        assert!((hit.point.y - 2.0).abs() < 1e-4);
    }

    fn texture_clipmap(name: &str) -> TextureClipmap {
        let config = TextureConfiguration {
            tile_size: 8,
            cache_grid_size: 4,
            ..TextureConfiguration::default()
        };
        let fetch: FetchFn<[u8; 4]> = Arc::new(|_, _| Ok(Some(vec![[9, 9, 9, 255]; 64])));
        let cache: Arc<dyn TextureCache> = Arc::new(TextureGridCache::with_fetch(
            None,
            fetch,
            0,
            16,
            &config,
            Arc::new(FetchPool::inline()),
        ));
        TextureClipmap::new(name, vec![cache], 16, 1.0, TextureStoreFormat::Rgba8)
            .expect("clipmap")
    }

    #[test]
    fn test_texture_passes_blend_after_first() {
        let mut terrain = mock_terrain(&[true, true]);
        terrain.add_texture_clipmap(texture_clipmap("colour"));
        terrain.add_texture_clipmap(texture_clipmap("detail"));
        terrain.set_normal_clipmap(Some(texture_clipmap("normals")));
        assert_eq!(terrain.texture_polls.lock().len(), 3);
        assert!(terrain.find_texture_clipmap("detail").is_some());
        assert!(terrain.find_texture_clipmap("normals").is_none());

        terrain.update_children(Vec3::ZERO, FRAME);
        let mut renderer = RecordingRenderer::new();
        assert_eq!(terrain.draw(&mut renderer, Vec3::ZERO), 2);

        let commands = renderer.commands();
        let blends: Vec<bool> = commands
            .iter()
            .filter_map(|c| match c {
                RenderCommand::SetBlendEnabled(enabled) => Some(*enabled),
                _ => None,
            })
            .collect();
        assert_eq!(blends, vec![false, true]);
        let pushes = commands
            .iter()
            .filter(|c| matches!(c, RenderCommand::PushBuckets))
            .count();
        assert_eq!(pushes, 2);
        assert!(commands.iter().any(|c| matches!(
            c,
            RenderCommand::BindTexture { unit: DEFAULT_NORMAL_UNIT, .. }
        )));

        terrain.set_normal_clipmap(None);
        assert_eq!(terrain.texture_polls.lock().len(), 2);
        terrain.set_texture_min_visible_level(4);
        assert_eq!(terrain.texture_min_visible_level(), 0);
    }

    #[test]
    fn test_background_updater_starts_once_and_stops() {
        let mut terrain = mock_terrain(&[true, true]);
        terrain.set_background_updates(true);
        terrain.update_children(Vec3::ZERO, FRAME);
        assert!(terrain.is_updating_in_background());
        terrain.update_children(Vec3::ZERO, FRAME);
        assert!(terrain.is_updating_in_background());

        terrain.shutdown();
        assert!(!terrain.is_updating_in_background());
        terrain.update_children(Vec3::ZERO, FRAME);
        assert!(!terrain.is_updating_in_background());
    }
}
