//! Texture clipmaps: one toroidal texture layer per level.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use glam::Vec3;
use tessera_common::{wrap, Region, TerrainError, TerrainResult, TextureStoreFormat};
use tracing::{debug, trace};

use crate::mailbox::DoubleBufferedList;
use crate::renderer::{TerrainRenderer, TextureHandle};
use crate::texture_cache::TextureCache;
use crate::tile_window::RegionMailbox;
use crate::updater::TextureCachePoll;

/// Shader-facing description of a texture clipmap for one draw.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureClipmapState {
    /// Clipmap name
    pub name: String,
    /// Texture array, once created
    pub texture: Option<TextureHandle>,
    /// Texels per layer side
    pub clip_size: u32,
    /// Number of layers
    pub levels: u32,
    /// Finest layer with a complete window
    pub visible_level: u32,
    /// Finest layer the shader may sample
    pub min_visible_level: u32,
    /// Level-0 texels per terrain unit
    pub texture_density: f32,
    /// Terrain-local eye position at the last update
    pub eye_position: Vec3,
}

struct TextureLayer {
    cache: Arc<dyn TextureCache>,
    texels: Vec<[u8; 4]>,
    center: Option<(i32, i32)>,
    dirty: Vec<Region>,
}

impl TextureLayer {
    fn level(&self) -> u32 {
        self.cache.level()
    }

    fn window_at(&self, (cx, cy): (i32, i32), size: u32) -> Region {
        let half = (size / 2) as i32;
        Region::new(self.level(), cx - half, cy - half, size as i32, size as i32)
    }

    fn window(&self, size: u32) -> Option<Region> {
        self.center.map(|c| self.window_at(c, size))
    }

    fn write_rect(&mut self, size: u32, x: i32, y: i32, width: i32, height: i32) {
        if width <= 0 || height <= 0 {
            return;
        }
        self.cache
            .update_region(&mut self.texels, size, x, y, width, height);
        self.dirty.push(Region::new(self.level(), x, y, width, height));
    }
}

/// A stack of toroidally updated texture layers following the eye.
pub struct TextureClipmap {
    name: String,
    clip_size: u32,
    texture_density: f32,
    store_format: TextureStoreFormat,
    layers: Vec<TextureLayer>,
    mailbox: RegionMailbox,
    /// Regions inside a layer window that are not fully valid yet
    pending: Vec<Region>,
    enabled: Arc<AtomicBool>,
    min_visible_level: u32,
    visible_level: u32,
    texture: Option<TextureHandle>,
    force_refresh: bool,
    eye: Vec3,
}

impl TextureClipmap {
    /// Creates a clipmap over `caches`, finest first.
    pub fn new(
        name: impl Into<String>,
        caches: Vec<Arc<dyn TextureCache>>,
        clip_size: u32,
        texture_density: f32,
        store_format: TextureStoreFormat,
    ) -> TerrainResult<Self> {
        if caches.is_empty() {
            return Err(TerrainError::InvalidConfiguration(
                "texture clipmap needs at least one level".into(),
            ));
        }
        let mailbox: RegionMailbox = Arc::new(DoubleBufferedList::new());
        let texels = (clip_size * clip_size) as usize;
        let layers = caches
            .into_iter()
            .map(|cache| {
                cache.set_mailbox(Arc::clone(&mailbox));
                TextureLayer {
                    cache,
                    texels: vec![[0; 4]; texels],
                    center: None,
                    dirty: Vec::new(),
                }
            })
            .collect::<Vec<_>>();
        let coarsest = (layers.len() - 1) as u32;
        Ok(Self {
            name: name.into(),
            clip_size,
            texture_density,
            store_format,
            layers,
            mailbox,
            pending: Vec::new(),
            enabled: Arc::new(AtomicBool::new(true)),
            min_visible_level: 0,
            visible_level: coarsest,
            texture: None,
            force_refresh: false,
            eye: Vec3::ZERO,
        })
    }

    /// Clipmap name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Texture array, once created.
    #[must_use]
    pub fn texture(&self) -> Option<TextureHandle> {
        self.texture
    }

    /// Number of layers.
    #[must_use]
    pub fn level_count(&self) -> u32 {
        self.layers.len() as u32
    }

    /// Caches feeding the layers, finest first.
    #[must_use]
    pub fn caches(&self) -> Vec<Arc<dyn TextureCache>> {
        self.layers.iter().map(|l| Arc::clone(&l.cache)).collect()
    }

    /// Enables or disables updates and drawing.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Returns whether the clipmap is updated and drawn.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Finest layer the shader may sample.
    #[must_use]
    pub fn min_visible_level(&self) -> u32 {
        self.min_visible_level
    }

    /// Sets the finest sampled layer, clamped to the available layers.
    pub fn set_min_visible_level(&mut self, level: u32) {
        self.min_visible_level = level.min(self.level_count() - 1);
    }

    /// Finest layer with a complete window as of the last update.
    #[must_use]
    pub fn visible_level(&self) -> u32 {
        self.visible_level
    }

    /// Forces a full rewrite and upload of every layer on the next update.
    pub fn regenerate(&mut self) {
        self.force_refresh = true;
    }

    /// Handle the background updater uses to poll this clipmap's caches.
    #[must_use]
    pub fn poll_handle(&self) -> TextureCachePoll {
        TextureCachePoll {
            name: self.name.clone(),
            enabled: Arc::clone(&self.enabled),
            caches: self.caches(),
        }
    }

    /// Follows the eye, applies arrived tiles and uploads changed texels.
    pub fn update(&mut self, renderer: &mut dyn TerrainRenderer, eye_local: Vec3) {
        if !self.is_enabled() {
            return;
        }
        self.eye = eye_local;
        let size = self.clip_size;
        let n = size as i32;
        let force = std::mem::take(&mut self.force_refresh);

        if self.texture.is_none() {
            let texture = renderer.create_texture_array(size, self.level_count(), self.store_format);
            debug!("Created texture clipmap '{}' ({size}x{size}x{})", self.name, self.level_count());
            self.texture = Some(texture);
            for layer in &mut self.layers {
                if let Some(window) = layer.window(size) {
                    layer.dirty.push(window);
                }
            }
        }

        for layer in &mut self.layers {
            let scale = self.texture_density / (1u32 << layer.level()) as f32;
            let cx = (eye_local.x * scale).floor() as i32;
            let cy = (eye_local.z * scale).floor() as i32;
            layer.cache.set_current_position(cx, cy);
            let new_window = layer.window_at((cx, cy), size);

            match layer.center {
                Some(old) if old == (cx, cy) && !force => {},
                Some((ox, oy)) if !force && (cx - ox).abs() < n && (cy - oy).abs() < n => {
                    let old_window = layer.window_at((ox, oy), size);
                    let dx = cx - ox;
                    let dy = cy - oy;
                    if dx > 0 {
                        layer.write_rect(size, old_window.right(), new_window.y, dx, n);
                    } else if dx < 0 {
                        layer.write_rect(size, new_window.x, new_window.y, -dx, n);
                    }
                    if dy > 0 {
                        layer.write_rect(size, new_window.x, old_window.bottom(), n, dy);
                    } else if dy < 0 {
                        layer.write_rect(size, new_window.x, new_window.y, n, -dy);
                    }
                },
                _ => layer.write_rect(size, new_window.x, new_window.y, n, n),
            }
            layer.center = Some((cx, cy));
        }

        let mut regions = self.mailbox.switch_and_get();
        regions.append(&mut self.pending);
        for region in regions {
            let Some(layer) = self.layers.iter_mut().find(|l| l.level() == region.level) else {
                continue;
            };
            let Some(in_window) = layer.window(size).and_then(|w| w.intersection(&region)) else {
                trace!("Texture '{}' dropped region {region}", self.name);
                continue;
            };
            let writable = layer
                .cache
                .valid_region()
                .and_then(|valid| in_window.intersection(&valid));
            if writable != Some(in_window) && !self.pending.contains(&in_window) {
                self.pending.push(in_window);
            }
            if let Some(r) = writable {
                layer.write_rect(size, r.x, r.y, r.width, r.height);
            }
        }

        let coarsest = self.level_count() - 1;
        self.visible_level = (self.min_visible_level..=coarsest)
            .find(|&i| self.layers[i as usize].cache.is_valid())
            .unwrap_or(coarsest);

        if let Some(texture) = self.texture {
            self.upload(renderer, texture);
        }
    }

    fn upload(&mut self, renderer: &mut dyn TerrainRenderer, texture: TextureHandle) {
        let size = self.clip_size;
        let format = self.store_format;
        for (index, layer) in self.layers.iter_mut().enumerate() {
            for rect in std::mem::take(&mut layer.dirty) {
                for (x, y, width, height) in split_toroidal(&rect, size) {
                    let bytes = gather(&layer.texels, size, (x, y, width, height), format);
                    renderer.write_texture_region(
                        texture,
                        index as u32,
                        x,
                        y,
                        width,
                        height,
                        &bytes,
                    );
                }
            }
        }
    }

    /// Shader parameters for the next draw.
    #[must_use]
    pub fn prepare_to_draw_clips(&self) -> TextureClipmapState {
        TextureClipmapState {
            name: self.name.clone(),
            texture: self.texture,
            clip_size: self.clip_size,
            levels: self.level_count(),
            visible_level: self.visible_level,
            min_visible_level: self.min_visible_level,
            texture_density: self.texture_density,
            eye_position: self.eye,
        }
    }
}

impl std::fmt::Debug for TextureClipmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureClipmap")
            .field("name", &self.name)
            .field("levels", &self.layers.len())
            .field("visible_level", &self.visible_level)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

/// Splits a rectangle of level texels into storage rectangles that do not
/// cross the toroidal wrap.
fn split_toroidal(rect: &Region, size: u32) -> Vec<(u32, u32, u32, u32)> {
    let n = size as i32;
    let width = rect.width.min(n);
    let height = rect.height.min(n);
    let x0 = wrap(rect.x, size) as i32;
    let y0 = wrap(rect.y, size) as i32;
    let spans = |start: i32, len: i32| -> Vec<(i32, i32)> {
        if start + len <= n {
            vec![(start, len)]
        } else {
            vec![(start, n - start), (0, start + len - n)]
        }
    };
    let mut out = Vec::with_capacity(4);
    for &(y, h) in &spans(y0, height) {
        for &(x, w) in &spans(x0, width) {
            out.push((x as u32, y as u32, w as u32, h as u32));
        }
    }
    out
}

/// Copies a storage rectangle into upload bytes.
fn gather(
    texels: &[[u8; 4]],
    size: u32,
    (x, y, width, height): (u32, u32, u32, u32),
    format: TextureStoreFormat,
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity((width * height) as usize * format.bytes_per_texel());
    for row in y..y + height {
        let start = (row * size + x) as usize;
        let texels = &texels[start..start + width as usize];
        match format {
            TextureStoreFormat::Rgba8 => bytes.extend_from_slice(bytemuck::cast_slice(texels)),
            TextureStoreFormat::Rgb8 => {
                for t in texels {
                    bytes.extend_from_slice(&t[..3]);
                }
            },
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchPool;
    use crate::renderer::{RecordingRenderer, RenderCommand};
    use crate::texture_cache::TextureGridCache;
    use crate::tile_window::FetchFn;
    use tessera_common::{TextureConfiguration, TileCoord};

    fn clipmap(levels: u32) -> TextureClipmap {
        let config = TextureConfiguration {
            tile_size: 8,
            cache_grid_size: 4,
            ..TextureConfiguration::default()
        };
        let pool = Arc::new(FetchPool::inline());
        let mut caches: Vec<Arc<dyn TextureCache>> = Vec::new();
        let mut parent: Option<Arc<dyn TextureCache>> = None;
        for level in (0..levels).rev() {
            let fetch: FetchFn<[u8; 4]> = Arc::new(move |level, _: TileCoord| {
                Ok(Some(vec![[level as u8, 0, 0, 255]; 64]))
            });
            let cache: Arc<dyn TextureCache> = Arc::new(TextureGridCache::with_fetch(
                parent.clone(),
                fetch,
                level,
                16,
                &config,
                Arc::clone(&pool),
            ));
            parent = Some(Arc::clone(&cache));
            caches.insert(0, cache);
        }
        TextureClipmap::new("colour", caches, 16, 1.0, TextureStoreFormat::Rgba8).expect("clipmap")
    }

    #[test]
    fn test_split_toroidal() {
        let pieces = split_toroidal(&Region::new(0, 14, -1, 4, 2), 16);
        assert_eq!(
            pieces,
            vec![(14, 15, 2, 1), (0, 15, 2, 1), (14, 0, 2, 1), (0, 0, 2, 1)]
        );
        assert_eq!(split_toroidal(&Region::new(0, 0, 0, 16, 16), 16), vec![(0, 0, 16, 16)]);
    }

    #[test]
    fn test_gather_rgb_drops_alpha() {
        let texels = vec![[1, 2, 3, 4]; 4];
        assert_eq!(gather(&texels, 2, (0, 0, 2, 1), TextureStoreFormat::Rgb8), vec![1, 2, 3, 1, 2, 3]);
        assert_eq!(gather(&texels, 2, (1, 1, 1, 1), TextureStoreFormat::Rgba8), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_update_uploads_and_selects_level() {
        let mut clip = clipmap(3);
        let mut renderer = RecordingRenderer::new();
        clip.update(&mut renderer, Vec3::new(4.0, 0.0, 4.0));
        assert!(clip.texture().is_some());
        // Tiles were fetched inline but not yet promoted.
        assert_eq!(clip.visible_level(), 2);

        for cache in clip.caches() {
            cache.check_for_updates();
        }
        renderer.take_commands();
        clip.update(&mut renderer, Vec3::new(4.0, 0.0, 4.0));
        assert_eq!(clip.visible_level(), 0);
        assert!(renderer
            .commands()
            .iter()
            .any(|c| matches!(c, RenderCommand::WriteTextureRegion { layer: 0, .. })));

        clip.set_min_visible_level(9);
        assert_eq!(clip.min_visible_level(), 2);
        clip.update(&mut renderer, Vec3::new(4.0, 0.0, 4.0));
        let state = clip.prepare_to_draw_clips();
        assert_eq!(state.visible_level, 2);
        assert_eq!(state.levels, 3);
    }

    #[test]
    fn test_disabled_clipmap_does_nothing() {
        let mut clip = clipmap(2);
        clip.set_enabled(false);
        let mut renderer = RecordingRenderer::new();
        clip.update(&mut renderer, Vec3::ZERO);
        assert!(renderer.commands().is_empty());
        assert!(!clip.poll_handle().enabled.load(Ordering::Acquire));
    }

    #[test]
    fn test_regenerate_rewrites_whole_layers() {
        let mut clip = clipmap(2);
        let mut renderer = RecordingRenderer::new();
        clip.update(&mut renderer, Vec3::ZERO);
        renderer.take_commands();
        clip.update(&mut renderer, Vec3::ZERO);
        assert!(renderer.commands().is_empty());

        clip.regenerate();
        clip.update(&mut renderer, Vec3::ZERO);
        let uploads = renderer
            .commands()
            .iter()
            .filter(|c| matches!(c, RenderCommand::WriteTextureRegion { .. }))
            .count();
        assert!(uploads >= 2);
    }
}
