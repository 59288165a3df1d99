//! Assembly of a [`Terrain`] from data sources.

use std::sync::Arc;

use tessera_common::{TerrainResult, TerrainSettings};
use tracing::info;

use crate::cache::{TerrainCache, TerrainGridCache};
use crate::fetch::FetchPool;
use crate::picker::BresenhamTracer;
use crate::source::{TerrainSource, TextureSource};
use crate::terrain::Terrain;
use crate::texture_cache::{TextureCache, TextureGridCache};
use crate::texture_clipmap::TextureClipmap;

/// Builds a terrain with one cache per level sharing a fetch pool.
pub struct TerrainBuilder {
    source: Arc<dyn TerrainSource>,
    settings: TerrainSettings,
    texture_sources: Vec<Arc<dyn TextureSource>>,
    normal_source: Option<Arc<dyn TextureSource>>,
    picking: Option<(usize, f32)>,
    background_updates: bool,
}

impl TerrainBuilder {
    /// Starts a builder over a height source with default settings.
    #[must_use]
    pub fn new(source: Arc<dyn TerrainSource>) -> Self {
        Self {
            source,
            settings: TerrainSettings::default(),
            texture_sources: Vec::new(),
            normal_source: None,
            picking: None,
            background_updates: true,
        }
    }

    /// Sets the runtime settings.
    #[must_use]
    pub fn with_settings(mut self, settings: TerrainSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Adds a colour texture clipmap fed by `source`.
    #[must_use]
    pub fn with_texture_source(mut self, source: Arc<dyn TextureSource>) -> Self {
        self.texture_sources.push(source);
        self
    }

    /// Sets the source of the normal-map clipmap.
    #[must_use]
    pub fn with_normal_source(mut self, source: Arc<dyn TextureSource>) -> Self {
        self.normal_source = Some(source);
        self
    }

    /// Makes the terrain pickable with a [`BresenhamTracer`].
    #[must_use]
    pub fn with_picking(mut self, max_checks: usize, initial_spacing: f32) -> Self {
        self.picking = Some((max_checks, initial_spacing));
        self
    }

    /// Enables or disables the background cache updater.
    #[must_use]
    pub fn with_background_updates(mut self, enabled: bool) -> Self {
        self.background_updates = enabled;
        self
    }

    /// Validates everything and builds the terrain.
    pub fn build(self) -> TerrainResult<Terrain> {
        let settings = self.settings;
        settings.validate()?;
        let configuration = Arc::new(self.source.configuration());
        configuration.validate(settings.clip_side_size)?;

        let pool = Arc::new(FetchPool::new(
            settings.fetch_workers,
            settings.fetch_queue_capacity,
        )?);

        let mut caches: Vec<Arc<dyn TerrainCache>> = Vec::new();
        let mut parent: Option<Arc<dyn TerrainCache>> = None;
        for level in (0..configuration.clipmap_levels).rev() {
            let cache: Arc<dyn TerrainCache> = Arc::new(TerrainGridCache::new(
                parent.clone(),
                Arc::clone(&self.source),
                level,
                settings.clip_side_size,
                Arc::clone(&configuration),
                Arc::clone(&pool),
            ));
            parent = Some(Arc::clone(&cache));
            caches.push(cache);
        }
        caches.reverse();

        let mut textures = Vec::with_capacity(self.texture_sources.len());
        for source in &self.texture_sources {
            textures.push(build_texture_clipmap(source, &settings, &pool)?);
        }
        let normal = self
            .normal_source
            .as_ref()
            .map(|source| build_texture_clipmap(source, &settings, &pool))
            .transpose()?;

        let mut terrain = Terrain::new(settings, configuration, caches)?;
        terrain.set_background_updates(self.background_updates);
        for clipmap in textures {
            terrain.add_texture_clipmap(clipmap);
        }
        terrain.set_normal_clipmap(normal);
        if let Some((max_checks, initial_spacing)) = self.picking {
            terrain.make_pickable(Box::new(BresenhamTracer::new()), max_checks, initial_spacing);
        }

        info!(
            "Built terrain with {} levels, {} texture clipmaps, {} fetch workers",
            terrain.clipmaps().len(),
            terrain.texture_clipmaps().len(),
            pool.worker_count()
        );
        Ok(terrain)
    }
}

fn build_texture_clipmap(
    source: &Arc<dyn TextureSource>,
    settings: &TerrainSettings,
    pool: &Arc<FetchPool>,
) -> TerrainResult<TextureClipmap> {
    let configuration = source.configuration();
    configuration.validate(settings.texture_clipmap_size)?;

    let mut caches: Vec<Arc<dyn TextureCache>> = Vec::new();
    let mut parent: Option<Arc<dyn TextureCache>> = None;
    for level in (0..configuration.valid_levels).rev() {
        let cache: Arc<dyn TextureCache> = Arc::new(TextureGridCache::new(
            parent.clone(),
            Arc::clone(source),
            level,
            settings.texture_clipmap_size,
            &configuration,
            Arc::clone(pool),
        ));
        parent = Some(Arc::clone(&cache));
        caches.push(cache);
    }
    caches.reverse();

    TextureClipmap::new(
        source.name(),
        caches,
        settings.texture_clipmap_size,
        configuration.texture_density,
        configuration.store_format,
    )
}

impl std::fmt::Debug for TerrainBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerrainBuilder")
            .field("settings", &self.settings)
            .field("texture_sources", &self.texture_sources.len())
            .field("normal_source", &self.normal_source.is_some())
            .finish_non_exhaustive()
    }
}
