//! Procedural height and colour sources built on layered Perlin noise.

use glam::Vec3;
use noise::{NoiseFn, Perlin};
use parking_lot::Mutex;
use tessera_common::{
    SourceError, TerrainConfiguration, TextureConfiguration, TextureStoreFormat, TileCoord,
};

use super::{TerrainSource, TextureSource};

/// Noise parameters.
#[derive(Debug, Clone)]
pub struct NoiseConfig {
    /// Noise seed
    pub seed: u32,
    /// Terrain scale (larger = smoother)
    pub terrain_scale: f64,
    /// Frequency multiplier of the detail layer
    pub detail_frequency: f64,
    /// Weight of the detail layer
    pub detail_weight: f64,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            seed: 12345,
            terrain_scale: 512.0,
            detail_frequency: 4.0,
            detail_weight: 0.1,
        }
    }
}

/// Two-layer Perlin height function over terrain-local coordinates.
pub struct HeightFunction {
    config: NoiseConfig,
    terrain_noise: Perlin,
    detail_noise: Perlin,
}

impl HeightFunction {
    /// Creates a new function with the given config.
    #[must_use]
    pub fn new(config: NoiseConfig) -> Self {
        let terrain_noise = Perlin::new(config.seed);
        let detail_noise = Perlin::new(config.seed.wrapping_add(1));
        Self {
            config,
            terrain_noise,
            detail_noise,
        }
    }

    /// Creates a function with default config.
    #[must_use]
    pub fn with_seed(seed: u32) -> Self {
        Self::new(NoiseConfig {
            seed,
            ..Default::default()
        })
    }

    /// Raw noise value, roughly in `[-1, 1]`.
    #[must_use]
    pub fn eval(&self, x: f64, y: f64) -> f64 {
        let wx = x / self.config.terrain_scale;
        let wy = y / self.config.terrain_scale;
        let height = self.terrain_noise.get([wx, wy]);
        let f = self.config.detail_frequency;
        let detail = self.detail_noise.get([wx * f, wy * f]) * self.config.detail_weight;
        height + detail
    }

    /// Noise value mapped to `[0, 1]`.
    #[must_use]
    pub fn normalized(&self, x: f64, y: f64) -> f32 {
        (self.eval(x, y) * 0.5 + 0.5).clamp(0.0, 1.0) as f32
    }

    /// Noise parameters.
    #[must_use]
    pub const fn config(&self) -> &NoiseConfig {
        &self.config
    }
}

impl std::fmt::Debug for HeightFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeightFunction")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Fills `scratch` with `tile_size²` samples of a level, calling `sample` with
/// level-0 coordinates.
fn populate<T: Copy>(
    scratch: &mut Vec<T>,
    level: u32,
    tile: TileCoord,
    tile_size: u32,
    mut sample: impl FnMut(f64, f64) -> T,
) {
    scratch.clear();
    let (ox, oy) = tile.sample_origin(tile_size);
    let ts = tile_size as i32;
    for y in 0..ts {
        for x in 0..ts {
            let lx = i64::from(ox + x) << level;
            let ly = i64::from(oy + y) << level;
            scratch.push(sample(lx as f64, ly as f64));
        }
    }
}

/// Height source evaluating a [`HeightFunction`] on demand.
#[derive(Debug)]
pub struct ProceduralTerrainSource {
    function: HeightFunction,
    configuration: TerrainConfiguration,
    scratch: Mutex<Vec<f32>>,
}

impl ProceduralTerrainSource {
    /// Creates a source with `levels` clip levels and the given horizontal scale.
    #[must_use]
    pub fn new(function: HeightFunction, levels: u32, scale: Vec3) -> Self {
        let configuration = TerrainConfiguration::new(levels, 128, scale).with_height_range(0.0, 1.0);
        Self {
            function,
            configuration,
            scratch: Mutex::new(Vec::new()),
        }
    }

    /// Overrides the dataset description.
    #[must_use]
    pub fn with_configuration(mut self, configuration: TerrainConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    /// Height at a terrain-local position, in `[0, 1]`.
    #[must_use]
    pub fn height(&self, x: f64, z: f64) -> f32 {
        self.function.normalized(x, z)
    }
}

impl TerrainSource for ProceduralTerrainSource {
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
        let mut scratch = self.scratch.lock();
        populate(&mut scratch, level, tile, self.configuration.tile_size, |x, y| {
            self.function.normalized(x, y)
        });
        Ok(Some(scratch.clone()))
    }
}

/// Number of entries in the colour ramp.
const RAMP_SIZE: usize = 256;

/// Key colours of the height ramp, indexed by quantized height.
const RAMP_KEYS: [(usize, [f32; 3]); 8] = [
    (0, [0.0, 0.0, 0.5]),
    (95, [0.0, 0.0, 1.0]),
    (127, [0.0, 0.5, 1.0]),
    (137, [240.0 / 255.0, 240.0 / 255.0, 64.0 / 255.0]),
    (143, [32.0 / 255.0, 160.0 / 255.0, 0.0]),
    (175, [224.0 / 255.0, 224.0 / 255.0, 0.0]),
    (223, [128.0 / 255.0, 128.0 / 255.0, 128.0 / 255.0]),
    (255, [1.0, 1.0, 1.0]),
];

/// Builds the full ramp by interpolating linearly between key colours.
fn build_color_ramp() -> Vec<[u8; 4]> {
    let mut ramp = Vec::with_capacity(RAMP_SIZE);
    for pair in RAMP_KEYS.windows(2) {
        let (start, from) = pair[0];
        let (end, to) = pair[1];
        for i in start..end {
            let t = (i - start) as f32 / (end - start) as f32;
            let channel = |c: usize| ((from[c] + (to[c] - from[c]) * t) * 255.0).round() as u8;
            ramp.push([channel(0), channel(1), channel(2), 255]);
        }
    }
    let (_, last) = RAMP_KEYS[RAMP_KEYS.len() - 1];
    ramp.push([
        (last[0] * 255.0) as u8,
        (last[1] * 255.0) as u8,
        (last[2] * 255.0) as u8,
        255,
    ]);
    ramp
}

/// Colour source mapping the height function through a terrain colour ramp.
#[derive(Debug)]
pub struct ProceduralTextureSource {
    name: String,
    function: HeightFunction,
    ramp: Vec<[u8; 4]>,
    configuration: TextureConfiguration,
    scratch: Mutex<Vec<[u8; 4]>>,
}

impl ProceduralTextureSource {
    /// Creates a colour source over the given height function.
    #[must_use]
    pub fn new(name: impl Into<String>, function: HeightFunction) -> Self {
        Self {
            name: name.into(),
            function,
            ramp: build_color_ramp(),
            configuration: TextureConfiguration {
                valid_levels: 8,
                tile_size: 128,
                texture_density: 1.0,
                store_format: TextureStoreFormat::Rgb8,
                ..TextureConfiguration::default()
            },
            scratch: Mutex::new(Vec::new()),
        }
    }

    /// Overrides the dataset description.
    #[must_use]
    pub fn with_configuration(mut self, configuration: TextureConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    /// Ramp colour for a normalized height.
    #[must_use]
    pub fn color(&self, value: f32) -> [u8; 4] {
        let index = (value.clamp(0.0, 1.0) * 255.0) as usize;
        self.ramp[index.min(RAMP_SIZE - 1)]
    }
}

impl TextureSource for ProceduralTextureSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn configuration(&self) -> TextureConfiguration {
        self.configuration.clone()
    }

    fn tile(&self, level: u32, tile: TileCoord) -> Result<Option<Vec<[u8; 4]>>, SourceError> {
        if level >= self.configuration.valid_levels {
            return Err(SourceError::TileUnavailable {
                level,
                x: tile.x,
                y: tile.y,
            });
        }
        let density = f64::from(self.configuration.texture_density);
        let mut scratch = self.scratch.lock();
        populate(&mut scratch, level, tile, self.configuration.tile_size, |x, y| {
            self.color(self.function.normalized(x / density, y / density))
        });
        Ok(Some(scratch.clone()))
    }
}
