//! Scripted camera flight over a procedural terrain.
//!
//! Builds a terrain from the driver configuration, flies a camera along a
//! looping path of random waypoints and records what the clipmap did on
//! the way: which level was visible, how much was uploaded and how many
//! tiles ended up resident.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use glam::{Vec2, Vec3};
use tessera_common::{Ray3, TerrainConfiguration, TextureConfiguration};
use tessera_terrain::{
    HeightFunction, ProceduralTerrainSource, ProceduralTextureSource, RecordingRenderer, Terrain,
    TerrainBuilder, TerrainCache,
};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::perf::{FrameStats, FrameSummary, ScopedTimer};

/// Cells a downward pick may visit.
const PICK_CHECKS: usize = 256;

/// Closed loop through a set of waypoints on the XZ plane.
#[derive(Debug, Clone)]
pub struct CameraPath {
    waypoints: Vec<Vec2>,
    /// Cumulative length at the start of each segment
    offsets: Vec<f32>,
    length: f32,
}

impl CameraPath {
    /// Creates a loop through `waypoints`, visited in order.
    #[must_use]
    pub fn new(waypoints: Vec<Vec2>) -> Self {
        let mut offsets = Vec::with_capacity(waypoints.len());
        let mut length = 0.0;
        for (i, point) in waypoints.iter().enumerate() {
            offsets.push(length);
            let next = waypoints[(i + 1) % waypoints.len()];
            length += point.distance(next);
        }
        Self {
            waypoints,
            offsets,
            length,
        }
    }

    /// Random loop of `count` waypoints inside a square of half size `radius`.
    #[must_use]
    pub fn random(seed: u64, count: usize, radius: f32) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let waypoints = (0..count.max(2))
            .map(|_| {
                Vec2::new(
                    (rng.f32() * 2.0 - 1.0) * radius,
                    (rng.f32() * 2.0 - 1.0) * radius,
                )
            })
            .collect();
        Self::new(waypoints)
    }

    /// Waypoints in visiting order.
    #[must_use]
    pub fn waypoints(&self) -> &[Vec2] {
        &self.waypoints
    }

    /// Total loop length.
    #[must_use]
    pub fn length(&self) -> f32 {
        self.length
    }

    /// Position after travelling `distance` along the loop.
    #[must_use]
    pub fn position_at(&self, distance: f32) -> Vec2 {
        let Some(&first) = self.waypoints.first() else {
            return Vec2::ZERO;
        };
        if self.length <= 0.0 {
            return first;
        }
        let d = distance.rem_euclid(self.length);
        let segment = self.offsets.partition_point(|&o| o <= d).saturating_sub(1);
        let start = self.waypoints[segment];
        let end = self.waypoints[(segment + 1) % self.waypoints.len()];
        let span = start.distance(end);
        if span <= f32::EPSILON {
            return start;
        }
        start.lerp(end, (d - self.offsets[segment]) / span)
    }
}

/// What happened during a flight.
#[derive(Debug, Clone, Default)]
pub struct FlightReport {
    /// Frames flown
    pub frames: u32,
    /// Indexed draws issued
    pub draw_calls: u64,
    /// Bytes uploaded to buffers and textures
    pub uploaded_bytes: u64,
    /// Frames spent with each level as the finest visible one
    pub visible_histogram: Vec<u32>,
    /// Resident height tiles per level at the end of the flight
    pub resident_tiles: Vec<usize>,
    /// Frames on which a downward pick hit the terrain
    pub ground_hits: u32,
    /// Lowest camera clearance above the picked ground
    pub min_clearance: Option<f32>,
    /// Wall-clock timings
    pub timing: FrameSummary,
}

impl fmt::Display for FlightReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} frames, {} draws, {} KiB uploaded",
            self.frames,
            self.draw_calls,
            self.uploaded_bytes / 1024
        )?;
        writeln!(f, "visible level histogram: {:?}", self.visible_histogram)?;
        writeln!(f, "resident tiles per level: {:?}", self.resident_tiles)?;
        match self.min_clearance {
            Some(clearance) => writeln!(
                f,
                "ground hits: {} (min clearance {clearance:.1})",
                self.ground_hits
            )?,
            None => writeln!(f, "ground hits: {}", self.ground_hits)?,
        }
        write!(f, "timing: {}", self.timing)
    }
}

/// Builds the procedural terrain described by `config`.
pub fn build_terrain(config: &EngineConfig, seed: u32) -> Result<Terrain> {
    let scale = Vec3::new(
        config.horizontal_scale,
        config.height_scale,
        config.horizontal_scale,
    );
    let configuration = TerrainConfiguration::new(config.clipmap_levels, config.tile_size, scale)
        .with_cache_grid_size(config.cache_grid_size)
        .with_height_range(0.0, 1.0);
    let source = ProceduralTerrainSource::new(
        HeightFunction::with_seed(seed),
        config.clipmap_levels,
        scale,
    )
    .with_configuration(configuration);

    let mut builder = TerrainBuilder::new(Arc::new(source))
        .with_settings(config.terrain.clone())
        .with_picking(PICK_CHECKS, 1.0)
        .with_background_updates(config.realtime);

    if config.textured {
        let texture = ProceduralTextureSource::new("colour", HeightFunction::with_seed(seed))
            .with_configuration(TextureConfiguration {
                valid_levels: config.clipmap_levels,
                tile_size: config.tile_size,
                cache_grid_size: config.cache_grid_size,
                ..TextureConfiguration::default()
            });
        builder = builder.with_texture_source(Arc::new(texture));
    }

    builder.build().context("failed to build terrain")
}

/// Flies the camera for `config.frames` frames.
pub fn run(config: &EngineConfig) -> Result<FlightReport> {
    let seed = config.seed.unwrap_or_else(|| fastrand::u32(..));
    info!("Flying over terrain with seed {seed}");

    let mut terrain = build_terrain(config, seed)?;
    let path = CameraPath::random(
        u64::from(seed),
        config.waypoints as usize,
        config.flight_radius,
    );
    info!(
        "Camera loop through {} waypoints, {:.0} units long",
        path.waypoints().len(),
        path.length()
    );
    let report = fly(&mut terrain, &path, config);
    terrain.shutdown();
    Ok(report)
}

/// Flies `terrain` along `path`.
pub fn fly(terrain: &mut Terrain, path: &CameraPath, config: &EngineConfig) -> FlightReport {
    let frame_time = config.frame_time();
    let step = config.camera_speed * frame_time.as_secs_f32();
    let mut renderer = RecordingRenderer::new();
    let mut stats = FrameStats::default();
    let mut report = FlightReport {
        visible_histogram: vec![0; terrain.clipmaps().len()],
        ..FlightReport::default()
    };

    for frame in 0..config.frames {
        let ground = path.position_at(step * frame as f32);
        let altitude = terrain.height_at(ground.x, ground.y) + config.camera_altitude;
        let camera = Vec3::new(ground.x, altitude, ground.y);

        let timer = ScopedTimer::start();
        terrain.update_children(camera, frame_time);
        if !config.realtime {
            terrain.poll_caches();
        }
        let update = timer.stop();

        let timer = ScopedTimer::start();
        let draws = terrain.draw(&mut renderer, camera);
        renderer.take_commands();
        let draw = timer.stop();
        stats.record_frame(update, draw);

        report.draw_calls += draws as u64;
        if let Some(count) = report.visible_histogram.get_mut(terrain.visible_levels()) {
            *count += 1;
        }
        if let Some(hit) = terrain.pick(&Ray3::new(camera, Vec3::NEG_Y)) {
            report.ground_hits += 1;
            let clearance = camera.y - hit.point.y;
            report.min_clearance = Some(report.min_clearance.map_or(clearance, |c| c.min(clearance)));
        }

        if frame % 100 == 0 {
            debug!(
                "Frame {frame}: camera ({:.1}, {:.1}, {:.1}), visible level {}",
                camera.x,
                camera.y,
                camera.z,
                terrain.visible_levels()
            );
        }

        if config.realtime {
            let spent = Duration::from_secs_f32(update + draw);
            if let Some(rest) = frame_time.checked_sub(spent) {
                thread::sleep(rest);
            }
        }
    }

    report.frames = config.frames;
    report.uploaded_bytes = renderer.uploaded_bytes();
    report.resident_tiles = terrain
        .clipmaps()
        .iter()
        .map(|clip| clip.cache().resident_tiles())
        .collect();
    report.timing = stats.summary();
    report
}
