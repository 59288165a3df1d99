//! Driver configuration.
//!
//! Describes the procedural dataset, the camera flight and the clipmap
//! runtime settings. Configuration can be loaded from and saved to a TOML
//! file; anything missing or unreadable falls back to defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tessera_common::TerrainSettings;
use tracing::{info, warn};

/// Configuration file name.
const CONFIG_FILE: &str = "tessera.toml";

/// Driver configuration parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // === Dataset ===
    /// Noise seed (None = random)
    pub seed: Option<u32>,
    /// Number of clip levels
    pub clipmap_levels: u32,
    /// Samples per tile side
    pub tile_size: u32,
    /// Tiles per cache grid side
    pub cache_grid_size: u32,
    /// World units per terrain sample on x and z
    pub horizontal_scale: f32,
    /// World units per unit of normalized height
    pub height_scale: f32,
    /// Stream a colour texture clipmap
    pub textured: bool,

    // === Flight ===
    /// Number of simulated frames
    pub frames: u32,
    /// Simulated time per frame in milliseconds
    pub frame_time_ms: u64,
    /// Camera speed in world units per second
    pub camera_speed: f32,
    /// Camera height above the highest terrain point
    pub camera_altitude: f32,
    /// Number of random waypoints on the flight path
    pub waypoints: u32,
    /// Radius of the area the waypoints are drawn from
    pub flight_radius: f32,
    /// Poll caches on a background thread and pace frames in real time
    pub realtime: bool,

    // === Clipmap ===
    /// Clipmap runtime settings
    pub terrain: TerrainSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            // Dataset
            seed: None,
            clipmap_levels: 6,
            tile_size: 64,
            cache_grid_size: 6,
            horizontal_scale: 1.0,
            height_scale: 200.0,
            textured: true,

            // Flight
            frames: 600,
            frame_time_ms: 16,
            camera_speed: 120.0,
            camera_altitude: 20.0,
            waypoints: 8,
            flight_radius: 2000.0,
            realtime: false,

            // Clipmap
            terrain: TerrainSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Reads the file at [`EngineConfig::config_path`], or defaults.
    pub fn load() -> Self {
        Self::load_from(Self::config_path())
    }

    /// Reads `path`, falling back to defaults when the file is missing,
    /// unreadable or malformed.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No config at {}, using defaults", path.display());
                return Self::default();
            },
            Err(e) => {
                warn!("Cannot read {}: {e}", path.display());
                return Self::default();
            },
        };

        toml::from_str(&text).map_or_else(
            |e| {
                warn!("Ignoring malformed config {}: {e}", path.display());
                Self::default()
            },
            |config| {
                info!("Loaded config from {}", path.display());
                config
            },
        )
    }

    /// Writes the configuration as TOML, creating parent directories.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        let text = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, text)?;
        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// `<config dir>/tessera/tessera.toml`, or `tessera.toml` in the working
    /// directory when no config dir is known.
    pub fn config_path() -> PathBuf {
        user_config_dir().map_or_else(
            || PathBuf::from(CONFIG_FILE),
            |dir| dir.join("tessera").join(CONFIG_FILE),
        )
    }

    /// Clamp configuration values to sensible ranges.
    ///
    /// Clip and texture sizes are snapped to the nearest usable size and the
    /// cache grid is grown until it covers a clip window.
    pub fn validate(&mut self) {
        self.clipmap_levels = self.clipmap_levels.clamp(1, 16);
        self.tile_size = self.tile_size.clamp(8, 512).next_power_of_two();
        self.horizontal_scale = self.horizontal_scale.clamp(0.01, 1000.0);
        self.height_scale = self.height_scale.clamp(0.0, 10_000.0);

        self.frames = self.frames.clamp(1, 1_000_000);
        self.frame_time_ms = self.frame_time_ms.clamp(1, 1000);
        self.camera_speed = self.camera_speed.max(0.0);
        self.waypoints = self.waypoints.clamp(2, 1024);
        self.flight_radius = self.flight_radius.max(1.0);

        let terrain = &mut self.terrain;
        let inner = terrain.clip_side_size.saturating_sub(1).clamp(16, 1024);
        terrain.clip_side_size = inner.next_power_of_two() + 1;
        terrain.texture_clipmap_size = terrain.texture_clipmap_size.clamp(16, 2048);
        terrain.cache_poll_interval_ms = terrain.cache_poll_interval_ms.clamp(1, 10_000);
        terrain.mailbox_update_threshold_ms = terrain.mailbox_update_threshold_ms.clamp(1, 10_000);
        terrain.region_coarsening_ratio = terrain.region_coarsening_ratio.clamp(1, 8);
        terrain.fetch_workers = terrain.fetch_workers.min(64);
        terrain.fetch_queue_capacity = terrain.fetch_queue_capacity.clamp(1, 65_536);

        let window = terrain.clip_side_size.max(terrain.texture_clipmap_size);
        let needed = tessera_common::min_cache_grid_size(window, self.tile_size);
        self.cache_grid_size = self.cache_grid_size.max(needed);
    }

    /// Simulated time per frame.
    #[must_use]
    pub fn frame_time(&self) -> Duration {
        Duration::from_millis(self.frame_time_ms)
    }
}

/// Per-user configuration directory of the current platform.
fn user_config_dir() -> Option<PathBuf> {
    let env_dir = |name: &str| std::env::var_os(name).map(PathBuf::from);
    if cfg!(target_os = "windows") {
        env_dir("APPDATA")
    } else if cfg!(target_os = "macos") {
        env_dir("HOME").map(|home| home.join("Library/Application Support"))
    } else {
        env_dir("XDG_CONFIG_HOME").or_else(|| env_dir("HOME").map(|home| home.join(".config")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_consistent() {
        let mut config = EngineConfig::default();
        let before = config.clone();
        config.validate();
        assert_eq!(config, before);
        assert!(config.terrain.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        config.terrain.clip_side_size = 100;
        config.tile_size = 20;
        config.cache_grid_size = 1;
        config.waypoints = 0;
        config.terrain.region_coarsening_ratio = 0;

        config.validate();

        assert_eq!(config.terrain.clip_side_size, 129);
        assert_eq!(config.tile_size, 32);
        assert_eq!(config.cache_grid_size, 6);
        assert_eq!(config.waypoints, 2);
        assert!(config.terrain.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("nested").join("tessera.toml");

        let mut config = EngineConfig::default();
        config.seed = Some(42);
        config.textured = false;
        config.terrain.fetch_workers = 0;

        config.save_to(&config_path).expect("Failed to save config");

        let loaded = EngineConfig::load_from(&config_path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_load_missing_or_invalid_file() {
        let config = EngineConfig::load_from("/nonexistent/path/tessera.toml");
        assert_eq!(config, EngineConfig::default());

        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("broken.toml");
        fs::write(&path, "frames = \"many\"").expect("write");
        assert_eq!(EngineConfig::load_from(&path), EngineConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("partial.toml");
        fs::write(&path, "frames = 10\n\n[terrain]\nclip_side_size = 65\n").expect("write");

        let config = EngineConfig::load_from(&path);
        assert_eq!(config.frames, 10);
        assert_eq!(config.terrain.clip_side_size, 65);
        assert_eq!(config.terrain.non_visible_update_rate_ms, 500);
        assert_eq!(config.tile_size, 64);
    }
}
