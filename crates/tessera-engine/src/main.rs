//! # Tessera
//!
//! Headless driver for the terrain clipmap. Flies a camera over a
//! procedural terrain and reports how the clip levels streamed.
//!
//! Usage: `tessera [CONFIG.toml]`, or `tessera --init [CONFIG.toml]` to
//! write the default configuration.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

mod config;
mod flythrough;
mod perf;

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::EngineConfig;

/// Main entry point.
fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("tessera=info".parse()?))
        .init();

    info!("Tessera {}", env!("CARGO_PKG_VERSION"));

    let mut args = std::env::args().skip(1).peekable();
    let init = args.next_if(|a| a == "--init").is_some();
    let explicit = args.next().map(PathBuf::from);

    if init {
        let path = explicit.unwrap_or_else(EngineConfig::config_path);
        EngineConfig::default()
            .save_to(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        return Ok(());
    }

    let mut config = explicit.map_or_else(EngineConfig::load, EngineConfig::load_from);
    config.validate();

    let report = flythrough::run(&config)?;
    for line in report.to_string().lines() {
        info!("{line}");
    }

    info!("Flythrough complete");
    Ok(())
}
