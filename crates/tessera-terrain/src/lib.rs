//! # Tessera Terrain
//!
//! Geometry and texture clipmaps for streaming terrain.
//!
//! This crate handles:
//! - Windowed tile caches fed by asynchronous fetches
//! - Toroidal vertex and texel updates as the eye moves
//! - Dirty-region propagation from cache threads to the main thread
//! - Index generation with crack-free level borders
//! - Ray picking against the terrain heights

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod builder;
pub mod cache;
pub mod clipmap_level;
pub mod fetch;
pub mod listener;
pub mod mailbox;
pub mod picker;
pub mod renderer;
pub mod resources;
pub mod source;
pub mod terrain;
pub mod texture_cache;
pub mod texture_clipmap;
pub mod tile_window;
pub mod updater;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::builder::*;
    pub use crate::cache::*;
    pub use crate::clipmap_level::*;
    pub use crate::fetch::*;
    pub use crate::listener::*;
    pub use crate::mailbox::*;
    pub use crate::picker::*;
    pub use crate::renderer::*;
    pub use crate::resources::*;
    pub use crate::source::*;
    pub use crate::terrain::*;
    pub use crate::texture_cache::*;
    pub use crate::texture_clipmap::*;
    pub use crate::tile_window::*;
    pub use crate::updater::*;
}

pub use prelude::*;
