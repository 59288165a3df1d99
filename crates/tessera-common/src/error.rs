//! Error types for Tessera.

use thiserror::Error;

/// Top-level error type for terrain operations.
#[derive(Debug, Error)]
pub enum TerrainError {
    /// Settings or dataset description rejected at construction time
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A clip level index outside the terrain's levels
    #[error("Level {level} out of range (terrain has {count} levels)")]
    LevelOutOfRange {
        /// Requested level
        level: usize,
        /// Number of levels available
        count: usize,
    },

    /// Data source errors
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// A worker or background thread could not be started
    #[error("Failed to spawn thread '{name}': {reason}")]
    ThreadSpawn {
        /// Thread name
        name: String,
        /// OS error description
        reason: String,
    },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by terrain and texture data sources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The tile cannot be produced by this source
    #[error("Tile unavailable at level {level} ({x}, {y})")]
    TileUnavailable {
        /// Clip level
        level: u32,
        /// Tile X coordinate
        x: i32,
        /// Tile Y coordinate
        y: i32,
    },

    /// The source returned a payload of the wrong size
    #[error("Invalid tile data: expected {expected} samples, got {actual}")]
    InvalidTileData {
        /// Expected sample count
        expected: usize,
        /// Actual sample count
        actual: usize,
    },

    /// Backend specific failure
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type alias for terrain operations.
pub type TerrainResult<T> = Result<T, TerrainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_converts() {
        let err: TerrainError = SourceError::TileUnavailable { level: 2, x: -1, y: 3 }.into();
        assert!(matches!(err, TerrainError::Source(_)));
        assert_eq!(
            err.to_string(),
            "Source error: Tile unavailable at level 2 (-1, 3)"
        );
    }
}
