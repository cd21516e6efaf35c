//! Central error handling for the planet renderer core.
//!
//! Provides a unified PlanetError enum with consistent categorization.
//! Transient tile-source failures never reach this type; they are retried
//! behind the TileSource boundary. Invariant violations and traversal-stack
//! overflow are programmer errors and abort via assertions instead.

use thiserror::Error;

/// Centralized error type for renderer-core operations.
#[derive(Error, Debug)]
pub enum PlanetError {
    /// A tile source reported a permanent failure for a tile, or handed
    /// back a payload that does not match the channel contract.
    #[error("Source error: {0}")]
    Source(String),

    /// The texture-array layer pool is exhausted.
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// Sample data could not be uploaded to the texture array.
    #[error("Upload error: {0}")]
    Upload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlanetError {
    /// Convenience constructors for common error types
    pub fn source<T: ToString>(msg: T) -> Self {
        PlanetError::Source(msg.to_string())
    }

    pub fn capacity<T: ToString>(msg: T) -> Self {
        PlanetError::Capacity(msg.to_string())
    }

    pub fn upload<T: ToString>(msg: T) -> Self {
        PlanetError::Upload(msg.to_string())
    }
}

/// Result type alias for renderer-core operations.
pub type PlanetResult<T> = Result<T, PlanetError>;
