//! Error types.

use thiserror::Error;

/// Error type.
///
/// Per-request failures are reported as request statuses; these errors cover
/// construction and thread management.
#[derive(Error, Debug)]
pub enum Error {
    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Buffer or allocator misuse.
    #[error("Buffer error: {0}")]
    Buffer(#[from] lode_io::Error),

    /// A compression codec rejected its input.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The scheduling thread could not be spawned.
    #[error("Failed to spawn scheduler thread: {0}")]
    ThreadSpawn(std::io::Error),

    /// The scheduling thread was already started.
    #[error("Scheduler thread already running")]
    AlreadyRunning,
}

/// Result type.
pub type Result<T> = std::result::Result<T, Error>;
