//! Error types.

use thiserror::Error;

/// Error type.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Alignment was zero or not a power of two.
    #[error("Invalid alignment: {0}. Must be a non-zero power of two")]
    InvalidAlignment(usize),

    /// A copy touched bytes outside of a buffer.
    #[error("Range {offset}..{end} is out of bounds for a buffer of {len} bytes")]
    OutOfBounds { offset: usize, end: usize, len: usize },
}

/// Result type.
pub type Result<T> = std::result::Result<T, Error>;
