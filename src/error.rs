//! Centralized error type for the lode umbrella crate.
//!
//! Wraps both subsystem errors so `?` propagates across crate boundaries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Streamer(#[from] lode_streamer::Error),

    #[error("I/O primitives: {0}")]
    Io(#[from] lode_io::Error),

    #[error("Invalid builder setup: {0}")]
    InvalidSetup(String),
}

pub type Result<T> = std::result::Result<T, Error>;
