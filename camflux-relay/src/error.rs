//! Error types for relay publishing.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Relay spawn error: {0}")]
    Spawn(String),

    #[error("Relay program error: {0}")]
    Program(String),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] camflux_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
