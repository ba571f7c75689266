//! Error types for capture and stream management.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Stream validation error: {0}")]
    Validation(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Stream already active for camera: {0}")]
    StreamAlreadyActive(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] camflux_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
