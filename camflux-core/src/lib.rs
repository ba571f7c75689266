// camflux-core - Shared foundation for the camflux camera streaming stack
//
// - config/      - Layered configuration (file + CAMFLUX_* environment)
// - models/      - Stream/publish data model shared across crates
// - frame        - Raw/encoded frame types and the converter strategy
// - directory    - Camera lookup capability consumed by the publisher

pub mod config;
pub mod directory;
pub mod error;
pub mod frame;
pub mod logging;
pub mod models;

pub use config::Config;
pub use error::{Error, Result};
pub use frame::{EncodedFrame, FrameConverter, JpegConverter, PixelFormat, RawFrame};
pub use models::{ConnectionConfig, Protocol, StreamDetails, StreamModel, StreamStatus};
