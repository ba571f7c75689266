//! Camera capture and stream management.
//!
//! This crate turns camera endpoints (RTSP, ONVIF, HTTP MJPEG) into
//! ordered streams of JPEG frames. Each stream pairs a blocking capture
//! thread with an async processing loop; [`service::VideoStreamService`]
//! orchestrates one such pair per camera and fans frames out to
//! registered callbacks.

pub mod capture;
pub mod error;
pub mod factory;
pub mod http_mjpeg;
pub mod manager;
pub mod mjpeg;
pub mod onvif;
pub mod perf;
pub mod rtsp;
pub mod service;

pub use capture::{FrameSource, ProtocolCapture};
pub use error::{Error, Result};
pub use factory::{create_capture, create_capture_by_name, CaptureFactory, DefaultCaptureFactory};
pub use manager::{FrameSink, StreamManager, StreamOptions};
pub use perf::{PerformanceMonitor, SystemSnapshot};
pub use service::{
    FrameCallback, PerformanceReport, StartOptions, StreamEvent, StreamMetrics,
    VideoStreamService,
};
