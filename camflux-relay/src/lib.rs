//! Relay publishing: pushes camera streams to a remote media server
//! through an external transcoder process.
//!
//! Each publisher is a supervised subprocess. Progress metrics are parsed
//! from its stderr, failures are classified from the same output, and a
//! bounded reconnect cycle keeps transient network losses from taking a
//! camera offline permanently.

pub mod error;
pub mod metrics;
pub mod parser;
pub mod process;
pub mod service;
pub mod urls;

pub use error::{Error, Result};
pub use metrics::{PublishMetrics, QualityBand};
pub use parser::{classify_failure, FailureKind, ProgressParser};
pub use process::{probe_program, RelayProcess};
pub use service::{PublishResult, PublishState, PublishStatus, RtspPublisherService};
pub use urls::{build_publish_path, build_source_url, build_target_url};
