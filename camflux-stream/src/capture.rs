//! Protocol-facing capture traits.
//!
//! A [`ProtocolCapture`] owns the camera session: it knows how to establish
//! the connection, prove that frames can actually be read, and tear the
//! session down again. The blocking per-frame work is split off into a
//! [`FrameSource`], which is handed to a dedicated capture thread so that
//! stalls on a camera socket or decoder pipe never touch the async runtime.

use async_trait::async_trait;
use camflux_core::{
    frame::RawFrame,
    models::{Protocol, StreamDetails},
};

use crate::error::Result;

/// Blocking frame producer, driven from a dedicated OS thread.
pub trait FrameSource: Send {
    /// Pulls the next frame.
    ///
    /// `Ok(None)` means the source is exhausted (pipe closed, stream over)
    /// and the capture loop should end. An `Err` is a transient failure:
    /// callers log it and keep reading, up to a consecutive-failure limit.
    fn capture_frame(&mut self) -> Result<Option<RawFrame>>;
}

/// One camera session for a specific protocol.
///
/// Lifecycle: `connect` then `validate` then `open_source`, in that order.
/// `close` may be called at any point, from any state, and must be
/// idempotent. Closing while a [`FrameSource`] read is in flight must
/// unblock that read where the transport allows it (e.g. by killing the
/// decoder process so the pipe reaches EOF).
#[async_trait]
pub trait ProtocolCapture: Send {
    fn protocol(&self) -> Protocol;

    /// Establishes the protocol session (process spawn, SOAP exchange,
    /// HTTP probe). No frames are read yet.
    async fn connect(&mut self) -> Result<()>;

    /// Confirms the session actually yields usable video and reports what
    /// was discovered about the device along the way.
    async fn validate(&mut self) -> Result<StreamDetails>;

    /// Hands out the blocking source for the capture thread. Consumes the
    /// session's read side; callable once per `connect`.
    fn open_source(&mut self) -> Result<Box<dyn FrameSource>>;

    /// Tears the session down. Never fails; problems are logged.
    async fn close(&mut self);
}

impl std::fmt::Debug for dyn ProtocolCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolCapture")
            .field("protocol", &self.protocol())
            .finish_non_exhaustive()
    }
}
