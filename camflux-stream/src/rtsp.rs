//! RTSP capture via an external decoder process.
//!
//! The camera's RTSP session is delegated to `ffmpeg`, which is asked to
//! transcode the feed into a continuous MJPEG stream on its stdout. Frames
//! are then recovered from the pipe with the marker scanner in
//! [`crate::mjpeg`]. Killing the process closes the pipe, which is also how
//! a capture thread blocked mid-read gets unstuck during shutdown.

use std::process::{Child, Command, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use camflux_core::{
    frame::RawFrame,
    models::{redact_url_credentials, ConnectionConfig, Protocol, StreamDetails},
};
use tracing::{debug, info, warn};

use crate::capture::{FrameSource, ProtocolCapture};
use crate::error::{Error, Result};
use crate::mjpeg::MjpegFrameReader;

const DEFAULT_DECODER_PROGRAM: &str = "ffmpeg";

/// Decoder invocation for one RTSP URL. TCP transport avoids the packet
/// loss UDP interleaving shows on congested camera VLANs.
fn decoder_args(url: &str, target_fps: u32) -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-rtsp_transport",
        "tcp",
        "-i",
        url,
        "-an",
        "-f",
        "mjpeg",
        "-q:v",
        "5",
        "-r",
        &target_fps.max(1).to_string(),
        "-",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

pub struct RtspCapture {
    camera_id: String,
    url: String,
    target_fps: u32,
    connect_timeout: Duration,
    read_timeout: Duration,
    decoder_program: String,
    child: Option<Child>,
    reader: Option<MjpegFrameReader<std::process::ChildStdout>>,
    validated_first: Option<Bytes>,
}

impl RtspCapture {
    pub fn new(camera_id: impl Into<String>, connection: &ConnectionConfig, target_fps: u32) -> Self {
        let path = connection.rtsp_path.clone().unwrap_or_default();
        Self::with_url(camera_id, connection.rtsp_url(&path), connection, target_fps)
    }

    /// Builds a capture for an already-resolved RTSP URL, e.g. one returned
    /// by an ONVIF GetStreamUri exchange.
    pub fn with_url(
        camera_id: impl Into<String>,
        url: String,
        connection: &ConnectionConfig,
        target_fps: u32,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            url,
            target_fps,
            connect_timeout: connection.connect_timeout(),
            read_timeout: connection.read_timeout(),
            decoder_program: DEFAULT_DECODER_PROGRAM.to_string(),
            child: None,
            reader: None,
            validated_first: None,
        }
    }

    /// Overrides the decoder binary. Used by tests and by deployments that
    /// ship a pinned ffmpeg alongside the daemon.
    #[must_use]
    pub fn decoder_program(mut self, program: impl Into<String>) -> Self {
        self.decoder_program = program.into();
        self
    }

    fn close_sync(&mut self) {
        self.validated_first = None;
        self.reader = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!(camera_id = %self.camera_id, error = %e, "decoder already gone on kill");
            }
            match child.wait() {
                Ok(status) => {
                    debug!(camera_id = %self.camera_id, %status, "decoder process exited")
                }
                Err(e) => warn!(camera_id = %self.camera_id, error = %e, "decoder reap failed"),
            }
        }
    }
}

#[async_trait]
impl ProtocolCapture for RtspCapture {
    fn protocol(&self) -> Protocol {
        Protocol::Rtsp
    }

    async fn connect(&mut self) -> Result<()> {
        let mut child = Command::new(&self.decoder_program)
            .args(decoder_args(&self.url, self.target_fps))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::Connection(format!(
                    "failed to spawn decoder '{}': {e}",
                    self.decoder_program
                ))
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Connection("decoder stdout was not captured".to_string()))?;
        self.reader = Some(MjpegFrameReader::new(stdout));
        self.child = Some(child);
        info!(
            camera_id = %self.camera_id,
            url = %redact_url_credentials(&self.url),
            "decoder started"
        );
        Ok(())
    }

    /// Reads the first frame off the decoder pipe. The read happens on a
    /// blocking task; if it does not complete before the deadline the
    /// decoder is killed, which closes the pipe and ends the task.
    async fn validate(&mut self) -> Result<StreamDetails> {
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| Error::Validation("capture is not connected".to_string()))?;
        let first_frame = tokio::task::spawn_blocking(move || {
            let frame = reader.next_frame();
            (reader, frame)
        });

        let deadline = self.connect_timeout + self.read_timeout;
        match tokio::time::timeout(deadline, first_frame).await {
            Ok(Ok((reader, Ok(Some(frame))))) => {
                let resolution = camflux_core::frame::jpeg_dimensions(&frame).ok();
                let details = StreamDetails {
                    resolution,
                    source_url: Some(redact_url_credentials(&self.url)),
                    ..StreamDetails::default()
                };
                self.validated_first = Some(frame);
                self.reader = Some(reader);
                Ok(details)
            }
            Ok(Ok((_, Ok(None)))) => {
                self.close_sync();
                Err(Error::Validation(
                    "decoder exited before producing a frame".to_string(),
                ))
            }
            Ok(Ok((_, Err(e)))) => {
                self.close_sync();
                Err(Error::Validation(format!(
                    "failed reading first frame from decoder: {e}"
                )))
            }
            Ok(Err(e)) => {
                self.close_sync();
                Err(Error::Capture(format!("validation task failed: {e}")))
            }
            Err(_) => {
                // The blocking read still holds the pipe; killing the
                // decoder forces EOF so the task can finish and drop it.
                self.close_sync();
                Err(Error::Validation(format!(
                    "no frame received within {}s",
                    deadline.as_secs()
                )))
            }
        }
    }

    fn open_source(&mut self) -> Result<Box<dyn FrameSource>> {
        let reader = self
            .reader
            .take()
            .ok_or_else(|| Error::Validation("capture is not validated".to_string()))?;
        Ok(Box::new(PipeSource {
            reader,
            first: self.validated_first.take(),
            seq: 0,
        }))
    }

    async fn close(&mut self) {
        self.close_sync();
    }
}

impl Drop for RtspCapture {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.close_sync();
        }
    }
}

/// Blocking source over the decoder's stdout. The frame validated during
/// startup is replayed first so it is not lost to the consumer.
struct PipeSource {
    reader: MjpegFrameReader<std::process::ChildStdout>,
    first: Option<Bytes>,
    seq: u64,
}

impl PipeSource {
    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }
}

impl FrameSource for PipeSource {
    fn capture_frame(&mut self) -> Result<Option<RawFrame>> {
        if let Some(data) = self.first.take() {
            let seq = self.next_seq();
            return Ok(Some(RawFrame::jpeg(data, seq)));
        }
        match self.reader.next_frame() {
            Ok(Some(data)) => {
                let seq = self.next_seq();
                Ok(Some(RawFrame::jpeg(data, seq)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(Error::Capture(format!("decoder pipe read failed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> ConnectionConfig {
        ConnectionConfig {
            ip: "192.168.1.20".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn decoder_args_carry_url_transport_and_rate() {
        let args = decoder_args("rtsp://cam/live", 12);
        assert!(args.windows(2).any(|w| w == ["-i", "rtsp://cam/live"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["-rtsp_transport", "tcp"]));
        assert!(args.windows(2).any(|w| w == ["-r", "12"]));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn decoder_args_clamp_zero_fps() {
        let args = decoder_args("rtsp://cam/live", 0);
        assert!(args.windows(2).any(|w| w == ["-r", "1"]));
    }

    #[tokio::test]
    async fn connect_fails_for_missing_decoder() {
        let mut capture = RtspCapture::new("cam-a", &connection(), 10)
            .decoder_program("camflux-no-such-decoder");
        let err = capture.connect().await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn validate_requires_connect() {
        let mut capture = RtspCapture::new("cam-a", &connection(), 10);
        let err = capture.validate().await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn validate_fails_when_decoder_exits_without_frames() {
        // `true` ignores the decoder arguments and exits at once, so the
        // pipe reaches EOF before any frame shows up.
        let mut capture = RtspCapture::new("cam-a", &connection(), 10).decoder_program("true");
        capture.connect().await.unwrap();
        let err = capture.validate().await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        capture.close().await;
    }
}
