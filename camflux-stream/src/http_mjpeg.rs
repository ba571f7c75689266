//! HTTP capture for cameras that serve JPEG over plain HTTP.
//!
//! Two server shapes are supported, picked by the probed Content-Type:
//! `multipart/x-mixed-replace` bodies are read as one endless stream and
//! split on JPEG markers, while `image/jpeg` endpoints are polled with one
//! GET per frame. The probe runs on the async side; the actual body reads
//! use a blocking client that is only ever constructed on the capture
//! thread, since a blocking reqwest client must not be built inside the
//! runtime.

use std::time::Duration;

use async_trait::async_trait;
use camflux_core::{
    frame::RawFrame,
    models::{redact_url_credentials, ConnectionConfig, Protocol, StreamDetails},
};
use tracing::{debug, info};

use crate::capture::{FrameSource, ProtocolCapture};
use crate::error::{Error, Result};
use crate::mjpeg::MjpegFrameReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpMode {
    /// Persistent multipart stream, frames split on JPEG markers.
    Multipart,
    /// Snapshot endpoint, one GET per frame.
    Snapshot,
}

fn mode_for_content_type(content_type: &str) -> Option<HttpMode> {
    let lower = content_type.to_ascii_lowercase();
    if lower.starts_with("multipart/x-mixed-replace") {
        Some(HttpMode::Multipart)
    } else if lower.starts_with("image/jpeg") {
        Some(HttpMode::Snapshot)
    } else {
        None
    }
}

pub struct HttpMjpegCapture {
    camera_id: String,
    connection: ConnectionConfig,
    url: String,
    mode: Option<HttpMode>,
}

impl HttpMjpegCapture {
    pub fn new(camera_id: impl Into<String>, connection: ConnectionConfig) -> Self {
        let path = connection.http_path.clone().unwrap_or_default();
        let url = connection.http_url(&path);
        Self {
            camera_id: camera_id.into(),
            connection,
            url,
            mode: None,
        }
    }
}

#[async_trait]
impl ProtocolCapture for HttpMjpegCapture {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    /// Probes the endpoint: status and Content-Type decide whether and how
    /// the camera can be read. The probe connection is dropped without
    /// consuming the body.
    async fn connect(&mut self) -> Result<()> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.connection.connect_timeout())
            .build()?;
        let mut request = client.get(&self.url);
        if !self.connection.username.is_empty() {
            request = request.basic_auth(
                &self.connection.username,
                Some(&self.connection.password),
            );
        }
        let deadline = self.connection.connect_timeout() + self.connection.read_timeout();
        let response = tokio::time::timeout(deadline, request.send())
            .await
            .map_err(|_| {
                Error::Connection(format!(
                    "no response from {} within {}s",
                    redact_url_credentials(&self.url),
                    deadline.as_secs()
                ))
            })?
            .map_err(|e| Error::Connection(format!("HTTP probe failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::Validation(format!(
                "HTTP authentication rejected with status {status}"
            )));
        }
        if !status.is_success() {
            return Err(Error::Connection(format!(
                "HTTP probe failed with status {status}"
            )));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let mode = mode_for_content_type(&content_type).ok_or_else(|| {
            Error::Validation(format!(
                "endpoint is not an MJPEG source (content type '{content_type}')"
            ))
        })?;
        self.mode = Some(mode);
        info!(
            camera_id = %self.camera_id,
            url = %redact_url_credentials(&self.url),
            ?mode,
            "HTTP endpoint probed"
        );
        Ok(())
    }

    async fn validate(&mut self) -> Result<StreamDetails> {
        if self.mode.is_none() {
            return Err(Error::Validation("capture is not connected".to_string()));
        }
        Ok(StreamDetails {
            source_url: Some(redact_url_credentials(&self.url)),
            ..StreamDetails::default()
        })
    }

    fn open_source(&mut self) -> Result<Box<dyn FrameSource>> {
        let mode = self
            .mode
            .ok_or_else(|| Error::Validation("capture is not connected".to_string()))?;
        Ok(Box::new(HttpSource {
            url: self.url.clone(),
            username: self.connection.username.clone(),
            password: self.connection.password.clone(),
            connect_timeout: self.connection.connect_timeout(),
            mode,
            client: None,
            reader: None,
            seq: 0,
        }))
    }

    async fn close(&mut self) {
        // Nothing to tear down on this side: the source owns its
        // connection and a blocked multipart read ends with the socket.
        self.mode = None;
        debug!(camera_id = %self.camera_id, "HTTP capture closed");
    }
}

/// Blocking source; connects lazily so the blocking client is born on the
/// capture thread.
struct HttpSource {
    url: String,
    username: String,
    password: String,
    connect_timeout: Duration,
    mode: HttpMode,
    client: Option<reqwest::blocking::Client>,
    reader: Option<MjpegFrameReader<reqwest::blocking::Response>>,
    seq: u64,
}

impl HttpSource {
    fn send_get(&mut self) -> Result<reqwest::blocking::Response> {
        if self.client.is_none() {
            let client = reqwest::blocking::Client::builder()
                .connect_timeout(self.connect_timeout)
                .timeout(None)
                .build()?;
            self.client = Some(client);
        }
        let Some(client) = self.client.as_ref() else {
            return Err(Error::Capture("HTTP client unavailable".to_string()));
        };
        let mut request = client.get(&self.url);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }
        let response = request
            .send()
            .map_err(|e| Error::Capture(format!("HTTP request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Capture(format!(
                "HTTP request failed with status {}",
                response.status()
            )));
        }
        Ok(response)
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    fn multipart_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.reader.is_none() {
            let response = self.send_get()?;
            self.reader = Some(MjpegFrameReader::new(response));
        }
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(None),
        };
        match reader.next_frame() {
            Ok(Some(data)) => {
                let seq = self.next_seq();
                Ok(Some(RawFrame::jpeg(data, seq)))
            }
            Ok(None) => {
                // Server closed the stream.
                self.reader = None;
                Ok(None)
            }
            Err(e) => {
                self.reader = None;
                Err(Error::Capture(format!("multipart read failed: {e}")))
            }
        }
    }

    fn snapshot_frame(&mut self) -> Result<Option<RawFrame>> {
        let response = self.send_get()?;
        let data = response
            .bytes()
            .map_err(|e| Error::Capture(format!("snapshot read failed: {e}")))?;
        if data.len() < 4 || data[0] != 0xFF || data[1] != 0xD8 {
            return Err(Error::Capture(
                "snapshot response is not a JPEG image".to_string(),
            ));
        }
        let seq = self.next_seq();
        Ok(Some(RawFrame::jpeg(data, seq)))
    }
}

impl FrameSource for HttpSource {
    fn capture_frame(&mut self) -> Result<Option<RawFrame>> {
        match self.mode {
            HttpMode::Multipart => self.multipart_frame(),
            HttpMode::Snapshot => self.snapshot_frame(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_selects_mode() {
        assert_eq!(
            mode_for_content_type("multipart/x-mixed-replace; boundary=frame"),
            Some(HttpMode::Multipart)
        );
        assert_eq!(
            mode_for_content_type("MULTIPART/X-MIXED-REPLACE;boundary=--b"),
            Some(HttpMode::Multipart)
        );
        assert_eq!(
            mode_for_content_type("image/jpeg"),
            Some(HttpMode::Snapshot)
        );
        assert_eq!(mode_for_content_type("text/html; charset=utf-8"), None);
        assert_eq!(mode_for_content_type(""), None);
    }

    #[test]
    fn url_uses_configured_path() {
        let connection = ConnectionConfig {
            ip: "192.168.1.30".to_string(),
            http_port: 8081,
            http_path: Some("mjpg/video.mjpg".to_string()),
            ..ConnectionConfig::default()
        };
        let capture = HttpMjpegCapture::new("cam-c", connection);
        assert_eq!(capture.url, "http://192.168.1.30:8081/mjpg/video.mjpg");
    }

    #[tokio::test]
    async fn validate_requires_probe() {
        let connection = ConnectionConfig {
            ip: "192.168.1.30".to_string(),
            ..ConnectionConfig::default()
        };
        let mut capture = HttpMjpegCapture::new("cam-c", connection);
        assert!(matches!(
            capture.validate().await,
            Err(Error::Validation(_))
        ));
        assert!(capture.open_source().is_err());
    }

    #[tokio::test]
    async fn connect_fails_for_unreachable_host() {
        // Reserved TEST-NET-1 address, nothing listens there.
        let connection = ConnectionConfig {
            ip: "192.0.2.1".to_string(),
            connect_timeout_secs: 1,
            read_timeout_secs: 1,
            ..ConnectionConfig::default()
        };
        let mut capture = HttpMjpegCapture::new("cam-c", connection);
        let err = capture.connect().await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }
}
