//! Capture construction, keyed by protocol.

use std::sync::Arc;

use camflux_core::models::{ConnectionConfig, Protocol};

use crate::capture::ProtocolCapture;
use crate::error::{Error, Result};
use crate::http_mjpeg::HttpMjpegCapture;
use crate::onvif::OnvifCapture;
use crate::rtsp::RtspCapture;

/// Builds the capture implementation for a protocol. `Generic` is treated
/// as plain RTSP, which is what unbranded cameras almost always speak.
pub fn create_capture(
    protocol: Protocol,
    camera_id: &str,
    connection: &ConnectionConfig,
    target_fps: u32,
) -> Box<dyn ProtocolCapture> {
    match protocol {
        Protocol::Rtsp | Protocol::Generic => {
            Box::new(RtspCapture::new(camera_id, connection, target_fps))
        }
        Protocol::Onvif => Box::new(OnvifCapture::new(
            camera_id,
            connection.clone(),
            target_fps,
        )),
        Protocol::Http => Box::new(HttpMjpegCapture::new(camera_id, connection.clone())),
    }
}

/// Like [`create_capture`] but from an untrusted protocol name, e.g. one
/// taken from an API request or a config file written by hand.
pub fn create_capture_by_name(
    protocol: &str,
    camera_id: &str,
    connection: &ConnectionConfig,
    target_fps: u32,
) -> Result<Box<dyn ProtocolCapture>> {
    let parsed = Protocol::parse(protocol)
        .ok_or_else(|| Error::UnsupportedProtocol(protocol.to_string()))?;
    Ok(create_capture(parsed, camera_id, connection, target_fps))
}

/// Seam between the stream service and the concrete captures. The default
/// implementation defers to [`create_capture`]; tests substitute fakes.
pub trait CaptureFactory: Send + Sync {
    fn create(
        &self,
        protocol: Protocol,
        camera_id: &str,
        connection: &ConnectionConfig,
        target_fps: u32,
    ) -> Result<Box<dyn ProtocolCapture>>;
}

pub struct DefaultCaptureFactory;

impl CaptureFactory for DefaultCaptureFactory {
    fn create(
        &self,
        protocol: Protocol,
        camera_id: &str,
        connection: &ConnectionConfig,
        target_fps: u32,
    ) -> Result<Box<dyn ProtocolCapture>> {
        Ok(create_capture(protocol, camera_id, connection, target_fps))
    }
}

pub fn default_factory() -> Arc<dyn CaptureFactory> {
    Arc::new(DefaultCaptureFactory)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> ConnectionConfig {
        ConnectionConfig {
            ip: "192.168.1.10".to_string(),
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn known_protocols_build_their_capture() {
        let cases = [
            (Protocol::Rtsp, Protocol::Rtsp),
            (Protocol::Generic, Protocol::Rtsp),
            (Protocol::Onvif, Protocol::Onvif),
            (Protocol::Http, Protocol::Http),
        ];
        for (requested, reported) in cases {
            let capture = create_capture(requested, "cam-1", &connection(), 10);
            assert_eq!(capture.protocol(), reported);
        }
    }

    #[test]
    fn unknown_protocol_name_is_rejected() {
        let err = create_capture_by_name("webrtc", "cam-1", &connection(), 10).unwrap_err();
        assert!(matches!(err, Error::UnsupportedProtocol(_)));
        assert!(err.to_string().contains("webrtc"));
    }

    #[test]
    fn protocol_name_parsing_is_forgiving() {
        let capture = create_capture_by_name("MJPEG", "cam-1", &connection(), 10).unwrap();
        assert_eq!(capture.protocol(), Protocol::Http);
    }
}
