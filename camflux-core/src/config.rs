use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::models::{ConnectionConfig, Protocol};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub stream: StreamConfig,
    pub publish: PublishConfig,
    pub monitor: MonitorConfig,
    pub cameras: Vec<CameraEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Defaults applied to every stream unless the caller overrides them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub target_fps: u32,
    pub buffer_size: usize,
    /// Frames wider than this are downscaled before encoding.
    pub max_width: u32,
    pub jpeg_quality: u8,
    /// Bound on waiting for a capture thread to exit during stop.
    pub join_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            target_fps: 10,
            buffer_size: 30,
            max_width: 1280,
            jpeg_quality: 80,
            join_timeout_secs: 5,
        }
    }
}

impl StreamConfig {
    #[must_use]
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

/// Relay/publish settings for one target media server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Base URL of the remote media server, e.g. "rtsp://relay.example:8554".
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Path template; "{camera_id}" is replaced by the sanitized camera id.
    pub path_template: String,
    pub max_reconnects: u32,
    pub reconnect_delay_secs: u64,
    /// Relay program and its argument template. "{source}" and "{target}"
    /// are substituted at spawn time.
    pub program: String,
    pub args_template: Vec<String>,
    /// Bound on graceful shutdown before the process is killed.
    pub stop_grace_secs: u64,
    /// Run "<program> -version" at startup and log the outcome.
    pub probe_on_start: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            base_url: "rtsp://127.0.0.1:8554".to_string(),
            username: None,
            password: None,
            path_template: "live/{camera_id}".to_string(),
            max_reconnects: 3,
            reconnect_delay_secs: 5,
            program: "ffmpeg".to_string(),
            args_template: default_relay_args(),
            stop_grace_secs: 3,
            probe_on_start: true,
        }
    }
}

impl PublishConfig {
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

fn default_relay_args() -> Vec<String> {
    // "-nostats" suppresses the carriage-return status line; "-progress pipe:2"
    // emits newline-terminated key=value progress records on stderr instead.
    [
        "-hide_banner",
        "-loglevel",
        "info",
        "-nostats",
        "-progress",
        "pipe:2",
        "-rtsp_transport",
        "tcp",
        "-i",
        "{source}",
        "-c",
        "copy",
        "-f",
        "rtsp",
        "{target}",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub sample_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_secs: 30,
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }
}

/// One camera known to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraEntry {
    pub id: String,
    #[serde(default = "default_camera_protocol")]
    pub protocol: Protocol,
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Previously discovered source URL, used verbatim when present.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Start ingesting on daemon startup.
    #[serde(default)]
    pub autostart: bool,
    /// Start relaying to the publish target on daemon startup.
    #[serde(default)]
    pub publish: bool,
}

fn default_camera_protocol() -> Protocol {
    Protocol::Generic
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (CAMFLUX_LOGGING_LEVEL, etc.)
        builder = builder.add_source(
            Environment::with_prefix("CAMFLUX")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Reject configurations that cannot work before any service starts.
    pub fn validate(&self) -> crate::Result<()> {
        if self.stream.target_fps == 0 {
            return Err(crate::Error::InvalidInput(
                "stream.target_fps must be at least 1".to_string(),
            ));
        }
        if self.stream.buffer_size == 0 {
            return Err(crate::Error::InvalidInput(
                "stream.buffer_size must be at least 1".to_string(),
            ));
        }
        if self.stream.jpeg_quality == 0 || self.stream.jpeg_quality > 100 {
            return Err(crate::Error::InvalidInput(
                "stream.jpeg_quality must be within 1..=100".to_string(),
            ));
        }
        if !self.publish.base_url.contains("://") {
            return Err(crate::Error::InvalidInput(format!(
                "publish.base_url is not a URL: {}",
                self.publish.base_url
            )));
        }
        if self.publish.program.is_empty() {
            return Err(crate::Error::InvalidInput(
                "publish.program must not be empty".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for camera in &self.cameras {
            if camera.id.is_empty() {
                return Err(crate::Error::InvalidInput(
                    "camera id must not be empty".to_string(),
                ));
            }
            if !seen.insert(camera.id.as_str()) {
                return Err(crate::Error::InvalidInput(format!(
                    "duplicate camera id: {}",
                    camera.id
                )));
            }
            if camera.connection.ip.is_empty() && camera.endpoint.is_none() {
                return Err(crate::Error::InvalidInput(format!(
                    "camera {} has neither an ip nor a discovered endpoint",
                    camera.id
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn camera(&self, camera_id: &str) -> Option<&CameraEntry> {
        self.cameras.iter().find(|c| c.id == camera_id)
    }
}
