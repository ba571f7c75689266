use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::config::Config;
use crate::models::ConnectionConfig;

/// Lookup capability for camera connection data and previously discovered
/// endpoints. Implemented by whatever stores camera configuration; the
/// streaming core only reads through it.
#[async_trait]
pub trait CameraDirectory: Send + Sync {
    /// Connection settings for a camera, if the camera is known.
    async fn connection(&self, camera_id: &str) -> Option<ConnectionConfig>;

    /// A source URL discovered earlier (e.g. via ONVIF), used in preference
    /// to constructing one from connection settings.
    async fn discovered_endpoint(&self, camera_id: &str) -> Option<String>;
}

/// Directory backed by the daemon's configuration file.
pub struct ConfigDirectory {
    entries: HashMap<String, (ConnectionConfig, Option<String>)>,
}

impl ConfigDirectory {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let entries = config
            .cameras
            .iter()
            .map(|c| (c.id.clone(), (c.connection.clone(), c.endpoint.clone())))
            .collect();
        Self { entries }
    }
}

#[async_trait]
impl CameraDirectory for ConfigDirectory {
    async fn connection(&self, camera_id: &str) -> Option<ConnectionConfig> {
        self.entries.get(camera_id).map(|(conn, _)| conn.clone())
    }

    async fn discovered_endpoint(&self, camera_id: &str) -> Option<String> {
        self.entries
            .get(camera_id)
            .and_then(|(_, endpoint)| endpoint.clone())
    }
}

/// In-memory directory, useful for embedding and for tests.
#[derive(Default)]
pub struct MemoryDirectory {
    connections: RwLock<HashMap<String, ConnectionConfig>>,
    endpoints: RwLock<HashMap<String, String>>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_connection(&self, camera_id: &str, connection: ConnectionConfig) {
        self.connections
            .write()
            .insert(camera_id.to_string(), connection);
    }

    pub fn insert_endpoint(&self, camera_id: &str, endpoint: &str) {
        self.endpoints
            .write()
            .insert(camera_id.to_string(), endpoint.to_string());
    }
}

#[async_trait]
impl CameraDirectory for MemoryDirectory {
    async fn connection(&self, camera_id: &str) -> Option<ConnectionConfig> {
        self.connections.read().get(camera_id).cloned()
    }

    async fn discovered_endpoint(&self, camera_id: &str) -> Option<String> {
        self.endpoints.read().get(camera_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraEntry;
    use crate::models::Protocol;

    #[tokio::test]
    async fn test_memory_directory_lookup() {
        let directory = MemoryDirectory::new();
        assert!(directory.connection("cam_1").await.is_none());

        directory.insert_connection(
            "cam_1",
            ConnectionConfig {
                ip: "10.1.2.3".to_string(),
                ..ConnectionConfig::default()
            },
        );
        directory.insert_endpoint("cam_1", "rtsp://10.1.2.3:554/live");

        let connection = directory.connection("cam_1").await.unwrap();
        assert_eq!(connection.ip, "10.1.2.3");
        assert_eq!(
            directory.discovered_endpoint("cam_1").await.as_deref(),
            Some("rtsp://10.1.2.3:554/live")
        );
        assert!(directory.discovered_endpoint("cam_2").await.is_none());
    }

    #[tokio::test]
    async fn test_config_directory_lookup() {
        let mut config = Config::default();
        config.cameras.push(CameraEntry {
            id: "gate".to_string(),
            protocol: Protocol::Rtsp,
            connection: ConnectionConfig {
                ip: "192.168.0.9".to_string(),
                ..ConnectionConfig::default()
            },
            endpoint: Some("rtsp://192.168.0.9/ch0".to_string()),
            autostart: false,
            publish: false,
        });

        let directory = ConfigDirectory::new(&config);
        assert_eq!(directory.connection("gate").await.unwrap().ip, "192.168.0.9");
        assert_eq!(
            directory.discovered_endpoint("gate").await.as_deref(),
            Some("rtsp://192.168.0.9/ch0")
        );
        assert!(directory.connection("unknown").await.is_none());
    }
}
