//! Multi-camera stream orchestration.
//!
//! The service owns one [`StreamManager`] per camera, keyed by camera id,
//! and fans every converted frame out to the callbacks registered for
//! that camera. Stream failures stay visible: a stream that died keeps
//! its registry entry, with status `Error` and the failure message, until
//! it is stopped or replaced by a new start.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camflux_core::{
    config::StreamConfig,
    frame::{EncodedFrame, FrameConverter, JpegConverter},
    models::{ConnectionConfig, Protocol, StreamModel, StreamStatus},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::factory::{default_factory, CaptureFactory};
use crate::manager::{StreamManager, StreamOptions};
use crate::perf::{PerformanceMonitor, SystemSnapshot};

/// How long a supervising task gets to settle after its stream stopped.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a subscriber can receive for a camera.
#[derive(Clone)]
pub enum StreamEvent {
    Frame(EncodedFrame),
    Error { message: String },
}

impl std::fmt::Debug for StreamEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frame(frame) => f.debug_tuple("Frame").field(&frame.seq).finish(),
            Self::Error { message } => f.debug_struct("Error").field("message", message).finish(),
        }
    }
}

pub type FrameCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;

type CallbackMap = DashMap<String, HashMap<Uuid, FrameCallback>>;

/// Per-call knobs for `start_stream`; anything left `None` falls back to
/// the service defaults.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub target_fps: Option<u32>,
    pub buffer_size: Option<usize>,
}

struct ActiveStream {
    manager: Arc<StreamManager>,
    protocol: Protocol,
    created_at: DateTime<Utc>,
    stopping: AtomicBool,
    initial_callback: Option<Uuid>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamMetrics {
    pub camera_id: String,
    pub stream_id: String,
    pub status: StreamStatus,
    pub fps: f64,
    pub frame_count: u64,
    pub dropped_frames: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub system: SystemSnapshot,
    pub active_streams: usize,
    pub total_frames: u64,
    pub total_dropped: u64,
    pub streams: Vec<StreamMetrics>,
}

pub struct VideoStreamService {
    streams: DashMap<String, Arc<ActiveStream>>,
    creation_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    callbacks: Arc<CallbackMap>,
    factory: Arc<dyn CaptureFactory>,
    converter: Arc<dyn FrameConverter>,
    defaults: StreamConfig,
    monitor: Arc<PerformanceMonitor>,
}

impl VideoStreamService {
    pub fn new(defaults: StreamConfig) -> Self {
        Self::with_parts(defaults, default_factory(), Arc::new(JpegConverter))
    }

    /// Full constructor with injectable capture factory and converter.
    pub fn with_parts(
        defaults: StreamConfig,
        factory: Arc<dyn CaptureFactory>,
        converter: Arc<dyn FrameConverter>,
    ) -> Self {
        Self {
            streams: DashMap::new(),
            creation_locks: DashMap::new(),
            callbacks: Arc::new(DashMap::new()),
            factory,
            converter,
            defaults,
            monitor: Arc::new(PerformanceMonitor::new()),
        }
    }

    pub fn monitor(&self) -> Arc<PerformanceMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Starts a stream for `camera_id` and registers the optional initial
    /// callback. Fails if a stream for this camera is anything but
    /// terminal; a stream that ended in `Stopped` or `Error` is replaced.
    ///
    /// The returned model is the state at launch; connection and
    /// validation continue under a supervising task, so callers observe
    /// progress through `get_stream_model`.
    pub async fn start_stream(
        &self,
        camera_id: &str,
        connection: &ConnectionConfig,
        protocol: Protocol,
        callback: Option<FrameCallback>,
        options: StartOptions,
    ) -> Result<StreamModel> {
        // One creation at a time per camera; concurrent starts for
        // different cameras proceed in parallel.
        let lock = self
            .creation_locks
            .entry(camera_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock_owned().await;

        if let Some(existing) = self.streams.get(camera_id) {
            if !existing.manager.status().is_terminal() {
                return Err(Error::StreamAlreadyActive(camera_id.to_string()));
            }
            debug!(
                camera_id,
                status = %existing.manager.status(),
                "replacing terminal stream entry"
            );
        }

        let mut stream_options = StreamOptions::from_config(&self.defaults);
        if let Some(fps) = options.target_fps {
            stream_options.target_fps = fps;
        }
        if let Some(buffer) = options.buffer_size {
            stream_options.buffer_size = buffer;
        }

        let capture = self.factory.create(
            protocol,
            camera_id,
            connection,
            stream_options.target_fps,
        )?;
        let manager = Arc::new(StreamManager::new(
            camera_id,
            capture,
            Arc::clone(&self.converter),
            stream_options,
        ));

        // Frames flow from the manager into the per-camera callback set.
        let sink_callbacks = Arc::clone(&self.callbacks);
        let sink_camera = camera_id.to_string();
        manager.set_frame_callback(Arc::new(move |frame: EncodedFrame| {
            dispatch(&sink_callbacks, &sink_camera, &StreamEvent::Frame(frame));
        }));

        let initial_callback = callback.map(|cb| self.add_frame_callback(camera_id, cb));

        let entry = Arc::new(ActiveStream {
            manager: Arc::clone(&manager),
            protocol,
            created_at: Utc::now(),
            stopping: AtomicBool::new(false),
            initial_callback,
            task: Mutex::new(None),
        });
        self.streams.insert(camera_id.to_string(), Arc::clone(&entry));

        let task_entry = Arc::clone(&entry);
        let task_callbacks = Arc::clone(&self.callbacks);
        let task_camera = camera_id.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = task_entry.manager.start_streaming().await {
                if task_entry.stopping.load(Ordering::SeqCst) {
                    debug!(camera_id = %task_camera, error = %e, "stream ended during stop");
                } else {
                    dispatch(
                        &task_callbacks,
                        &task_camera,
                        &StreamEvent::Error {
                            message: e.to_string(),
                        },
                    );
                }
            }
        });
        *entry.task.lock() = Some(handle);

        info!(
            camera_id,
            stream_id = %manager.stream_id(),
            %protocol,
            "stream launched"
        );
        Ok(self.model_for(camera_id, &entry))
    }

    /// Stops and removes the camera's stream. `false` when no stream was
    /// registered; stopping is otherwise idempotent.
    pub async fn stop_stream(&self, camera_id: &str) -> bool {
        let Some((_, entry)) = self.streams.remove(camera_id) else {
            debug!(camera_id, "stop requested for unknown stream");
            return false;
        };
        entry.stopping.store(true, Ordering::SeqCst);
        entry.manager.stop().await;

        let task = entry.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!(camera_id, "supervising task did not settle in time");
            }
        }
        if let Some(id) = entry.initial_callback {
            self.remove_frame_callback(camera_id, id);
        }
        self.creation_locks.remove(camera_id);
        info!(camera_id, "stream stopped and removed");
        true
    }

    /// Stops every stream, concurrently.
    pub async fn stop_all(&self) {
        let camera_ids: Vec<String> = self.streams.iter().map(|e| e.key().clone()).collect();
        let stops = camera_ids.iter().map(|id| self.stop_stream(id));
        futures::future::join_all(stops).await;
    }

    /// Registers a callback for a camera. Callbacks live independently of
    /// stream lifetimes: they can be added before the first start and they
    /// survive stream restarts.
    pub fn add_frame_callback(&self, camera_id: &str, callback: FrameCallback) -> Uuid {
        let id = Uuid::new_v4();
        self.callbacks
            .entry(camera_id.to_string())
            .or_default()
            .insert(id, callback);
        id
    }

    pub fn remove_frame_callback(&self, camera_id: &str, id: Uuid) -> bool {
        match self.callbacks.get_mut(camera_id) {
            Some(mut map) => map.remove(&id).is_some(),
            None => false,
        }
    }

    pub fn is_streaming(&self, camera_id: &str) -> bool {
        self.streams
            .get(camera_id)
            .map(|entry| entry.manager.status().is_active())
            .unwrap_or(false)
    }

    pub fn get_stream_model(&self, camera_id: &str) -> Option<StreamModel> {
        self.streams
            .get(camera_id)
            .map(|entry| self.model_for(camera_id, &entry))
    }

    /// Snapshot of every registered stream, including ones sitting in a
    /// terminal state.
    pub fn get_active_streams(&self) -> Vec<StreamModel> {
        self.streams
            .iter()
            .map(|entry| self.model_for(entry.key(), &entry))
            .collect()
    }

    pub fn get_stream_metrics(&self, camera_id: &str) -> Option<StreamMetrics> {
        self.streams
            .get(camera_id)
            .map(|entry| metrics_for(camera_id, &entry))
    }

    /// Host counters plus per-stream aggregates.
    pub fn get_performance_metrics(&self) -> PerformanceReport {
        let streams: Vec<StreamMetrics> = self
            .streams
            .iter()
            .map(|entry| metrics_for(entry.key(), &entry))
            .collect();
        PerformanceReport {
            system: self.monitor.latest(),
            active_streams: streams
                .iter()
                .filter(|m| m.status.is_active())
                .count(),
            total_frames: streams.iter().map(|m| m.frame_count).sum(),
            total_dropped: streams.iter().map(|m| m.dropped_frames).sum(),
            streams,
        }
    }

    fn model_for(&self, camera_id: &str, entry: &ActiveStream) -> StreamModel {
        let manager = &entry.manager;
        StreamModel {
            stream_id: manager.stream_id().to_string(),
            camera_id: camera_id.to_string(),
            protocol: entry.protocol,
            status: manager.status(),
            target_fps: manager.options().target_fps,
            buffer_size: manager.options().buffer_size,
            frame_count: manager.frame_count(),
            dropped_frames: manager.dropped_frames(),
            fps: manager.fps(),
            details: manager.details(),
            last_error: manager.last_error(),
            created_at: entry.created_at,
        }
    }
}

fn metrics_for(camera_id: &str, entry: &ActiveStream) -> StreamMetrics {
    let manager = &entry.manager;
    StreamMetrics {
        camera_id: camera_id.to_string(),
        stream_id: manager.stream_id().to_string(),
        status: manager.status(),
        fps: manager.fps(),
        frame_count: manager.frame_count(),
        dropped_frames: manager.dropped_frames(),
        uptime_secs: manager.uptime().map(|u| u.as_secs()).unwrap_or(0),
    }
}

/// Delivers an event to every callback registered for the camera. The
/// callback set is cloned out first so subscribers may add or remove
/// callbacks from within their handler without deadlocking.
fn dispatch(callbacks: &CallbackMap, camera_id: &str, event: &StreamEvent) {
    let subscribers: Vec<FrameCallback> = match callbacks.get(camera_id) {
        Some(map) => map.values().cloned().collect(),
        None => return,
    };
    for callback in subscribers {
        callback(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameSource, ProtocolCapture};
    use async_trait::async_trait;
    use bytes::Bytes;
    use camflux_core::frame::RawFrame;
    use camflux_core::models::StreamDetails;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    const FAKE_JPEG: &[u8] = &[0xFF, 0xD8, 0x42, 0xFF, 0xD9];

    struct TestSource {
        seq: u64,
    }

    impl FrameSource for TestSource {
        fn capture_frame(&mut self) -> crate::error::Result<Option<RawFrame>> {
            let seq = self.seq;
            self.seq += 1;
            Ok(Some(RawFrame::jpeg(Bytes::from_static(FAKE_JPEG), seq)))
        }
    }

    struct TestCapture {
        fail_connect: bool,
    }

    #[async_trait]
    impl ProtocolCapture for TestCapture {
        fn protocol(&self) -> Protocol {
            Protocol::Generic
        }

        async fn connect(&mut self) -> crate::error::Result<()> {
            if self.fail_connect {
                return Err(Error::Connection("test connect refused".to_string()));
            }
            Ok(())
        }

        async fn validate(&mut self) -> crate::error::Result<StreamDetails> {
            Ok(StreamDetails::default())
        }

        fn open_source(&mut self) -> crate::error::Result<Box<dyn FrameSource>> {
            Ok(Box::new(TestSource { seq: 0 }))
        }

        async fn close(&mut self) {}
    }

    /// Factory whose first `failing` creations yield captures that refuse
    /// to connect.
    struct TestFactory {
        failing: AtomicU32,
    }

    impl TestFactory {
        fn good() -> Arc<Self> {
            Arc::new(Self {
                failing: AtomicU32::new(0),
            })
        }

        fn failing_once() -> Arc<Self> {
            Arc::new(Self {
                failing: AtomicU32::new(1),
            })
        }
    }

    impl CaptureFactory for TestFactory {
        fn create(
            &self,
            _protocol: Protocol,
            _camera_id: &str,
            _connection: &ConnectionConfig,
            _target_fps: u32,
        ) -> crate::error::Result<Box<dyn ProtocolCapture>> {
            let fail = self
                .failing
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            Ok(Box::new(TestCapture { fail_connect: fail }))
        }
    }

    struct PassthroughConverter;

    impl FrameConverter for PassthroughConverter {
        fn encode(
            &self,
            frame: &RawFrame,
            _max_width: u32,
            _quality: u8,
        ) -> camflux_core::Result<EncodedFrame> {
            Ok(EncodedFrame {
                width: frame.width,
                height: frame.height,
                encoding: "jpeg",
                data: frame.data.clone(),
                seq: frame.seq,
                captured_at: frame.captured_at,
            })
        }
    }

    fn service(factory: Arc<dyn CaptureFactory>) -> VideoStreamService {
        let defaults = StreamConfig {
            target_fps: 100,
            buffer_size: 8,
            ..StreamConfig::default()
        };
        VideoStreamService::with_parts(defaults, factory, Arc::new(PassthroughConverter))
    }

    fn connection() -> ConnectionConfig {
        ConnectionConfig {
            ip: "127.0.0.1".to_string(),
            ..ConnectionConfig::default()
        }
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_stream_delivers_frames_and_stop_removes() {
        let service = service(TestFactory::good());
        let frames = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&frames);
        let model = service
            .start_stream(
                "cam-1",
                &connection(),
                Protocol::Generic,
                Some(Arc::new(move |event| {
                    if matches!(event, StreamEvent::Frame(_)) {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                })),
                StartOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(model.camera_id, "cam-1");
        assert_eq!(model.protocol, Protocol::Generic);

        let f = Arc::clone(&frames);
        wait_for("frames to arrive", move || f.load(Ordering::SeqCst) >= 3).await;
        assert!(service.is_streaming("cam-1"));
        let live = service.get_stream_model("cam-1").unwrap();
        assert_eq!(live.status, StreamStatus::Streaming);
        assert!(service.get_stream_metrics("cam-1").is_some());

        assert!(service.stop_stream("cam-1").await);
        assert!(service.get_stream_model("cam-1").is_none());
        assert!(!service.is_streaming("cam-1"));
    }

    #[tokio::test]
    async fn stop_without_stream_returns_false() {
        let service = service(TestFactory::good());
        assert!(!service.stop_stream("nobody-home").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_start_rejected_while_active() {
        let service = service(TestFactory::good());
        service
            .start_stream(
                "cam-1",
                &connection(),
                Protocol::Generic,
                None,
                StartOptions::default(),
            )
            .await
            .unwrap();
        let err = service
            .start_stream(
                "cam-1",
                &connection(),
                Protocol::Generic,
                None,
                StartOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StreamAlreadyActive(_)));
        service.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_stream_stays_observable_and_is_replaceable() {
        let service = service(TestFactory::failing_once());
        let errors = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&errors);
        service
            .start_stream(
                "cam-1",
                &connection(),
                Protocol::Generic,
                Some(Arc::new(move |event| {
                    if let StreamEvent::Error { message } = event {
                        sink.lock().push(message);
                    }
                })),
                StartOptions::default(),
            )
            .await
            .unwrap();

        let s = &service;
        wait_for("stream to fail", move || {
            s.get_stream_model("cam-1")
                .map(|m| m.status == StreamStatus::Error)
                .unwrap_or(false)
        })
        .await;

        let model = service.get_stream_model("cam-1").unwrap();
        assert!(model.last_error.is_some());
        let e = Arc::clone(&errors);
        wait_for("error event", move || !e.lock().is_empty()).await;
        assert!(errors.lock()[0].contains("connect refused"));

        // Terminal entry may be replaced by a fresh start.
        service
            .start_stream(
                "cam-1",
                &connection(),
                Protocol::Generic,
                None,
                StartOptions::default(),
            )
            .await
            .unwrap();
        let s = &service;
        wait_for("replacement to go live", move || s.is_streaming("cam-1")).await;
        service.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn callbacks_can_be_added_and_removed() {
        let service = service(TestFactory::good());
        service
            .start_stream(
                "cam-1",
                &connection(),
                Protocol::Generic,
                None,
                StartOptions::default(),
            )
            .await
            .unwrap();

        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let id = service.add_frame_callback(
            "cam-1",
            Arc::new(move |_event| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let c = Arc::clone(&seen);
        wait_for("second subscriber to see frames", move || {
            c.load(Ordering::SeqCst) > 0
        })
        .await;

        assert!(service.remove_frame_callback("cam-1", id));
        assert!(!service.remove_frame_callback("cam-1", id));
        assert!(!service.remove_frame_callback("cam-other", Uuid::new_v4()));
        service.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_all_clears_the_registry() {
        let service = service(TestFactory::good());
        for camera in ["cam-1", "cam-2", "cam-3"] {
            service
                .start_stream(
                    camera,
                    &connection(),
                    Protocol::Generic,
                    None,
                    StartOptions::default(),
                )
                .await
                .unwrap();
        }
        assert_eq!(service.get_active_streams().len(), 3);
        service.stop_all().await;
        assert!(service.get_active_streams().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn performance_report_aggregates_streams() {
        let service = service(TestFactory::good());
        service
            .start_stream(
                "cam-1",
                &connection(),
                Protocol::Generic,
                None,
                StartOptions::default(),
            )
            .await
            .unwrap();
        let s = &service;
        wait_for("stream to go live", move || s.is_streaming("cam-1")).await;

        let report = service.get_performance_metrics();
        assert_eq!(report.active_streams, 1);
        assert_eq!(report.streams.len(), 1);
        assert!(report.system.total_memory_mb > 0);

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"active_streams\":1"));
        assert!(json.contains("\"status\":\"streaming\""));
        service.stop_all().await;
    }
}
