//! Relay publishing orchestration.
//!
//! The service owns one relay subprocess per camera, keyed by camera id.
//! A monitor task per relay reads its stderr for progress metrics and
//! diagnostics, and drives the reconnect cycle when the process dies.
//! A relay that exhausted its reconnect budget keeps its registry entry,
//! with status `Error` and the failure recorded, until it is stopped or
//! replaced by a new start.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camflux_core::{
    config::PublishConfig, directory::CameraDirectory, models::redact_url_credentials,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStderr;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::metrics::{PublishMetrics, QualityBand};
use crate::parser::{classify_failure, FailureKind, LineClass, ProgressParser, StderrRing};
use crate::process::{build_args, probe_program, spawn_relay, RelayProcess};
use crate::urls::{build_publish_path, build_source_url, build_target_url};

/// Cadence of the exit poll while stderr is quiet or already closed.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Budget for collecting the last stderr lines after an observed exit.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
/// How long a monitor task gets to settle after its relay was stopped.
const MONITOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of one relay publisher.
///
/// `Reconnecting` loops back to `Publishing` until the reconnect budget
/// runs out; `Stopped` and `Error` are terminal for a given publisher
/// instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishStatus {
    Idle,
    Starting,
    Publishing,
    Reconnecting,
    Stopped,
    Error,
}

impl PublishStatus {
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Publishing | Self::Reconnecting)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Encoding used to store the status in an atomic.
    #[must_use]
    pub fn as_usize(self) -> usize {
        match self {
            Self::Idle => 0,
            Self::Starting => 1,
            Self::Publishing => 2,
            Self::Reconnecting => 3,
            Self::Stopped => 4,
            Self::Error => 5,
        }
    }

    #[must_use]
    pub fn from_usize(value: usize) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Publishing,
            3 => Self::Reconnecting,
            4 => Self::Stopped,
            5 => Self::Error,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for PublishStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Publishing => "publishing",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Outcome of a `start_publishing` call.
#[derive(Debug, Clone, Serialize)]
pub struct PublishResult {
    pub success: bool,
    pub publish_path: Option<String>,
    pub error: Option<String>,
}

impl PublishResult {
    fn ok(publish_path: String) -> Self {
        Self {
            success: true,
            publish_path: Some(publish_path),
            error: None,
        }
    }

    fn rejected(publish_path: Option<String>, error: String) -> Self {
        Self {
            success: false,
            publish_path,
            error: Some(error),
        }
    }
}

/// Point-in-time snapshot of one publisher.
#[derive(Debug, Clone, Serialize)]
pub struct PublishState {
    pub camera_id: String,
    pub publish_path: String,
    pub status: PublishStatus,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub quality_score: f64,
    pub quality_band: QualityBand,
    pub uptime_secs: u64,
    pub metrics: PublishMetrics,
}

struct PublisherEntry {
    camera_id: String,
    publish_path: String,
    // Both carry credentials; they never leave this struct unredacted.
    source_url: String,
    target_url: String,
    status: AtomicUsize,
    error_count: AtomicU32,
    failure: Mutex<Option<(String, FailureKind)>>,
    metrics: Mutex<PublishMetrics>,
    ring: Mutex<StderrRing>,
    started_at: Mutex<Option<Instant>>,
    stop_flag: AtomicBool,
    cancel: CancellationToken,
    process: tokio::sync::Mutex<Option<RelayProcess>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl PublisherEntry {
    fn new(camera_id: &str, publish_path: &str, source_url: String, target_url: String) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            publish_path: publish_path.to_string(),
            source_url,
            target_url,
            status: AtomicUsize::new(PublishStatus::Idle.as_usize()),
            error_count: AtomicU32::new(0),
            failure: Mutex::new(None),
            metrics: Mutex::new(PublishMetrics::default()),
            ring: Mutex::new(StderrRing::new()),
            started_at: Mutex::new(None),
            stop_flag: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            process: tokio::sync::Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }

    fn status(&self) -> PublishStatus {
        PublishStatus::from_usize(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: PublishStatus) {
        self.status.store(status.as_usize(), Ordering::SeqCst);
    }

    fn set_failure(&self, message: String, kind: FailureKind) {
        *self.failure.lock() = Some((message, kind));
    }
}

pub struct RtspPublisherService {
    config: PublishConfig,
    directory: Arc<dyn CameraDirectory>,
    entries: DashMap<String, Arc<PublisherEntry>>,
    parser: Arc<ProgressParser>,
}

impl RtspPublisherService {
    pub fn new(config: PublishConfig, directory: Arc<dyn CameraDirectory>) -> Result<Self> {
        Ok(Self {
            config,
            directory,
            entries: DashMap::new(),
            parser: Arc::new(ProgressParser::new()?),
        })
    }

    /// Availability check of the relay binary. Failure is logged, not
    /// fatal: each publish attempt surfaces its own spawn error.
    pub async fn probe_relay_program(&self) {
        if !self.config.probe_on_start {
            return;
        }
        match probe_program(&self.config.program).await {
            Ok(version) => {
                info!(program = %self.config.program, version, "relay program available");
            }
            Err(e) => {
                warn!(program = %self.config.program, error = %e, "relay program probe failed");
            }
        }
    }

    /// Starts relaying `camera_id` to the configured media server. The
    /// camera's source URL comes from the directory: a previously
    /// discovered endpoint when one exists, otherwise one constructed
    /// from its connection settings.
    ///
    /// An active publisher for the camera rejects the call unless
    /// `force_restart` is set, in which case it is stopped and replaced.
    /// A publisher sitting in a terminal state is always replaced.
    pub async fn start_publishing(&self, camera_id: &str, force_restart: bool) -> PublishResult {
        // Snapshot and release before any await; stop_publishing removes
        // from the same shard.
        let existing = self
            .entries
            .get(camera_id)
            .map(|e| (e.publish_path.clone(), e.status()));
        if let Some((publish_path, status)) = existing {
            if status.is_terminal() {
                self.entries.remove(camera_id);
            } else if force_restart {
                self.stop_publishing(camera_id).await;
            } else {
                debug!(camera_id, %status, "publish start rejected, already active");
                return PublishResult::rejected(
                    Some(publish_path),
                    format!("camera {camera_id} is already publishing"),
                );
            }
        }

        let Some(connection) = self.directory.connection(camera_id).await else {
            return PublishResult::rejected(None, format!("unknown camera: {camera_id}"));
        };
        let endpoint = self.directory.discovered_endpoint(camera_id).await;

        let publish_path = build_publish_path(&self.config.path_template, camera_id);
        let target_url = build_target_url(
            &self.config.base_url,
            self.config.username.as_deref(),
            self.config.password.as_deref(),
            &publish_path,
        );
        let source_url = build_source_url(&connection, endpoint.as_deref());
        let entry = Arc::new(PublisherEntry::new(
            camera_id,
            &publish_path,
            source_url,
            target_url,
        ));
        entry.set_status(PublishStatus::Starting);

        let args = build_args(&self.config.args_template, &entry.source_url, &entry.target_url);
        let mut process = match spawn_relay(&self.config.program, &args) {
            Ok(process) => process,
            Err(e) => {
                // Keep the failed attempt observable.
                entry.error_count.fetch_add(1, Ordering::SeqCst);
                entry.set_failure(e.to_string(), FailureKind::ProcessCrash);
                entry.set_status(PublishStatus::Error);
                self.entries.insert(camera_id.to_string(), entry);
                error!(camera_id, error = %e, "relay spawn failed");
                return PublishResult::rejected(Some(publish_path), e.to_string());
            }
        };

        let pid = process.id().unwrap_or_default();
        let stderr = process.take_stderr();
        *entry.process.lock().await = Some(process);
        *entry.started_at.lock() = Some(Instant::now());
        entry.set_status(PublishStatus::Publishing);
        self.entries.insert(camera_id.to_string(), Arc::clone(&entry));

        let handle = tokio::spawn(monitor_loop(
            Arc::clone(&entry),
            stderr,
            Arc::clone(&self.parser),
            self.config.clone(),
        ));
        *entry.monitor.lock() = Some(handle);

        info!(
            camera_id,
            publish_path,
            pid,
            source = %redact_url_credentials(&entry.source_url),
            target = %redact_url_credentials(&entry.target_url),
            "publishing started"
        );
        PublishResult::ok(publish_path)
    }

    /// Stops and removes the camera's publisher. `false` when none was
    /// registered; stopping is otherwise idempotent.
    pub async fn stop_publishing(&self, camera_id: &str) -> bool {
        let Some((_, entry)) = self.entries.remove(camera_id) else {
            debug!(camera_id, "stop requested for unknown publisher");
            return false;
        };
        entry.stop_flag.store(true, Ordering::SeqCst);
        entry.cancel.cancel();

        let process = entry.process.lock().await.take();
        if let Some(process) = process {
            process.stop(self.config.stop_grace()).await;
        }
        let monitor = entry.monitor.lock().take();
        if let Some(monitor) = monitor {
            if tokio::time::timeout(MONITOR_SHUTDOWN_TIMEOUT, monitor)
                .await
                .is_err()
            {
                warn!(camera_id, "relay monitor did not settle in time");
            }
        }
        entry.set_status(PublishStatus::Stopped);
        info!(camera_id, "publishing stopped");
        true
    }

    /// Stops every publisher, concurrently.
    pub async fn stop_all_publishing(&self) {
        let camera_ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let stops = camera_ids.iter().map(|id| self.stop_publishing(id));
        futures::future::join_all(stops).await;
    }

    pub fn is_publishing(&self, camera_id: &str) -> bool {
        self.get_camera_status(camera_id) == PublishStatus::Publishing
    }

    /// Status for a camera; `Idle` when it has no publisher entry.
    pub fn get_camera_status(&self, camera_id: &str) -> PublishStatus {
        self.entries
            .get(camera_id)
            .map(|entry| entry.status())
            .unwrap_or(PublishStatus::Idle)
    }

    pub fn get_publishing_status(&self, camera_id: &str) -> Option<PublishState> {
        self.entries.get(camera_id).map(|entry| state_for(&entry))
    }

    /// Snapshot of every registered publisher, including ones sitting in
    /// a terminal state.
    pub fn get_all_publishing_status(&self) -> Vec<PublishState> {
        self.entries.iter().map(|entry| state_for(&entry)).collect()
    }

    /// Feeds an externally-observed viewer count into the camera's
    /// quality metrics. `false` when the camera has no publisher.
    pub fn set_viewers(&self, camera_id: &str, viewers: u32) -> bool {
        match self.entries.get(camera_id) {
            Some(entry) => {
                entry.metrics.lock().viewers = viewers;
                true
            }
            None => false,
        }
    }
}

fn state_for(entry: &PublisherEntry) -> PublishState {
    let metrics = entry.metrics.lock().clone();
    let failure = entry.failure.lock().clone();
    PublishState {
        camera_id: entry.camera_id.clone(),
        publish_path: entry.publish_path.clone(),
        status: entry.status(),
        error_count: entry.error_count.load(Ordering::SeqCst),
        last_error: failure.as_ref().map(|(message, _)| message.clone()),
        failure_kind: failure.map(|(_, kind)| kind),
        quality_score: metrics.quality_score(),
        quality_band: metrics.quality_band(),
        uptime_secs: entry
            .started_at
            .lock()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0),
        metrics,
    }
}

enum WatchOutcome {
    Exited(std::process::ExitStatus),
    /// The process slot was empty or unobservable; the stop path or a
    /// failed respawn already accounted for it.
    Missing,
}

/// Supervises one publisher for its whole lifetime: consumes stderr,
/// detects exits, and respawns until the reconnect budget is exhausted.
async fn monitor_loop(
    entry: Arc<PublisherEntry>,
    mut stderr: Option<ChildStderr>,
    parser: Arc<ProgressParser>,
    config: PublishConfig,
) {
    loop {
        let outcome = watch_process(&entry, stderr.take(), &parser).await;
        if entry.stop_flag.load(Ordering::SeqCst) {
            break;
        }

        let failures = entry.error_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let WatchOutcome::Exited(status) = outcome {
            let tail = entry.ring.lock().tail();
            let kind = classify_failure(&tail);
            let message = match entry.ring.lock().last() {
                Some(detail) => format!("relay exited ({status}): {detail}"),
                None => format!("relay exited ({status})"),
            };
            entry.set_failure(message, kind);
        }

        if failures > config.max_reconnects {
            entry.set_status(PublishStatus::Error);
            let failure = entry.failure.lock().clone();
            error!(
                camera_id = %entry.camera_id,
                failures,
                kind = failure.as_ref().map(|(_, k)| k.to_string()).unwrap_or_default(),
                error = failure.map(|(m, _)| m).unwrap_or_default(),
                "relay exhausted reconnect attempts"
            );
            break;
        }

        entry.set_status(PublishStatus::Reconnecting);
        warn!(
            camera_id = %entry.camera_id,
            attempt = failures,
            max_reconnects = config.max_reconnects,
            "relay exited, reconnecting"
        );
        tokio::select! {
            () = tokio::time::sleep(config.reconnect_delay()) => {}
            () = entry.cancel.cancelled() => break,
        }
        if entry.stop_flag.load(Ordering::SeqCst) {
            break;
        }

        let args = build_args(&config.args_template, &entry.source_url, &entry.target_url);
        match spawn_relay(&config.program, &args) {
            Ok(mut process) => {
                let pid = process.id().unwrap_or_default();
                let mut guard = entry.process.lock().await;
                if entry.stop_flag.load(Ordering::SeqCst) {
                    drop(guard);
                    process.stop(Duration::ZERO).await;
                    break;
                }
                stderr = process.take_stderr();
                *guard = Some(process);
                drop(guard);
                *entry.started_at.lock() = Some(Instant::now());
                entry.metrics.lock().reset_process_counters();
                entry.ring.lock().clear();
                entry.set_status(PublishStatus::Publishing);
                info!(camera_id = %entry.camera_id, attempt = failures, pid, "relay respawned");
            }
            Err(e) => {
                warn!(camera_id = %entry.camera_id, error = %e, "relay respawn failed");
                entry.set_failure(e.to_string(), FailureKind::ProcessCrash);
                stderr = None;
            }
        }
    }
}

/// Follows the current process until it exits or is taken away by the
/// stop path. Stderr is drained as it arrives; the exit poll keeps
/// running even when the pipe goes quiet or closes early.
async fn watch_process(
    entry: &PublisherEntry,
    stderr: Option<ChildStderr>,
    parser: &ProgressParser,
) -> WatchOutcome {
    let mut lines = stderr.map(|s| BufReader::new(s).lines());
    loop {
        if let Some(reader) = lines.as_mut() {
            match tokio::time::timeout(EXIT_POLL_INTERVAL, reader.next_line()).await {
                Ok(Ok(Some(line))) => {
                    consume_line(entry, parser, &line);
                    continue;
                }
                Ok(Ok(None)) | Ok(Err(_)) => lines = None,
                Err(_) => {}
            }
        } else {
            tokio::select! {
                () = tokio::time::sleep(EXIT_POLL_INTERVAL) => {}
                () = entry.cancel.cancelled() => {}
            }
        }

        let mut guard = entry.process.lock().await;
        if entry.stop_flag.load(Ordering::SeqCst) {
            // Whichever side holds the process at this point kills it.
            if let Some(process) = guard.take() {
                drop(guard);
                process.stop(Duration::ZERO).await;
            }
            return WatchOutcome::Missing;
        }
        match guard.as_mut() {
            Some(process) => match process.try_wait() {
                Ok(Some(status)) => {
                    *guard = None;
                    drop(guard);
                    if let Some(reader) = lines.as_mut() {
                        drain_stderr(entry, parser, reader).await;
                    }
                    return WatchOutcome::Exited(status);
                }
                Ok(None) => {}
                Err(_) => {
                    *guard = None;
                    return WatchOutcome::Missing;
                }
            },
            None => return WatchOutcome::Missing,
        }
    }
}

/// Collects whatever stderr the process left behind after exiting.
async fn drain_stderr(
    entry: &PublisherEntry,
    parser: &ProgressParser,
    reader: &mut tokio::io::Lines<BufReader<ChildStderr>>,
) {
    let deadline = tokio::time::Instant::now() + EXIT_DRAIN_TIMEOUT;
    loop {
        match tokio::time::timeout_at(deadline, reader.next_line()).await {
            Ok(Ok(Some(line))) => consume_line(entry, parser, &line),
            _ => break,
        }
    }
}

fn consume_line(entry: &PublisherEntry, parser: &ProgressParser, line: &str) {
    match parser.classify_line(line) {
        LineClass::Progress(update) => entry.metrics.lock().apply(&update),
        LineClass::Status => {}
        LineClass::Diagnostic => {
            let lowered = line.to_ascii_lowercase();
            if lowered.contains("error") || lowered.contains("warning") {
                warn!(camera_id = %entry.camera_id, line, "relay stderr");
            } else {
                debug!(camera_id = %entry.camera_id, line, "relay stderr");
            }
            entry.ring.lock().push(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camflux_core::directory::MemoryDirectory;
    use camflux_core::models::ConnectionConfig;

    fn config(program: &str, args: &[&str], max_reconnects: u32) -> PublishConfig {
        PublishConfig {
            base_url: "rtsp://127.0.0.1:8554".to_string(),
            path_template: "live/{camera_id}".to_string(),
            program: program.to_string(),
            args_template: args.iter().map(ToString::to_string).collect(),
            max_reconnects,
            reconnect_delay_secs: 0,
            stop_grace_secs: 0,
            probe_on_start: false,
            ..PublishConfig::default()
        }
    }

    fn service(program: &str, args: &[&str], max_reconnects: u32) -> RtspPublisherService {
        let directory = Arc::new(MemoryDirectory::new());
        for camera in ["cam-1", "cam-2"] {
            directory.insert_connection(
                camera,
                ConnectionConfig {
                    ip: "127.0.0.1".to_string(),
                    username: "admin".to_string(),
                    password: "pw".to_string(),
                    rtsp_path: Some("stream1".to_string()),
                    ..ConnectionConfig::default()
                },
            );
        }
        RtspPublisherService::new(config(program, args, max_reconnects), directory).unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_relay_exhausts_reconnects_and_lands_in_error() {
        let service = service("false", &[], 2);
        let result = service.start_publishing("cam-1", false).await;
        assert!(result.success);
        assert_eq!(result.publish_path.as_deref(), Some("live/cam-1"));

        let s = &service;
        wait_for("relay to give up", move || {
            s.get_camera_status("cam-1") == PublishStatus::Error
        })
        .await;

        // Initial failure plus two reconnect attempts.
        let state = service.get_publishing_status("cam-1").unwrap();
        assert_eq!(state.error_count, 3);
        assert!(state.last_error.is_some());
        assert_eq!(state.failure_kind, Some(FailureKind::ProcessCrash));

        // Terminal state is stable and stays observable.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let state = service.get_publishing_status("cam-1").unwrap();
        assert_eq!(state.status, PublishStatus::Error);
        assert_eq!(state.error_count, 3);
        assert!(!service.is_publishing("cam-1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_start_rejected_and_force_restart_replaces() {
        let service = service("sleep", &["5"], 3);
        let first = service.start_publishing("cam-1", false).await;
        assert!(first.success);
        assert!(service.is_publishing("cam-1"));

        let rejected = service.start_publishing("cam-1", false).await;
        assert!(!rejected.success);
        assert!(rejected.error.is_some());
        assert!(service.is_publishing("cam-1"));

        let forced = service.start_publishing("cam-1", true).await;
        assert!(forced.success);
        assert!(service.is_publishing("cam-1"));

        assert!(service.stop_publishing("cam-1").await);
        assert!(service.get_publishing_status("cam-1").is_none());
        assert_eq!(service.get_camera_status("cam-1"), PublishStatus::Idle);
    }

    #[tokio::test]
    async fn stop_without_publisher_returns_false() {
        let service = service("sleep", &["5"], 3);
        assert!(!service.stop_publishing("nobody-home").await);
    }

    #[tokio::test]
    async fn unknown_camera_is_rejected() {
        let service = service("sleep", &["5"], 3);
        let result = service.start_publishing("not-configured", false).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("unknown camera"));
        assert!(service.get_publishing_status("not-configured").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminal_error_entry_is_replaced_by_new_start() {
        let service = service("false", &[], 0);
        let result = service.start_publishing("cam-1", false).await;
        assert!(result.success);

        let s = &service;
        wait_for("relay to fail", move || {
            s.get_camera_status("cam-1") == PublishStatus::Error
        })
        .await;
        assert_eq!(
            service.get_publishing_status("cam-1").unwrap().error_count,
            1
        );

        // No force needed: terminal entries are replaceable.
        let replacement = service.start_publishing("cam-1", false).await;
        assert!(replacement.success);
        service.stop_all_publishing().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawn_failure_is_recorded_as_terminal_error() {
        let service = service("camflux-no-such-relay", &[], 1);
        let result = service.start_publishing("cam-1", false).await;
        assert!(!result.success);
        assert!(result.error.is_some());

        // The failed attempt is observable but not active.
        let state = service.get_publishing_status("cam-1").unwrap();
        assert_eq!(state.status, PublishStatus::Error);
        assert_eq!(state.error_count, 1);
        assert!(!service.is_publishing("cam-1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn viewer_count_feeds_quality_metrics() {
        let service = service("sleep", &["5"], 3);
        assert!(!service.set_viewers("cam-1", 4));
        service.start_publishing("cam-1", false).await;
        assert!(service.set_viewers("cam-1", 4));
        let state = service.get_publishing_status("cam-1").unwrap();
        assert_eq!(state.metrics.viewers, 4);
        service.stop_all_publishing().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_all_clears_the_registry() {
        let service = service("sleep", &["5"], 3);
        for camera in ["cam-1", "cam-2"] {
            let result = service.start_publishing(camera, false).await;
            assert!(result.success);
        }
        assert_eq!(service.get_all_publishing_status().len(), 2);
        service.stop_all_publishing().await;
        assert!(service.get_all_publishing_status().is_empty());
    }
}
