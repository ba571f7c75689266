//! Per-stream lifecycle management.
//!
//! Each stream runs as a pair: a dedicated OS thread executes the blocking
//! capture loop against the camera, and an async processing loop converts
//! frames and hands them to the registered sink. The two sides meet only
//! at a bounded channel; when the consumer cannot keep up, the newest
//! frame is dropped on the producer side and counted, so delivered frames
//! always stay in capture order.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camflux_core::{
    config::StreamConfig,
    frame::{EncodedFrame, FrameConverter, RawFrame},
    models::{new_stream_id, StreamDetails, StreamStatus},
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::{FrameSource, ProtocolCapture};
use crate::error::{Error, Result};

/// Backpressure drops are logged once per this many dropped frames.
const DROP_LOG_INTERVAL: u64 = 100;

/// Transient capture failures tolerated back to back before the stream is
/// declared dead.
const MAX_CONSECUTIVE_FAILURES: u32 = 30;

/// Receives every successfully converted frame, in order.
pub type FrameSink = Arc<dyn Fn(EncodedFrame) + Send + Sync>;

/// Tunables for one stream, seeded from [`StreamConfig`] with per-call
/// overrides applied by the service layer.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub target_fps: u32,
    pub buffer_size: usize,
    pub max_width: u32,
    pub jpeg_quality: u8,
    pub join_timeout: Duration,
}

impl StreamOptions {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            target_fps: config.target_fps,
            buffer_size: config.buffer_size,
            max_width: config.max_width,
            jpeg_quality: config.jpeg_quality,
            join_timeout: config.join_timeout(),
        }
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

/// State shared between the async side and the capture thread. Counters
/// are plain atomics so status queries never contend with the hot path.
struct StreamShared {
    status: AtomicUsize,
    frame_count: AtomicU64,
    dropped_frames: AtomicU64,
    stop: AtomicBool,
    capture_failed: AtomicBool,
    cancel: CancellationToken,
    started_at: Mutex<Option<Instant>>,
    details: RwLock<StreamDetails>,
    last_error: Mutex<Option<String>>,
}

impl StreamShared {
    fn new() -> Self {
        Self {
            status: AtomicUsize::new(StreamStatus::Idle.as_usize()),
            frame_count: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            capture_failed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            started_at: Mutex::new(None),
            details: RwLock::new(StreamDetails::default()),
            last_error: Mutex::new(None),
        }
    }

    fn status(&self) -> StreamStatus {
        StreamStatus::from_usize(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: StreamStatus) {
        self.status.store(status.as_usize(), Ordering::SeqCst);
    }

    fn record_failure(&self, message: impl Into<String>) {
        *self.last_error.lock() = Some(message.into());
        self.capture_failed.store(true, Ordering::SeqCst);
    }
}

pub struct StreamManager {
    camera_id: String,
    stream_id: String,
    options: StreamOptions,
    shared: Arc<StreamShared>,
    capture: tokio::sync::Mutex<Box<dyn ProtocolCapture>>,
    converter: Arc<dyn FrameConverter>,
    sink: RwLock<Option<FrameSink>>,
    capture_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl StreamManager {
    pub fn new(
        camera_id: impl Into<String>,
        capture: Box<dyn ProtocolCapture>,
        converter: Arc<dyn FrameConverter>,
        options: StreamOptions,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            stream_id: new_stream_id(),
            options,
            shared: Arc::new(StreamShared::new()),
            capture: tokio::sync::Mutex::new(capture),
            converter,
            sink: RwLock::new(None),
            capture_thread: Mutex::new(None),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    pub fn status(&self) -> StreamStatus {
        self.shared.status()
    }

    pub fn frame_count(&self) -> u64 {
        self.shared.frame_count.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn details(&self) -> StreamDetails {
        self.shared.details.read().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.shared.started_at.lock().map(|t| t.elapsed())
    }

    /// Average captured frames per second since the stream went live.
    pub fn fps(&self) -> f64 {
        match self.uptime() {
            Some(uptime) if uptime.as_secs_f64() > 0.1 => {
                self.frame_count() as f64 / uptime.as_secs_f64()
            }
            _ => 0.0,
        }
    }

    /// Replaces the frame sink. May be called before or during streaming.
    pub fn set_frame_callback(&self, sink: FrameSink) {
        *self.sink.write() = Some(sink);
    }

    /// Runs the stream to completion: connect, validate, capture and
    /// process until stopped or the source dies. On failure the status is
    /// `Error` with `last_error` populated; cleanup has already happened
    /// by the time this returns.
    pub async fn start_streaming(&self) -> Result<()> {
        let from_idle = self.shared.status.compare_exchange(
            StreamStatus::Idle.as_usize(),
            StreamStatus::Connecting.as_usize(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if from_idle.is_err() {
            return Err(Error::StreamAlreadyActive(self.camera_id.clone()));
        }

        match self.run().await {
            Ok(()) => {
                self.stop_internal(false).await;
                Ok(())
            }
            Err(e) => {
                *self.shared.last_error.lock() = Some(e.to_string());
                self.stop_internal(true).await;
                self.shared.set_status(StreamStatus::Error);
                error!(
                    camera_id = %self.camera_id,
                    stream_id = %self.stream_id,
                    error = %e,
                    "stream failed"
                );
                Err(e)
            }
        }
    }

    async fn run(&self) -> Result<()> {
        info!(
            camera_id = %self.camera_id,
            stream_id = %self.stream_id,
            "connecting stream"
        );
        let source = {
            let mut capture = self.capture.lock().await;
            capture.connect().await?;
            let details = capture.validate().await?;
            self.shared.details.write().merge(details);
            capture.open_source()?
        };

        if self.shared.stop.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel::<RawFrame>(self.options.buffer_size.max(1));
        let shared = Arc::clone(&self.shared);
        let camera_id = self.camera_id.clone();
        let target_fps = self.options.target_fps;
        let handle = std::thread::Builder::new()
            .name(format!("capture-{}", self.camera_id))
            .spawn(move || capture_loop(source, tx, shared, target_fps, camera_id))
            .map_err(|e| Error::Capture(format!("failed to spawn capture thread: {e}")))?;
        *self.capture_thread.lock() = Some(handle);

        *self.shared.started_at.lock() = Some(Instant::now());
        self.shared.set_status(StreamStatus::Streaming);
        info!(
            camera_id = %self.camera_id,
            stream_id = %self.stream_id,
            details = ?self.details(),
            "stream is live"
        );

        self.processing_loop(rx).await;

        if self.shared.capture_failed.load(Ordering::SeqCst)
            && !self.shared.stop.load(Ordering::SeqCst)
        {
            let message = self
                .last_error()
                .unwrap_or_else(|| "capture ended unexpectedly".to_string());
            return Err(Error::Capture(message));
        }
        Ok(())
    }

    /// Converts and delivers frames until cancelled or the producer ends.
    async fn processing_loop(&self, mut rx: mpsc::Receiver<RawFrame>) {
        let cancel = self.shared.cancel.clone();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = rx.recv() => {
                    let Some(raw) = received else { break };
                    match self
                        .converter
                        .encode(&raw, self.options.max_width, self.options.jpeg_quality)
                    {
                        Ok(encoded) => {
                            let sink = self.sink.read().clone();
                            if let Some(sink) = sink {
                                sink(encoded);
                            }
                        }
                        Err(e) => {
                            warn!(
                                camera_id = %self.camera_id,
                                seq = raw.seq,
                                error = %e,
                                "frame conversion failed, skipping"
                            );
                        }
                    }
                }
            }
        }
        // Anything still queued is stale once the loop stops.
        rx.close();
        while rx.try_recv().is_ok() {}
    }

    /// Stops the stream and releases everything it held. Safe to call from
    /// any state and from multiple callers; only the first one acts.
    pub async fn stop(&self) {
        self.stop_internal(false).await;
    }

    async fn stop_internal(&self, had_error: bool) {
        if self.shared.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if !had_error {
            self.shared.set_status(StreamStatus::Stopping);
        }
        self.shared.cancel.cancel();

        // Closing the capture first kills any decoder process, which
        // unblocks a capture thread stuck in a pipe read.
        {
            let mut capture = self.capture.lock().await;
            capture.close().await;
        }

        let handle = self.capture_thread.lock().take();
        if let Some(handle) = handle {
            let join = tokio::task::spawn_blocking(move || {
                if handle.join().is_err() {
                    warn!("capture thread panicked");
                }
            });
            if tokio::time::timeout(self.options.join_timeout, join)
                .await
                .is_err()
            {
                warn!(
                    camera_id = %self.camera_id,
                    "capture thread did not exit within {:?}, detaching",
                    self.options.join_timeout
                );
            }
        }

        if !had_error {
            self.shared.set_status(StreamStatus::Stopped);
        }
        info!(
            camera_id = %self.camera_id,
            stream_id = %self.stream_id,
            frames = self.frame_count(),
            dropped = self.dropped_frames(),
            "stream stopped"
        );
    }
}

/// Blocking capture loop, the body of the per-stream OS thread.
///
/// Paces reads to the target rate and forwards frames over the bounded
/// channel. A full channel drops the frame just captured, keeping
/// everything already queued in order.
fn capture_loop(
    mut source: Box<dyn FrameSource>,
    tx: mpsc::Sender<RawFrame>,
    shared: Arc<StreamShared>,
    target_fps: u32,
    camera_id: String,
) {
    let interval = Duration::from_secs_f64(1.0 / f64::from(target_fps.max(1)));
    let mut next_tick = Instant::now() + interval;
    let mut consecutive_failures: u32 = 0;

    while !shared.stop.load(Ordering::SeqCst) {
        match source.capture_frame() {
            Ok(Some(frame)) => {
                consecutive_failures = 0;
                shared.frame_count.fetch_add(1, Ordering::Relaxed);
                match tx.try_send(frame) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let dropped = shared.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
                        if dropped % DROP_LOG_INTERVAL == 1 {
                            warn!(
                                camera_id = %camera_id,
                                total_dropped = dropped,
                                "frame dropped due to backpressure"
                            );
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            Ok(None) => {
                if !shared.stop.load(Ordering::SeqCst) {
                    shared.record_failure("capture source ended unexpectedly");
                }
                break;
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    camera_id = %camera_id,
                    consecutive = consecutive_failures,
                    error = %e,
                    "frame capture failed"
                );
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    shared.record_failure(format!(
                        "capture failed {consecutive_failures} times in a row: {e}"
                    ));
                    break;
                }
            }
        }

        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
            next_tick += interval;
        } else {
            next_tick = now + interval;
        }
    }
    debug!(camera_id = %camera_id, "capture loop finished");
}
