//! Daemon wiring: builds the stream and relay services from the loaded
//! configuration, brings up the configured cameras, and runs until a
//! shutdown signal arrives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camflux_core::config::{CameraEntry, Config};
use camflux_core::directory::{CameraDirectory, ConfigDirectory};
use camflux_relay::RtspPublisherService;
use camflux_stream::{StartOptions, VideoStreamService};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct CamfluxDaemon {
    config: Config,
    directory: Arc<dyn CameraDirectory>,
    streams: Arc<VideoStreamService>,
    publisher: Arc<RtspPublisherService>,
}

impl CamfluxDaemon {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let directory: Arc<dyn CameraDirectory> = Arc::new(ConfigDirectory::new(&config));
        let streams = Arc::new(VideoStreamService::new(config.stream.clone()));
        let publisher = Arc::new(
            RtspPublisherService::new(config.publish.clone(), Arc::clone(&directory))
                .context("building relay publisher")?,
        );
        Ok(Self {
            config,
            directory,
            streams,
            publisher,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let mut background: Vec<JoinHandle<()>> = Vec::new();

        if self.config.monitor.enabled {
            let interval = Duration::from_secs(self.config.monitor.sample_interval_secs);
            background.push(
                self.streams
                    .monitor()
                    .spawn_sampler(interval, cancel.clone()),
            );
            background.push(spawn_status_reporter(
                Arc::clone(&self.streams),
                Arc::clone(&self.publisher),
                interval,
                cancel.clone(),
            ));
        }

        self.publisher.probe_relay_program().await;

        for camera in &self.config.cameras {
            self.start_camera(camera).await;
        }
        info!("camflux up");

        shutdown_signal().await;
        info!("shutting down");
        cancel.cancel();
        for task in background {
            let _ = task.await;
        }
        tokio::join!(
            self.streams.stop_all(),
            self.publisher.stop_all_publishing()
        );
        info!("camflux stopped");
        Ok(())
    }

    /// Brings up one configured camera. Failures are logged per camera so
    /// a bad entry cannot keep the rest of the fleet down.
    async fn start_camera(&self, camera: &CameraEntry) {
        if !camera.autostart && !camera.publish {
            return;
        }

        if camera.autostart {
            let Some(connection) = self.directory.connection(&camera.id).await else {
                warn!(camera_id = %camera.id, "camera missing from directory");
                return;
            };
            let started = self
                .streams
                .start_stream(
                    &camera.id,
                    &connection,
                    camera.protocol,
                    None,
                    StartOptions::default(),
                )
                .await;
            match started {
                Ok(model) => {
                    info!(camera_id = %camera.id, stream_id = %model.stream_id, "stream started");
                }
                Err(e) => error!(camera_id = %camera.id, error = %e, "stream start failed"),
            }
        }

        if camera.publish {
            let result = self.publisher.start_publishing(&camera.id, false).await;
            if result.success {
                info!(
                    camera_id = %camera.id,
                    publish_path = result.publish_path.as_deref().unwrap_or_default(),
                    "publishing started"
                );
            } else {
                error!(
                    camera_id = %camera.id,
                    error = result.error.as_deref().unwrap_or_default(),
                    "publishing failed"
                );
            }
        }
    }
}

fn spawn_status_reporter(
    streams: Arc<VideoStreamService>,
    publisher: Arc<RtspPublisherService>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; skip the startup tick
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = streams.get_performance_metrics();
                    let publishing = publisher
                        .get_all_publishing_status()
                        .iter()
                        .filter(|s| s.status.is_active())
                        .count();
                    info!(
                        active_streams = report.active_streams,
                        total_frames = report.total_frames,
                        total_dropped = report.total_dropped,
                        cpu_percent = f64::from(report.system.cpu_percent),
                        memory_percent = f64::from(report.system.memory_percent),
                        publishing,
                        "status"
                    );
                }
                () = cancel.cancelled() => break,
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install ctrl+c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "failed to install terminate handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
