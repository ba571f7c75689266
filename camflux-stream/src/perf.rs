//! Host-level performance sampling for the observability surface.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub sampled_at: DateTime<Utc>,
}

pub struct PerformanceMonitor {
    system: Mutex<System>,
    latest: RwLock<SystemSnapshot>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        let snapshot = snapshot_from(&system);
        Self {
            system: Mutex::new(system),
            latest: RwLock::new(snapshot),
        }
    }

    /// Refreshes the counters and stores the result. CPU usage is derived
    /// from the delta between two refreshes, so the very first sample
    /// after startup reads as zero.
    pub fn sample(&self) -> SystemSnapshot {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();
        let snapshot = snapshot_from(&system);
        drop(system);
        *self.latest.write() = snapshot.clone();
        snapshot
    }

    pub fn latest(&self) -> SystemSnapshot {
        self.latest.read().clone()
    }

    /// Samples in the background at a fixed interval until cancelled.
    pub fn spawn_sampler(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = monitor.sample();
                        debug!(
                            cpu = snapshot.cpu_percent,
                            memory = snapshot.memory_percent,
                            "performance sample"
                        );
                    }
                }
            }
        })
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot_from(system: &System) -> SystemSnapshot {
    let total = system.total_memory();
    let used = system.used_memory();
    let memory_percent = if total > 0 {
        (used as f32 / total as f32) * 100.0
    } else {
        0.0
    };
    SystemSnapshot {
        cpu_percent: system.global_cpu_info().cpu_usage(),
        memory_percent,
        total_memory_mb: total / (1024 * 1024),
        used_memory_mb: used / (1024 * 1024),
        sampled_at: Utc::now(),
    }
}
