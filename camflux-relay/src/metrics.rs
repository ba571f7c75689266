//! Publish metrics and stream quality scoring.

use serde::Serialize;

use crate::parser::ProgressUpdate;

/// Reference throughput for a healthy relay; ratios are taken against
/// these and clamped to 1.0 so overshoot is not rewarded.
pub const REFERENCE_FPS: f64 = 30.0;
pub const REFERENCE_BITRATE_KBPS: f64 = 3000.0;
pub const REFERENCE_VIEWERS: f64 = 10.0;

/// Live counters for one publishing relay. Counters reset when the
/// underlying process is replaced; viewer count is fed in externally.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishMetrics {
    pub fps: f64,
    pub bitrate_kbps: f64,
    pub viewers: u32,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub dropped_frames: u64,
}

impl PublishMetrics {
    /// Folds one progress update in. Absent fields keep their last value;
    /// present counters replace (the process reports cumulatively).
    pub fn apply(&mut self, update: &ProgressUpdate) {
        if let Some(fps) = update.fps {
            self.fps = fps;
        }
        if let Some(bitrate) = update.bitrate_kbps {
            self.bitrate_kbps = bitrate;
        }
        if let Some(frames) = update.frames {
            self.frames_sent = frames;
        }
        if let Some(bytes) = update.bytes {
            self.bytes_sent = bytes;
        }
        if let Some(dropped) = update.dropped {
            self.dropped_frames = dropped;
        }
    }

    /// Clears per-process values while keeping the externally-fed viewer
    /// count.
    pub fn reset_process_counters(&mut self) {
        let viewers = self.viewers;
        *self = Self {
            viewers,
            ..Self::default()
        };
    }

    /// Composite quality in `[0, 100]`.
    ///
    /// Weighted sum of fps (45), bitrate (45) and viewer (10) ratios,
    /// scaled down by the fraction of dropped frames. A healthy stream
    /// nobody is watching scores 90.
    #[must_use]
    pub fn quality_score(&self) -> f64 {
        let fps_ratio = (self.fps / REFERENCE_FPS).clamp(0.0, 1.0);
        let bitrate_ratio = (self.bitrate_kbps / REFERENCE_BITRATE_KBPS).clamp(0.0, 1.0);
        let viewer_ratio = (f64::from(self.viewers) / REFERENCE_VIEWERS).clamp(0.0, 1.0);
        let total = self.frames_sent + self.dropped_frames;
        let drop_ratio = if total > 0 {
            self.dropped_frames as f64 / total as f64
        } else {
            0.0
        };
        (45.0 * fps_ratio + 45.0 * bitrate_ratio + 10.0 * viewer_ratio) * (1.0 - drop_ratio)
    }

    #[must_use]
    pub fn quality_band(&self) -> QualityBand {
        QualityBand::from_score(self.quality_score())
    }
}

/// Coarse quality classification for dashboards and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityBand {
    Optimal,
    Degraded,
    Poor,
}

impl QualityBand {
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Self::Optimal
        } else if score >= 50.0 {
            Self::Degraded
        } else {
            Self::Poor
        }
    }
}

impl std::fmt::Display for QualityBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Optimal => "optimal",
            Self::Degraded => "degraded",
            Self::Poor => "poor",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(fps: f64, bitrate: f64, viewers: u32) -> PublishMetrics {
        PublishMetrics {
            fps,
            bitrate_kbps: bitrate,
            viewers,
            ..PublishMetrics::default()
        }
    }

    #[test]
    fn test_full_house_scores_hundred() {
        let m = metrics(30.0, 3000.0, 10);
        assert!((m.quality_score() - 100.0).abs() < f64::EPSILON);
        assert_eq!(m.quality_band(), QualityBand::Optimal);
    }

    #[test]
    fn test_healthy_stream_without_viewers_is_optimal() {
        let m = metrics(30.0, 3000.0, 0);
        assert!((m.quality_score() - 90.0).abs() < f64::EPSILON);
        assert_eq!(m.quality_band(), QualityBand::Optimal);
    }

    #[test]
    fn test_overshoot_is_not_rewarded() {
        let nominal = metrics(30.0, 3000.0, 10);
        let hot = metrics(60.0, 9000.0, 100);
        assert!((nominal.quality_score() - hot.quality_score()).abs() < f64::EPSILON);
    }

    #[test]
    fn test_score_is_monotonic_in_fps() {
        let slow = metrics(10.0, 1500.0, 5);
        let fast = metrics(20.0, 1500.0, 5);
        assert!(fast.quality_score() > slow.quality_score());
    }

    #[test]
    fn test_dropped_frames_scale_the_score_down() {
        let mut m = metrics(30.0, 3000.0, 10);
        m.frames_sent = 900;
        m.dropped_frames = 100;
        assert!((m.quality_score() - 90.0).abs() < 1e-9);
        m.dropped_frames = 900;
        assert_eq!(m.quality_band(), QualityBand::Degraded);
    }

    #[test]
    fn test_band_thresholds() {
        assert_eq!(QualityBand::from_score(100.0), QualityBand::Optimal);
        assert_eq!(QualityBand::from_score(80.0), QualityBand::Optimal);
        assert_eq!(QualityBand::from_score(79.9), QualityBand::Degraded);
        assert_eq!(QualityBand::from_score(50.0), QualityBand::Degraded);
        assert_eq!(QualityBand::from_score(49.9), QualityBand::Poor);
        assert_eq!(QualityBand::from_score(0.0), QualityBand::Poor);
    }

    #[test]
    fn test_idle_metrics_score_zero() {
        let m = PublishMetrics::default();
        assert!((m.quality_score()).abs() < f64::EPSILON);
        assert_eq!(m.quality_band(), QualityBand::Poor);
    }

    #[test]
    fn test_apply_keeps_last_value_for_absent_fields() {
        let mut m = PublishMetrics::default();
        m.apply(&ProgressUpdate {
            fps: Some(25.0),
            frames: Some(100),
            ..ProgressUpdate::default()
        });
        m.apply(&ProgressUpdate {
            bitrate_kbps: Some(2000.0),
            ..ProgressUpdate::default()
        });
        assert!((m.fps - 25.0).abs() < f64::EPSILON);
        assert!((m.bitrate_kbps - 2000.0).abs() < f64::EPSILON);
        assert_eq!(m.frames_sent, 100);
    }

    #[test]
    fn test_reset_keeps_viewers() {
        let mut m = metrics(25.0, 2000.0, 4);
        m.frames_sent = 500;
        m.reset_process_counters();
        assert_eq!(m.viewers, 4);
        assert_eq!(m.frames_sent, 0);
        assert!(m.fps.abs() < f64::EPSILON);
    }
}
