use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::consts::{window_weights, Phase, SPEED_WINDOWS};
use super::safe_div;

/// Ring capacity: at the fastest tick (200 ms) this spans the 60 s window
/// four times over.
const MAX_SAMPLES: usize = 1200;

/// Multi-window speed tracker over raw `(t, speed)` samples.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowTracker {
    #[serde(default)]
    samples: VecDeque<(f64, f64)>,
}

impl WindowTracker {
    /// Record one raw sample.
    pub fn record(&mut self, now: f64, speed: f64) {
        if self.samples.len() == MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back((now, speed));
    }

    /// Weighted average over the {5, 15, 30, 60} s windows; weights depend on
    /// phase. Returns 0 when no sample falls into any window.
    #[must_use]
    pub fn weighted_avg(&self, now: f64, phase: Phase) -> f64 {
        let weights = window_weights(phase);
        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;
        for (window, weight) in SPEED_WINDOWS.iter().zip(weights.iter()) {
            let mut sum = 0.0;
            let mut count = 0usize;
            for (t, speed) in &self.samples {
                if now - t <= *window {
                    sum += speed;
                    count += 1;
                }
            }
            if count > 0 {
                weighted_sum += (sum / count as f64) * weight;
                total_weight += weight;
            }
        }
        if total_weight > 0.0 {
            weighted_sum / total_weight
        } else {
            0.0
        }
    }

    /// Relative speed trend over the last `window` seconds: second half mean
    /// versus first half mean. Needs at least five samples.
    #[must_use]
    pub fn recent_trend(&self, now: f64, window: f64) -> f64 {
        let recent: Vec<f64> = self
            .samples
            .iter()
            .filter(|(t, _)| now - t <= window)
            .map(|(_, s)| *s)
            .collect();
        if recent.len() < 5 {
            return 0.0;
        }
        let mid = recent.len() / 2;
        let first = recent[..mid].iter().sum::<f64>() / mid as f64;
        let second = recent[mid..].iter().sum::<f64>() / (recent.len() - mid) as f64;
        safe_div(second - first, first, 0.0)
    }

    /// Drop all samples.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Trim the ring to its capacity after deserialization.
    pub fn enforce_cap(&mut self) {
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_avg_prefers_recent_windows_in_finish() {
        let mut tracker = WindowTracker::default();
        let now = 100.0;
        // Old samples (45-60 s ago) at 1 MB/s, recent (0-5 s) at 10 MB/s.
        for i in 0..10 {
            tracker.record(now - 60.0 + f64::from(i), 1_000_000.0);
        }
        for i in 0..5 {
            tracker.record(now - 4.0 + f64::from(i), 10_000_000.0);
        }
        let avg = tracker.weighted_avg(now, Phase::Finish);
        assert!(avg > 5_000_000.0, "finish weighting favors recency: {avg}");
    }

    #[test]
    fn trend_detects_acceleration() {
        let mut tracker = WindowTracker::default();
        let now = 50.0;
        for i in 0..10 {
            let t = now - 9.0 + f64::from(i);
            let speed = if i < 5 { 1000.0 } else { 2000.0 };
            tracker.record(t, speed);
        }
        let trend = tracker.recent_trend(now, 10.0);
        assert!(trend > 0.5, "trend {trend}");
    }

    #[test]
    fn trend_needs_five_samples() {
        let mut tracker = WindowTracker::default();
        tracker.record(1.0, 100.0);
        tracker.record(2.0, 900.0);
        assert!(tracker.recent_trend(3.0, 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ring_is_bounded() {
        let mut tracker = WindowTracker::default();
        for i in 0..2000 {
            tracker.record(f64::from(i), 1.0);
        }
        assert!(tracker.samples.len() <= MAX_SAMPLES);
    }
}
