use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Ratios kept for the rolling mean.
const HISTORY_SIZE: usize = 20;

/// Self-correcting feedback over completed cycles.
///
/// Each cycle rollover records `actual / target`. Once five samples exist the
/// correction factor nudges the effective target so the rolling mean stays in
/// the `[0.95, 1.05]` success band; inside the band it slowly regresses to 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecisionTracker {
    #[serde(default)]
    history: VecDeque<f64>,
    #[serde(default = "default_factor")]
    correction_factor: f64,
    #[serde(default)]
    total_cycles: u64,
    #[serde(default)]
    success_cycles: u64,
}

const fn default_factor() -> f64 {
    1.0
}

impl Default for PrecisionTracker {
    fn default() -> Self {
        Self {
            history: VecDeque::new(),
            correction_factor: default_factor(),
            total_cycles: 0,
            success_cycles: 0,
        }
    }
}

impl PrecisionTracker {
    /// Record one completed cycle.
    pub fn record(&mut self, actual_upload: f64, target_upload: f64) {
        if target_upload <= 0.0 {
            return;
        }
        let ratio = actual_upload / target_upload;
        if self.history.len() == HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(ratio);
        self.total_cycles += 1;
        if (0.95..=1.05).contains(&ratio) {
            self.success_cycles += 1;
        }
        self.update_correction();
    }

    fn update_correction(&mut self) {
        if self.history.len() < 5 {
            return;
        }
        let avg_ratio = self.history.iter().sum::<f64>() / self.history.len() as f64;
        let deviation = (avg_ratio - 1.0).abs();

        // Adaptive step: the further off, the faster the correction moves.
        let step = if deviation < 0.05 {
            0.005
        } else if deviation < 0.10 {
            0.01
        } else if deviation < 0.20 {
            0.02
        } else {
            0.03
        };

        if avg_ratio > 1.02 {
            self.correction_factor = (self.correction_factor - step).max(0.90);
        } else if avg_ratio < 0.95 {
            self.correction_factor = (self.correction_factor + step).min(1.10);
        } else {
            let regression = step * 0.2;
            if self.correction_factor < 1.0 {
                self.correction_factor = (self.correction_factor + regression).min(1.0);
            } else if self.correction_factor > 1.0 {
                self.correction_factor = (self.correction_factor - regression).max(1.0);
            }
        }
    }

    /// Current correction factor, in `[0.90, 1.10]`.
    #[must_use]
    pub fn correction(&self) -> f64 {
        self.correction_factor
    }

    /// Fraction of recorded cycles that landed in the success band.
    #[must_use]
    pub fn precision_rate(&self) -> f64 {
        if self.total_cycles == 0 {
            0.0
        } else {
            self.success_cycles as f64 / self.total_cycles as f64
        }
    }

    /// Mean of the retained ratio history (1.0 when empty).
    #[must_use]
    pub fn recent_avg(&self) -> f64 {
        if self.history.is_empty() {
            1.0
        } else {
            self.history.iter().sum::<f64>() / self.history.len() as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_five_samples_before_correcting() {
        let mut tracker = PrecisionTracker::default();
        for _ in 0..4 {
            tracker.record(1.3, 1.0);
        }
        assert!((tracker.correction() - 1.0).abs() < f64::EPSILON);
        tracker.record(1.3, 1.0);
        assert!(tracker.correction() < 1.0);
    }

    #[test]
    fn persistent_overshoot_walks_factor_down_to_floor() {
        let mut tracker = PrecisionTracker::default();
        for _ in 0..50 {
            tracker.record(1.5, 1.0);
        }
        assert!((tracker.correction() - 0.90).abs() < 1e-9);
    }

    #[test]
    fn undershoot_raises_factor_to_ceiling() {
        let mut tracker = PrecisionTracker::default();
        for _ in 0..50 {
            tracker.record(0.5, 1.0);
        }
        assert!((tracker.correction() - 1.10).abs() < 1e-9);
    }

    #[test]
    fn in_band_regresses_toward_unity() {
        let mut tracker = PrecisionTracker::default();
        for _ in 0..20 {
            tracker.record(1.5, 1.0);
        }
        let depressed = tracker.correction();
        assert!(depressed < 1.0);
        for _ in 0..200 {
            tracker.record(1.0, 1.0);
        }
        assert!(tracker.correction() > depressed);
        assert!((tracker.correction() - 1.0).abs() < 0.02);
    }

    #[test]
    fn precision_rate_counts_success_band() {
        let mut tracker = PrecisionTracker::default();
        tracker.record(1.0, 1.0);
        tracker.record(2.0, 1.0);
        assert!((tracker.precision_rate() - 0.5).abs() < f64::EPSILON);
        assert!(tracker.recent_avg() > 1.0);
    }

    #[test]
    fn zero_target_is_ignored() {
        let mut tracker = PrecisionTracker::default();
        tracker.record(5.0, 0.0);
        assert_eq!(tracker.total_cycles, 0);
    }
}
