use serde::{Deserialize, Serialize};

use super::consts::{Phase, MIN_LIMIT};

/// Blends successive limit values so the applied cap moves smoothly.
///
/// `finish` tracks the raw value directly (lag there costs precision at the
/// announce); elsewhere small changes pass through, medium changes blend
/// 0.7/0.3 and large ones 0.5/0.5.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmoothLimiter {
    #[serde(default)]
    smooth_limit: u64,
}

impl SmoothLimiter {
    /// Fold in a freshly computed limit and return the value to apply.
    pub fn smooth(&mut self, new_limit: u64, phase: Phase) -> u64 {
        if new_limit == 0 || self.smooth_limit == 0 {
            self.smooth_limit = new_limit;
            return new_limit;
        }

        if phase == Phase::Finish {
            self.smooth_limit = new_limit;
            return new_limit;
        }

        let old = self.smooth_limit as f64;
        let change = (new_limit as f64 - old).abs() / old.max(1.0);

        if change < 0.2 {
            self.smooth_limit = new_limit;
        } else if change < 0.5 {
            self.smooth_limit = (old * 0.7 + new_limit as f64 * 0.3) as u64;
        } else {
            self.smooth_limit = (old * 0.5 + new_limit as f64 * 0.5) as u64;
        }

        self.smooth_limit.max(MIN_LIMIT)
    }

    /// Forget the previous value (cycle rollover or limit release).
    pub fn reset(&mut self) {
        self.smooth_limit = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_value_passes_through() {
        let mut smoother = SmoothLimiter::default();
        assert_eq!(smoother.smooth(1_000_000, Phase::Steady), 1_000_000);
    }

    #[test]
    fn small_change_adopts_directly() {
        let mut smoother = SmoothLimiter::default();
        let _ = smoother.smooth(1_000_000, Phase::Steady);
        assert_eq!(smoother.smooth(1_100_000, Phase::Steady), 1_100_000);
    }

    #[test]
    fn medium_change_blends_seventy_thirty() {
        let mut smoother = SmoothLimiter::default();
        let _ = smoother.smooth(1_000_000, Phase::Steady);
        let blended = smoother.smooth(1_400_000, Phase::Steady);
        assert_eq!(blended, 1_120_000);
    }

    #[test]
    fn large_change_blends_evenly() {
        let mut smoother = SmoothLimiter::default();
        let _ = smoother.smooth(1_000_000, Phase::Steady);
        let blended = smoother.smooth(2_000_000, Phase::Steady);
        assert_eq!(blended, 1_500_000);
    }

    #[test]
    fn finish_tracks_directly() {
        let mut smoother = SmoothLimiter::default();
        let _ = smoother.smooth(1_000_000, Phase::Finish);
        assert_eq!(smoother.smooth(3_000_000, Phase::Finish), 3_000_000);
    }

    #[test]
    fn zero_resets_the_baseline() {
        let mut smoother = SmoothLimiter::default();
        let _ = smoother.smooth(1_000_000, Phase::Steady);
        assert_eq!(smoother.smooth(0, Phase::Steady), 0);
        // Next value passes through untouched again.
        assert_eq!(smoother.smooth(5_000_000, Phase::Steady), 5_000_000);
    }
}
