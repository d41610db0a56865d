//! Controller tuning constants. The values are load-bearing; they encode the
//! behavior of trackers and clients observed in production, not preferences.

use serde::{Deserialize, Serialize};

/// Controller mode selecting PID gains, window weights and quantizer steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Cycle not yet synchronized; observe, cap only when clearly over.
    #[default]
    Warmup,
    /// More than two minutes left and behind or ahead of plan.
    Catch,
    /// Two minutes or less to the announce; converge.
    Steady,
    /// Final thirty seconds; track the required speed directly.
    Finish,
    /// No limiting needed this cycle.
    Idle,
}

impl Phase {
    /// Stable lowercase label used in the ledger and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Warmup => "warmup",
            Self::Catch => "catch",
            Self::Steady => "steady",
            Self::Finish => "finish",
            Self::Idle => "idle",
        }
    }
}

/// Seconds before the announce where `finish` begins.
pub(crate) const FINISH_TIME: f64 = 30.0;
/// Seconds before the announce where `steady` begins.
pub(crate) const STEADY_TIME: f64 = 120.0;

/// Smallest limit ever emitted, bytes/s.
pub const MIN_LIMIT: u64 = 4096;

/// Announce-interval estimates by torrent age (seconds).
pub(crate) const ANNOUNCE_INTERVAL_NEW: u32 = 1800;
pub(crate) const ANNOUNCE_INTERVAL_WEEK: u32 = 2700;
pub(crate) const ANNOUNCE_INTERVAL_OLD: u32 = 3600;
/// Remaining times beyond one day are junk.
pub(crate) const MAX_REANNOUNCE: f64 = 86_400.0;

/// Minimum seconds between forced reannounces.
pub(crate) const REANNOUNCE_MIN_INTERVAL: f64 = 900.0;
/// Upload cap while waiting for an optimized reannounce, KB/s.
pub(crate) const REANNOUNCE_WAIT_LIMIT_KB: i64 = 5120;

/// Cycle-average upload ceiling enforced by the download brake, bytes/s.
pub(crate) const MAX_AVG_UPLOAD_SPEED: f64 = 52_428_800.0;
/// Minimum elapsed cycle seconds before the brake looks at a torrent.
pub(crate) const DOWNLOAD_LIMIT_MIN_TIME: f64 = 2.0;
/// ETA check multiplier when an upload cap is already active.
pub(crate) const DOWNLOAD_LIMIT_ETA_FACTOR: f64 = 2.0;
/// Per-step clamp on brake adjustments.
pub(crate) const DOWNLOAD_LIMIT_ADJUST: f64 = 1.5;
/// Brake ceiling, KB/s.
pub(crate) const DOWNLOAD_LIMIT_MAX_KB: i64 = 512_000;

/// Progress-ring length for the announce-time optimizer (~5 min at 5 s).
pub(crate) const OPTIMIZE_RING_LEN: usize = 60;
/// Minimum elapsed cycle seconds before the optimizer engages.
pub(crate) const OPTIMIZE_MIN_THIS_TIME: f64 = 30.0;

/// Kalman process noise on speed.
pub(crate) const KALMAN_Q_SPEED: f64 = 0.1;
/// Kalman process noise on acceleration.
pub(crate) const KALMAN_Q_ACCEL: f64 = 0.05;
/// Kalman measurement noise.
pub(crate) const KALMAN_R: f64 = 0.5;

/// Averaging windows in seconds.
pub(crate) const SPEED_WINDOWS: [f64; 4] = [5.0, 15.0, 30.0, 60.0];

/// Per-phase weights over [`SPEED_WINDOWS`].
pub(crate) const fn window_weights(phase: Phase) -> [f64; 4] {
    match phase {
        Phase::Catch => [0.4, 0.35, 0.2, 0.05],
        Phase::Steady => [0.3, 0.35, 0.25, 0.1],
        Phase::Warmup | Phase::Finish | Phase::Idle => [0.5, 0.3, 0.15, 0.05],
    }
}

/// Per-phase PID gains and target headroom.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PidParams {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub headroom: f64,
}

pub(crate) const fn pid_params(phase: Phase) -> PidParams {
    match phase {
        Phase::Warmup | Phase::Idle => PidParams {
            kp: 0.3,
            ki: 0.05,
            kd: 0.02,
            headroom: 1.03,
        },
        Phase::Catch => PidParams {
            kp: 0.5,
            ki: 0.08,
            kd: 0.04,
            headroom: 1.02,
        },
        Phase::Steady => PidParams {
            kp: 0.7,
            ki: 0.10,
            kd: 0.05,
            headroom: 1.005,
        },
        Phase::Finish => PidParams {
            kp: 0.8,
            ki: 0.15,
            kd: 0.08,
            headroom: 1.002,
        },
    }
}

/// Quantizer base step per phase, bytes.
pub(crate) const fn quant_step(phase: Phase) -> u64 {
    match phase {
        Phase::Warmup => 4096,
        Phase::Catch => 3072,
        Phase::Steady => 2048,
        Phase::Finish => 256,
        Phase::Idle => 8192,
    }
}

/// Over-speed protection: progress and speed thresholds, and the cap factor.
pub(crate) const PROGRESS_PROTECT: f64 = 0.90;
pub(crate) const SPEED_PROTECT_RATIO: f64 = 2.5;
pub(crate) const SPEED_PROTECT_LIMIT: f64 = 1.3;

/// Budget-style limiting trigger: reaction buffer and floor-speed band.
pub(crate) const LIMIT_TRIGGER_BUFFER_SEC: f64 = 10.0;
pub(crate) const LIMIT_TRIGGER_FLOOR_RATIO: f64 = 0.12;
pub(crate) const LIMIT_TRIGGER_FLOOR_RATIO_MIN: f64 = 0.05;
pub(crate) const LIMIT_TRIGGER_FLOOR_RATIO_MAX: f64 = 0.20;

/// Scheduler pacing by minimum remaining time, seconds.
pub(crate) const DYNAMIC_INTERVAL_MAX: f64 = 5.0;
