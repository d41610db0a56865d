use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::consts::{Phase, MAX_REANNOUNCE};
use super::control::estimate_announce_interval;
use super::kalman::SpeedKalman;
use super::pid::PidController;
use super::precision::PrecisionTracker;
use super::smooth::SmoothLimiter;
use super::window::WindowTracker;

/// Measured rollover-to-rollover intervals kept for the median.
const INTERVAL_SAMPLES: usize = 5;

/// Progress-ring capacity for the announce-time optimizer.
const DETAIL_PROGRESS: usize = 60;

/// Remaining-time jumps above this many seconds mean the cycle rolled over.
const JUMP_THRESHOLD: f64 = 30.0;

/// Rollovers this close to a forced reannounce are expected, not a period.
const FORCED_REANNOUNCE_SHADOW: f64 = 120.0;

/// Sentinel "unknown" remaining time.
pub(crate) const UNKNOWN_TIME_LEFT: f64 = 9999.0;

/// Complete per-torrent limiter state. Everything persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentState {
    /// Infohash.
    pub hash: String,
    /// Torrent name (for logs).
    pub name: String,
    /// Tracker domain the torrent announces to.
    pub tracker: String,

    /// Unix time the torrent was added to its client.
    #[serde(default)]
    pub time_added: f64,
    /// Payload size in bytes.
    #[serde(default)]
    pub total_size: u64,
    /// Site publish time (scraped once, preferred age source).
    #[serde(default)]
    pub publish_time: Option<f64>,
    /// Seeding time in seconds, an age lower bound.
    #[serde(default)]
    pub seeding_time: i64,

    /// Cumulative uploaded bytes as last reported.
    #[serde(default)]
    pub total_uploaded: u64,
    /// Upload cursor for the bandwidth ledger.
    #[serde(default)]
    pub last_record_uploaded: u64,
    /// Download cursor for the bandwidth ledger.
    #[serde(default)]
    pub last_record_downloaded: u64,
    /// Uploaded bytes at the start of the current cycle.
    #[serde(default)]
    pub cycle_start_uploaded: u64,
    /// Whether the cycle basis has been established.
    #[serde(default)]
    pub cycle_synced: bool,
    /// Cycle length in seconds (0 = unknown).
    #[serde(default)]
    pub cycle_interval: f64,
    /// When the last rollover was observed.
    #[serde(default)]
    pub last_jump: f64,
    /// When the current cycle began.
    #[serde(default)]
    pub cycle_start_time: f64,

    /// Inferred time of the last announce, when known.
    #[serde(default)]
    pub last_announce_time: Option<f64>,
    /// When this controller last forced a reannounce.
    #[serde(default)]
    pub last_reannounce: f64,
    /// When the optimizer last forced a reannounce.
    #[serde(default)]
    pub last_force_reannounce: f64,
    /// A reannounce already happened this cycle.
    #[serde(default)]
    pub reannounced_this_cycle: bool,
    /// Absolute unix time of the next announce, when known.
    #[serde(default)]
    pub next_announce_time: Option<f64>,
    /// Interval reported by the client (>= 300 s or it was discarded).
    #[serde(default)]
    pub announce_interval: Option<u32>,
    /// min_announce as reported; kept for diagnostics, never used as a cycle.
    #[serde(default)]
    pub min_announce: Option<u32>,

    /// The client's next-announce value has been validated.
    #[serde(default)]
    pub next_announce_is_true: bool,
    /// Previous next-remaining observation.
    #[serde(default)]
    pub last_next_remaining: Option<f64>,
    /// When that observation was taken.
    #[serde(default)]
    pub last_next_update_time: f64,
    /// Consecutive suspect deviations of next-remaining.
    #[serde(default)]
    pub next_jump_suspect_count: u32,

    /// Last observed seconds-remaining (probe cache).
    #[serde(default)]
    pub cached_tl: f64,
    /// When `cached_tl` was observed.
    #[serde(default)]
    pub cache_ts: f64,
    /// Remaining time seen on the previous poll, for jump detection.
    #[serde(default)]
    pub prev_tl: f64,
    /// Observed cycle rollovers.
    #[serde(default)]
    pub jump_count: u32,
    /// Cycle counter (diagnostics).
    #[serde(default)]
    pub cycle_index: u64,
    /// Rollover-to-rollover interval measurements (median wins).
    #[serde(default)]
    pub interval_samples: VecDeque<f64>,

    /// Phased PID controller.
    #[serde(default)]
    pub pid: PidController,
    /// Speed/accel filter.
    #[serde(default)]
    pub kalman: SpeedKalman,
    /// Raw multi-window speed samples.
    #[serde(default)]
    pub tracker_speed: WindowTracker,
    /// Long-run correction factor.
    #[serde(default)]
    pub precision: PrecisionTracker,
    /// Output smoothing.
    #[serde(default)]
    pub smoother: SmoothLimiter,

    /// Currently applied upload cap, bytes/s (0 = none).
    #[serde(default)]
    pub current_limit: u64,
    /// Controller phase.
    #[serde(default)]
    pub phase: Phase,

    /// Target upload volume for this cycle, bytes.
    #[serde(default)]
    pub cycle_target_upload: f64,
    /// Uploaded bytes so far this cycle.
    #[serde(default)]
    pub cycle_current_upload: f64,
    /// Upload progress against the target.
    #[serde(default)]
    pub cycle_progress: f64,
    /// Elapsed-time progress through the cycle.
    #[serde(default)]
    pub cycle_time_progress: f64,
    /// Mean upload speed this cycle, bytes/s.
    #[serde(default)]
    pub cycle_avg_speed: f64,
    /// Predicted end-of-cycle completion against the target.
    #[serde(default)]
    pub estimated_completion: f64,

    /// Applied download cap in KB/s (-1 released, 0 never set).
    #[serde(default)]
    pub current_download_limit: i64,
    /// Applied optimizer upload cap in KB/s (-1 released, 0 never set).
    #[serde(default)]
    pub current_upload_limit: i64,
    /// Completed payload bytes (for the brake).
    #[serde(default)]
    pub total_done: u64,
    /// Full payload size (for the brake).
    #[serde(default)]
    pub total_size_torrent: u64,
    /// Instantaneous download speed, bytes/s.
    #[serde(default)]
    pub download_speed: f64,
    /// Estimated seconds to completion.
    #[serde(default)]
    pub eta: i64,
    /// `(uploaded, done, t)` ring for the announce-time optimizer.
    #[serde(default)]
    pub detail_progress: VecDeque<(u64, u64, f64)>,
    /// The optimizer armed a wait-limit and expects to reannounce soon.
    #[serde(default)]
    pub waiting_for_reannounce: bool,
}

impl TorrentState {
    /// Fresh state for a newly observed torrent.
    #[must_use]
    pub fn new(hash: &str, name: &str, tracker: &str) -> Self {
        Self {
            hash: hash.to_string(),
            name: name.to_string(),
            tracker: tracker.to_string(),
            time_added: 0.0,
            total_size: 0,
            publish_time: None,
            seeding_time: 0,
            total_uploaded: 0,
            last_record_uploaded: 0,
            last_record_downloaded: 0,
            cycle_start_uploaded: 0,
            cycle_synced: false,
            cycle_interval: 0.0,
            last_jump: 0.0,
            cycle_start_time: 0.0,
            last_announce_time: None,
            last_reannounce: 0.0,
            last_force_reannounce: 0.0,
            reannounced_this_cycle: false,
            next_announce_time: None,
            announce_interval: None,
            min_announce: None,
            next_announce_is_true: false,
            last_next_remaining: None,
            last_next_update_time: 0.0,
            next_jump_suspect_count: 0,
            cached_tl: 0.0,
            cache_ts: 0.0,
            prev_tl: 0.0,
            jump_count: 0,
            cycle_index: 0,
            interval_samples: VecDeque::new(),
            pid: PidController::default(),
            kalman: SpeedKalman::default(),
            tracker_speed: WindowTracker::default(),
            precision: PrecisionTracker::default(),
            smoother: SmoothLimiter::default(),
            current_limit: 0,
            phase: Phase::Warmup,
            cycle_target_upload: 0.0,
            cycle_current_upload: 0.0,
            cycle_progress: 0.0,
            cycle_time_progress: 0.0,
            cycle_avg_speed: 0.0,
            estimated_completion: 0.0,
            current_download_limit: 0,
            current_upload_limit: 0,
            total_done: 0,
            total_size_torrent: 0,
            download_speed: 0.0,
            eta: 0,
            detail_progress: VecDeque::new(),
            waiting_for_reannounce: false,
        }
    }

    /// Re-impose ring caps after deserializing an old blob.
    pub fn enforce_caps(&mut self) {
        while self.interval_samples.len() > INTERVAL_SAMPLES {
            self.interval_samples.pop_front();
        }
        while self.detail_progress.len() > DETAIL_PROGRESS {
            self.detail_progress.pop_front();
        }
        self.tracker_speed.enforce_cap();
    }

    /// Seconds until the next announce, best estimate.
    ///
    /// Preference: a known `last_announce_time` plus the interval, then the
    /// cached remaining-time extrapolated forward, else the unknown sentinel.
    #[must_use]
    pub fn time_left(&self, now: f64) -> f64 {
        if let Some(last) = self.last_announce_time {
            if last > 0.0 {
                let interval = f64::from(self.announce_interval_secs(now));
                return (last + interval - now).max(0.0);
            }
        }
        if self.cache_ts <= 0.0 {
            return UNKNOWN_TIME_LEFT;
        }
        (self.cached_tl - (now - self.cache_ts)).max(0.0)
    }

    /// Seconds elapsed in the current cycle.
    #[must_use]
    pub fn this_time(&self, now: f64) -> f64 {
        if self.cycle_start_time <= 0.0 {
            0.0
        } else {
            (now - self.cycle_start_time).max(0.0)
        }
    }

    /// Announce interval in seconds, best estimate.
    ///
    /// Preference: the synchronized measured cycle, the client-reported
    /// interval, then the age-derived estimate (publish time first).
    #[must_use]
    pub fn announce_interval_secs(&self, now: f64) -> u32 {
        if self.cycle_synced && self.cycle_interval > 0.0 {
            return self.cycle_interval as u32;
        }
        if let Some(interval) = self.announce_interval {
            if interval > 0 {
                return interval;
            }
        }
        if let Some(publish) = self.publish_time {
            if publish > 0.0 {
                return estimate_announce_interval(publish, 300, self.seeding_time, true, now);
            }
        }
        estimate_announce_interval(self.time_added, 300, self.seeding_time, false, now)
    }

    /// Fold in a poll of the announce probe and advance the cycle basis.
    ///
    /// `next_announce` is an absolute unix time or a seconds-remaining value
    /// (disambiguated by magnitude); `interval` is a client-reported interval
    /// that has already passed the >= 300 s filter.
    pub fn sync_cycle(
        &mut self,
        total_uploaded: u64,
        now: f64,
        next_announce: Option<f64>,
        interval: Option<u32>,
    ) {
        self.total_uploaded = total_uploaded;

        if let Some(interval) = interval {
            if interval >= 300 {
                self.announce_interval = Some(interval);
                if !self.cycle_synced || self.cycle_interval <= 0.0 {
                    self.cycle_interval = f64::from(interval);
                    self.cycle_synced = true;
                }
            }
        }

        if let Some(raw) = next_announce {
            if raw > 0.0 {
                let remaining = if raw < 1e9 {
                    self.next_announce_time = Some(now + raw);
                    raw
                } else {
                    self.next_announce_time = Some(raw);
                    raw - now
                };
                if remaining > 0.0 && remaining < MAX_REANNOUNCE {
                    self.cached_tl = remaining;
                    self.cache_ts = now;
                }
            }
        }

        let tl_prop = if self.cache_ts > 0.0 {
            Some((self.cached_tl - (now - self.cache_ts)).max(0.0))
        } else {
            None
        };

        let is_jump = matches!(tl_prop, Some(tl) if self.prev_tl > 0.0 && tl > self.prev_tl + JUMP_THRESHOLD);

        if self.cycle_start_time <= 0.0 {
            self.start_new_cycle(total_uploaded, now, tl_prop, false);
        } else if is_jump {
            self.start_new_cycle(total_uploaded, now, tl_prop, true);
        }

        if let Some(tl) = tl_prop {
            self.prev_tl = tl;
        }
    }

    fn start_new_cycle(&mut self, total_uploaded: u64, now: f64, tl: Option<f64>, is_jump: bool) {
        // Close out the finished cycle before resetting its counters.
        if is_jump && self.cycle_target_upload > 0.0 && self.cycle_current_upload > 0.0 {
            self.precision
                .record(self.cycle_current_upload, self.cycle_target_upload);
            info!(
                torrent = %truncated(&self.name),
                progress = format!("{:.1}%", self.cycle_progress * 100.0),
                precision = format!("{:.1}%", self.precision.precision_rate() * 100.0),
                correction = format!("{:.3}", self.precision.correction()),
                "cycle rollover"
            );
        }

        let announce_interval = self.announce_interval_secs(now);

        if is_jump {
            if self.last_jump > 0.0 {
                let measured = now - self.last_jump;
                // Rollovers right after a forced reannounce measure the forced
                // gap, not the tracker's period.
                if (300.0..=MAX_REANNOUNCE).contains(&measured)
                    && (now - self.last_force_reannounce) > FORCED_REANNOUNCE_SHADOW
                {
                    if self.interval_samples.len() == INTERVAL_SAMPLES {
                        self.interval_samples.pop_front();
                    }
                    self.interval_samples.push_back(measured);
                    if self.interval_samples.len() >= 2 {
                        let mut sorted: Vec<f64> = self.interval_samples.iter().copied().collect();
                        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                        self.cycle_interval = sorted[sorted.len() / 2];
                        self.cycle_synced = true;
                    }
                }
            }

            self.last_jump = now;
            self.jump_count += 1;
            self.cycle_index += 1;

            self.cycle_start_uploaded = total_uploaded;
            self.cycle_start_time = now;
            self.last_announce_time = Some(now);
        } else {
            // First sight of this torrent: reconstruct where in the cycle we
            // are from the remaining time, so the budget is not a full cycle.
            let tl_val = tl.unwrap_or(f64::from(announce_interval));
            let elapsed_in_cycle = if announce_interval > 0
                && tl_val > 0.0
                && tl_val < f64::from(announce_interval)
            {
                f64::from(announce_interval) - tl_val
            } else {
                0.0
            };

            self.cycle_start_time = if elapsed_in_cycle > 0.0 {
                now - elapsed_in_cycle
            } else {
                now
            };

            if self.time_added > 0.0 && (now - self.time_added) < f64::from(announce_interval) {
                // Fresh torrent inside its first cycle: everything it uploaded
                // counts against this cycle.
                self.cycle_start_uploaded = 0;
            } else if elapsed_in_cycle > 60.0 && self.kalman.speed > 0.0 {
                let estimated = total_uploaded as f64 - self.kalman.speed * elapsed_in_cycle;
                self.cycle_start_uploaded = estimated.max(0.0) as u64;
            } else {
                self.cycle_start_uploaded = total_uploaded;
            }
            debug!(
                torrent = %truncated(&self.name),
                elapsed_in_cycle,
                "initialized cycle basis"
            );
        }

        self.reannounced_this_cycle = false;
        self.waiting_reannounce_reset();

        self.cycle_current_upload = 0.0;
        self.cycle_progress = 0.0;
        self.cycle_time_progress = 0.0;
        self.cycle_avg_speed = 0.0;
        self.estimated_completion = 0.0;

        // New cycle: let the applied limit move freely again.
        self.smoother.reset();
    }

    fn waiting_reannounce_reset(&mut self) {
        self.waiting_for_reannounce = false;
    }

    /// Refresh the cycle progress numbers used by the trigger and the UI.
    pub fn update_cycle_progress(&mut self, target_speed: f64, safety_margin: f64, now: f64) {
        let interval = f64::from(self.announce_interval_secs(now));

        let mut time_left = self.time_left(now);
        if interval > 0.0 && (time_left < 0.0 || time_left > interval) {
            time_left = time_left.clamp(0.0, interval);
        }

        if self.cycle_start_time <= 0.0 {
            self.cycle_start_time = if interval > 0.0 && time_left > 0.0 && time_left < interval {
                now - (interval - time_left)
            } else {
                now
            };
            if self.cycle_start_uploaded == 0 {
                self.cycle_start_uploaded = self.total_uploaded;
            }
        }

        let this_time = (now - self.cycle_start_time).max(0.0);

        self.cycle_time_progress = if interval > 0.0 {
            (this_time / interval).clamp(0.0, 1.0)
        } else {
            0.0
        };

        self.cycle_current_upload =
            self.total_uploaded.saturating_sub(self.cycle_start_uploaded) as f64;

        self.cycle_target_upload = target_speed * interval * (1.0 - safety_margin);

        self.cycle_progress = if self.cycle_target_upload > 0.0 {
            self.cycle_current_upload / self.cycle_target_upload
        } else {
            0.0
        };

        self.cycle_avg_speed = if this_time > 0.0 {
            self.cycle_current_upload / this_time
        } else {
            self.kalman.speed.max(0.0)
        };

        self.estimated_completion = if time_left > 0.0 && self.kalman.speed > 0.0 {
            let total_expected = self.cycle_current_upload + self.kalman.predict_upload(time_left);
            if self.cycle_target_upload > 0.0 {
                total_expected / self.cycle_target_upload
            } else {
                1.0
            }
        } else {
            self.cycle_progress
        };
    }

    /// Record a progress sample for the announce-time optimizer.
    pub fn push_detail_progress(&mut self, uploaded: u64, done: u64, now: f64) {
        if self.detail_progress.len() == DETAIL_PROGRESS {
            self.detail_progress.pop_front();
        }
        self.detail_progress.push_back((uploaded, done, now));
    }
}

fn truncated(name: &str) -> &str {
    let end = name
        .char_indices()
        .nth(20)
        .map_or(name.len(), |(idx, _)| idx);
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> TorrentState {
        TorrentState::new("aabbcc", "Some.Release.2160p", "tracker.example.org")
    }

    #[test]
    fn time_left_prefers_last_announce() {
        let mut s = state();
        let now = 10_000.0;
        s.cycle_synced = true;
        s.cycle_interval = 1800.0;
        s.last_announce_time = Some(now - 600.0);
        assert!((s.time_left(now) - 1200.0).abs() < 1e-9);
    }

    #[test]
    fn time_left_extrapolates_cached_remaining() {
        let mut s = state();
        let now = 10_000.0;
        s.cached_tl = 300.0;
        s.cache_ts = now - 100.0;
        assert!((s.time_left(now) - 200.0).abs() < 1e-9);
        assert!((s.time_left(now + 500.0) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn time_left_unknown_without_data() {
        let s = state();
        assert!((s.time_left(123.0) - UNKNOWN_TIME_LEFT).abs() < f64::EPSILON);
    }

    #[test]
    fn interval_hint_adopted_only_at_or_above_300() {
        let mut s = state();
        s.sync_cycle(0, 1000.0, None, Some(60));
        assert!(!s.cycle_synced);
        assert_eq!(s.announce_interval, None);

        s.sync_cycle(0, 1001.0, None, Some(1800));
        assert!(s.cycle_synced);
        assert!((s.cycle_interval - 1800.0).abs() < f64::EPSILON);
    }

    #[test]
    fn seconds_remaining_and_absolute_next_announce_both_cache() {
        let mut s = state();
        let now = 2_000_000_000.0;
        s.sync_cycle(0, now, Some(600.0), None);
        assert_eq!(s.next_announce_time, Some(now + 600.0));
        assert!((s.cached_tl - 600.0).abs() < f64::EPSILON);

        let mut s2 = state();
        s2.sync_cycle(0, now, Some(now + 900.0), None);
        assert_eq!(s2.next_announce_time, Some(now + 900.0));
        assert!((s2.cached_tl - 900.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rollover_detected_on_remaining_jump() {
        let mut s = state();
        let mut now = 1_000_000.0;
        s.time_added = now - 86_400.0 * 40.0;
        // First poll initializes the cycle.
        s.sync_cycle(1000, now, Some(600.0), Some(1800));
        assert_eq!(s.jump_count, 0);
        // Remaining decays normally: no jump.
        now += 300.0;
        s.sync_cycle(2000, now, Some(300.0), None);
        assert_eq!(s.jump_count, 0);
        // Announce happened: remaining springs back up.
        now += 310.0;
        s.sync_cycle(3000, now, Some(1790.0), None);
        assert_eq!(s.jump_count, 1);
        assert_eq!(s.cycle_start_uploaded, 3000);
        assert_eq!(s.last_announce_time, Some(now));
        assert!(!s.reannounced_this_cycle);
    }

    #[test]
    fn measured_intervals_update_cycle_via_median() {
        let mut s = state();
        let mut now = 1_000_000.0;
        s.time_added = now - 86_400.0 * 40.0;
        s.sync_cycle(0, now, Some(10.0), None);
        // Four rollovers; the first one only establishes the jump baseline,
        // the rest measure ~1802, ~1903 and ~1754 second periods.
        for (step, gap) in [
            (1700.0, 1.0),
            (1800.0, 2.0),
            (1900.0, 3.0),
            (1750.0, 4.0),
        ] {
            now += gap;
            s.sync_cycle(0, now, Some(5.0), None);
            now += step;
            s.sync_cycle(0, now, Some(1800.0), None);
        }
        assert!(s.cycle_synced);
        // Median of [1754, 1802, 1903] is 1802.
        assert!((s.cycle_interval - 1802.0).abs() < 10.0, "{}", s.cycle_interval);
    }

    #[test]
    fn rollover_near_forced_reannounce_not_measured() {
        let mut s = state();
        let mut now = 1_000_000.0;
        s.sync_cycle(0, now, Some(600.0), Some(1800));
        now += 60.0;
        s.last_force_reannounce = now;
        now += 30.0;
        // Jump right after a forced reannounce.
        s.sync_cycle(0, now, Some(1800.0), None);
        assert_eq!(s.jump_count, 1);
        assert!(s.interval_samples.is_empty());
    }

    #[test]
    fn fresh_torrent_counts_upload_from_zero() {
        let mut s = state();
        let now = 1_000_000.0;
        s.time_added = now - 120.0;
        s.announce_interval = Some(1800);
        s.sync_cycle(50_000, now, Some(1700.0), Some(1800));
        assert_eq!(s.cycle_start_uploaded, 0);
    }

    #[test]
    fn mid_cycle_discovery_reconstructs_cycle_start() {
        let mut s = state();
        let now = 1_000_000.0;
        s.time_added = now - 86_400.0;
        s.sync_cycle(10_000, now, Some(600.0), Some(1800));
        // 1800 - 600 = 1200 s already elapsed in this cycle.
        assert!((s.cycle_start_time - (now - 1200.0)).abs() < 1.0);
    }

    #[test]
    fn progress_tracks_target_and_clamps_time() {
        let mut s = state();
        let now = 1_000_000.0;
        s.time_added = now - 86_400.0;
        s.sync_cycle(0, now, Some(900.0), Some(1800));
        s.total_uploaded = 9_000_000;
        s.update_cycle_progress(10_000.0, 0.1, now + 60.0);
        // Target = 10_000 * 1800 * 0.9 = 16.2 MB.
        assert!((s.cycle_target_upload - 16_200_000.0).abs() < 1.0);
        assert!(s.cycle_progress > 0.5 && s.cycle_progress < 0.6);
        assert!(s.cycle_time_progress > 0.0 && s.cycle_time_progress <= 1.0);
    }

    #[test]
    fn rollover_records_precision_sample() {
        let mut s = state();
        let mut now = 1_000_000.0;
        s.time_added = now - 86_400.0 * 40.0;
        s.sync_cycle(0, now, Some(30.0), Some(1800));
        s.update_cycle_progress(10_000.0, 0.0, now);
        s.total_uploaded = 18_000_000;
        s.update_cycle_progress(10_000.0, 0.0, now + 20.0);
        assert!(s.cycle_target_upload > 0.0);
        now += 40.0;
        s.sync_cycle(18_000_000, now, Some(1800.0), None);
        assert_eq!(s.jump_count, 1);
        assert!(s.precision.precision_rate() > 0.0);
    }

    #[test]
    fn serde_round_trip_preserves_cycle_basis() {
        let mut s = state();
        let now = 1_000_000.0;
        s.sync_cycle(5000, now, Some(700.0), Some(1800));
        let json = serde_json::to_string(&s).expect("serialize");
        let mut restored: TorrentState = serde_json::from_str(&json).expect("deserialize");
        restored.enforce_caps();
        assert_eq!(restored.hash, s.hash);
        assert!((restored.cycle_interval - 1800.0).abs() < f64::EPSILON);
        assert_eq!(restored.cycle_start_uploaded, s.cycle_start_uploaded);
        assert!((restored.cached_tl - 700.0).abs() < f64::EPSILON);
    }
}
