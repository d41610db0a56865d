use super::consts::{
    DOWNLOAD_LIMIT_ADJUST, DOWNLOAD_LIMIT_ETA_FACTOR, DOWNLOAD_LIMIT_MAX_KB,
    DOWNLOAD_LIMIT_MIN_TIME, MAX_AVG_UPLOAD_SPEED, OPTIMIZE_MIN_THIS_TIME, OPTIMIZE_RING_LEN,
    REANNOUNCE_MIN_INTERVAL, REANNOUNCE_WAIT_LIMIT_KB, STEADY_TIME,
};
use super::state::TorrentState;

/// Decide whether to force a reannounce now.
///
/// Allowed only when 900 s have passed since the last one, none happened this
/// cycle, and the announce is at most two minutes out. Fires either because
/// the prediction says the budget will blow and an early announce lands in
/// the first half of the remaining window, or because the cycle is ending
/// with the budget nearly met.
#[must_use]
pub fn should_reannounce(
    state: &TorrentState,
    total_uploaded: u64,
    target_speed: f64,
    now: f64,
) -> Option<&'static str> {
    if state.last_reannounce > 0.0 && now - state.last_reannounce < REANNOUNCE_MIN_INTERVAL {
        return None;
    }
    if state.reannounced_this_cycle {
        return None;
    }

    let time_left = state.time_left(now);
    if time_left <= 0.0 || time_left > STEADY_TIME {
        return None;
    }

    let cycle_uploaded = total_uploaded.saturating_sub(state.cycle_start_uploaded) as f64;
    let predicted = state.kalman.predict_upload(time_left);
    let expected_total = cycle_uploaded + predicted;

    let announce_interval = f64::from(state.announce_interval_secs(now));
    let target_upload = target_speed * announce_interval;

    if expected_total > target_upload * 1.05 {
        let avg_speed = state.kalman.speed;
        if avg_speed > 0.0 {
            let perfect_time = (target_upload - cycle_uploaded) / avg_speed;
            if perfect_time < time_left * 0.5 {
                return Some("optimized announce");
            }
        }
    }

    if time_left < 60.0 && cycle_uploaded > target_upload * 0.9 {
        return Some("cycle-end announce");
    }

    None
}

/// Result of a download-brake evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrakeAction {
    /// Apply (or adjust to) this download cap, in KB/s.
    Cap(i64),
    /// Remove the download cap.
    Release,
}

/// Download brake: keep the cycle-average upload speed under 50 MiB/s by
/// stretching a nearly finished download.
///
/// Completion triggers an announce, so an over-hot torrent about to finish
/// would report an illegal average. Capping the download pushes the finish
/// out until the average recovers.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn download_brake(
    state: &TorrentState,
    this_time: f64,
    this_up: u64,
    total_size: u64,
    total_done: u64,
    eta: i64,
    current_download_limit: i64,
    current_download_speed: f64,
    min_time: f64,
) -> Option<BrakeAction> {
    if this_time < DOWNLOAD_LIMIT_MIN_TIME {
        return None;
    }

    let avg_upload_speed = if this_time > 0.0 {
        this_up as f64 / this_time
    } else {
        0.0
    };

    if current_download_limit <= 0 {
        // No cap yet: engage when the average is illegal and completion is
        // imminent.
        if avg_upload_speed > MAX_AVG_UPLOAD_SPEED {
            let check_eta = if state.current_upload_limit > 0 {
                min_time * DOWNLOAD_LIMIT_ETA_FACTOR
            } else {
                min_time
            };
            if eta > 0 && (eta as f64) <= check_eta {
                let remaining = total_size.saturating_sub(total_done) as f64;
                // Stretch completion until the average drops legal again.
                let denominator = this_up as f64 / MAX_AVG_UPLOAD_SPEED - this_time + 30.0;
                if denominator > 0.0 {
                    let limit_kb = (remaining / denominator / 1024.0) as i64;
                    return Some(BrakeAction::Cap(limit_kb.clamp(1, DOWNLOAD_LIMIT_MAX_KB)));
                }
            }
        }
        return None;
    }

    if avg_upload_speed >= MAX_AVG_UPLOAD_SPEED {
        // Still hot: re-derive the cap, clamped to 1.5x moves per step.
        if current_download_speed / 1024.0 < 2.0 * current_download_limit as f64 {
            let remaining = total_size.saturating_sub(total_done) as f64;
            let denominator = this_up as f64 / MAX_AVG_UPLOAD_SPEED - this_time + 60.0;
            if denominator > 0.0 {
                let new_limit = ((remaining / denominator / 1024.0) as i64)
                    .min(DOWNLOAD_LIMIT_MAX_KB);
                let up_cap = (current_download_limit as f64 * DOWNLOAD_LIMIT_ADJUST) as i64;
                let down_cap = (current_download_limit as f64 / DOWNLOAD_LIMIT_ADJUST) as i64;
                if new_limit > up_cap {
                    return Some(BrakeAction::Cap(up_cap));
                } else if new_limit < down_cap {
                    return Some(BrakeAction::Cap(down_cap));
                }
            }
        }
        None
    } else {
        Some(BrakeAction::Release)
    }
}

/// Action chosen by the announce-time optimizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizerAction {
    /// Cap the upload at this many KB/s and wait for the right moment.
    WaitWithLimit(i64),
    /// Force the reannounce now.
    Reannounce,
}

/// Announce-time optimizer: choose the reannounce moment that maximizes
/// upload before a hot downloading torrent completes.
///
/// With the 50 MiB/s average ceiling in force, the last announce before
/// completion has an optimum position. Either arm a low wait-limit until the
/// earliest legal moment approaches that optimum, or fire the reannounce.
#[must_use]
pub fn announce_optimizer_action(
    state: &TorrentState,
    this_time: f64,
    this_up: u64,
    announce_interval: u32,
    now: f64,
) -> Option<OptimizerAction> {
    if this_time < OPTIMIZE_MIN_THIS_TIME {
        return None;
    }

    // Already armed: fire once the average is legal and the minimum spacing
    // has passed.
    if state.waiting_for_reannounce {
        if this_up as f64 / this_time < MAX_AVG_UPLOAD_SPEED && this_time >= REANNOUNCE_MIN_INTERVAL
        {
            return Some(OptimizerAction::Reannounce);
        }
        return None;
    }

    if state.detail_progress.len() < OPTIMIZE_RING_LEN {
        return None;
    }

    let first = state.detail_progress.front()?;
    let last = state.detail_progress.back()?;
    let time_span = last.2 - first.2;
    if time_span <= 0.0 {
        return None;
    }

    let avg_upload_speed = (last.0.saturating_sub(first.0)) as f64 / time_span;
    let avg_download_speed = (last.1.saturating_sub(first.1)) as f64 / time_span;

    if avg_upload_speed <= MAX_AVG_UPLOAD_SPEED || avg_download_speed <= 0.0 {
        return None;
    }

    let remaining = state
        .total_size_torrent
        .saturating_sub(state.total_done) as f64;
    if remaining <= 0.0 {
        return None;
    }

    let complete_time = remaining / avg_download_speed + now;
    let perfect_time =
        complete_time - f64::from(announce_interval) * MAX_AVG_UPLOAD_SPEED / avg_upload_speed;

    // Earliest instant a forced announce would still report a legal average.
    let earliest = if this_up as f64 / this_time > MAX_AVG_UPLOAD_SPEED {
        (this_up as f64 - MAX_AVG_UPLOAD_SPEED * this_time) / (45.0 * 1024.0 * 1024.0) + now
    } else {
        now
    };

    let cycle_start = now - this_time;
    if earliest - cycle_start < REANNOUNCE_MIN_INTERVAL {
        return None;
    }

    if earliest > perfect_time {
        if now >= earliest {
            if (this_up as f64 + avg_upload_speed * 20.0) / this_time > MAX_AVG_UPLOAD_SPEED {
                return Some(OptimizerAction::Reannounce);
            }
            return None;
        }

        if earliest < perfect_time + 60.0 {
            return Some(OptimizerAction::WaitWithLimit(REANNOUNCE_WAIT_LIMIT_KB));
        }

        // Compare expected upload for "force early" against "let it ride".
        let next_announce = state.time_left(now);
        let eta_if_forced = complete_time - earliest;
        if eta_if_forced < 120.0 {
            return None;
        }
        let forced_up = (earliest - now + this_time) * MAX_AVG_UPLOAD_SPEED
            + eta_if_forced * avg_upload_speed;
        let mut default_up = f64::from(announce_interval) * MAX_AVG_UPLOAD_SPEED;
        let eta_default = complete_time - (now + next_announce);
        if eta_default > 0.0 {
            default_up += eta_default * avg_upload_speed;
        }
        if forced_up > default_up {
            return Some(OptimizerAction::WaitWithLimit(REANNOUNCE_WAIT_LIMIT_KB));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: f64 = 1024.0 * 1024.0;

    fn synced_state(now: f64, interval: f64, time_left: f64) -> TorrentState {
        let mut state = TorrentState::new("aa", "Torrent", "t.example.org");
        state.cycle_synced = true;
        state.cycle_interval = interval;
        state.announce_interval = Some(interval as u32);
        state.cycle_start_time = now - (interval - time_left);
        state.cached_tl = time_left;
        state.cache_ts = now;
        state
    }

    /// Scenario S2: 18 MiB/s against a 10 MiB/s target with 15 GiB uploaded
    /// and the target total at 16.2 GiB; once inside the two-minute window a
    /// single reannounce fires.
    #[test]
    fn predicted_overshoot_triggers_a_single_reannounce() {
        let now = 1_000_000.0;
        let mut state = synced_state(now, 1800.0, 100.0);
        state.cycle_start_uploaded = 0;
        let uploaded = (15.0 * 1024.0 * MIB) as u64;
        state.total_uploaded = uploaded;
        // Establish the Kalman speed at 18 MiB/s.
        state.kalman.update(18.0 * MIB, now - 10.0);
        state.kalman.update(18.0 * MIB, now);

        // The margin-adjusted target (10 MiB/s at margin 0.1) gives the
        // 16.2 GiB cycle budget of the scenario.
        let reason = should_reannounce(&state, uploaded, 9.0 * MIB, now);
        assert_eq!(reason, Some("optimized announce"));

        // Stamped: nothing for at least 900 s.
        state.last_reannounce = now;
        state.reannounced_this_cycle = true;
        assert!(should_reannounce(&state, uploaded, 9.0 * MIB, now + 500.0).is_none());
    }

    #[test]
    fn outside_the_two_minute_window_nothing_fires() {
        let now = 1_000_000.0;
        let mut state = synced_state(now, 1800.0, 600.0);
        state.total_uploaded = u64::MAX / 2;
        assert!(should_reannounce(&state, state.total_uploaded, 10.0 * MIB, now).is_none());
    }

    #[test]
    fn cycle_end_squeeze_fires_under_sixty_seconds() {
        let now = 1_000_000.0;
        let mut state = synced_state(now, 1800.0, 50.0);
        state.cycle_start_uploaded = 0;
        let target = 10.0 * MIB;
        // 95% of target * interval uploaded, no overshoot prediction.
        let uploaded = (target * 1800.0 * 0.95) as u64;
        state.total_uploaded = uploaded;
        assert_eq!(
            should_reannounce(&state, uploaded, target, now),
            Some("cycle-end announce")
        );
    }

    #[test]
    fn brake_engages_on_hot_average_and_imminent_finish() {
        let now = 1_000_000.0;
        let state = synced_state(now, 1800.0, 900.0);
        let this_time = 600.0;
        let this_up = (60.0 * MIB * this_time) as u64; // 60 MiB/s average
        let action = download_brake(
            &state,
            this_time,
            this_up,
            100 * 1024 * 1024 * 1024,
            90 * 1024 * 1024 * 1024,
            60,
            0,
            80.0 * MIB,
            120.0,
        );
        match action {
            Some(BrakeAction::Cap(kb)) => {
                assert!(kb >= 1);
                assert!(kb <= DOWNLOAD_LIMIT_MAX_KB);
            }
            other => panic!("expected a cap, got {other:?}"),
        }
    }

    #[test]
    fn brake_releases_when_average_recovers() {
        let now = 1_000_000.0;
        let state = synced_state(now, 1800.0, 900.0);
        let this_time = 600.0;
        let this_up = (10.0 * MIB * this_time) as u64; // 10 MiB/s, legal
        let action = download_brake(
            &state,
            this_time,
            this_up,
            100 << 30,
            50 << 30,
            600,
            4096,
            10.0 * MIB,
            120.0,
        );
        assert_eq!(action, Some(BrakeAction::Release));
    }

    #[test]
    fn brake_adjustments_are_step_clamped() {
        let now = 1_000_000.0;
        let state = synced_state(now, 1800.0, 900.0);
        let this_time = 1000.0;
        let this_up = (55.0 * MIB * this_time) as u64; // still hot
        let current_limit = 1000; // KB/s
        let action = download_brake(
            &state,
            this_time,
            this_up,
            200 << 30,
            10 << 30,
            300,
            current_limit,
            500.0 * 1024.0,
            120.0,
        );
        if let Some(BrakeAction::Cap(kb)) = action {
            assert!(kb <= (current_limit as f64 * DOWNLOAD_LIMIT_ADJUST) as i64);
            assert!(kb >= (current_limit as f64 / DOWNLOAD_LIMIT_ADJUST) as i64);
        }
    }

    #[test]
    fn optimizer_waits_for_enough_history() {
        let now = 1_000_000.0;
        let mut state = synced_state(now, 1800.0, 900.0);
        state.total_size_torrent = 100 << 30;
        state.total_done = 10 << 30;
        for i in 0..10 {
            state.push_detail_progress(i * 1_000_000, i * 500_000, now - 50.0 + f64::from(i as u32));
        }
        assert!(announce_optimizer_action(&state, 1000.0, 60_000_000_000, 1800, now).is_none());
    }

    #[test]
    fn armed_optimizer_fires_once_average_recovers() {
        let now = 1_000_000.0;
        let mut state = synced_state(now, 1800.0, 900.0);
        state.waiting_for_reannounce = true;
        // Average 10 MiB/s over 1000 s, past the 900 s spacing: fire.
        let action =
            announce_optimizer_action(&state, 1000.0, (10.0 * MIB * 1000.0) as u64, 1800, now);
        assert_eq!(action, Some(OptimizerAction::Reannounce));
        // Average still hot: hold.
        let action =
            announce_optimizer_action(&state, 1000.0, (60.0 * MIB * 1000.0) as u64, 1800, now);
        assert!(action.is_none());
    }
}
