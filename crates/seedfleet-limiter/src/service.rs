use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use seedfleet_data::{
    NewSpeedLimitRecord, SpeedLimitSiteEntity, Store, StoreTransaction, SPEED_LIMITER_STATE_KEY,
};
use seedfleet_downloader::{
    tracker_domain, DownloaderClient, ListOptions, Session, Torrent, TorrentStatus,
};
use seedfleet_events::{Event, EventBus};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::core::{
    announce_optimizer_action, calculate_limit, download_brake, estimate_announce_interval,
    should_reannounce, suggested_interval, BrakeAction, OptimizerAction, Phase, TorrentState,
};
use crate::sites::{
    fetch_peerlist_seconds, next_announce_untrusted, peerlist_last_announce, search_tid_by_hash,
    SiteCache,
};

/// How long a status snapshot stays fresh.
const STATUS_CACHE_TTL: f64 = 2.0;

/// Minimum cycle seconds before the brake reacts to a torrent's ETA.
const BRAKE_MIN_TIME: f64 = 120.0;

/// Result of one limiter tick.
#[derive(Debug, Clone, Copy)]
pub struct TickSummary {
    /// Whether the limiter is enabled at all.
    pub enabled: bool,
    /// Torrents currently under active control (non-idle).
    pub controlled: usize,
    /// Suggested delay before the next tick, seconds.
    pub next_interval: f64,
}

/// Per-torrent announce-cycle controller service.
///
/// Owns the full limiter state (persisted as one JSON blob), the per-site
/// scrape caches and the PT-site HTTP client. One tick walks every enabled
/// downloader that opts into speed control, advances every active torrent's
/// controller, applies the computed caps and writes the bandwidth ledger in a
/// single transaction.
pub struct LimiterService {
    store: Store,
    events: EventBus,
    http: reqwest::Client,
    user_agent: String,
    states: HashMap<String, TorrentState>,
    site_cache: SiteCache,
    status_cache: Option<(f64, serde_json::Value)>,
}

impl LimiterService {
    /// Build the service with a shared PT-site HTTP client.
    #[must_use]
    pub fn new(store: Store, events: EventBus, user_agent: String, verify_tls: bool) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(!verify_tls)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .unwrap_or_default();
        Self {
            store,
            events,
            http,
            user_agent,
            states: HashMap::new(),
            site_cache: SiteCache::new(),
            status_cache: None,
        }
    }

    /// Restore the persisted per-torrent state before the first tick.
    ///
    /// # Errors
    ///
    /// Returns storage failures; a corrupt blob is dropped with a warning.
    pub async fn load_state(&mut self) -> Result<()> {
        let Some(raw) = self.store.get_setting(SPEED_LIMITER_STATE_KEY).await? else {
            return Ok(());
        };
        match serde_json::from_str::<HashMap<String, TorrentState>>(&raw) {
            Ok(mut states) => {
                for state in states.values_mut() {
                    state.enforce_caps();
                }
                info!(torrents = states.len(), "limiter state restored");
                self.states = states;
            }
            Err(err) => {
                warn!(error = %err, "persisted limiter state unreadable; starting fresh");
            }
        }
        Ok(())
    }

    /// Direct access to the live state map (status endpoints and tests).
    #[must_use]
    pub fn states(&self) -> &HashMap<String, TorrentState> {
        &self.states
    }

    /// One control pass over every opted-in downloader.
    ///
    /// Failures with a single downloader are contained: the tick reports it
    /// offline and moves on. All ledger writes and the state snapshot commit
    /// together at the end.
    ///
    /// # Errors
    ///
    /// Returns storage failures only; adapter failures never escape the tick.
    pub async fn tick(&mut self) -> Result<TickSummary> {
        let Some(config) = self.store.speed_limit_config().await? else {
            return Ok(TickSummary {
                enabled: false,
                controlled: 0,
                next_interval: 5.0,
            });
        };
        if !config.enabled {
            return Ok(TickSummary {
                enabled: false,
                controlled: 0,
                next_interval: 5.0,
            });
        }

        let site_rules: HashMap<String, SpeedLimitSiteEntity> = self
            .store
            .list_site_rules()
            .await?
            .into_iter()
            .map(|site| (site.tracker_domain.clone(), site))
            .collect();

        let downloaders: Vec<_> = self
            .store
            .list_downloaders(true)
            .await?
            .into_iter()
            .filter(|d| d.auto_speed_limit)
            .collect();

        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        self.site_cache.cleanup(now);

        let mut tx = self.store.begin().await.context("begin limiter tick")?;

        for downloader in &downloaders {
            let session = match Session::open(&downloader.client_config()).await {
                Ok(session) => session,
                Err(err) => {
                    warn!(downloader = %downloader.name, error = %err, "downloader unreachable");
                    self.events.publish(Event::DownloaderOffline {
                        downloader: downloader.name.clone(),
                    });
                    continue;
                }
            };

            let torrents = match session
                .client()
                .torrents(ListOptions {
                    with_reannounce: true,
                })
                .await
            {
                Ok(torrents) => torrents,
                Err(err) => {
                    warn!(downloader = %downloader.name, error = %err, "torrent listing failed");
                    self.events.publish(Event::DownloaderOffline {
                        downloader: downloader.name.clone(),
                    });
                    session.close().await;
                    continue;
                }
            };

            for torrent in torrents.iter().filter(|t| t.status.is_active()) {
                let mut tracker = tracker_domain(&torrent.tracker);
                if tracker.is_empty() {
                    // Some listings omit the tracker until asked explicitly.
                    if let Ok(Some(url)) = session.client().tracker_url(&torrent.hash).await {
                        tracker = tracker_domain(&url);
                    }
                }
                if tracker.is_empty() {
                    continue;
                }
                let site_rule = site_rules.get(&tracker);
                let (target, margin, limit_download, optimize_announce) = site_rule.map_or(
                    (
                        config.target_upload_speed,
                        config.safety_margin,
                        false,
                        false,
                    ),
                    |site| {
                        (
                            site.target_upload_speed,
                            site.safety_margin,
                            site.limit_download_speed,
                            site.optimize_announce,
                        )
                    },
                );

                if let Err(err) = self
                    .control_torrent(
                        &mut tx,
                        session.client(),
                        downloader.id,
                        torrent,
                        &tracker,
                        site_rule,
                        target,
                        margin,
                        limit_download,
                        optimize_announce,
                        now,
                    )
                    .await
                {
                    debug!(
                        torrent = %torrent.name,
                        error = %err,
                        "per-torrent control step failed; next tick retries"
                    );
                }
            }

            session.close().await;
        }

        let serialized =
            serde_json::to_string(&self.states).context("serialize limiter state")?;
        self.store
            .set_setting_tx(&mut tx, SPEED_LIMITER_STATE_KEY, &serialized)
            .await?;
        tx.commit().await.context("commit limiter tick")?;

        let controlled = self
            .states
            .values()
            .filter(|s| s.phase != Phase::Idle)
            .count();
        self.status_cache = None;
        Ok(TickSummary {
            enabled: true,
            controlled,
            next_interval: self.suggested_next_interval(now),
        })
    }

    /// Advance one torrent: resolve the cycle, run the controller, apply the
    /// outcome and account the bandwidth delta.
    #[allow(clippy::too_many_arguments, clippy::too_many_lines)]
    async fn control_torrent(
        &mut self,
        tx: &mut StoreTransaction,
        client: &dyn DownloaderClient,
        downloader_id: i64,
        torrent: &Torrent,
        tracker: &str,
        site_rule: Option<&SpeedLimitSiteEntity>,
        target: f64,
        margin: f64,
        limit_download: bool,
        optimize_announce: bool,
        now: f64,
    ) -> Result<()> {
        let state = self
            .states
            .entry(torrent.hash.clone())
            .or_insert_with(|| TorrentState::new(&torrent.hash, &torrent.name, tracker));
        state.name.clone_from(&torrent.name);
        state.tracker = tracker.to_string();
        state.total_size = torrent.size;
        state.seeding_time = torrent.seeding_time;
        if let Some(added) = torrent.added_time {
            state.time_added = added.timestamp() as f64;
        }

        // Without a target the controller stays out, but the ledger still
        // accounts the transfer deltas for the dashboards.
        if target <= 0.0 {
            state.total_uploaded = torrent.uploaded;
            state.phase = Phase::Idle;
            Self::write_ledger_row(
                &self.store,
                tx,
                state,
                torrent,
                tracker,
                downloader_id,
                0.0,
                "disabled",
            )
            .await?;
            return Ok(());
        }

        state.total_done = if torrent.completed > 0 {
            torrent.completed
        } else {
            torrent.downloaded
        };
        state.total_size_torrent = torrent.total_size;
        state.download_speed = torrent.download_speed as f64;
        let remaining = state.total_size_torrent.saturating_sub(state.total_done);
        state.eta = if torrent.download_speed > 0 && remaining > 0 {
            (remaining / torrent.download_speed) as i64
        } else {
            0
        };

        if optimize_announce || limit_download {
            state.push_detail_progress(torrent.uploaded, state.total_done, now);
        }

        let mut next_announce = torrent.next_announce_time;
        let interval_hint = torrent.announce_interval;

        // Keep a previously observed absolute time when the poll lost it.
        if next_announce.is_none() {
            if let Some(saved) = state.next_announce_time {
                if saved > now {
                    next_announce = Some(saved);
                }
            }
        }

        let cycle_interval =
            self.resolve_cycle_interval(&torrent.hash, site_rule, interval_hint, now).await;

        // Reliability check on the client's next-announce; on distrust fall
        // back to the peer-list probe to rebuild the cycle baseline.
        let state = self
            .states
            .get_mut(&torrent.hash)
            .expect("state inserted above");
        if let Some(next) = next_announce {
            if next > now && cycle_interval > 0 {
                let untrusted =
                    next_announce_untrusted(state, next - now, f64::from(cycle_interval), now);
                if untrusted {
                    if let Some(site) = site_rule.filter(|s| s.peerlist_enabled) {
                        if let Some(last) = self
                            .probe_last_announce(site, &torrent.hash, f64::from(cycle_interval), now)
                            .await
                        {
                            let state = self
                                .states
                                .get_mut(&torrent.hash)
                                .expect("state present");
                            state.last_announce_time = Some(last);
                            next_announce = Some(last + f64::from(cycle_interval));
                            debug!(
                                torrent = %torrent.name,
                                "next-announce untrusted; rebuilt from peer list"
                            );
                        }
                    }
                }
            }
        }

        let state = self
            .states
            .get_mut(&torrent.hash)
            .expect("state present");

        state.sync_cycle(torrent.uploaded, now, next_announce, Some(cycle_interval));

        let is_downloading = torrent.status == TorrentStatus::Downloading;
        let eta = state.eta;
        let raw_limit = calculate_limit(
            state,
            torrent.upload_speed as f64,
            target,
            now,
            margin,
            is_downloading,
            eta,
        );
        let limit = if raw_limit > 0 {
            state.smoother.smooth(raw_limit, state.phase)
        } else {
            state.smoother.reset();
            0
        };

        // Opportunistic reannounce against the margin-adjusted target.
        let adjusted_target = target * (1.0 - margin.max(0.0));
        if let Some(reason) = should_reannounce(state, torrent.uploaded, adjusted_target, now) {
            match client.reannounce(&torrent.hash).await {
                Ok(()) => {
                    state.last_reannounce = now;
                    state.reannounced_this_cycle = true;
                    state.last_announce_time = Some(now);
                    info!(torrent = %torrent.name, reason, "forced reannounce");
                }
                Err(err) => debug!(torrent = %torrent.name, error = %err, "reannounce failed"),
            }
        }

        if limit != state.current_limit {
            client.set_upload_limit(&torrent.hash, limit).await?;
            let old = state.current_limit;
            state.current_limit = limit;
            if (old == 0) != (limit == 0) {
                self.events.publish(Event::SpeedLimit {
                    tracker: tracker.to_string(),
                    torrent: torrent.name.clone(),
                    limit_bps: limit,
                    phase: state.phase.as_str().to_string(),
                });
            }
        }

        if limit_download && is_downloading {
            let this_time = state.this_time(now);
            let this_up = torrent.uploaded.saturating_sub(state.cycle_start_uploaded);
            if this_time > 0.0 && this_up > 0 {
                let action = download_brake(
                    state,
                    this_time,
                    this_up,
                    state.total_size_torrent,
                    state.total_done,
                    state.eta,
                    state.current_download_limit,
                    state.download_speed,
                    BRAKE_MIN_TIME,
                );
                match action {
                    Some(BrakeAction::Cap(kb)) => {
                        client
                            .set_download_limit(&torrent.hash, (kb as u64) * 1024)
                            .await?;
                        state.current_download_limit = kb;
                        info!(torrent = %torrent.name, limit_kb = kb, "download brake engaged");
                    }
                    Some(BrakeAction::Release) => {
                        client.set_download_limit(&torrent.hash, 0).await?;
                        state.current_download_limit = -1;
                        info!(torrent = %torrent.name, "download brake released");
                    }
                    None => {}
                }
            }
        }

        if optimize_announce && is_downloading {
            let this_time = state.this_time(now);
            let this_up = torrent.uploaded.saturating_sub(state.cycle_start_uploaded);
            let interval = state.announce_interval_secs(now);
            match announce_optimizer_action(state, this_time, this_up, interval, now) {
                Some(OptimizerAction::WaitWithLimit(kb)) => {
                    client
                        .set_upload_limit(&torrent.hash, (kb as u64) * 1024)
                        .await?;
                    state.waiting_for_reannounce = true;
                    state.current_upload_limit = kb;
                    info!(torrent = %torrent.name, limit_kb = kb, "armed announce-time wait");
                }
                Some(OptimizerAction::Reannounce) => {
                    if now - state.last_force_reannounce >= 900.0 {
                        client.reannounce(&torrent.hash).await?;
                        state.last_force_reannounce = now;
                        state.waiting_for_reannounce = false;
                        client.set_upload_limit(&torrent.hash, 0).await?;
                        state.current_upload_limit = -1;
                        info!(torrent = %torrent.name, "announce-time optimizer fired");
                    }
                }
                None => {}
            }
        }

        let phase_label = state.phase.as_str();
        Self::write_ledger_row(
            &self.store,
            tx,
            state,
            torrent,
            tracker,
            downloader_id,
            target,
            phase_label,
        )
        .await?;
        Ok(())
    }

    /// Resolve the effective cycle interval for a torrent.
    ///
    /// Order: per-site fixed override, age-derived convention for flagged
    /// sites (publish time first, resolved through the site search when
    /// allowed), the client-reported interval, then the state's own estimate.
    async fn resolve_cycle_interval(
        &mut self,
        hash: &str,
        site_rule: Option<&SpeedLimitSiteEntity>,
        interval_hint: Option<u32>,
        now: f64,
    ) -> u32 {
        if let Some(site) = site_rule {
            if site.custom_announce_interval > 0 {
                return site.custom_announce_interval as u32;
            }
            if site.age_based_interval {
                let min_interval = interval_hint.map_or(300, |hint| hint.max(300));
                let publish = self.ensure_publish_time(site, hash, now).await;
                let state = self.states.get_mut(hash).expect("state present");
                if let Some(publish_ts) = publish {
                    state.publish_time = Some(publish_ts);
                }
                let estimated = state.publish_time.map_or_else(
                    || {
                        estimate_announce_interval(
                            state.time_added,
                            min_interval,
                            state.seeding_time,
                            false,
                            now,
                        )
                    },
                    |publish_ts| {
                        estimate_announce_interval(
                            publish_ts,
                            min_interval,
                            state.seeding_time,
                            true,
                            now,
                        )
                    },
                );
                // Until rollovers have measured the true period, the estimate
                // overrides whatever an older run recorded.
                if state.interval_samples.len() < 2
                    && (!state.cycle_synced
                        || state.cycle_interval <= 0.0
                        || (state.cycle_interval - f64::from(estimated)).abs() > 60.0)
                {
                    state.cycle_interval = f64::from(estimated);
                    state.cycle_synced = true;
                }
                state.announce_interval = Some(estimated);
                return estimated;
            }
        }

        let state = self.states.get_mut(hash).expect("state present");
        if let Some(hint) = interval_hint {
            if hint >= 300 {
                if !state.cycle_synced || state.cycle_interval <= 0.0 {
                    state.cycle_interval = f64::from(hint);
                    state.cycle_synced = true;
                }
                return hint;
            }
        }
        state.announce_interval_secs(now)
    }

    /// Publish time from the cache, the state, or a site search.
    async fn ensure_publish_time(
        &mut self,
        site: &SpeedLimitSiteEntity,
        hash: &str,
        now: f64,
    ) -> Option<f64> {
        if let Some(cached) = self.site_cache.publish_time(hash) {
            return Some(cached);
        }
        if let Some(known) = self.states.get(hash).and_then(|s| s.publish_time) {
            return Some(known);
        }
        if !site.peerlist_enabled {
            return None;
        }
        let (tid, publish) =
            search_tid_by_hash(&self.http, site, hash, &self.user_agent, now).await;
        if let Some(tid) = tid {
            self.site_cache.store_tid(hash, tid);
        }
        if let Some(ts) = publish {
            self.site_cache.store_publish_time(hash, ts);
        }
        publish
    }

    /// Reconstruct the last announce instant from the peer-list page.
    async fn probe_last_announce(
        &mut self,
        site: &SpeedLimitSiteEntity,
        hash: &str,
        cycle_interval: f64,
        now: f64,
    ) -> Option<f64> {
        let seconds = if let Some(cached) =
            self.site_cache
                .peerlist_seconds(hash, &site.peerlist_time_mode, now)
        {
            cached
        } else {
            let cached_tid = self.site_cache.tid(hash).map(str::to_owned);
            let tid = match cached_tid {
                Some(tid) => tid,
                None => {
                    let (tid, publish) =
                        search_tid_by_hash(&self.http, site, hash, &self.user_agent, now).await;
                    if let Some(ts) = publish {
                        self.site_cache.store_publish_time(hash, ts);
                    }
                    let tid = tid?;
                    self.site_cache.store_tid(hash, tid.clone());
                    tid
                }
            };
            let fetched =
                fetch_peerlist_seconds(&self.http, site, &tid, &self.user_agent).await?;
            self.site_cache.store_peerlist_seconds(hash, now, fetched);
            fetched
        };
        Some(peerlist_last_announce(
            seconds,
            &site.peerlist_time_mode,
            cycle_interval,
            now,
        ))
    }

    /// Write a bandwidth-ledger row when the deltas are non-zero.
    #[allow(clippy::too_many_arguments)]
    async fn write_ledger_row(
        store: &Store,
        tx: &mut StoreTransaction,
        state: &mut TorrentState,
        torrent: &Torrent,
        tracker: &str,
        downloader_id: i64,
        target: f64,
        phase: &str,
    ) -> Result<()> {
        // First sight of an existing torrent: set the cursors without
        // crediting the whole session history to this tick.
        if state.last_record_uploaded == 0 && torrent.uploaded > 0 {
            state.last_record_uploaded = torrent.uploaded;
        }
        if state.last_record_downloaded == 0 && torrent.downloaded > 0 {
            state.last_record_downloaded = torrent.downloaded;
        }

        let delta_up = torrent.uploaded.saturating_sub(state.last_record_uploaded);
        let delta_down = torrent
            .downloaded
            .saturating_sub(state.last_record_downloaded);
        state.last_record_uploaded = torrent.uploaded;
        state.last_record_downloaded = torrent.downloaded;

        if delta_up == 0 && delta_down == 0 {
            return Ok(());
        }

        store
            .insert_speed_limit_record(
                tx,
                &NewSpeedLimitRecord {
                    tracker_domain: tracker.to_string(),
                    downloader_id,
                    current_speed: torrent.upload_speed as f64,
                    target_speed: target,
                    limit_applied: state.current_limit as f64,
                    phase: phase.to_string(),
                    uploaded: delta_up as i64,
                    downloaded: delta_down as i64,
                },
            )
            .await?;
        Ok(())
    }

    /// Suggested next tick delay from the minimum non-idle remaining time.
    fn suggested_next_interval(&self, now: f64) -> f64 {
        let min_left = self
            .states
            .values()
            .filter(|s| s.phase != Phase::Idle)
            .map(|s| s.time_left(now))
            .filter(|tl| *tl > 0.0)
            .fold(None::<f64>, |acc, tl| {
                Some(acc.map_or(tl, |current| current.min(tl)))
            });
        suggested_interval(min_left)
    }

    /// Remove every applied cap and reset the controller state.
    ///
    /// # Errors
    ///
    /// Returns storage failures; per-downloader adapter failures are logged.
    pub async fn clear_limits(&mut self) -> Result<()> {
        let downloaders = self.store.list_downloaders(true).await?;
        for downloader in downloaders {
            match Session::open(&downloader.client_config()).await {
                Ok(session) => {
                    if let Ok(torrents) = session.client().torrents(ListOptions::default()).await {
                        for torrent in torrents {
                            if let Err(err) =
                                session.client().set_upload_limit(&torrent.hash, 0).await
                            {
                                debug!(error = %err, "failed to lift limit");
                            }
                        }
                    }
                    session.close().await;
                }
                Err(err) => {
                    warn!(downloader = %downloader.name, error = %err, "unreachable during clear");
                }
            }
        }
        self.states.clear();
        self.store
            .set_setting(SPEED_LIMITER_STATE_KEY, "{}")
            .await?;
        info!("all speed limits cleared");
        Ok(())
    }

    /// Cached status summary for dashboards (2 s TTL).
    pub fn status(&mut self) -> serde_json::Value {
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        if let Some((cached_at, value)) = &self.status_cache {
            if now - cached_at < STATUS_CACHE_TTL {
                return value.clone();
            }
        }
        let torrents: Vec<serde_json::Value> = self
            .states
            .values()
            .map(|state| {
                json!({
                    "hash": state.hash,
                    "name": state.name,
                    "tracker": state.tracker,
                    "phase": state.phase.as_str(),
                    "time_left": state.time_left(now),
                    "cycle_interval": state.cycle_interval,
                    "cycle_progress": state.cycle_progress,
                    "cycle_time_progress": state.cycle_time_progress,
                    "cycle_avg_speed": state.cycle_avg_speed,
                    "estimated_completion": state.estimated_completion,
                    "current_limit": state.current_limit,
                })
            })
            .collect();
        let value = json!({
            "count": torrents.len(),
            "torrents": torrents,
        });
        self.status_cache = Some((now, value.clone()));
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seedfleet_data::{DownloaderEntity, SpeedLimitConfigEntity};
    use seedfleet_downloader::DownloaderKind;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_store() -> Store {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("open database");
        Store::from_pool(pool).await.expect("bootstrap")
    }

    fn service(store: Store) -> LimiterService {
        LimiterService::new(store, EventBus::with_capacity(16), "test-agent".into(), true)
    }

    #[tokio::test]
    async fn disabled_config_short_circuits() {
        let store = memory_store().await;
        let mut service = service(store);
        let summary = service.tick().await.expect("tick");
        assert!(!summary.enabled);
        assert!((summary.next_interval - 5.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn state_round_trips_through_the_store() {
        let store = memory_store().await;
        let mut service = service(store.clone());
        let mut state = TorrentState::new("aabb", "Demo", "t.example.org");
        state.cycle_interval = 1800.0;
        state.cycle_synced = true;
        service.states.insert("aabb".into(), state);

        let serialized = serde_json::to_string(&service.states).expect("serialize");
        store
            .set_setting(SPEED_LIMITER_STATE_KEY, &serialized)
            .await
            .expect("persist");

        let mut fresh = LimiterService::new(
            store,
            EventBus::with_capacity(4),
            "test-agent".into(),
            true,
        );
        fresh.load_state().await.expect("load");
        let restored = fresh.states().get("aabb").expect("state restored");
        assert!(restored.cycle_synced);
        assert!((restored.cycle_interval - 1800.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn corrupt_state_blob_starts_fresh() {
        let store = memory_store().await;
        store
            .set_setting(SPEED_LIMITER_STATE_KEY, "{not json")
            .await
            .expect("persist");
        let mut service = service(store);
        service.load_state().await.expect("load tolerates garbage");
        assert!(service.states().is_empty());
    }

    #[tokio::test]
    async fn unreachable_downloader_reports_offline_and_tick_survives() {
        let store = memory_store().await;
        store
            .set_speed_limit_config(&SpeedLimitConfigEntity {
                enabled: true,
                target_upload_speed: 10_485_760.0,
                safety_margin: 0.1,
                report_interval: 300,
            })
            .await
            .expect("config");
        store
            .insert_downloader(&DownloaderEntity {
                id: 0,
                name: "ghost".into(),
                kind: DownloaderKind::Qbittorrent,
                host: "127.0.0.1".into(),
                // Nothing listens here; connect fails fast.
                port: 1,
                username: String::new(),
                password: String::new(),
                use_tls: false,
                download_dir: String::new(),
                enabled: true,
                auto_reannounce: false,
                auto_delete: false,
                auto_speed_limit: true,
                first_last_priority: false,
                max_upload_kib: 0,
                max_download_kib: 0,
                max_active_downloads: 0,
                disk_space_warn_gib: 10,
            })
            .await
            .expect("downloader");

        let events = EventBus::with_capacity(8);
        let mut service = LimiterService::new(store, events.clone(), "agent".into(), true);
        let mut stream = events.subscribe(None);

        let summary = service.tick().await.expect("tick survives");
        assert!(summary.enabled);
        assert_eq!(summary.controlled, 0);

        let envelope = stream.next().await.expect("offline event");
        assert_eq!(envelope.event.kind(), "downloader_offline");
    }

    #[tokio::test]
    async fn status_snapshot_is_cached() {
        let store = memory_store().await;
        let mut service = service(store);
        service
            .states
            .insert("aa".into(), TorrentState::new("aa", "Demo", "t.example.org"));
        let first = service.status();
        assert_eq!(first["count"], 1);
        service.states.clear();
        // Within the TTL the stale snapshot is served.
        let second = service.status();
        assert_eq!(second["count"], 1);
    }
}
