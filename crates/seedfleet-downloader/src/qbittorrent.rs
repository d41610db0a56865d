//! qBittorrent WebUI adapter.
//!
//! Sessions are cookie-based: a form-POST login fills the jar, a 401 on any
//! later request triggers one silent re-login and a single retry. The
//! `reannounce` property and per-tracker `interval` feed the limiter's
//! announce probe; `min_announce` is deliberately never read.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::backoff::retry_idempotent;
use crate::model::normalize_next_announce;
use crate::{
    AddOptions, ClientConfig, DownloaderClient, DownloaderError, DownloaderStats, ListOptions,
    Torrent, TorrentSource, TorrentStatus,
};

/// Parallelism cap for per-torrent announce-info enrichment.
const ANNOUNCE_FETCH_CONCURRENCY: usize = 8;

/// List-poll attempts used to confirm an added torrent.
const ADD_CONFIRM_ATTEMPTS: u32 = 5;

pub(crate) struct QbClient {
    base: String,
    username: String,
    password: String,
    http: reqwest::Client,
    connected: AtomicBool,
}

impl QbClient {
    pub(crate) fn new(config: &ClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_default();
        Self {
            base: config.base_url(),
            username: config.username.clone(),
            password: config.password.clone(),
            http,
            connected: AtomicBool::new(false),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.base)
    }

    async fn login(&self) -> Result<(), DownloaderError> {
        let endpoint = "/api/v2/auth/login";
        let response = self
            .http
            .post(self.url(endpoint))
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(|err| DownloaderError::from_request(endpoint, &err))?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(DownloaderError::from_status(endpoint, status));
        }
        let body = response
            .text()
            .await
            .map_err(|err| DownloaderError::from_request(endpoint, &err))?;
        if body.trim() == "Ok." {
            return Ok(());
        }
        // Some installations run with auth disabled entirely.
        if self.username.is_empty() && self.password.is_empty() {
            let version = self
                .http
                .get(self.url("/api/v2/app/version"))
                .send()
                .await
                .map_err(|err| DownloaderError::from_request(endpoint, &err))?;
            if version.status().is_success() {
                return Ok(());
            }
        }
        Err(DownloaderError::AuthExpired {
            endpoint: endpoint.to_string(),
        })
    }

    /// Idempotent GET with retry/backoff and one silent re-login on 401.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<T, DownloaderError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(DownloaderError::NotConnected);
        }
        retry_idempotent(endpoint, || async {
            let response = self
                .http
                .get(self.url(endpoint))
                .query(query)
                .send()
                .await
                .map_err(|err| DownloaderError::from_request(endpoint, &err))?;
            let mut status = response.status().as_u16();
            let response = if status == 401 {
                debug!(endpoint, "qBittorrent session expired, re-logging in");
                self.login().await?;
                let retried = self
                    .http
                    .get(self.url(endpoint))
                    .query(query)
                    .send()
                    .await
                    .map_err(|err| DownloaderError::from_request(endpoint, &err))?;
                status = retried.status().as_u16();
                retried
            } else {
                response
            };
            if !(200..300).contains(&status) {
                return Err(DownloaderError::from_status(endpoint, status));
            }
            response
                .json::<T>()
                .await
                .map_err(|err| DownloaderError::Protocol {
                    endpoint: endpoint.to_string(),
                    reason: err.to_string(),
                })
        })
        .await
    }

    /// Mutating form POST. No backoff; one silent re-login on 401.
    async fn post_form(
        &self,
        endpoint: &str,
        form: &[(&str, String)],
    ) -> Result<(), DownloaderError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(DownloaderError::NotConnected);
        }
        let send = || async {
            self.http
                .post(self.url(endpoint))
                .form(form)
                .send()
                .await
                .map_err(|err| DownloaderError::from_request(endpoint, &err))
        };
        let response = send().await?;
        let mut status = response.status().as_u16();
        if status == 401 {
            self.login().await?;
            status = send().await?.status().as_u16();
        }
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(DownloaderError::from_status(endpoint, status))
        }
    }

    async fn enrich_announce(&self, torrents: &mut [Torrent]) {
        let active: Vec<String> = torrents
            .iter()
            .filter(|t| t.status.is_active())
            .map(|t| t.hash.clone())
            .collect();
        if active.is_empty() {
            return;
        }

        let results: Vec<(String, (Option<f64>, Option<u32>))> = stream::iter(active)
            .map(|hash| async move {
                let info = self.announce_info(&hash).await.unwrap_or((None, None));
                (hash, info)
            })
            .buffer_unordered(ANNOUNCE_FETCH_CONCURRENCY)
            .collect()
            .await;

        for (hash, (next, interval)) in results {
            if let Some(torrent) = torrents.iter_mut().find(|t| t.hash == hash) {
                if next.is_some() {
                    torrent.next_announce_time = next;
                }
                if interval.is_some() {
                    torrent.announce_interval = interval;
                }
            }
        }
    }
}

#[async_trait]
impl DownloaderClient for QbClient {
    async fn connect(&self) -> Result<(), DownloaderError> {
        self.login().await?;
        self.connected.store(true, Ordering::Relaxed);
        // Verify the cookie actually works before handing the session out.
        let check: Result<Vec<RawTorrent>, _> =
            self.get_json("/api/v2/torrents/info", &[("limit", "1")]).await;
        match check {
            Ok(_) => Ok(()),
            Err(err) => {
                self.connected.store(false, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            let _ = self
                .http
                .post(self.url("/api/v2/auth/logout"))
                .send()
                .await;
        }
    }

    async fn torrents(&self, opts: ListOptions) -> Result<Vec<Torrent>, DownloaderError> {
        let raw: Vec<RawTorrent> = self.get_json("/api/v2/torrents/info", &[]).await?;
        let now = Utc::now().timestamp() as f64;
        let mut torrents: Vec<Torrent> = raw.into_iter().map(|t| t.into_torrent(now)).collect();
        if opts.with_reannounce {
            self.enrich_announce(&mut torrents).await;
        }
        Ok(torrents)
    }

    async fn torrent(&self, hash: &str) -> Result<Option<Torrent>, DownloaderError> {
        let raw: Vec<RawTorrent> = self
            .get_json("/api/v2/torrents/info", &[("hashes", hash)])
            .await?;
        let now = Utc::now().timestamp() as f64;
        Ok(raw.into_iter().next().map(|t| t.into_torrent(now)))
    }

    async fn stats(&self) -> Result<DownloaderStats, DownloaderError> {
        let transfer: TransferInfo = self.get_json("/api/v2/transfer/info", &[]).await?;
        let torrents = self.torrents(ListOptions::default()).await?;
        let downloading = torrents
            .iter()
            .filter(|t| t.status == TorrentStatus::Downloading)
            .count();
        let seeding = torrents
            .iter()
            .filter(|t| t.status == TorrentStatus::Seeding)
            .count();
        Ok(DownloaderStats {
            upload_speed: transfer.up_info_speed,
            download_speed: transfer.dl_info_speed,
            total_uploaded: transfer.up_info_data,
            total_downloaded: transfer.dl_info_data,
            free_space: self.free_space(None).await.unwrap_or(0),
            total_torrents: torrents.len(),
            active_torrents: downloading + seeding,
            downloading_torrents: downloading,
            seeding_torrents: seeding,
        })
    }

    async fn add(
        &self,
        source: TorrentSource,
        opts: AddOptions,
    ) -> Result<String, DownloaderError> {
        let endpoint = "/api/v2/torrents/add";
        let mut expected_hash = None;

        let existing: HashSet<String> = self
            .torrents(ListOptions::default())
            .await?
            .into_iter()
            .map(|t| t.hash)
            .collect();

        let mut form = reqwest::multipart::Form::new();
        match source {
            TorrentSource::Metainfo(bytes) => {
                expected_hash = crate::infohash_from_metainfo(&bytes);
                let part = reqwest::multipart::Part::bytes(bytes)
                    .file_name("payload.torrent")
                    .mime_str("application/x-bittorrent")
                    .map_err(|err| DownloaderError::Protocol {
                        endpoint: endpoint.to_string(),
                        reason: err.to_string(),
                    })?;
                form = form.part("torrents", part);
            }
            TorrentSource::Magnet(uri) => {
                form = form.text("urls", uri);
            }
        }
        if let Some(path) = &opts.save_path {
            form = form.text("savepath", path.clone());
        }
        if let Some(category) = &opts.category {
            form = form.text("category", category.clone());
        }
        if !opts.tags.is_empty() {
            form = form.text("tags", opts.tags.join(","));
        }
        if opts.paused {
            form = form.text("paused", "true");
        }
        if opts.upload_limit > 0 {
            form = form.text("upLimit", opts.upload_limit.to_string());
        }
        if opts.download_limit > 0 {
            form = form.text("dlLimit", opts.download_limit.to_string());
        }
        if opts.first_last_priority {
            form = form.text("firstLastPiecePrio", "true");
        }

        let response = self
            .http
            .post(self.url(endpoint))
            .multipart(form)
            .send()
            .await
            .map_err(|err| DownloaderError::from_request(endpoint, &err))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(DownloaderError::from_status(endpoint, status));
        }

        // The add endpoint answers "Ok." without a hash; confirm by polling.
        for _ in 0..ADD_CONFIRM_ATTEMPTS {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if let Some(hash) = &expected_hash {
                if self.torrent(hash).await?.is_some() {
                    return Ok(hash.clone());
                }
            } else {
                let current = self.torrents(ListOptions::default()).await?;
                if let Some(new) = current.iter().find(|t| !existing.contains(&t.hash)) {
                    return Ok(new.hash.clone());
                }
            }
        }
        warn!("added torrent never appeared in qBittorrent's list");
        Err(DownloaderError::AddNotConfirmed {
            hash: expected_hash,
        })
    }

    async fn remove(&self, hash: &str, delete_files: bool) -> Result<(), DownloaderError> {
        self.post_form(
            "/api/v2/torrents/delete",
            &[
                ("hashes", hash.to_string()),
                ("deleteFiles", delete_files.to_string()),
            ],
        )
        .await
    }

    async fn pause(&self, hash: &str) -> Result<(), DownloaderError> {
        self.post_form("/api/v2/torrents/pause", &[("hashes", hash.to_string())])
            .await
    }

    async fn resume(&self, hash: &str) -> Result<(), DownloaderError> {
        self.post_form("/api/v2/torrents/resume", &[("hashes", hash.to_string())])
            .await
    }

    async fn reannounce(&self, hash: &str) -> Result<(), DownloaderError> {
        self.post_form(
            "/api/v2/torrents/reannounce",
            &[("hashes", hash.to_string())],
        )
        .await
    }

    async fn set_upload_limit(
        &self,
        hash: &str,
        bytes_per_s: u64,
    ) -> Result<(), DownloaderError> {
        self.post_form(
            "/api/v2/torrents/setUploadLimit",
            &[
                ("hashes", hash.to_string()),
                ("limit", bytes_per_s.to_string()),
            ],
        )
        .await
    }

    async fn set_download_limit(
        &self,
        hash: &str,
        bytes_per_s: u64,
    ) -> Result<(), DownloaderError> {
        self.post_form(
            "/api/v2/torrents/setDownloadLimit",
            &[
                ("hashes", hash.to_string()),
                ("limit", bytes_per_s.to_string()),
            ],
        )
        .await
    }

    async fn set_global_upload_limit(&self, bytes_per_s: u64) -> Result<(), DownloaderError> {
        self.post_form(
            "/api/v2/transfer/setUploadLimit",
            &[("limit", bytes_per_s.to_string())],
        )
        .await
    }

    async fn set_global_download_limit(&self, bytes_per_s: u64) -> Result<(), DownloaderError> {
        self.post_form(
            "/api/v2/transfer/setDownloadLimit",
            &[("limit", bytes_per_s.to_string())],
        )
        .await
    }

    async fn pause_all(&self) -> Result<(), DownloaderError> {
        self.post_form("/api/v2/torrents/pause", &[("hashes", "all".to_string())])
            .await
    }

    async fn resume_all(&self) -> Result<(), DownloaderError> {
        self.post_form("/api/v2/torrents/resume", &[("hashes", "all".to_string())])
            .await
    }

    async fn free_space(&self, _path: Option<&str>) -> Result<u64, DownloaderError> {
        let maindata: MainData = self.get_json("/api/v2/sync/maindata", &[]).await?;
        Ok(maindata.server_state.free_space_on_disk)
    }

    async fn tracker_url(&self, hash: &str) -> Result<Option<String>, DownloaderError> {
        let trackers: Vec<RawTracker> = self
            .get_json("/api/v2/torrents/trackers", &[("hash", hash)])
            .await?;
        Ok(trackers
            .into_iter()
            .find(|t| t.tier >= 0 && !t.url.starts_with("**"))
            .map(|t| t.url))
    }

    async fn announce_info(
        &self,
        hash: &str,
    ) -> Result<(Option<f64>, Option<u32>), DownloaderError> {
        let now = Utc::now().timestamp() as f64;
        let mut best_next: Option<f64> = None;
        let mut best_interval: Option<u32> = None;

        // The per-torrent `reannounce` property is the primary source.
        if let Ok(props) = self
            .get_json::<TorrentProperties>("/api/v2/torrents/properties", &[("hash", hash)])
            .await
        {
            if props.reannounce > 0 {
                best_next = normalize_next_announce(props.reannounce as f64, now);
            }
        }

        // The trackers list is the backup for timing and the only source for
        // the real interval. min_announce is the forced-announce floor, not
        // the cycle; it must never be adopted.
        if let Ok(trackers) = self
            .get_json::<Vec<RawTracker>>("/api/v2/torrents/trackers", &[("hash", hash)])
            .await
        {
            for tracker in trackers {
                if tracker.tier < 0 || tracker.url.starts_with("**") {
                    continue;
                }
                if best_next.is_none() && tracker.next_announce > 0 {
                    best_next = normalize_next_announce(tracker.next_announce as f64, now);
                }
                if let Some(interval) = tracker.interval {
                    if interval >= 300 {
                        best_interval = Some(match best_interval {
                            // Multiple trackers: keep the smaller (conservative).
                            Some(current) => current.min(interval),
                            None => interval,
                        });
                    }
                }
            }
        }

        Ok((best_next, best_interval))
    }
}

#[derive(Debug, Deserialize)]
struct RawTorrent {
    #[serde(default)]
    hash: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    total_size: i64,
    #[serde(default)]
    completed: i64,
    #[serde(default)]
    uploaded: i64,
    #[serde(default)]
    downloaded: i64,
    #[serde(default)]
    ratio: f64,
    #[serde(default)]
    upspeed: i64,
    #[serde(default)]
    dlspeed: i64,
    #[serde(default)]
    num_complete: i64,
    #[serde(default)]
    num_incomplete: i64,
    #[serde(default)]
    num_seeds: i64,
    #[serde(default)]
    num_leechs: i64,
    #[serde(default)]
    tracker: String,
    #[serde(default)]
    tags: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    save_path: String,
    #[serde(default)]
    added_on: i64,
    #[serde(default)]
    completion_on: i64,
    #[serde(default)]
    seeding_time: i64,
    #[serde(default)]
    eta: i64,
    #[serde(default)]
    next_announce: Option<f64>,
}

impl RawTorrent {
    fn into_torrent(self, now: f64) -> Torrent {
        let status = map_state(&self.state);
        let total_size = if self.total_size > 0 {
            self.total_size
        } else {
            self.size
        };
        Torrent {
            hash: self.hash,
            name: self.name,
            size: self.size.max(0) as u64,
            total_size: total_size.max(0) as u64,
            completed: if self.completed > 0 {
                self.completed as u64
            } else {
                self.downloaded.max(0) as u64
            },
            progress: self.progress,
            status,
            state: self.state,
            uploaded: self.uploaded.max(0) as u64,
            downloaded: self.downloaded.max(0) as u64,
            ratio: self.ratio,
            upload_speed: self.upspeed.max(0) as u64,
            download_speed: self.dlspeed.max(0) as u64,
            seeders: self.num_complete,
            leechers: self.num_incomplete,
            seeds_connected: self.num_seeds,
            peers_connected: self.num_leechs,
            tracker: self.tracker,
            tracker_status: String::new(),
            tags: split_csv(&self.tags),
            category: self.category,
            save_path: self.save_path,
            added_time: timestamp_opt(self.added_on),
            completed_time: timestamp_opt(self.completion_on),
            seeding_time: self.seeding_time,
            eta: self.eta.max(0),
            next_announce_time: self
                .next_announce
                .and_then(|raw| normalize_next_announce(raw, now)),
            announce_interval: None,
        }
    }
}

fn map_state(state: &str) -> TorrentStatus {
    match state {
        "downloading" | "stalledDL" | "metaDL" | "forcedDL" => TorrentStatus::Downloading,
        "uploading" | "stalledUP" | "forcedUP" => TorrentStatus::Seeding,
        "pausedDL" | "pausedUP" | "stoppedDL" | "stoppedUP" => TorrentStatus::Paused,
        "queuedDL" | "queuedUP" => TorrentStatus::Queued,
        "checkingDL" | "checkingUP" | "checkingResumeData" | "moving" => TorrentStatus::Checking,
        _ => TorrentStatus::Error,
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn timestamp_opt(secs: i64) -> Option<DateTime<Utc>> {
    if secs > 0 {
        DateTime::<Utc>::from_timestamp(secs, 0)
    } else {
        None
    }
}

#[derive(Debug, Deserialize)]
struct TransferInfo {
    #[serde(default)]
    up_info_speed: u64,
    #[serde(default)]
    dl_info_speed: u64,
    #[serde(default)]
    up_info_data: u64,
    #[serde(default)]
    dl_info_data: u64,
}

#[derive(Debug, Deserialize)]
struct MainData {
    #[serde(default)]
    server_state: ServerState,
}

#[derive(Debug, Default, Deserialize)]
struct ServerState {
    #[serde(default)]
    free_space_on_disk: u64,
}

#[derive(Debug, Deserialize)]
struct TorrentProperties {
    #[serde(default)]
    reannounce: i64,
}

#[derive(Debug, Deserialize)]
struct RawTracker {
    #[serde(default)]
    url: String,
    #[serde(default = "default_tier")]
    tier: i64,
    #[serde(default)]
    next_announce: i64,
    #[serde(default)]
    interval: Option<u32>,
}

const fn default_tier() -> i64 {
    -1
}
