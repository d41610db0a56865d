//! Transmission RPC adapter.
//!
//! Transmission guards its RPC endpoint with a CSRF-style session header: the
//! first request earns a 409 carrying `X-Transmission-Session-Id`, which must
//! accompany every later call and is reissued whenever it expires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::debug;

use crate::backoff::retry_idempotent;
use crate::model::normalize_next_announce;
use crate::{
    AddOptions, ClientConfig, DownloaderClient, DownloaderError, DownloaderStats, ListOptions,
    Torrent, TorrentSource, TorrentStatus,
};

const SESSION_HEADER: &str = "X-Transmission-Session-Id";

const TORRENT_FIELDS: &[&str] = &[
    "hashString",
    "name",
    "totalSize",
    "sizeWhenDone",
    "haveValid",
    "percentDone",
    "status",
    "uploadedEver",
    "downloadedEver",
    "uploadRatio",
    "rateUpload",
    "rateDownload",
    "peersConnected",
    "peersGettingFromUs",
    "trackerStats",
    "labels",
    "downloadDir",
    "addedDate",
    "doneDate",
    "secondsSeeding",
    "eta",
    "errorString",
];

pub(crate) struct TransmissionClient {
    rpc_url: String,
    username: String,
    password: String,
    http: reqwest::Client,
    session_id: Mutex<String>,
    connected: AtomicBool,
}

impl TransmissionClient {
    pub(crate) fn new(config: &ClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_default();
        Self {
            rpc_url: format!("{}/transmission/rpc", config.base_url()),
            username: config.username.clone(),
            password: config.password.clone(),
            http,
            session_id: Mutex::new(String::new()),
            connected: AtomicBool::new(false),
        }
    }

    fn current_session_id(&self) -> String {
        self.session_id
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn store_session_id(&self, value: &str) {
        if let Ok(mut guard) = self.session_id.lock() {
            *guard = value.to_string();
        }
    }

    async fn send_once(
        &self,
        method: &str,
        arguments: &Value,
    ) -> Result<reqwest::Response, DownloaderError> {
        let mut request = self
            .http
            .post(&self.rpc_url)
            .header(SESSION_HEADER, self.current_session_id())
            .json(&json!({ "method": method, "arguments": arguments }));
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }
        request
            .send()
            .await
            .map_err(|err| DownloaderError::from_request(method, &err))
    }

    /// Issue one RPC call, renewing the session header on a 409.
    async fn rpc_once(&self, method: &str, arguments: Value) -> Result<Value, DownloaderError> {
        let mut response = self.send_once(method, &arguments).await?;
        if response.status().as_u16() == 409 {
            if let Some(id) = response.headers().get(SESSION_HEADER) {
                debug!(method, "transmission session id renewed");
                self.store_session_id(id.to_str().unwrap_or_default());
            }
            response = self.send_once(method, &arguments).await?;
        }
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(DownloaderError::from_status(method, status));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| DownloaderError::Protocol {
                endpoint: method.to_string(),
                reason: err.to_string(),
            })?;
        if body.get("result").and_then(Value::as_str) != Some("success") {
            return Err(DownloaderError::Protocol {
                endpoint: method.to_string(),
                reason: format!(
                    "rpc result: {}",
                    body.get("result").and_then(Value::as_str).unwrap_or("?")
                ),
            });
        }
        Ok(body.get("arguments").cloned().unwrap_or(Value::Null))
    }

    /// Idempotent query with retry/backoff on transient failures.
    async fn rpc_query(&self, method: &str, arguments: Value) -> Result<Value, DownloaderError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(DownloaderError::NotConnected);
        }
        retry_idempotent(method, || self.rpc_once(method, arguments.clone())).await
    }

    /// Mutating call; no backoff beyond the single 409 renewal.
    async fn rpc_mutate(&self, method: &str, arguments: Value) -> Result<Value, DownloaderError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(DownloaderError::NotConnected);
        }
        self.rpc_once(method, arguments).await
    }
}

#[async_trait]
impl DownloaderClient for TransmissionClient {
    async fn connect(&self) -> Result<(), DownloaderError> {
        self.connected.store(true, Ordering::Relaxed);
        match self.rpc_query("session-get", json!({})).await {
            Ok(_) => Ok(()),
            Err(err) => {
                self.connected.store(false, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    async fn torrents(&self, opts: ListOptions) -> Result<Vec<Torrent>, DownloaderError> {
        let arguments = self
            .rpc_query("torrent-get", json!({ "fields": TORRENT_FIELDS }))
            .await?;
        let now = Utc::now().timestamp() as f64;
        let torrents = arguments
            .get("torrents")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| parse_torrent(item, now, opts.with_reannounce))
                    .collect()
            })
            .unwrap_or_default();
        Ok(torrents)
    }

    async fn torrent(&self, hash: &str) -> Result<Option<Torrent>, DownloaderError> {
        let arguments = self
            .rpc_query(
                "torrent-get",
                json!({ "fields": TORRENT_FIELDS, "ids": [hash] }),
            )
            .await?;
        let now = Utc::now().timestamp() as f64;
        Ok(arguments
            .get("torrents")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .map(|item| parse_torrent(item, now, true)))
    }

    async fn stats(&self) -> Result<DownloaderStats, DownloaderError> {
        let session = self.rpc_query("session-stats", json!({})).await?;
        let torrents = self.torrents(ListOptions::default()).await?;
        let downloading = torrents
            .iter()
            .filter(|t| t.status == TorrentStatus::Downloading)
            .count();
        let seeding = torrents
            .iter()
            .filter(|t| t.status == TorrentStatus::Seeding)
            .count();
        let cumulative = session.get("cumulative-stats").cloned().unwrap_or(Value::Null);
        Ok(DownloaderStats {
            upload_speed: u64_field(&session, "uploadSpeed"),
            download_speed: u64_field(&session, "downloadSpeed"),
            total_uploaded: u64_field(&cumulative, "uploadedBytes"),
            total_downloaded: u64_field(&cumulative, "downloadedBytes"),
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
        let mut arguments = json!({ "paused": opts.paused });
        let mut expected_hash = None;
        match source {
            TorrentSource::Metainfo(bytes) => {
                expected_hash = crate::infohash_from_metainfo(&bytes);
                arguments["metainfo"] =
                    Value::String(base64::engine::general_purpose::STANDARD.encode(bytes));
            }
            TorrentSource::Magnet(uri) => {
                arguments["filename"] = Value::String(uri);
            }
        }
        if let Some(path) = &opts.save_path {
            arguments["download-dir"] = Value::String(path.clone());
        }
        if !opts.tags.is_empty() {
            arguments["labels"] = json!(opts.tags);
        }

        let result = self.rpc_mutate("torrent-add", arguments).await?;
        let added = result
            .get("torrent-added")
            .or_else(|| result.get("torrent-duplicate"))
            .and_then(|t| t.get("hashString"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        let hash = added.or(expected_hash).ok_or(DownloaderError::AddNotConfirmed { hash: None })?;

        if opts.upload_limit > 0 {
            self.set_upload_limit(&hash, opts.upload_limit).await?;
        }
        if opts.download_limit > 0 {
            self.set_download_limit(&hash, opts.download_limit).await?;
        }
        Ok(hash)
    }

    async fn remove(&self, hash: &str, delete_files: bool) -> Result<(), DownloaderError> {
        self.rpc_mutate(
            "torrent-remove",
            json!({ "ids": [hash], "delete-local-data": delete_files }),
        )
        .await
        .map(|_| ())
    }

    async fn pause(&self, hash: &str) -> Result<(), DownloaderError> {
        self.rpc_mutate("torrent-stop", json!({ "ids": [hash] }))
            .await
            .map(|_| ())
    }

    async fn resume(&self, hash: &str) -> Result<(), DownloaderError> {
        self.rpc_mutate("torrent-start", json!({ "ids": [hash] }))
            .await
            .map(|_| ())
    }

    async fn reannounce(&self, hash: &str) -> Result<(), DownloaderError> {
        self.rpc_mutate("torrent-reannounce", json!({ "ids": [hash] }))
            .await
            .map(|_| ())
    }

    async fn set_upload_limit(
        &self,
        hash: &str,
        bytes_per_s: u64,
    ) -> Result<(), DownloaderError> {
        let arguments = if bytes_per_s == 0 {
            json!({ "ids": [hash], "uploadLimited": false })
        } else {
            json!({
                "ids": [hash],
                "uploadLimited": true,
                // Transmission takes KB/s.
                "uploadLimit": (bytes_per_s / 1024).max(1),
            })
        };
        self.rpc_mutate("torrent-set", arguments).await.map(|_| ())
    }

    async fn set_download_limit(
        &self,
        hash: &str,
        bytes_per_s: u64,
    ) -> Result<(), DownloaderError> {
        let arguments = if bytes_per_s == 0 {
            json!({ "ids": [hash], "downloadLimited": false })
        } else {
            json!({
                "ids": [hash],
                "downloadLimited": true,
                "downloadLimit": (bytes_per_s / 1024).max(1),
            })
        };
        self.rpc_mutate("torrent-set", arguments).await.map(|_| ())
    }

    async fn set_global_upload_limit(&self, bytes_per_s: u64) -> Result<(), DownloaderError> {
        let arguments = if bytes_per_s == 0 {
            json!({ "speed-limit-up-enabled": false })
        } else {
            json!({
                "speed-limit-up-enabled": true,
                "speed-limit-up": (bytes_per_s / 1024).max(1),
            })
        };
        self.rpc_mutate("session-set", arguments).await.map(|_| ())
    }

    async fn set_global_download_limit(&self, bytes_per_s: u64) -> Result<(), DownloaderError> {
        let arguments = if bytes_per_s == 0 {
            json!({ "speed-limit-down-enabled": false })
        } else {
            json!({
                "speed-limit-down-enabled": true,
                "speed-limit-down": (bytes_per_s / 1024).max(1),
            })
        };
        self.rpc_mutate("session-set", arguments).await.map(|_| ())
    }

    async fn pause_all(&self) -> Result<(), DownloaderError> {
        self.rpc_mutate("torrent-stop", json!({})).await.map(|_| ())
    }

    async fn resume_all(&self) -> Result<(), DownloaderError> {
        self.rpc_mutate("torrent-start", json!({})).await.map(|_| ())
    }

    async fn free_space(&self, path: Option<&str>) -> Result<u64, DownloaderError> {
        let path = match path {
            Some(path) => path.to_string(),
            None => {
                let session = self.rpc_query("session-get", json!({})).await?;
                session
                    .get("download-dir")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            }
        };
        let result = self
            .rpc_query("free-space", json!({ "path": path }))
            .await?;
        Ok(u64_field(&result, "size-bytes"))
    }

    async fn announce_info(
        &self,
        hash: &str,
    ) -> Result<(Option<f64>, Option<u32>), DownloaderError> {
        let Some(torrent) = self.torrent(hash).await? else {
            return Ok((None, None));
        };
        Ok((torrent.next_announce_time, torrent.announce_interval))
    }
}

fn u64_field(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn i64_field(value: &Value, key: &str) -> i64 {
    value.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn f64_field(value: &Value, key: &str) -> f64 {
    value.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("")
}

fn map_status(code: i64) -> TorrentStatus {
    match code {
        0 => TorrentStatus::Paused,
        1 | 2 => TorrentStatus::Checking,
        3 | 5 => TorrentStatus::Queued,
        4 => TorrentStatus::Downloading,
        6 => TorrentStatus::Seeding,
        _ => TorrentStatus::Error,
    }
}

fn parse_torrent(item: &Value, now: f64, with_reannounce: bool) -> Torrent {
    let status_code = i64_field(item, "status");
    let status = if str_field(item, "errorString").is_empty() {
        map_status(status_code)
    } else {
        TorrentStatus::Error
    };

    let tracker_stats = item
        .get("trackerStats")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let first_tracker = tracker_stats.first();

    let mut next_announce = None;
    if with_reannounce {
        for stat in &tracker_stats {
            let raw = f64_field(stat, "nextAnnounceTime");
            if let Some(normalized) = normalize_next_announce(raw, now) {
                next_announce = Some(next_announce.map_or(normalized, |n: f64| n.min(normalized)));
            }
        }
    }

    let size_when_done = u64_field(item, "sizeWhenDone");
    let total_size = u64_field(item, "totalSize");
    let seeders = first_tracker.map_or(0, |t| i64_field(t, "seederCount"));
    let leechers = first_tracker.map_or(0, |t| i64_field(t, "leecherCount"));

    Torrent {
        hash: str_field(item, "hashString").to_string(),
        name: str_field(item, "name").to_string(),
        size: size_when_done,
        total_size: if total_size > 0 { total_size } else { size_when_done },
        completed: u64_field(item, "haveValid"),
        progress: f64_field(item, "percentDone"),
        status,
        state: format!("status-{status_code}"),
        uploaded: u64_field(item, "uploadedEver"),
        downloaded: u64_field(item, "downloadedEver"),
        ratio: f64_field(item, "uploadRatio").max(0.0),
        upload_speed: u64_field(item, "rateUpload"),
        download_speed: u64_field(item, "rateDownload"),
        seeders,
        leechers,
        seeds_connected: i64_field(item, "peersGettingFromUs"),
        peers_connected: i64_field(item, "peersConnected"),
        tracker: first_tracker
            .map(|t| str_field(t, "announce").to_string())
            .unwrap_or_default(),
        tracker_status: first_tracker
            .map(|t| str_field(t, "lastAnnounceResult").to_string())
            .unwrap_or_default(),
        tags: item
            .get("labels")
            .and_then(Value::as_array)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default(),
        category: String::new(),
        save_path: str_field(item, "downloadDir").to_string(),
        added_time: timestamp_opt(i64_field(item, "addedDate")),
        completed_time: timestamp_opt(i64_field(item, "doneDate")),
        seeding_time: i64_field(item, "secondsSeeding"),
        eta: i64_field(item, "eta").max(0),
        next_announce_time: next_announce,
        // trackerStats exposes no announce interval; the limiter estimates it.
        announce_interval: None,
    }
}

fn timestamp_opt(secs: i64) -> Option<DateTime<Utc>> {
    if secs > 0 {
        DateTime::<Utc>::from_timestamp(secs, 0)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_shared_states() {
        assert_eq!(map_status(0), TorrentStatus::Paused);
        assert_eq!(map_status(2), TorrentStatus::Checking);
        assert_eq!(map_status(4), TorrentStatus::Downloading);
        assert_eq!(map_status(6), TorrentStatus::Seeding);
        assert_eq!(map_status(9), TorrentStatus::Error);
    }

    #[test]
    fn parse_torrent_reads_tracker_stats() {
        let now = 1_700_000_000.0;
        let item = json!({
            "hashString": "abc",
            "name": "Demo",
            "status": 6,
            "totalSize": 200,
            "sizeWhenDone": 180,
            "haveValid": 180,
            "percentDone": 1.0,
            "uploadedEver": 90,
            "downloadedEver": 180,
            "uploadRatio": 0.5,
            "rateUpload": 1000,
            "rateDownload": 0,
            "peersConnected": 3,
            "peersGettingFromUs": 2,
            "labels": ["pt"],
            "downloadDir": "/data",
            "addedDate": 1_699_999_000,
            "secondsSeeding": 1200,
            "eta": -1,
            "errorString": "",
            "trackerStats": [{
                "announce": "https://tracker.example.org/announce",
                "seederCount": 11,
                "leecherCount": 4,
                "nextAnnounceTime": now + 600.0,
                "lastAnnounceResult": "Success"
            }]
        });
        let torrent = parse_torrent(&item, now, true);
        assert_eq!(torrent.status, TorrentStatus::Seeding);
        assert_eq!(torrent.seeders, 11);
        assert_eq!(torrent.next_announce_time, Some(now + 600.0));
        assert_eq!(torrent.tracker, "https://tracker.example.org/announce");
        assert_eq!(torrent.eta, 0);
    }

    #[test]
    fn error_string_forces_error_status() {
        let item = json!({
            "hashString": "abc",
            "status": 6,
            "errorString": "tracker unreachable"
        });
        let torrent = parse_torrent(&item, 0.0, false);
        assert_eq!(torrent.status, TorrentStatus::Error);
    }
}
