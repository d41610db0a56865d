//! Deluge WebUI JSON-RPC adapter.
//!
//! The WebUI front end authenticates with `auth.login` (cookie session) and
//! may need an explicit `web.connect` to attach to a running daemon before
//! `core.*` methods answer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
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

const STATUS_FIELDS: &[&str] = &[
    "hash",
    "name",
    "total_wanted",
    "total_size",
    "total_done",
    "progress",
    "state",
    "total_uploaded",
    "all_time_download",
    "ratio",
    "upload_payload_rate",
    "download_payload_rate",
    "total_seeds",
    "total_peers",
    "num_seeds",
    "num_peers",
    "tracker",
    "tracker_status",
    "label",
    "save_path",
    "time_added",
    "seeding_time",
    "eta",
    "next_announce",
];

pub(crate) struct DelugeClient {
    base: String,
    password: String,
    http: reqwest::Client,
    request_id: AtomicU64,
    connected: AtomicBool,
}

impl DelugeClient {
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
            password: config.password.clone(),
            http,
            request_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        }
    }

    async fn rpc_once(&self, method: &str, params: Value) -> Result<Value, DownloaderError> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .http
            .post(format!("{}/json", self.base))
            .json(&json!({ "method": method, "params": params, "id": id }))
            .send()
            .await
            .map_err(|err| DownloaderError::from_request(method, &err))?;
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
        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(DownloaderError::Protocol {
                endpoint: method.to_string(),
                reason: error.to_string(),
            });
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn rpc_query(&self, method: &str, params: Value) -> Result<Value, DownloaderError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(DownloaderError::NotConnected);
        }
        retry_idempotent(method, || self.rpc_once(method, params.clone())).await
    }

    async fn rpc_mutate(&self, method: &str, params: Value) -> Result<Value, DownloaderError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(DownloaderError::NotConnected);
        }
        self.rpc_once(method, params).await
    }
}

#[async_trait]
impl DownloaderClient for DelugeClient {
    async fn connect(&self) -> Result<(), DownloaderError> {
        let authed = self
            .rpc_once("auth.login", json!([self.password]))
            .await?
            .as_bool()
            .unwrap_or(false);
        if !authed {
            return Err(DownloaderError::AuthExpired {
                endpoint: "auth.login".to_string(),
            });
        }

        let connected = self
            .rpc_once("web.connected", json!([]))
            .await?
            .as_bool()
            .unwrap_or(false);
        if !connected {
            // Attach the WebUI to the first advertised daemon.
            let hosts = self.rpc_once("web.get_hosts", json!([])).await?;
            if let Some(host_id) = hosts
                .as_array()
                .and_then(|hosts| hosts.first())
                .and_then(|host| host.as_array())
                .and_then(|fields| fields.first())
                .and_then(Value::as_str)
            {
                debug!(host_id, "attaching deluge web session to daemon");
                let _ = self.rpc_once("web.connect", json!([host_id])).await?;
            }
        }

        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            let _ = self.rpc_once("auth.delete_session", json!([])).await;
        }
    }

    async fn torrents(&self, opts: ListOptions) -> Result<Vec<Torrent>, DownloaderError> {
        let result = self
            .rpc_query(
                "core.get_torrents_status",
                json!([{}, STATUS_FIELDS]),
            )
            .await?;
        let now = Utc::now().timestamp() as f64;
        let torrents = result
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(hash, data)| parse_torrent(hash, data, now, opts.with_reannounce))
                    .collect()
            })
            .unwrap_or_default();
        Ok(torrents)
    }

    async fn torrent(&self, hash: &str) -> Result<Option<Torrent>, DownloaderError> {
        let result = self
            .rpc_query(
                "core.get_torrent_status",
                json!([hash, STATUS_FIELDS]),
            )
            .await?;
        let now = Utc::now().timestamp() as f64;
        if result.as_object().is_some_and(|map| !map.is_empty()) {
            Ok(Some(parse_torrent(hash, &result, now, true)))
        } else {
            Ok(None)
        }
    }

    async fn stats(&self) -> Result<DownloaderStats, DownloaderError> {
        let session = self
            .rpc_query(
                "core.get_session_status",
                json!([[
                    "upload_rate",
                    "download_rate",
                    "total_upload",
                    "total_download"
                ]]),
            )
            .await?;
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
            upload_speed: f64_field(&session, "upload_rate") as u64,
            download_speed: f64_field(&session, "download_rate") as u64,
            total_uploaded: f64_field(&session, "total_upload") as u64,
            total_downloaded: f64_field(&session, "total_download") as u64,
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
        let mut options = json!({ "add_paused": opts.paused });
        if let Some(path) = &opts.save_path {
            options["download_location"] = Value::String(path.clone());
        }
        if opts.upload_limit > 0 {
            // Deluge rate options are KiB/s.
            options["max_upload_speed"] = json!((opts.upload_limit as f64) / 1024.0);
        }
        if opts.download_limit > 0 {
            options["max_download_speed"] = json!((opts.download_limit as f64) / 1024.0);
        }

        let result = match source {
            TorrentSource::Metainfo(bytes) => {
                let expected = crate::infohash_from_metainfo(&bytes);
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                let added = self
                    .rpc_mutate(
                        "core.add_torrent_file",
                        json!(["payload.torrent", encoded, options]),
                    )
                    .await?;
                added.as_str().map(str::to_owned).or(expected)
            }
            TorrentSource::Magnet(uri) => self
                .rpc_mutate("core.add_torrent_magnet", json!([uri, options]))
                .await?
                .as_str()
                .map(str::to_owned),
        };

        let hash = result.ok_or(DownloaderError::AddNotConfirmed { hash: None })?;
        if let Some(category) = &opts.category {
            // Labels are best-effort; the plugin may be absent.
            let _ = self
                .rpc_mutate("label.set_torrent", json!([hash, category]))
                .await;
        }
        Ok(hash)
    }

    async fn remove(&self, hash: &str, delete_files: bool) -> Result<(), DownloaderError> {
        self.rpc_mutate("core.remove_torrent", json!([hash, delete_files]))
            .await
            .map(|_| ())
    }

    async fn pause(&self, hash: &str) -> Result<(), DownloaderError> {
        self.rpc_mutate("core.pause_torrent", json!([[hash]]))
            .await
            .map(|_| ())
    }

    async fn resume(&self, hash: &str) -> Result<(), DownloaderError> {
        self.rpc_mutate("core.resume_torrent", json!([[hash]]))
            .await
            .map(|_| ())
    }

    async fn reannounce(&self, hash: &str) -> Result<(), DownloaderError> {
        self.rpc_mutate("core.force_reannounce", json!([[hash]]))
            .await
            .map(|_| ())
    }

    async fn set_upload_limit(
        &self,
        hash: &str,
        bytes_per_s: u64,
    ) -> Result<(), DownloaderError> {
        let kib = if bytes_per_s == 0 {
            -1.0
        } else {
            (bytes_per_s as f64) / 1024.0
        };
        self.rpc_mutate(
            "core.set_torrent_options",
            json!([[hash], { "max_upload_speed": kib }]),
        )
        .await
        .map(|_| ())
    }

    async fn set_download_limit(
        &self,
        hash: &str,
        bytes_per_s: u64,
    ) -> Result<(), DownloaderError> {
        let kib = if bytes_per_s == 0 {
            -1.0
        } else {
            (bytes_per_s as f64) / 1024.0
        };
        self.rpc_mutate(
            "core.set_torrent_options",
            json!([[hash], { "max_download_speed": kib }]),
        )
        .await
        .map(|_| ())
    }

    async fn set_global_upload_limit(&self, bytes_per_s: u64) -> Result<(), DownloaderError> {
        let kib = if bytes_per_s == 0 {
            -1.0
        } else {
            (bytes_per_s as f64) / 1024.0
        };
        self.rpc_mutate("core.set_config", json!([{ "max_upload_speed": kib }]))
            .await
            .map(|_| ())
    }

    async fn set_global_download_limit(&self, bytes_per_s: u64) -> Result<(), DownloaderError> {
        let kib = if bytes_per_s == 0 {
            -1.0
        } else {
            (bytes_per_s as f64) / 1024.0
        };
        self.rpc_mutate("core.set_config", json!([{ "max_download_speed": kib }]))
            .await
            .map(|_| ())
    }

    async fn pause_all(&self) -> Result<(), DownloaderError> {
        self.rpc_mutate("core.pause_session", json!([]))
            .await
            .map(|_| ())
    }

    async fn resume_all(&self) -> Result<(), DownloaderError> {
        self.rpc_mutate("core.resume_session", json!([]))
            .await
            .map(|_| ())
    }

    async fn free_space(&self, path: Option<&str>) -> Result<u64, DownloaderError> {
        let params = match path {
            Some(path) => json!([path]),
            None => json!([]),
        };
        let result = self.rpc_query("core.get_free_space", params).await?;
        Ok(result.as_u64().unwrap_or(0))
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

fn f64_field(value: &Value, key: &str) -> f64 {
    value.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn i64_field(value: &Value, key: &str) -> i64 {
    value.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("")
}

fn map_state(state: &str) -> TorrentStatus {
    match state {
        "Downloading" => TorrentStatus::Downloading,
        "Seeding" => TorrentStatus::Seeding,
        "Paused" => TorrentStatus::Paused,
        "Checking" | "Allocating" | "Moving" => TorrentStatus::Checking,
        "Queued" => TorrentStatus::Queued,
        _ => TorrentStatus::Error,
    }
}

fn parse_torrent(hash: &str, data: &Value, now: f64, with_reannounce: bool) -> Torrent {
    let state = str_field(data, "state");
    let next_announce = if with_reannounce {
        let raw = f64_field(data, "next_announce");
        normalize_next_announce(raw, now)
    } else {
        None
    };
    let total_wanted = f64_field(data, "total_wanted") as u64;
    let total_size = f64_field(data, "total_size") as u64;
    Torrent {
        hash: hash.to_string(),
        name: str_field(data, "name").to_string(),
        size: if total_wanted > 0 { total_wanted } else { total_size },
        total_size,
        completed: f64_field(data, "total_done") as u64,
        // Deluge reports progress as 0-100.
        progress: f64_field(data, "progress") / 100.0,
        status: map_state(state),
        state: state.to_string(),
        uploaded: f64_field(data, "total_uploaded") as u64,
        downloaded: f64_field(data, "all_time_download") as u64,
        ratio: f64_field(data, "ratio"),
        upload_speed: f64_field(data, "upload_payload_rate") as u64,
        download_speed: f64_field(data, "download_payload_rate") as u64,
        seeders: i64_field(data, "total_seeds"),
        leechers: i64_field(data, "total_peers"),
        seeds_connected: i64_field(data, "num_seeds"),
        peers_connected: i64_field(data, "num_peers"),
        tracker: str_field(data, "tracker").to_string(),
        tracker_status: str_field(data, "tracker_status").to_string(),
        tags: Vec::new(),
        category: str_field(data, "label").to_string(),
        save_path: str_field(data, "save_path").to_string(),
        added_time: timestamp_opt(f64_field(data, "time_added") as i64),
        completed_time: None,
        seeding_time: i64_field(data, "seeding_time"),
        eta: i64_field(data, "eta").max(0),
        next_announce_time: next_announce,
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
    fn deluge_states_map_to_shared_states() {
        assert_eq!(map_state("Downloading"), TorrentStatus::Downloading);
        assert_eq!(map_state("Seeding"), TorrentStatus::Seeding);
        assert_eq!(map_state("Allocating"), TorrentStatus::Checking);
        assert_eq!(map_state("Queued"), TorrentStatus::Queued);
        assert_eq!(map_state("???"), TorrentStatus::Error);
    }

    #[test]
    fn parse_torrent_scales_progress_and_reads_label() {
        let now = 1_700_000_000.0;
        let data = json!({
            "name": "Demo",
            "total_wanted": 100.0,
            "total_size": 120.0,
            "total_done": 50.0,
            "progress": 50.0,
            "state": "Downloading",
            "total_uploaded": 10.0,
            "all_time_download": 50.0,
            "ratio": 0.2,
            "upload_payload_rate": 1024.0,
            "download_payload_rate": 2048.0,
            "total_seeds": 7,
            "total_peers": 3,
            "num_seeds": 2,
            "num_peers": 1,
            "tracker": "https://tracker.example.org/announce",
            "tracker_status": "Announce OK",
            "label": "pt",
            "save_path": "/data",
            "time_added": 1_699_990_000.0,
            "seeding_time": 0,
            "eta": 25,
            "next_announce": 1234.0
        });
        let torrent = parse_torrent("abc", &data, now, true);
        assert!((torrent.progress - 0.5).abs() < f64::EPSILON);
        assert_eq!(torrent.category, "pt");
        assert_eq!(torrent.size, 100);
        assert_eq!(torrent.next_announce_time, Some(now + 1234.0));
    }
}
