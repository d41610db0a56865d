use chrono::{Local, Timelike, Utc};
use seedfleet_downloader::{tracker_domain, DownloaderStats, Torrent};

/// Field values a rule can reference, resolved once per torrent.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub(crate) progress_percent: f64,
    pub(crate) seeding_time: f64,
    pub(crate) uploaded: f64,
    pub(crate) downloaded: f64,
    pub(crate) ratio: f64,
    pub(crate) true_ratio: f64,
    pub(crate) ratio3: f64,
    pub(crate) upload_speed: f64,
    pub(crate) download_speed: f64,
    pub(crate) size: f64,
    pub(crate) total_size: f64,
    pub(crate) completed: f64,
    pub(crate) added_time: f64,
    pub(crate) completed_time: f64,
    pub(crate) seeders: f64,
    pub(crate) leechers: f64,
    pub(crate) seeds_connected: f64,
    pub(crate) peers_connected: f64,
    pub(crate) free_space: f64,
    pub(crate) leeching_count: f64,
    pub(crate) seeding_count: f64,
    pub(crate) global_upload_speed: f64,
    pub(crate) global_download_speed: f64,
    pub(crate) second_from_zero: f64,
    pub(crate) tracker: String,
    pub(crate) tracker_status: String,
    pub(crate) tags: String,
    pub(crate) category: String,
    pub(crate) name: String,
    pub(crate) status: String,
    pub(crate) state: String,
    pub(crate) save_path: String,
}

impl EvalContext {
    /// Build the context from a live descriptor and optional global stats.
    #[must_use]
    pub fn build(torrent: &Torrent, stats: Option<&DownloaderStats>) -> Self {
        let now = Utc::now();
        let added_time = torrent
            .added_time
            .map_or(0.0, |added| (now - added).num_seconds().max(0) as f64);
        let completed_time = torrent
            .completed_time
            .map_or(0.0, |done| (now - done).num_seconds().max(0) as f64);

        let size = torrent.size as f64;
        let total_size = torrent.total_size.max(torrent.size) as f64;
        let uploaded = torrent.uploaded as f64;
        let downloaded = torrent.downloaded as f64;
        let completed = if torrent.completed > 0 {
            torrent.completed as f64
        } else {
            downloaded
        };

        let true_ratio_base = if downloaded > 0.0 { downloaded } else { size };
        let true_ratio = uploaded / true_ratio_base.max(1.0);
        let ratio3 = uploaded / total_size.max(1.0);

        let local = Local::now();
        let second_from_zero =
            f64::from(local.hour() * 3600 + local.minute() * 60 + local.second());

        Self {
            progress_percent: torrent.progress * 100.0,
            seeding_time: torrent.seeding_time as f64,
            uploaded,
            downloaded,
            ratio: torrent.ratio,
            true_ratio,
            ratio3,
            upload_speed: torrent.upload_speed as f64,
            download_speed: torrent.download_speed as f64,
            size,
            total_size,
            completed,
            added_time,
            completed_time,
            seeders: torrent.seeders as f64,
            leechers: torrent.leechers as f64,
            seeds_connected: torrent.seeds_connected as f64,
            peers_connected: torrent.peers_connected as f64,
            free_space: stats.map_or(0.0, |s| s.free_space as f64),
            leeching_count: stats.map_or(0.0, |s| s.downloading_torrents as f64),
            seeding_count: stats.map_or(0.0, |s| s.seeding_torrents as f64),
            global_upload_speed: stats.map_or(0.0, |s| s.upload_speed as f64),
            global_download_speed: stats.map_or(0.0, |s| s.download_speed as f64),
            second_from_zero,
            tracker: tracker_domain(&torrent.tracker),
            tracker_status: torrent.tracker_status.clone(),
            tags: torrent.tags.join(","),
            category: torrent.category.clone(),
            name: torrent.name.clone(),
            status: torrent.status.as_str().to_string(),
            state: if torrent.state.is_empty() {
                torrent.status.as_str().to_string()
            } else {
                torrent.state.clone()
            },
            save_path: torrent.save_path.clone(),
        }
    }

    /// Numeric field lookup; accepts snake_case and the camelCase aliases the
    /// web UI has always produced.
    #[must_use]
    pub fn numeric(&self, field: &str) -> Option<f64> {
        Some(match field {
            "progress" | "progress_percent" => self.progress_percent,
            "seeding_time" | "seedingTime" => self.seeding_time,
            "uploaded" => self.uploaded,
            "downloaded" => self.downloaded,
            "ratio" => self.ratio,
            "true_ratio" | "trueRatio" => self.true_ratio,
            "ratio3" => self.ratio3,
            "upload_speed" | "uploadSpeed" => self.upload_speed,
            "download_speed" | "downloadSpeed" => self.download_speed,
            "size" | "selected_size" | "selectedSize" => self.size,
            "total_size" | "totalSize" => self.total_size,
            "completed" => self.completed,
            "added_time" | "addedTime" => self.added_time,
            "completed_time" | "completedTime" => self.completed_time,
            "seeders" | "seeder" => self.seeders,
            "leechers" | "leecher" => self.leechers,
            "seeds_connected" => self.seeds_connected,
            "peers_connected" => self.peers_connected,
            "free_space" | "freeSpace" => self.free_space,
            "leeching_count" | "leechingCount" => self.leeching_count,
            "seeding_count" | "seedingCount" => self.seeding_count,
            "global_upload_speed" | "globalUploadSpeed" => self.global_upload_speed,
            "global_download_speed" | "globalDownloadSpeed" => self.global_download_speed,
            "second_from_zero" | "secondFromZero" => self.second_from_zero,
            _ => return None,
        })
    }

    /// String field lookup.
    #[must_use]
    pub fn string(&self, field: &str) -> Option<&str> {
        Some(match field {
            "tracker" => &self.tracker,
            "tracker_status" | "trackerStatus" => &self.tracker_status,
            "tags" => &self.tags,
            "category" => &self.category,
            "name" => &self.name,
            "status" => &self.status,
            "state" => &self.state,
            "save_path" | "savePath" => &self.save_path,
            _ => return None,
        })
    }
}
