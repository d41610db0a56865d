use chrono::{DateTime, Utc};
use seedfleet_downloader::{ClientConfig, DownloaderKind};
use serde::{Deserialize, Serialize};

/// A configured torrent client.
#[derive(Debug, Clone)]
pub struct DownloaderEntity {
    /// Row id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Client flavor.
    pub kind: DownloaderKind,
    /// Host name or address.
    pub host: String,
    /// WebUI/RPC port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Connect over https.
    pub use_tls: bool,
    /// Default save directory for added torrents.
    pub download_dir: String,
    /// Whether the downloader participates in automation at all.
    pub enabled: bool,
    /// Reannounce torrents roughly five minutes after they were added.
    pub auto_reannounce: bool,
    /// Delete rules may act on this downloader.
    pub auto_delete: bool,
    /// The limiter may control this downloader.
    pub auto_speed_limit: bool,
    /// Ask clients for first/last piece priority on add.
    pub first_last_priority: bool,
    /// Advisory per-torrent upload cap in KiB/s (0 = none).
    pub max_upload_kib: i64,
    /// Advisory per-torrent download cap in KiB/s (0 = none).
    pub max_download_kib: i64,
    /// Advisory cap on simultaneous downloads (0 = none).
    pub max_active_downloads: i64,
    /// Free-space warning threshold in GiB.
    pub disk_space_warn_gib: i64,
}

impl DownloaderEntity {
    /// Connection parameters for the adapter layer.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            kind: self.kind,
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            use_tls: self.use_tls,
        }
    }
}

/// A configured RSS feed.
#[derive(Debug, Clone)]
pub struct RssFeedEntity {
    /// Row id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Feed URL (passkey parameters included).
    pub url: String,
    /// Whether the feed is polled at all.
    pub enabled: bool,
    /// First processing only records entries, it never downloads.
    pub first_run_done: bool,
    /// Explicit downloader assignment.
    pub downloader_id: Option<i64>,
    /// Pick the downloader with the most free space instead.
    pub auto_assign: bool,
    /// Cookie attached to feed and detail-page requests.
    pub site_cookie: String,
    /// Site domain, for logs and detail-page URLs.
    pub site_domain: String,
    /// Seconds between fetches.
    pub fetch_interval_secs: i64,
    /// Accept only free-leech entries.
    pub only_free: bool,
    /// Reject hit-and-run flagged entries.
    pub exclude_hr: bool,
    /// Lower size bound in GiB (0 = none).
    pub min_size_gib: f64,
    /// Upper size bound in GiB (0 = none).
    pub max_size_gib: f64,
    /// Lower seeder bound (0 = none; applied only when the entry knows).
    pub min_seeders: i64,
    /// Upper seeder bound (0 = none).
    pub max_seeders: i64,
    /// Comma-separated keywords at least one of which must appear in a title.
    pub include_keywords: String,
    /// Comma-separated keywords none of which may appear in a title.
    pub exclude_keywords: String,
    /// Comma-separated category filter.
    pub categories: String,
    /// Per-torrent upload cap in KiB/s applied on add (0 = none).
    pub max_upload_kib: i64,
    /// Per-torrent download cap in KiB/s applied on add (0 = none).
    pub max_download_kib: i64,
    /// Skip adds while the downloader has this many active downloads (0 = off).
    pub max_download_tasks: i64,
    /// Category override for added torrents.
    pub category: String,
    /// Comma-separated tags for added torrents.
    pub tags: String,
    /// Save-path override for added torrents.
    pub save_path: String,
    /// When the feed was last fetched.
    pub last_fetch: Option<DateTime<Utc>>,
}

/// A new RSS history row.
#[derive(Debug, Clone, Default)]
pub struct NewRssRecord {
    /// Owning feed.
    pub feed_id: i64,
    /// Entry title.
    pub title: String,
    /// Resolved download link (dedup key within the feed).
    pub link: String,
    /// Infohash when known.
    pub infohash: String,
    /// Payload size in bytes (0 = unknown).
    pub size: i64,
    /// Free-leech flag.
    pub is_free: bool,
    /// Hit-and-run flag.
    pub is_hr: bool,
    /// Seeders reported by the feed (0 = unknown).
    pub seeders: i64,
    /// Leechers reported by the feed (0 = unknown).
    pub leechers: i64,
    /// Whether the entry was handed to a downloader.
    pub downloaded: bool,
    /// Downloader that received the torrent.
    pub downloader_id: Option<i64>,
    /// Why the entry was skipped, when it was.
    pub skip_reason: String,
}

/// One condition inside a delete rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Field name (see the rules crate for the catalog).
    pub field: String,
    /// Comparison operator.
    pub operator: String,
    /// Threshold or pattern; numbers may use `a*b` product syntax.
    #[serde(default)]
    pub value: serde_json::Value,
    /// Explicit unit overriding the field default.
    #[serde(default)]
    pub unit: Option<String>,
    /// Minimum continuous seconds the condition must hold.
    #[serde(default)]
    pub duration: Option<f64>,
    /// Unit for `duration` (defaults to seconds).
    #[serde(default)]
    pub duration_unit: Option<String>,
}

/// A configured delete rule.
#[derive(Debug, Clone)]
pub struct DeleteRuleEntity {
    /// Row id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Whether the rule runs.
    pub enabled: bool,
    /// Rules execute in descending priority, id ascending within ties.
    pub priority: i64,
    /// Condition array (empty for script rules).
    pub conditions: Vec<RuleCondition>,
    /// `AND` or `OR`.
    pub condition_logic: String,
    /// Rule-level duration threshold in seconds.
    pub duration_secs: i64,
    /// Delete payload files alongside the torrent.
    pub delete_files: bool,
    /// Keep files even when `delete_files` is set.
    pub only_delete_torrent: bool,
    /// Reannounce (and wait 2 s) before deleting.
    pub force_report: bool,
    /// Cap on completed actions per run (0 = unlimited).
    pub max_delete_count: i64,
    /// Pause instead of deleting.
    pub pause: bool,
    /// Apply this up+down cap in bytes/s instead of deleting (0 = off).
    pub limit_speed: i64,
    /// `conditions` or `script`.
    pub rule_kind: String,
    /// Expression text for script rules.
    pub script: String,
    /// Downloader scope (empty = all enabled).
    pub downloader_ids: Vec<i64>,
    /// Substring the tracker domain must contain.
    pub tracker_filter: String,
    /// Substring the joined tag list must contain.
    pub tag_filter: String,
}

/// A new delete history row.
#[derive(Debug, Clone, Default)]
pub struct NewDeleteRecord {
    /// Rule that fired.
    pub rule_id: i64,
    /// Rule name at firing time.
    pub rule_name: String,
    /// Downloader acted on.
    pub downloader_id: i64,
    /// Downloader name at firing time.
    pub downloader_name: String,
    /// Torrent infohash.
    pub torrent_hash: String,
    /// Torrent name.
    pub torrent_name: String,
    /// Payload size in bytes.
    pub size: i64,
    /// Uploaded bytes at action time.
    pub uploaded: i64,
    /// Downloaded bytes at action time.
    pub downloaded: i64,
    /// Share ratio at action time.
    pub ratio: f64,
    /// Seeding time in seconds at action time.
    pub seeding_time: i64,
    /// Tracker domain.
    pub tracker: String,
    /// Whether payload files were removed.
    pub files_deleted: bool,
    /// Whether a reannounce preceded the delete.
    pub reported: bool,
    /// `delete`, `pause` or `limit`.
    pub action: String,
}

/// Global limiter configuration singleton.
#[derive(Debug, Clone)]
pub struct SpeedLimitConfigEntity {
    /// Master switch.
    pub enabled: bool,
    /// Global target upload speed in bytes/s (0 = control disabled).
    pub target_upload_speed: f64,
    /// Fraction of the target kept in reserve.
    pub safety_margin: f64,
    /// Bandwidth-ledger reporting interval in seconds.
    pub report_interval: i64,
}

/// Per-tracker limiter overrides.
#[derive(Debug, Clone)]
pub struct SpeedLimitSiteEntity {
    /// Row id.
    pub id: i64,
    /// Tracker domain this rule applies to.
    pub tracker_domain: String,
    /// Whether the override is active.
    pub enabled: bool,
    /// Site-specific target upload speed in bytes/s.
    pub target_upload_speed: f64,
    /// Site-specific safety margin.
    pub safety_margin: f64,
    /// Engage the download brake for this site.
    pub limit_download_speed: bool,
    /// Engage the announce-time optimizer for this site.
    pub optimize_announce: bool,
    /// The tracker follows the age-derived announce-interval convention
    /// (30/45/60 minutes by torrent age).
    pub age_based_interval: bool,
    /// Allow peer-list idle probing for this site.
    pub peerlist_enabled: bool,
    /// Cookie used for peer-list and search requests.
    pub peerlist_cookie: String,
    /// `elapsed` (seconds since last announce) or `remaining`.
    pub peerlist_time_mode: String,
    /// Fixed announce interval override in seconds (0 = none).
    pub custom_announce_interval: i64,
    /// Base URL of the site (for search/peer-list pages).
    pub site_url: String,
}

/// A new bandwidth-ledger row. Written only when a delta is non-zero.
#[derive(Debug, Clone, Default)]
pub struct NewSpeedLimitRecord {
    /// Tracker domain of the torrent.
    pub tracker_domain: String,
    /// Downloader the torrent lives on.
    pub downloader_id: i64,
    /// Instantaneous upload speed at record time, bytes/s.
    pub current_speed: f64,
    /// Effective target speed, bytes/s.
    pub target_speed: f64,
    /// Limit applied at record time, bytes/s (0 = uncapped).
    pub limit_applied: f64,
    /// Controller phase label.
    pub phase: String,
    /// Uploaded bytes since the previous row for this torrent.
    pub uploaded: i64,
    /// Downloaded bytes since the previous row for this torrent.
    pub downloaded: i64,
}

/// A new promotion-feed history row (written by the magic collaborator).
#[derive(Debug, Clone, Default)]
pub struct NewMagicRecord {
    /// Site-local torrent id.
    pub torrent_id: String,
    /// Torrent name.
    pub torrent_name: String,
    /// Infohash when known.
    pub torrent_hash: String,
    /// Promotion kind label.
    pub magic_kind: String,
    /// Promotion duration in hours.
    pub duration_hours: i64,
    /// Seeders at discovery time.
    pub seeders: i64,
    /// Leechers at discovery time.
    pub leechers: i64,
    /// Payload size in bytes.
    pub size: i64,
    /// Whether the torrent was downloaded.
    pub downloaded: bool,
    /// Why it was skipped, when it was.
    pub skip_reason: String,
}
