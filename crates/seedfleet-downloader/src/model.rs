use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supported torrent client flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloaderKind {
    /// qBittorrent WebUI API.
    Qbittorrent,
    /// Transmission RPC.
    Transmission,
    /// Deluge WebUI JSON-RPC.
    Deluge,
}

impl DownloaderKind {
    /// Stable string form used by the persistence layer.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Qbittorrent => "qbittorrent",
            Self::Transmission => "transmission",
            Self::Deluge => "deluge",
        }
    }

    /// Parse the persisted string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "qbittorrent" => Some(Self::Qbittorrent),
            "transmission" => Some(Self::Transmission),
            "deluge" => Some(Self::Deluge),
            _ => None,
        }
    }
}

/// Connection parameters shared by all client flavors.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Which client protocol to speak.
    pub kind: DownloaderKind,
    /// Host name or address.
    pub host: String,
    /// TCP port of the WebUI/RPC endpoint.
    pub port: u16,
    /// Login user; may be empty when the client has auth disabled.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Use https instead of http.
    pub use_tls: bool,
}

impl ClientConfig {
    /// Base URL of the client endpoint.
    #[must_use]
    pub fn base_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Coarse torrent lifecycle state shared across client flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentStatus {
    /// Actively fetching payload data.
    Downloading,
    /// Complete and uploading to peers.
    Seeding,
    /// Stopped by the user or an automation rule.
    Paused,
    /// Verifying on-disk data.
    Checking,
    /// Waiting in the client's queue.
    Queued,
    /// The client reported an error for this torrent.
    Error,
}

impl TorrentStatus {
    /// Stable lowercase label (used in rule conditions and records).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Downloading => "downloading",
            Self::Seeding => "seeding",
            Self::Paused => "paused",
            Self::Checking => "checking",
            Self::Queued => "queued",
            Self::Error => "error",
        }
    }

    /// Whether the torrent is announcing to its tracker.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Downloading | Self::Seeding)
    }
}

/// Transient descriptor of one torrent as reported by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Torrent {
    /// Infohash (lowercase hex).
    pub hash: String,
    /// Display name.
    pub name: String,
    /// Selected payload size in bytes.
    pub size: u64,
    /// Full metainfo size in bytes (equals `size` when everything is selected).
    pub total_size: u64,
    /// Completed bytes.
    pub completed: u64,
    /// Completion fraction in `[0, 1]`.
    pub progress: f64,
    /// Coarse lifecycle state.
    pub status: TorrentStatus,
    /// Client-native state label (for rule conditions).
    pub state: String,
    /// Cumulative uploaded bytes for the client session.
    pub uploaded: u64,
    /// Cumulative downloaded bytes for the client session.
    pub downloaded: u64,
    /// Share ratio as reported by the client.
    pub ratio: f64,
    /// Instantaneous upload speed, bytes per second.
    pub upload_speed: u64,
    /// Instantaneous download speed, bytes per second.
    pub download_speed: u64,
    /// Swarm seed count.
    pub seeders: i64,
    /// Swarm leech count.
    pub leechers: i64,
    /// Connected seeds.
    pub seeds_connected: i64,
    /// Connected peers.
    pub peers_connected: i64,
    /// Primary tracker URL.
    pub tracker: String,
    /// Tracker status message, when the client exposes one.
    pub tracker_status: String,
    /// Tags attached to the torrent.
    pub tags: Vec<String>,
    /// Category or label.
    pub category: String,
    /// Download directory.
    pub save_path: String,
    /// When the torrent was added to the client.
    pub added_time: Option<DateTime<Utc>>,
    /// When the torrent finished downloading.
    pub completed_time: Option<DateTime<Utc>>,
    /// Accumulated seeding time in seconds.
    pub seeding_time: i64,
    /// Estimated seconds until completion (0 when unknown or complete).
    pub eta: i64,
    /// Normalized absolute unix time of the next tracker announce.
    pub next_announce_time: Option<f64>,
    /// Tracker-mandated announce interval in seconds (trusted only >= 300).
    pub announce_interval: Option<u32>,
}

/// Aggregate client statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloaderStats {
    /// Current aggregate upload speed, bytes per second.
    pub upload_speed: u64,
    /// Current aggregate download speed, bytes per second.
    pub download_speed: u64,
    /// Session-cumulative uploaded bytes.
    pub total_uploaded: u64,
    /// Session-cumulative downloaded bytes.
    pub total_downloaded: u64,
    /// Free space on the default download volume, bytes.
    pub free_space: u64,
    /// Number of torrents registered with the client.
    pub total_torrents: usize,
    /// Torrents currently downloading or seeding.
    pub active_torrents: usize,
    /// Torrents currently downloading.
    pub downloading_torrents: usize,
    /// Torrents currently seeding.
    pub seeding_torrents: usize,
}

/// Source describing how a torrent should be added to a client.
#[derive(Debug, Clone)]
pub enum TorrentSource {
    /// A magnet URI handed to the client untouched.
    Magnet(String),
    /// Raw bencoded `.torrent` payload.
    Metainfo(Vec<u8>),
}

/// Optional knobs applied alongside an add.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Download directory override.
    pub save_path: Option<String>,
    /// Category/label to assign.
    pub category: Option<String>,
    /// Tags to attach (clients without tag support ignore these).
    pub tags: Vec<String>,
    /// Add in the paused state.
    pub paused: bool,
    /// Per-torrent upload cap in bytes per second (0 = unlimited).
    pub upload_limit: u64,
    /// Per-torrent download cap in bytes per second (0 = unlimited).
    pub download_limit: u64,
    /// Prioritize first and last pieces.
    pub first_last_priority: bool,
}

/// Options for listing torrents.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// Enrich active torrents with normalized announce timing (extra
    /// per-torrent requests, batched with bounded parallelism).
    pub with_reannounce: bool,
}

/// Seconds in one day; announce times further out than this are junk.
const MAX_ANNOUNCE_HORIZON: f64 = 86_400.0;

/// Threshold separating "seconds remaining" from absolute unix timestamps.
const ABSOLUTE_TIME_FLOOR: f64 = 1e9;

/// Normalize a raw next-announce value to an absolute unix timestamp.
///
/// Values in `(0, 1e9]` are seconds-remaining; values in `(1e9, now + 86400]`
/// are already absolute. Everything else is unknown.
#[must_use]
pub fn normalize_next_announce(raw: f64, now: f64) -> Option<f64> {
    if raw <= 0.0 || !raw.is_finite() {
        return None;
    }
    let absolute = if raw <= ABSOLUTE_TIME_FLOOR {
        now + raw
    } else {
        raw
    };
    if absolute <= now || absolute > now + MAX_ANNOUNCE_HORIZON {
        return None;
    }
    Some(absolute)
}

/// Extract the host portion of a tracker URL (empty string when unparsable).
#[must_use]
pub fn tracker_domain(tracker_url: &str) -> String {
    url::Url::parse(tracker_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_maps_seconds_remaining() {
        let now = 1_700_000_000.0;
        assert_eq!(normalize_next_announce(1800.0, now), Some(now + 1800.0));
    }

    #[test]
    fn normalization_accepts_absolute_times_within_a_day() {
        let now = 1_700_000_000.0;
        let next = now + 3600.0;
        assert_eq!(normalize_next_announce(next, now), Some(next));
    }

    #[test]
    fn normalization_rejects_out_of_range_values() {
        let now = 1_700_000_000.0;
        assert_eq!(normalize_next_announce(0.0, now), None);
        assert_eq!(normalize_next_announce(-5.0, now), None);
        assert_eq!(normalize_next_announce(now - 10.0, now), None);
        assert_eq!(normalize_next_announce(now + 90_000.0, now), None);
        // A "remaining" value beyond the horizon is junk too.
        assert_eq!(normalize_next_announce(90_000.0, now), None);
    }

    #[test]
    fn tracker_domain_extracts_host() {
        assert_eq!(
            tracker_domain("https://tracker.example.org:8443/announce?passkey=x"),
            "tracker.example.org"
        );
        assert_eq!(tracker_domain(""), "");
        assert_eq!(tracker_domain("** [DHT] **"), "");
    }

    #[test]
    fn kind_round_trips_through_strings() {
        for kind in [
            DownloaderKind::Qbittorrent,
            DownloaderKind::Transmission,
            DownloaderKind::Deluge,
        ] {
            assert_eq!(DownloaderKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(DownloaderKind::parse("rtorrent"), None);
    }
}
