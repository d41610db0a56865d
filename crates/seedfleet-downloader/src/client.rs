use async_trait::async_trait;

use crate::{
    AddOptions, DownloaderError, DownloaderStats, ListOptions, Torrent, TorrentSource,
};

/// Uniform capability set exposed by every client flavor.
///
/// All operations require an open session (see [`crate::Session`]). Idempotent
/// queries retry internally per the adapter backoff policy; mutating calls do
/// not.
#[async_trait]
pub trait DownloaderClient: Send + Sync {
    /// Open a session against the client and verify credentials.
    async fn connect(&self) -> Result<(), DownloaderError>;

    /// Tear the session down. Best-effort; errors are swallowed.
    async fn disconnect(&self);

    /// List torrents, optionally enriched with normalized announce timing.
    async fn torrents(&self, opts: ListOptions) -> Result<Vec<Torrent>, DownloaderError>;

    /// Fetch one torrent by infohash.
    async fn torrent(&self, hash: &str) -> Result<Option<Torrent>, DownloaderError>;

    /// Aggregate transfer statistics and counts.
    async fn stats(&self) -> Result<DownloaderStats, DownloaderError>;

    /// Add a torrent and return its infohash.
    ///
    /// For metainfo payloads the hash is computed locally over the bencoded
    /// `info` dictionary and confirmed against the client's list.
    async fn add(&self, source: TorrentSource, opts: AddOptions)
        -> Result<String, DownloaderError>;

    /// Remove a torrent, optionally deleting its files.
    async fn remove(&self, hash: &str, delete_files: bool) -> Result<(), DownloaderError>;

    /// Pause a torrent.
    async fn pause(&self, hash: &str) -> Result<(), DownloaderError>;

    /// Resume a torrent.
    async fn resume(&self, hash: &str) -> Result<(), DownloaderError>;

    /// Force a tracker reannounce.
    async fn reannounce(&self, hash: &str) -> Result<(), DownloaderError>;

    /// Set a per-torrent upload cap in bytes per second (0 = unlimited).
    async fn set_upload_limit(&self, hash: &str, bytes_per_s: u64)
        -> Result<(), DownloaderError>;

    /// Set a per-torrent download cap in bytes per second (0 = unlimited).
    async fn set_download_limit(
        &self,
        hash: &str,
        bytes_per_s: u64,
    ) -> Result<(), DownloaderError>;

    /// Set the global upload cap in bytes per second (0 = unlimited).
    async fn set_global_upload_limit(&self, bytes_per_s: u64) -> Result<(), DownloaderError>;

    /// Set the global download cap in bytes per second (0 = unlimited).
    async fn set_global_download_limit(&self, bytes_per_s: u64) -> Result<(), DownloaderError>;

    /// Pause every torrent.
    async fn pause_all(&self) -> Result<(), DownloaderError>;

    /// Resume every torrent.
    async fn resume_all(&self) -> Result<(), DownloaderError>;

    /// Free space in bytes on the given path (client default when `None`).
    async fn free_space(&self, path: Option<&str>) -> Result<u64, DownloaderError>;

    /// Raw announce probe for one torrent: `(next_announce_unix,
    /// announce_interval_secs)`. Values are already normalized; intervals
    /// below 300 s are discarded (`min_announce` is never a cycle interval).
    async fn announce_info(
        &self,
        hash: &str,
    ) -> Result<(Option<f64>, Option<u32>), DownloaderError> {
        let _ = hash;
        Ok((None, None))
    }

    /// Primary tracker URL for one torrent, for clients whose listing leaves
    /// the tracker field blank until it is asked for explicitly.
    async fn tracker_url(&self, hash: &str) -> Result<Option<String>, DownloaderError> {
        let _ = hash;
        Ok(None)
    }
}
