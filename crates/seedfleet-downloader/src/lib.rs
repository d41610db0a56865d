#![forbid(unsafe_code)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![allow(clippy::module_name_repetitions)]

//! Client-agnostic torrent adapter layer.
//!
//! Three client flavors (qBittorrent WebUI, Transmission RPC, Deluge WebUI
//! JSON-RPC) are expressed against one async capability set. Sessions are
//! scoped: callers open one per use, every operation requires it, and close is
//! best-effort on the way out. Idempotent requests retry with exponential
//! backoff; session-expiry responses trigger one silent re-login.

mod backoff;
mod bencode;
mod client;
mod deluge;
mod error;
mod model;
mod qbittorrent;
mod session;
mod transmission;

pub use bencode::infohash_from_metainfo;
pub use client::DownloaderClient;
pub use error::DownloaderError;
pub use model::{
    normalize_next_announce, tracker_domain, AddOptions, ClientConfig, DownloaderKind,
    DownloaderStats, ListOptions, Torrent, TorrentSource, TorrentStatus,
};
pub use session::Session;

/// Construct an unconnected client for the given connection parameters.
#[must_use]
pub fn create_client(config: &ClientConfig) -> Box<dyn DownloaderClient> {
    match config.kind {
        DownloaderKind::Qbittorrent => Box::new(qbittorrent::QbClient::new(config)),
        DownloaderKind::Transmission => Box::new(transmission::TransmissionClient::new(config)),
        DownloaderKind::Deluge => Box::new(deluge::DelugeClient::new(config)),
    }
}
