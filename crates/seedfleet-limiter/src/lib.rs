#![forbid(unsafe_code)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![allow(clippy::module_name_repetitions)]

//! Announce-cycle upload-speed control.
//!
//! For every active torrent the limiter holds the upload volume between two
//! tracker announces under a target while staying as close to that target as
//! it can. The core is a set of composed value-type controllers (cycle sync,
//! Kalman speed filter, multi-window tracker, phased PID, quantizer, smoother,
//! long-run precision correction) driven by a tick service that talks to the
//! downloader adapters and writes the bandwidth ledger.

pub mod core;
mod service;
mod sites;

pub use service::{LimiterService, TickSummary};
pub use sites::{peerlist_last_announce, SiteCache};
