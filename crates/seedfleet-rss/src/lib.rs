#![forbid(unsafe_code)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![allow(clippy::module_name_repetitions)]

//! RSS ingestion pipeline.
//!
//! Per due feed: fetch, extract entries across the assorted tracker feed
//! dialects, normalize download links (passkey propagation included), dedup
//! against the feed's history, optionally verify free status on the detail
//! page, filter, pick a downloader and add. The first processing of a new
//! feed records its entries without downloading anything.

mod extract;
mod filter;
mod link;
mod service;

pub use extract::{extract_entries, EntryInfo};
pub use filter::filter_entry;
pub use link::normalize_download_link;
pub use service::{FeedOutcome, RssService};
