#![forbid(unsafe_code)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![allow(clippy::module_name_repetitions)]

//! Process configuration for seedfleet.
//!
//! Everything the core needs from the outside world arrives through
//! environment variables; there is no CLI surface. Validation failures abort
//! startup: a process running with the default bootstrap secret or an empty
//! database URL must not come up.

mod error;
mod model;

pub use error::ConfigError;
pub use model::{AppConfig, DEFAULT_BOOTSTRAP_SECRET, DEFAULT_USER_AGENT};
