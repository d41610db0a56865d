#![forbid(unsafe_code)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![allow(clippy::module_name_repetitions)]

//! Persistence layer for seedfleet.
//!
//! One SQLite database holds the configuration entities, the append-only
//! history tables and a key-value singleton table for opaque JSON state
//! blobs. Schema bootstrap is idempotent; column migrations are additive and
//! guarded by a whitelist so configuration can never smuggle DDL.

mod error;
mod model;
mod schema;
mod store;

pub use error::DataError;
pub use model::{
    DeleteRuleEntity, DownloaderEntity, NewDeleteRecord, NewMagicRecord, NewRssRecord,
    NewSpeedLimitRecord, RssFeedEntity, RuleCondition, SpeedLimitConfigEntity,
    SpeedLimitSiteEntity,
};
pub use store::{Store, StoreTransaction};

/// Key under which the limiter serializes its state blob.
pub const SPEED_LIMITER_STATE_KEY: &str = "speed_limiter_state";

/// Key holding the delete-check interval override in seconds.
pub const DELETE_CHECK_INTERVAL_KEY: &str = "delete_check_interval_seconds";
