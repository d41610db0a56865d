#![forbid(unsafe_code)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![allow(clippy::module_name_repetitions)]

//! Process assembly for seedfleet.
//!
//! Bootstraps telemetry, configuration and the store, wires the limiter, RSS
//! and delete services onto the scheduler, and runs until interrupted. A
//! subsystem that dies stays down until restart while the rest of the process
//! keeps serving.

mod jobs;
mod scheduler;
mod telemetry;

pub use jobs::CollaboratorJob;
pub use scheduler::{RunningScheduler, Scheduler};

use std::sync::Arc;

use anyhow::{Context, Result};
use seedfleet_config::AppConfig;
use seedfleet_data::Store;
use seedfleet_events::EventBus;
use seedfleet_limiter::LimiterService;
use seedfleet_rss::RssService;
use seedfleet_rules::DeleteEngine;
use tokio::sync::Mutex;
use tracing::info;

/// Boot the full process and block until shutdown.
///
/// # Errors
///
/// Returns configuration, telemetry or storage failures, all of which are
/// fatal at startup.
pub async fn run_app() -> Result<()> {
    let config = AppConfig::from_env().context("configuration")?;
    telemetry::init_logging(&telemetry::LoggingConfig::default()).context("telemetry")?;

    info!("seedfleet bootstrap starting");

    let store = Store::connect(&config.database_url)
        .await
        .context("database bootstrap")?;
    let events = EventBus::new();

    let limiter = Arc::new(Mutex::new(LimiterService::new(
        store.clone(),
        events.clone(),
        config.http_user_agent.clone(),
        config.http_verify_tls,
    )));
    let rss = Arc::new(RssService::new(
        store.clone(),
        events.clone(),
        config.http_user_agent.clone(),
        config.http_verify_tls,
        config.rss_free_check_concurrency,
    ));
    let delete_engine = Arc::new(DeleteEngine::new(store.clone(), events.clone()));

    let scheduler = Scheduler::new(store, events, config, limiter, rss, delete_engine);
    let scheduler = scheduler.start();

    info!("seedfleet running; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("shutdown requested");
    scheduler.shutdown().await;
    info!("seedfleet stopped");
    Ok(())
}
