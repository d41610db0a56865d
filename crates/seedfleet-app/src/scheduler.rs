use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use seedfleet_config::AppConfig;
use seedfleet_data::{Store, DELETE_CHECK_INTERVAL_KEY};
use seedfleet_downloader::{ListOptions, Session};
use seedfleet_events::{Event, EventBus};
use seedfleet_limiter::LimiterService;
use seedfleet_rss::RssService;
use seedfleet_rules::DeleteEngine;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::jobs::CollaboratorJob;

/// Fixed cadence for the RSS / magic / auto-reannounce / netcup jobs.
const MINUTE_JOB_PERIOD: Duration = Duration::from_secs(60);

/// Cadence for the history cleanup job.
const CLEANUP_PERIOD: Duration = Duration::from_secs(6 * 3600);

/// Limiter loop pacing bounds, seconds.
const LIMITER_MIN_INTERVAL: f64 = 0.2;
const LIMITER_MAX_INTERVAL: f64 = 5.0;

/// Auto-reannounce age window after add: 4 min 30 s to 5 min 30 s.
const REANNOUNCE_WINDOW: (i64, i64) = (270, 330);

/// Clamp the limiter's suggested pause into the loop's bounds.
fn clamp_limiter_interval(suggested: f64) -> f64 {
    suggested.clamp(LIMITER_MIN_INTERVAL, LIMITER_MAX_INTERVAL)
}

/// Parse the delete-check interval setting, clamped to `[5, 3600]` seconds.
fn delete_interval_secs(raw: Option<&str>) -> u64 {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
        .map_or(60, |secs| secs.clamp(5, 3600) as u64)
}

/// Is a torrent's age inside the post-add reannounce window?
const fn in_reannounce_window(age_secs: i64) -> bool {
    age_secs > REANNOUNCE_WINDOW.0 && age_secs < REANNOUNCE_WINDOW.1
}

/// Process-wide scheduler: the dynamically paced limiter loop plus the fixed
/// interval jobs, each under single-flight discipline.
pub struct Scheduler {
    store: Store,
    events: EventBus,
    config: AppConfig,
    limiter: Arc<Mutex<LimiterService>>,
    rss: Arc<RssService>,
    delete_engine: Arc<DeleteEngine>,
    magic: Option<Arc<dyn CollaboratorJob>>,
    netcup: Option<Arc<dyn CollaboratorJob>>,
    limiter_loop_guard: Arc<Mutex<()>>,
}

/// Handle to a started scheduler; dropping it does not stop the jobs.
pub struct RunningScheduler {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Wire the scheduler over the shared services.
    #[must_use]
    pub fn new(
        store: Store,
        events: EventBus,
        config: AppConfig,
        limiter: Arc<Mutex<LimiterService>>,
        rss: Arc<RssService>,
        delete_engine: Arc<DeleteEngine>,
    ) -> Self {
        Self {
            store,
            events,
            config,
            limiter,
            rss,
            delete_engine,
            magic: None,
            netcup: None,
            limiter_loop_guard: Arc::new(Mutex::new(())),
        }
    }

    /// Attach the promotion-feed collaborator job.
    #[must_use]
    pub fn with_magic_job(mut self, job: Arc<dyn CollaboratorJob>) -> Self {
        self.magic = Some(job);
        self
    }

    /// Attach the Netcup monitor collaborator job.
    #[must_use]
    pub fn with_netcup_job(mut self, job: Arc<dyn CollaboratorJob>) -> Self {
        self.netcup = Some(job);
        self
    }

    /// Start every job and return the running handle.
    #[must_use]
    pub fn start(self) -> RunningScheduler {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        handles.push(self.spawn_limiter_loop(shutdown_rx.clone()));
        handles.push(self.spawn_rss_job(shutdown_rx.clone()));
        handles.push(self.spawn_delete_job(shutdown_rx.clone()));
        handles.push(self.spawn_auto_reannounce_job(shutdown_rx.clone()));
        handles.push(self.spawn_cleanup_job(shutdown_rx.clone()));
        if let Some(job) = &self.magic {
            handles.push(self.spawn_collaborator_job(Arc::clone(job), shutdown_rx.clone()));
        }
        if let Some(job) = &self.netcup {
            handles.push(self.spawn_collaborator_job(Arc::clone(job), shutdown_rx));
        }

        info!(jobs = handles.len(), "scheduler started");
        RunningScheduler {
            shutdown_tx,
            handles,
        }
    }

    /// The dynamic-interval limiter loop: tick, then sleep for as long as the
    /// tick suggests. A lifetime lock forbids a second loop instance.
    fn spawn_limiter_loop(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let limiter = Arc::clone(&self.limiter);
        let guard = Arc::clone(&self.limiter_loop_guard);
        let events = self.events.clone();
        tokio::spawn(async move {
            let Ok(_guard) = guard.try_lock_owned() else {
                warn!("limiter loop already running; refusing to double-start");
                return;
            };

            {
                let mut service = limiter.lock().await;
                if let Err(err) = service.load_state().await {
                    warn!(error = %err, "limiter state restore failed");
                }
            }

            info!("limiter loop running");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let pause = {
                    let mut service = limiter.lock().await;
                    match service.tick().await {
                        Ok(summary) => clamp_limiter_interval(summary.next_interval),
                        Err(err) => {
                            error!(error = %err, "limiter tick failed");
                            events.publish(Event::Error {
                                scope: "limiter".into(),
                                message: err.to_string(),
                            });
                            LIMITER_MAX_INTERVAL
                        }
                    }
                };
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_secs_f64(pause)) => {}
                    _ = shutdown.changed() => break,
                }
            }
            info!("limiter loop stopped");
        })
    }

    fn spawn_rss_job(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let rss = Arc::clone(&self.rss);
        self.spawn_fixed_job("rss_check", MINUTE_JOB_PERIOD, shutdown, move || {
            let rss = Arc::clone(&rss);
            async move {
                if let Err(err) = rss.run_due_feeds().await {
                    error!(error = %err, "rss check failed");
                }
            }
        })
    }

    /// The delete job re-reads its interval from the KV store every round so
    /// operator changes apply without a restart.
    fn spawn_delete_job(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = Arc::clone(&self.delete_engine);
        let store = self.store.clone();
        tokio::spawn(async move {
            loop {
                let interval = delete_interval_secs(
                    store
                        .get_setting(DELETE_CHECK_INTERVAL_KEY)
                        .await
                        .ok()
                        .flatten()
                        .as_deref(),
                );
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_secs(interval)) => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                match engine.run_all_rules().await {
                    Ok(report) => {
                        if report.deleted > 0 || report.other_actions > 0 {
                            info!(
                                deleted = report.deleted,
                                other = report.other_actions,
                                "delete rules acted"
                            );
                        }
                    }
                    Err(err) => error!(error = %err, "delete check failed"),
                }
            }
        })
    }

    /// Reannounce torrents whose age just passed five minutes, per downloader
    /// opt-in. Trackers that missed the initial announce pick these up.
    fn spawn_auto_reannounce_job(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = self.store.clone();
        let events = self.events.clone();
        self.spawn_fixed_job("auto_reannounce", MINUTE_JOB_PERIOD, shutdown, move || {
            let store = store.clone();
            let events = events.clone();
            async move {
                let downloaders = match store.list_downloaders(true).await {
                    Ok(list) => list,
                    Err(err) => {
                        error!(error = %err, "downloader listing failed");
                        return;
                    }
                };
                let now = Utc::now();
                for downloader in downloaders.iter().filter(|d| d.auto_reannounce) {
                    let session = match Session::open(&downloader.client_config()).await {
                        Ok(session) => session,
                        Err(err) => {
                            debug!(downloader = %downloader.name, error = %err, "unreachable");
                            events.publish(Event::DownloaderOffline {
                                downloader: downloader.name.clone(),
                            });
                            continue;
                        }
                    };
                    let mut reported = 0usize;
                    if let Ok(torrents) =
                        session.client().torrents(ListOptions::default()).await
                    {
                        for torrent in &torrents {
                            let Some(added) = torrent.added_time else {
                                continue;
                            };
                            let age = (now - added).num_seconds();
                            if in_reannounce_window(age)
                                && session.client().reannounce(&torrent.hash).await.is_ok()
                            {
                                reported += 1;
                            }
                        }
                    }
                    if reported > 0 {
                        info!(
                            downloader = %downloader.name,
                            count = reported,
                            "auto-reannounced fresh torrents"
                        );
                    }
                    session.close().await;
                }
            }
        })
    }

    fn spawn_cleanup_job(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = self.store.clone();
        self.spawn_fixed_job("record_cleanup", CLEANUP_PERIOD, shutdown, move || {
            let store = store.clone();
            async move {
                match store.prune_history().await {
                    Ok(removed) => info!(removed, "history retention applied"),
                    Err(err) => error!(error = %err, "history cleanup failed"),
                }
            }
        })
    }

    fn spawn_collaborator_job(
        &self,
        job: Arc<dyn CollaboratorJob>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        self.spawn_fixed_job(job.name(), MINUTE_JOB_PERIOD, shutdown, move || {
            let job = Arc::clone(&job);
            async move {
                if !job.enabled().await {
                    return;
                }
                if let Err(err) = job.run().await {
                    error!(job = job.name(), error = %err, "collaborator job failed");
                }
            }
        })
    }

    /// Spawn a fixed-interval job. Runs execute inline in the job's own task,
    /// so at most one instance exists; a run that overruns its period is
    /// coalesced into a single delayed tick instead of stacking.
    fn spawn_fixed_job<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
        job: F,
    ) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let coalesce = self.config.scheduler_coalesce;
        let grace = Duration::from_secs(self.config.scheduler_misfire_grace_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(if coalesce {
                MissedTickBehavior::Delay
            } else {
                MissedTickBehavior::Burst
            });
            // The first tick of a tokio interval fires immediately; skip it
            // so jobs start one period after boot.
            ticker.tick().await;
            let mut last_run = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                let late = last_run.elapsed().saturating_sub(period);
                if late > grace {
                    warn!(job = name, late_secs = late.as_secs(), "job misfired past grace");
                }
                job().await;
                last_run = tokio::time::Instant::now();
            }
            debug!(job = name, "job stopped");
        })
    }
}

impl RunningScheduler {
    /// Cooperative shutdown: signal every job, then wait for them briefly.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("job did not stop within the shutdown grace period");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_interval_clamps_to_loop_bounds() {
        assert!((clamp_limiter_interval(0.01) - 0.2).abs() < f64::EPSILON);
        assert!((clamp_limiter_interval(2.0) - 2.0).abs() < f64::EPSILON);
        assert!((clamp_limiter_interval(60.0) - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn delete_interval_parses_and_clamps() {
        assert_eq!(delete_interval_secs(None), 60);
        assert_eq!(delete_interval_secs(Some("120")), 120);
        assert_eq!(delete_interval_secs(Some("1")), 5);
        assert_eq!(delete_interval_secs(Some("999999")), 3600);
        assert_eq!(delete_interval_secs(Some("not-a-number")), 60);
    }

    #[test]
    fn reannounce_window_brackets_five_minutes() {
        assert!(!in_reannounce_window(200));
        assert!(!in_reannounce_window(270));
        assert!(in_reannounce_window(300));
        assert!(!in_reannounce_window(330));
        assert!(!in_reannounce_window(400));
    }
}
