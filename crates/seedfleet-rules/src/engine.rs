use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use seedfleet_data::{DeleteRuleEntity, DownloaderEntity, NewDeleteRecord, Store};
use seedfleet_downloader::{
    tracker_domain, DownloaderStats, ListOptions, Session, Torrent,
};
use seedfleet_events::{Event, EventBus};
use tracing::{debug, info, warn};

use crate::condition::{evaluate_rule, rule_duration_secs};
use crate::context::EvalContext;
use crate::hysteresis_key;

/// Wait after a pre-delete reannounce so the report reaches the tracker.
const FORCE_REPORT_GRACE: Duration = Duration::from_secs(2);

/// Outcome of one full rule pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleRunReport {
    /// Rules that were evaluated.
    pub rules_run: usize,
    /// Completed delete actions.
    pub deleted: usize,
    /// Completed pause/limit actions.
    pub other_actions: usize,
}

/// What a rule decided for the torrents of one downloader.
#[derive(Debug, Default)]
struct RulePlan {
    /// Indexes of torrents whose duration gate is satisfied.
    act: Vec<usize>,
    /// Keys matching for the first time, to be stamped.
    stamp: Vec<String>,
    /// Keys that stopped matching, to be cleared.
    clear: Vec<String>,
}

/// Pure planning step: evaluate the rule over every torrent and split them
/// into act / stamp / clear sets against the persisted hysteresis stamps.
fn plan_rule(
    rule: &DeleteRuleEntity,
    torrents: &[Torrent],
    stats: Option<&DownloaderStats>,
    stamps: &HashMap<String, DateTime<Utc>>,
    now: DateTime<Utc>,
) -> RulePlan {
    let duration_secs = rule_duration_secs(rule);
    let mut plan = RulePlan::default();

    for (index, torrent) in torrents.iter().enumerate() {
        let key = hysteresis_key(rule.id, &torrent.hash);

        if !rule.tracker_filter.is_empty() {
            let domain = tracker_domain(&torrent.tracker).to_lowercase();
            if !domain.contains(&rule.tracker_filter.to_lowercase()) {
                continue;
            }
        }
        if !rule.tag_filter.is_empty() {
            let tags = torrent.tags.join(",").to_lowercase();
            if !tags.contains(&rule.tag_filter.to_lowercase()) {
                continue;
            }
        }

        let ctx = EvalContext::build(torrent, stats);
        if evaluate_rule(rule, &ctx) {
            if duration_secs <= 0 {
                plan.act.push(index);
            } else if let Some(since) = stamps.get(&key) {
                if (now - *since).num_seconds() >= duration_secs {
                    plan.act.push(index);
                }
            } else {
                plan.stamp.push(key);
            }
        } else {
            plan.clear.push(key);
        }
    }

    plan
}

/// Rule-driven retirement service.
pub struct DeleteEngine {
    store: Store,
    events: EventBus,
}

impl DeleteEngine {
    /// Build the engine over the shared store and event bus.
    #[must_use]
    pub const fn new(store: Store, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Run every enabled rule in priority order.
    ///
    /// # Errors
    ///
    /// Returns storage failures; adapter failures are contained per rule.
    pub async fn run_all_rules(&self) -> Result<RuleRunReport> {
        let rules = self.store.list_enabled_rules().await?;
        let mut report = RuleRunReport::default();
        for rule in &rules {
            report.rules_run += 1;
            match self.execute_rule(rule, false, false).await {
                Ok((deleted, other)) => {
                    report.deleted += deleted;
                    report.other_actions += other;
                }
                Err(err) => {
                    warn!(rule = %rule.name, error = %err, "rule execution failed");
                    self.events.publish(Event::Error {
                        scope: "delete".into(),
                        message: format!("rule {} failed: {err}", rule.name),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Execute one rule across its downloader scope.
    ///
    /// `force_execute` (manual runs) ignores the downloader `auto_delete`
    /// gate; `force_delete_files` removes payload data regardless of the rule
    /// flags. Only completed actions count against `max_delete_count`.
    ///
    /// # Errors
    ///
    /// Returns storage failures.
    pub async fn execute_rule(
        &self,
        rule: &DeleteRuleEntity,
        force_execute: bool,
        force_delete_files: bool,
    ) -> Result<(usize, usize)> {
        let downloaders: Vec<DownloaderEntity> = self
            .store
            .list_downloaders(true)
            .await?
            .into_iter()
            .filter(|d| force_execute || d.auto_delete)
            .filter(|d| rule.downloader_ids.is_empty() || rule.downloader_ids.contains(&d.id))
            .collect();

        if downloaders.is_empty() {
            debug!(rule = %rule.name, "no downloaders in scope");
            return Ok((0, 0));
        }

        let mut deleted_records: Vec<NewDeleteRecord> = Vec::new();
        let mut other_actions = 0usize;
        let mut action_count = 0i64;

        'downloaders: for downloader in &downloaders {
            if rule.max_delete_count > 0 && action_count >= rule.max_delete_count {
                break;
            }

            let session = match Session::open(&downloader.client_config()).await {
                Ok(session) => session,
                Err(err) => {
                    warn!(downloader = %downloader.name, error = %err, "unreachable");
                    self.events.publish(Event::DownloaderOffline {
                        downloader: downloader.name.clone(),
                    });
                    continue;
                }
            };
            let client = session.client();

            let torrents = match client.torrents(ListOptions::default()).await {
                Ok(torrents) => torrents,
                Err(err) => {
                    warn!(downloader = %downloader.name, error = %err, "listing failed");
                    session.close().await;
                    continue;
                }
            };
            let stats = client.stats().await.ok();

            let keys: Vec<String> = torrents
                .iter()
                .map(|t| hysteresis_key(rule.id, &t.hash))
                .collect();
            let stamps = self.store.load_hysteresis(downloader.id, &keys).await?;
            let now = Utc::now();

            let plan = plan_rule(rule, &torrents, stats.as_ref(), &stamps, now);

            for key in &plan.stamp {
                self.store.stamp_hysteresis(downloader.id, key, now).await?;
            }
            if !plan.clear.is_empty() {
                self.store
                    .clear_hysteresis(downloader.id, &plan.clear)
                    .await?;
            }

            if !plan.act.is_empty() {
                info!(
                    rule = %rule.name,
                    downloader = %downloader.name,
                    matched = plan.act.len(),
                    "rule matched torrents with duration satisfied"
                );
            }

            for index in plan.act {
                if rule.max_delete_count > 0 && action_count >= rule.max_delete_count {
                    debug!(rule = %rule.name, "reached max action count");
                    session.close().await;
                    continue 'downloaders;
                }
                let torrent = &torrents[index];

                let delete_files =
                    force_delete_files || (rule.delete_files && !rule.only_delete_torrent);

                let (action, succeeded) = if rule.limit_speed > 0 {
                    let limit = rule.limit_speed as u64;
                    let up = client.set_upload_limit(&torrent.hash, limit).await;
                    let down = client.set_download_limit(&torrent.hash, limit).await;
                    ("limit", up.is_ok() && down.is_ok())
                } else if rule.pause {
                    ("pause", client.pause(&torrent.hash).await.is_ok())
                } else {
                    if rule.force_report {
                        if let Err(err) = client.reannounce(&torrent.hash).await {
                            debug!(error = %err, "pre-delete reannounce failed");
                        }
                        tokio::time::sleep(FORCE_REPORT_GRACE).await;
                    }
                    (
                        "delete",
                        client.remove(&torrent.hash, delete_files).await.is_ok(),
                    )
                };

                if !succeeded {
                    warn!(rule = %rule.name, torrent = %torrent.name, action, "action failed");
                    continue;
                }

                action_count += 1;
                let record = NewDeleteRecord {
                    rule_id: rule.id,
                    rule_name: rule.name.clone(),
                    downloader_id: downloader.id,
                    downloader_name: downloader.name.clone(),
                    torrent_hash: torrent.hash.clone(),
                    torrent_name: torrent.name.clone(),
                    size: torrent.size as i64,
                    uploaded: torrent.uploaded as i64,
                    downloaded: torrent.downloaded as i64,
                    ratio: torrent.ratio,
                    seeding_time: torrent.seeding_time,
                    tracker: tracker_domain(&torrent.tracker),
                    files_deleted: action == "delete" && delete_files,
                    reported: action == "delete" && rule.force_report,
                    action: action.to_string(),
                };
                self.store.insert_delete_record(&record).await?;
                self.store
                    .clear_hysteresis(
                        downloader.id,
                        &[hysteresis_key(rule.id, &torrent.hash)],
                    )
                    .await?;

                if action == "delete" {
                    info!(
                        rule = %rule.name,
                        torrent = %torrent.name,
                        delete_files,
                        "torrent deleted"
                    );
                    deleted_records.push(record);
                } else {
                    info!(rule = %rule.name, torrent = %torrent.name, action, "action applied");
                    other_actions += 1;
                }
            }

            session.close().await;
        }

        match deleted_records.len() {
            0 => {}
            1 => {
                let record = &deleted_records[0];
                self.events.publish(Event::Delete {
                    rule: rule.name.clone(),
                    torrent: record.torrent_name.clone(),
                    ratio: record.ratio,
                    seeding_secs: record.seeding_time,
                });
            }
            count => {
                let total_uploaded = deleted_records
                    .iter()
                    .map(|r| r.uploaded.max(0) as u64)
                    .sum();
                self.events.publish(Event::DeleteBatch {
                    rule: rule.name.clone(),
                    count,
                    total_uploaded,
                });
            }
        }

        Ok((deleted_records.len(), other_actions))
    }
}
