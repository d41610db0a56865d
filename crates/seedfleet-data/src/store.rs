use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use seedfleet_downloader::DownloaderKind;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::info;

use crate::model::{
    DeleteRuleEntity, DownloaderEntity, NewDeleteRecord, NewMagicRecord, NewRssRecord,
    NewSpeedLimitRecord, RssFeedEntity, RuleCondition, SpeedLimitConfigEntity,
    SpeedLimitSiteEntity,
};
use crate::{schema, DataError};

/// SQLite `IN (...)` lists are chunked to stay under the variable limit.
const IN_CHUNK: usize = 500;

/// Days of history the cleanup job retains.
const RETENTION_DAYS: i64 = 30;

/// A write transaction scoped to one tick; commit once at the end.
pub type StoreTransaction = Transaction<'static, Sqlite>;

/// Database-backed repository for every seedfleet entity and record.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) and bootstrap the database.
    ///
    /// # Errors
    ///
    /// Returns an error when the database is unreachable, the DDL fails, or a
    /// requested column migration is not whitelisted.
    pub async fn connect(database_url: &str) -> Result<Self, DataError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(DataError::Database)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Wrap an existing pool (tests) and bootstrap the schema.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Store::connect`].
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, DataError> {
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<(), DataError> {
        schema::bootstrap(&self.pool).await?;
        info!("database schema ready");
        Ok(())
    }

    /// Access the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction; callers commit once per tick.
    ///
    /// # Errors
    ///
    /// Returns the pool acquisition failure.
    pub async fn begin(&self) -> Result<StoreTransaction, DataError> {
        Ok(self.pool.begin().await?)
    }

    // ------------------------------------------------------------------
    // Downloaders
    // ------------------------------------------------------------------

    /// List downloaders, optionally only the enabled ones.
    ///
    /// # Errors
    ///
    /// Returns query or decode failures.
    pub async fn list_downloaders(
        &self,
        enabled_only: bool,
    ) -> Result<Vec<DownloaderEntity>, DataError> {
        let sql = if enabled_only {
            "SELECT * FROM downloaders WHERE enabled = 1 ORDER BY id"
        } else {
            "SELECT * FROM downloaders ORDER BY id"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(decode_downloader).collect()
    }

    /// Fetch one downloader by id.
    ///
    /// # Errors
    ///
    /// Returns query or decode failures.
    pub async fn get_downloader(&self, id: i64) -> Result<Option<DownloaderEntity>, DataError> {
        let row = sqlx::query("SELECT * FROM downloaders WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_downloader).transpose()
    }

    /// Insert a downloader and return its id.
    ///
    /// # Errors
    ///
    /// Returns the insert failure.
    pub async fn insert_downloader(&self, entity: &DownloaderEntity) -> Result<i64, DataError> {
        let result = sqlx::query(
            r"INSERT INTO downloaders
              (name, kind, host, port, username, password, use_tls, download_dir, enabled,
               auto_reannounce, auto_delete, auto_speed_limit, first_last_priority,
               max_upload_kib, max_download_kib, max_active_downloads, disk_space_warn_gib)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entity.name)
        .bind(entity.kind.as_str())
        .bind(&entity.host)
        .bind(i64::from(entity.port))
        .bind(&entity.username)
        .bind(&entity.password)
        .bind(entity.use_tls)
        .bind(&entity.download_dir)
        .bind(entity.enabled)
        .bind(entity.auto_reannounce)
        .bind(entity.auto_delete)
        .bind(entity.auto_speed_limit)
        .bind(entity.first_last_priority)
        .bind(entity.max_upload_kib)
        .bind(entity.max_download_kib)
        .bind(entity.max_active_downloads)
        .bind(entity.disk_space_warn_gib)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    // ------------------------------------------------------------------
    // RSS feeds and records
    // ------------------------------------------------------------------

    /// List enabled feeds.
    ///
    /// # Errors
    ///
    /// Returns query or decode failures.
    pub async fn list_enabled_feeds(&self) -> Result<Vec<RssFeedEntity>, DataError> {
        let rows = sqlx::query("SELECT * FROM rss_feeds WHERE enabled = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_feed).collect()
    }

    /// Insert a feed and return its id.
    ///
    /// # Errors
    ///
    /// Returns the insert failure.
    pub async fn insert_feed(&self, feed: &RssFeedEntity) -> Result<i64, DataError> {
        let result = sqlx::query(
            r"INSERT INTO rss_feeds
              (name, url, enabled, first_run_done, downloader_id, auto_assign, site_cookie,
               site_domain, fetch_interval_secs, only_free, exclude_hr, min_size_gib,
               max_size_gib, min_seeders, max_seeders, include_keywords, exclude_keywords,
               categories, max_upload_kib, max_download_kib, max_download_tasks, category,
               tags, save_path, last_fetch)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&feed.name)
        .bind(&feed.url)
        .bind(feed.enabled)
        .bind(feed.first_run_done)
        .bind(feed.downloader_id)
        .bind(feed.auto_assign)
        .bind(&feed.site_cookie)
        .bind(&feed.site_domain)
        .bind(feed.fetch_interval_secs)
        .bind(feed.only_free)
        .bind(feed.exclude_hr)
        .bind(feed.min_size_gib)
        .bind(feed.max_size_gib)
        .bind(feed.min_seeders)
        .bind(feed.max_seeders)
        .bind(&feed.include_keywords)
        .bind(&feed.exclude_keywords)
        .bind(&feed.categories)
        .bind(feed.max_upload_kib)
        .bind(feed.max_download_kib)
        .bind(feed.max_download_tasks)
        .bind(&feed.category)
        .bind(&feed.tags)
        .bind(&feed.save_path)
        .bind(feed.last_fetch)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Stamp a feed's fetch bookkeeping after a processing run.
    ///
    /// # Errors
    ///
    /// Returns the update failure.
    pub async fn mark_feed_fetched(
        &self,
        feed_id: i64,
        first_run_done: bool,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), DataError> {
        sqlx::query("UPDATE rss_feeds SET first_run_done = ?, last_fetch = ? WHERE id = ?")
            .bind(first_run_done)
            .bind(fetched_at)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Which of the given links already have a record for this feed.
    ///
    /// The lookup is chunked to respect SQLite's bound-variable limit.
    ///
    /// # Errors
    ///
    /// Returns query failures.
    pub async fn existing_rss_links(
        &self,
        feed_id: i64,
        links: &[String],
    ) -> Result<HashSet<String>, DataError> {
        let mut seen = HashSet::new();
        for chunk in links.chunks(IN_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT link FROM rss_records WHERE feed_id = ? AND link IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql).bind(feed_id);
            for link in chunk {
                query = query.bind(link);
            }
            let rows = query.fetch_all(&self.pool).await?;
            for row in rows {
                seen.insert(row.try_get::<String, _>("link")?);
            }
        }
        Ok(seen)
    }

    /// Append an RSS history row.
    ///
    /// # Errors
    ///
    /// Returns the insert failure (including unique-key violations on
    /// `(feed_id, link)`).
    pub async fn insert_rss_record(&self, record: &NewRssRecord) -> Result<(), DataError> {
        let download_time = record.downloaded.then(Utc::now);
        sqlx::query(
            r"INSERT INTO rss_records
              (feed_id, title, link, infohash, size, is_free, is_hr, seeders, leechers,
               downloaded, download_time, downloader_id, skip_reason, created_at)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.feed_id)
        .bind(&record.title)
        .bind(&record.link)
        .bind(&record.infohash)
        .bind(record.size)
        .bind(record.is_free)
        .bind(record.is_hr)
        .bind(record.seeders)
        .bind(record.leechers)
        .bind(record.downloaded)
        .bind(download_time)
        .bind(record.downloader_id)
        .bind(&record.skip_reason)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count RSS records for a feed (dashboards and tests).
    ///
    /// # Errors
    ///
    /// Returns query failures.
    pub async fn count_rss_records(&self, feed_id: i64) -> Result<i64, DataError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM rss_records WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    // ------------------------------------------------------------------
    // Delete rules, records and hysteresis
    // ------------------------------------------------------------------

    /// Enabled rules in execution order: priority descending, id ascending.
    ///
    /// # Errors
    ///
    /// Returns query or decode failures.
    pub async fn list_enabled_rules(&self) -> Result<Vec<DeleteRuleEntity>, DataError> {
        let rows = sqlx::query(
            "SELECT * FROM delete_rules WHERE enabled = 1 ORDER BY priority DESC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_rule).collect()
    }

    /// Insert a delete rule and return its id.
    ///
    /// # Errors
    ///
    /// Returns the insert failure.
    pub async fn insert_rule(&self, rule: &DeleteRuleEntity) -> Result<i64, DataError> {
        let conditions = serde_json::to_string(&rule.conditions).unwrap_or_else(|_| "[]".into());
        let downloader_ids =
            serde_json::to_string(&rule.downloader_ids).unwrap_or_else(|_| "[]".into());
        let result = sqlx::query(
            r"INSERT INTO delete_rules
              (name, enabled, priority, conditions, condition_logic, duration_secs,
               delete_files, only_delete_torrent, force_report, max_delete_count, pause,
               limit_speed, rule_kind, script, downloader_ids, tracker_filter, tag_filter)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rule.name)
        .bind(rule.enabled)
        .bind(rule.priority)
        .bind(conditions)
        .bind(&rule.condition_logic)
        .bind(rule.duration_secs)
        .bind(rule.delete_files)
        .bind(rule.only_delete_torrent)
        .bind(rule.force_report)
        .bind(rule.max_delete_count)
        .bind(rule.pause)
        .bind(rule.limit_speed)
        .bind(&rule.rule_kind)
        .bind(&rule.script)
        .bind(downloader_ids)
        .bind(&rule.tracker_filter)
        .bind(&rule.tag_filter)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Append a delete history row.
    ///
    /// # Errors
    ///
    /// Returns the insert failure.
    pub async fn insert_delete_record(&self, record: &NewDeleteRecord) -> Result<(), DataError> {
        sqlx::query(
            r"INSERT INTO delete_records
              (rule_id, rule_name, downloader_id, downloader_name, torrent_hash, torrent_name,
               size, uploaded, downloaded, ratio, seeding_time, tracker, files_deleted,
               reported, action, deleted_at)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.rule_id)
        .bind(&record.rule_name)
        .bind(record.downloader_id)
        .bind(&record.downloader_name)
        .bind(&record.torrent_hash)
        .bind(&record.torrent_name)
        .bind(record.size)
        .bind(record.uploaded)
        .bind(record.downloaded)
        .bind(record.ratio)
        .bind(record.seeding_time)
        .bind(&record.tracker)
        .bind(record.files_deleted)
        .bind(record.reported)
        .bind(&record.action)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load persisted hysteresis stamps for the given keys.
    ///
    /// # Errors
    ///
    /// Returns query failures.
    pub async fn load_hysteresis(
        &self,
        downloader_id: i64,
        keys: &[String],
    ) -> Result<HashMap<String, DateTime<Utc>>, DataError> {
        let mut stamps = HashMap::new();
        for chunk in keys.chunks(IN_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT key, condition_met_since FROM hysteresis \
                 WHERE downloader_id = ? AND key IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql).bind(downloader_id);
            for key in chunk {
                query = query.bind(key);
            }
            for row in query.fetch_all(&self.pool).await? {
                stamps.insert(
                    row.try_get::<String, _>("key")?,
                    row.try_get::<DateTime<Utc>, _>("condition_met_since")?,
                );
            }
        }
        Ok(stamps)
    }

    /// Record the first continuous-match instant for a key.
    ///
    /// An existing stamp is preserved: the timer must measure continuous
    /// match, not the latest observation.
    ///
    /// # Errors
    ///
    /// Returns the upsert failure.
    pub async fn stamp_hysteresis(
        &self,
        downloader_id: i64,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<(), DataError> {
        sqlx::query(
            r"INSERT INTO hysteresis (downloader_id, key, condition_met_since)
              VALUES (?, ?, ?)
              ON CONFLICT (downloader_id, key) DO NOTHING",
        )
        .bind(downloader_id)
        .bind(key)
        .bind(since)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop hysteresis stamps (condition stopped matching, or action fired).
    ///
    /// # Errors
    ///
    /// Returns the delete failure.
    pub async fn clear_hysteresis(
        &self,
        downloader_id: i64,
        keys: &[String],
    ) -> Result<(), DataError> {
        for chunk in keys.chunks(IN_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "DELETE FROM hysteresis WHERE downloader_id = ? AND key IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql).bind(downloader_id);
            for key in chunk {
                query = query.bind(key);
            }
            query.execute(&self.pool).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Limiter configuration and ledger
    // ------------------------------------------------------------------

    /// Fetch the limiter configuration singleton.
    ///
    /// # Errors
    ///
    /// Returns query failures.
    pub async fn speed_limit_config(&self) -> Result<Option<SpeedLimitConfigEntity>, DataError> {
        let row = sqlx::query("SELECT * FROM speed_limit_config WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(SpeedLimitConfigEntity {
                enabled: row.try_get("enabled")?,
                target_upload_speed: row.try_get("target_upload_speed")?,
                safety_margin: row.try_get("safety_margin")?,
                report_interval: row.try_get("report_interval")?,
            })
        })
        .transpose()
    }

    /// Upsert the limiter configuration singleton.
    ///
    /// # Errors
    ///
    /// Returns the upsert failure.
    pub async fn set_speed_limit_config(
        &self,
        config: &SpeedLimitConfigEntity,
    ) -> Result<(), DataError> {
        sqlx::query(
            r"INSERT INTO speed_limit_config (id, enabled, target_upload_speed, safety_margin, report_interval)
              VALUES (1, ?, ?, ?, ?)
              ON CONFLICT (id) DO UPDATE SET
                enabled = excluded.enabled,
                target_upload_speed = excluded.target_upload_speed,
                safety_margin = excluded.safety_margin,
                report_interval = excluded.report_interval",
        )
        .bind(config.enabled)
        .bind(config.target_upload_speed)
        .bind(config.safety_margin)
        .bind(config.report_interval)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// List per-site limiter overrides.
    ///
    /// # Errors
    ///
    /// Returns query or decode failures.
    pub async fn list_site_rules(&self) -> Result<Vec<SpeedLimitSiteEntity>, DataError> {
        let rows = sqlx::query("SELECT * FROM speed_limit_sites WHERE enabled = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(SpeedLimitSiteEntity {
                    id: row.try_get("id")?,
                    tracker_domain: row.try_get("tracker_domain")?,
                    enabled: row.try_get("enabled")?,
                    target_upload_speed: row.try_get("target_upload_speed")?,
                    safety_margin: row.try_get("safety_margin")?,
                    limit_download_speed: row.try_get("limit_download_speed")?,
                    optimize_announce: row.try_get("optimize_announce")?,
                    age_based_interval: row.try_get("age_based_interval")?,
                    peerlist_enabled: row.try_get("peerlist_enabled")?,
                    peerlist_cookie: row.try_get("peerlist_cookie")?,
                    peerlist_time_mode: row.try_get("peerlist_time_mode")?,
                    custom_announce_interval: row.try_get("custom_announce_interval")?,
                    site_url: row.try_get("site_url")?,
                })
            })
            .collect()
    }

    /// Insert a per-site limiter override and return its id.
    ///
    /// # Errors
    ///
    /// Returns the insert failure.
    pub async fn insert_site_rule(&self, site: &SpeedLimitSiteEntity) -> Result<i64, DataError> {
        let result = sqlx::query(
            r"INSERT INTO speed_limit_sites
              (tracker_domain, enabled, target_upload_speed, safety_margin,
               limit_download_speed, optimize_announce, age_based_interval, peerlist_enabled,
               peerlist_cookie, peerlist_time_mode, custom_announce_interval, site_url)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&site.tracker_domain)
        .bind(site.enabled)
        .bind(site.target_upload_speed)
        .bind(site.safety_margin)
        .bind(site.limit_download_speed)
        .bind(site.optimize_announce)
        .bind(site.age_based_interval)
        .bind(site.peerlist_enabled)
        .bind(&site.peerlist_cookie)
        .bind(&site.peerlist_time_mode)
        .bind(site.custom_announce_interval)
        .bind(&site.site_url)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Append a bandwidth-ledger row inside the tick's transaction.
    ///
    /// # Errors
    ///
    /// Returns the insert failure.
    pub async fn insert_speed_limit_record(
        &self,
        tx: &mut StoreTransaction,
        record: &NewSpeedLimitRecord,
    ) -> Result<(), DataError> {
        sqlx::query(
            r"INSERT INTO speed_limit_records
              (tracker_domain, downloader_id, current_speed, target_speed, limit_applied,
               phase, uploaded, downloaded, created_at)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.tracker_domain)
        .bind(record.downloader_id)
        .bind(record.current_speed)
        .bind(record.target_speed)
        .bind(record.limit_applied)
        .bind(&record.phase)
        .bind(record.uploaded)
        .bind(record.downloaded)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Append a promotion-feed history row.
    ///
    /// # Errors
    ///
    /// Returns the insert failure.
    pub async fn insert_magic_record(&self, record: &NewMagicRecord) -> Result<(), DataError> {
        sqlx::query(
            r"INSERT INTO magic_records
              (torrent_id, torrent_name, torrent_hash, magic_kind, duration_hours, seeders,
               leechers, size, downloaded, skip_reason, created_at)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.torrent_id)
        .bind(&record.torrent_name)
        .bind(&record.torrent_hash)
        .bind(&record.magic_kind)
        .bind(record.duration_hours)
        .bind(record.seeders)
        .bind(record.leechers)
        .bind(record.size)
        .bind(record.downloaded)
        .bind(&record.skip_reason)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Key-value singletons
    // ------------------------------------------------------------------

    /// Read a singleton value.
    ///
    /// # Errors
    ///
    /// Returns query failures.
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, DataError> {
        let row = sqlx::query("SELECT value FROM system_settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| Ok(row.try_get("value")?)).transpose()
    }

    /// Write a singleton value.
    ///
    /// # Errors
    ///
    /// Returns the upsert failure.
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), DataError> {
        sqlx::query(
            r"INSERT INTO system_settings (key, value) VALUES (?, ?)
              ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write a singleton value inside an open transaction.
    ///
    /// # Errors
    ///
    /// Returns the upsert failure.
    pub async fn set_setting_tx(
        &self,
        tx: &mut StoreTransaction,
        key: &str,
        value: &str,
    ) -> Result<(), DataError> {
        sqlx::query(
            r"INSERT INTO system_settings (key, value) VALUES (?, ?)
              ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    /// Delete history rows older than the retention window. Undownloaded RSS
    /// and magic rows are pruned; downloaded ones are kept as provenance.
    ///
    /// # Errors
    ///
    /// Returns the first delete failure.
    pub async fn prune_history(&self) -> Result<u64, DataError> {
        let cutoff = Utc::now() - Duration::days(RETENTION_DAYS);
        let mut removed = 0;
        removed += sqlx::query("DELETE FROM speed_limit_records WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        removed += sqlx::query("DELETE FROM rss_records WHERE created_at < ? AND downloaded = 0")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        removed += sqlx::query("DELETE FROM delete_records WHERE deleted_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        removed +=
            sqlx::query("DELETE FROM magic_records WHERE created_at < ? AND downloaded = 0")
                .bind(cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(removed)
    }
}

fn decode_downloader(row: &SqliteRow) -> Result<DownloaderEntity, DataError> {
    let kind: String = row.try_get("kind")?;
    let kind = DownloaderKind::parse(&kind).ok_or_else(|| DataError::Corrupt {
        context: "downloader.kind",
        reason: format!("unknown client flavor {kind:?}"),
    })?;
    let port: i64 = row.try_get("port")?;
    Ok(DownloaderEntity {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind,
        host: row.try_get("host")?,
        port: u16::try_from(port).map_err(|_| DataError::Corrupt {
            context: "downloader.port",
            reason: format!("{port} out of range"),
        })?,
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        use_tls: row.try_get("use_tls")?,
        download_dir: row.try_get("download_dir")?,
        enabled: row.try_get("enabled")?,
        auto_reannounce: row.try_get("auto_reannounce")?,
        auto_delete: row.try_get("auto_delete")?,
        auto_speed_limit: row.try_get("auto_speed_limit")?,
        first_last_priority: row.try_get("first_last_priority")?,
        max_upload_kib: row.try_get("max_upload_kib")?,
        max_download_kib: row.try_get("max_download_kib")?,
        max_active_downloads: row.try_get("max_active_downloads")?,
        disk_space_warn_gib: row.try_get("disk_space_warn_gib")?,
    })
}

fn decode_feed(row: &SqliteRow) -> Result<RssFeedEntity, DataError> {
    Ok(RssFeedEntity {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        enabled: row.try_get("enabled")?,
        first_run_done: row.try_get("first_run_done")?,
        downloader_id: row.try_get("downloader_id")?,
        auto_assign: row.try_get("auto_assign")?,
        site_cookie: row.try_get("site_cookie")?,
        site_domain: row.try_get("site_domain")?,
        fetch_interval_secs: row.try_get("fetch_interval_secs")?,
        only_free: row.try_get("only_free")?,
        exclude_hr: row.try_get("exclude_hr")?,
        min_size_gib: row.try_get("min_size_gib")?,
        max_size_gib: row.try_get("max_size_gib")?,
        min_seeders: row.try_get("min_seeders")?,
        max_seeders: row.try_get("max_seeders")?,
        include_keywords: row.try_get("include_keywords")?,
        exclude_keywords: row.try_get("exclude_keywords")?,
        categories: row.try_get("categories")?,
        max_upload_kib: row.try_get("max_upload_kib")?,
        max_download_kib: row.try_get("max_download_kib")?,
        max_download_tasks: row.try_get("max_download_tasks")?,
        category: row.try_get("category")?,
        tags: row.try_get("tags")?,
        save_path: row.try_get("save_path")?,
        last_fetch: row.try_get("last_fetch")?,
    })
}

fn decode_rule(row: &SqliteRow) -> Result<DeleteRuleEntity, DataError> {
    let conditions: String = row.try_get("conditions")?;
    let conditions: Vec<RuleCondition> =
        serde_json::from_str(&conditions).map_err(|err| DataError::Corrupt {
            context: "delete_rule.conditions",
            reason: err.to_string(),
        })?;
    let downloader_ids: String = row.try_get("downloader_ids")?;
    let downloader_ids: Vec<i64> =
        serde_json::from_str(&downloader_ids).map_err(|err| DataError::Corrupt {
            context: "delete_rule.downloader_ids",
            reason: err.to_string(),
        })?;
    Ok(DeleteRuleEntity {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        enabled: row.try_get("enabled")?,
        priority: row.try_get("priority")?,
        conditions,
        condition_logic: row.try_get("condition_logic")?,
        duration_secs: row.try_get("duration_secs")?,
        delete_files: row.try_get("delete_files")?,
        only_delete_torrent: row.try_get("only_delete_torrent")?,
        force_report: row.try_get("force_report")?,
        max_delete_count: row.try_get("max_delete_count")?,
        pause: row.try_get("pause")?,
        limit_speed: row.try_get("limit_speed")?,
        rule_kind: row.try_get("rule_kind")?,
        script: row.try_get("script")?,
        downloader_ids,
        tracker_filter: row.try_get("tracker_filter")?,
        tag_filter: row.try_get("tag_filter")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{schema, DELETE_CHECK_INTERVAL_KEY, SPEED_LIMITER_STATE_KEY};

    async fn memory_store() -> Store {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("open in-memory database");
        Store::from_pool(pool).await.expect("bootstrap")
    }

    fn sample_downloader() -> DownloaderEntity {
        DownloaderEntity {
            id: 0,
            name: "qb-main".into(),
            kind: DownloaderKind::Qbittorrent,
            host: "127.0.0.1".into(),
            port: 8080,
            username: "admin".into(),
            password: "adminadmin".into(),
            use_tls: false,
            download_dir: "/downloads".into(),
            enabled: true,
            auto_reannounce: true,
            auto_delete: true,
            auto_speed_limit: true,
            first_last_priority: false,
            max_upload_kib: 0,
            max_download_kib: 0,
            max_active_downloads: 0,
            disk_space_warn_gib: 10,
        }
    }

    fn sample_feed() -> RssFeedEntity {
        RssFeedEntity {
            id: 0,
            name: "demo".into(),
            url: "https://pt.example.org/rss?passkey=abc".into(),
            enabled: true,
            first_run_done: false,
            downloader_id: None,
            auto_assign: true,
            site_cookie: String::new(),
            site_domain: "pt.example.org".into(),
            fetch_interval_secs: 300,
            only_free: false,
            exclude_hr: false,
            min_size_gib: 0.0,
            max_size_gib: 0.0,
            min_seeders: 0,
            max_seeders: 0,
            include_keywords: String::new(),
            exclude_keywords: String::new(),
            categories: String::new(),
            max_upload_kib: 0,
            max_download_kib: 0,
            max_download_tasks: 0,
            category: String::new(),
            tags: String::new(),
            save_path: String::new(),
            last_fetch: None,
        }
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let store = memory_store().await;
        schema::bootstrap(store.pool()).await.expect("second run");
    }

    #[tokio::test]
    async fn downloader_round_trip() {
        let store = memory_store().await;
        let id = store
            .insert_downloader(&sample_downloader())
            .await
            .expect("insert");
        let loaded = store.get_downloader(id).await.expect("get").expect("some");
        assert_eq!(loaded.name, "qb-main");
        assert_eq!(loaded.kind, DownloaderKind::Qbittorrent);
        assert_eq!(loaded.port, 8080);
        assert!(loaded.auto_speed_limit);
        assert_eq!(store.list_downloaders(true).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn rss_link_dedup_index_holds() {
        let store = memory_store().await;
        let feed_id = store.insert_feed(&sample_feed()).await.expect("feed");
        let record = NewRssRecord {
            feed_id,
            title: "Demo".into(),
            link: "https://pt.example.org/download.php?id=1".into(),
            ..NewRssRecord::default()
        };
        store.insert_rss_record(&record).await.expect("first insert");
        assert!(
            store.insert_rss_record(&record).await.is_err(),
            "duplicate (feed_id, link) must be rejected"
        );
        let seen = store
            .existing_rss_links(feed_id, &[record.link.clone(), "other".into()])
            .await
            .expect("lookup");
        assert!(seen.contains(&record.link));
        assert!(!seen.contains("other"));
    }

    #[tokio::test]
    async fn rule_round_trip_preserves_conditions_and_order() {
        let store = memory_store().await;
        let mut rule = DeleteRuleEntity {
            id: 0,
            name: "ratio".into(),
            enabled: true,
            priority: 5,
            conditions: vec![RuleCondition {
                field: "ratio".into(),
                operator: "gte".into(),
                value: serde_json::json!(3.0),
                unit: None,
                duration: Some(600.0),
                duration_unit: Some("seconds".into()),
            }],
            condition_logic: "AND".into(),
            duration_secs: 0,
            delete_files: true,
            only_delete_torrent: false,
            force_report: true,
            max_delete_count: 2,
            pause: false,
            limit_speed: 0,
            rule_kind: "conditions".into(),
            script: String::new(),
            downloader_ids: vec![],
            tracker_filter: String::new(),
            tag_filter: String::new(),
        };
        store.insert_rule(&rule).await.expect("insert high");
        rule.name = "low".into();
        rule.priority = 1;
        store.insert_rule(&rule).await.expect("insert low");

        let rules = store.list_enabled_rules().await.expect("list");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name, "ratio");
        assert_eq!(rules[1].name, "low");
        assert_eq!(rules[0].conditions.len(), 1);
        assert_eq!(rules[0].conditions[0].duration, Some(600.0));
    }

    #[tokio::test]
    async fn hysteresis_keeps_earliest_stamp_and_clears() {
        let store = memory_store().await;
        let early = Utc::now() - Duration::seconds(500);
        let key = "r7:abcdef".to_string();
        store.stamp_hysteresis(1, &key, early).await.expect("stamp");
        store
            .stamp_hysteresis(1, &key, Utc::now())
            .await
            .expect("re-stamp");
        let stamps = store
            .load_hysteresis(1, std::slice::from_ref(&key))
            .await
            .expect("load");
        let stored = stamps.get(&key).expect("present");
        assert!((*stored - early).num_seconds().abs() < 2);

        store
            .clear_hysteresis(1, std::slice::from_ref(&key))
            .await
            .expect("clear");
        assert!(store
            .load_hysteresis(1, std::slice::from_ref(&key))
            .await
            .expect("load")
            .is_empty());
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let store = memory_store().await;
        assert!(store
            .get_setting(SPEED_LIMITER_STATE_KEY)
            .await
            .expect("get")
            .is_none());
        store
            .set_setting(DELETE_CHECK_INTERVAL_KEY, "120")
            .await
            .expect("set");
        store
            .set_setting(DELETE_CHECK_INTERVAL_KEY, "180")
            .await
            .expect("overwrite");
        assert_eq!(
            store
                .get_setting(DELETE_CHECK_INTERVAL_KEY)
                .await
                .expect("get")
                .as_deref(),
            Some("180")
        );
    }

    #[tokio::test]
    async fn ledger_rows_commit_with_the_transaction() {
        let store = memory_store().await;
        let mut tx = store.begin().await.expect("begin");
        store
            .insert_speed_limit_record(
                &mut tx,
                &NewSpeedLimitRecord {
                    tracker_domain: "tracker.example.org".into(),
                    downloader_id: 1,
                    uploaded: 1024,
                    phase: "steady".into(),
                    ..NewSpeedLimitRecord::default()
                },
            )
            .await
            .expect("insert");
        store
            .set_setting_tx(&mut tx, SPEED_LIMITER_STATE_KEY, "{}")
            .await
            .expect("state");
        tx.commit().await.expect("commit");

        let row = sqlx::query("SELECT COUNT(*) AS n FROM speed_limit_records")
            .fetch_one(store.pool())
            .await
            .expect("count");
        let n: i64 = row.try_get("n").expect("n");
        assert_eq!(n, 1);
        assert_eq!(
            store
                .get_setting(SPEED_LIMITER_STATE_KEY)
                .await
                .expect("get")
                .as_deref(),
            Some("{}")
        );
    }

    #[tokio::test]
    async fn non_whitelisted_migration_is_rejected() {
        let store = memory_store().await;
        let err = schema::ensure_column(store.pool(), "downloaders", "sneaky; DROP TABLE x")
            .await
            .expect_err("must refuse");
        assert!(matches!(err, DataError::MigrationNotWhitelisted { .. }));
    }

    #[tokio::test]
    async fn prune_removes_only_stale_undownloaded_rows() {
        let store = memory_store().await;
        let feed_id = store.insert_feed(&sample_feed()).await.expect("feed");
        // A fresh record survives.
        store
            .insert_rss_record(&NewRssRecord {
                feed_id,
                title: "fresh".into(),
                link: "l1".into(),
                ..NewRssRecord::default()
            })
            .await
            .expect("insert");
        // Backdate one undownloaded and one downloaded row past retention.
        let stale = Utc::now() - Duration::days(45);
        for (link, downloaded) in [("l2", 0), ("l3", 1)] {
            sqlx::query(
                "INSERT INTO rss_records (feed_id, title, link, downloaded, created_at) \
                 VALUES (?, 'old', ?, ?, ?)",
            )
            .bind(feed_id)
            .bind(link)
            .bind(downloaded)
            .bind(stale)
            .execute(store.pool())
            .await
            .expect("backdated insert");
        }

        let removed = store.prune_history().await.expect("prune");
        assert_eq!(removed, 1, "only the stale undownloaded row goes");
        assert_eq!(store.count_rss_records(feed_id).await.expect("count"), 2);
    }
}
