//! Schema bootstrap and whitelisted additive migrations.
//!
//! Tables are created idempotently with the shape the project shipped with;
//! later columns arrive exclusively through `COLUMN_WHITELIST`. A requested
//! column outside the whitelist aborts startup: configuration data must never
//! be able to smuggle DDL into the database.

use sqlx::SqlitePool;
use tracing::info;

use crate::DataError;

pub(crate) const CREATE_TABLES: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS downloaders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        username TEXT NOT NULL DEFAULT '',
        password TEXT NOT NULL DEFAULT '',
        use_tls INTEGER NOT NULL DEFAULT 0,
        download_dir TEXT NOT NULL DEFAULT '',
        enabled INTEGER NOT NULL DEFAULT 1,
        auto_reannounce INTEGER NOT NULL DEFAULT 1,
        auto_delete INTEGER NOT NULL DEFAULT 1,
        auto_speed_limit INTEGER NOT NULL DEFAULT 0,
        max_upload_kib INTEGER NOT NULL DEFAULT 0,
        max_download_kib INTEGER NOT NULL DEFAULT 0,
        max_active_downloads INTEGER NOT NULL DEFAULT 0,
        disk_space_warn_gib INTEGER NOT NULL DEFAULT 10
    )",
    r"CREATE TABLE IF NOT EXISTS rss_feeds (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        first_run_done INTEGER NOT NULL DEFAULT 0,
        downloader_id INTEGER,
        auto_assign INTEGER NOT NULL DEFAULT 1,
        site_cookie TEXT NOT NULL DEFAULT '',
        site_domain TEXT NOT NULL DEFAULT '',
        fetch_interval_secs INTEGER NOT NULL DEFAULT 300,
        only_free INTEGER NOT NULL DEFAULT 0,
        exclude_hr INTEGER NOT NULL DEFAULT 0,
        min_size_gib REAL NOT NULL DEFAULT 0,
        max_size_gib REAL NOT NULL DEFAULT 0,
        min_seeders INTEGER NOT NULL DEFAULT 0,
        max_seeders INTEGER NOT NULL DEFAULT 0,
        include_keywords TEXT NOT NULL DEFAULT '',
        exclude_keywords TEXT NOT NULL DEFAULT '',
        categories TEXT NOT NULL DEFAULT '',
        max_upload_kib INTEGER NOT NULL DEFAULT 0,
        max_download_kib INTEGER NOT NULL DEFAULT 0,
        category TEXT NOT NULL DEFAULT '',
        tags TEXT NOT NULL DEFAULT '',
        save_path TEXT NOT NULL DEFAULT '',
        last_fetch TEXT
    )",
    r"CREATE TABLE IF NOT EXISTS rss_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        feed_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        link TEXT NOT NULL,
        infohash TEXT NOT NULL DEFAULT '',
        size INTEGER NOT NULL DEFAULT 0,
        is_free INTEGER NOT NULL DEFAULT 0,
        is_hr INTEGER NOT NULL DEFAULT 0,
        seeders INTEGER NOT NULL DEFAULT 0,
        leechers INTEGER NOT NULL DEFAULT 0,
        downloaded INTEGER NOT NULL DEFAULT 0,
        download_time TEXT,
        downloader_id INTEGER,
        skip_reason TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS delete_rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        priority INTEGER NOT NULL DEFAULT 0,
        conditions TEXT NOT NULL DEFAULT '[]',
        condition_logic TEXT NOT NULL DEFAULT 'AND',
        duration_secs INTEGER NOT NULL DEFAULT 0,
        delete_files INTEGER NOT NULL DEFAULT 1,
        only_delete_torrent INTEGER NOT NULL DEFAULT 0,
        force_report INTEGER NOT NULL DEFAULT 1,
        max_delete_count INTEGER NOT NULL DEFAULT 0,
        pause INTEGER NOT NULL DEFAULT 0,
        downloader_ids TEXT NOT NULL DEFAULT '[]',
        tracker_filter TEXT NOT NULL DEFAULT '',
        tag_filter TEXT NOT NULL DEFAULT ''
    )",
    r"CREATE TABLE IF NOT EXISTS delete_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        rule_id INTEGER NOT NULL,
        rule_name TEXT NOT NULL DEFAULT '',
        downloader_id INTEGER NOT NULL,
        downloader_name TEXT NOT NULL DEFAULT '',
        torrent_hash TEXT NOT NULL,
        torrent_name TEXT NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        uploaded INTEGER NOT NULL DEFAULT 0,
        downloaded INTEGER NOT NULL DEFAULT 0,
        ratio REAL NOT NULL DEFAULT 0,
        seeding_time INTEGER NOT NULL DEFAULT 0,
        tracker TEXT NOT NULL DEFAULT '',
        files_deleted INTEGER NOT NULL DEFAULT 0,
        reported INTEGER NOT NULL DEFAULT 0,
        action TEXT NOT NULL DEFAULT 'delete',
        deleted_at TEXT NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS speed_limit_config (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        enabled INTEGER NOT NULL DEFAULT 0,
        target_upload_speed REAL NOT NULL DEFAULT 0,
        safety_margin REAL NOT NULL DEFAULT 0.1,
        report_interval INTEGER NOT NULL DEFAULT 300
    )",
    r"CREATE TABLE IF NOT EXISTS speed_limit_sites (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tracker_domain TEXT NOT NULL UNIQUE,
        enabled INTEGER NOT NULL DEFAULT 1,
        target_upload_speed REAL NOT NULL DEFAULT 0,
        safety_margin REAL NOT NULL DEFAULT 0.1,
        limit_download_speed INTEGER NOT NULL DEFAULT 0,
        optimize_announce INTEGER NOT NULL DEFAULT 0,
        age_based_interval INTEGER NOT NULL DEFAULT 0,
        peerlist_enabled INTEGER NOT NULL DEFAULT 0,
        peerlist_cookie TEXT NOT NULL DEFAULT '',
        site_url TEXT NOT NULL DEFAULT ''
    )",
    r"CREATE TABLE IF NOT EXISTS speed_limit_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tracker_domain TEXT NOT NULL DEFAULT '',
        downloader_id INTEGER NOT NULL,
        current_speed REAL NOT NULL DEFAULT 0,
        target_speed REAL NOT NULL DEFAULT 0,
        limit_applied REAL NOT NULL DEFAULT 0,
        phase TEXT NOT NULL DEFAULT '',
        uploaded INTEGER NOT NULL DEFAULT 0,
        downloaded INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS magic_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        torrent_id TEXT NOT NULL,
        torrent_name TEXT NOT NULL,
        torrent_hash TEXT NOT NULL DEFAULT '',
        magic_kind TEXT NOT NULL DEFAULT '',
        duration_hours INTEGER NOT NULL DEFAULT 0,
        seeders INTEGER NOT NULL DEFAULT 0,
        leechers INTEGER NOT NULL DEFAULT 0,
        size INTEGER NOT NULL DEFAULT 0,
        downloaded INTEGER NOT NULL DEFAULT 0,
        skip_reason TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS hysteresis (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        downloader_id INTEGER NOT NULL,
        key TEXT NOT NULL,
        condition_met_since TEXT NOT NULL,
        UNIQUE (downloader_id, key)
    )",
    r"CREATE TABLE IF NOT EXISTS system_settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

pub(crate) const CREATE_INDEXES: &[&str] = &[
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_rss_records_feed_link ON rss_records (feed_id, link)",
    "CREATE INDEX IF NOT EXISTS ix_rss_records_created ON rss_records (created_at)",
    "CREATE INDEX IF NOT EXISTS ix_delete_records_deleted ON delete_records (deleted_at)",
    "CREATE INDEX IF NOT EXISTS ix_speed_limit_records_created ON speed_limit_records (created_at, downloader_id)",
    "CREATE INDEX IF NOT EXISTS ix_magic_records_created ON magic_records (created_at)",
];

/// Every additive column migration the process may ever apply.
/// `(table, column, DDL fragment after ADD COLUMN <name>)`.
const COLUMN_WHITELIST: &[(&str, &str, &str)] = &[
    (
        "downloaders",
        "first_last_priority",
        "INTEGER NOT NULL DEFAULT 0",
    ),
    (
        "rss_feeds",
        "max_download_tasks",
        "INTEGER NOT NULL DEFAULT 0",
    ),
    ("delete_rules", "limit_speed", "INTEGER NOT NULL DEFAULT 0"),
    (
        "delete_rules",
        "rule_kind",
        "TEXT NOT NULL DEFAULT 'conditions'",
    ),
    ("delete_rules", "script", "TEXT NOT NULL DEFAULT ''"),
    (
        "speed_limit_sites",
        "peerlist_time_mode",
        "TEXT NOT NULL DEFAULT 'elapsed'",
    ),
    (
        "speed_limit_sites",
        "custom_announce_interval",
        "INTEGER NOT NULL DEFAULT 0",
    ),
];

/// Column migrations applied at every startup, in order.
const PENDING_COLUMNS: &[(&str, &str)] = &[
    ("downloaders", "first_last_priority"),
    ("rss_feeds", "max_download_tasks"),
    ("delete_rules", "limit_speed"),
    ("delete_rules", "rule_kind"),
    ("delete_rules", "script"),
    ("speed_limit_sites", "peerlist_time_mode"),
    ("speed_limit_sites", "custom_announce_interval"),
];

pub(crate) async fn bootstrap(pool: &SqlitePool) -> Result<(), DataError> {
    for ddl in CREATE_TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }
    for ddl in CREATE_INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }
    for (table, column) in PENDING_COLUMNS {
        ensure_column(pool, table, column).await?;
    }
    Ok(())
}

/// Apply one additive column migration, verifying it against the whitelist.
pub(crate) async fn ensure_column(
    pool: &SqlitePool,
    table: &str,
    column: &str,
) -> Result<(), DataError> {
    let Some((_, _, ddl)) = COLUMN_WHITELIST
        .iter()
        .find(|(t, c, _)| *t == table && *c == column)
    else {
        return Err(DataError::MigrationNotWhitelisted {
            table: table.to_string(),
            column: column.to_string(),
        });
    };

    let existing: Vec<(String,)> =
        sqlx::query_as(&format!("SELECT name FROM pragma_table_info('{table}')"))
            .fetch_all(pool)
            .await?;
    if existing.iter().any(|(name,)| name == column) {
        return Ok(());
    }

    info!(table, column, "applying additive column migration");
    sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}"))
        .execute(pool)
        .await?;
    Ok(())
}
