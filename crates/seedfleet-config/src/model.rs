use crate::ConfigError;

/// Secret value the image ships with; refusing to run with it is deliberate.
pub const DEFAULT_BOOTSTRAP_SECRET: &str = "change-me";

/// User agent presented to trackers and torrent clients.
pub const DEFAULT_USER_AGENT: &str = "seedfleet/0.1";

/// Fully resolved process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Connection URL for the relational store.
    pub database_url: String,
    /// Whether outbound HTTPS requests verify certificates.
    pub http_verify_tls: bool,
    /// User agent applied to PT-site and RSS requests.
    pub http_user_agent: String,
    /// Upper bound on concurrent free-status detail-page checks.
    pub rss_free_check_concurrency: usize,
    /// Whether missed scheduler runs collapse into a single deferred run.
    pub scheduler_coalesce: bool,
    /// Grace window in seconds before a late job run counts as missed.
    pub scheduler_misfire_grace_secs: u64,
    /// Secret used to bootstrap the first operator session.
    pub bootstrap_secret: String,
    /// Directory holding the database file and scratch state.
    pub data_dir: String,
}

impl AppConfig {
    /// Assemble the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error when a variable fails to parse or a fatal invariant
    /// (default secret) is violated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Assemble the configuration from an arbitrary lookup function.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`AppConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = lookup("SEEDFLEET_DATA_DIR").unwrap_or_else(|| "data".to_string());
        let database_url = lookup("DATABASE_URL")
            .unwrap_or_else(|| format!("sqlite://{}/seedfleet.db", data_dir.trim_end_matches('/')));

        let http_verify_tls = parse_flag(lookup("SEEDFLEET_HTTP_VERIFY_TLS").as_deref(), true);
        let http_user_agent =
            lookup("SEEDFLEET_HTTP_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        let rss_free_check_concurrency = parse_int(
            "SEEDFLEET_RSS_FREE_CHECK_CONCURRENCY",
            lookup("SEEDFLEET_RSS_FREE_CHECK_CONCURRENCY").as_deref(),
            8,
        )?;
        if rss_free_check_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "SEEDFLEET_RSS_FREE_CHECK_CONCURRENCY",
                reason: "must be at least 1".to_string(),
            });
        }

        let scheduler_coalesce = parse_flag(lookup("SEEDFLEET_JOB_COALESCE").as_deref(), true);
        let scheduler_misfire_grace_secs = parse_int(
            "SEEDFLEET_MISFIRE_GRACE_SECS",
            lookup("SEEDFLEET_MISFIRE_GRACE_SECS").as_deref(),
            60,
        )? as u64;

        let bootstrap_secret = lookup("SEEDFLEET_BOOTSTRAP_SECRET")
            .unwrap_or_else(|| DEFAULT_BOOTSTRAP_SECRET.to_string());
        let allow_default =
            parse_flag(lookup("SEEDFLEET_ALLOW_DEFAULT_SECRET").as_deref(), false);
        if bootstrap_secret == DEFAULT_BOOTSTRAP_SECRET && !allow_default {
            return Err(ConfigError::DefaultSecret);
        }

        Ok(Self {
            database_url,
            http_verify_tls,
            http_user_agent,
            rss_free_check_concurrency,
            scheduler_coalesce,
            scheduler_misfire_grace_secs,
            bootstrap_secret,
            data_dir,
        })
    }
}

fn parse_flag(value: Option<&str>, default: bool) -> bool {
    value.map_or(default, |v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn parse_int(
    field: &'static str,
    value: Option<&str>,
    default: usize,
) -> Result<usize, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|err| ConfigError::InvalidValue {
                field,
                reason: err.to_string(),
            }),
    }
}
