//! Compiled-expression host for script-mode rules.
//!
//! The predecessor of these rules accepted arbitrary JavaScript; here they
//! are boolean expressions over the same field catalog, with no loops and no
//! I/O. Oversized or failing expressions evaluate to false: a malformed rule
//! must never delete anything.

use evalexpr::{ContextWithMutableVariables, HashMapContext, Value};
use tracing::warn;

use crate::context::EvalContext;

/// Expressions beyond this length are rejected outright.
const MAX_SCRIPT_LENGTH: usize = 10_000;

/// Evaluate a script rule against one torrent. Fail-closed.
#[must_use]
pub fn evaluate_script(code: &str, ctx: &EvalContext) -> bool {
    let code = code.trim();
    if code.is_empty() {
        return false;
    }
    if code.len() > MAX_SCRIPT_LENGTH {
        warn!(length = code.len(), "script rule exceeds the length cap");
        return false;
    }

    let mut variables = HashMapContext::new();
    let numeric_fields: &[(&str, f64)] = &[
        ("progress", ctx.progress_percent),
        ("seeding_time", ctx.seeding_time),
        ("uploaded", ctx.uploaded),
        ("downloaded", ctx.downloaded),
        ("ratio", ctx.ratio),
        ("true_ratio", ctx.true_ratio),
        ("ratio3", ctx.ratio3),
        ("upload_speed", ctx.upload_speed),
        ("download_speed", ctx.download_speed),
        ("size", ctx.size),
        ("total_size", ctx.total_size),
        ("completed", ctx.completed),
        ("added_time", ctx.added_time),
        ("completed_time", ctx.completed_time),
        ("seeders", ctx.seeders),
        ("leechers", ctx.leechers),
        ("seeds_connected", ctx.seeds_connected),
        ("peers_connected", ctx.peers_connected),
        ("free_space", ctx.free_space),
        ("leeching_count", ctx.leeching_count),
        ("seeding_count", ctx.seeding_count),
        ("global_upload_speed", ctx.global_upload_speed),
        ("global_download_speed", ctx.global_download_speed),
        ("second_from_zero", ctx.second_from_zero),
    ];
    let string_fields: &[(&str, &str)] = &[
        ("tracker", &ctx.tracker),
        ("tracker_status", &ctx.tracker_status),
        ("tags", &ctx.tags),
        ("category", &ctx.category),
        ("name", &ctx.name),
        ("status", &ctx.status),
        ("state", &ctx.state),
        ("save_path", &ctx.save_path),
    ];

    for (key, value) in numeric_fields {
        if variables
            .set_value((*key).to_string(), Value::Float(*value))
            .is_err()
        {
            return false;
        }
    }
    for (key, value) in string_fields {
        if variables
            .set_value((*key).to_string(), Value::String((*value).to_string()))
            .is_err()
        {
            return false;
        }
    }

    match evalexpr::eval_boolean_with_context(code, &variables) {
        Ok(result) => result,
        Err(err) => {
            warn!(error = %err, "script rule failed to evaluate; treating as no-match");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use seedfleet_downloader::{Torrent, TorrentStatus};

    fn ctx() -> EvalContext {
        let torrent = Torrent {
            hash: "aabbcc".into(),
            name: "Some.Release".into(),
            size: 10 << 30,
            total_size: 10 << 30,
            completed: 10 << 30,
            progress: 1.0,
            status: TorrentStatus::Seeding,
            state: "stalledUP".into(),
            uploaded: 30 << 30,
            downloaded: 10 << 30,
            ratio: 3.0,
            upload_speed: 1024,
            download_speed: 0,
            seeders: 12,
            leechers: 3,
            seeds_connected: 2,
            peers_connected: 1,
            tracker: "https://tracker.example.org/announce".into(),
            tracker_status: String::new(),
            tags: vec!["pt".into()],
            category: "movies".into(),
            save_path: "/data".into(),
            added_time: Some(Utc::now()),
            completed_time: None,
            seeding_time: 90_000,
            eta: 0,
            next_announce_time: None,
            announce_interval: None,
        };
        EvalContext::build(&torrent, None)
    }

    #[test]
    fn boolean_expressions_over_fields() {
        let ctx = ctx();
        assert!(evaluate_script("ratio >= 3.0 && seeding_time > 86400", &ctx));
        assert!(!evaluate_script("ratio > 5.0", &ctx));
        assert!(evaluate_script(
            "tracker == \"tracker.example.org\" && seeders > 10",
            &ctx
        ));
    }

    #[test]
    fn failures_are_fail_closed() {
        let ctx = ctx();
        assert!(!evaluate_script("", &ctx));
        assert!(!evaluate_script("ratio >", &ctx));
        assert!(!evaluate_script("unknown_variable > 1", &ctx));
        // Non-boolean result.
        assert!(!evaluate_script("ratio + 1", &ctx));
    }

    #[test]
    fn oversized_scripts_are_rejected() {
        let ctx = ctx();
        let big = vec!["ratio > 0.0"; 1200].join(" && ");
        assert!(big.len() > MAX_SCRIPT_LENGTH);
        assert!(!evaluate_script(&big, &ctx));
    }
}
