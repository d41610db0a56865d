use regex::Regex;
use seedfleet_data::{DeleteRuleEntity, RuleCondition};
use serde_json::Value;
use tracing::debug;

use crate::context::EvalContext;
use crate::script::evaluate_script;

/// Explicit unit multipliers to base units (bytes, bytes/s, seconds).
fn unit_multiplier(unit: &str) -> f64 {
    match unit {
        "minutes" => 60.0,
        "hours" => 3600.0,
        "days" => 86_400.0,
        "KB" | "KB/s" => 1024.0,
        "MB" | "MB/s" => 1024.0 * 1024.0,
        "GB" => 1024.0 * 1024.0 * 1024.0,
        "TB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    }
}

/// Fields whose thresholds are entered in GiB while the backend holds bytes.
const SIZE_FIELDS_GB: &[&str] = &[
    "size",
    "totalSize",
    "total_size",
    "completed",
    "downloaded",
    "uploaded",
    "freeSpace",
    "free_space",
    "selected_size",
    "selectedSize",
];

/// Fields whose thresholds are entered in KB/s while the backend holds B/s.
const SPEED_FIELDS_KBS: &[&str] = &[
    "uploadSpeed",
    "upload_speed",
    "downloadSpeed",
    "download_speed",
    "globalUploadSpeed",
    "global_upload_speed",
    "globalDownloadSpeed",
    "global_download_speed",
];

/// Default multiplier applied to a threshold for a given field.
fn field_default_multiplier(field: &str) -> f64 {
    if SIZE_FIELDS_GB.contains(&field) {
        1024.0 * 1024.0 * 1024.0
    } else if SPEED_FIELDS_KBS.contains(&field) {
        1024.0
    } else {
        1.0
    }
}

/// Parse a numeric threshold, accepting `a*b` product syntax.
fn parse_numeric_value(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s
            .split('*')
            .map(|part| part.trim().parse::<f64>())
            .try_fold(1.0, |acc, part| part.map(|p| acc * p))
            .unwrap_or(0.0),
        _ => 0.0,
    }
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Evaluate a single condition. Any malformed input evaluates to false.
#[must_use]
pub fn evaluate_condition(condition: &RuleCondition, ctx: &EvalContext) -> bool {
    let field = condition.field.as_str();
    let operator = condition.operator.as_str();

    if let Some(torrent_value) = ctx.numeric(field) {
        let mut compare = parse_numeric_value(&condition.value);
        match condition.unit.as_deref() {
            Some(unit) if !unit.is_empty() => compare *= unit_multiplier(unit),
            _ => compare *= field_default_multiplier(field),
        }
        // Progress is compared as a percentage, never unit-converted.
        if field == "progress" || field == "progress_percent" {
            compare = parse_numeric_value(&condition.value);
        }

        return match operator {
            "gt" | "bigger" => torrent_value > compare,
            "lt" | "smaller" => torrent_value < compare,
            "gte" => torrent_value >= compare,
            "lte" => torrent_value <= compare,
            "eq" | "equals" => (torrent_value - compare).abs() < 0.001,
            _ => false,
        };
    }

    if let Some(torrent_value) = ctx.string(field) {
        let torrent_str = torrent_value.to_lowercase();
        let compare_raw = value_as_string(&condition.value);
        let compare_str = compare_raw.to_lowercase();
        let compare_list: Vec<&str> = compare_str
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        return match operator {
            "contains" | "contain" => {
                if compare_list.is_empty() {
                    torrent_str.contains(&compare_str)
                } else {
                    compare_list.iter().any(|item| torrent_str.contains(item))
                }
            }
            "not_contains" | "notContain" => {
                if compare_list.is_empty() {
                    !torrent_str.contains(&compare_str)
                } else {
                    compare_list.iter().all(|item| !torrent_str.contains(item))
                }
            }
            "includeIn" => compare_list.contains(&torrent_str.as_str()),
            "notIncludeIn" => !compare_list.contains(&torrent_str.as_str()),
            "eq" | "equals" => torrent_str == compare_str,
            "neq" => torrent_str != compare_str,
            "regExp" => match Regex::new(&compare_raw) {
                Ok(re) => re.is_match(torrent_value),
                Err(_) => false,
            },
            "notRegExp" => match Regex::new(&compare_raw) {
                Ok(re) => !re.is_match(torrent_value),
                Err(_) => false,
            },
            _ => false,
        };
    }

    debug!(field, "condition references an unknown field");
    false
}

/// Evaluate a rule's full condition set under its AND/OR logic. Script rules
/// delegate to the expression host.
#[must_use]
pub fn evaluate_rule(rule: &DeleteRuleEntity, ctx: &EvalContext) -> bool {
    if rule.rule_kind == "script" {
        return evaluate_script(&rule.script, ctx);
    }
    if rule.conditions.is_empty() {
        return false;
    }

    let mut results = rule
        .conditions
        .iter()
        .map(|condition| evaluate_condition(condition, ctx));

    match rule.condition_logic.to_uppercase().as_str() {
        "AND" => results.all(|matched| matched),
        "OR" => results.any(|matched| matched),
        _ => false,
    }
}

/// The effective duration gate for a rule: the rule-level value or the
/// largest per-condition duration, whichever is greater.
#[must_use]
pub fn rule_duration_secs(rule: &DeleteRuleEntity) -> i64 {
    let mut max_duration = rule.duration_secs.max(0);
    for condition in &rule.conditions {
        if let Some(duration) = condition.duration {
            if duration > 0.0 {
                let unit = condition.duration_unit.as_deref().unwrap_or("seconds");
                let seconds = (duration * unit_multiplier(unit)) as i64;
                max_duration = max_duration.max(seconds);
            }
        }
    }
    max_duration
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use seedfleet_downloader::{Torrent, TorrentStatus};
    use serde_json::json;

    fn torrent() -> Torrent {
        Torrent {
            hash: "aabbcc".into(),
            name: "Some.Release.2160p.WEB-DL".into(),
            size: 10 << 30,
            total_size: 10 << 30,
            completed: 10 << 30,
            progress: 1.0,
            status: TorrentStatus::Seeding,
            state: "stalledUP".into(),
            uploaded: 30 << 30,
            downloaded: 10 << 30,
            ratio: 3.0,
            upload_speed: 2 * 1024 * 1024,
            download_speed: 0,
            seeders: 12,
            leechers: 3,
            seeds_connected: 2,
            peers_connected: 1,
            tracker: "https://tracker.example.org/announce".into(),
            tracker_status: "Working".into(),
            tags: vec!["pt".into()],
            category: "movies".into(),
            save_path: "/data".into(),
            added_time: Some(Utc::now() - chrono::Duration::days(2)),
            completed_time: None,
            seeding_time: 172_800,
            eta: 0,
            next_announce_time: None,
            announce_interval: None,
        }
    }

    fn cond(field: &str, operator: &str, value: Value) -> RuleCondition {
        RuleCondition {
            field: field.into(),
            operator: operator.into(),
            value,
            unit: None,
            duration: None,
            duration_unit: None,
        }
    }

    fn rule(conditions: Vec<RuleCondition>, logic: &str) -> DeleteRuleEntity {
        DeleteRuleEntity {
            id: 1,
            name: "test".into(),
            enabled: true,
            priority: 0,
            conditions,
            condition_logic: logic.into(),
            duration_secs: 0,
            delete_files: true,
            only_delete_torrent: false,
            force_report: false,
            max_delete_count: 0,
            pause: false,
            limit_speed: 0,
            rule_kind: "conditions".into(),
            script: String::new(),
            downloader_ids: vec![],
            tracker_filter: String::new(),
            tag_filter: String::new(),
        }
    }

    #[test]
    fn size_thresholds_default_to_gib() {
        let ctx = EvalContext::build(&torrent(), None);
        // uploaded is 30 GiB; threshold 20 (GiB) passes, 40 fails.
        assert!(evaluate_condition(&cond("uploaded", "gt", json!(20)), &ctx));
        assert!(!evaluate_condition(&cond("uploaded", "gt", json!(40)), &ctx));
    }

    #[test]
    fn explicit_unit_overrides_the_default() {
        let ctx = EvalContext::build(&torrent(), None);
        let mut condition = cond("uploaded", "gt", json!(25_000));
        condition.unit = Some("MB".into());
        // 25,000 MB < 30 GiB.
        assert!(evaluate_condition(&condition, &ctx));
    }

    #[test]
    fn speed_thresholds_default_to_kbs() {
        let ctx = EvalContext::build(&torrent(), None);
        // 2 MiB/s = 2048 KB/s.
        assert!(evaluate_condition(&cond("upload_speed", "gte", json!(2048)), &ctx));
        assert!(evaluate_condition(&cond("upload_speed", "lt", json!(4096)), &ctx));
    }

    #[test]
    fn progress_is_compared_as_percent() {
        let ctx = EvalContext::build(&torrent(), None);
        assert!(evaluate_condition(&cond("progress", "gte", json!(100)), &ctx));
        assert!(!evaluate_condition(&cond("progress", "lt", json!(50)), &ctx));
    }

    #[test]
    fn product_syntax_multiplies() {
        let ctx = EvalContext::build(&torrent(), None);
        // seeding_time 172800 s >= 2*86400.
        assert!(evaluate_condition(&cond("seeding_time", "gte", json!("2*86400")), &ctx));
    }

    #[test]
    fn string_operators() {
        let ctx = EvalContext::build(&torrent(), None);
        assert!(evaluate_condition(&cond("name", "contains", json!("web-dl")), &ctx));
        assert!(evaluate_condition(&cond("name", "not_contains", json!("x265,hdtv")), &ctx));
        assert!(evaluate_condition(&cond("category", "includeIn", json!("tv, movies")), &ctx));
        assert!(evaluate_condition(&cond("category", "notIncludeIn", json!("tv, music")), &ctx));
        assert!(evaluate_condition(&cond("tracker", "eq", json!("Tracker.Example.ORG")), &ctx));
        assert!(evaluate_condition(&cond("state", "neq", json!("pausedUP")), &ctx));
    }

    #[test]
    fn regex_operators_fail_closed() {
        let ctx = EvalContext::build(&torrent(), None);
        assert!(evaluate_condition(&cond("name", "regExp", json!(r"2160p|1080p")), &ctx));
        assert!(evaluate_condition(&cond("name", "notRegExp", json!(r"CAM")), &ctx));
        // Invalid patterns evaluate to false for both polarities.
        assert!(!evaluate_condition(&cond("name", "regExp", json!("(unclosed")), &ctx));
        assert!(!evaluate_condition(&cond("name", "notRegExp", json!("(unclosed")), &ctx));
    }

    #[test]
    fn unknown_field_or_operator_is_false() {
        let ctx = EvalContext::build(&torrent(), None);
        assert!(!evaluate_condition(&cond("bogus", "gt", json!(1)), &ctx));
        assert!(!evaluate_condition(&cond("ratio", "spaceship", json!(1)), &ctx));
    }

    #[test]
    fn and_or_logic() {
        let ctx = EvalContext::build(&torrent(), None);
        let high_ratio = cond("ratio", "gte", json!(3.0));
        let low_seeders = cond("seeders", "lt", json!(5));

        let both = rule(vec![high_ratio.clone(), low_seeders.clone()], "AND");
        assert!(!evaluate_rule(&both, &ctx), "seeders is 12, AND fails");

        let either = rule(vec![high_ratio, low_seeders], "OR");
        assert!(evaluate_rule(&either, &ctx));

        let empty = rule(vec![], "AND");
        assert!(!evaluate_rule(&empty, &ctx));
    }

    #[test]
    fn duration_gate_takes_the_maximum() {
        let mut r = rule(vec![cond("ratio", "gte", json!(1))], "AND");
        r.duration_secs = 300;
        r.conditions[0].duration = Some(10.0);
        r.conditions[0].duration_unit = Some("minutes".into());
        assert_eq!(rule_duration_secs(&r), 600);
    }
}
