//! Per-site helpers: bounded process-wide caches, peer-list idle probing,
//! TID resolution and the next-announce reliability check.
//!
//! PT sites are slow and rate-limited; everything scraped from them is cached
//! aggressively. TIDs and publish times never change and are kept until the
//! size cap trims them by insertion order; peer-list observations age with a
//! TTL and are extrapolated between fetches.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use seedfleet_data::SpeedLimitSiteEntity;
use tracing::debug;

use crate::core::TorrentState;

/// TID / publish-time cache cap.
const MAX_TID_ENTRIES: usize = 1000;
/// Peer-list cache cap.
const MAX_PEERLIST_ENTRIES: usize = 500;
/// Peer-list observations are reused for this long.
const PEERLIST_TTL: f64 = 120.0;
/// Peer-list entries older than this are dropped outright.
const PEERLIST_EXPIRE: f64 = 3600.0;

/// The ±900 s offset a forced reannounce imprints on next-announce values.
const FORCED_REANNOUNCE_OFFSET: f64 = 900.0;

static TID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"details\.php\?id=(\d+)").expect("static regex"));
static DATETIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}").expect("static regex"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("static regex"));
static CLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d+):(\d{1,2})(?::(\d{1,2}))?\b").expect("static regex"));
static CJK_HMS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)\s*小时\s*(\d+)\s*分(?:钟)?\s*(\d+)\s*秒").expect("static regex")
});
static CJK_MS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s*分(?:钟)?\s*(\d+)\s*秒").expect("static regex"));
static CJK_S_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d+)\s*秒\b").expect("static regex"));

/// Process-wide scrape caches with explicit cleanup.
#[derive(Debug, Default)]
pub struct SiteCache {
    tid: HashMap<String, (u64, String)>,
    publish_time: HashMap<String, (u64, f64)>,
    peerlist: HashMap<String, (f64, i64)>,
    seq: u64,
}

impl SiteCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached TID for an infohash.
    #[must_use]
    pub fn tid(&self, hash: &str) -> Option<&str> {
        self.tid.get(hash).map(|(_, tid)| tid.as_str())
    }

    /// Remember a TID forever (subject to the size cap).
    pub fn store_tid(&mut self, hash: &str, tid: String) {
        self.seq += 1;
        self.tid.insert(hash.to_string(), (self.seq, tid));
    }

    /// Cached publish time for an infohash.
    #[must_use]
    pub fn publish_time(&self, hash: &str) -> Option<f64> {
        self.publish_time.get(hash).map(|(_, ts)| *ts)
    }

    /// Remember a publish time forever (subject to the size cap).
    pub fn store_publish_time(&mut self, hash: &str, timestamp: f64) {
        self.seq += 1;
        self.publish_time
            .insert(hash.to_string(), (self.seq, timestamp));
    }

    /// Peer-list seconds for an infohash, extrapolated to `now`.
    ///
    /// `elapsed` observations grow with wall time, `remaining` ones shrink.
    #[must_use]
    pub fn peerlist_seconds(&self, hash: &str, time_mode: &str, now: f64) -> Option<i64> {
        let (fetched_at, seconds) = self.peerlist.get(hash)?;
        let age = now - fetched_at;
        if age >= PEERLIST_TTL {
            return None;
        }
        let current = if time_mode == "remaining" {
            (*seconds as f64 - age).max(0.0)
        } else {
            *seconds as f64 + age
        };
        Some(current as i64)
    }

    /// Store a fresh peer-list observation.
    pub fn store_peerlist_seconds(&mut self, hash: &str, now: f64, seconds: i64) {
        self.peerlist.insert(hash.to_string(), (now, seconds));
    }

    /// Trim expired entries and enforce size caps by insertion order.
    pub fn cleanup(&mut self, now: f64) {
        self.peerlist
            .retain(|_, (fetched_at, _)| now - *fetched_at < PEERLIST_EXPIRE);
        if self.peerlist.len() > MAX_PEERLIST_ENTRIES {
            let mut entries: Vec<(String, f64)> = self
                .peerlist
                .iter()
                .map(|(hash, (t, _))| (hash.clone(), *t))
                .collect();
            entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            for (hash, _) in entries
                .iter()
                .take(self.peerlist.len() - MAX_PEERLIST_ENTRIES)
            {
                self.peerlist.remove(hash);
            }
        }
        trim_by_insertion(&mut self.tid, MAX_TID_ENTRIES);
        trim_by_insertion(&mut self.publish_time, MAX_TID_ENTRIES);
    }
}

fn trim_by_insertion<T>(map: &mut HashMap<String, (u64, T)>, cap: usize) {
    if map.len() <= cap {
        return;
    }
    let mut seqs: Vec<(String, u64)> = map
        .iter()
        .map(|(key, (seq, _))| (key.clone(), *seq))
        .collect();
    seqs.sort_by_key(|(_, seq)| *seq);
    for (key, _) in seqs.iter().take(map.len() - cap) {
        map.remove(key);
    }
}

/// One poll of the next-announce reliability check.
///
/// The remaining time should decay linearly between polls. Deviations beyond
/// `max(120 s, 15% of the cycle)` that are not the ±900 s forced-reannounce
/// offset count as suspects; two in a row with no recent reannounce mark the
/// client's next-announce as untrusted for this torrent.
pub(crate) fn next_announce_untrusted(
    state: &mut TorrentState,
    next_remaining: f64,
    cycle_interval: f64,
    now: f64,
) -> bool {
    if cycle_interval <= 0.0 {
        return false;
    }

    if let (Some(last_remaining), true) =
        (state.last_next_remaining, state.last_next_update_time > 0.0)
    {
        let mut expected = last_remaining - (now - state.last_next_update_time);
        // Wrap through at most one cycle before comparing.
        if expected < 0.0 || expected > cycle_interval {
            expected = expected.rem_euclid(cycle_interval);
        }

        let diff = next_remaining - expected;
        let forced_like = (diff - FORCED_REANNOUNCE_OFFSET).abs() < 10.0
            || (diff + FORCED_REANNOUNCE_OFFSET).abs() < 10.0;
        let jump_threshold = (cycle_interval * 0.15).max(120.0);

        if !forced_like && diff.abs() > jump_threshold {
            state.next_jump_suspect_count += 1;
            debug!(
                torrent = %state.hash,
                diff = format!("{diff:.0}"),
                suspects = state.next_jump_suspect_count,
                "next-announce deviated from linear decay"
            );
        } else {
            state.next_jump_suspect_count = state.next_jump_suspect_count.saturating_sub(1);
        }
    }

    state.last_next_remaining = Some(next_remaining);
    state.last_next_update_time = now;

    if state.next_jump_suspect_count >= 2 {
        let recent_reannounce = (now - state.last_reannounce) < 120.0
            || (now - state.last_force_reannounce) < 120.0;
        if !recent_reannounce {
            return true;
        }
    }
    false
}

/// Parse the seconds value out of a peer-list page.
///
/// The last clock-formatted value in an occupied row is the idle column;
/// several CJK duration spellings appear on older site skins.
#[must_use]
pub(crate) fn parse_peerlist_seconds(html: &str) -> Option<i64> {
    let flattened = html.replace('\n', " ");
    for row in flattened.split("<tr") {
        if !row.contains("bgcolor") {
            continue;
        }
        let text = TAG_RE.replace_all(row, " ");

        if let Some(caps) = CLOCK_RE.captures_iter(&text).last() {
            let first: i64 = caps[1].parse().ok()?;
            let second: i64 = caps[2].parse().ok()?;
            let third: Option<i64> = caps.get(3).and_then(|m| m.as_str().parse().ok());
            return Some(match third {
                Some(seconds) => first * 3600 + second * 60 + seconds,
                None => first * 60 + second,
            });
        }
        if let Some(caps) = CJK_HMS_RE.captures(&text) {
            let (h, m, s): (i64, i64, i64) = (
                caps[1].parse().ok()?,
                caps[2].parse().ok()?,
                caps[3].parse().ok()?,
            );
            return Some(h * 3600 + m * 60 + s);
        }
        if let Some(caps) = CJK_MS_RE.captures(&text) {
            let (m, s): (i64, i64) = (caps[1].parse().ok()?, caps[2].parse().ok()?);
            return Some(m * 60 + s);
        }
        if let Some(caps) = CJK_S_RE.captures(&text) {
            if !text.contains('分') {
                return Some(caps[1].parse().ok()?);
            }
        }
    }
    None
}

/// Extract the TID and the earliest plausible publish time from a hash-search
/// results page.
#[must_use]
pub(crate) fn parse_search_page(html: &str, now: f64) -> (Option<String>, Option<f64>) {
    let tid = TID_RE
        .captures(html)
        .map(|caps| caps[1].to_string());

    let mut publish: Option<f64> = None;
    for m in DATETIME_RE.find_iter(html) {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(m.as_str(), "%Y-%m-%d %H:%M:%S") {
            let ts = parsed.and_utc().timestamp() as f64;
            // Future-dated times are promo deadlines, not publish times.
            if ts <= now + 60.0 {
                publish = Some(publish.map_or(ts, |current: f64| current.min(ts)));
            }
        }
    }
    (tid, publish)
}

/// Fetch the peer-list page for a TID and parse the seconds column.
pub(crate) async fn fetch_peerlist_seconds(
    http: &reqwest::Client,
    site: &SpeedLimitSiteEntity,
    tid: &str,
    user_agent: &str,
) -> Option<i64> {
    if site.peerlist_cookie.is_empty() || site.site_url.is_empty() {
        debug!("peer-list probe skipped: cookie or site URL missing");
        return None;
    }
    let url = format!(
        "{}/viewpeerlist.php?id={tid}",
        site.site_url.trim_end_matches('/')
    );
    let response = http
        .get(&url)
        .header(reqwest::header::USER_AGENT, user_agent)
        .header(reqwest::header::COOKIE, site.peerlist_cookie.clone())
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        debug!(status = response.status().as_u16(), "peer-list request failed");
        return None;
    }
    let body = response.text().await.ok()?;
    parse_peerlist_seconds(&body)
}

/// Resolve a torrent's TID (and publish time) by searching the site with the
/// infohash. NexusPHP convention: `search_area=5` is hash search.
pub(crate) async fn search_tid_by_hash(
    http: &reqwest::Client,
    site: &SpeedLimitSiteEntity,
    hash: &str,
    user_agent: &str,
    now: f64,
) -> (Option<String>, Option<f64>) {
    if site.peerlist_cookie.is_empty() || site.site_url.is_empty() {
        return (None, None);
    }
    let url = format!(
        "{}/torrents.php?search={hash}&search_area=5",
        site.site_url.trim_end_matches('/')
    );
    let Ok(response) = http
        .get(&url)
        .header(reqwest::header::USER_AGENT, user_agent)
        .header(reqwest::header::COOKIE, site.peerlist_cookie.clone())
        .send()
        .await
    else {
        return (None, None);
    };
    if !response.status().is_success() {
        debug!(status = response.status().as_u16(), "hash search failed");
        return (None, None);
    }
    let Ok(body) = response.text().await else {
        return (None, None);
    };
    parse_search_page(&body, now)
}

/// Derive the last announce time from a peer-list observation.
#[must_use]
pub fn peerlist_last_announce(seconds: i64, time_mode: &str, cycle_interval: f64, now: f64) -> f64 {
    if time_mode == "remaining" {
        now + seconds as f64 - cycle_interval
    } else {
        now - seconds as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peerlist_parses_clock_formats() {
        let html = r##"<table><tr bgcolor="#eee"><td>peer</td><td>1:23:45</td><td>12:34</td></tr></table>"##;
        // The last clock value in the row wins (idle column).
        assert_eq!(parse_peerlist_seconds(html), Some(12 * 60 + 34));

        let html = r#"<tr bgcolor="x"><td>3:05:09</td></tr>"#;
        assert_eq!(parse_peerlist_seconds(html), Some(3 * 3600 + 5 * 60 + 9));
    }

    #[test]
    fn peerlist_parses_cjk_formats() {
        let html = r#"<tr bgcolor="x"><td>5分30秒</td></tr>"#;
        assert_eq!(parse_peerlist_seconds(html), Some(330));
        let html = r#"<tr bgcolor="x"><td>1小时2分3秒</td></tr>"#;
        assert_eq!(parse_peerlist_seconds(html), Some(3723));
        let html = r#"<tr bgcolor="x"><td>42秒</td></tr>"#;
        assert_eq!(parse_peerlist_seconds(html), Some(42));
    }

    #[test]
    fn peerlist_ignores_rows_without_bgcolor() {
        let html = "<tr><td>10:00</td></tr>";
        assert_eq!(parse_peerlist_seconds(html), None);
    }

    #[test]
    fn search_page_yields_tid_and_earliest_past_time() {
        let now = 1_760_000_000.0;
        let html = r#"
            <table class="torrents">
              <tr><a href="details.php?id=12345">name</a>
                  <time>2024-01-02 03:04:05</time>
                  <time>2030-01-01 00:00:00</time>
              </tr>
            </table>"#;
        let (tid, publish) = parse_search_page(html, now);
        assert_eq!(tid.as_deref(), Some("12345"));
        let expected = NaiveDateTime::parse_from_str("2024-01-02 03:04:05", "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
            .timestamp() as f64;
        assert_eq!(publish, Some(expected));
    }

    #[test]
    fn search_page_rejects_future_only_times() {
        let now = 1_000_000.0;
        let html = r#"<a href="details.php?id=9"></a><time>2030-01-01 00:00:00</time>"#;
        let (tid, publish) = parse_search_page(html, now);
        assert_eq!(tid.as_deref(), Some("9"));
        assert_eq!(publish, None);
    }

    #[test]
    fn cache_extrapolates_by_time_mode() {
        let mut cache = SiteCache::new();
        cache.store_peerlist_seconds("aa", 1000.0, 60);
        assert_eq!(cache.peerlist_seconds("aa", "elapsed", 1030.0), Some(90));
        assert_eq!(cache.peerlist_seconds("aa", "remaining", 1030.0), Some(30));
        // Past the TTL the observation is not reused.
        assert_eq!(cache.peerlist_seconds("aa", "elapsed", 1000.0 + 150.0), None);
    }

    #[test]
    fn cleanup_trims_tid_cache_by_insertion_order() {
        let mut cache = SiteCache::new();
        for i in 0..(MAX_TID_ENTRIES + 10) {
            cache.store_tid(&format!("hash{i}"), format!("{i}"));
        }
        cache.cleanup(0.0);
        assert_eq!(cache.tid.len(), MAX_TID_ENTRIES);
        assert!(cache.tid("hash0").is_none(), "oldest entries trimmed");
        assert!(cache.tid(&format!("hash{}", MAX_TID_ENTRIES + 9)).is_some());
    }

    #[test]
    fn cleanup_expires_old_peerlist_entries() {
        let mut cache = SiteCache::new();
        cache.store_peerlist_seconds("old", 0.0, 60);
        cache.store_peerlist_seconds("new", 3000.0, 60);
        cache.cleanup(3700.0);
        assert!(cache.peerlist.contains_key("new"));
        assert!(!cache.peerlist.contains_key("old"));
    }

    fn state_with_interval() -> TorrentState {
        let mut state = TorrentState::new("aa", "Torrent", "t.example.org");
        state.cycle_synced = true;
        state.cycle_interval = 1800.0;
        state
    }

    #[test]
    fn linear_decay_keeps_next_announce_trusted() {
        let mut state = state_with_interval();
        assert!(!next_announce_untrusted(&mut state, 1700.0, 1800.0, 1000.0));
        assert!(!next_announce_untrusted(&mut state, 1640.0, 1800.0, 1060.0));
        assert!(!next_announce_untrusted(&mut state, 1580.0, 1800.0, 1120.0));
        assert_eq!(state.next_jump_suspect_count, 0);
    }

    #[test]
    fn two_consecutive_jumps_mark_untrusted() {
        let mut state = state_with_interval();
        assert!(!next_announce_untrusted(&mut state, 1700.0, 1800.0, 1000.0));
        // Expected ~1640, observed 300: way past the threshold.
        assert!(!next_announce_untrusted(&mut state, 300.0, 1800.0, 1060.0));
        assert_eq!(state.next_jump_suspect_count, 1);
        // Expected ~240, observed 1500: second suspect in a row.
        assert!(next_announce_untrusted(&mut state, 1500.0, 1800.0, 1120.0));
    }

    #[test]
    fn forced_reannounce_offset_is_tolerated() {
        let mut state = state_with_interval();
        assert!(!next_announce_untrusted(&mut state, 1700.0, 1800.0, 1000.0));
        // Expected 1640; observed 740 = expected - 900: the forced offset.
        assert!(!next_announce_untrusted(&mut state, 740.0, 1800.0, 1060.0));
        assert_eq!(state.next_jump_suspect_count, 0);
    }

    #[test]
    fn recent_reannounce_defers_the_verdict() {
        let mut state = state_with_interval();
        state.last_reannounce = 1110.0;
        assert!(!next_announce_untrusted(&mut state, 1700.0, 1800.0, 1000.0));
        assert!(!next_announce_untrusted(&mut state, 300.0, 1800.0, 1060.0));
        assert!(!next_announce_untrusted(&mut state, 1500.0, 1800.0, 1120.0));
        assert_eq!(state.next_jump_suspect_count, 2);
    }

    #[test]
    fn last_announce_derivation_by_time_mode() {
        let now = 10_000.0;
        assert!((peerlist_last_announce(600, "elapsed", 1800.0, now) - 9400.0).abs() < 1e-9);
        assert!(
            (peerlist_last_announce(600, "remaining", 1800.0, now) - (now + 600.0 - 1800.0)).abs()
                < 1e-9
        );
    }
}
