use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use seedfleet_data::{DownloaderEntity, NewRssRecord, RssFeedEntity, Store};
use seedfleet_downloader::{AddOptions, Session, TorrentSource};
use seedfleet_events::{Event, EventBus};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::extract::{extract_entries, EntryInfo};
use crate::filter::filter_entry;

static INFOHASH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-fA-F0-9]{40}").expect("static regex"));
static TORRENT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[?&]id=(\d+)").expect("static regex"));

/// Detail-page substrings that mark a torrent as free-leech.
const FREE_INDICATORS: &[&str] = &[
    "class=\"free\"",
    "class=\"pro_free\"",
    "pro_free",
    "freeleech",
    "免费",
    "免費",
    "promotion-free",
    "free_icon",
    "torrent-icons free",
    "\"free\"",
    "2x free",
    "2xfree",
];

/// Counters from one feed-processing run.
#[derive(Debug, Default, Clone, Copy)]
pub struct FeedOutcome {
    /// History rows inserted during the run.
    pub new_records: usize,
    /// Entries that passed the feed's filters.
    pub passed: usize,
    /// Entries handed to a downloader.
    pub downloaded: usize,
}

/// Feed ingestion service.
pub struct RssService {
    store: Store,
    events: EventBus,
    http: reqwest::Client,
    user_agent: String,
    free_check_limit: usize,
}

impl RssService {
    /// Build the service with a shared HTTP client for feed and site access.
    #[must_use]
    pub fn new(
        store: Store,
        events: EventBus,
        user_agent: String,
        verify_tls: bool,
        free_check_limit: usize,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(!verify_tls)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .unwrap_or_default();
        Self {
            store,
            events,
            http,
            user_agent,
            free_check_limit: free_check_limit.max(1),
        }
    }

    /// Process every enabled feed whose fetch interval has elapsed; due feeds
    /// run concurrently. Returns the number of feeds processed.
    ///
    /// # Errors
    ///
    /// Returns storage failures; per-feed failures are contained and logged.
    pub async fn run_due_feeds(&self) -> Result<usize> {
        let feeds = self.store.list_enabled_feeds().await?;
        let now = Utc::now();
        let due: Vec<RssFeedEntity> = feeds
            .into_iter()
            .filter(|feed| {
                feed.last_fetch.map_or(true, |last| {
                    (now - last).num_seconds() >= feed.fetch_interval_secs
                })
            })
            .collect();
        if due.is_empty() {
            return Ok(0);
        }

        info!(count = due.len(), "processing due RSS feeds");
        let results = join_all(due.iter().map(|feed| async move {
            match self.process_feed(feed).await {
                Ok(outcome) => {
                    if outcome.new_records > 0 {
                        info!(
                            feed = %feed.name,
                            new = outcome.new_records,
                            downloaded = outcome.downloaded,
                            "feed processed"
                        );
                    }
                }
                Err(err) => {
                    error!(feed = %feed.name, error = %err, "feed processing failed");
                    self.events.publish(Event::Error {
                        scope: "rss".into(),
                        message: format!("feed {} failed: {err}", feed.name),
                    });
                }
            }
        }))
        .await;
        Ok(results.len())
    }

    /// Fetch, extract and process one feed.
    ///
    /// # Errors
    ///
    /// Returns storage failures. Fetch and parse failures yield an empty run.
    pub async fn process_feed(&self, feed: &RssFeedEntity) -> Result<FeedOutcome> {
        let payload = self.fetch_feed_payload(feed).await;
        let entries = payload
            .as_deref()
            .map(|bytes| extract_entries(bytes, feed))
            .unwrap_or_default();
        self.process_entries(feed, entries).await
    }

    /// The pipeline after extraction: dedup, verify, filter, select, add,
    /// record. Split out so the flow is drivable without a network.
    pub(crate) async fn process_entries(
        &self,
        feed: &RssFeedEntity,
        entries: Vec<EntryInfo>,
    ) -> Result<FeedOutcome> {
        let mut outcome = FeedOutcome::default();

        // In-batch dedup, then history dedup against (feed_id, link).
        let mut seen = std::collections::HashSet::new();
        let mut candidates: Vec<EntryInfo> = Vec::new();
        for entry in entries {
            if entry.link.is_empty() || !seen.insert(entry.link.clone()) {
                continue;
            }
            candidates.push(entry);
        }
        let links: Vec<String> = candidates.iter().map(|e| e.link.clone()).collect();
        let existing = self.store.existing_rss_links(feed.id, &links).await?;
        let mut fresh: Vec<EntryInfo> = candidates
            .into_iter()
            .filter(|entry| !existing.contains(&entry.link))
            .collect();

        if fresh.is_empty() {
            self.store
                .mark_feed_fetched(feed.id, feed.first_run_done, Utc::now())
                .await?;
            return Ok(outcome);
        }

        // Free verification against the detail pages, politely bounded.
        if feed.only_free && !feed.site_cookie.is_empty() {
            let semaphore = Arc::new(Semaphore::new(self.free_check_limit));
            let checks = join_all(fresh.iter().map(|entry| {
                let semaphore = Arc::clone(&semaphore);
                let link = entry.link.clone();
                async move {
                    let _permit = semaphore.acquire().await.ok()?;
                    Some(self.check_free_status(&link, feed).await)
                }
            }))
            .await;
            for (entry, check) in fresh.iter_mut().zip(checks) {
                if let Some((is_free, infohash)) = check {
                    entry.is_free = entry.is_free || is_free;
                    if !infohash.is_empty() {
                        entry.infohash = infohash;
                    }
                }
            }
        }

        let mut best_downloader: Option<Option<DownloaderEntity>> = None;

        for entry in &fresh {
            let verdict = filter_entry(entry, feed);
            let passed = verdict.is_ok();
            if passed {
                outcome.passed += 1;
            }

            let mut record = NewRssRecord {
                feed_id: feed.id,
                title: entry.title.clone(),
                link: entry.link.clone(),
                infohash: entry.infohash.clone(),
                size: entry.size,
                is_free: entry.is_free,
                is_hr: entry.is_hr,
                seeders: entry.seeders,
                leechers: entry.leechers,
                downloaded: false,
                downloader_id: None,
                skip_reason: verdict.err().unwrap_or_default(),
            };

            if passed && feed.first_run_done {
                let downloader = if feed.auto_assign || feed.downloader_id.is_none() {
                    if best_downloader.is_none() {
                        best_downloader = Some(self.best_downloader().await);
                    }
                    best_downloader.clone().flatten()
                } else {
                    match feed.downloader_id {
                        Some(id) => self.store.get_downloader(id).await?,
                        None => None,
                    }
                };

                if let Some(downloader) = downloader {
                    if self.add_to_downloader(&entry.link, &downloader, feed).await {
                        record.downloaded = true;
                        record.downloader_id = Some(downloader.id);
                        outcome.downloaded += 1;
                        self.events.publish(Event::RssDownload {
                            feed: feed.name.clone(),
                            title: entry.title.clone(),
                            downloader: downloader.name.clone(),
                        });
                    } else {
                        record.skip_reason = "failed to add to downloader".into();
                    }
                } else {
                    warn!(feed = %feed.name, "no downloader available");
                    record.skip_reason = "no downloader available".into();
                }
            } else if passed {
                debug!(
                    feed = %feed.name,
                    title = %entry.title,
                    "first run: recorded without downloading"
                );
            }

            match self.store.insert_rss_record(&record).await {
                Ok(()) => outcome.new_records += 1,
                Err(err) => debug!(link = %record.link, error = %err, "record insert skipped"),
            }
        }

        self.store
            .mark_feed_fetched(feed.id, true, Utc::now())
            .await?;

        if outcome.downloaded > 1 {
            self.events.publish(Event::RssBatch {
                feed: feed.name.clone(),
                count: outcome.downloaded,
            });
        }
        Ok(outcome)
    }

    /// Fetch the raw feed body. Failures are logged with actionable detail
    /// and yield `None`; there are no retries against PT sites.
    async fn fetch_feed_payload(&self, feed: &RssFeedEntity) -> Option<Vec<u8>> {
        let mut request = self
            .http
            .get(&feed.url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .header(reqwest::header::ACCEPT, "*/*");
        if !feed.site_cookie.is_empty() {
            request = request.header(reqwest::header::COOKIE, feed.site_cookie.clone());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                error!(feed = %feed.name, error = %err, "feed request failed");
                return None;
            }
        };

        let status = response.status().as_u16();
        if status == 403 {
            let headers = format!("{:?}", response.headers());
            error!(
                feed = %feed.name,
                "HTTP 403: passkey invalid/expired, IP-restricted, or CloudFlare-guarded"
            );
            if headers.to_lowercase().contains("cf-ray") {
                error!(feed = %feed.name, "CloudFlare challenge detected on feed endpoint");
            }
            return None;
        }
        if status == 401 {
            error!(feed = %feed.name, "HTTP 401: feed authentication failed");
            return None;
        }
        if !(200..300).contains(&status) {
            error!(feed = %feed.name, status, "feed fetch failed");
            return None;
        }

        response.bytes().await.ok().map(|b| b.to_vec())
    }

    /// Visit the detail page to confirm free status and, when the page shows
    /// one, pick up the infohash.
    async fn check_free_status(&self, link: &str, feed: &RssFeedEntity) -> (bool, String) {
        let Some(detail_url) = details_url_from_link(link, &feed.url) else {
            return (false, String::new());
        };
        let response = self
            .http
            .get(&detail_url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .header(reqwest::header::COOKIE, feed.site_cookie.clone())
            .send()
            .await;
        let Ok(response) = response else {
            return (false, String::new());
        };
        if !response.status().is_success() {
            return (false, String::new());
        }
        let Ok(body) = response.text().await else {
            return (false, String::new());
        };
        let infohash = INFOHASH_RE
            .find(&body)
            .map(|m| m.as_str().to_lowercase())
            .unwrap_or_default();
        (is_free_page(&body), infohash)
    }

    /// The enabled downloader with the most free space.
    async fn best_downloader(&self) -> Option<DownloaderEntity> {
        let downloaders = self.store.list_downloaders(true).await.ok()?;
        let mut best: Option<(DownloaderEntity, u64)> = None;
        for downloader in downloaders {
            match Session::open(&downloader.client_config()).await {
                Ok(session) => {
                    if let Ok(free) = session.client().free_space(None).await {
                        let threshold = (downloader.disk_space_warn_gib.max(0) as u64) << 30;
                        if threshold > 0 && free < threshold {
                            self.events.publish(Event::LowDiskSpace {
                                downloader: downloader.name.clone(),
                                free_bytes: free,
                                threshold_bytes: threshold,
                            });
                        }
                        if best.as_ref().is_none_or(|(_, current)| free > *current) {
                            best = Some((downloader.clone(), free));
                        }
                    }
                    session.close().await;
                }
                Err(err) => {
                    debug!(downloader = %downloader.name, error = %err, "skipped for selection");
                }
            }
        }
        if let Some((downloader, free)) = &best {
            info!(
                downloader = %downloader.name,
                free_gib = free >> 30,
                "selected downloader by free space"
            );
        }
        best.map(|(downloader, _)| downloader)
    }

    /// Fetch the `.torrent` payload behind a download link.
    async fn download_torrent_file(&self, url: &str, cookie: &str) -> Option<Vec<u8>> {
        let mut request = self
            .http
            .get(url)
            .header(reqwest::header::USER_AGENT, &self.user_agent);
        if !cookie.is_empty() {
            request = request.header(reqwest::header::COOKIE, cookie.to_string());
        }
        let response = request.send().await.ok()?;
        if !response.status().is_success() {
            warn!(status = response.status().as_u16(), "torrent download failed");
            return None;
        }
        let bytes = response.bytes().await.ok()?.to_vec();
        if !bytes.starts_with(b"d") {
            debug!("payload does not look bencoded; handing it over anyway");
        }
        Some(bytes)
    }

    /// Hand one entry to a downloader under the feed's add policy.
    async fn add_to_downloader(
        &self,
        link: &str,
        downloader: &DownloaderEntity,
        feed: &RssFeedEntity,
    ) -> bool {
        let session = match Session::open(&downloader.client_config()).await {
            Ok(session) => session,
            Err(err) => {
                error!(downloader = %downloader.name, error = %err, "connect failed");
                self.events.publish(Event::DownloaderOffline {
                    downloader: downloader.name.clone(),
                });
                return false;
            }
        };
        let client = session.client();

        if feed.max_download_tasks > 0 {
            if let Ok(stats) = client.stats().await {
                if stats.downloading_torrents as i64 >= feed.max_download_tasks {
                    warn!(
                        downloader = %downloader.name,
                        active = stats.downloading_torrents,
                        "at max download tasks"
                    );
                    session.close().await;
                    return false;
                }
            }
        }

        let source = if link.starts_with("magnet:") {
            TorrentSource::Magnet(link.to_string())
        } else {
            match self.download_torrent_file(link, &feed.site_cookie).await {
                Some(bytes) => TorrentSource::Metainfo(bytes),
                None => {
                    session.close().await;
                    return false;
                }
            }
        };

        let save_path = if feed.save_path.is_empty() {
            (!downloader.download_dir.is_empty()).then(|| downloader.download_dir.clone())
        } else {
            Some(feed.save_path.clone())
        };
        let tags: Vec<String> = feed
            .tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect();
        let options = AddOptions {
            save_path,
            category: (!feed.category.is_empty()).then(|| feed.category.clone()),
            tags,
            paused: false,
            upload_limit: (feed.max_upload_kib.max(0) as u64) * 1024,
            download_limit: (feed.max_download_kib.max(0) as u64) * 1024,
            first_last_priority: downloader.first_last_priority,
        };

        let added = match client.add(source, options).await {
            Ok(hash) => {
                info!(downloader = %downloader.name, hash = %hash, "torrent added");
                true
            }
            Err(err) => {
                error!(downloader = %downloader.name, error = %err, "add failed");
                false
            }
        };
        session.close().await;
        added
    }
}

/// Does the page carry one of the known free markers?
fn is_free_page(body: &str) -> bool {
    let lowered = body.to_lowercase();
    FREE_INDICATORS
        .iter()
        .any(|marker| lowered.contains(&marker.to_lowercase()))
}

/// Turn a download link into the matching detail-page URL.
fn details_url_from_link(link: &str, feed_url: &str) -> Option<String> {
    if link.ends_with(".torrent") || link.to_lowercase().contains("download") {
        let id = TORRENT_ID_RE.captures(link)?.get(1)?.as_str().to_string();
        let feed = Url::parse(feed_url).ok()?;
        let host = feed.host_str()?;
        return Some(format!("{}://{host}/details.php?id={id}", feed.scheme()));
    }
    Some(link.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_store() -> Store {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("open database");
        Store::from_pool(pool).await.expect("bootstrap")
    }

    fn sample_feed(id: i64) -> RssFeedEntity {
        RssFeedEntity {
            id,
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

    fn entry(index: usize) -> EntryInfo {
        EntryInfo {
            title: format!("Release.{index}"),
            link: format!("https://pt.example.org/download.php?id={index}"),
            size: 1 << 30,
            seeders: 5,
            leechers: 1,
            is_hr: false,
            is_free: true,
            infohash: String::new(),
            categories: vec![],
        }
    }

    fn service(store: Store) -> RssService {
        RssService::new(
            store,
            EventBus::with_capacity(16),
            "test-agent".into(),
            true,
            8,
        )
    }

    /// Scenario S4: the first run records everything and downloads nothing;
    /// the second run inserts only unseen links.
    #[tokio::test]
    async fn first_run_records_without_downloading_then_dedups() {
        let store = memory_store().await;
        let mut feed = sample_feed(0);
        feed.id = store.insert_feed(&feed).await.expect("feed");
        let service = service(store.clone());

        let batch: Vec<EntryInfo> = (0..20).map(entry).collect();
        let outcome = service
            .process_entries(&feed, batch.clone())
            .await
            .expect("first run");
        assert_eq!(outcome.new_records, 20);
        assert_eq!(outcome.downloaded, 0, "first run downloads nothing");

        // The run flipped the flag in the store.
        let feeds = store.list_enabled_feeds().await.expect("feeds");
        assert!(feeds[0].first_run_done);
        assert!(feeds[0].last_fetch.is_some());

        // Second run: 20 old + 5 new entries; only the 5 insert.
        let mut second: Vec<EntryInfo> = batch;
        second.extend((20..25).map(entry));
        let outcome = service
            .process_entries(&feeds[0], second)
            .await
            .expect("second run");
        assert_eq!(outcome.new_records, 5);
        assert_eq!(store.count_rss_records(feed.id).await.expect("count"), 25);
        // Passing entries tried to download, but no downloader exists.
        assert_eq!(outcome.downloaded, 0);
    }

    #[tokio::test]
    async fn in_batch_duplicates_collapse() {
        let store = memory_store().await;
        let mut feed = sample_feed(0);
        feed.id = store.insert_feed(&feed).await.expect("feed");
        let service = service(store.clone());

        let batch = vec![entry(1), entry(1), entry(1)];
        let outcome = service.process_entries(&feed, batch).await.expect("run");
        assert_eq!(outcome.new_records, 1);
    }

    #[tokio::test]
    async fn filtered_entries_record_their_skip_reason() {
        let store = memory_store().await;
        let mut feed = sample_feed(0);
        feed.exclude_hr = true;
        feed.id = store.insert_feed(&feed).await.expect("feed");
        let service = service(store.clone());

        let mut flagged = entry(1);
        flagged.is_hr = true;
        let outcome = service
            .process_entries(&feed, vec![flagged])
            .await
            .expect("run");
        assert_eq!(outcome.new_records, 1);
        assert_eq!(outcome.passed, 0);
    }

    #[test]
    fn free_page_indicators() {
        assert!(is_free_page("<img class=\"pro_free\" alt=\"Free\">"));
        assert!(is_free_page("this torrent is FreeLeech today"));
        assert!(!is_free_page("<html>plain torrent page</html>"));
    }

    #[test]
    fn details_url_derivation() {
        let feed_url = "https://pt.example.org/rss?passkey=abc";
        assert_eq!(
            details_url_from_link(
                "https://pt.example.org/download.php?id=42&passkey=abc",
                feed_url
            )
            .as_deref(),
            Some("https://pt.example.org/details.php?id=42")
        );
        // Non-download links are assumed to already be detail pages.
        assert_eq!(
            details_url_from_link("https://pt.example.org/details.php?id=42", feed_url).as_deref(),
            Some("https://pt.example.org/details.php?id=42")
        );
    }
}
