use once_cell::sync::Lazy;
use regex::Regex;
use seedfleet_data::RssFeedEntity;
use tracing::debug;

use crate::link::normalize_download_link;

static SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(TB|GB|MB|KB|B)\b").expect("static regex"));
static SEEDERS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:seeds?|seeders?|做种|做種)[:：]?\s*(\d+)").expect("static regex")
});
static LEECHERS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:leechers?|peers?|下载|吸血)[:：]?\s*(\d+)").expect("static regex")
});

/// Hit-and-run markers scanned over title and description.
const HR_MARKERS: &[&str] = &["h&r", "hr", "hitrun", "hit&run", "hit and run", "[hr]", "(hr)"];

/// Free-leech markers scanned over title and description.
const FREE_MARKERS: &[&str] = &[
    "free", "免费", "[免费]", "(免费)", "freeleech", "[free]", "2xfree", "2x free",
];

/// One feed entry, reduced to what the pipeline needs.
#[derive(Debug, Clone, Default)]
pub struct EntryInfo {
    /// Entry title.
    pub title: String,
    /// Normalized canonical download link.
    pub link: String,
    /// Payload size in bytes (0 = unknown).
    pub size: i64,
    /// Seeders (0 = unknown).
    pub seeders: i64,
    /// Leechers (0 = unknown).
    pub leechers: i64,
    /// Hit-and-run flag.
    pub is_hr: bool,
    /// Free-leech flag.
    pub is_free: bool,
    /// Infohash, when a detail-page check found one.
    pub infohash: String,
    /// Categories attached to the entry.
    pub categories: Vec<String>,
}

/// Parse a feed payload and extract entry infos.
///
/// A feed that fails to parse yields zero entries; the pipeline records the
/// empty run and carries on.
#[must_use]
pub fn extract_entries(payload: &[u8], feed: &RssFeedEntity) -> Vec<EntryInfo> {
    let parsed = match feed_rs::parser::parse(payload) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(feed = %feed.name, error = %err, "feed failed to parse");
            return Vec::new();
        }
    };

    parsed
        .entries
        .iter()
        .filter_map(|entry| {
            let title = entry
                .title
                .as_ref()
                .map(|t| t.content.clone())
                .unwrap_or_default();
            let description = entry
                .summary
                .as_ref()
                .map(|t| t.content.clone())
                .or_else(|| {
                    entry
                        .content
                        .as_ref()
                        .and_then(|c| c.body.clone())
                })
                .unwrap_or_default();

            // Link preference: enclosure (RSS enclosures surface as the
            // content source), then torrent/magnet-typed links, then the
            // entry's plain link, then its id.
            let content_enclosure = entry
                .content
                .as_ref()
                .and_then(|c| c.src.as_ref().map(|src| (src.href.clone(), c.length)));
            let link_enclosure = entry.links.iter().find(|link| {
                link.rel.as_deref() == Some("enclosure")
                    || link
                        .media_type
                        .as_deref()
                        .is_some_and(|t| t.contains("torrent"))
                    || link.href.ends_with(".torrent")
                    || link.href.starts_with("magnet:")
            });
            let enclosure = content_enclosure
                .or_else(|| link_enclosure.map(|link| (link.href.clone(), link.length)));

            let raw_link = enclosure
                .as_ref()
                .map(|(href, _)| href.clone())
                .or_else(|| entry.links.first().map(|link| link.href.clone()))
                .or_else(|| {
                    let id = entry.id.trim();
                    (id.starts_with("http") || id.starts_with("magnet:"))
                        .then(|| id.to_string())
                })?;
            let link = normalize_download_link(&raw_link, &feed.url);
            if link.is_empty() {
                return None;
            }

            let mut size = enclosure
                .as_ref()
                .and_then(|(_, length)| *length)
                .map_or(0, |len| len as i64);
            if size == 0 {
                for text in [&title, &description] {
                    if let Some(caps) = SIZE_RE.captures(text) {
                        let amount: f64 = caps[1].parse().unwrap_or(0.0);
                        let multiplier: f64 = match caps[2].to_uppercase().as_str() {
                            "KB" => 1024.0,
                            "MB" => 1024.0 * 1024.0,
                            "GB" => 1024.0 * 1024.0 * 1024.0,
                            "TB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
                            _ => 1.0,
                        };
                        size = (amount * multiplier) as i64;
                        if size > 0 {
                            break;
                        }
                    }
                }
            }

            let seeders = SEEDERS_RE
                .captures(&description)
                .and_then(|caps| caps[1].parse().ok())
                .unwrap_or(0);
            let leechers = LEECHERS_RE
                .captures(&description)
                .and_then(|caps| caps[1].parse().ok())
                .unwrap_or(0);

            let haystack = format!("{} {}", title.to_lowercase(), description.to_lowercase());
            let is_hr = HR_MARKERS.iter().any(|marker| haystack.contains(marker));
            let is_free = FREE_MARKERS.iter().any(|marker| haystack.contains(marker));

            let categories = entry
                .categories
                .iter()
                .map(|c| c.term.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();

            Some(EntryInfo {
                title,
                link,
                size,
                seeders,
                leechers,
                is_hr,
                is_free,
                infohash: String::new(),
                categories,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed() -> RssFeedEntity {
        RssFeedEntity {
            id: 1,
            name: "demo".into(),
            url: "https://pt.example.org/rss?passkey=abc".into(),
            enabled: true,
            first_run_done: true,
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

    const SAMPLE_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
 <channel>
  <title>demo</title>
  <item>
   <title>Some.Release.2160p [Free] 10.5 GB</title>
   <link>https://pt.example.org/details.php?id=101</link>
   <guid>https://pt.example.org/details.php?id=101</guid>
   <description>Seeders: 8 Leechers: 2</description>
   <enclosure url="https://pt.example.org/download.php?id=101" length="11274289152" type="application/x-bittorrent"/>
   <category>Movies</category>
  </item>
  <item>
   <title>Other.Release.1080p H&amp;R</title>
   <link>https://pt.example.org/details.php?id=102</link>
   <description>500 MB - seeds: 1</description>
  </item>
 </channel>
</rss>"#;

    #[test]
    fn enclosure_wins_and_passkey_is_merged() {
        let entries = extract_entries(SAMPLE_RSS.as_bytes(), &feed());
        assert_eq!(entries.len(), 2);
        let first = &entries[0];
        assert!(first.link.contains("/download.php"));
        assert!(first.link.contains("id=101"));
        assert!(first.link.contains("passkey=abc"));
        assert_eq!(first.size, 11_274_289_152);
        assert_eq!(first.seeders, 8);
        assert_eq!(first.leechers, 2);
        assert!(first.is_free);
        assert_eq!(first.categories, vec!["Movies".to_string()]);
    }

    #[test]
    fn detail_link_and_text_fallbacks() {
        let entries = extract_entries(SAMPLE_RSS.as_bytes(), &feed());
        let second = &entries[1];
        // No enclosure: the detail link rewrites to a download link.
        assert!(second.link.contains("/download.php"));
        assert!(second.link.contains("id=102"));
        // Size parsed from the description text.
        assert_eq!(second.size, 500 * 1024 * 1024);
        assert_eq!(second.seeders, 1);
        assert!(second.is_hr);
        assert!(!second.is_free);
    }

    #[test]
    fn garbage_payload_yields_zero_entries() {
        assert!(extract_entries(b"not xml at all", &feed()).is_empty());
    }
}
