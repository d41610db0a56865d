use url::Url;

/// Query parameters that carry per-user credentials and must survive the
/// hop from the feed URL to each download URL.
const PASSKEY_PARAMS: &[&str] = &["passkey", "authkey", "torrent_pass"];

/// Normalize a download link for the common PT patterns.
///
/// Relative links resolve against the feed URL; detail-page links with an
/// `id`/`torrentid` parameter are rewritten to `/download.php?id=...`; passkey
/// parameters present on the feed URL but missing on the link are merged in.
/// Magnet links pass through untouched.
#[must_use]
pub fn normalize_download_link(download_link: &str, feed_url: &str) -> String {
    if download_link.is_empty() || download_link.starts_with("magnet:") {
        return download_link.to_string();
    }

    let feed = Url::parse(feed_url).ok();

    let mut resolved = match Url::parse(download_link) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            match feed.as_ref().and_then(|base| base.join(download_link).ok()) {
                Some(url) => url,
                None => return download_link.to_string(),
            }
        }
        Err(_) => return download_link.to_string(),
    };

    // Detail pages become direct download links.
    let path = resolved.path().to_string();
    if path.ends_with("details.php") || path.ends_with("torrents.php") || path.contains("detail")
    {
        let torrent_id = resolved
            .query_pairs()
            .find(|(key, _)| key == "torrentid" || key == "id")
            .map(|(_, value)| value.into_owned());
        if let Some(id) = torrent_id {
            resolved.set_path("/download.php");
            resolved.set_query(Some(&format!("id={id}")));
        }
    }

    // Merge missing passkey-style parameters from the feed URL.
    if let Some(feed) = feed {
        let existing: Vec<String> = resolved
            .query_pairs()
            .map(|(key, _)| key.into_owned())
            .collect();
        let mut to_add: Vec<(String, String)> = Vec::new();
        for (key, value) in feed.query_pairs() {
            if PASSKEY_PARAMS.contains(&key.as_ref())
                && !existing.iter().any(|k| k == key.as_ref())
                && !value.is_empty()
            {
                to_add.push((key.into_owned(), value.into_owned()));
            }
        }
        if !to_add.is_empty() {
            let mut pairs = resolved.query_pairs_mut();
            for (key, value) in &to_add {
                pairs.append_pair(key, value);
            }
            drop(pairs);
        }
    }

    resolved.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = "https://pt.example.org/torrentrss.php?passkey=s3cr3t&rows=50";

    #[test]
    fn magnet_links_pass_through() {
        let magnet = "magnet:?xt=urn:btih:abcdef";
        assert_eq!(normalize_download_link(magnet, FEED), magnet);
    }

    #[test]
    fn relative_links_resolve_against_the_feed() {
        let normalized = normalize_download_link("/download.php?id=42", FEED);
        assert!(normalized.starts_with("https://pt.example.org/download.php?id=42"));
    }

    #[test]
    fn detail_pages_become_download_links() {
        let normalized =
            normalize_download_link("https://pt.example.org/details.php?id=42&hit=1", FEED);
        assert!(normalized.contains("/download.php"));
        assert!(normalized.contains("id=42"));
        assert!(!normalized.contains("details.php"));
    }

    #[test]
    fn torrentid_parameter_is_recognized() {
        let normalized =
            normalize_download_link("https://pt.example.org/torrents.php?torrentid=7", FEED);
        assert!(normalized.contains("/download.php?id=7"));
    }

    #[test]
    fn passkey_merges_when_missing() {
        let normalized =
            normalize_download_link("https://pt.example.org/download.php?id=42", FEED);
        assert!(normalized.contains("passkey=s3cr3t"));
    }

    #[test]
    fn existing_passkey_is_not_overwritten() {
        let normalized = normalize_download_link(
            "https://pt.example.org/download.php?id=42&passkey=mine",
            FEED,
        );
        assert!(normalized.contains("passkey=mine"));
        assert!(!normalized.contains("s3cr3t"));
    }

    #[test]
    fn unrelated_feed_params_do_not_leak() {
        let normalized =
            normalize_download_link("https://pt.example.org/download.php?id=42", FEED);
        assert!(!normalized.contains("rows=50"));
    }
}
