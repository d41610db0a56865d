use seedfleet_data::RssFeedEntity;

use crate::extract::EntryInfo;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Check an entry against the feed's filters.
///
/// Returns `Ok(())` when the entry passes, or the skip reason. Zero-valued
/// bounds mean "no bound"; the seeder bounds apply only when the entry
/// actually reported a seeder count.
///
/// # Errors
///
/// The `Err` is the human-readable skip reason recorded on the entry.
pub fn filter_entry(info: &EntryInfo, feed: &RssFeedEntity) -> Result<(), String> {
    let size_gib = if info.size > 0 {
        info.size as f64 / GIB
    } else {
        0.0
    };

    if feed.min_size_gib > 0.0 && info.size > 0 && size_gib < feed.min_size_gib {
        return Err(format!(
            "size too small: {size_gib:.2} GiB < {} GiB",
            feed.min_size_gib
        ));
    }
    if feed.max_size_gib > 0.0 && info.size > 0 && size_gib > feed.max_size_gib {
        return Err(format!(
            "size too large: {size_gib:.2} GiB > {} GiB",
            feed.max_size_gib
        ));
    }

    if feed.min_seeders > 0 && info.seeders > 0 && info.seeders < feed.min_seeders {
        return Err(format!(
            "too few seeders: {} < {}",
            info.seeders, feed.min_seeders
        ));
    }
    if feed.max_seeders > 0 && info.seeders > 0 && info.seeders > feed.max_seeders {
        return Err(format!(
            "too many seeders: {} > {}",
            info.seeders, feed.max_seeders
        ));
    }

    if feed.exclude_hr && info.is_hr {
        return Err("hit-and-run excluded".to_string());
    }

    if feed.only_free && !info.is_free {
        return Err("not free".to_string());
    }

    let title = info.title.to_lowercase();

    if !feed.include_keywords.is_empty() {
        let include: Vec<String> = feed
            .include_keywords
            .split(',')
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        if !include.is_empty() && !include.iter().any(|keyword| title.contains(keyword)) {
            return Err(format!("no include keyword matched: {}", feed.include_keywords));
        }
    }

    if !feed.exclude_keywords.is_empty() {
        for keyword in feed
            .exclude_keywords
            .split(',')
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
        {
            if title.contains(&keyword) {
                return Err(format!("matched exclude keyword: {keyword}"));
            }
        }
    }

    Ok(())
}
