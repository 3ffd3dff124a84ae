//! Per-day page-content table maintenance.

use tidemark_core::types::PageContentEntry;

/// What happened to an entry offered to a day's content table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentMerge {
    /// A new URL was added.
    Inserted,
    /// An existing URL was replaced by a longer visit.
    Replaced,
    /// An existing URL already had an equal or longer visit.
    KeptExisting,
    /// The table was full of longer visits.
    Dropped,
}

/// Merge `entry` into one day's table.
///
/// URLs are unique; on collision the entry with the larger `time_spent_secs`
/// wins. The table is kept sorted by `time_spent_secs` descending and capped
/// at `cap` entries; anything beyond the cap is dropped.
pub fn merge_page_content(
    entries: &mut Vec<PageContentEntry>,
    entry: PageContentEntry,
    cap: usize,
) -> ContentMerge {
    let url = entry.url.clone();
    let outcome = match entries.iter().position(|e| e.url == entry.url) {
        Some(idx) if entry.time_spent_secs > entries[idx].time_spent_secs => {
            entries[idx] = entry;
            ContentMerge::Replaced
        }
        Some(_) => return ContentMerge::KeptExisting,
        None => {
            entries.push(entry);
            ContentMerge::Inserted
        }
    };

    entries.sort_by(|a, b| b.time_spent_secs.cmp(&a.time_spent_secs));
    entries.truncate(cap);

    if outcome == ContentMerge::Inserted && !entries.iter().any(|e| e.url == url) {
        ContentMerge::Dropped
    } else {
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(url: &str, secs: u64) -> PageContentEntry {
        PageContentEntry {
            url: url.to_string(),
            title: format!("Title {}", url),
            time_spent_secs: secs,
            text: "body".to_string(),
            meta: Default::default(),
            word_count: 1,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_sort() {
        let mut entries = Vec::new();
        assert_eq!(
            merge_page_content(&mut entries, entry("a", 30), 50),
            ContentMerge::Inserted
        );
        merge_page_content(&mut entries, entry("b", 90), 50);
        assert_eq!(entries[0].url, "b");
        assert_eq!(entries[1].url, "a");
    }

    #[test]
    fn test_collision_keeps_longer_visit() {
        let mut entries = vec![entry("a", 60)];
        assert_eq!(
            merge_page_content(&mut entries, entry("a", 20), 50),
            ContentMerge::KeptExisting
        );
        assert_eq!(entries[0].time_spent_secs, 60);

        assert_eq!(
            merge_page_content(&mut entries, entry("a", 120), 50),
            ContentMerge::Replaced
        );
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].time_spent_secs, 120);
    }

    #[test]
    fn test_cap_keeps_highest_dwell_subset() {
        let mut entries = Vec::new();
        for i in 0..60u64 {
            merge_page_content(&mut entries, entry(&format!("https://e.com/{}", i), i + 1), 50);
        }
        assert_eq!(entries.len(), 50);
        assert!(entries.iter().all(|e| e.time_spent_secs > 10));
        assert_eq!(entries[0].time_spent_secs, 60);
        assert_eq!(entries[49].time_spent_secs, 11);
    }

    #[test]
    fn test_full_table_drops_short_visit() {
        let mut entries = vec![entry("a", 100), entry("b", 90)];
        assert_eq!(
            merge_page_content(&mut entries, entry("c", 5), 2),
            ContentMerge::Dropped
        );
        assert_eq!(entries.len(), 2);
    }
}
