use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Per-subscription record: display name plus already-downloaded titles,
/// most recent first. Titles embed `YYYYMMDD`, so lexicographic descending
/// order is chronological descending order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub titles: Vec<String>,
}

impl HistoryEntry {
    pub fn contains(&self, title: &str) -> bool {
        self.titles.iter().any(|t| t == title)
    }
}

/// The single source of truth for "already have" decisions: one JSON
/// object keyed by subscription URL, read at subscription start and merged
/// back at subscription end.
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        HistoryStore { path: path.into() }
    }

    pub fn load(&self) -> Result<BTreeMap<String, HistoryEntry>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read history {}", self.path.display()))?;
        let map = serde_json::from_str(&contents)
            .with_context(|| format!("parse history {}", self.path.display()))?;
        Ok(map)
    }

    pub fn entry(&self, subscription_url: &str) -> Result<HistoryEntry> {
        Ok(self
            .load()?
            .remove(subscription_url)
            .unwrap_or_default())
    }

    /// Listing titles not yet in history, listing order preserved.
    pub fn missing(listing_titles: &[String], entry: &HistoryEntry) -> Vec<String> {
        listing_titles
            .iter()
            .filter(|title| !entry.contains(title))
            .cloned()
            .collect()
    }

    /// Merges newly downloaded titles into one subscription's entry.
    ///
    /// The file is re-read so concurrent updates to other keys are never
    /// lost, and the write goes through a temp file plus rename so a crash
    /// mid-write leaves the previous file intact.
    pub fn record(
        &self,
        subscription_url: &str,
        name: &str,
        downloaded_titles: Vec<String>,
    ) -> Result<()> {
        let mut map = self.load()?;
        let entry = map.entry(subscription_url.to_string()).or_default();

        let mut titles = downloaded_titles;
        titles.extend(entry.titles.iter().cloned());
        titles.sort_unstable_by(|a, b| b.cmp(a));
        titles.dedup();

        entry.name = name.to_string();
        entry.titles = titles;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("create history dir")?;
            }
        }
        let json = serde_json::to_string_pretty(&map).context("serialize history")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename into {}", self.path.display()))?;
        debug!(path = %self.path.display(), "history persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn titles(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.json"));
        assert!(store.load().unwrap().is_empty());
        assert_eq!(store.entry("https://x/").unwrap(), HistoryEntry::default());
    }

    #[test]
    fn missing_diff_preserves_listing_order() {
        let entry = HistoryEntry {
            name: "Show".into(),
            titles: titles(&["Show 20240102"]),
        };
        let listing = titles(&["Show 20240103", "Show 20240102", "Show 20240101"]);
        assert_eq!(
            HistoryStore::missing(&listing, &entry),
            titles(&["Show 20240103", "Show 20240101"])
        );
    }

    #[test]
    fn record_prepends_sorts_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.json"));
        store
            .record("https://x/", "Show", titles(&["Show 20240101"]))
            .unwrap();
        store
            .record(
                "https://x/",
                "Show",
                titles(&["Show 20240102", "Show 20240101"]),
            )
            .unwrap();

        let entry = store.entry("https://x/").unwrap();
        assert_eq!(entry.name, "Show");
        assert_eq!(entry.titles, titles(&["Show 20240102", "Show 20240101"]));
    }

    #[test]
    fn no_new_titles_is_byte_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let store = HistoryStore::new(&path);
        store
            .record("https://x/", "Show", titles(&["Show 20240102", "Show 20240101"]))
            .unwrap();
        let before = fs::read(&path).unwrap();
        store.record("https://x/", "Show", Vec::new()).unwrap();
        let after = fs::read(&path).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn updates_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.json"));
        store
            .record("https://x/", "Show", titles(&["Show 20240101", "Show 20240102"]))
            .unwrap();
        store
            .record("https://x/", "Show", titles(&["Show 20240103"]))
            .unwrap();
        let entry = store.entry("https://x/").unwrap();
        for old in ["Show 20240101", "Show 20240102"] {
            assert!(entry.contains(old));
        }
    }

    #[test]
    fn record_merges_by_key_not_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let store = HistoryStore::new(&path);
        store
            .record("https://a/", "A", titles(&["A 20240101"]))
            .unwrap();
        // A second writer sharing the file must not clobber the first key.
        let other = HistoryStore::new(&path);
        other
            .record("https://b/", "B", titles(&["B 20240101"]))
            .unwrap();

        let map = store.load().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["https://a/"].titles, titles(&["A 20240101"]));
    }
}
