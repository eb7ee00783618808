use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::listing::WeekdayPattern;

pub const DEFAULT_MAX_PAGE_VIDEOS: usize = 20;

/// On-disk configuration, one JSON object.
///
/// `subscriptions` maps a listing-page URL to a weekday pattern such as
/// `"0|2|4"` (0 = Monday). An empty pattern keeps every weekday.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub subscriptions: BTreeMap<String, String>,
    #[serde(default)]
    pub priority_hosts: Vec<String>,
    #[serde(default)]
    pub denylist_hosts: Vec<String>,
    #[serde(default = "default_max_page_videos")]
    pub max_page_videos: usize,
    pub history_path: PathBuf,
    /// Overrides the built-in User-Agent pool when non-empty.
    #[serde(default)]
    pub user_agents: Vec<String>,
}

fn default_max_page_videos() -> usize {
    DEFAULT_MAX_PAGE_VIDEOS
}

/// One listing-page subscription, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct Subscription {
    pub url: String,
    pub weekdays: WeekdayPattern,
    pub priority_hosts: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn subscription_list(&self) -> Vec<Subscription> {
        self.subscriptions
            .iter()
            .map(|(url, pattern)| Subscription {
                url: url.clone(),
                weekdays: WeekdayPattern::parse(pattern),
                priority_hosts: self.priority_hosts.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "subscriptions": {{"https://example.net/show/": "0|2"}},
                "history_path": "/tmp/history.json"
            }}"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.max_page_videos, DEFAULT_MAX_PAGE_VIDEOS);
        assert!(config.priority_hosts.is_empty());

        let subs = config.subscription_list();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].url, "https://example.net/show/");
    }
}
