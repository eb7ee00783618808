use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::browser::{BrowserError, BrowserSession};
use crate::config::{Config, Subscription};
use crate::download::EpisodeDownloader;
use crate::extract::CandidateExtractor;
use crate::history::HistoryStore;
use crate::http::WebClient;
use crate::listing;
use crate::notify::{Notification, NotificationAction, Notifier};
use crate::probe::ResolutionProbe;
use crate::variant::{rank, CandidateStream};

#[derive(Debug, Error)]
pub enum EpisodeError {
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("all candidates failed")]
    AllCandidatesExhausted,
    #[error("interrupted by stop request")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunStats {
    pub downloaded: usize,
    pub attempted: usize,
}

/// Drives one full run: per subscription, diff the listing against
/// history, fetch each missing episode through the ranked-candidate
/// fallback chain, and persist history. Failures are contained at the
/// narrowest scope that keeps the run moving: a bad candidate falls
/// through to the next, a bad episode to the next, a bad subscription to
/// the next.
pub struct Orchestrator<'a> {
    pub config: &'a Config,
    pub web: &'a WebClient,
    pub probe: &'a dyn ResolutionProbe,
    pub history: &'a HistoryStore,
    pub downloader: &'a dyn EpisodeDownloader,
    pub notifier: &'a dyn Notifier,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub log_path: PathBuf,
    pub cancel: Arc<AtomicBool>,
}

impl Orchestrator<'_> {
    pub async fn run(&self, session: &mut dyn BrowserSession) -> Result<()> {
        for subscription in self.config.subscription_list() {
            if self.cancelled() {
                info!("stop requested, leaving remaining subscriptions for the next run");
                break;
            }
            info!(url = %subscription.url, "processing subscription");
            match self.process_subscription(session, &subscription).await {
                Ok(stats) => info!(
                    url = %subscription.url,
                    downloaded = stats.downloaded,
                    attempted = stats.attempted,
                    "subscription done"
                ),
                Err(e) => error!(url = %subscription.url, "subscription failed: {e:#}"),
            }
        }
        Ok(())
    }

    async fn process_subscription(
        &self,
        session: &mut dyn BrowserSession,
        subscription: &Subscription,
    ) -> Result<RunStats> {
        let entry = self.history.entry(&subscription.url)?;
        let html = self
            .web
            .fetch_text(&subscription.url)
            .await
            .context("fetch listing page")?;
        let texts = listing::anchor_texts(&html);
        let titles = listing::parse_titles(&texts, &subscription.weekdays)?;

        let display_name = listing::display_name(&titles[0]).to_string();
        let missing = HistoryStore::missing(&titles, &entry);
        info!(
            name = %display_name,
            missing = missing.len(),
            listed = titles.len(),
            "episode diff"
        );

        let mut downloaded = Vec::new();
        for missing_title in &missing {
            if self.cancelled() {
                info!("stop requested, cutting this subscription short");
                break;
            }
            match self
                .fetch_episode(session, subscription, &display_name, missing_title)
                .await
            {
                Ok((candidate_title, path)) => {
                    info!(title = %missing_title, path = %path.display(), "episode downloaded");
                    self.notify_success(&display_name, missing_title, &path);
                    downloaded.push(candidate_title);
                }
                // an interrupted episode is not a failure; leave it for
                // the next run without raising a notification
                Err(EpisodeError::Cancelled) => {
                    info!(title = %missing_title, "episode interrupted");
                    break;
                }
                Err(e) => {
                    warn!(title = %missing_title, "episode failed: {e:#}");
                    self.notify_failure(&display_name, missing_title);
                }
            }
        }

        let stats = RunStats {
            downloaded: downloaded.len(),
            attempted: missing.len(),
        };
        info!("downloaded episodes: {} / {}", stats.downloaded, stats.attempted);
        self.history
            .record(&subscription.url, &display_name, downloaded)
            .context("persist history")?;
        Ok(stats)
    }

    /// One episode: extract candidates, rank them, attempt downloads in
    /// rank order until one sticks.
    pub(crate) async fn fetch_episode(
        &self,
        session: &mut dyn BrowserSession,
        subscription: &Subscription,
        display_name: &str,
        missing_title: &str,
    ) -> Result<(String, PathBuf), EpisodeError> {
        let date = listing::date_token(missing_title).unwrap_or_default();
        let episode_url = format!("{}{}.html", subscription.url, date);

        let extractor = CandidateExtractor::new(
            self.probe,
            &self.config.denylist_hosts,
            self.config.max_page_videos,
        );
        let candidates = extractor.extract(session, &episode_url).await?;
        let ranked = rank(candidates, &subscription.priority_hosts);

        for candidate in &ranked {
            info!(
                ordinal = candidate.ordinal,
                resolution = %candidate.resolution,
                url = %candidate.manifest_url,
                "attempting candidate"
            );
            let dest = self.episode_dest(display_name, candidate);
            match self
                .downloader
                .download(&candidate.manifest_url, &dest, &self.temp_dir)
                .await
            {
                Ok(result) if result.success => {
                    return Ok((candidate.title.clone(), result.path));
                }
                Ok(_) => warn!(ordinal = candidate.ordinal, "downloader reported failure"),
                Err(e) => warn!(ordinal = candidate.ordinal, "download attempt failed: {e:#}"),
            }
            if self.cancelled() {
                return Err(EpisodeError::Cancelled);
            }
        }
        Err(EpisodeError::AllCandidatesExhausted)
    }

    fn episode_dest(&self, display_name: &str, candidate: &CandidateStream) -> PathBuf {
        self.output_dir
            .join(sanitize_filename::sanitize(display_name))
            .join(format!(
                "{}#{}.mp4",
                sanitize_filename::sanitize(&candidate.title),
                candidate.ordinal
            ))
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn notify_success(&self, display_name: &str, title: &str, path: &Path) {
        self.notifier.notify(Notification {
            app_id: display_name.to_string(),
            title: title.to_string(),
            message: "download finished".to_string(),
            link: path.display().to_string(),
            actions: vec![NotificationAction {
                label: "Play".to_string(),
                link: path.display().to_string(),
            }],
        });
    }

    fn notify_failure(&self, display_name: &str, title: &str) {
        self.notifier.notify(Notification {
            app_id: display_name.to_string(),
            title: title.to_string(),
            message: "download failed, check the log".to_string(),
            link: self.log_path.display().to_string(),
            actions: vec![NotificationAction {
                label: "Open log".to_string(),
                link: self.log_path.display().to_string(),
            }],
        });
    }
}
