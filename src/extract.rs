use tracing::{debug, info};

use crate::browser::{poll_script, BrowserError, BrowserSession, RetryPolicy};
use crate::probe::ResolutionProbe;
use crate::variant::CandidateStream;

/// Clickable source sub-items on an episode page.
const ITEM_SELECTOR: &str = "div.holder.scrollbarx a";
/// Currently displayed episode title.
const TITLE_SELECTOR: &str = "div.title.sizing h1";
/// Embedded player frame holding the manifest-resolving script.
const FRAME_SELECTOR: &str = "#video-player iframe";
/// Page-global the player script sets once it has resolved a manifest URL.
const MANIFEST_GLOBAL: &str = "m3u8url";

/// Walks an episode page's source sub-items and collects one candidate
/// stream per usable item. Mutates session navigation and frame state;
/// the session is always back at the top-level frame on return.
pub struct CandidateExtractor<'a> {
    probe: &'a dyn ResolutionProbe,
    denylist_hosts: &'a [String],
    max_items: usize,
    retry: RetryPolicy,
}

impl<'a> CandidateExtractor<'a> {
    pub fn new(
        probe: &'a dyn ResolutionProbe,
        denylist_hosts: &'a [String],
        max_items: usize,
    ) -> Self {
        CandidateExtractor {
            probe,
            denylist_hosts,
            max_items,
            retry: RetryPolicy::default(),
        }
    }

    #[cfg(test)]
    fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn extract(
        &self,
        session: &mut dyn BrowserSession,
        episode_url: &str,
    ) -> Result<Vec<CandidateStream>, BrowserError> {
        session.navigate(episode_url).await?;

        let mut candidates = Vec::new();
        // `max_items` is a safety bound against lazily rendered unbounded
        // lists; the page's own end-of-list marker usually stops us first.
        for ordinal in 0..self.max_items {
            let items = session.clickable_items(ITEM_SELECTOR).await?;
            let Some(item) = items.get(ordinal) else {
                break;
            };
            let item_ordinal = item.ordinal;
            let end_marker = items
                .last()
                .and_then(|item| item.href.as_deref())
                .and_then(max_index_from_href);

            session.click_item(ITEM_SELECTOR, item_ordinal).await?;
            let title = session.read_text(TITLE_SELECTOR).await?;

            session.enter_frame(FRAME_SELECTOR).await?;
            let polled = poll_script(session, MANIFEST_GLOBAL, &self.retry).await;
            session.leave_frame().await?;

            let manifest_url = match polled? {
                Some(url) => url,
                None => {
                    info!(ordinal, "player never surfaced a manifest");
                    String::new()
                }
            };

            if self.is_denylisted(&manifest_url) {
                info!(ordinal, url = %manifest_url, "dropping denylisted host");
            } else {
                let resolution = self.probe.resolve(&manifest_url).await;
                debug!(ordinal, %resolution, url = %manifest_url, "candidate");
                candidates.push(CandidateStream {
                    title,
                    ordinal: item_ordinal,
                    resolution,
                    manifest_url,
                });
            }

            if end_marker == Some(ordinal) {
                break;
            }
        }
        Ok(candidates)
    }

    fn is_denylisted(&self, manifest_url: &str) -> bool {
        !manifest_url.is_empty()
            && self
                .denylist_hosts
                .iter()
                .any(|host| manifest_url.contains(host.as_str()))
    }
}

/// The listing embeds the highest valid sub-item ordinal in the last
/// item's href fragment, e.g. `...#2`.
fn max_index_from_href(href: &str) -> Option<usize> {
    href.rsplit_once('#')?.1.parse().ok()
}
