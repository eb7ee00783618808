use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("browser driver error: {0}")]
    Driver(#[from] CdpError),
}

/// A clickable sub-item on an episode page, identified by its position.
#[derive(Debug, Clone)]
pub struct PageItem {
    pub ordinal: usize,
    pub href: Option<String>,
}

/// Result of evaluating in-page script. `NotReady` is the host page's
/// "the player has not resolved its manifest yet" signal, distinct from a
/// genuine driver failure.
#[derive(Debug)]
pub enum ScriptOutcome {
    Value(String),
    NotReady,
}

/// Capability surface the extractor needs from a browser. Frame and
/// navigation state is session-global; callers must not assume frame
/// context across calls into other components.
#[async_trait]
pub trait BrowserSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError>;
    async fn clickable_items(&mut self, selector: &str) -> Result<Vec<PageItem>, BrowserError>;
    async fn click_item(&mut self, selector: &str, ordinal: usize) -> Result<(), BrowserError>;
    async fn read_text(&mut self, selector: &str) -> Result<String, BrowserError>;
    async fn enter_frame(&mut self, frame_selector: &str) -> Result<(), BrowserError>;
    async fn leave_frame(&mut self) -> Result<(), BrowserError>;
    async fn eval_script(&mut self, code: &str) -> Result<ScriptOutcome, BrowserError>;
}

/// Bounded poll-for-async-value policy: how often and how long to re-ask
/// the page for a value it populates asynchronously.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 10,
            interval: Duration::from_secs(1),
        }
    }
}

/// Polls `code` until it yields a value or the policy is exhausted.
/// Exhaustion is `Ok(None)`; only real driver failures are errors.
pub async fn poll_script(
    session: &mut dyn BrowserSession,
    code: &str,
    policy: &RetryPolicy,
) -> Result<Option<String>, BrowserError> {
    for attempt in 1..=policy.max_attempts {
        match session.eval_script(code).await? {
            ScriptOutcome::Value(value) => return Ok(Some(value)),
            ScriptOutcome::NotReady => {
                if attempt == policy.max_attempts {
                    break;
                }
                debug!(attempt, "script value not ready yet");
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
    Ok(None)
}

/// Headless Chrome session. The player iframe is loaded into a dedicated
/// second tab: its document is usually cross-origin, so evaluating there
/// requires its own top-level context.
pub struct ChromeSession {
    browser: Browser,
    handler_task: tokio::task::JoinHandle<()>,
    page: Page,
    frame_page: Page,
    in_frame: bool,
}

impl ChromeSession {
    pub async fn launch() -> Result<Self, BrowserError> {
        let config = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1920, 1080)
            .arg("--incognito")
            .arg("--disable-gpu")
            .arg("--log-level=3")
            .build()
            .map_err(BrowserError::Launch)?;
        let (browser, mut handler) = Browser::launch(config).await?;
        let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });
        let page = browser.new_page("about:blank").await?;
        let frame_page = browser.new_page("about:blank").await?;
        Ok(ChromeSession {
            browser,
            handler_task,
            page,
            frame_page,
            in_frame: false,
        })
    }

    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!(error = %e, "closing browser failed");
        }
        self.handler_task.abort();
    }

    fn active_page(&self) -> &Page {
        if self.in_frame {
            &self.frame_page
        } else {
            &self.page
        }
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        self.in_frame = false;
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn clickable_items(&mut self, selector: &str) -> Result<Vec<PageItem>, BrowserError> {
        let elements = self.page.find_elements(selector).await?;
        let mut items = Vec::with_capacity(elements.len());
        for (ordinal, element) in elements.iter().enumerate() {
            let href = element.attribute("href").await.ok().flatten();
            items.push(PageItem { ordinal, href });
        }
        Ok(items)
    }

    async fn click_item(&mut self, selector: &str, ordinal: usize) -> Result<(), BrowserError> {
        let elements = self.page.find_elements(selector).await?;
        let element = elements.get(ordinal).ok_or_else(|| {
            BrowserError::ElementNotFound(format!("{selector}[{ordinal}]"))
        })?;
        element.click().await?;
        Ok(())
    }

    async fn read_text(&mut self, selector: &str) -> Result<String, BrowserError> {
        let element = self.active_page().find_element(selector).await?;
        let text = element.inner_text().await?.unwrap_or_default();
        Ok(text.trim().to_string())
    }

    async fn enter_frame(&mut self, frame_selector: &str) -> Result<(), BrowserError> {
        let iframe = self.page.find_element(frame_selector).await?;
        let src = iframe
            .attribute("src")
            .await?
            .ok_or_else(|| BrowserError::ElementNotFound(format!("{frame_selector}[src]")))?;
        self.frame_page.goto(src).await?;
        self.frame_page.wait_for_navigation().await?;
        self.in_frame = true;
        Ok(())
    }

    async fn leave_frame(&mut self) -> Result<(), BrowserError> {
        if self.in_frame {
            self.in_frame = false;
            self.frame_page.goto("about:blank").await?;
        }
        Ok(())
    }

    async fn eval_script(&mut self, code: &str) -> Result<ScriptOutcome, BrowserError> {
        match self.active_page().evaluate(code).await {
            Ok(result) => match result.into_value::<String>() {
                Ok(value) => Ok(ScriptOutcome::Value(value)),
                // undefined / non-string: the page has not set it yet
                Err(_) => Ok(ScriptOutcome::NotReady),
            },
            Err(CdpError::JavascriptException(_)) => Ok(ScriptOutcome::NotReady),
            Err(e) => Err(e.into()),
        }
    }
}
