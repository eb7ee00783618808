use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use reqwest::Client;
use tokio::sync::Semaphore;

/// Fallback User-Agent pool, rotated per request to spread load across
/// whatever throttling the listing hosts apply.
const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows; U; Windows NT 5.1; it; rv:1.8.1.11) Gecko/20071127 Firefox/2.0.0.11",
    "Opera/9.25 (Windows NT 5.1; U; en)",
    "Mozilla/4.0 (compatible; MSIE 6.0; Windows NT 5.1; SV1; .NET CLR 1.1.4322; .NET CLR 2.0.50727)",
    "Mozilla/5.0 (compatible; Konqueror/3.5; Linux) KHTML/3.5.5 (like Gecko) (Kubuntu)",
    "Mozilla/5.0 (Windows NT 5.1) AppleWebKit/535.19 (KHTML, like Gecko) Chrome/18.0.1025.142 Safari/535.19",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.7; rv:11.0) Gecko/20100101 Firefox/11.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.6; rv:8.0.1) Gecko/20100101 Firefox/8.0.1",
    "Mozilla/5.0 (Windows NT 6.1; WOW64) AppleWebKit/535.19 (KHTML, like Gecko) Chrome/18.0.1025.151 Safari/535.19",
    "Mozilla/5.0 (Windows NT 6.1; WOW64; rv:23.0) Gecko/20100101 Firefox/23.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:85.0) Gecko/20100101 Firefox/85.0",
];

/// Thin reqwest wrapper that stamps a randomly chosen User-Agent on every
/// request and bounds how many requests are in flight at once. Cheap to
/// clone; the inner client and the limiter are reference-counted, so
/// clones share one limit.
#[derive(Debug, Clone)]
pub struct WebClient {
    client: Client,
    user_agents: Vec<String>,
    limiter: Arc<Semaphore>,
}

impl WebClient {
    pub fn new(user_agents: &[String], limit_conn: usize) -> Result<Self> {
        let limit_conn = limit_conn.max(1);
        let client = Client::builder()
            .gzip(true)
            .timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(limit_conn)
            .build()
            .context("build http client")?;
        let user_agents = if user_agents.is_empty() {
            DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect()
        } else {
            user_agents.to_vec()
        };
        Ok(WebClient {
            client,
            user_agents,
            limiter: Arc::new(Semaphore::new(limit_conn)),
        })
    }

    fn random_user_agent(&self) -> &str {
        self.user_agents
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or(DEFAULT_USER_AGENTS[0])
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        let _permit = self.limiter.acquire().await.context("request limiter closed")?;
        let text = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, self.random_user_agent())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(text)
    }

    /// Fetches a raw resource. A 4xx/5xx status maps to `Ok(None)` so
    /// callers can tell "the server said no" from transport failures.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let _permit = self.limiter.acquire().await.context("request limiter closed")?;
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, self.random_user_agent())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        Ok(Some(resp.bytes().await?.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_permits_are_released_on_failure() {
        let web = WebClient::new(&[], 2).unwrap();
        assert_eq!(web.limiter.available_permits(), 2);
        // connection refused: the request errors without leaking a permit
        let _ = web.fetch_text("http://127.0.0.1:1/").await;
        assert_eq!(web.limiter.available_permits(), 2);
    }

    #[test]
    fn zero_limit_is_clamped() {
        let web = WebClient::new(&[], 0).unwrap();
        assert_eq!(web.limiter.available_permits(), 1);
    }
}
