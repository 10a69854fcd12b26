//! JSON page transport for the GeoNode listing client.

use std::time::Duration;

use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_USER_AGENT: &str = "gnh-harvester/0.1";

/// How often a page request is tried and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries per page, the first one included.
    pub attempts: u32,
    pub initial: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            initial: Duration::from_millis(500),
            ceiling: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (0-based). A `Retry-After` hint from
    /// the server replaces the doubling schedule; both stop at `ceiling`.
    pub fn wait(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let scheduled = hint.unwrap_or_else(|| {
            let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
            self.initial.saturating_mul(factor)
        });
        scheduled.min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub user_agent: String,
    pub retry: RetryPolicy,
    /// Minimum spacing between two requests to the upstream.
    pub min_interval: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            retry: RetryPolicy::default(),
            min_interval: Duration::ZERO,
        }
    }
}

#[derive(Debug, Error)]
pub enum PageFetchError {
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("upstream answered http {status}")]
    Status { status: u16 },
    #[error("page is not valid json: {0}")]
    Body(#[source] serde_json::Error),
}

impl PageFetchError {
    /// Gateway trouble, throttling and dropped connections are worth another
    /// try; anything the server answered deliberately is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            PageFetchError::Transport(err) => err.is_timeout() || err.is_connect(),
            PageFetchError::Status { status } => matches!(*status, 408 | 429 | 502 | 503 | 504),
            PageFetchError::Body(_) => false,
        }
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds))
}

/// Fetches listing pages as JSON, retrying transient failures and pacing
/// requests. One fetcher is shared by every source of a process.
#[derive(Debug)]
pub struct PageFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl PageFetcher {
    pub fn new(settings: HttpSettings) -> Result<Self, PageFetchError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(settings.timeout)
            .user_agent(settings.user_agent)
            .build()
            .map_err(PageFetchError::Transport)?;
        Ok(Self {
            client,
            retry: settings.retry,
            min_interval: settings.min_interval,
            last_request: Mutex::new(None),
        })
    }

    async fn pace(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.min_interval).await;
        }
        *last = Some(Instant::now());
    }

    /// GETs `url` and decodes the body as JSON.
    pub async fn get_page(&self, url: &str) -> Result<JsonValue, PageFetchError> {
        let mut retry = 0;
        loop {
            let (err, hint) = match self.try_once(url).await {
                Ok(page) => return Ok(page),
                Err(failure) => failure,
            };
            if !err.is_retryable() || retry + 1 >= self.retry.attempts {
                return Err(err);
            }
            let wait = self.retry.wait(retry, hint);
            warn!(url, error = %err, retry, wait_ms = wait.as_millis() as u64, "retrying listing page");
            tokio::time::sleep(wait).await;
            retry += 1;
        }
    }

    async fn try_once(&self, url: &str) -> Result<JsonValue, (PageFetchError, Option<Duration>)> {
        self.pace().await;
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| (PageFetchError::Transport(err), None))?;

        let status = response.status();
        if !status.is_success() {
            let hint = retry_after(response.headers());
            return Err((PageFetchError::Status { status: status.as_u16() }, hint));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| (PageFetchError::Transport(err), None))?;
        debug!(url, bytes = body.len(), "listing page received");
        serde_json::from_slice(&body).map_err(|err| (PageFetchError::Body(err), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn waits_double_up_to_the_ceiling() {
        let policy = RetryPolicy {
            attempts: 5,
            initial: Duration::from_millis(100),
            ceiling: Duration::from_millis(350),
        };
        assert_eq!(policy.wait(0, None), Duration::from_millis(100));
        assert_eq!(policy.wait(1, None), Duration::from_millis(200));
        assert_eq!(policy.wait(2, None), Duration::from_millis(350));
        assert_eq!(policy.wait(40, None), Duration::from_millis(350));
    }

    #[test]
    fn server_hints_replace_the_schedule_but_respect_the_ceiling() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.wait(3, Some(Duration::ZERO)), Duration::ZERO);
        assert_eq!(policy.wait(0, Some(Duration::from_secs(3600))), policy.ceiling);

        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static(" 7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn only_transient_statuses_are_retried() {
        let retryable = |status| PageFetchError::Status { status }.is_retryable();
        assert!(retryable(503));
        assert!(retryable(429));
        assert!(!retryable(500));
        assert!(!retryable(404));
        let body = serde_json::from_str::<JsonValue>("<html>").unwrap_err();
        assert!(!PageFetchError::Body(body).is_retryable());
    }
}
