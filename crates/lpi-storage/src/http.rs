//! Retrying JSON GET client shared by HTTP publication feeds.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderValue, ACCEPT, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Throttling and server faults are worth another attempt; a rejected query
/// fails the same way again.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => RetryDisposition::Retryable,
        s if s.is_server_error() => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    match (err.is_timeout(), err.is_connect(), err.is_body()) {
        (false, false, false) => RetryDisposition::NonRetryable,
        _ => RetryDisposition::Retryable,
    }
}

/// Doubling pause between attempts, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// A server-supplied `Retry-After` wins over the computed pause, within the cap.
    fn pause(&self, retry: u32, hint: Option<Duration>) -> Duration {
        hint.map_or_else(|| self.delay_for_attempt(retry), |h| h.min(self.max_delay))
    }
}

/// `Retry-After` in its delta-seconds form; HTTP-date values are ignored.
pub fn parse_retry_after(value: &HeaderValue) -> Option<Duration> {
    value
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests allowed in flight at once across every feed sharing the fetcher.
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("building http client: {0}")]
    Client(String),
    #[error("fetcher is shutting down")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        if let Some(agent) = config.user_agent.as_deref() {
            builder = builder.user_agent(agent);
        }
        let client = builder
            .build()
            .map_err(|err| FetchError::Client(err.to_string()))?;
        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            backoff: config.backoff,
        })
    }

    /// GET a JSON document, retrying transient failures with backoff.
    pub async fn get_json(
        &self,
        feed: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let _slot = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        self.send_with_retries(url, query)
            .instrument(info_span!("http_fetch", feed, url))
            .await
    }

    async fn send_with_retries(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0u32;
        loop {
            let sent = self
                .client
                .get(url)
                .query(query)
                .header(ACCEPT, "application/json")
                .send()
                .await;

            let (err, disposition, hint) = match sent {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse { status, url, body });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let hint = resp.headers().get(RETRY_AFTER).and_then(parse_retry_after);
                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (err, classify_status(status), hint)
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    (FetchError::Request(err), disposition, None)
                }
            };

            if disposition == RetryDisposition::NonRetryable || retry >= self.backoff.max_retries {
                return Err(err);
            }
            let pause = self.backoff.pause(retry, hint);
            debug!(error = %err, retry, pause_ms = pause.as_millis() as u64, "retrying feed request");
            tokio::time::sleep(pause).await;
            retry += 1;
        }
    }
}
