//! HTTP transport with bounded retry on rate-limit responses.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// Longest response body excerpt kept on failures.
const BODY_EXCERPT_LIMIT: usize = 2_000;

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

/// One GET against a remote endpoint. Implementations never retry.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str, query: &[(String, String)]) -> Result<RawResponse, TransportError>;
}

/// Suspension point used for retry backoff and inter-partition pacing.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only 429 is retried; everything else is surfaced to the caller as-is.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str, query: &[(String, String)]) -> Result<RawResponse, TransportError> {
        let resp = self.client.get(url).query(query).send().await?;
        let status = resp.status();
        let final_url = resp.url().path().to_string();
        let body = resp.bytes().await?.to_vec();
        Ok(RawResponse {
            status,
            final_url,
            body,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
    pub retries: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limit exceeded; gave up after {retries} retries")]
    RateLimitExhausted { retries: usize, body: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl FetchError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FetchError::RateLimitExhausted { .. } => Some(StatusCode::TOO_MANY_REQUESTS.as_u16()),
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Transport(_) => None,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            FetchError::RateLimitExhausted { body, .. } | FetchError::HttpStatus { body, .. } => {
                Some(body.as_str())
            }
            FetchError::Transport(_) => None,
        }
    }
}

pub struct HttpFetcher {
    transport: Arc<dyn HttpTransport>,
    sleeper: Arc<dyn Sleeper>,
    backoff: BackoffPolicy,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(&config)?;
        Ok(Self::with_transport(
            Arc::new(transport),
            Arc::new(TokioSleeper),
            config.backoff,
        ))
    }

    pub fn with_transport(
        transport: Arc<dyn HttpTransport>,
        sleeper: Arc<dyn Sleeper>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            transport,
            sleeper,
            backoff,
        }
    }

    /// GET `url` with `query`, retrying only on 429 per the backoff policy.
    ///
    /// The query usually carries credentials, so it is never logged.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        partition: &str,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, partition, url);
        async move {
            let mut attempt = 0usize;
            loop {
                let resp = self.transport.get(url, query).await?;

                if resp.status.is_success() {
                    debug!(status = resp.status.as_u16(), attempt, "fetch succeeded");
                    return Ok(FetchedResponse {
                        status: resp.status,
                        body: resp.body,
                        retries: attempt,
                    });
                }

                if classify_status(resp.status) == RetryDisposition::Retryable {
                    if attempt < self.backoff.max_retries {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(
                            attempt = attempt + 1,
                            max_retries = self.backoff.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            "rate limited; backing off"
                        );
                        self.sleeper.sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::RateLimitExhausted {
                        retries: attempt,
                        body: body_excerpt(&resp.body),
                    });
                }

                return Err(FetchError::HttpStatus {
                    status: resp.status.as_u16(),
                    url: resp.final_url,
                    body: body_excerpt(&resp.body),
                });
            }
        }
        .instrument(span)
        .await
    }
}

fn body_excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= BODY_EXCERPT_LIMIT {
        return text.into_owned();
    }
    let mut end = BODY_EXCERPT_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<RawResponse, TransportError>>>,
        fallback_status: StatusCode,
        pub calls: Mutex<usize>,
    }

    impl ScriptedTransport {
        pub fn always(status: StatusCode) -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                fallback_status: status,
                calls: Mutex::new(0),
            }
        }

        pub fn scripted(
            responses: Vec<Result<RawResponse, TransportError>>,
            fallback_status: StatusCode,
        ) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                fallback_status,
                calls: Mutex::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn get(&self, url: &str, _query: &[(String, String)]) -> Result<RawResponse, TransportError> {
            *self.calls.lock().unwrap() += 1;
            let next = self.responses.lock().unwrap().pop_front();
            next.unwrap_or_else(|| {
                Ok(RawResponse {
                    status: self.fallback_status,
                    final_url: url.to_string(),
                    body: b"{}".to_vec(),
                })
            })
        }
    }

    #[derive(Default)]
    pub struct RecordingSleeper {
        pub slept: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    fn fetcher(transport: Arc<ScriptedTransport>, sleeper: Arc<RecordingSleeper>) -> HttpFetcher {
        HttpFetcher::with_transport(transport, sleeper, BackoffPolicy::default())
    }

    #[test]
    fn backoff_schedule_doubles_and_caps_at_eight_seconds() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(8));
    }

    #[test]
    fn only_too_many_requests_is_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn persistent_rate_limit_retries_three_times_then_gives_up() {
        let transport = Arc::new(ScriptedTransport::always(StatusCode::TOO_MANY_REQUESTS));
        let sleeper = Arc::new(RecordingSleeper::default());
        let err = fetcher(transport.clone(), sleeper.clone())
            .fetch_bytes(Uuid::nil(), "541511", "https://example.test/search", &[])
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::RateLimitExhausted { retries: 3, .. }));
        assert_eq!(err.status_code(), Some(429));
        assert_eq!(transport.call_count(), 4);
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[tokio::test]
    async fn recovers_after_transient_rate_limit() {
        let transport = Arc::new(ScriptedTransport::scripted(
            vec![Ok(RawResponse {
                status: StatusCode::TOO_MANY_REQUESTS,
                final_url: "/search".into(),
                body: vec![],
            })],
            StatusCode::OK,
        ));
        let sleeper = Arc::new(RecordingSleeper::default());
        let resp = fetcher(transport.clone(), sleeper.clone())
            .fetch_bytes(Uuid::nil(), "541511", "https://example.test/search", &[])
            .await
            .unwrap();
        assert_eq!(resp.retries, 1);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn server_errors_and_network_failures_are_not_retried() {
        let transport = Arc::new(ScriptedTransport::always(StatusCode::SERVICE_UNAVAILABLE));
        let sleeper = Arc::new(RecordingSleeper::default());
        let err = fetcher(transport.clone(), sleeper.clone())
            .fetch_bytes(Uuid::nil(), "541511", "https://example.test/search", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert_eq!(transport.call_count(), 1);

        let transport = Arc::new(ScriptedTransport::scripted(
            vec![Err(TransportError::Connect("refused".into()))],
            StatusCode::OK,
        ));
        let err = fetcher(transport.clone(), sleeper.clone())
            .fetch_bytes(Uuid::nil(), "541511", "https://example.test/search", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport(TransportError::Connect(_))));
        assert_eq!(transport.call_count(), 1);
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[test]
    fn body_excerpt_truncates_on_char_boundary() {
        let body = "é".repeat(BODY_EXCERPT_LIMIT);
        let excerpt = body_excerpt(body.as_bytes());
        assert!(excerpt.len() <= BODY_EXCERPT_LIMIT);
        assert!(excerpt.chars().all(|c| c == 'é'));
    }
}
