//! Outbound call policy: bearer tokens, one refresh on 401, linear backoff on 429.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("unauthorized after token refresh")]
    Unauthorized,
    #[error("rate limited, gave up after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("token refresh failed: {0}")]
    Refresh(String),
    #[error("not configured: {0}")]
    NotConfigured(&'static str),
    #[error("message is missing {0}")]
    MissingField(&'static str),
    #[error("invalid id: {0:?}")]
    InvalidId(String),
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

/// Source of the bearer token for an upstream.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, DispatchError>;

    /// Replace `stale` with a fresh token. Implementations that cannot refresh return an error.
    async fn refresh(&self, stale: &str) -> Result<String, DispatchError>;
}

/// Fixed token (API key); 401 is terminal.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String, DispatchError> {
        Ok(self.0.clone())
    }

    async fn refresh(&self, _stale: &str) -> Result<String, DispatchError> {
        Err(DispatchError::Unauthorized)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Rate-limited attempts before giving up.
    pub max_attempts: u32,
    /// Delay after the n-th rate-limited attempt is `backoff_base * n`.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Sleep before retrying the n-th rate-limited attempt; saturates instead of overflowing.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base.checked_mul(attempt).unwrap_or(Duration::MAX)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            max_attempts: c.max_attempts.max(1),
            backoff_base: Duration::from_millis(c.backoff_ms),
        }
    }
}

/// Run `call` with the current token until it succeeds or hits a terminal failure.
///
/// 401: refresh once through `tokens` and retry; a second 401 is terminal.
/// 429: sleep `backoff_base * n` and retry, giving up after `max_attempts` rate-limited attempts.
/// Any other non-success status is terminal.
pub async fn send_with_retry<F, Fut>(
    policy: &RetryPolicy,
    tokens: &dyn TokenSource,
    label: &str,
    mut call: F,
) -> Result<reqwest::Response, DispatchError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    let mut token = tokens.access_token().await?;
    let mut refreshed = false;
    let mut rate_limited = 0u32;
    loop {
        let res = call(token.clone()).await?;
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        if status == StatusCode::UNAUTHORIZED {
            if refreshed {
                log::warn!("{}: still unauthorized after token refresh", label);
                return Err(DispatchError::Unauthorized);
            }
            refreshed = true;
            log::info!("{}: 401, refreshing token and retrying", label);
            token = tokens.refresh(&token).await?;
            continue;
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            rate_limited += 1;
            if rate_limited >= policy.max_attempts {
                log::warn!("{}: rate limited {} times, giving up", label, rate_limited);
                return Err(DispatchError::RateLimited {
                    attempts: rate_limited,
                });
            }
            let delay = policy.backoff(rate_limited);
            log::info!("{}: 429, retrying in {:?}", label, delay);
            tokio::time::sleep(delay).await;
            continue;
        }
        let body = res.text().await.unwrap_or_default();
        return Err(DispatchError::Status { status, body });
    }
}

/// Turn a non-success response into `DispatchError::Status`.
pub async fn ensure_success(res: reqwest::Response) -> Result<reqwest::Response, DispatchError> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    Err(DispatchError::Status { status, body })
}
