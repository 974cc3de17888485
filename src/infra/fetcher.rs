//! Network access for the disk caches.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use reqwest::{Client, StatusCode, redirect};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::infra::net_guard::is_private_target;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(3000);
const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to `{url}` returned status {status}")]
    Status { url: String, status: u16 },
    #[error("response from `{url}` was empty")]
    Empty { url: String },
    #[error("request to `{url}` failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Byte source for cache misses. Implementations must treat any non-success
/// status and any empty body as a failure.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

/// How often and how patiently a miss is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn with_backoff(backoff: Duration) -> Self {
        Self {
            backoff,
            ..Self::default()
        }
    }
}

/// Fetch `url`, retrying after a fixed pause until the policy is exhausted.
pub async fn fetch_with_retry(
    fetcher: &dyn AssetFetcher,
    url: &str,
    policy: RetryPolicy,
) -> Result<Bytes, FetchError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match fetcher.fetch(url).await {
            Ok(bytes) => return Ok(bytes),
            Err(err) if attempt < attempts => {
                warn!(
                    target = "infra::fetcher",
                    op = "fetch",
                    url,
                    attempt,
                    attempts,
                    backoff_ms = policy.backoff.as_millis() as u64,
                    error = %err,
                    "Fetch failed; retrying"
                );
                counter!("feedcard_fetch_retry_total").increment(1);
                sleep(policy.backoff).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(
                    target = "infra::fetcher",
                    op = "fetch",
                    url,
                    attempts,
                    result = "exhausted",
                    error = %err,
                    "Fetch failed after all attempts"
                );
                counter!("feedcard_fetch_failed_total").increment(1);
                return Err(err);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RedirectDecision {
    Follow,
    /// Hand the 3xx response back to the caller unfollowed.
    Refuse,
    TooMany,
}

/// Whether hop number `hops` may go to `target`.
fn redirect_decision(target: &Url, hops: usize) -> RedirectDecision {
    if hops > MAX_REDIRECTS {
        RedirectDecision::TooMany
    } else if is_private_target(target.as_str()) {
        RedirectDecision::Refuse
    } else {
        RedirectDecision::Follow
    }
}

/// Redirects are held to the same target rules as the first request.
fn redirect_policy() -> redirect::Policy {
    redirect::Policy::custom(|attempt| {
        match redirect_decision(attempt.url(), attempt.previous().len()) {
            RedirectDecision::Follow => attempt.follow(),
            RedirectDecision::Refuse => {
                warn!(
                    target = "infra::fetcher",
                    op = "redirect",
                    url = %attempt.url(),
                    "Refusing redirect to a private target"
                );
                counter!("feedcard_fetch_redirect_refused_total").increment(1);
                attempt.stop()
            }
            RedirectDecision::TooMany => attempt.error("too many redirects"),
        }
    })
}

/// `reqwest` backed fetcher following redirects to public targets only.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(request_timeout: Duration, user_agent: &str) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(request_timeout)
            .redirect(redirect_policy())
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { client })
    }

    pub fn default_user_agent() -> &'static str {
        concat!("feedcard/", env!("CARGO_PKG_VERSION"))
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self {
            client: Client::builder()
                .user_agent(Self::default_user_agent())
                .timeout(DEFAULT_REQUEST_TIMEOUT)
                .redirect(redirect_policy())
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };

        let response = self.client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        // Drain the body either way so the connection returns to the pool.
        let body = response.bytes().await.map_err(transport)?;

        if status != StatusCode::OK {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        if body.is_empty() {
            return Err(FetchError::Empty {
                url: url.to_string(),
            });
        }

        debug!(
            target = "infra::fetcher",
            op = "fetch",
            url,
            bytes = body.len(),
            "Fetched remote asset"
        );
        Ok(body)
    }
}
