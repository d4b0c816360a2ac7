//! HTTP fetcher implementation
//!
//! One `fetch` call owns the whole retry loop for a logical request:
//! - acquire a proxy from the pool (or fall back to a direct connection)
//! - issue the request with a per-attempt timeout and rotating user-agent
//! - classify the outcome and either return, or evict the proxy, back off a
//!   randomized delay, and try again with a fresh endpoint

use crate::crawler::proxy::ProxyPool;
use rand::Rng;
use reqwest::header::{REFERER, USER_AGENT};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the fetcher
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("{url}: giving up after {attempts} attempts: {last_cause}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last_cause: String,
    },
}

/// HTTP method plus payload for one logical request
#[derive(Debug, Clone)]
pub enum RequestMethod {
    Get,
    /// Form-encoded POST body (e.g. the chapter-list endpoint)
    PostForm(Vec<(String, String)>),
}

/// Specification of one logical request
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub url: String,
    pub method: RequestMethod,
    pub referer: Option<String>,
}

impl RequestSpec {
    pub fn get(url: &str) -> Self {
        Self {
            url: url.to_string(),
            method: RequestMethod::Get,
            referer: None,
        }
    }

    pub fn post_form(url: &str, fields: Vec<(String, String)>) -> Self {
        Self {
            url: url.to_string(),
            method: RequestMethod::PostForm(fields),
            referer: None,
        }
    }

    pub fn with_referer(mut self, referer: &str) -> Self {
        self.referer = Some(referer.to_string());
        self
    }
}

/// A successfully fetched response body
#[derive(Debug)]
pub struct RawDocument {
    pub body: String,
    /// Attempts consumed, including the successful one
    pub attempts: u32,
}

/// Browser user-agent strings rotated across attempts
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

fn random_user_agent() -> &'static str {
    let pick = rand::thread_rng().gen_range(0..USER_AGENTS.len());
    USER_AGENTS[pick]
}

/// Performs retrying fetches through the proxy pool
pub struct Fetcher {
    pool: Arc<ProxyPool>,
    direct: Client,
    max_retries: u32,
    timeout: Duration,
    backoff_ms: (u64, u64),
}

impl Fetcher {
    /// Creates a fetcher
    ///
    /// # Arguments
    ///
    /// * `pool` - Shared proxy pool; may be empty, in which case every
    ///   attempt goes out directly
    /// * `max_retries` - Attempts per logical request
    /// * `timeout` - Per-attempt network timeout
    pub fn new(pool: Arc<ProxyPool>, max_retries: u32, timeout: Duration) -> Result<Self, FetchError> {
        let direct = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            pool,
            direct,
            max_retries,
            timeout,
            backoff_ms: (1000, 3000),
        })
    }

    /// Overrides the retry backoff window (milliseconds, half-open range)
    ///
    /// The default is [1000, 3000). Tests shrink it to keep retries fast.
    pub fn with_backoff_ms(mut self, low: u64, high: u64) -> Self {
        self.backoff_ms = (low, high);
        self
    }

    /// Fetches one logical request with retry, backoff, and proxy rotation
    ///
    /// Outcome classification per attempt:
    /// - 200 with a non-empty body: success
    /// - 200 with an empty body: soft failure, retried (the proxy is kept)
    /// - any other status, timeout, or network error: the proxy used (if
    ///   any) is evicted and the attempt is retried after a randomized delay
    ///
    /// After `max_retries` attempts the last cause is reported in the error.
    pub async fn fetch(&self, spec: &RequestSpec) -> Result<RawDocument, FetchError> {
        let mut last_cause = String::from("no attempts made");

        for attempt in 1..=self.max_retries {
            let proxy = self.pool.acquire().await;
            // A client build failure is a transient outcome like any other:
            // it consumes the attempt but still gets the backoff delay below.
            let outcome = match proxy.as_deref() {
                Some(addr) => match self.pool.client_for(addr) {
                    Ok(client) => self.attempt(&client, spec).await,
                    Err(e) => {
                        AttemptOutcome::Transient(format!("proxy client build failed: {}", e))
                    }
                },
                None => self.attempt(&self.direct, spec).await,
            };

            match outcome {
                AttemptOutcome::Success(body) => {
                    return Ok(RawDocument {
                        body,
                        attempts: attempt,
                    });
                }
                AttemptOutcome::EmptyBody => {
                    tracing::warn!(url = %spec.url, attempt, "200 response with empty body");
                    last_cause = "empty response body".to_string();
                }
                AttemptOutcome::Transient(cause) => {
                    tracing::warn!(
                        url = %spec.url,
                        attempt,
                        max = self.max_retries,
                        cause = %cause,
                        "fetch attempt failed"
                    );
                    if let Some(addr) = proxy.as_deref() {
                        self.pool.evict(addr);
                    }
                    last_cause = cause;
                }
            }

            if attempt < self.max_retries {
                tokio::time::sleep(self.backoff_delay()).await;
            }
        }

        Err(FetchError::RetriesExhausted {
            url: spec.url.clone(),
            attempts: self.max_retries,
            last_cause,
        })
    }

    async fn attempt(&self, client: &Client, spec: &RequestSpec) -> AttemptOutcome {
        let mut request = match &spec.method {
            RequestMethod::Get => client.get(&spec.url),
            RequestMethod::PostForm(fields) => client.post(&spec.url).form(fields),
        };

        request = request
            .header(USER_AGENT, random_user_agent())
            .timeout(self.timeout);
        if let Some(referer) = &spec.referer {
            request = request.header(REFERER, referer);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let cause = if e.is_timeout() {
                    "request timeout".to_string()
                } else if e.is_connect() {
                    format!("connection failed: {}", e)
                } else {
                    e.to_string()
                };
                return AttemptOutcome::Transient(cause);
            }
        };

        let status = response.status();
        if !status.is_success() {
            return AttemptOutcome::Transient(format!("HTTP {}", status.as_u16()));
        }

        match response.text().await {
            Ok(body) if !body.trim().is_empty() => AttemptOutcome::Success(body),
            Ok(body) => {
                // Keep the payload around for offline diagnosis
                tracing::debug!(url = %spec.url, body = %body, "captured unexpected response body");
                AttemptOutcome::EmptyBody
            }
            Err(e) => AttemptOutcome::Transient(format!("body read failed: {}", e)),
        }
    }

    /// Randomized delay so concurrent workers do not retry in lockstep
    fn backoff_delay(&self) -> Duration {
        let (low, high) = self.backoff_ms;
        let millis = rand::thread_rng().gen_range(low..high);
        Duration::from_millis(millis)
    }
}

enum AttemptOutcome {
    Success(String),
    EmptyBody,
    Transient(String),
}
