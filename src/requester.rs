//! Outbound HTTP with retry, exponential backoff and jitter
//!
//! Backoff state lives inside each call chain; nothing here is shared
//! between concurrent requests.

use rand::Rng;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::TokenProvider;
use crate::config::{HttpConfig, RetryConfig};
use crate::error::{parse_retry_after, Result, SyncError};

/// Longest error body kept in an error message
const MAX_ERROR_BODY: usize = 512;

/// One HTTP call, independent of any provider
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// `application/x-www-form-urlencoded` body, exclusive with `body`
    pub form: Option<Vec<(String, String)>>,
    pub headers: Vec<(String, String)>,
    /// Attach the provider bearer token
    pub authenticated: bool,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            body: None,
            form: None,
            headers: Vec::new(),
            authenticated: true,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn form(mut self, pairs: &[(&str, &str)]) -> Self {
        self.form = Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Send without the provider credential (e.g. third-party unsubscribe endpoints)
    pub fn unauthenticated(mut self) -> Self {
        self.authenticated = false;
        self
    }

    fn describe(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

/// Exponential backoff parameters
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound of the extra random delay, as a fraction of the base delay
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            jitter_ratio: config.jitter_ratio,
        }
    }

    /// `min(initial * 2^attempt, max)`, before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Base delay inflated by a uniform draw from `[0, jitter_ratio]`
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_ratio <= 0.0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter_ratio);
        base + base.mul_f64(extra)
    }

    /// A server retry hint takes precedence over computed backoff
    pub fn delay_for(&self, attempt: u32, error: &SyncError) -> Duration {
        match error.retry_after() {
            Some(secs) => Duration::from_secs(secs),
            None => self.jittered_delay(attempt),
        }
    }
}

/// Issues provider requests, retrying only rate-limit and unavailability signals
#[derive(Clone)]
pub struct RateLimitedRequester {
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    policy: RetryPolicy,
}

impl RateLimitedRequester {
    pub fn new(tokens: Arc<dyn TokenProvider>, policy: RetryPolicy, http: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(http.timeout_secs))
            .connect_timeout(Duration::from_secs(http.connect_timeout_secs))
            .build()?;

        Ok(Self::with_client(client, tokens, policy))
    }

    pub fn with_client(http: reqwest::Client, tokens: Arc<dyn TokenProvider>, policy: RetryPolicy) -> Self {
        Self {
            http,
            tokens,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send and parse the JSON response body
    pub async fn send_json<T: DeserializeOwned>(&self, request: &RequestDescriptor) -> Result<T> {
        self.with_retry(request, || async {
            let response = self.execute_once(request).await?;
            let bytes = response.bytes().await?;
            serde_json::from_slice(&bytes).map_err(|e| {
                SyncError::MalformedResponse(format!("{}: {}", request.describe(), e))
            })
        })
        .await
    }

    /// Send and discard the response body
    pub async fn send(&self, request: &RequestDescriptor) -> Result<()> {
        self.with_retry(request, || async {
            self.execute_once(request).await?;
            Ok(())
        })
        .await
    }

    /// Retry `operation` on transient errors, up to `max_retries` times
    pub async fn with_retry<T, F, Fut>(&self, request: &RequestDescriptor, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    let delay = self.policy.delay_for(attempt, &e);
                    attempt += 1;
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        request.describe(),
                        attempt,
                        self.policy.max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A single attempt; non-2xx statuses come back classified
    pub async fn execute_once(&self, request: &RequestDescriptor) -> Result<reqwest::Response> {
        let mut builder = self.http.request(request.method.clone(), &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        if request.authenticated {
            let token = self.tokens.access_token().await.map_err(|e| match e {
                SyncError::AuthError(_) => e,
                other => SyncError::AuthError(other.to_string()),
            })?;
            builder = builder.bearer_auth(token);
        }

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some(body) = &request.body {
            builder = builder.json(body);
        } else if let Some(form) = &request.form {
            builder = builder.form(form);
        }

        debug!("{}", request.describe());
        let response = builder.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let retry_after = parse_retry_after(response.headers());
        let mut message = response.text().await.unwrap_or_default();
        if message.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }

        Err(SyncError::from_status(status.as_u16(), retry_after, message))
    }
}
