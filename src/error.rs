use thiserror::Error;

/// Type alias for Result with SyncError
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error taxonomy for provider synchronization and bulk mutation
#[derive(Error, Debug)]
pub enum SyncError {
    /// HTTP 429 - transient, retried with backoff
    #[error("Rate limit exceeded (HTTP 429){}", retry_hint(.retry_after))]
    RateLimitExceeded { retry_after: Option<u64> },

    /// HTTP 503 - transient, retried with backoff
    #[error("Service unavailable (HTTP 503){}", retry_hint(.retry_after))]
    ServiceUnavailable { retry_after: Option<u64> },

    /// Credential rejected outright - aborts the remaining operation
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Resource not found (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Any other non-2xx response - never retried
    #[error("Provider API error (HTTP {status}): {message}")]
    ApiError { status: u16, message: String },

    /// The stored continuation cursor is no longer accepted by the provider
    #[error("Sync cursor expired: {0}")]
    CursorExpired(String),

    /// Request never produced an HTTP response (connection refused, timeout, ...)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Response body could not be parsed
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Provider returned a message we cannot interpret
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Operation is not valid in the current state
    #[error("Invalid state: {0}")]
    StateError(String),

    /// Cursor or stats store failure
    #[error("Store error: {0}")]
    StoreError(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

fn retry_hint(retry_after: &Option<u64>) -> String {
    match retry_after {
        Some(secs) => format!(", retry after {} seconds", secs),
        None => String::new(),
    }
}

impl SyncError {
    /// Transient errors (429/503) are the only ones the requester retries
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimitExceeded { .. } | SyncError::ServiceUnavailable { .. }
        )
    }

    /// Systemic errors abort a whole batch: retrying per item cannot fix them
    pub fn is_systemic(&self) -> bool {
        matches!(self, SyncError::AuthError(_))
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Server-provided retry hint in seconds, if the error carries one
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            SyncError::RateLimitExceeded { retry_after }
            | SyncError::ServiceUnavailable { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Copy of this error for fanning one failure out to many items
    ///
    /// IO and serialization errors carry non-cloneable sources and are
    /// reported as `StoreError` with the original message.
    pub fn duplicate(&self) -> SyncError {
        match self {
            SyncError::RateLimitExceeded { retry_after } => SyncError::RateLimitExceeded {
                retry_after: *retry_after,
            },
            SyncError::ServiceUnavailable { retry_after } => SyncError::ServiceUnavailable {
                retry_after: *retry_after,
            },
            SyncError::AuthError(m) => SyncError::AuthError(m.clone()),
            SyncError::NotFound(m) => SyncError::NotFound(m.clone()),
            SyncError::ApiError { status, message } => SyncError::ApiError {
                status: *status,
                message: message.clone(),
            },
            SyncError::CursorExpired(m) => SyncError::CursorExpired(m.clone()),
            SyncError::NetworkError(m) => SyncError::NetworkError(m.clone()),
            SyncError::MalformedResponse(m) => SyncError::MalformedResponse(m.clone()),
            SyncError::InvalidMessageFormat(m) => SyncError::InvalidMessageFormat(m.clone()),
            SyncError::StateError(m) => SyncError::StateError(m.clone()),
            SyncError::StoreError(m) => SyncError::StoreError(m.clone()),
            SyncError::ConfigError(m) => SyncError::ConfigError(m.clone()),
            SyncError::IoError(_) | SyncError::SerializationError(_) => {
                SyncError::StoreError(self.to_string())
            }
        }
    }

    /// Classify a non-success HTTP status into the error taxonomy
    pub fn from_status(status: u16, retry_after: Option<u64>, message: String) -> Self {
        match status {
            429 => SyncError::RateLimitExceeded { retry_after },
            503 => SyncError::ServiceUnavailable { retry_after },
            401 => SyncError::AuthError(message),
            404 => SyncError::NotFound(message),
            _ => SyncError::ApiError { status, message },
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            SyncError::MalformedResponse(error.to_string())
        } else if let Some(status) = error.status() {
            SyncError::from_status(status.as_u16(), None, error.to_string())
        } else {
            SyncError::NetworkError(error.to_string())
        }
    }
}

/// Parse a Retry-After header value
///
/// The header can be specified in two formats:
/// 1. Delay-seconds: An integer indicating seconds to wait (e.g., "120")
/// 2. HTTP-date: An HTTP date format (e.g., "Wed, 21 Oct 2015 07:28:00 GMT")
///
/// Returns `None` when the header is missing, unparseable, or names a time
/// in the past, so the caller falls back to computed backoff.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    parse_retry_after_value(value)
}

pub(crate) fn parse_retry_after_value(value: &str) -> Option<u64> {
    let value = value.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }

    let http_date = httpdate::parse_http_date(value).ok()?;
    http_date
        .duration_since(std::time::SystemTime::now())
        .ok()
        .map(|d| d.as_secs())
}
