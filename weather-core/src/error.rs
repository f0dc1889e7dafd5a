use std::time::Duration;
use thiserror::Error;

/// Failure of a single weather fetch, as seen by the caller.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Rate limit reached: no provider call slot became free within {timeout:?}")]
    RateLimited { timeout: Duration },

    #[error("Network error: {0}")]
    Network(String),

    /// 4xx-class answer from the provider (bad request, invalid key, unknown location).
    #[error("Provider rejected the request ({status}): {message}")]
    ProviderClient { status: u16, message: String },

    /// 5xx-class answer from the provider.
    #[error("Provider failed ({status}): {message}")]
    ProviderServer { status: u16, message: String },

    #[error("Gave up after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<FetchError>,
    },

    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("Refusing non-HTTPS or unverifiable endpoint: {0}")]
    InsecureEndpoint(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Fetch task ended without producing a result")]
    Interrupted,
}

impl FetchError {
    /// Whether another attempt at the same provider call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::ProviderServer { .. } => true,
            // Request timeout and upstream throttling are transient even though they are 4xx.
            FetchError::ProviderClient { status, .. } => matches!(status, 408 | 429),
            FetchError::RateLimited { .. }
            | FetchError::RetriesExhausted { .. }
            | FetchError::MalformedResponse(_)
            | FetchError::InsecureEndpoint(_)
            | FetchError::InvalidQuery(_)
            | FetchError::Interrupted => false,
        }
    }

    /// HTTP status reported by the provider, looking through `RetriesExhausted`.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::ProviderClient { status, .. } | FetchError::ProviderServer { status, .. } => {
                Some(*status)
            }
            FetchError::RetriesExhausted { source, .. } => source.status(),
            _ => None,
        }
    }
}

/// The durable cache could not be read or written.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}
