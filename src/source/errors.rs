//! Listing Error Types
//!
//! Structured errors for partition listing calls.
//! Maps HTTP status codes to specific error variants for retry decisions.

/// Partition listing error types
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Authentication expired, token needs refresh")]
    AuthExpired,

    #[error("Rate limited, try again after backoff")]
    RateLimited,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),

    #[error("Failed to decode listing response: {0}")]
    Decode(String),

    #[error("I/O error listing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl SourceError {
    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SourceError::RateLimited
                | SourceError::Timeout
                | SourceError::Network(_)
                | SourceError::Server(_, _)
                | SourceError::AuthExpired
        )
    }

    /// Create a SourceError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => SourceError::AuthExpired,
            403 => SourceError::Forbidden(body.to_string()),
            404 => SourceError::NotFound(body.to_string()),
            408 => SourceError::Timeout,
            429 => SourceError::RateLimited,
            500..=599 => SourceError::Server(status, body.to_string()),
            _ => SourceError::Request(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Timeout
        } else if e.is_decode() {
            SourceError::Decode(e.to_string())
        } else if e.is_connect() || e.is_request() {
            SourceError::Network(e.to_string())
        } else {
            SourceError::Request(e.to_string())
        }
    }
}
