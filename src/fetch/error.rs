use thiserror::Error;

/// Classified failure of a single HTTP attempt.
///
/// `is_retryable()` separates transient failures (timeouts, dropped
/// connections, truncated or empty bodies, rate limits, server errors) from
/// permanent ones so the retry loop can give up early.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("Timed out fetching {url}")]
    Timeout { url: String },

    #[error("Connection error fetching {url}: {reason}")]
    Connection { url: String, reason: String },

    #[error("HTTP error {status} fetching {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Unusable body from {url}: {reason}")]
    Decode { url: String, reason: String },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout { .. } => true,
            FetchError::Connection { .. } => true,
            FetchError::Decode { .. } => true,
            FetchError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
        }
    }

    /// 404 and 410 mean the candidate URL does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FetchError::HttpStatus {
                status: 404 | 410,
                ..
            }
        )
    }

    /// Map a transport error from reqwest onto the taxonomy.
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout { url: url.into() }
        } else if let Some(status) = err.status() {
            FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.into(),
            }
        } else if err.is_body() || err.is_decode() {
            FetchError::Decode {
                url: url.into(),
                reason: err.to_string(),
            }
        } else {
            FetchError::Connection {
                url: url.into(),
                reason: err.to_string(),
            }
        }
    }
}

/// Neither the original-resolution URL nor its one alternate exists.
#[derive(Debug, Clone, Error)]
#[error("No original image found for {reference} (tried {})", tried.join(", "))]
pub struct NotFoundError {
    pub reference: String,
    pub tried: Vec<String>,
}
