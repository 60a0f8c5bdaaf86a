pub mod error;
pub mod resolve;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, REFERER, USER_AGENT};
use reqwest::Client;

pub use error::{FetchError, NotFoundError};

use crate::retry::{self, RetryAction, RetryConfig, RetryError, Retried};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36";

/// The image CDN rejects requests that do not come from the site itself.
const SITE_REFERER: &str = "https://www.pixiv.net/";

/// Raw byte transport used by the resolver and the download loop.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// GET the full body of `url`.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;

    /// HEAD `url`; `Ok` when the server answers 2xx.
    async fn probe(&self, url: &str) -> Result<(), FetchError>;
}

/// Settings baked into the HTTP client at construction.
#[derive(Clone)]
pub struct ClientSettings {
    pub timeout: Duration,
    /// Passed through verbatim as the `Cookie` header.
    pub cookie: Option<String>,
}

impl std::fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSettings")
            .field("timeout", &self.timeout)
            .field("cookie", &self.cookie.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        default_headers.insert(REFERER, HeaderValue::from_static(SITE_REFERER));
        if let Some(cookie) = settings.cookie.as_deref() {
            let mut value = HeaderValue::from_str(cookie)
                .map_err(|_| anyhow::anyhow!("Cookie contains characters not allowed in a header"))?;
            value.set_sensitive(true);
            default_headers.insert(COOKIE, value);
        }

        let client = Client::builder()
            .default_headers(default_headers)
            .timeout(settings.timeout)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let content_length = response.content_length();
        let mut body = Vec::with_capacity(content_length.unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                tracing::debug!(
                    "Body error for {} (content_length={:?}, bytes_so_far={}): {}",
                    url,
                    content_length,
                    body.len(),
                    e
                );
                FetchError::from_reqwest(url, e)
            })?;
            body.extend_from_slice(&chunk);
        }

        if body.is_empty() {
            return Err(FetchError::Decode {
                url: url.to_string(),
                reason: "empty body".into(),
            });
        }
        if let Some(expected) = content_length {
            if expected != body.len() as u64 {
                return Err(FetchError::Decode {
                    url: url.to_string(),
                    reason: format!("expected {} bytes, received {}", expected, body.len()),
                });
            }
        }

        Ok(body)
    }

    async fn probe(&self, url: &str) -> Result<(), FetchError> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            })
        }
    }
}

/// GET `url` through the retry controller.
///
/// Transient errors are retried up to `config.max_attempts` times; a terminal
/// status (4xx other than 429) comes back as `RetryError::Aborted` after one
/// attempt.
pub async fn fetch_with_retry(
    fetcher: &dyn Fetcher,
    url: &str,
    config: &RetryConfig,
) -> Result<Retried<Vec<u8>>, RetryError<FetchError>> {
    retry::retry_with_backoff(
        config,
        |e: &FetchError| {
            if e.is_retryable() {
                RetryAction::Retry
            } else {
                RetryAction::Abort
            }
        },
        || fetcher.fetch(url),
    )
    .await
}
