//! Origin fetcher: one bounded outbound GET per invocation.
//!
//! The body is consumed chunk by chunk and the download aborts the moment
//! the running byte count would exceed the configured limit, so a hostile
//! or misconfigured origin can never make us buffer an unbounded payload.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;

/// Errors from origin fetches.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("origin request timed out")]
    Timeout,

    #[error("origin returned status {status}")]
    Upstream { status: StatusCode },

    #[error("origin connection failed: {0}")]
    Network(reqwest::Error),

    #[error("origin payload exceeds limit of {limit} bytes")]
    TooLarge { limit: u64 },
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(err)
        }
    }
}

/// A fully downloaded origin response.
#[derive(Debug)]
pub struct FetchResult {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub byte_size: u64,
}

/// Fetches origin images under a byte limit and a deadline.
#[derive(Debug, Clone)]
pub struct OriginFetcher {
    client: Client,
    origin_url: String,
    max_bytes: u64,
}

impl OriginFetcher {
    /// Create a fetcher for the given origin base URL.
    ///
    /// `origin_url` must end with a slash (config normalizes this) so that
    /// joining a relative path stays under the configured base.
    pub fn new(origin_url: String, max_bytes: u64, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(FetchError::Network)?;

        Ok(Self {
            client,
            origin_url,
            max_bytes,
        })
    }

    /// Download `<origin_url><path>`, enforcing the byte limit mid-stream.
    ///
    /// No retries at this layer.
    pub async fn fetch(&self, path: &str) -> Result<FetchResult, FetchError> {
        let url = format!("{}{}", self.origin_url, path.trim_start_matches('/'));

        debug!(url = %url, "Fetching origin image");

        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Upstream { status });
        }

        // Reject early on a declared oversize payload.
        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(FetchError::TooLarge {
                    limit: self.max_bytes,
                });
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if body.len() as u64 + chunk.len() as u64 > self.max_bytes {
                return Err(FetchError::TooLarge {
                    limit: self.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        let byte_size = body.len() as u64;
        debug!(url = %url, size = byte_size, "Origin image downloaded");

        Ok(FetchResult {
            bytes: body.freeze(),
            content_type,
            byte_size,
        })
    }
}
