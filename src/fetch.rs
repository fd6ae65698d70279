//! HTTP fetcher for organiser pages and APIs.
//!
//! A plain GET utility with no retries of its own. Status and transport
//! failures are distinguished so the coordinator can classify them.

use std::time::Duration;
use thiserror::Error;

/// User-Agent sent on every request.
pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Default request timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Fetch errors
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl FetchError {
    /// HTTP status code, if this was a status error.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            FetchError::Transport { .. } => None,
        }
    }
}

/// A fetched page body with its status code.
#[derive(Debug)]
pub struct FetchedPage {
    pub status: u16,
    pub body: String,
}

/// HTTP fetcher with a shared client.
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    /// Create a fetcher with the default timeout.
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a fetcher with a custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .expect("failed to build HTTP client");

        Self { client }
    }

    /// GET a URL. Any status below 400 returns the body; 4xx/5xx is a
    /// `Status` error with the code preserved.
    pub async fn get(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                source: e,
            })?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(FetchError::Status {
                status,
                url: url.to_string(),
            });
        }

        let body = response.text().await.map_err(|e| FetchError::Transport {
            url: url.to_string(),
            source: e,
        })?;

        Ok(FetchedPage { status, body })
    }
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_accessor() {
        let err = FetchError::Status {
            status: 404,
            url: "https://example.com".to_string(),
        };
        assert_eq!(err.status(), Some(404));
    }

    #[test]
    fn test_error_display() {
        let err = FetchError::Status {
            status: 503,
            url: "https://example.com/results".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 503 from https://example.com/results");
    }
}
