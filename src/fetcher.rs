//! HTTP fetcher for per-country CIDR feeds.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::policy::CountryCode;

#[cfg(test)]
use mockall::automock;

const RETRY_DELAY_MS: u64 = 2000;

/// Maximum size per country feed (16 MB).
/// The largest aggregated zone (us) is well under 1 MB.
const MAX_FEED_SIZE: usize = 16 * 1024 * 1024;

/// Source of raw feed text, one country at a time.
///
/// Implementations must bound every call in time; the engine never cancels a
/// fetch itself.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, country: CountryCode) -> Result<String, FeedError>;
}

/// Fetches feeds over HTTP(S) from a URL template.
pub struct HttpFeedSource {
    client: Client,
    config: FeedConfig,
}

impl HttpFeedSource {
    /// Create a new fetcher from feed settings
    pub fn new(config: FeedConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(format!("geogate/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, config })
    }

    /// Fetch content with retry logic and size validation
    async fn fetch_with_retry(&self, url: &str) -> Result<String, FeedError> {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = RETRY_DELAY_MS * (1 << (attempt - 1).min(5));
                debug!("Retry {} after {}ms for {}", attempt, delay, url);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            match self.fetch_once(url).await {
                Ok(body) => return Ok(body),
                // Retrying will not shrink the response
                Err(e @ FeedError::TooLarge { .. }) => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| FeedError::Transport("no attempt made".to_string())))
    }

    async fn fetch_once(&self, url: &str) -> Result<String, FeedError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }

        if let Some(content_length) = response.content_length() {
            let size = usize::try_from(content_length).unwrap_or(usize::MAX);
            if size > MAX_FEED_SIZE {
                return Err(FeedError::TooLarge {
                    size,
                    max: MAX_FEED_SIZE,
                });
            }
        }

        let body = response
            .text()
            .await
            .map_err(|e| FeedError::Transport(format!("failed to read body: {}", e)))?;

        // Content-Length may be absent or wrong
        if body.len() > MAX_FEED_SIZE {
            return Err(FeedError::TooLarge {
                size: body.len(),
                max: MAX_FEED_SIZE,
            });
        }

        Ok(body)
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(&self, country: CountryCode) -> Result<String, FeedError> {
        let url = self.config.url_for(country);
        debug!("Fetching feed for {} from {}", country, url);
        self.fetch_with_retry(&url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unroutable_config() -> FeedConfig {
        FeedConfig {
            // Reserved TEST-NET-1 address, nothing listens there
            url_template: "http://192.0.2.1:9/{country}.zone".to_string(),
            timeout_secs: 1,
            max_retries: 1,
            max_concurrent: 1,
        }
    }

    #[test]
    fn test_http_feed_source_new() {
        assert!(HttpFeedSource::new(FeedConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_transport_error_is_soft_failure() {
        let source = HttpFeedSource::new(unroutable_config()).unwrap();
        let result = source.fetch("us".parse().unwrap()).await;
        assert!(matches!(result, Err(FeedError::Transport(_))));
    }

    #[tokio::test]
    async fn test_mock_feed_source() {
        let mut mock = MockFeedSource::new();
        mock.expect_fetch()
            .withf(|cc| cc.as_str() == "de")
            .times(1)
            .returning(|_| Ok("1.2.3.0/24\n".to_string()));

        let body = mock.fetch("de".parse().unwrap()).await.unwrap();
        assert_eq!(body, "1.2.3.0/24\n");
    }
}
