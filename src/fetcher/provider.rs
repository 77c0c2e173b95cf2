//! Scraping provider client
//!
//! The provider fetches a marketplace URL on our behalf:
//! `GET {endpoint}?api_key={key}&url={target}`. Its HTTP status is the
//! signal the retry policy acts on.

use crate::config::ProviderConfig;
use crate::fetcher::{FetchError, FetchErrorKind, PageFetcher};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const USER_AGENT: &str = concat!("asin-harvest/", env!("CARGO_PKG_VERSION"));

/// Builds the HTTP client used to reach the provider
///
/// # Arguments
///
/// * `config` - The provider configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(config: &ProviderConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Account usage reported by the provider
#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(alias = "concurrencyLimit")]
    max_concurrency: Option<usize>,
}

/// [`PageFetcher`] backed by a scraping provider
pub struct ProviderFetcher {
    client: Client,
    endpoint: String,
    api_key: String,
    usage_endpoint: Option<String>,

    /// Zero means no hint
    hint: AtomicUsize,
}

impl ProviderFetcher {
    pub fn new(config: &ProviderConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(config)?,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            usage_endpoint: config.usage_endpoint.clone(),
            hint: AtomicUsize::new(config.max_concurrency.unwrap_or(0)),
        })
    }

    /// Re-reads the concurrency ceiling from the usage endpoint
    ///
    /// Keeps the previous hint when no usage endpoint is configured or the
    /// response carries no limit.
    pub async fn refresh_concurrency_hint(&self) -> Result<Option<usize>, reqwest::Error> {
        let Some(usage_endpoint) = &self.usage_endpoint else {
            return Ok(self.concurrency_hint());
        };

        let usage: Usage = self
            .client
            .get(usage_endpoint)
            .query(&[("api_key", self.api_key.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(limit) = usage.max_concurrency.filter(|l| *l > 0) {
            self.hint.store(limit, Ordering::Relaxed);
            tracing::info!("Provider concurrency limit is {}", limit);
        }

        Ok(self.concurrency_hint())
    }
}

#[async_trait]
impl PageFetcher for ProviderFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        tracing::debug!("Fetching {}", url);

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("api_key", self.api_key.as_str()), ("url", url)])
            .send()
            .await
            .map_err(|e| {
                // Timeouts and dropped connections are worth another attempt
                let kind = if e.is_timeout() || e.is_connect() {
                    FetchErrorKind::ServerError
                } else {
                    FetchErrorKind::Other
                };
                FetchError::new(kind, url, e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!("Provider returned {} for {}", status, url);
            return Err(FetchError::from_status(status.as_u16(), url));
        }

        response
            .text()
            .await
            .map_err(|e| FetchError::new(FetchErrorKind::ServerError, url, e.to_string()))
    }

    fn concurrency_hint(&self) -> Option<usize> {
        match self.hint.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        }
    }
}
