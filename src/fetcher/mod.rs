//! Page fetching
//!
//! Scans never talk HTTP directly. They hand a marketplace URL to a
//! [`PageFetcher`] and get back either the document text or a classified
//! [`FetchError`]. The classification drives the retry policy.
//!
//! - `provider`: the scraping-provider backed fetcher
//! - `urls`: marketplace URL construction
//! - `deals`: batch source for deals discovery

mod deals;
mod provider;
mod urls;

pub use deals::{DealsSource, ListingDealsSource, MAX_PAGE_REATTEMPTS};
pub use provider::{build_http_client, ProviderFetcher};
pub use urls::Marketplace;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Classification of a failed fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchErrorKind {
    /// Provider credits or credentials ran out; the scan must pause
    CredentialsExhausted,

    /// Provider asked us to slow down
    RateLimited,

    /// The marketplace page does not exist
    NotFound,

    /// Transient failure at the provider or marketplace
    ServerError,

    /// Anything else
    Other,
}

impl FetchErrorKind {
    /// Maps an HTTP status returned by the provider
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 402 | 403 => Self::CredentialsExhausted,
            429 => Self::RateLimited,
            404 | 410 => Self::NotFound,
            500..=599 => Self::ServerError,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CredentialsExhausted => "credentials exhausted",
            Self::RateLimited => "rate limited",
            Self::NotFound => "not found",
            Self::ServerError => "server error",
            Self::Other => "other",
        };
        write!(f, "{}", name)
    }
}

/// A failed fetch of one marketplace URL
#[derive(Debug, Clone, Error)]
#[error("Fetch of {url} failed ({kind}): {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub url: String,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn from_status(status: u16, url: impl Into<String>) -> Self {
        Self::new(
            FetchErrorKind::from_status(status),
            url,
            format!("HTTP {}", status),
        )
    }
}

/// Fetches marketplace documents
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetches a marketplace URL and returns the document text
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;

    /// Concurrency ceiling advertised by the provider, if any
    ///
    /// When present it overrides a scan's `max_concurrent_requests` at
    /// launch and on every resume.
    fn concurrency_hint(&self) -> Option<usize> {
        None
    }
}
