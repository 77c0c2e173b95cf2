//! Deals discovery source

use crate::extract::{DealItem, PageExtractor};
use crate::fetcher::{FetchError, FetchErrorKind, Marketplace, PageFetcher};
use async_trait::async_trait;
use std::sync::Arc;

/// Attempts made on one deals page after the first failure
pub const MAX_PAGE_REATTEMPTS: u32 = 3;

/// Produces batches of deal entries for a domain
#[async_trait]
pub trait DealsSource: Send + Sync {
    /// Returns the deals on listing page `page` (1-based)
    ///
    /// An empty batch means the page had nothing new to offer.
    async fn next_batch(
        &self,
        domain: &str,
        category_node: Option<&str>,
        page: u32,
    ) -> Result<Vec<DealItem>, FetchError>;
}

/// [`DealsSource`] that reads the marketplace's coupon deals listing
pub struct ListingDealsSource {
    fetcher: Arc<dyn PageFetcher>,
    extractor: Arc<dyn PageExtractor>,
    marketplace: Marketplace,
}

impl ListingDealsSource {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        extractor: Arc<dyn PageExtractor>,
        marketplace: Marketplace,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            marketplace,
        }
    }
}

#[async_trait]
impl DealsSource for ListingDealsSource {
    async fn next_batch(
        &self,
        domain: &str,
        category_node: Option<&str>,
        page: u32,
    ) -> Result<Vec<DealItem>, FetchError> {
        let url = self.marketplace.deals_page(domain, category_node, page);
        let mut attempt = 0;

        loop {
            match self.fetcher.fetch(&url).await {
                Ok(document) => return Ok(self.extractor.deals(&document)),
                Err(err) => {
                    let retryable = matches!(
                        err.kind,
                        FetchErrorKind::ServerError | FetchErrorKind::Other
                    );
                    if !retryable || attempt >= MAX_PAGE_REATTEMPTS {
                        return Err(err);
                    }
                    attempt += 1;
                    tracing::debug!(
                        "Deals page {} failed ({}), reattempt {}/{}",
                        page,
                        err.kind,
                        attempt,
                        MAX_PAGE_REATTEMPTS
                    );
                }
            }
        }
    }
}
