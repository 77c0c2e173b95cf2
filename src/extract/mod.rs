//! Document extraction
//!
//! Turns fetched page text into product attributes, listing-page ASINs and
//! deal entries. The scan scheduler only sees the [`PageExtractor`] trait;
//! [`HtmlExtractor`] is the default CSS-selector implementation.

mod html;

pub use html::HtmlExtractor;

use crate::storage::ProductData;
use serde::Deserialize;

/// ASINs and pagination state extracted from a category listing page
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ListingPage {
    /// Distinct ASINs in page order
    pub asins: Vec<String>,

    /// True when the listing has no next page
    pub is_last_page: bool,

    /// Delivery location the provider's proxy appeared from
    pub proxy_country: Option<String>,
}

/// A product found on a deals listing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DealItem {
    pub asin: String,

    /// Coupon or discount label shown next to the deal
    #[serde(default)]
    pub discount: Option<String>,
}

/// Converts fetched documents into structured data
///
/// Extraction never fails: fields that cannot be found are left empty.
pub trait PageExtractor: Send + Sync {
    /// Extracts product attributes from a product page
    fn product(&self, document: &str) -> ProductData;

    /// Extracts ASINs and the last-page flag from a category listing page
    fn listing(&self, document: &str) -> ListingPage;

    /// Extracts deal entries from a deals listing page
    fn deals(&self, document: &str) -> Vec<DealItem>;
}

/// Returns true if `candidate` has the shape of an ASIN
pub fn is_asin(candidate: &str) -> bool {
    candidate.len() == 10
        && candidate
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}
