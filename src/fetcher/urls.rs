//! Marketplace URL construction

use crate::config::MarketplaceConfig;

/// Builds marketplace URLs for a host prefix such as `www.amazon`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marketplace {
    host: String,
}

impl Marketplace {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn from_config(config: &MarketplaceConfig) -> Self {
        Self::new(config.host.clone())
    }

    fn origin(&self, domain: &str) -> String {
        format!("https://{}.{}", self.host, domain)
    }

    /// Listing page `page` (1-based) of a category browse node
    pub fn category_page(&self, domain: &str, node_id: &str, page: u32) -> String {
        format!(
            "{}/s?rh=n:{}&fs=true&page={}",
            self.origin(domain),
            node_id,
            page
        )
    }

    /// Product detail page of an ASIN
    pub fn product_page(&self, domain: &str, asin: &str) -> String {
        format!("{}/dp/{}", self.origin(domain), asin)
    }

    /// Coupon deals listing, optionally filtered to one department
    pub fn deals_page(&self, domain: &str, node_id: Option<&str>, page: u32) -> String {
        let mut url = format!(
            "{}/deals?bubble-id=deals-collection-coupons",
            self.origin(domain)
        );
        if let Some(node) = node_id {
            url.push_str(&format!("&deals-widget=departments:{}", node));
        }
        if page > 1 {
            url.push_str(&format!("&page={}", page));
        }
        url
    }
}

impl Default for Marketplace {
    fn default() -> Self {
        Self::from_config(&MarketplaceConfig::default())
    }
}
