use serde::Deserialize;

/// Main configuration structure for asin-harvest
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    #[serde(default)]
    pub marketplace: MarketplaceConfig,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Service-level settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Marketplace top-level domains a scan may target
    #[serde(rename = "allowed-domains", default = "default_allowed_domains")]
    pub allowed_domains: Vec<String>,
}

/// Marketplace URL layout
#[derive(Debug, Clone, Deserialize)]
pub struct MarketplaceConfig {
    /// Host prefix, the scan's domain is appended (`www.amazon` + `.de`)
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
        }
    }
}

/// Scraping provider settings
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// API endpoint that fetches a target URL on our behalf
    pub endpoint: String,

    /// API key sent with every request
    #[serde(rename = "api-key")]
    pub api_key: String,

    /// Optional account usage endpoint advertising the concurrency ceiling
    #[serde(rename = "usage-endpoint", default)]
    pub usage_endpoint: Option<String>,

    /// Static concurrency ceiling, overrides the per-scan setting
    #[serde(rename = "max-concurrency", default)]
    pub max_concurrency: Option<usize>,

    /// Per-request timeout in seconds
    #[serde(rename = "timeout-secs", default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Scheduler tuning
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Expected number of products on one category listing page
    #[serde(rename = "listing-page-yield", default = "default_listing_page_yield")]
    pub listing_page_yield: usize,

    /// Consecutive deal batches without new ASINs before discovery gives up
    #[serde(
        rename = "deals-max-empty-batches",
        default = "default_deals_max_empty_batches"
    )]
    pub deals_max_empty_batches: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            listing_page_yield: default_listing_page_yield(),
            deals_max_empty_batches: default_deals_max_empty_batches(),
        }
    }
}

fn default_allowed_domains() -> Vec<String> {
    vec!["com".to_string(), "de".to_string()]
}

fn default_host() -> String {
    "www.amazon".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_listing_page_yield() -> usize {
    24
}

fn default_deals_max_empty_batches() -> u32 {
    3
}
