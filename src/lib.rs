//! asin-harvest: resumable product scans over a marketplace catalog
//!
//! This crate orchestrates long-running scans that harvest product records
//! under a global request budget and third-party rate limits. Scans run one
//! at a time; later requests queue up in the store.

pub mod config;
pub mod extract;
pub mod fetcher;
pub mod scan;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for asin-harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] fetcher::FetchError),

    #[error("Scan error: {0}")]
    Orchestration(#[from] scan::OrchestrationError),

    #[error("Invalid scan request: {0}")]
    Validation(#[from] scan::ValidationError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid domain pattern: {0}")]
    InvalidPattern(String),
}

/// Result type alias for asin-harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use scan::{ScanManager, ScanRequest};
pub use state::{ScanState, SubjectStatus};
