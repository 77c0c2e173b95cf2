//! Configuration module for asin-harvest
//!
//! This module handles loading, parsing, and validating the service's TOML
//! configuration file.
//!
//! # Example
//!
//! ```no_run
//! use asin_harvest::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("harvest.toml")).unwrap();
//! println!("Database lives at: {}", config.service.database_path);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{Config, MarketplaceConfig, ProviderConfig, SchedulerConfig, ServiceConfig};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash};
