use crate::config::types::{Config, MarketplaceConfig, ProviderConfig, SchedulerConfig, ServiceConfig};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_service_config(&config.service)?;
    validate_marketplace_config(&config.marketplace)?;
    validate_provider_config(&config.provider)?;
    validate_scheduler_config(&config.scheduler)?;
    Ok(())
}

fn validate_service_config(config: &ServiceConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    if config.allowed_domains.is_empty() {
        return Err(ConfigError::Validation(
            "allowed_domains must list at least one domain".to_string(),
        ));
    }

    for domain in &config.allowed_domains {
        validate_marketplace_domain(domain)?;
    }

    Ok(())
}

fn validate_marketplace_config(config: &MarketplaceConfig) -> Result<(), ConfigError> {
    if config.host.is_empty() || config.host.contains('/') {
        return Err(ConfigError::InvalidPattern(format!(
            "Marketplace host '{}' must be a bare host name",
            config.host
        )));
    }
    Ok(())
}

fn validate_provider_config(config: &ProviderConfig) -> Result<(), ConfigError> {
    Url::parse(&config.endpoint)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid provider endpoint: {}", e)))?;

    if let Some(usage) = &config.usage_endpoint {
        Url::parse(usage)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid usage endpoint: {}", e)))?;
    }

    if config.api_key.is_empty() {
        return Err(ConfigError::Validation("api_key cannot be empty".to_string()));
    }

    if let Some(max) = config.max_concurrency {
        if max < 1 {
            return Err(ConfigError::Validation(format!(
                "max_concurrency must be >= 1, got {}",
                max
            )));
        }
    }

    if config.timeout_secs < 1 || config.timeout_secs > 600 {
        return Err(ConfigError::Validation(format!(
            "timeout_secs must be between 1 and 600, got {}",
            config.timeout_secs
        )));
    }

    Ok(())
}

fn validate_scheduler_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
    if config.listing_page_yield < 1 {
        return Err(ConfigError::Validation(format!(
            "listing_page_yield must be >= 1, got {}",
            config.listing_page_yield
        )));
    }

    if config.deals_max_empty_batches < 1 {
        return Err(ConfigError::Validation(format!(
            "deals_max_empty_batches must be >= 1, got {}",
            config.deals_max_empty_batches
        )));
    }

    Ok(())
}

/// A marketplace domain is a top-level suffix such as `com` or `co.uk`
fn validate_marketplace_domain(domain: &str) -> Result<(), ConfigError> {
    if domain.is_empty() {
        return Err(ConfigError::InvalidPattern(
            "Domain cannot be empty".to_string(),
        ));
    }

    if !domain
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.')
    {
        return Err(ConfigError::InvalidPattern(format!(
            "Domain '{}' contains invalid characters",
            domain
        )));
    }

    if domain.starts_with('.') || domain.ends_with('.') || domain.contains("..") {
        return Err(ConfigError::InvalidPattern(format!(
            "Domain '{}' is not a valid suffix",
            domain
        )));
    }

    Ok(())
}
