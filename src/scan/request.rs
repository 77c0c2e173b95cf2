//! Scan requests and their validated configuration
//!
//! A [`ScanRequest`] is the loose, user-supplied form (a TOML file or an API
//! payload). [`ScanRequest::validate`] turns it into a [`ScanConfig`] once, at
//! submission time; everything downstream works with the typed form.

use crate::extract::is_asin;
use crate::storage::{lock, ScanProductLink, SharedStore, StorageError};
use crate::state::SubjectStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// The three scan variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanKind {
    #[serde(rename = "ASIN")]
    Asin,
    Category,
    Deals,
}

impl ScanKind {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Asin => "ASIN",
            Self::Category => "Category",
            Self::Deals => "Deals",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "ASIN" => Some(Self::Asin),
            "Category" => Some(Self::Category),
            "Deals" => Some(Self::Deals),
            _ => None,
        }
    }
}

impl fmt::Display for ScanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Request budget shared by every variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Hard ceiling on fetches sent by the scan
    pub max_requests: u32,

    /// Worker pool size; shrinks on rate limiting, never grows mid-pass
    pub max_concurrent_requests: usize,

    /// Retries allowed per subject after transient server errors
    pub max_rerequests: u32,
}

/// Order in which a category tree is flattened into a work list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraversalStrategy {
    #[serde(rename = "breadth-first-start")]
    BreadthFirst,
    #[serde(rename = "breadth-first-end")]
    BreadthFirstReverse,
    #[serde(rename = "depth-first-start")]
    DepthFirst,
    #[serde(rename = "depth-first-end")]
    DepthFirstReverse,
}

impl TraversalStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BreadthFirst => "breadth-first-start",
            Self::BreadthFirstReverse => "breadth-first-end",
            Self::DepthFirst => "depth-first-start",
            Self::DepthFirstReverse => "depth-first-end",
        }
    }

    pub fn is_depth_first(&self) -> bool {
        matches!(self, Self::DepthFirst | Self::DepthFirstReverse)
    }

    /// Children are visited last-to-first
    pub fn is_reversed(&self) -> bool {
        matches!(self, Self::BreadthFirstReverse | Self::DepthFirstReverse)
    }
}

impl FromStr for TraversalStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "breadth-first-start" => Ok(Self::BreadthFirst),
            "breadth-first-end" => Ok(Self::BreadthFirstReverse),
            "depth-first-start" => Ok(Self::DepthFirst),
            "depth-first-end" => Ok(Self::DepthFirstReverse),
            other => Err(format!("Unknown traversal strategy '{}'", other)),
        }
    }
}

impl fmt::Display for TraversalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTarget {
    pub main_category_id: i64,
    pub products_to_gather: u32,
    pub min_rank: u32,
    pub max_rank: u32,
    pub strategy: TraversalStrategy,

    /// Page depth of the shallow first pass, if page-skip is enabled
    pub pages_skip: Option<u32>,
}

impl CategoryTarget {
    pub fn rank_in_range(&self, rank: Option<u32>) -> bool {
        rank.map_or(false, |r| r >= self.min_rank && r <= self.max_rank)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealsTarget {
    pub main_category_id: Option<i64>,

    /// Browse node of `main_category_id`, resolved at validation
    pub main_category_node_id: Option<String>,
    pub products_to_gather: u32,
}

/// Variant-specific target of a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ScanTarget {
    #[serde(rename = "ASIN")]
    Asin { asins: Vec<String> },
    Category(CategoryTarget),
    Deals(DealsTarget),
}

impl ScanTarget {
    pub fn kind(&self) -> ScanKind {
        match self {
            Self::Asin { .. } => ScanKind::Asin,
            Self::Category(_) => ScanKind::Category,
            Self::Deals(_) => ScanKind::Deals,
        }
    }

    pub fn products_to_gather(&self) -> u32 {
        match self {
            Self::Asin { asins } => asins.len() as u32,
            Self::Category(target) => target.products_to_gather,
            Self::Deals(target) => target.products_to_gather,
        }
    }

    /// Recomputes `products_gathered` from a scan's stored product links
    ///
    /// Agrees with the live counter of a completed scan: ASIN scans count
    /// every terminal record, category scans count recorded products whose
    /// observed rank is in range, deals scans count recorded products.
    pub fn count_gathered(&self, links: &[ScanProductLink]) -> u32 {
        let counted = match self {
            Self::Asin { .. } => links.len(),
            Self::Category(target) => links
                .iter()
                .filter(|l| l.status == SubjectStatus::Recorded && target.rank_in_range(l.rank))
                .count(),
            Self::Deals(_) => links
                .iter()
                .filter(|l| l.status == SubjectStatus::Recorded)
                .count(),
        };
        (counted as u32).min(self.products_to_gather())
    }
}

/// A validated scan configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    pub domain: String,
    pub budget: Budget,
    pub target: ScanTarget,
}

impl ScanConfig {
    pub fn kind(&self) -> ScanKind {
        self.target.kind()
    }
}

/// Validation failure, carrying an HTTP-style status code
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Storage error during validation: {0}")]
    Storage(#[from] StorageError),
}

impl ValidationError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Invalid(_) => 400,
            Self::NotFound(_) => 404,
            Self::Storage(_) => 500,
        }
    }
}

fn invalid(message: impl Into<String>) -> ValidationError {
    ValidationError::Invalid(message.into())
}

/// Narrows a request integer, rejecting values that do not fit
fn bounded<T: TryFrom<i64>>(value: i64, field: &str) -> Result<T, ValidationError> {
    T::try_from(value).map_err(|_| invalid(format!("{} is too large, got {}", field, value)))
}

/// Facts about the service a request is validated against
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub allowed_domains: Vec<String>,

    /// The fetcher advertises its own concurrency ceiling
    pub has_concurrency_hint: bool,
}

/// A scan request as submitted
///
/// ```toml
/// type = "Category"
/// domain = "com"
/// max-requests = 500
/// max-concurrent-requests = 5
/// max-rerequests = 2
/// main-category-id = 1
/// products-to-gather = 100
/// min-rank = 1
/// max-rank = 5000
/// strategy = "breadth-first-start"
/// use-pages-skip = true
/// pages-skip = 2
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ScanRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub domain: String,
    pub max_requests: Option<i64>,
    pub max_concurrent_requests: Option<i64>,
    pub max_rerequests: Option<i64>,
    pub asins: Vec<String>,
    pub main_category_id: Option<i64>,
    pub products_to_gather: Option<i64>,
    pub min_rank: Option<i64>,
    pub max_rank: Option<i64>,
    pub strategy: Option<String>,
    pub use_pages_skip: bool,
    pub pages_skip: Option<i64>,
}

impl ScanRequest {
    /// Parses a request from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ValidationError> {
        toml::from_str(content).map_err(|e| invalid(format!("Malformed scan request: {}", e)))
    }

    /// Reads and parses a request file
    pub fn load(path: &Path) -> Result<Self, ValidationError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            invalid(format!("Cannot read scan request {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Validates the request against the declared variant's rules
    ///
    /// Category and deals requests read the category tree, so this may block
    /// on the store.
    pub fn validate(
        &self,
        context: &ValidationContext,
        store: &SharedStore,
    ) -> Result<ScanConfig, ValidationError> {
        let kind = ScanKind::from_db_string(&self.kind)
            .ok_or_else(|| invalid(format!("Unknown scan type '{}'", self.kind)))?;

        if !context.allowed_domains.iter().any(|d| d == &self.domain) {
            return Err(invalid(format!(
                "Domain '{}' is not allowed",
                self.domain
            )));
        }

        let budget = self.validate_budget(context)?;
        let target = match kind {
            ScanKind::Asin => self.validate_asin()?,
            ScanKind::Category => self.validate_category(store)?,
            ScanKind::Deals => self.validate_deals(store)?,
        };

        Ok(ScanConfig {
            domain: self.domain.clone(),
            budget,
            target,
        })
    }

    fn validate_budget(&self, context: &ValidationContext) -> Result<Budget, ValidationError> {
        let max_requests = match self.max_requests {
            Some(n) if n >= 1 => bounded(n, "max-requests")?,
            Some(n) => return Err(invalid(format!("max-requests must be >= 1, got {}", n))),
            None => return Err(invalid("max-requests is required")),
        };

        let max_concurrent_requests = match self.max_concurrent_requests {
            Some(n) if n >= 1 => bounded::<u32>(n, "max-concurrent-requests")? as usize,
            Some(_) | None if context.has_concurrency_hint => 1,
            Some(n) => {
                return Err(invalid(format!(
                    "max-concurrent-requests must be >= 1, got {}",
                    n
                )))
            }
            None => return Err(invalid("max-concurrent-requests is required")),
        };

        let max_rerequests = match self.max_rerequests.unwrap_or(0) {
            n if n >= 0 => bounded(n, "max-rerequests")?,
            n => return Err(invalid(format!("max-rerequests must be >= 0, got {}", n))),
        };

        Ok(Budget {
            max_requests,
            max_concurrent_requests,
            max_rerequests,
        })
    }

    fn validate_asin(&self) -> Result<ScanTarget, ValidationError> {
        let mut seen = HashSet::new();
        let mut asins = Vec::with_capacity(self.asins.len());

        for asin in &self.asins {
            if !is_asin(asin) {
                return Err(invalid(format!("'{}' is not a valid ASIN", asin)));
            }
            if seen.insert(asin.as_str()) {
                asins.push(asin.clone());
            }
        }

        if asins.is_empty() {
            return Err(invalid("asins must list at least one ASIN"));
        }

        Ok(ScanTarget::Asin { asins })
    }

    fn products_to_gather(&self) -> Result<u32, ValidationError> {
        match self.products_to_gather {
            Some(n) if n >= 1 => bounded(n, "products-to-gather"),
            Some(n) => Err(invalid(format!(
                "products-to-gather must be >= 1, got {}",
                n
            ))),
            None => Err(invalid("products-to-gather is required")),
        }
    }

    fn validate_category(&self, store: &SharedStore) -> Result<ScanTarget, ValidationError> {
        let main_category_id = self
            .main_category_id
            .ok_or_else(|| invalid("main-category-id is required"))?;
        let products_to_gather = self.products_to_gather()?;

        let strategy = self
            .strategy
            .as_deref()
            .ok_or_else(|| invalid("strategy is required"))?
            .parse::<TraversalStrategy>()
            .map_err(ValidationError::Invalid)?;

        let pages_skip = if self.use_pages_skip {
            match self.pages_skip {
                Some(n) if n >= 1 => Some(bounded(n, "pages-skip")?),
                _ => return Err(invalid("pages-skip must be >= 1 when use-pages-skip is set")),
            }
        } else {
            None
        };

        let min_rank = self.min_rank.unwrap_or(1);
        if min_rank < 1 {
            return Err(invalid(format!("min-rank must be >= 1, got {}", min_rank)));
        }
        let min_rank: u32 = bounded(min_rank, "min-rank")?;
        let max_rank = self.max_rank.unwrap_or(i64::from(u32::MAX));
        if max_rank < i64::from(min_rank) || max_rank > i64::from(u32::MAX) {
            return Err(invalid(format!(
                "max-rank must be between min-rank and {}, got {}",
                u32::MAX,
                max_rank
            )));
        }
        let max_rank: u32 = bounded(max_rank, "max-rank")?;

        self.require_main_category(store, main_category_id)?;

        Ok(ScanTarget::Category(CategoryTarget {
            main_category_id,
            products_to_gather,
            min_rank,
            max_rank,
            strategy,
            pages_skip,
        }))
    }

    fn validate_deals(&self, store: &SharedStore) -> Result<ScanTarget, ValidationError> {
        let products_to_gather = self.products_to_gather()?;

        let main_category_node_id = match self.main_category_id {
            Some(id) => Some(self.require_main_category(store, id)?),
            None => None,
        };

        Ok(ScanTarget::Deals(DealsTarget {
            main_category_id: self.main_category_id,
            main_category_node_id,
            products_to_gather,
        }))
    }

    /// Returns the browse node id of a main category of the request's domain
    fn require_main_category(
        &self,
        store: &SharedStore,
        category_id: i64,
    ) -> Result<String, ValidationError> {
        let node = match lock(store).get_category(category_id) {
            Ok(node) => node,
            Err(StorageError::CategoryNotFound(_)) => {
                return Err(ValidationError::NotFound(format!(
                    "Category {} not found",
                    category_id
                )))
            }
            Err(e) => return Err(e.into()),
        };

        if !node.is_main || node.domain != self.domain {
            return Err(ValidationError::NotFound(format!(
                "Main category {} not found for domain '{}'",
                category_id, self.domain
            )));
        }

        Ok(node.node_id)
    }
}
