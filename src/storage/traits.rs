//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::scan::{Budget, ScanConfig};
use crate::state::{DiscoveryState, ScanState};
use crate::storage::{
    CategoryNode, CategoryPageRecord, ObservationOutcome, ProductObservation, ProductRecord,
    ScanCounters, ScanProductLink, ScanRecord,
};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Scan not found: {0}")]
    ScanNotFound(i64),

    #[error("Category not found: {0}")]
    CategoryNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// This trait defines all database operations needed by the scan manager
/// and the active scan. Implementations are shared behind a mutex (see
/// [`crate::storage::SharedStore`]) and are called synchronously.
pub trait Store {
    // ===== Scan Management =====

    /// Creates a new scan record
    ///
    /// # Arguments
    ///
    /// * `config` - The validated scan configuration
    /// * `state` - Initial lifecycle state
    /// * `config_hash` - Hash of the service configuration the scan runs under
    ///
    /// # Returns
    ///
    /// The ID of the newly created scan
    fn create_scan(
        &mut self,
        config: &ScanConfig,
        state: ScanState,
        config_hash: Option<&str>,
    ) -> StorageResult<i64>;

    /// Gets a scan by ID
    fn get_scan(&self, scan_id: i64) -> StorageResult<ScanRecord>;

    /// Updates the lifecycle state of a scan
    ///
    /// Entering `active` for the first time stamps `started_at`; entering
    /// `completed` stamps `completed_at`.
    fn update_scan_state(&mut self, scan_id: i64, state: ScanState) -> StorageResult<()>;

    /// Persists the running counters and the (possibly throttled) budget
    fn save_scan_progress(
        &mut self,
        scan_id: i64,
        counters: &ScanCounters,
        budget: &Budget,
    ) -> StorageResult<()>;

    /// Deletes a scan and its result sets
    fn delete_scan(&mut self, scan_id: i64) -> StorageResult<()>;

    /// Gets the enqueued scan with the oldest creation time
    fn oldest_enqueued_scan(&self) -> StorageResult<Option<ScanRecord>>;

    /// Lists scans, most recent first
    fn list_scans(&self, offset: usize, limit: usize) -> StorageResult<Vec<ScanRecord>>;

    /// Counts all scans
    fn count_scans(&self) -> StorageResult<u64>;

    /// Gets every scan currently in one of the given states
    fn scans_in_states(&self, states: &[ScanState]) -> StorageResult<Vec<ScanRecord>>;

    // ===== Scan Result Sets =====

    /// Appends a category page entry to a scan's result set
    fn append_scan_category(&mut self, scan_id: i64, entry: &CategoryPageRecord)
        -> StorageResult<()>;

    /// Gets the category page entries of a scan in insertion order
    fn scan_categories(&self, scan_id: i64) -> StorageResult<Vec<CategoryPageRecord>>;

    /// Gets the products linked to a scan
    fn scan_products(&self, scan_id: i64) -> StorageResult<Vec<ScanProductLink>>;

    // ===== Category Trees =====

    /// Inserts a category or gets the existing one with the same node id
    fn insert_or_get_category(
        &mut self,
        domain: &str,
        name: &str,
        node_id: &str,
        is_main: bool,
    ) -> StorageResult<i64>;

    /// Appends `child_id` to the ordered children of `parent_id`
    fn link_child(&mut self, parent_id: i64, child_id: i64) -> StorageResult<()>;

    /// Gets a category with its ordered child references
    fn get_category(&self, category_id: i64) -> StorageResult<CategoryNode>;

    /// Sets the discovery state of a main category
    fn set_discovery_state(&mut self, category_id: i64, state: DiscoveryState)
        -> StorageResult<()>;

    // ===== Products =====

    /// Upserts a product by (ASIN, domain) and appends a history entry
    ///
    /// The product is linked to the observing scan's result set in the same
    /// transaction.
    fn record_observation(
        &mut self,
        observation: &ProductObservation,
    ) -> StorageResult<ObservationOutcome>;

    /// Gets a product with its full history
    fn get_product(&self, asin: &str, domain: &str) -> StorageResult<Option<ProductRecord>>;
}
