//! Storage module for persisting scans, category trees and products
//!
//! This module handles all database operations for the service, including:
//! - SQLite database initialization and schema management
//! - Scan records, their lifecycle state and counters
//! - Per-scan result sets (category pages and linked products)
//! - Category trees imported per marketplace domain
//! - Products keyed by (ASIN, domain) with an append-only change history

mod import;
mod product;
mod schema;
mod sqlite;
mod traits;

pub use import::{import_tree, load_tree_file, TreeFile, TreeNode};
pub use product::{FieldChange, ProductData};
pub use sqlite::SqliteStorage;
pub use traits::{Store, StorageError, StorageResult};

use crate::scan::{ScanConfig, ScanKind};
use crate::state::{DiscoveryState, ScanState, SubjectStatus};
use crate::HarvestError;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A store shared between the manager and the active scan
///
/// Locks are held only for the duration of a synchronous store call, never
/// across an `.await`.
pub type SharedStore = Arc<Mutex<dyn Store + Send>>;

/// Wraps a store for sharing
pub fn shared<S: Store + Send + 'static>(store: S) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Locks a shared store, recovering the guard if a previous holder panicked
pub fn lock(store: &SharedStore) -> MutexGuard<'_, dyn Store + Send + 'static> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Initializes or opens a storage database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteStorage)` - Successfully initialized storage
/// * `Err(HarvestError)` - Failed to initialize storage
pub fn open_storage(path: &Path) -> Result<SqliteStorage, HarvestError> {
    SqliteStorage::new(path)
}

/// Current UTC time as a fixed-width RFC 3339 string
///
/// Fixed width keeps lexical order equal to time order in SQL `ORDER BY`.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Sent and succeeded request counts for one page type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCounter {
    pub sent: u32,
    pub succeeded: u32,
}

/// Running counters of a scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCounters {
    pub sent_requests: u32,
    pub products_gathered: u32,
    pub category_pages: PageCounter,
    pub product_pages: PageCounter,
}

/// Represents a scan in the database
#[derive(Debug, Clone)]
pub struct ScanRecord {
    pub id: i64,
    pub state: ScanState,
    pub config: ScanConfig,
    pub counters: ScanCounters,
    pub config_hash: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl ScanRecord {
    pub fn kind(&self) -> ScanKind {
        self.config.kind()
    }
}

/// A node of a persisted category tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryNode {
    pub id: i64,
    pub domain: String,
    pub name: String,

    /// Marketplace browse node identifier
    pub node_id: String,

    /// Child ids in stored order
    pub children: Vec<i64>,

    pub is_main: bool,

    /// Only main nodes carry a discovery state
    pub discovery: Option<DiscoveryState>,
}

/// One fetched (or abandoned) category listing page of a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPageRecord {
    pub name: String,
    pub node_id: String,
    pub page: u32,
    pub status: SubjectStatus,
    pub asins: Vec<String>,
    pub proxy_country: Option<String>,
    pub sent_requests: u32,
    pub requested_at: String,
    pub received_at: String,
}

/// A single terminal observation of a product by a scan
#[derive(Debug, Clone)]
pub struct ProductObservation {
    pub asin: String,
    pub domain: String,
    pub scan_id: i64,
    pub status: SubjectStatus,

    /// Extracted attributes, only for `recorded` observations
    pub data: Option<ProductData>,

    /// Attempts spent on this observation, retries included
    pub sent_requests: u32,
    pub requested_at: String,
    pub received_at: String,
}

/// Result of persisting an observation
#[derive(Debug, Clone)]
pub struct ObservationOutcome {
    pub product_id: i64,
    pub created: bool,
    pub changed_fields: Vec<FieldChange>,
}

/// One entry of a product's change history
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub scan_id: i64,
    pub status: SubjectStatus,
    pub sent_requests: u32,
    pub requested_at: String,
    pub received_at: String,
    pub changed_fields: Vec<FieldChange>,
}

/// Represents a product in the database
#[derive(Debug, Clone)]
pub struct ProductRecord {
    pub id: i64,
    pub asin: String,
    pub domain: String,
    pub status: SubjectStatus,

    /// Scan that produced the latest observation
    pub scan_id: i64,
    pub data: ProductData,
    pub history: Vec<HistoryEntry>,
}

/// A product linked to a scan's result set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanProductLink {
    pub asin: String,
    pub status: SubjectStatus,

    /// Rank as observed by this scan
    pub rank: Option<u32>,
}
