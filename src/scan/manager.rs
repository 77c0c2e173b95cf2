//! Single-active-scan sequencer
//!
//! The manager holds at most one in-memory scan. Requests submitted while a
//! scan is active are persisted as `enqueued` and started in creation order
//! as earlier scans complete.

use crate::config::Config;
use crate::extract::PageExtractor;
use crate::fetcher::{DealsSource, Marketplace, PageFetcher};
use crate::scan::asin::AsinScan;
use crate::scan::category::CategoryScan;
use crate::scan::deals::DealsScan;
use crate::scan::runner::{Scan, ScanEnv, ScanHandle, ScanSnapshot};
use crate::scan::traversal::plan_work_list;
use crate::scan::{ScanKind, ScanRequest, ScanTarget, ValidationContext, ValidationError};
use crate::state::ScanState;
use crate::storage::{
    lock, CategoryPageRecord, ScanProductLink, ScanRecord, SharedStore, StorageError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{oneshot, watch};

/// Scans per page of `list_scans`
pub const SCANS_PER_PAGE: usize = 5;

/// Errors surfaced by the orchestration API
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Invalid scan configuration: {0}")]
    InvalidConfig(#[from] ValidationError),

    #[error("Another scan is being created")]
    Busy,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestrationError {
    /// HTTP-style status code for transport adapters
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidConfig(e) => e.status_code(),
            Self::Busy => 400,
            Self::NotFound(_) => 404,
            Self::InvalidState(_) => 400,
            Self::Storage(_) | Self::Internal(_) => 500,
        }
    }
}

impl From<StorageError> for OrchestrationError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ScanNotFound(id) => Self::NotFound(format!("Scan {} not found", id)),
            other => Self::Storage(other),
        }
    }
}

/// Service-wide settings every scan is built with
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub allowed_domains: Vec<String>,
    pub listing_page_yield: usize,
    pub deals_max_empty_batches: u32,

    /// Hash of the service configuration, stamped on every scan
    pub config_hash: Option<String>,
}

impl ScanSettings {
    pub fn from_config(config: &Config, config_hash: Option<String>) -> Self {
        Self {
            allowed_domains: config.service.allowed_domains.clone(),
            listing_page_yield: config.scheduler.listing_page_yield,
            deals_max_empty_batches: config.scheduler.deals_max_empty_batches,
            config_hash,
        }
    }
}

/// A scan as reported by `scan_details`
#[derive(Debug, Clone)]
pub enum ScanDetails {
    /// The active scan's in-memory state
    Live(ScanSnapshot),

    /// A projection computed from the store
    Stored(StoredScan),
}

impl ScanDetails {
    pub fn state(&self) -> ScanState {
        match self {
            Self::Live(snapshot) => snapshot.state,
            Self::Stored(stored) => stored.record.state,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredScan {
    pub record: ScanRecord,

    /// Recomputed from the linked products
    pub products_gathered: u32,
    pub products: Vec<ScanProductLink>,
    pub categories: Vec<CategoryPageRecord>,
}

/// One row of `list_scans`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub id: i64,
    pub kind: ScanKind,
    pub state: ScanState,
    pub domain: String,
    pub sent_requests: u32,
    pub products_gathered: u32,
    pub products_to_gather: u32,
    pub created_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScanPage {
    /// 1-based
    pub page: usize,
    pub total_pages: usize,
    pub scans: Vec<ScanSummary>,
}

/// Releases the creation flag when dropped
struct CreationGuard<'a>(&'a AtomicBool);

impl<'a> CreationGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct ManagerInner {
    store: SharedStore,
    fetcher: Arc<dyn PageFetcher>,
    extractor: Arc<dyn PageExtractor>,
    deals: Arc<dyn DealsSource>,
    marketplace: Marketplace,
    settings: ScanSettings,
    creating: AtomicBool,
    active: Mutex<Option<Arc<dyn ScanHandle>>>,

    /// Id of the active scan, for `wait_idle`
    active_id: watch::Sender<Option<i64>>,
}

/// Process-wide scan sequencer; cheap to clone
#[derive(Clone)]
pub struct ScanManager {
    inner: Arc<ManagerInner>,
}

type Slot<'a> = MutexGuard<'a, Option<Arc<dyn ScanHandle>>>;

impl ScanManager {
    pub fn new(
        store: SharedStore,
        fetcher: Arc<dyn PageFetcher>,
        extractor: Arc<dyn PageExtractor>,
        deals: Arc<dyn DealsSource>,
        marketplace: Marketplace,
        settings: ScanSettings,
    ) -> Self {
        let (active_id, _) = watch::channel(None);
        Self {
            inner: Arc::new(ManagerInner {
                store,
                fetcher,
                extractor,
                deals,
                marketplace,
                settings,
                creating: AtomicBool::new(false),
                active: Mutex::new(None),
                active_id,
            }),
        }
    }

    fn slot(&self) -> Slot<'_> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> Option<Arc<dyn ScanHandle>> {
        self.slot().clone()
    }

    pub fn active_scan_id(&self) -> Option<i64> {
        self.active().map(|scan| scan.id())
    }

    /// Validates a request and either starts it or queues it
    ///
    /// When no scan is active the new scan is `active` by the time this
    /// returns. Fails with `Busy` while another request is still being
    /// validated.
    ///
    /// # Returns
    ///
    /// The id of the created scan
    pub async fn enqueue_scan(&self, request: ScanRequest) -> Result<i64, OrchestrationError> {
        let _guard =
            CreationGuard::acquire(&self.inner.creating).ok_or(OrchestrationError::Busy)?;

        let context = ValidationContext {
            allowed_domains: self.inner.settings.allowed_domains.clone(),
            has_concurrency_hint: self.inner.fetcher.concurrency_hint().is_some(),
        };
        let store = Arc::clone(&self.inner.store);
        let config = tokio::task::spawn_blocking(move || request.validate(&context, &store))
            .await
            .map_err(|e| OrchestrationError::Internal(e.to_string()))??;

        let hash = self.inner.settings.config_hash.as_deref();
        let mut slot = self.slot();
        let id = lock(&self.inner.store).create_scan(&config, ScanState::Enqueued, hash)?;

        if slot.is_some() {
            tracing::info!("Scan {} ({}) enqueued", id, config.kind());
            return Ok(id);
        }

        let record = lock(&self.inner.store).get_scan(id)?;
        match self.launch(&record) {
            Ok(handle) => {
                *slot = Some(handle);
                self.inner.active_id.send_replace(Some(id));
                Ok(id)
            }
            Err(e) => {
                self.abandon(id, &e);
                Err(e)
            }
        }
    }

    /// Builds, starts and watches a scan
    fn launch(&self, record: &ScanRecord) -> Result<Arc<dyn ScanHandle>, OrchestrationError> {
        let env = ScanEnv {
            fetcher: Arc::clone(&self.inner.fetcher),
            extractor: Arc::clone(&self.inner.extractor),
            store: Arc::clone(&self.inner.store),
            marketplace: self.inner.marketplace.clone(),
        };
        let settings = &self.inner.settings;

        let (handle, done): (Arc<dyn ScanHandle>, oneshot::Receiver<i64>) =
            match &record.config.target {
                ScanTarget::Asin { asins } => {
                    let (scan, done) = Scan::new(record, AsinScan::new(asins), env);
                    (scan as Arc<dyn ScanHandle>, done)
                }
                ScanTarget::Category(target) => {
                    let cursors = {
                        let store = lock(&self.inner.store);
                        plan_work_list(&*store, target.main_category_id, target.strategy)?
                    };
                    let variant =
                        CategoryScan::new(target.clone(), cursors, settings.listing_page_yield);
                    let (scan, done) = Scan::new(record, variant, env);
                    (scan as Arc<dyn ScanHandle>, done)
                }
                ScanTarget::Deals(target) => {
                    let variant = DealsScan::new(
                        target.clone(),
                        Arc::clone(&self.inner.deals),
                        settings.deals_max_empty_batches,
                    );
                    let (scan, done) = Scan::new(record, variant, env);
                    (scan as Arc<dyn ScanHandle>, done)
                }
            };

        Arc::clone(&handle).start()?;
        tracing::info!("Scan {} ({}) started", record.id, record.kind());

        let manager = self.clone();
        tokio::spawn(async move {
            if let Ok(id) = done.await {
                manager.on_scan_completed(id);
            }
        });

        Ok(handle)
    }

    /// Marks a scan that could not be launched as completed
    fn abandon(&self, scan_id: i64, err: &OrchestrationError) {
        tracing::error!("Scan {} could not be started: {}", scan_id, err);
        if let Err(e) = lock(&self.inner.store).update_scan_state(scan_id, ScanState::Completed) {
            tracing::error!("Scan {}: failed to mark as completed: {}", scan_id, e);
        }
    }

    /// Clears the slot and starts the oldest enqueued scan
    fn on_scan_completed(&self, scan_id: i64) {
        tracing::info!("Scan {} completed", scan_id);

        let mut slot = self.slot();
        if slot.as_ref().map(|scan| scan.id()) == Some(scan_id) {
            *slot = None;
        }
        if slot.is_none() {
            let next = self.start_next(&mut slot);
            self.inner.active_id.send_replace(next);
        }
    }

    fn start_next(&self, slot: &mut Slot<'_>) -> Option<i64> {
        loop {
            let record = match lock(&self.inner.store).oldest_enqueued_scan() {
                Ok(Some(record)) => record,
                Ok(None) => {
                    tracing::info!("No enqueued scans, going idle");
                    return None;
                }
                Err(e) => {
                    tracing::error!("Failed to load the next enqueued scan: {}", e);
                    return None;
                }
            };

            match self.launch(&record) {
                Ok(handle) => {
                    **slot = Some(handle);
                    return Some(record.id);
                }
                Err(e) => self.abandon(record.id, &e),
            }
        }
    }

    /// Resumes the active scan if it is stalled
    pub fn resume_active_scan(&self) -> Result<(), OrchestrationError> {
        let scan = self
            .active()
            .ok_or_else(|| OrchestrationError::NotFound("No active scan".to_string()))?;

        let hint = self.inner.fetcher.concurrency_hint();
        scan.resume(hint)?;
        tracing::info!("Scan resumed");
        Ok(())
    }

    /// Halts the active scan
    ///
    /// An active scan drains to `completed`; a stalled one completes at once.
    pub fn halt_active_scan(&self) -> Result<(), OrchestrationError> {
        let scan = self
            .active()
            .ok_or_else(|| OrchestrationError::NotFound("No active scan".to_string()))?;
        scan.halt()
    }

    /// Deletes an enqueued or completed scan
    pub fn delete_scan(&self, scan_id: i64) -> Result<(), OrchestrationError> {
        if self.active_scan_id() == Some(scan_id) {
            return Err(OrchestrationError::InvalidState(format!(
                "Scan {} is active",
                scan_id
            )));
        }

        let mut store = lock(&self.inner.store);
        let record = store.get_scan(scan_id)?;
        if !matches!(record.state, ScanState::Enqueued | ScanState::Completed) {
            return Err(OrchestrationError::InvalidState(format!(
                "Scan {} is {}, only enqueued or completed scans can be deleted",
                scan_id, record.state
            )));
        }

        store.delete_scan(scan_id)?;
        tracing::info!("Scan {} deleted", scan_id);
        Ok(())
    }

    /// Live snapshot for the active scan, store projection otherwise
    pub fn scan_details(&self, scan_id: i64) -> Result<ScanDetails, OrchestrationError> {
        if let Some(scan) = self.active().filter(|scan| scan.id() == scan_id) {
            return Ok(ScanDetails::Live(scan.snapshot()));
        }

        let store = lock(&self.inner.store);
        let record = store.get_scan(scan_id)?;
        let products = store.scan_products(scan_id)?;
        let categories = store.scan_categories(scan_id)?;

        Ok(ScanDetails::Stored(StoredScan {
            products_gathered: record.config.target.count_gathered(&products),
            record,
            products,
            categories,
        }))
    }

    /// Lists scans newest first, `SCANS_PER_PAGE` per page
    ///
    /// Pages are 1-based; page 0 is treated as page 1.
    pub fn list_scans(&self, page: usize) -> Result<ScanPage, OrchestrationError> {
        let page = page.max(1);
        let live = self.active().map(|scan| scan.snapshot());

        let (total, records) = {
            let store = lock(&self.inner.store);
            let total = store.count_scans()? as usize;
            let records = store.list_scans((page - 1) * SCANS_PER_PAGE, SCANS_PER_PAGE)?;
            (total, records)
        };

        let scans = records
            .into_iter()
            .map(|record| {
                let mut summary = ScanSummary {
                    id: record.id,
                    kind: record.kind(),
                    state: record.state,
                    domain: record.config.domain.clone(),
                    sent_requests: record.counters.sent_requests,
                    products_gathered: record.counters.products_gathered,
                    products_to_gather: record.config.target.products_to_gather(),
                    created_at: record.created_at.clone(),
                    completed_at: record.completed_at.clone(),
                };
                if let Some(snapshot) = live.as_ref().filter(|s| s.id == record.id) {
                    summary.state = snapshot.state;
                    summary.sent_requests = snapshot.counters.sent_requests;
                    summary.products_gathered = snapshot.counters.products_gathered;
                }
                summary
            })
            .collect();

        Ok(ScanPage {
            page,
            total_pages: total.div_ceil(SCANS_PER_PAGE),
            scans,
        })
    }

    /// Cleans up after a previous process and starts queued work
    ///
    /// Scans left mid-flight lost their in-memory backlog, so they are
    /// marked completed with the counters they last persisted.
    pub fn recover(&self) -> Result<Option<i64>, OrchestrationError> {
        let stale = lock(&self.inner.store).scans_in_states(&[
            ScanState::Active,
            ScanState::Stalling,
            ScanState::Stalled,
            ScanState::Halting,
        ])?;

        for record in stale {
            if self.active_scan_id() == Some(record.id) {
                continue;
            }
            tracing::warn!(
                "Scan {} was left {} by a previous run, marking completed",
                record.id,
                record.state
            );
            lock(&self.inner.store).update_scan_state(record.id, ScanState::Completed)?;
        }

        let mut slot = self.slot();
        if slot.is_some() {
            return Ok(slot.as_ref().map(|scan| scan.id()));
        }
        let next = self.start_next(&mut slot);
        self.inner.active_id.send_replace(next);
        Ok(next)
    }

    /// Waits until no scan is active and the queue is empty
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.active_id.subscribe();
        let _ = rx.wait_for(|active| active.is_none()).await;
    }
}
