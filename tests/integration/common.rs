//! Shared fixtures for the integration tests
//!
//! Documents served by [`ScriptedFetcher`] are JSON, and [`JsonExtractor`]
//! parses them straight into the extractor's output types, so a test states
//! exactly what each fetch "finds".

use asin_harvest::extract::{DealItem, ListingPage, PageExtractor};
use asin_harvest::fetcher::{DealsSource, FetchError, Marketplace, PageFetcher};
use asin_harvest::scan::{ScanDetails, ScanManager, ScanRequest, ScanSettings, ScanSnapshot};
use asin_harvest::state::ScanState;
use asin_harvest::storage::{
    import_tree, lock, shared, ProductData, SharedStore, SqliteStorage, TreeFile,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub const DOMAIN: &str = "com";

/// One scripted response
#[derive(Debug, Clone)]
pub enum Reply {
    Body(String),
    Status(u16),
}

impl Reply {
    pub fn product(rank: u32) -> Self {
        Reply::Body(format!(r#"{{"title": "Item ranked {0}", "rank": {0}}}"#, rank))
    }

    pub fn listing(asins: &[&str], is_last_page: bool) -> Self {
        Reply::Body(
            serde_json::json!({ "asins": asins, "is_last_page": is_last_page }).to_string(),
        )
    }
}

/// A fetcher that replays per-URL scripts
///
/// Each URL pops its script front to back; once a script is exhausted (or
/// when there is none) the fallback reply is served. A gated URL holds its
/// reply until the test adds a permit to the gate.
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    fallback: Reply,
    calls: Mutex<Vec<String>>,
    hint: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new(fallback: Reply) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
            hint: AtomicUsize::new(0),
        }
    }

    pub fn gate(self, url: impl Into<String>, gate: Arc<Semaphore>) -> Self {
        self.gates.lock().unwrap().insert(url.into(), gate);
        self
    }

    /// Provider concurrency hint; 0 means none
    pub fn set_hint(&self, hint: usize) {
        self.hint.store(hint, Ordering::Relaxed);
    }

    pub fn script(self, url: impl Into<String>, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.into(), replies.into_iter().collect());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        let reply = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|script| script.pop_front())
            .unwrap_or_else(|| self.fallback.clone());

        let gate = self.gates.lock().unwrap().get(url).cloned();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }

        // Give other workers a chance to interleave
        tokio::task::yield_now().await;

        match reply {
            Reply::Body(body) => Ok(body),
            Reply::Status(status) => Err(FetchError::from_status(status, url)),
        }
    }

    fn concurrency_hint(&self) -> Option<usize> {
        match self.hint.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        }
    }
}

/// Parses JSON documents into extractor output
pub struct JsonExtractor;

impl PageExtractor for JsonExtractor {
    fn product(&self, document: &str) -> ProductData {
        serde_json::from_str(document).unwrap_or_default()
    }

    fn listing(&self, document: &str) -> ListingPage {
        serde_json::from_str(document).unwrap_or_default()
    }

    fn deals(&self, document: &str) -> Vec<DealItem> {
        serde_json::from_str(document).unwrap_or_default()
    }
}

/// Deals batches by page number; missing pages are empty
///
/// A page can fail with scripted statuses before serving its batch.
#[derive(Default)]
pub struct ScriptedDeals {
    pages: HashMap<u32, Vec<DealItem>>,
    failures: Mutex<HashMap<u32, VecDeque<u16>>>,
    requested: Mutex<Vec<u32>>,
}

impl ScriptedDeals {
    pub fn fail(self, page: u32, status: u16, times: usize) -> Self {
        self.failures
            .lock()
            .unwrap()
            .entry(page)
            .or_default()
            .extend(std::iter::repeat(status).take(times));
        self
    }

    /// Pages requested so far, in order
    pub fn requested(&self) -> Vec<u32> {
        self.requested.lock().unwrap().clone()
    }

    pub fn page(mut self, page: u32, asins: &[(&str, Option<&str>)]) -> Self {
        let items = asins
            .iter()
            .map(|(asin, discount)| DealItem {
                asin: asin.to_string(),
                discount: discount.map(str::to_string),
            })
            .collect();
        self.pages.insert(page, items);
        self
    }
}

#[async_trait]
impl DealsSource for ScriptedDeals {
    async fn next_batch(
        &self,
        _domain: &str,
        _category_node: Option<&str>,
        page: u32,
    ) -> Result<Vec<DealItem>, FetchError> {
        self.requested.lock().unwrap().push(page);
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&page)
            .and_then(|statuses| statuses.pop_front());

        tokio::task::yield_now().await;
        if let Some(status) = failure {
            return Err(FetchError::from_status(status, &format!("deals page {}", page)));
        }
        Ok(self.pages.get(&page).cloned().unwrap_or_default())
    }
}

/// A manager wired to scripted collaborators and an in-memory store
pub struct Harness {
    pub manager: ScanManager,
    pub store: SharedStore,
    pub fetcher: Arc<ScriptedFetcher>,
    pub deals: Arc<ScriptedDeals>,
}

impl Harness {
    pub fn new(fetcher: ScriptedFetcher) -> Self {
        Self::with_deals(fetcher, ScriptedDeals::default())
    }

    pub fn with_deals(fetcher: ScriptedFetcher, deals: ScriptedDeals) -> Self {
        let store = shared(SqliteStorage::new_in_memory().unwrap());
        let fetcher = Arc::new(fetcher);
        let deals = Arc::new(deals);
        let settings = ScanSettings {
            allowed_domains: vec![DOMAIN.to_string()],
            listing_page_yield: 24,
            deals_max_empty_batches: 3,
            config_hash: Some("test".to_string()),
        };

        let manager = ScanManager::new(
            store.clone(),
            fetcher.clone(),
            Arc::new(JsonExtractor),
            deals.clone(),
            Marketplace::default(),
            settings,
        );

        Self {
            manager,
            store,
            fetcher,
            deals,
        }
    }

    /// Imports a tree and returns the main category ids
    pub fn import(&self, tree: &str) -> Vec<i64> {
        let tree: TreeFile = toml::from_str(tree).unwrap();
        import_tree(&mut *lock(&self.store), &tree).unwrap()
    }

    pub async fn enqueue(&self, request: &str) -> i64 {
        let request = ScanRequest::from_toml(request).unwrap();
        self.manager.enqueue_scan(request).await.unwrap()
    }

    pub fn state_of(&self, scan_id: i64) -> ScanState {
        self.manager.scan_details(scan_id).unwrap().state()
    }

    /// Polls until the scan reaches `state`
    pub async fn wait_for_state(&self, scan_id: i64, state: ScanState) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while self.state_of(scan_id) != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(
            waited.is_ok(),
            "scan {} never reached {}, stuck at {}",
            scan_id,
            state,
            self.state_of(scan_id)
        );
    }

    /// Polls the live snapshot until `check` holds
    pub async fn wait_for_live(&self, scan_id: i64, check: impl Fn(&ScanSnapshot) -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(ScanDetails::Live(snapshot)) = self.manager.scan_details(scan_id) {
                    if check(&snapshot) {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "scan {} never reached the expected snapshot", scan_id);
    }

    pub fn live(&self, scan_id: i64) -> ScanSnapshot {
        match self.manager.scan_details(scan_id).unwrap() {
            ScanDetails::Live(snapshot) => snapshot,
            ScanDetails::Stored(stored) => panic!("scan {} is not live: {:?}", scan_id, stored.record),
        }
    }

    pub async fn wait_idle(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.manager.wait_idle())
            .await
            .expect("scan queue did not drain");
    }

    /// Store projection of a scan that is no longer active
    pub fn stored(&self, scan_id: i64) -> asin_harvest::scan::StoredScan {
        match self.manager.scan_details(scan_id).unwrap() {
            ScanDetails::Stored(stored) => stored,
            ScanDetails::Live(snapshot) => panic!("scan {} is still live: {:?}", scan_id, snapshot),
        }
    }
}

pub fn product_url(asin: &str) -> String {
    Marketplace::default().product_page(DOMAIN, asin)
}

pub fn category_url(node_id: &str, page: u32) -> String {
    Marketplace::default().category_page(DOMAIN, node_id, page)
}
