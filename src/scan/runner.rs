//! Generic scan driver
//!
//! A [`Scan`] owns everything mutable about one running scan behind a single
//! mutex that is never held across an `.await`. A pool of workers pops tasks
//! from the [`TaskChannel`], fetches, and hands results to the variant. After
//! every task start and finish the scheduling step refills the channel
//! through an [`Admission`], which enforces the concurrency and request
//! budgets.
//!
//! The driver resolves once every worker (and the variant's companion loop,
//! if any) has returned, then applies the terminal transition. Nothing is in
//! flight at that point.

use crate::extract::{ListingPage, PageExtractor};
use crate::fetcher::{Marketplace, PageFetcher};
use crate::scan::base::ScanCore;
use crate::scan::policy::{classify, Disposition};
use crate::scan::task::{CategoryTask, ProductTask, Task, TaskChannel, TaskKind};
use crate::scan::{Budget, OrchestrationError, ScanKind};
use crate::state::{ScanState, SubjectStatus};
use crate::storage::{
    lock, timestamp, CategoryPageRecord, ObservationOutcome, ProductData, ProductObservation,
    ScanCounters, ScanRecord, SharedStore,
};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

/// A loop that runs next to the workers for the length of one pass
pub type Companion = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Collaborators a scan fetches, extracts and persists through
#[derive(Clone)]
pub struct ScanEnv {
    pub fetcher: Arc<dyn PageFetcher>,
    pub extractor: Arc<dyn PageExtractor>,
    pub store: SharedStore,
    pub marketplace: Marketplace,
}

/// A fetched document after extraction
#[derive(Debug, Clone)]
pub enum FetchedPage {
    Product(ProductData),
    Listing(ListingPage),
}

/// Task production and outcome handling of one scan variant
pub trait ScanVariant: Send + Sized + 'static {
    /// Pushes new tasks while the admission allows
    fn produce_tasks(&mut self, admission: &mut Admission<'_>);

    fn handle_success(&mut self, ctx: &mut ScanCtx<'_>, task: Task, page: FetchedPage);

    /// Settles a subject after a retry, absent or failed disposition
    fn handle_error(&mut self, ctx: &mut ScanCtx<'_>, task: Task, disposition: Disposition);

    /// True once the variant will never produce another task
    fn is_exhausted(&self) -> bool;

    /// Subjects known but not yet scheduled
    fn backlog_len(&self) -> usize;

    fn companion(_scan: &Arc<Scan<Self>>) -> Option<Companion> {
        None
    }
}

/// Admission control for one scheduling step
pub struct Admission<'a> {
    core: &'a ScanCore,
    channel: &'a TaskChannel,
    scheduled_products: usize,
    scheduled_categories: usize,
}

impl<'a> Admission<'a> {
    fn new(core: &'a ScanCore, channel: &'a TaskChannel) -> Self {
        Self {
            core,
            channel,
            scheduled_products: channel.count(TaskKind::Product),
            scheduled_categories: channel.count(TaskKind::Category),
        }
    }

    pub fn core(&self) -> &ScanCore {
        self.core
    }

    /// Tasks of `kind` pushed but not yet started by a worker
    pub fn scheduled(&self, kind: TaskKind) -> usize {
        match kind {
            TaskKind::Product => self.scheduled_products,
            TaskKind::Category => self.scheduled_categories,
        }
    }

    fn scheduled_total(&self) -> usize {
        self.scheduled_products + self.scheduled_categories
    }

    /// True iff the scan is active, the request budget covers one more
    /// fetch and a concurrency slot is free
    pub fn can_send(&self) -> bool {
        let scheduled = self.scheduled_total();
        self.core.state() == ScanState::Active
            && self.core.counters.sent_requests as usize + scheduled
                < self.core.budget.max_requests as usize
            && self.core.in_flight() + scheduled < self.core.budget.max_concurrent_requests
    }

    pub fn push(&mut self, task: Task) {
        match task.kind() {
            TaskKind::Product => self.scheduled_products += 1,
            TaskKind::Category => self.scheduled_categories += 1,
        }
        self.channel.push(task);
    }
}

/// What a variant handler may touch while settling a task
pub struct ScanCtx<'a> {
    pub core: &'a mut ScanCore,
    store: &'a SharedStore,
    requested_at: String,
    received_at: String,
}

impl<'a> ScanCtx<'a> {
    /// Persists a terminal product observation and links it to the scan
    ///
    /// Returns `None` if the store rejected the write; the failure is logged
    /// and the scan carries on.
    pub fn record_product(
        &mut self,
        task: &ProductTask,
        status: SubjectStatus,
        data: Option<ProductData>,
    ) -> Option<ObservationOutcome> {
        let data = data.map(|mut data| {
            if task.discount.is_some() {
                data.discount_coupon = task.discount.clone();
            }
            data
        });

        let observation = ProductObservation {
            asin: task.asin.clone(),
            domain: self.core.domain.clone(),
            scan_id: self.core.id,
            status,
            data,
            sent_requests: task.rerequests + 1,
            requested_at: self.requested_at.clone(),
            received_at: self.received_at.clone(),
        };

        match lock(self.store).record_observation(&observation) {
            Ok(outcome) => {
                tracing::debug!(
                    "Scan {}: {} {} ({} fields changed)",
                    self.core.id,
                    status,
                    task.asin,
                    outcome.changed_fields.len()
                );
                Some(outcome)
            }
            Err(e) => {
                tracing::error!(
                    "Scan {}: failed to record product {}: {}",
                    self.core.id,
                    task.asin,
                    e
                );
                None
            }
        }
    }

    /// Appends a category page entry to the scan's result set
    pub fn record_category_page(
        &mut self,
        task: &CategoryTask,
        status: SubjectStatus,
        listing: Option<&ListingPage>,
    ) -> bool {
        let entry = CategoryPageRecord {
            name: task.name.clone(),
            node_id: task.node_id.clone(),
            page: task.page,
            status,
            asins: listing.map(|l| l.asins.clone()).unwrap_or_default(),
            proxy_country: listing.and_then(|l| l.proxy_country.clone()),
            sent_requests: task.rerequests + 1,
            requested_at: self.requested_at.clone(),
            received_at: self.received_at.clone(),
        };

        match lock(self.store).append_scan_category(self.core.id, &entry) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    "Scan {}: failed to record page {} of category {}: {}",
                    self.core.id,
                    task.page,
                    task.node_id,
                    e
                );
                false
            }
        }
    }
}

/// Mutable state of a scan, guarded as one unit
pub struct ScanInner<V> {
    pub core: ScanCore,
    pub variant: V,

    /// Tasks pushed back by backpressure, served before anything new
    pub requeued: VecDeque<Task>,
}

/// Point-in-time view of a live scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSnapshot {
    pub id: i64,
    pub kind: ScanKind,
    pub state: ScanState,
    pub domain: String,
    pub budget: Budget,
    pub counters: ScanCounters,
    pub products_to_gather: u32,
    pub in_flight: usize,
    pub scheduled: usize,
    pub backlog: usize,
    pub requeued: usize,
    pub created_at: String,
    pub started_at: Option<String>,
}

/// Object-safe handle the manager keeps for the active scan
pub trait ScanHandle: Send + Sync {
    fn id(&self) -> i64;

    fn snapshot(&self) -> ScanSnapshot;

    /// Moves an enqueued scan to `active` and spawns its driver
    fn start(self: Arc<Self>) -> Result<(), OrchestrationError>;

    /// Moves a stalled scan back to `active` and spawns a new driver pass
    fn resume(self: Arc<Self>, concurrency_hint: Option<usize>)
        -> Result<(), OrchestrationError>;

    /// `active → halting` or `stalled → completed`
    fn halt(&self) -> Result<(), OrchestrationError>;
}

pub struct Scan<V: ScanVariant> {
    id: i64,
    inner: Mutex<ScanInner<V>>,
    channel: TaskChannel,
    env: ScanEnv,
    completion: Mutex<Option<oneshot::Sender<i64>>>,
}

impl<V: ScanVariant> Scan<V> {
    /// Builds a scan from its stored record
    ///
    /// The receiver resolves with the scan id once the scan completes.
    pub fn new(
        record: &ScanRecord,
        variant: V,
        env: ScanEnv,
    ) -> (Arc<Self>, oneshot::Receiver<i64>) {
        let (tx, rx) = oneshot::channel();
        let core = ScanCore::new(record, env.fetcher.concurrency_hint());

        let scan = Arc::new(Self {
            id: record.id,
            inner: Mutex::new(ScanInner {
                core,
                variant,
                requeued: VecDeque::new(),
            }),
            channel: TaskChannel::new(),
            env,
            completion: Mutex::new(Some(tx)),
        });
        (scan, rx)
    }

    fn lock(&self) -> MutexGuard<'_, ScanInner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads the scan state without running a scheduling step
    pub fn inspect<R>(&self, f: impl FnOnce(&ScanInner<V>) -> R) -> R {
        f(&self.lock())
    }

    /// Mutates the scan state, then applies side effects and reschedules
    pub fn update<R>(&self, f: impl FnOnce(&mut ScanInner<V>) -> R) -> R {
        let mut guard = self.lock();
        let result = f(&mut guard);
        self.settle(&mut guard);
        result
    }

    fn settle(&self, inner: &mut ScanInner<V>) {
        self.apply_effects(inner);
        self.schedule(inner);
        self.apply_effects(inner);
    }

    /// One scheduling step
    fn schedule(&self, inner: &mut ScanInner<V>) {
        let ScanInner {
            core,
            variant,
            requeued,
        } = inner;

        if core.state() != ScanState::Active {
            return;
        }
        if core.target_reached() || core.budget_spent() {
            core.transition(ScanState::Halting);
            return;
        }

        {
            let mut admission = Admission::new(core, &self.channel);
            while admission.can_send() {
                match requeued.pop_front() {
                    Some(task) => admission.push(task),
                    None => break,
                }
            }
            if requeued.is_empty() {
                variant.produce_tasks(&mut admission);
            }
        }

        let idle = core.in_flight() == 0 && self.channel.is_empty() && requeued.is_empty();
        if idle && variant.is_exhausted() {
            tracing::info!("Scan {}: nothing left to fetch", core.id);
            core.transition(ScanState::Halting);
        }
    }

    fn apply_effects(&self, inner: &mut ScanInner<V>) {
        for state in inner.core.take_applied() {
            if let Err(e) = lock(&self.env.store).update_scan_state(self.id, state) {
                tracing::error!("Scan {}: failed to persist state {}: {}", self.id, state, e);
            }

            match state {
                ScanState::Active => self.channel.reopen(),
                ScanState::Stalling | ScanState::Halting => self.channel.close(),
                ScanState::Stalled => self.save_progress(&inner.core),
                ScanState::Completed => {
                    self.channel.close();
                    self.save_progress(&inner.core);
                    let sender = self
                        .completion
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    if let Some(sender) = sender {
                        let _ = sender.send(self.id);
                    }
                }
                ScanState::Enqueued => {}
            }
        }
    }

    fn save_progress(&self, core: &ScanCore) {
        let result =
            lock(&self.env.store).save_scan_progress(self.id, &core.counters, &core.budget);
        if let Err(e) = result {
            tracing::error!("Scan {}: failed to save progress: {}", self.id, e);
        }
    }

    async fn worker(self: Arc<Self>) {
        while let Some(task) = self.channel.pop().await {
            let url = {
                let mut inner = self.lock();
                // Claim to in flight in one step under the scan lock
                self.channel.release(task.kind());
                if inner.core.state() != ScanState::Active {
                    inner.requeued.push_back(task);
                    break;
                }
                inner.core.begin_request(task.kind());
                let url = task.url(&self.env.marketplace, &inner.core.domain);
                self.settle(&mut inner);
                url
            };

            let requested_at = timestamp();
            let fetched = self.env.fetcher.fetch(&url).await;
            let received_at = timestamp();

            let outcome = fetched.map(|document| match task.kind() {
                TaskKind::Product => FetchedPage::Product(self.env.extractor.product(&document)),
                TaskKind::Category => FetchedPage::Listing(self.env.extractor.listing(&document)),
            });

            let mut guard = self.lock();
            let inner = &mut *guard;
            inner.core.end_request(task.kind(), outcome.is_ok());

            let mut ctx = ScanCtx {
                core: &mut inner.core,
                store: &self.env.store,
                requested_at,
                received_at,
            };

            match outcome {
                Ok(page) => inner.variant.handle_success(&mut ctx, task, page),
                Err(err) => {
                    let disposition =
                        classify(err.kind, task.rerequests(), ctx.core.budget.max_rerequests);
                    tracing::debug!("Scan {}: {} -> {:?}", self.id, err, disposition);

                    match disposition {
                        Disposition::Stall => {
                            inner.requeued.push_front(task);
                            ctx.core.transition(ScanState::Stalling);
                        }
                        Disposition::Throttle => {
                            inner.requeued.push_front(task);
                            ctx.core.throttle();
                        }
                        other => inner.variant.handle_error(&mut ctx, task, other),
                    }
                }
            }

            self.settle(inner);
        }
    }

    /// Runs one pass: workers until the scan leaves `active`, then the
    /// terminal transition
    async fn drive(self: Arc<Self>) {
        let workers = self.lock().core.budget.max_concurrent_requests.max(1);
        tracing::debug!("Scan {}: starting {} workers", self.id, workers);

        let mut set = JoinSet::new();
        for _ in 0..workers {
            set.spawn(Arc::clone(&self).worker());
        }
        if let Some(companion) = V::companion(&self) {
            set.spawn(companion);
        }

        // Prime the channel
        self.update(|_| ());

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Scan {}: worker failed: {}", self.id, e);
            }
        }

        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.core.state() {
            ScanState::Stalling => {
                inner.requeued.extend(self.channel.drain());
                inner.core.transition(ScanState::Stalled);
            }
            ScanState::Halting => {
                inner.core.transition(ScanState::Completed);
            }
            ScanState::Active => {
                tracing::error!("Scan {}: all workers exited while active", self.id);
                inner.core.transition(ScanState::Halting);
                inner.core.transition(ScanState::Completed);
            }
            _ => {}
        }
        self.apply_effects(inner);
    }
}

impl<V: ScanVariant> ScanHandle for Scan<V> {
    fn id(&self) -> i64 {
        self.id
    }

    fn snapshot(&self) -> ScanSnapshot {
        let inner = self.lock();
        let core = &inner.core;
        ScanSnapshot {
            id: core.id,
            kind: core.kind,
            state: core.state(),
            domain: core.domain.clone(),
            budget: core.budget,
            counters: core.counters,
            products_to_gather: core.products_to_gather,
            in_flight: core.in_flight(),
            scheduled: self.channel.len(),
            backlog: inner.variant.backlog_len(),
            requeued: inner.requeued.len(),
            created_at: core.created_at.clone(),
            started_at: core.started_at.clone(),
        }
    }

    fn start(self: Arc<Self>) -> Result<(), OrchestrationError> {
        {
            let mut inner = self.lock();
            if !inner.core.transition(ScanState::Active) {
                return Err(OrchestrationError::InvalidState(format!(
                    "Scan {} cannot start from state {}",
                    self.id,
                    inner.core.state()
                )));
            }
            self.apply_effects(&mut inner);
        }

        tokio::spawn(self.drive());
        Ok(())
    }

    fn resume(
        self: Arc<Self>,
        concurrency_hint: Option<usize>,
    ) -> Result<(), OrchestrationError> {
        {
            let mut inner = self.lock();
            if inner.core.state() != ScanState::Stalled {
                return Err(OrchestrationError::InvalidState(format!(
                    "Scan {} is {}, only a stalled scan can be resumed",
                    self.id,
                    inner.core.state()
                )));
            }
            if let Some(hint) = concurrency_hint {
                inner.core.cap_concurrency(hint);
            }
            inner.core.transition(ScanState::Active);
            self.apply_effects(&mut inner);
        }

        tokio::spawn(self.drive());
        Ok(())
    }

    fn halt(&self) -> Result<(), OrchestrationError> {
        let mut inner = self.lock();
        let target = match inner.core.state() {
            ScanState::Active => ScanState::Halting,
            ScanState::Stalled => ScanState::Completed,
            other => {
                return Err(OrchestrationError::InvalidState(format!(
                    "Scan {} is {} and cannot be halted",
                    self.id, other
                )))
            }
        };
        inner.core.transition(target);
        self.apply_effects(&mut inner);
        Ok(())
    }
}
