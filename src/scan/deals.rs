//! Scan that drains ASINs discovered on the deals listing
//!
//! Discovery and consumption run side by side: a companion loop walks the
//! deals listing and feeds new ASINs into the backlog while the workers
//! fetch product pages from it. The scan halts once discovery has finished
//! and the backlog is drained, the target is met or the budget is spent.

use crate::extract::{is_asin, DealItem};
use crate::fetcher::{DealsSource, FetchErrorKind};
use crate::scan::policy::Disposition;
use crate::scan::runner::{Admission, Companion, FetchedPage, Scan, ScanCtx, ScanVariant};
use crate::scan::task::{ProductTask, Task, TaskKind};
use crate::scan::DealsTarget;
use crate::state::{ScanState, SubjectStatus};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Pause before retrying a rate-limited listing page
const DISCOVERY_BACKOFF: Duration = Duration::from_millis(250);

/// Where the listing walk stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Discovery {
    finished: bool,

    /// Next listing page to request (1-based)
    page: u32,

    /// Consecutive batches that produced no new ASIN
    empty_batches: u32,
}

pub struct DealsScan {
    target: DealsTarget,
    source: Arc<dyn DealsSource>,
    backlog: VecDeque<ProductTask>,
    checked: HashSet<String>,
    discovery: Discovery,
    max_empty_batches: u32,
}

impl DealsScan {
    pub fn new(target: DealsTarget, source: Arc<dyn DealsSource>, max_empty_batches: u32) -> Self {
        Self {
            target,
            source,
            backlog: VecDeque::new(),
            checked: HashSet::new(),
            discovery: Discovery {
                finished: false,
                page: 1,
                empty_batches: 0,
            },
            max_empty_batches: max_empty_batches.max(1),
        }
    }

    /// Queues unseen ASINs from a batch and advances the walk
    fn absorb(&mut self, items: Vec<DealItem>) -> usize {
        let mut added = 0;
        for item in items {
            if self.checked.len() >= self.target.products_to_gather as usize {
                break;
            }
            if !is_asin(&item.asin) || !self.checked.insert(item.asin.clone()) {
                continue;
            }
            self.backlog.push_back(ProductTask {
                asin: item.asin,
                rerequests: 0,
                discount: item.discount,
            });
            added += 1;
        }

        self.discovery.page += 1;
        if added == 0 {
            self.discovery.empty_batches += 1;
        } else {
            self.discovery.empty_batches = 0;
        }
        self.check_discovery_done();
        added
    }

    fn check_discovery_done(&mut self) {
        if self.discovery.finished {
            return;
        }
        if self.checked.len() >= self.target.products_to_gather as usize {
            tracing::info!("Deals discovery found {} ASINs", self.checked.len());
            self.discovery.finished = true;
        } else if self.discovery.empty_batches >= self.max_empty_batches {
            tracing::info!(
                "Deals discovery stopped after {} empty batches with {} ASINs",
                self.discovery.empty_batches,
                self.checked.len()
            );
            self.discovery.finished = true;
        }
    }

    async fn discover(scan: Arc<Scan<Self>>) {
        loop {
            let next = scan.inspect(|inner| {
                let deals = &inner.variant;
                if inner.core.state() != ScanState::Active || deals.discovery.finished {
                    return None;
                }
                Some((
                    Arc::clone(&deals.source),
                    inner.core.domain.clone(),
                    deals.target.main_category_node_id.clone(),
                    deals.discovery.page,
                ))
            });
            let Some((source, domain, node, page)) = next else {
                return;
            };

            let batch = source.next_batch(&domain, node.as_deref(), page).await;

            let backoff = scan.update(|inner| {
                let deals = &mut inner.variant;
                match batch {
                    Ok(items) => {
                        let found = items.len();
                        let added = deals.absorb(items);
                        tracing::debug!(
                            "Scan {}: deals page {} had {} items, {} new",
                            inner.core.id,
                            page,
                            found,
                            added
                        );
                        false
                    }
                    Err(err) => {
                        tracing::warn!("Scan {}: deals discovery failed: {}", inner.core.id, err);
                        match err.kind {
                            FetchErrorKind::CredentialsExhausted => {
                                inner.core.transition(ScanState::Stalling);
                                false
                            }
                            // Same page again; backpressure never ends discovery
                            FetchErrorKind::RateLimited => {
                                inner.core.throttle();
                                true
                            }
                            _ => {
                                deals.discovery.page += 1;
                                deals.discovery.empty_batches += 1;
                                deals.check_discovery_done();
                                false
                            }
                        }
                    }
                }
            });

            if backoff {
                tokio::time::sleep(DISCOVERY_BACKOFF).await;
            }
        }
    }
}

impl ScanVariant for DealsScan {
    fn produce_tasks(&mut self, admission: &mut Admission<'_>) {
        loop {
            let core = admission.core();
            let expected = core.counters.products_gathered as usize
                + core.in_flight_of(TaskKind::Product)
                + admission.scheduled(TaskKind::Product);
            if !admission.can_send() || expected >= core.products_to_gather as usize {
                break;
            }
            match self.backlog.pop_front() {
                Some(task) => admission.push(Task::Product(task)),
                None => break,
            }
        }
    }

    fn handle_success(&mut self, ctx: &mut ScanCtx<'_>, task: Task, page: FetchedPage) {
        match (task, page) {
            (Task::Product(task), FetchedPage::Product(data)) => {
                if ctx
                    .record_product(&task, SubjectStatus::Recorded, Some(data))
                    .is_some()
                {
                    ctx.core.gather();
                }
            }
            (task, _) => tracing::warn!("Deals scan received unexpected task {:?}", task),
        }
    }

    fn handle_error(&mut self, ctx: &mut ScanCtx<'_>, task: Task, disposition: Disposition) {
        let task = match task {
            Task::Product(task) => task,
            other => {
                tracing::warn!("Deals scan received unexpected task {:?}", other);
                return;
            }
        };

        match disposition {
            Disposition::Retry => self.backlog.push_front(task.retried()),
            Disposition::Absent => {
                ctx.record_product(&task, SubjectStatus::Absent, None);
            }
            _ => {
                ctx.record_product(&task, SubjectStatus::Failed, None);
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        self.discovery.finished && self.backlog.is_empty()
    }

    fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    fn companion(scan: &Arc<Scan<Self>>) -> Option<Companion> {
        let finished = scan.inspect(|inner| inner.variant.discovery.finished);
        if finished {
            return None;
        }
        Some(Box::pin(Self::discover(Arc::clone(scan))))
    }
}
