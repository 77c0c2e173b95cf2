//! State and accounting shared by every scan variant

use crate::scan::task::TaskKind;
use crate::scan::{Budget, ScanKind};
use crate::state::ScanState;
use crate::storage::{ScanCounters, ScanRecord};

/// Lifecycle, budget and counters of a running scan
#[derive(Debug)]
pub struct ScanCore {
    pub id: i64,
    pub domain: String,
    pub kind: ScanKind,
    state: ScanState,
    pub budget: Budget,
    pub counters: ScanCounters,
    pub products_to_gather: u32,
    pub in_flight_products: usize,
    pub in_flight_categories: usize,
    pub created_at: String,
    pub started_at: Option<String>,

    /// Transitions applied since the last `take_applied`
    applied: Vec<ScanState>,
}

impl ScanCore {
    /// Builds the core from a stored scan
    ///
    /// A provider concurrency hint replaces the configured pool size.
    pub fn new(record: &ScanRecord, concurrency_hint: Option<usize>) -> Self {
        let mut budget = record.config.budget;
        if let Some(hint) = concurrency_hint {
            budget.max_concurrent_requests = hint.max(1);
        }

        Self {
            id: record.id,
            domain: record.config.domain.clone(),
            kind: record.kind(),
            state: record.state,
            budget,
            counters: record.counters,
            products_to_gather: record.config.target.products_to_gather(),
            in_flight_products: 0,
            in_flight_categories: 0,
            created_at: record.created_at.clone(),
            started_at: record.started_at.clone(),
            applied: Vec::new(),
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Requests a lifecycle transition
    ///
    /// Returns false and leaves the state untouched when the edge is not
    /// legal, e.g. a late success trying to leave `stalling`.
    pub fn transition(&mut self, to: ScanState) -> bool {
        if !self.state.accepts(to) {
            tracing::debug!(
                "Scan {}: ignoring transition {} -> {}",
                self.id,
                self.state,
                to
            );
            return false;
        }

        tracing::info!("Scan {}: {} -> {}", self.id, self.state, to);
        self.state = to;
        self.applied.push(to);
        true
    }

    /// Drains the transitions whose side effects are still pending
    pub fn take_applied(&mut self) -> Vec<ScanState> {
        std::mem::take(&mut self.applied)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight_products + self.in_flight_categories
    }

    pub fn in_flight_of(&self, kind: TaskKind) -> usize {
        match kind {
            TaskKind::Product => self.in_flight_products,
            TaskKind::Category => self.in_flight_categories,
        }
    }

    pub fn budget_spent(&self) -> bool {
        self.counters.sent_requests >= self.budget.max_requests
    }

    pub fn target_reached(&self) -> bool {
        self.counters.products_gathered >= self.products_to_gather
    }

    /// Accounts for a fetch about to be sent
    ///
    /// Reaching `max_requests` drives the scan to `halting` no matter what
    /// the variant intends.
    pub fn begin_request(&mut self, kind: TaskKind) {
        match kind {
            TaskKind::Product => {
                self.in_flight_products += 1;
                self.counters.product_pages.sent += 1;
            }
            TaskKind::Category => {
                self.in_flight_categories += 1;
                self.counters.category_pages.sent += 1;
            }
        }

        self.counters.sent_requests += 1;
        if self.budget_spent() {
            tracing::info!(
                "Scan {}: request budget of {} spent",
                self.id,
                self.budget.max_requests
            );
            self.transition(ScanState::Halting);
        }
    }

    /// Accounts for a fetch that returned, successfully or not
    pub fn end_request(&mut self, kind: TaskKind, succeeded: bool) {
        let (in_flight, counter) = match kind {
            TaskKind::Product => (&mut self.in_flight_products, &mut self.counters.product_pages),
            TaskKind::Category => (
                &mut self.in_flight_categories,
                &mut self.counters.category_pages,
            ),
        };
        *in_flight = in_flight.saturating_sub(1);
        if succeeded {
            counter.succeeded += 1;
        }
    }

    /// Shrinks the worker pool by one after a rate-limit signal, floor 1
    pub fn throttle(&mut self) -> usize {
        let current = self.budget.max_concurrent_requests;
        self.budget.max_concurrent_requests = current.saturating_sub(1).max(1);
        tracing::warn!(
            "Scan {}: rate limited, concurrency {} -> {}",
            self.id,
            current,
            self.budget.max_concurrent_requests
        );
        self.budget.max_concurrent_requests
    }

    /// Applies a provider concurrency hint to a running scan
    ///
    /// The pool only shrinks here; a throttled scan keeps its size.
    pub fn cap_concurrency(&mut self, hint: usize) {
        let capped = self.budget.max_concurrent_requests.min(hint.max(1));
        if capped != self.budget.max_concurrent_requests {
            tracing::info!(
                "Scan {}: concurrency {} -> {} by provider hint",
                self.id,
                self.budget.max_concurrent_requests,
                capped
            );
        }
        self.budget.max_concurrent_requests = capped;
    }

    /// Counts one product toward the target
    ///
    /// Never exceeds the target. Reaching it drives the scan to `halting`.
    pub fn gather(&mut self) -> bool {
        if self.target_reached() {
            return false;
        }

        self.counters.products_gathered += 1;
        if self.target_reached() {
            tracing::info!(
                "Scan {}: gathered {} of {} products",
                self.id,
                self.counters.products_gathered,
                self.products_to_gather
            );
            self.transition(ScanState::Halting);
        }
        true
    }
}
