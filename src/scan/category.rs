//! Scan that walks a category tree's listing pages
//!
//! Two task sources share one concurrency budget: listing pages of the work
//! list feed ASINs into the product backlog, and the backlog feeds product
//! page fetches. Admission is estimate-driven. Products go out while the
//! expected gathered count is below target; listing pages go out only while
//! the predicted yield of everything already committed falls short of it.

use crate::extract::ListingPage;
use crate::scan::policy::Disposition;
use crate::scan::runner::{Admission, FetchedPage, ScanCtx, ScanVariant};
use crate::scan::task::{CategoryTask, ProductTask, Task, TaskKind};
use crate::scan::traversal::CategoryCursor;
use crate::scan::CategoryTarget;
use crate::state::SubjectStatus;
use std::collections::{HashSet, VecDeque};

/// Ordered categories still to paginate, with the page-skip pass
#[derive(Debug)]
pub struct WorkList {
    cursors: Vec<CategoryCursor>,
    pages_skip: Option<u32>,

    /// True during the shallow first pass
    skipping: bool,
}

impl WorkList {
    pub fn new(cursors: Vec<CategoryCursor>, pages_skip: Option<u32>) -> Self {
        Self {
            cursors,
            pages_skip,
            skipping: pages_skip.is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    fn position(&self, category_id: i64) -> Option<usize> {
        self.cursors.iter().position(|c| c.id == category_id)
    }

    fn cursor_mut(&mut self, category_id: i64) -> Option<&mut CategoryCursor> {
        self.cursors.iter_mut().find(|c| c.id == category_id)
    }

    fn remove(&mut self, category_id: i64) {
        if let Some(index) = self.position(category_id) {
            self.cursors.remove(index);
        }
    }

    /// Picks the first category that is free to fetch its next page
    ///
    /// While skipping, categories that finished the shallow pass are passed
    /// over. Skip mode ends only when every remaining category has finished
    /// the pass and none is in flight; the first of them then resumes from
    /// its next page.
    fn next_unscanned(&mut self) -> Option<usize> {
        let skipping = self.skipping;
        let eligible = self
            .cursors
            .iter()
            .position(|c| !c.being_processed && !(skipping && c.was_page_skipped));
        if eligible.is_some() {
            return eligible;
        }

        if skipping && self.pass_done() {
            tracing::debug!("Shallow pass finished, paginating deeper");
            self.skipping = false;
            return self.cursors.iter().position(|c| !c.being_processed);
        }

        None
    }

    /// Every remaining category finished the shallow pass and is idle
    fn pass_done(&self) -> bool {
        !self.cursors.is_empty()
            && self
                .cursors
                .iter()
                .all(|c| c.was_page_skipped && !c.being_processed)
    }

    /// Marks the next free category as in flight and returns its task
    fn take_next(&mut self) -> Option<CategoryTask> {
        let index = self.next_unscanned()?;
        let cursor = &mut self.cursors[index];
        cursor.being_processed = true;
        Some(CategoryTask {
            category_id: cursor.id,
            name: cursor.name.clone(),
            node_id: cursor.node_id.clone(),
            page: cursor.current_page,
            rerequests: cursor.rerequests,
        })
    }

    fn has_unscanned(&self) -> bool {
        let skipping = self.skipping;
        let eligible = self
            .cursors
            .iter()
            .any(|c| !c.being_processed && !(skipping && c.was_page_skipped));
        eligible || (skipping && self.pass_done())
    }

    /// Advances a category past a fetched page
    fn advance(&mut self, category_id: i64, page: u32) {
        let skipping = self.skipping;
        let pages_skip = self.pages_skip;
        if let Some(cursor) = self.cursor_mut(category_id) {
            cursor.current_page = page + 1;
            cursor.rerequests = 0;
            cursor.being_processed = false;
            if skipping && pages_skip.map_or(false, |p| page >= p) {
                cursor.was_page_skipped = true;
            }
        }
    }

    fn retry(&mut self, category_id: i64) {
        if let Some(cursor) = self.cursor_mut(category_id) {
            cursor.rerequests += 1;
            cursor.being_processed = false;
        }
    }
}

pub struct CategoryScan {
    target: CategoryTarget,

    /// Average number of products on one listing page
    listing_yield: usize,
    products: VecDeque<ProductTask>,

    /// ASINs already queued by this scan
    checked: HashSet<String>,
    work: WorkList,
}

impl CategoryScan {
    pub fn new(target: CategoryTarget, cursors: Vec<CategoryCursor>, listing_yield: usize) -> Self {
        let work = WorkList::new(cursors, target.pages_skip);
        Self {
            target,
            listing_yield,
            products: VecDeque::new(),
            checked: HashSet::new(),
            work,
        }
    }

    fn should_send_product(&self, admission: &Admission<'_>) -> bool {
        let core = admission.core();
        let expected = core.counters.products_gathered as usize
            + core.in_flight_of(TaskKind::Product)
            + admission.scheduled(TaskKind::Product);

        admission.can_send()
            && !self.products.is_empty()
            && expected < core.products_to_gather as usize
    }

    fn should_send_category(&self, admission: &Admission<'_>) -> bool {
        let core = admission.core();
        if !admission.can_send() || !self.work.has_unscanned() {
            return false;
        }

        // Drain products before committing to more listing pages
        if self.products.len() >= core.budget.max_concurrent_requests {
            return false;
        }

        let committed_pages =
            core.in_flight_of(TaskKind::Category) + admission.scheduled(TaskKind::Category);
        let predicted = core.counters.products_gathered as usize
            + self.products.len()
            + admission.scheduled(TaskKind::Product)
            + core.in_flight_of(TaskKind::Product)
            + committed_pages * self.listing_yield;

        predicted < core.products_to_gather as usize
    }

    fn handle_listing(&mut self, ctx: &mut ScanCtx<'_>, task: CategoryTask, listing: ListingPage) {
        ctx.record_category_page(&task, SubjectStatus::Recorded, Some(&listing));

        let mut queued = 0;
        for asin in &listing.asins {
            if self.checked.insert(asin.clone()) {
                self.products.push_back(ProductTask::new(asin.as_str()));
                queued += 1;
            }
        }

        tracing::debug!(
            "Scan {}: page {} of {} queued {} of {} ASINs",
            ctx.core.id,
            task.page,
            task.node_id,
            queued,
            listing.asins.len()
        );

        // An empty page would paginate forever
        if listing.is_last_page || listing.asins.is_empty() {
            self.work.remove(task.category_id);
        } else {
            self.work.advance(task.category_id, task.page);
        }
    }
}

impl ScanVariant for CategoryScan {
    fn produce_tasks(&mut self, admission: &mut Admission<'_>) {
        loop {
            if self.should_send_product(admission) {
                if let Some(task) = self.products.pop_front() {
                    admission.push(Task::Product(task));
                    continue;
                }
            }
            if self.should_send_category(admission) {
                if let Some(task) = self.work.take_next() {
                    admission.push(Task::Category(task));
                    continue;
                }
            }
            break;
        }
    }

    fn handle_success(&mut self, ctx: &mut ScanCtx<'_>, task: Task, page: FetchedPage) {
        match (task, page) {
            (Task::Category(task), FetchedPage::Listing(listing)) => {
                self.handle_listing(ctx, task, listing)
            }
            (Task::Product(task), FetchedPage::Product(data)) => {
                let in_range = self.target.rank_in_range(data.rank);
                let recorded = ctx
                    .record_product(&task, SubjectStatus::Recorded, Some(data))
                    .is_some();
                if recorded && in_range {
                    ctx.core.gather();
                }
            }
            (task, _) => tracing::warn!("Category scan received mismatched page for {:?}", task),
        }
    }

    fn handle_error(&mut self, ctx: &mut ScanCtx<'_>, task: Task, disposition: Disposition) {
        match task {
            Task::Category(task) => match disposition {
                Disposition::Retry => self.work.retry(task.category_id),
                Disposition::Absent => {
                    ctx.record_category_page(&task, SubjectStatus::Absent, None);
                    self.work.remove(task.category_id);
                }
                _ => {
                    ctx.record_category_page(&task, SubjectStatus::Failed, None);
                    self.work.remove(task.category_id);
                }
            },
            Task::Product(task) => match disposition {
                Disposition::Retry => self.products.push_front(task.retried()),
                Disposition::Absent => {
                    ctx.record_product(&task, SubjectStatus::Absent, None);
                }
                _ => {
                    ctx.record_product(&task, SubjectStatus::Failed, None);
                }
            },
        }
    }

    fn is_exhausted(&self) -> bool {
        self.products.is_empty() && self.work.is_empty()
    }

    fn backlog_len(&self) -> usize {
        self.products.len() + self.work.len()
    }
}
