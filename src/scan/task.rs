//! Scheduler tasks and the blocking task channel

use crate::fetcher::Marketplace;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Product,
    Category,
}

/// Fetch of one product page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductTask {
    pub asin: String,
    pub rerequests: u32,

    /// Deal label carried over from discovery
    pub discount: Option<String>,
}

impl ProductTask {
    pub fn new(asin: impl Into<String>) -> Self {
        Self {
            asin: asin.into(),
            rerequests: 0,
            discount: None,
        }
    }

    /// The same subject, one retry further
    pub fn retried(mut self) -> Self {
        self.rerequests += 1;
        self
    }
}

/// Fetch of one listing page of a work-list category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryTask {
    pub category_id: i64,
    pub name: String,
    pub node_id: String,
    pub page: u32,
    pub rerequests: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Product(ProductTask),
    Category(CategoryTask),
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Product(_) => TaskKind::Product,
            Self::Category(_) => TaskKind::Category,
        }
    }

    pub fn rerequests(&self) -> u32 {
        match self {
            Self::Product(task) => task.rerequests,
            Self::Category(task) => task.rerequests,
        }
    }

    pub fn url(&self, marketplace: &Marketplace, domain: &str) -> String {
        match self {
            Self::Product(task) => marketplace.product_page(domain, &task.asin),
            Self::Category(task) => marketplace.category_page(domain, &task.node_id, task.page),
        }
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    queue: VecDeque<Task>,
    closed: bool,

    /// Popped tasks the popping worker has not yet counted as in flight
    claimed_products: usize,
    claimed_categories: usize,
}

impl ChannelState {
    fn claimed(&mut self, kind: TaskKind) -> &mut usize {
        match kind {
            TaskKind::Product => &mut self.claimed_products,
            TaskKind::Category => &mut self.claimed_categories,
        }
    }
}

/// FIFO handoff between the scheduling step and the workers
///
/// `push` queues a task and wakes one waiting worker. `pop` waits until a
/// task is available or the channel is closed. `close` wakes every waiter.
///
/// A popped task stays claimed, and still counts towards `len` and `count`,
/// until the worker calls [`TaskChannel::release`]. A worker releases under
/// the scan lock in the same step that starts the request, so a scheduling
/// step never sees a task that is neither queued nor in flight.
#[derive(Debug, Default)]
pub struct TaskChannel {
    state: Mutex<ChannelState>,
    notify: Notify,
}

impl TaskChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, task: Task) {
        self.lock().queue.push_back(task);
        self.notify.notify_one();
    }

    /// Waits for the next task; `None` once the channel is closed
    pub async fn pop(&self) -> Option<Task> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a close between the check and the
            // await still wakes us
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(task) = state.queue.pop_front() {
                    *state.claimed(task.kind()) += 1;
                    return Some(task);
                }
            }

            notified.await;
        }
    }

    /// Ends the claim on a popped task
    pub fn release(&self, kind: TaskKind) {
        let mut state = self.lock();
        let claimed = state.claimed(kind);
        *claimed = claimed.saturating_sub(1);
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    /// Removes every queued task, oldest first
    pub fn drain(&self) -> Vec<Task> {
        self.lock().queue.drain(..).collect()
    }

    /// Queued plus claimed tasks
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.queue.len() + state.claimed_products + state.claimed_categories
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, kind: TaskKind) -> usize {
        let mut state = self.lock();
        let queued = state.queue.iter().filter(|t| t.kind() == kind).count();
        queued + *state.claimed(kind)
    }
}
