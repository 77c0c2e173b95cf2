//! Scan over an explicit set of ASINs

use crate::scan::policy::Disposition;
use crate::scan::runner::{Admission, FetchedPage, ScanCtx, ScanVariant};
use crate::scan::task::{ProductTask, Task};
use crate::state::SubjectStatus;
use std::collections::VecDeque;

/// Fetches each requested ASIN once
///
/// Every terminal record counts toward the target, so the scan completes
/// when the backlog is exhausted or the request budget is spent.
pub struct AsinScan {
    backlog: VecDeque<ProductTask>,
}

impl AsinScan {
    pub fn new(asins: &[String]) -> Self {
        Self {
            backlog: asins.iter().map(ProductTask::new).collect(),
        }
    }

    fn settle(ctx: &mut ScanCtx<'_>, task: &ProductTask, status: SubjectStatus) {
        if ctx.record_product(task, status, None).is_some() {
            ctx.core.gather();
        }
    }
}

impl ScanVariant for AsinScan {
    fn produce_tasks(&mut self, admission: &mut Admission<'_>) {
        while admission.can_send() {
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
            (task, _) => tracing::warn!("ASIN scan received unexpected task {:?}", task),
        }
    }

    fn handle_error(&mut self, ctx: &mut ScanCtx<'_>, task: Task, disposition: Disposition) {
        let task = match task {
            Task::Product(task) => task,
            other => {
                tracing::warn!("ASIN scan received unexpected task {:?}", other);
                return;
            }
        };

        match disposition {
            Disposition::Retry => self.backlog.push_front(task.retried()),
            Disposition::Absent => Self::settle(ctx, &task, SubjectStatus::Absent),
            _ => Self::settle(ctx, &task, SubjectStatus::Failed),
        }
    }

    fn is_exhausted(&self) -> bool {
        self.backlog.is_empty()
    }

    fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}
