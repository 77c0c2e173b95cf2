//! Scan orchestration
//!
//! This module contains everything that runs a scan:
//! - `request`: scan requests and their validation into typed configs
//! - `base`: lifecycle, budget and counters shared by every variant
//! - `task`: scheduler tasks and the blocking task channel
//! - `policy`: retry policy keyed on the fetch error kind
//! - `runner`: the generic worker pool and scheduling step
//! - `asin`, `category`, `deals`: the three scan variants
//! - `traversal`: category tree work-list planning
//! - `manager`: the single-active-scan sequencer

mod asin;
mod base;
mod category;
mod deals;
mod manager;
mod policy;
mod request;
mod runner;
mod task;
pub mod traversal;

pub use base::ScanCore;
pub use manager::{
    OrchestrationError, ScanDetails, ScanManager, ScanPage, ScanSettings, ScanSummary,
    StoredScan, SCANS_PER_PAGE,
};
pub use policy::{classify, Disposition};
pub use request::{
    Budget, CategoryTarget, DealsTarget, ScanConfig, ScanKind, ScanRequest, ScanTarget,
    TraversalStrategy, ValidationContext, ValidationError,
};
pub use runner::ScanSnapshot;
pub use task::{CategoryTask, ProductTask, Task, TaskChannel, TaskKind};
