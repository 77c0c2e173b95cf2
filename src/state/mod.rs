//! State module for tracking scan progress
//!
//! This module provides the state enums persisted alongside scans, products
//! and category trees.
//!
//! # Components
//!
//! - `ScanState`: The lifecycle of a scan (enqueued, active, stalling, etc.)
//! - `SubjectStatus`: Terminal status of a fetched product or category page
//! - `DiscoveryState`: Progress of the discovery crawl that built a category tree

mod scan_state;
mod subject_status;

// Re-export main types
pub use scan_state::ScanState;
pub use subject_status::{DiscoveryState, SubjectStatus};
