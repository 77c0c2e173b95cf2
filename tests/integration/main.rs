//! Integration tests for scan orchestration
//!
//! Scans run end to end on an in-memory store with scripted fetchers, so
//! every test controls exactly which pages succeed, fail or stall.

mod common;
mod manager_tests;
mod scan_tests;
