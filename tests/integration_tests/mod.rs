//! Integration tests module
//!
//! End-to-end tests for roster-sync:
//! - Roster to directory reconciliation with write-back
//! - Maintenance flag, exclusive lock and failure handling
//! - The REST directory client against wiremock

pub mod directory_http_test;
pub mod error_scenarios;
pub mod fixtures;
pub mod sync_test;
