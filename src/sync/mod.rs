//! Roster-to-directory reconciliation
//!
//! - [`engine`]: desired state, diffing and per-group reconciliation
//! - [`runner`]: whole runs under the maintenance flag and exclusive lock

pub mod engine;
pub mod runner;

pub use engine::{compute_desired_state, diff, GroupPlan, MembershipDiff, Reconciler};
pub use runner::{
    partition_by_group, Clock, RunReport, RunStatus, SyncPlanner, SyncRunner, SyncRunnerBuilder,
};
