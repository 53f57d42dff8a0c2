//! roster-sync - Time-windowed group membership reconciliation
//!
//! Reads a declared roster of (group, member, start, end) rows and makes the
//! membership of each group in a remote identity directory match the rows
//! whose window covers "now".
//!
//! # Architecture
//!
//! - [`config`] - Configuration management and settings
//! - [`directory`] - Remote directory client trait, HTTP and in-memory implementations
//! - [`lock`] - Maintenance flag wait and exclusive run lock (file or Redis lease)
//! - [`storage`] - Roster source, result sink and the SQLite roster store
//! - [`sync`] - Desired state, diffing, per-group reconciliation and run orchestration
//! - [`models`] - Core data structures and types
//! - [`metrics`] - Prometheus run metrics
//! - [`utils`] - Retry helpers, timestamp parsing and error types
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use roster_sync::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = Arc::new(SqliteRosterStore::open(&config.roster.path)?);
//!     let directory = Arc::new(HttpDirectoryClient::new(&config.directory)?);
//!
//!     let runner = SyncRunner::builder()
//!         .store(store)
//!         .directory(directory)
//!         .lock(Arc::new(FileLock::new(config.lock_path())))
//!         .exclusions(Arc::new(StaticExclusions::new(config.excluded_users())))
//!         .coordinator_config(config.coordinator_config())
//!         .build()?;
//!
//!     let report = runner.run().await?;
//!     println!("{}: +{} -{}", report.status.as_str(), report.added_count(), report.removed_count());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod directory;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod models;
pub mod storage;
pub mod sync;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::directory::{DirectoryClient, HttpDirectoryClient, InMemoryDirectory, RemoveOutcome};
    pub use crate::error::{Error, ErrorCategory, Result, SyncErrorTrait};
    pub use crate::lock::{ExclusionCoordinator, FileLock, MutualExclusion, PauseSignal, RedisLock};
    pub use crate::models::{GroupEmail, MemberEmail, MembershipName, RosterRow, SyncResult};
    pub use crate::storage::{ExclusionSource, ResultSink, RosterSource, SqliteRosterStore, StaticExclusions};
    pub use crate::sync::{RunReport, RunStatus, SyncRunner};
}

// Direct re-exports for convenience
pub use models::{GroupEmail, MemberEmail, RosterRow, SyncResult};
