//! Roster storage and reconciliation collaborators
//!
//! The run orchestrator only sees these traits:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SyncRunner                           │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                    │
//!          ▼                   ▼                    ▼
//! ┌─────────────────┐ ┌─────────────────┐ ┌──────────────────┐
//! │  RosterSource   │ │   ResultSink    │ │ ExclusionSource  │
//! └─────────────────┘ └─────────────────┘ └──────────────────┘
//!          │                   │                    │
//!          └─────────┬─────────┘                    ▼
//!                    ▼                     ┌──────────────────┐
//!         ┌─────────────────────┐          │ StaticExclusions │
//!         │  SqliteRosterStore  │          └──────────────────┘
//!         └─────────────────────┘
//! ```

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use crate::error::Result;
use crate::models::{MemberEmail, RosterRow, SyncResult};

pub use sqlite::SqliteRosterStore;

/// Supplies the declared roster
#[async_trait]
pub trait RosterSource: Send + Sync {
    /// Load every well-formed row
    ///
    /// Rows with a blank group or member, or an unparseable window, are
    /// skipped and logged by the implementation.
    async fn load(&self) -> Result<Vec<RosterRow>>;
}

/// Receives the outcome of a run
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Record relationship names for added members and clear them for removed ones
    async fn write_results(&self, rows: &[RosterRow], results: &[SyncResult]) -> Result<()>;

    /// Record the time of the last run that changed anything
    async fn record_last_change(&self, at: DateTime<Utc>) -> Result<()>;
}

/// Supplies identities automation must never touch
#[async_trait]
pub trait ExclusionSource: Send + Sync {
    async fn load(&self) -> Result<BTreeSet<MemberEmail>>;
}

/// Fixed exclusion list, usually from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticExclusions {
    users: BTreeSet<MemberEmail>,
}

impl StaticExclusions {
    pub fn new<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<MemberEmail>,
    {
        Self {
            users: users
                .into_iter()
                .map(Into::into)
                .filter(|u: &MemberEmail| !u.is_empty())
                .collect(),
        }
    }
}

#[async_trait]
impl ExclusionSource for StaticExclusions {
    async fn load(&self) -> Result<BTreeSet<MemberEmail>> {
        tracing::debug!(count = self.users.len(), "Loaded excluded users");
        Ok(self.users.clone())
    }
}
