//! Remote group directory
//!
//! The reconciliation engine talks to the directory only through
//! [`DirectoryClient`]. Two implementations ship with the crate:
//!
//! - [`HttpDirectoryClient`] for the real REST API
//! - [`InMemoryDirectory`] for tests and dry runs

pub mod http;
pub mod memory;

use async_trait::async_trait;

use crate::error::DirectoryError;
use crate::models::{GroupEmail, GroupName, MemberEmail, MembershipInfo};

pub use http::HttpDirectoryClient;
pub use memory::InMemoryDirectory;

/// Result type for directory operations
pub type DirectoryResult<T> = std::result::Result<T, DirectoryError>;

/// Successful outcomes of a removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The relationship existed and was deleted
    Removed,
    /// The member was not in the group; the desired state already holds
    AlreadyAbsent,
}

/// Operations the engine needs from the remote directory
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Look up a group's internal handle by its email
    ///
    /// Returns `Ok(None)` when the directory has no such group.
    async fn resolve_group(&self, group: &GroupEmail) -> DirectoryResult<Option<GroupName>>;

    /// Current members of a group, fully paginated
    async fn list_members(&self, group: &GroupName) -> DirectoryResult<Vec<MembershipInfo>>;

    /// Create a membership and return its relationship name
    async fn add_member(
        &self,
        group: &GroupName,
        member: &MemberEmail,
    ) -> DirectoryResult<MembershipInfo>;

    /// Delete a membership
    async fn remove_member(
        &self,
        group: &GroupName,
        member: &MemberEmail,
    ) -> DirectoryResult<RemoveOutcome>;
}
