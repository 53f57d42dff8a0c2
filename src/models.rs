//! Core data models for roster reconciliation
//!
//! Identifier newtypes keep group addresses, member addresses and the
//! directory's resource names from being mixed up. They all serialize as
//! plain strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier, trimming surrounding whitespace
            pub fn new(value: impl Into<String>) -> Self {
                let value = value.into();
                let trimmed = value.trim();
                if trimmed.len() == value.len() {
                    Self(value)
                } else {
                    Self(trimmed.to_string())
                }
            }

            /// Borrow the identifier as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Check whether the identifier is empty
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Email address of a group as declared in the roster
    GroupEmail
);

string_id!(
    /// Email address of a member as declared in the roster or reported by the directory
    MemberEmail
);

string_id!(
    /// Directory-internal group handle, `groups/{group_id}`
    GroupName
);

string_id!(
    /// Directory-internal name of one group/member relationship,
    /// `groups/{group_id}/memberships/{membership_id}`
    ///
    /// This is the handle needed to delete that exact relationship.
    MembershipName
);

/// One declared membership interval from the roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterRow {
    /// Stable row identity in the roster store, used to write results back
    pub row_index: i64,

    /// Target group
    pub group: GroupEmail,

    /// Member to add or remove
    pub member: MemberEmail,

    /// Start of the validity window (inclusive)
    pub valid_from: DateTime<Utc>,

    /// End of the validity window (inclusive)
    pub valid_to: DateTime<Utc>,

    /// Relationship name recorded by an earlier run, if any
    pub membership_ref: Option<MembershipName>,
}

impl RosterRow {
    /// Check whether the row's window contains `now`, inclusive at both ends
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_from <= now && now <= self.valid_to
    }
}

/// Membership as reported by the remote directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipInfo {
    /// Relationship name
    pub name: MembershipName,

    /// Member's primary email
    pub email: MemberEmail,
}

/// Outcome of reconciling one group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Reconciled group
    pub group: GroupEmail,

    /// Members actually added in this run
    pub added: Vec<MemberEmail>,

    /// Members actually removed in this run
    pub removed: Vec<MemberEmail>,

    /// Relationship names created for the added members
    pub added_refs: BTreeMap<MemberEmail, MembershipName>,
}

impl SyncResult {
    /// Create an empty result for a group
    pub fn new(group: GroupEmail) -> Self {
        Self {
            group,
            ..Default::default()
        }
    }

    /// Check if this group had any real mutation
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(from: (i32, u32, u32), to: (i32, u32, u32)) -> RosterRow {
        RosterRow {
            row_index: 2,
            group: GroupEmail::new("g1@example.com"),
            member: MemberEmail::new("m1@example.com"),
            valid_from: Utc.with_ymd_and_hms(from.0, from.1, from.2, 0, 0, 0).unwrap(),
            valid_to: Utc.with_ymd_and_hms(to.0, to.1, to.2, 0, 0, 0).unwrap(),
            membership_ref: None,
        }
    }

    #[test]
    fn test_identifier_trims_whitespace() {
        let email = MemberEmail::new("  user@example.com \n");
        assert_eq!(email.as_str(), "user@example.com");
        assert_eq!(email.to_string(), "user@example.com");
    }

    #[test]
    fn test_identifier_serializes_as_string() {
        let name = MembershipName::new("groups/abc/memberships/123");
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"groups/abc/memberships/123\"");
    }

    #[test]
    fn test_row_window_is_inclusive() {
        let r = row((2025, 1, 1), (2025, 12, 31));
        assert!(r.is_active_at(r.valid_from));
        assert!(r.is_active_at(r.valid_to));
        assert!(!r.is_active_at(r.valid_to + chrono::Duration::seconds(1)));
        assert!(!r.is_active_at(r.valid_from - chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_sync_result_has_changes() {
        let mut result = SyncResult::new(GroupEmail::new("g1@example.com"));
        assert!(!result.has_changes());

        result.removed.push(MemberEmail::new("m1@example.com"));
        assert!(result.has_changes());
    }
}
