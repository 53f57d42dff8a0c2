//! Per-group reconciliation
//!
//! Desired state comes from the roster rows whose window contains `now`;
//! actual state is a fresh listing from the directory. The diff between the
//! two drives add and remove calls. Excluded identities are removed from
//! both sides before diffing, so automation never touches them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::directory::{DirectoryClient, RemoveOutcome};
use crate::error::{Error, Result};
use crate::metrics;
use crate::models::{GroupEmail, GroupName, MemberEmail, RosterRow, SyncResult};

/// Members a group should have at `now`
///
/// A row contributes its member iff the member is not excluded and
/// `valid_from <= now <= valid_to`. Duplicate members across rows union.
pub fn compute_desired_state<'a, I>(
    rows: I,
    now: DateTime<Utc>,
    excluded: &BTreeSet<MemberEmail>,
) -> BTreeSet<MemberEmail>
where
    I: IntoIterator<Item = &'a RosterRow>,
{
    rows.into_iter()
        .filter(|row| row.is_active_at(now))
        .filter(|row| !excluded.contains(&row.member))
        .map(|row| row.member.clone())
        .collect()
}

/// Changes needed to turn the actual membership into the desired one
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MembershipDiff {
    /// Desired but not present, sorted
    pub to_add: Vec<MemberEmail>,

    /// Present but not desired, sorted
    pub to_remove: Vec<MemberEmail>,
}

impl MembershipDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Set differences between desired and actual members
pub fn diff(desired: &BTreeSet<MemberEmail>, actual: &BTreeSet<MemberEmail>) -> MembershipDiff {
    MembershipDiff {
        to_add: desired.difference(actual).cloned().collect(),
        to_remove: actual.difference(desired).cloned().collect(),
    }
}

/// Read-only view of one group's reconciliation
#[derive(Debug, Clone, Serialize)]
pub struct GroupPlan {
    pub group: GroupEmail,
    pub group_name: GroupName,
    pub desired: BTreeSet<MemberEmail>,
    pub actual: BTreeSet<MemberEmail>,
    pub diff: MembershipDiff,
}

/// Reconciles groups against the remote directory
#[derive(Clone)]
pub struct Reconciler {
    directory: Arc<dyn DirectoryClient>,
}

impl Reconciler {
    pub fn new(directory: Arc<dyn DirectoryClient>) -> Self {
        Self { directory }
    }

    /// Resolve, list and diff a group without mutating anything
    ///
    /// # Errors
    ///
    /// `Error::GroupNotFound` if the group does not resolve, or
    /// `Error::Directory` if the lookup or the listing fails.
    pub async fn plan_group(
        &self,
        group: &GroupEmail,
        rows: &[RosterRow],
        excluded: &BTreeSet<MemberEmail>,
        now: DateTime<Utc>,
    ) -> Result<GroupPlan> {
        let Some(group_name) = self.directory.resolve_group(group).await? else {
            error!(group = %group, "Group not found in directory");
            return Err(Error::group_not_found(group.as_str()));
        };

        let actual: BTreeSet<MemberEmail> = self
            .directory
            .list_members(&group_name)
            .await?
            .into_iter()
            .map(|m| m.email)
            .filter(|email| !excluded.contains(email))
            .collect();

        let desired = compute_desired_state(rows, now, excluded);
        let changes = diff(&desired, &actual);

        Ok(GroupPlan {
            group: group.clone(),
            group_name,
            desired,
            actual,
            diff: changes,
        })
    }

    /// Bring one group in line with the roster
    ///
    /// Failed adds and removes are logged and left out of the result; the
    /// next run will try them again. Only lookup and listing failures are
    /// returned as errors.
    pub async fn reconcile_group(
        &self,
        group: &GroupEmail,
        rows: &[RosterRow],
        excluded: &BTreeSet<MemberEmail>,
        now: DateTime<Utc>,
    ) -> Result<SyncResult> {
        let plan = self.plan_group(group, rows, excluded, now).await?;
        let mut result = SyncResult::new(group.clone());

        info!(
            group = %group,
            desired = plan.desired.len(),
            actual = plan.actual.len(),
            to_add = plan.diff.to_add.len(),
            to_remove = plan.diff.to_remove.len(),
            "Reconciling group"
        );

        for member in &plan.diff.to_add {
            match self.directory.add_member(&plan.group_name, member).await {
                Ok(membership) => {
                    info!(group = %group, member = %member, membership = %membership.name, "Added member");
                    result.added.push(member.clone());
                    result.added_refs.insert(member.clone(), membership.name);
                }
                Err(e) => {
                    warn!(group = %group, member = %member, error = %e, "Failed to add member, skipping");
                    metrics::record_dropped_operation("add");
                }
            }
        }

        for member in &plan.diff.to_remove {
            match self.directory.remove_member(&plan.group_name, member).await {
                Ok(RemoveOutcome::Removed) => {
                    info!(group = %group, member = %member, "Removed member");
                    result.removed.push(member.clone());
                }
                Ok(RemoveOutcome::AlreadyAbsent) => {
                    info!(group = %group, member = %member, "Member already absent");
                    result.removed.push(member.clone());
                }
                Err(e) => {
                    warn!(group = %group, member = %member, error = %e, "Failed to remove member, skipping");
                    metrics::record_dropped_operation("remove");
                }
            }
        }

        metrics::record_group_result(result.added.len(), result.removed.len());
        Ok(result)
    }
}
