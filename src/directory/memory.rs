//! In-memory directory with failure injection

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{DirectoryClient, DirectoryResult, RemoveOutcome};
use crate::error::DirectoryError;
use crate::models::{GroupEmail, GroupName, MemberEmail, MembershipInfo, MembershipName};

#[derive(Debug, Default)]
struct GroupState {
    name: GroupName,
    members: BTreeMap<MemberEmail, MembershipName>,
}

#[derive(Debug, Default)]
struct Failures {
    resolve: BTreeSet<GroupEmail>,
    list: BTreeSet<GroupName>,
    add: BTreeSet<MemberEmail>,
    remove: BTreeSet<MemberEmail>,
}

#[derive(Debug, Default)]
struct State {
    groups: BTreeMap<GroupEmail, GroupState>,
    failures: Failures,
}

/// Number of calls made per operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub resolve: usize,
    pub list: usize,
    pub add: usize,
    pub remove: usize,
}

impl CallCounts {
    /// Calls that can mutate the directory
    pub fn mutations(&self) -> usize {
        self.add + self.remove
    }
}

/// Directory held in process memory
///
/// Groups must be created with [`InMemoryDirectory::create_group`] before
/// they resolve. Failures can be injected per group or member; an injected
/// failure persists until cleared.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    state: Mutex<State>,
    next_id: AtomicU64,
    resolve_calls: AtomicUsize,
    list_calls: AtomicUsize,
    add_calls: AtomicUsize,
    remove_calls: AtomicUsize,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_name(&self, prefix: &str) -> String {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{prefix}/{id:06}")
    }

    /// Create an empty group and return its handle
    pub fn create_group(&self, group: impl Into<GroupEmail>) -> GroupName {
        let group = group.into();
        let mut state = self.state();
        if let Some(existing) = state.groups.get(&group) {
            return existing.name.clone();
        }

        let name = GroupName::new(self.next_name("groups"));
        state.groups.insert(
            group,
            GroupState {
                name: name.clone(),
                members: BTreeMap::new(),
            },
        );
        name
    }

    /// Put a member into a group directly, bypassing counters and failures
    pub fn seed_member(&self, group: impl Into<GroupEmail>, member: impl Into<MemberEmail>) {
        let group = group.into();
        let group_name = self.create_group(group.clone());
        let membership = MembershipName::new(self.next_name(&format!("{group_name}/memberships")));

        let mut state = self.state();
        if let Some(g) = state.groups.get_mut(&group) {
            g.members.entry(member.into()).or_insert(membership);
        }
    }

    /// Remove a member directly, simulating a change made outside automation
    pub fn evict_member(&self, group: impl Into<GroupEmail>, member: impl Into<MemberEmail>) {
        let group = group.into();
        let member = member.into();
        if let Some(g) = self.state().groups.get_mut(&group) {
            g.members.remove(&member);
        }
    }

    /// Current members of a group, sorted
    pub fn members(&self, group: impl Into<GroupEmail>) -> Vec<MemberEmail> {
        let group = group.into();
        self.state()
            .groups
            .get(&group)
            .map(|g| g.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Relationship name of one member, if present
    pub fn membership_of(
        &self,
        group: impl Into<GroupEmail>,
        member: impl Into<MemberEmail>,
    ) -> Option<MembershipName> {
        let group = group.into();
        let member = member.into();
        self.state()
            .groups
            .get(&group)
            .and_then(|g| g.members.get(&member).cloned())
    }

    /// Make group lookups fail with a backend error
    pub fn fail_resolve(&self, group: impl Into<GroupEmail>) {
        self.state().failures.resolve.insert(group.into());
    }

    /// Make member listing fail for a group
    pub fn fail_list(&self, group: impl Into<GroupEmail>) {
        let group = group.into();
        let name = self.create_group(group);
        self.state().failures.list.insert(name);
    }

    /// Make adds of this member fail in every group
    pub fn fail_add(&self, member: impl Into<MemberEmail>) {
        self.state().failures.add.insert(member.into());
    }

    /// Make removals of this member fail in every group
    pub fn fail_remove(&self, member: impl Into<MemberEmail>) {
        self.state().failures.remove.insert(member.into());
    }

    /// Clear every injected failure
    pub fn clear_failures(&self) {
        self.state().failures = Failures::default();
    }

    /// Calls made so far
    pub fn calls(&self) -> CallCounts {
        CallCounts {
            resolve: self.resolve_calls.load(Ordering::SeqCst),
            list: self.list_calls.load(Ordering::SeqCst),
            add: self.add_calls.load(Ordering::SeqCst),
            remove: self.remove_calls.load(Ordering::SeqCst),
        }
    }

    fn group_mut<'a>(state: &'a mut State, name: &GroupName) -> DirectoryResult<&'a mut GroupState> {
        state
            .groups
            .values_mut()
            .find(|g| &g.name == name)
            .ok_or_else(|| DirectoryError::Rejected {
                status: 404,
                body: format!("unknown group handle {name}"),
            })
    }
}

#[async_trait]
impl DirectoryClient for InMemoryDirectory {
    async fn resolve_group(&self, group: &GroupEmail) -> DirectoryResult<Option<GroupName>> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if state.failures.resolve.contains(group) {
            return Err(DirectoryError::Operation(format!("injected lookup failure for {group}")));
        }
        Ok(state.groups.get(group).map(|g| g.name.clone()))
    }

    async fn list_members(&self, group: &GroupName) -> DirectoryResult<Vec<MembershipInfo>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if state.failures.list.contains(group) {
            return Err(DirectoryError::ServerError(503));
        }

        let g = Self::group_mut(&mut state, group)?;
        Ok(g.members
            .iter()
            .map(|(email, name)| MembershipInfo {
                name: name.clone(),
                email: email.clone(),
            })
            .collect())
    }

    async fn add_member(
        &self,
        group: &GroupName,
        member: &MemberEmail,
    ) -> DirectoryResult<MembershipInfo> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        if self.state().failures.add.contains(member) {
            return Err(DirectoryError::Operation(format!("injected add failure for {member}")));
        }

        let name = MembershipName::new(self.next_name(&format!("{group}/memberships")));
        let mut state = self.state();
        let g = Self::group_mut(&mut state, group)?;
        if g.members.contains_key(member) {
            return Err(DirectoryError::Rejected {
                status: 409,
                body: format!("{member} is already a member"),
            });
        }
        g.members.insert(member.clone(), name.clone());

        Ok(MembershipInfo {
            name,
            email: member.clone(),
        })
    }

    async fn remove_member(
        &self,
        group: &GroupName,
        member: &MemberEmail,
    ) -> DirectoryResult<RemoveOutcome> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if state.failures.remove.contains(member) {
            return Err(DirectoryError::Operation(format!("injected remove failure for {member}")));
        }

        let g = Self::group_mut(&mut state, group)?;
        Ok(match g.members.remove(member) {
            Some(_) => RemoveOutcome::Removed,
            None => RemoveOutcome::AlreadyAbsent,
        })
    }
}
