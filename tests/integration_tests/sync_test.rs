//! End-to-end sync runs
//!
//! Every test uses a real SQLite roster file, a real file lock and the
//! in-memory directory.

use chrono::Duration as ChronoDuration;
use tokio_test::assert_ok;

use roster_sync::storage::RosterSource;
use roster_sync::sync::RunStatus;

use super::fixtures::{now, Harness, GROUP_A, GROUP_B};

#[tokio::test]
async fn test_first_run_adds_removes_and_records() {
    let h = Harness::new();
    let alice = h.active(GROUP_A, "alice@example.com");
    h.active(GROUP_A, "bob@example.com");
    h.directory.seed_member(GROUP_A, "mallory@example.com");

    let report = assert_ok!(h.runner().run().await);

    assert_eq!(report.status, RunStatus::Changed);
    assert_eq!(report.rows, 2);
    assert_eq!(report.groups, 1);
    assert_eq!(report.added_count(), 2);
    assert_eq!(report.removed_count(), 1);
    assert_eq!(h.members(GROUP_A), vec!["alice@example.com", "bob@example.com"]);

    // Relationship names written back to the rows that declared them
    let recorded = h.store.membership_name(alice).unwrap();
    let live = h.directory.membership_of(GROUP_A, "alice@example.com").unwrap();
    assert_eq!(recorded.as_deref(), Some(live.as_str()));

    assert_eq!(h.store.last_operation().unwrap(), Some(now()));
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let h = Harness::new();
    h.active(GROUP_A, "alice@example.com");
    h.active(GROUP_B, "carol@example.com");

    h.runner().run().await.unwrap();
    let after_first = h.directory.calls();

    let later = now() + ChronoDuration::hours(1);
    let report = h.runner_with(&[], later, 1).run().await.unwrap();

    assert_eq!(report.status, RunStatus::Unchanged);
    assert_eq!(report.groups, 2);
    assert_eq!(h.directory.calls().mutations(), after_first.mutations());
    // Unchanged runs leave the last change time alone
    assert_eq!(h.store.last_operation().unwrap(), Some(now()));
}

#[tokio::test]
async fn test_window_end_removes_and_clears_reference() {
    let h = Harness::new();
    let row = h.active(GROUP_A, "alice@example.com");

    h.runner().run().await.unwrap();
    assert!(h.store.membership_name(row).unwrap().is_some());

    let after_window = now() + ChronoDuration::days(2);
    let report = h.runner_with(&[], after_window, 1).run().await.unwrap();

    assert_eq!(report.status, RunStatus::Changed);
    assert_eq!(report.removed_count(), 1);
    assert!(h.members(GROUP_A).is_empty());
    assert_eq!(h.store.membership_name(row).unwrap(), None);
    assert_eq!(h.store.last_operation().unwrap(), Some(after_window));
}

#[tokio::test]
async fn test_expired_row_is_not_added() {
    let h = Harness::new();
    h.expired(GROUP_A, "alice@example.com");
    h.active(GROUP_A, "bob@example.com");

    h.runner().run().await.unwrap();

    assert_eq!(h.members(GROUP_A), vec!["bob@example.com"]);
}

#[tokio::test]
async fn test_excluded_users_are_never_touched() {
    let h = Harness::new();
    h.active(GROUP_A, "admin@example.com");
    h.active(GROUP_A, "alice@example.com");
    h.directory.seed_member(GROUP_A, "owner@example.com");

    let runner = h.runner_with(&["admin@example.com", "owner@example.com"], now(), 1);
    let report = runner.run().await.unwrap();

    assert_eq!(report.added_count(), 1);
    assert_eq!(report.removed_count(), 0);
    // The unrostered owner stays, the rostered admin is not added
    assert_eq!(h.members(GROUP_A), vec!["alice@example.com", "owner@example.com"]);
}

#[tokio::test]
async fn test_empty_roster_skips_directory() {
    let h = Harness::new();
    h.store.insert_row("", "nobody@example.com", "2026-01-01", "2027-01-01").unwrap();

    let report = h.runner().run().await.unwrap();

    assert_eq!(report.status, RunStatus::NoRows);
    assert_eq!(report.rows, 0);
    assert_eq!(h.directory.calls().resolve, 0);
    assert_eq!(h.store.last_operation().unwrap(), None);
}

#[tokio::test]
async fn test_failed_add_is_retried_next_run() {
    let h = Harness::new();
    let alice = h.active(GROUP_A, "alice@example.com");
    h.active(GROUP_A, "bob@example.com");
    h.directory.fail_add("alice@example.com");

    let report = h.runner().run().await.unwrap();

    assert_eq!(report.added_count(), 1);
    assert_eq!(h.members(GROUP_A), vec!["bob@example.com"]);
    assert_eq!(h.store.membership_name(alice).unwrap(), None);

    h.directory.clear_failures();
    let report = h.runner().run().await.unwrap();

    assert_eq!(report.added_count(), 1);
    assert!(h.store.membership_name(alice).unwrap().is_some());
}

#[tokio::test]
async fn test_member_removed_outside_automation_is_readded() {
    let h = Harness::new();
    h.active(GROUP_A, "alice@example.com");
    h.runner().run().await.unwrap();

    h.directory.evict_member(GROUP_A, "alice@example.com");
    let report = h.runner().run().await.unwrap();

    assert_eq!(report.status, RunStatus::Changed);
    assert_eq!(h.members(GROUP_A), vec!["alice@example.com"]);
}

#[tokio::test]
async fn test_concurrent_groups_keep_roster_order() {
    let h = Harness::new();
    let groups = ["a@example.com", "b@example.com", "c@example.com", "d@example.com"];
    for (i, group) in groups.iter().enumerate().rev() {
        h.active(group, &format!("member{i}@example.com"));
    }

    let report = h.runner_with(&[], now(), 4).run().await.unwrap();

    let order: Vec<&str> = report.results.iter().map(|r| r.group.as_str()).collect();
    assert_eq!(order, vec!["d@example.com", "c@example.com", "b@example.com", "a@example.com"]);
    for (i, group) in groups.iter().enumerate() {
        assert_eq!(h.members(group), vec![format!("member{i}@example.com")]);
    }
}

#[tokio::test]
async fn test_plan_does_not_mutate() {
    let h = Harness::new();
    h.active(GROUP_A, "alice@example.com");
    h.directory.seed_member(GROUP_A, "mallory@example.com");

    let plans = h.runner().plan().await.unwrap();

    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].diff.to_add.len(), 1);
    assert_eq!(plans[0].diff.to_remove.len(), 1);
    assert_eq!(h.directory.calls().mutations(), 0);
    assert_eq!(h.members(GROUP_A), vec!["mallory@example.com"]);
}

#[tokio::test]
async fn test_roster_accepts_mixed_timestamp_formats() {
    let h = Harness::new();
    h.store
        .insert_row(GROUP_A, "rfc@example.com", "2026-05-01T00:00:00Z", "2026-07-01T00:00:00+09:00")
        .unwrap();
    h.store
        .insert_row(GROUP_A, "date@example.com", "2026-05-01", "2026-07-01")
        .unwrap();
    h.store
        .insert_row(GROUP_A, "millis@example.com", 1_777_593_600_000_i64, 1_782_864_000_000_i64)
        .unwrap();
    h.store
        .insert_row(GROUP_A, "broken@example.com", "soon", "later")
        .unwrap();

    let rows = h.store.load().await.unwrap();
    assert_eq!(rows.len(), 3);

    h.runner().run().await.unwrap();
    assert_eq!(
        h.members(GROUP_A),
        vec!["date@example.com", "millis@example.com", "rfc@example.com"]
    );
}
