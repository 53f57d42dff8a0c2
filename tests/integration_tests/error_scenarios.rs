//! Error scenario integration tests
//!
//! Tests failure modes and coordination:
//! 1. Missing groups abort the run
//! 2. Listing failures abort the run
//! 3. Lock contention and the maintenance flag
//! 4. Lock release after failed runs

use std::sync::Arc;
use std::time::Duration;

use roster_sync::error::{Error, ErrorCategory, RosterError, SyncErrorTrait};
use roster_sync::lock::{FileLock, MutualExclusion};
use roster_sync::storage::{SqliteRosterStore, StaticExclusions};
use roster_sync::sync::SyncRunner;

use super::fixtures::{clock_at, fast_coordinator, now, Harness, GROUP_A, GROUP_B};

fn short_wait_runner(h: &Harness, max_wait: Duration) -> SyncRunner {
    SyncRunner::builder()
        .store(h.store.clone())
        .directory(h.directory.clone())
        .lock(Arc::new(FileLock::new(&h.lock_path)))
        .exclusions(Arc::new(StaticExclusions::default()))
        .coordinator_config(fast_coordinator(max_wait))
        .clock(clock_at(now()))
        .build()
        .unwrap()
}

async fn lock_is_free(h: &Harness) -> bool {
    let checker = FileLock::new(&h.lock_path);
    match checker.try_acquire(Duration::ZERO).await.unwrap() {
        Some(token) => {
            checker.release(&token).await.unwrap();
            true
        }
        None => false,
    }
}

// ============================================================================
// Reconciliation Failures
// ============================================================================

#[tokio::test]
async fn test_missing_group_aborts_and_releases_lock() {
    let h = Harness::new();
    h.directory.create_group(GROUP_A);
    let alice = h.active(GROUP_A, "alice@example.com");
    h.active("ghost@example.com", "bob@example.com");

    let err = h.runner().run().await.unwrap_err();

    assert!(matches!(err, Error::GroupNotFound { ref group } if group == "ghost@example.com"));
    assert_eq!(err.category(), ErrorCategory::NotFound);
    assert!(lock_is_free(&h).await);

    // Nothing is written back for an aborted run
    assert_eq!(h.store.membership_name(alice).unwrap(), None);
    assert_eq!(h.store.last_operation().unwrap(), None);
}

#[tokio::test]
async fn test_list_failure_is_fatal() {
    let h = Harness::new();
    h.active(GROUP_A, "alice@example.com");
    h.directory.fail_list(GROUP_A);

    let err = h.runner().run().await.unwrap_err();

    assert!(matches!(err, Error::Directory(_)));
    assert_eq!(err.category(), ErrorCategory::Directory);
    assert_eq!(h.directory.calls().add, 0);
    assert!(lock_is_free(&h).await);
}

#[tokio::test]
async fn test_failed_remove_is_dropped() {
    let h = Harness::new();
    h.active(GROUP_B, "carol@example.com");
    h.directory.seed_member(GROUP_B, "mallory@example.com");
    h.directory.fail_remove("mallory@example.com");

    let report = h.runner().run().await.unwrap();

    assert_eq!(report.added_count(), 1);
    assert_eq!(report.removed_count(), 0);
    assert_eq!(h.members(GROUP_B), vec!["carol@example.com", "mallory@example.com"]);
}

// ============================================================================
// Coordination
// ============================================================================

#[tokio::test]
async fn test_held_lock_times_out_without_touching_directory() {
    let h = Harness::new();
    h.active(GROUP_A, "alice@example.com");

    let holder = FileLock::new(&h.lock_path);
    let token = holder.try_acquire(Duration::ZERO).await.unwrap().unwrap();

    let err = short_wait_runner(&h, Duration::from_millis(300))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout { .. }));
    assert_eq!(err.category(), ErrorCategory::Coordination);
    assert!(err.is_recoverable());
    assert_eq!(h.directory.calls().resolve, 0);

    holder.release(&token).await.unwrap();
    assert!(short_wait_runner(&h, Duration::from_millis(300)).run().await.is_ok());
}

#[tokio::test]
async fn test_maintenance_flag_blocks_until_timeout() {
    let h = Harness::new();
    h.active(GROUP_A, "alice@example.com");
    h.store.set_maintenance(true).unwrap();

    let err = short_wait_runner(&h, Duration::from_millis(300))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout { .. }));
    assert_eq!(h.directory.calls().resolve, 0);
    assert!(h.members(GROUP_A).is_empty());
}

#[tokio::test]
async fn test_run_proceeds_once_maintenance_clears() {
    let h = Harness::new();
    h.active(GROUP_A, "alice@example.com");
    h.store.set_maintenance(true).unwrap();

    let store = h.store.clone();
    let operator = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        store.set_maintenance(false).unwrap();
    });

    let report = short_wait_runner(&h, Duration::from_secs(3)).run().await.unwrap();
    operator.await.unwrap();

    assert_eq!(report.added_count(), 1);
    assert_eq!(h.members(GROUP_A), vec!["alice@example.com"]);
}

#[tokio::test]
async fn test_concurrent_runs_are_serialized() {
    let h = Harness::new();
    h.active(GROUP_A, "alice@example.com");
    h.active(GROUP_A, "bob@example.com");

    let first = h.runner();
    let second = h.runner();
    let (a, b) = tokio::join!(first.run(), second.run());

    let a = a.unwrap();
    let b = b.unwrap();
    // Exactly one run made the changes; the other found nothing to do
    assert_eq!(a.added_count() + b.added_count(), 2);
    assert_eq!(h.directory.calls().add, 2);
}

// ============================================================================
// Roster Store
// ============================================================================

#[tokio::test]
async fn test_missing_roster_is_a_config_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let err = SqliteRosterStore::open(dir.path().join("absent.db")).unwrap_err();

    assert!(matches!(err, Error::Roster(RosterError::NotFound(_))));
    assert_eq!(err.category(), ErrorCategory::Config);
    assert!(!err.is_recoverable());
}

#[tokio::test]
async fn test_reopened_roster_sees_flag_and_results() {
    let h = Harness::new();
    h.active(GROUP_A, "alice@example.com");
    h.runner().run().await.unwrap();
    h.store.set_maintenance(true).unwrap();

    let reopened = SqliteRosterStore::open(&h.roster_path).unwrap();
    assert!(reopened.maintenance_value().unwrap().is_set());
    assert_eq!(reopened.last_operation().unwrap(), Some(now()));
}
