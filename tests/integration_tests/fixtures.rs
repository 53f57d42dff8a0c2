//! Test fixtures for integration tests
//!
//! Provides a file-backed roster, an in-memory directory and runner wiring

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use roster_sync::directory::InMemoryDirectory;
use roster_sync::lock::{CoordinatorConfig, FileLock};
use roster_sync::storage::{SqliteRosterStore, StaticExclusions};
use roster_sync::sync::{Clock, SyncRunner};
use roster_sync::utils::retry::RetryConfig;

pub const GROUP_A: &str = "eng@example.com";
pub const GROUP_B: &str = "ops@example.com";

/// Reference "now" for every fixture run
pub fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-06-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn clock_at(at: DateTime<Utc>) -> Clock {
    Arc::new(move || at)
}

/// Short waits so contention tests finish quickly
pub fn fast_coordinator(max_wait: Duration) -> CoordinatorConfig {
    CoordinatorConfig {
        max_wait,
        backoff: RetryConfig::with_delays(0, 20, 100),
    }
}

fn sheet_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Roster database, lock file and directory in one temp dir
pub struct Harness {
    _dir: TempDir,
    pub roster_path: PathBuf,
    pub lock_path: PathBuf,
    pub store: Arc<SqliteRosterStore>,
    pub directory: Arc<InMemoryDirectory>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let roster_path = dir.path().join("roster.db");
        let store = Arc::new(SqliteRosterStore::create(&roster_path).unwrap());
        let lock_path = roster_path.with_extension("lock");

        Self {
            _dir: dir,
            roster_path,
            lock_path,
            store,
            directory: Arc::new(InMemoryDirectory::new()),
        }
    }

    /// Row whose window covers [`now`]
    pub fn active(&self, group: &str, member: &str) -> i64 {
        let now = now();
        self.store
            .insert_row(
                group,
                member,
                sheet_time(now - ChronoDuration::days(1)),
                sheet_time(now + ChronoDuration::days(1)),
            )
            .unwrap()
    }

    /// Row whose window ended before [`now`]
    pub fn expired(&self, group: &str, member: &str) -> i64 {
        let now = now();
        self.store
            .insert_row(
                group,
                member,
                sheet_time(now - ChronoDuration::days(10)),
                sheet_time(now - ChronoDuration::days(1)),
            )
            .unwrap()
    }

    pub fn runner(&self) -> SyncRunner {
        self.runner_with(&[], now(), 1)
    }

    pub fn runner_with(&self, excluded: &[&str], at: DateTime<Utc>, concurrency: usize) -> SyncRunner {
        SyncRunner::builder()
            .store(self.store.clone())
            .directory(self.directory.clone())
            .lock(Arc::new(FileLock::new(&self.lock_path)))
            .exclusions(Arc::new(StaticExclusions::new(excluded.iter().copied())))
            .coordinator_config(fast_coordinator(Duration::from_secs(2)))
            .max_concurrent_groups(concurrency)
            .clock(clock_at(at))
            .build()
            .unwrap()
    }

    pub fn members(&self, group: &str) -> Vec<String> {
        self.directory
            .members(group)
            .into_iter()
            .map(|m| m.to_string())
            .collect()
    }
}

/// Operation body returned by a successful membership create
pub fn operation_json(membership: &str) -> serde_json::Value {
    serde_json::json!({
        "done": true,
        "response": {
            "name": membership,
            "preferredMemberKey": { "id": "ignored@example.com" }
        }
    })
}

pub fn membership_json(name: &str, member: &str) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "preferredMemberKey": { "id": member },
        "roles": [{ "name": "MEMBER" }]
    })
}
