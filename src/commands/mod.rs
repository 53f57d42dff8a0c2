pub mod admin;
pub mod run;
pub mod watch;

use anyhow::{Context, Result};
use std::sync::Arc;

use roster_sync::config::{Config, LockBackend};
use roster_sync::directory::HttpDirectoryClient;
use roster_sync::lock::{FileLock, MutualExclusion, RedisLock};
use roster_sync::metrics;
use roster_sync::storage::{SqliteRosterStore, StaticExclusions};
use roster_sync::sync::{SyncPlanner, SyncRunner, SyncRunnerBuilder};

// Re-export command functions for convenience
pub use admin::{init, pause, resume, status};
pub use run::{plan, sync};
pub use watch::watch;

/// Builder with the roster, directory and exclusions wired from configuration
///
/// The roster database must already exist; `init` creates it.
fn runner_builder(config: &Config) -> Result<SyncRunnerBuilder> {
    let store = Arc::new(
        SqliteRosterStore::open(&config.roster.path).with_context(|| {
            format!(
                "Failed to open roster {} (run `roster-sync init` first)",
                config.roster.path.display()
            )
        })?,
    );

    let directory = Arc::new(
        HttpDirectoryClient::new(&config.directory)
            .context("Failed to create directory client")?,
    );

    Ok(SyncRunner::builder()
        .store(store)
        .directory(directory)
        .exclusions(Arc::new(StaticExclusions::new(config.excluded_users())))
        .coordinator_config(config.coordinator_config())
        .max_concurrent_groups(config.sync.max_concurrent_groups))
}

/// Wire a runner, including the configured lock backend
pub async fn build_runner(config: &Config) -> Result<SyncRunner> {
    let lock: Arc<dyn MutualExclusion> = match config.lock.backend {
        LockBackend::File => Arc::new(FileLock::new(config.lock_path())),
        LockBackend::Redis => Arc::new(
            RedisLock::connect(&config.lock.redis, &lock_resource(config))
                .await
                .context("Failed to connect to Redis lock backend")?,
        ),
    };

    Ok(runner_builder(config)?.lock(lock).build()?)
}

/// Wire a planner; no lock backend is contacted
pub fn build_planner(config: &Config) -> Result<SyncPlanner> {
    Ok(runner_builder(config)?.build_planner()?)
}

/// Lease resource name for the Redis backend, one per roster
fn lock_resource(config: &Config) -> String {
    config
        .roster
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "roster".to_string())
}

pub fn init_metrics(config: &Config) {
    if !config.metrics.enabled {
        return;
    }
    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed");
    }
}

/// Write the metrics textfile if one is configured
pub fn publish_metrics(config: &Config) {
    let Some(path) = config.metrics.textfile_path.as_deref() else {
        return;
    };
    if !metrics::metrics_initialized() {
        return;
    }
    if let Err(e) = metrics::write_textfile(path) {
        tracing::warn!(path = %path.display(), error = %e, "Failed to write metrics textfile");
    }
}
