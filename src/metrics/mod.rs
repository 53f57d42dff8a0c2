//! Prometheus metrics for roster reconciliation runs
//!
//! This module provides metrics tracking for:
//! - Coordination: time spent waiting on the maintenance flag and the lock
//! - Runs: outcome counts and durations
//! - Reconciliation: members added/removed, dropped directory operations
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.
//!
//! A one-shot `sync` has no scrape endpoint, so the CLI can dump the
//! registry to a node-exporter textfile with [`write_textfile`] when a run
//! finishes.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec,
    TextEncoder,
};
use std::path::Path;
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all roster-sync metrics
struct SyncMetrics {
    maintenance_wait: Histogram,
    lock_wait: Histogram,
    runs: CounterVec,
    run_duration: HistogramVec,
    groups_reconciled: Counter,
    members_changed: CounterVec,
    dropped_operations: CounterVec,
    last_change: Gauge,
}

/// Global storage for metrics
static SYNC_METRICS: OnceLock<SyncMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

const WAIT_BUCKETS: &[f64] = &[0.0, 1.0, 3.0, 7.0, 15.0, 31.0, 61.0, 91.0, 121.0, 151.0, 180.0];

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup.
/// If metric registration fails, errors are logged and subsequent
/// metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = roster_sync::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = SyncMetrics {
        maintenance_wait: register_histogram!(
            "roster_sync_maintenance_wait_seconds",
            "Time spent waiting for the maintenance flag to clear",
            WAIT_BUCKETS.to_vec()
        )?,
        lock_wait: register_histogram!(
            "roster_sync_lock_wait_seconds",
            "Time from run start until the exclusive lock was held",
            WAIT_BUCKETS.to_vec()
        )?,
        runs: register_counter_vec!(
            "roster_sync_runs_total",
            "Total reconciliation runs by outcome",
            &["outcome"]
        )?,
        run_duration: register_histogram_vec!(
            "roster_sync_run_duration_seconds",
            "Run duration in seconds by outcome",
            &["outcome"],
            vec![0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 180.0, 300.0, 600.0]
        )?,
        groups_reconciled: register_counter!(
            "roster_sync_groups_reconciled_total",
            "Total groups reconciled without a fatal error"
        )?,
        members_changed: register_counter_vec!(
            "roster_sync_members_changed_total",
            "Total memberships created or deleted",
            &["change"]
        )?,
        dropped_operations: register_counter_vec!(
            "roster_sync_dropped_operations_total",
            "Directory mutations that failed and were skipped for this run",
            &["operation"]
        )?,
        last_change: register_gauge!(
            "roster_sync_last_change_timestamp_seconds",
            "Unix time of the last run that changed any membership"
        )?,
    };

    SYNC_METRICS
        .set(metrics)
        .map_err(|_| "Sync metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    SYNC_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Write the encoded registry to a textfile-collector file
///
/// Writes to a sibling temp file first and renames it into place, so a
/// scraper never reads a half-written file.
pub fn write_textfile(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let text = encode_metrics()?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Record how long the run waited for the maintenance flag
pub fn record_maintenance_wait(seconds: f64) {
    if let Some(m) = SYNC_METRICS.get() {
        m.maintenance_wait.observe(seconds);
    }
}

/// Record how long the run took to hold the exclusive lock
pub fn record_lock_wait(seconds: f64) {
    if let Some(m) = SYNC_METRICS.get() {
        m.lock_wait.observe(seconds);
    }
}

/// Record a finished run
pub fn record_run(outcome: &str, duration_secs: f64) {
    let Some(m) = SYNC_METRICS.get() else {
        return;
    };

    m.runs.with_label_values(&[outcome]).inc();
    m.run_duration
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

/// Record the mutations applied to one group
pub fn record_group_result(added: usize, removed: usize) {
    let Some(m) = SYNC_METRICS.get() else {
        return;
    };

    m.groups_reconciled.inc();
    if added > 0 {
        m.members_changed
            .with_label_values(&["added"])
            .inc_by(added as f64);
    }
    if removed > 0 {
        m.members_changed
            .with_label_values(&["removed"])
            .inc_by(removed as f64);
    }
}

/// Record a directory mutation that failed and was dropped
pub fn record_dropped_operation(operation: &str) {
    if let Some(m) = SYNC_METRICS.get() {
        m.dropped_operations.with_label_values(&[operation]).inc();
    }
}

/// Update the last-change timestamp gauge
pub fn set_last_change(unix_seconds: i64) {
    if let Some(m) = SYNC_METRICS.get() {
        m.last_change.set(unix_seconds as f64);
    }
}

// ============================================================================
// Tests
// ============================================================================
