//! Run orchestration
//!
//! One run is:
//!
//! 1. load excluded identities
//! 2. wait for the maintenance flag to clear
//! 3. take the exclusive lock (same deadline as step 2)
//! 4. load the roster, partition by group, reconcile each group
//! 5. write results back and record the last change time
//! 6. release the lock, whatever happened in 4 and 5
//!
//! [`SyncRunner::watch`] repeats runs on an interval. A stop request is only
//! honoured between runs; a run in progress always finishes.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use super::engine::{GroupPlan, Reconciler};
use crate::directory::DirectoryClient;
use crate::error::{Error, Result, SyncErrorTrait};
use crate::lock::{CoordinatorConfig, ExclusionCoordinator, MutualExclusion, PauseSignal};
use crate::metrics;
use crate::models::{GroupEmail, MemberEmail, RosterRow, SyncResult};
use crate::storage::{ExclusionSource, ResultSink, RosterSource};

/// Source of "now" for window evaluation and the last change time
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// How a successful run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The roster had no usable rows; the directory was not contacted
    NoRows,
    /// Every group already matched the roster
    Unchanged,
    /// At least one membership was created or deleted
    Changed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoRows => "no_rows",
            Self::Unchanged => "unchanged",
            Self::Changed => "changed",
        }
    }
}

/// Summary of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    /// Well-formed roster rows loaded
    pub rows: usize,
    /// Distinct groups reconciled
    pub groups: usize,
    /// Per-group outcomes in first-appearance order
    pub results: Vec<SyncResult>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn added_count(&self) -> usize {
        self.results.iter().map(|r| r.added.len()).sum()
    }

    pub fn removed_count(&self) -> usize {
        self.results.iter().map(|r| r.removed.len()).sum()
    }
}

/// Split rows by group, keeping groups in order of first appearance
pub fn partition_by_group(rows: &[RosterRow]) -> Vec<(GroupEmail, Vec<RosterRow>)> {
    let mut index: HashMap<&GroupEmail, usize> = HashMap::new();
    let mut groups: Vec<(GroupEmail, Vec<RosterRow>)> = Vec::new();

    for row in rows {
        match index.get(&row.group) {
            Some(&i) => groups[i].1.push(row.clone()),
            None => {
                index.insert(&row.group, groups.len());
                groups.push((row.group.clone(), vec![row.clone()]));
            }
        }
    }

    groups
}

/// Computes per-group diffs without waiting, locking or mutating
pub struct SyncPlanner {
    source: Arc<dyn RosterSource>,
    exclusions: Arc<dyn ExclusionSource>,
    reconciler: Reconciler,
    clock: Clock,
}

impl SyncPlanner {
    /// Compute every group's diff against a fresh directory snapshot
    pub async fn plan(&self) -> Result<Vec<GroupPlan>> {
        let excluded = self.exclusions.load().await?;
        let rows = self.source.load().await?;
        let now = (self.clock)();

        let mut plans = Vec::new();
        for (group, group_rows) in partition_by_group(&rows) {
            plans.push(
                self.reconciler
                    .plan_group(&group, &group_rows, &excluded, now)
                    .await?,
            );
        }
        Ok(plans)
    }
}

/// Drives complete reconciliation runs
pub struct SyncRunner {
    planner: SyncPlanner,
    sink: Arc<dyn ResultSink>,
    coordinator: ExclusionCoordinator,
    max_concurrent_groups: usize,
}

impl SyncRunner {
    pub fn builder() -> SyncRunnerBuilder {
        SyncRunnerBuilder::new()
    }

    /// Execute one run
    ///
    /// # Errors
    ///
    /// - `Error::Timeout` if the maintenance flag or the lock is not obtained in time
    /// - `Error::GroupNotFound` if any declared group does not resolve
    /// - collaborator errors from the roster, the directory listing or the sink
    ///
    /// The lock is released before any of these are returned.
    pub async fn run(&self) -> Result<RunReport> {
        let started = Instant::now();
        let outcome = self.run_inner(started).await;
        let elapsed = started.elapsed();

        match &outcome {
            Ok(report) => {
                metrics::record_run(report.status.as_str(), elapsed.as_secs_f64());
                info!(
                    status = report.status.as_str(),
                    rows = report.rows,
                    groups = report.groups,
                    added = report.added_count(),
                    removed = report.removed_count(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Sync run finished"
                );
            }
            Err(e) => {
                metrics::record_run("failed", elapsed.as_secs_f64());
                error!(
                    category = e.category().as_str(),
                    recoverable = e.is_recoverable(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "Sync run failed"
                );
            }
        }

        outcome
    }

    async fn run_inner(&self, started: Instant) -> Result<RunReport> {
        // Configuration problems surface before anything is waited on or locked
        let excluded = self.planner.exclusions.load().await?;

        let deadline = self.coordinator.start_deadline();
        self.coordinator.wait_until_maintenance_clear(&deadline).await?;
        let lock = self.coordinator.acquire_exclusive_lock(&deadline).await?;

        let outcome = self.run_locked(&excluded, started).await;

        if let Err(e) = lock.release().await {
            error!(token = %lock.token(), error = %e, "Failed to release exclusive lock");
        }

        outcome
    }

    async fn run_locked(
        &self,
        excluded: &BTreeSet<MemberEmail>,
        started: Instant,
    ) -> Result<RunReport> {
        let rows = self.planner.source.load().await?;
        if rows.is_empty() {
            info!("Roster has no usable rows, nothing to reconcile");
            return Ok(RunReport {
                status: RunStatus::NoRows,
                rows: 0,
                groups: 0,
                results: Vec::new(),
                elapsed: started.elapsed(),
            });
        }

        let now = (self.planner.clock)();
        let groups = partition_by_group(&rows);
        info!(
            rows = rows.len(),
            groups = groups.len(),
            excluded = excluded.len(),
            now = %now.to_rfc3339(),
            "Reconciling roster"
        );

        // The first failing group drops the stream, cancelling the rest
        let results: Vec<SyncResult> = stream::iter(groups.iter())
            .map(|(group, group_rows)| {
                self.planner
                    .reconciler
                    .reconcile_group(group, group_rows, excluded, now)
            })
            .buffered(self.max_concurrent_groups)
            .try_collect()
            .await?;

        self.sink.write_results(&rows, &results).await?;

        let changed = results.iter().any(SyncResult::has_changes);
        if changed {
            let at = (self.planner.clock)();
            self.sink.record_last_change(at).await?;
            metrics::set_last_change(at.timestamp());
        }

        Ok(RunReport {
            status: if changed {
                RunStatus::Changed
            } else {
                RunStatus::Unchanged
            },
            rows: rows.len(),
            groups: groups.len(),
            results,
            elapsed: started.elapsed(),
        })
    }

    /// Compute every group's diff without waiting, locking or mutating
    pub async fn plan(&self) -> Result<Vec<GroupPlan>> {
        self.planner.plan().await
    }

    /// Run every `interval` until `shutdown` resolves, returning the number of runs
    ///
    /// The first run starts immediately. `shutdown` is watched during runs
    /// as well, but a run that has started is never cancelled: it finishes,
    /// writes its results and releases the lock before the loop exits.
    /// Each outcome, failed or not, is handed to `on_run`.
    pub async fn watch<S, F>(&self, interval: Duration, shutdown: S, mut on_run: F) -> usize
    where
        S: Future<Output = ()>,
        F: FnMut(Result<RunReport>),
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut runs = 0;
        let mut stop_requested = false;

        while !stop_requested {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut shutdown => break,
            }

            let run = self.run();
            tokio::pin!(run);
            let outcome = tokio::select! {
                outcome = &mut run => outcome,
                _ = &mut shutdown => {
                    info!("Stop requested, finishing the current run first");
                    stop_requested = true;
                    run.as_mut().await
                }
            };

            runs += 1;
            on_run(outcome);
        }

        info!(runs, "Watch stopped");
        runs
    }
}

/// Builder for [`SyncRunner`]
pub struct SyncRunnerBuilder {
    source: Option<Arc<dyn RosterSource>>,
    sink: Option<Arc<dyn ResultSink>>,
    pause: Option<Arc<dyn PauseSignal>>,
    exclusions: Option<Arc<dyn ExclusionSource>>,
    directory: Option<Arc<dyn DirectoryClient>>,
    lock: Option<Arc<dyn MutualExclusion>>,
    coordinator_config: CoordinatorConfig,
    max_concurrent_groups: usize,
    clock: Option<Clock>,
}

impl SyncRunnerBuilder {
    pub fn new() -> Self {
        Self {
            source: None,
            sink: None,
            pause: None,
            exclusions: None,
            directory: None,
            lock: None,
            coordinator_config: CoordinatorConfig::default(),
            max_concurrent_groups: 1,
            clock: None,
        }
    }

    /// Use one store as roster source, result sink and pause signal
    pub fn store<S>(self, store: Arc<S>) -> Self
    where
        S: RosterSource + ResultSink + PauseSignal + 'static,
    {
        self.roster(store.clone())
            .sink(store.clone())
            .pause(store)
    }

    pub fn roster(mut self, source: Arc<dyn RosterSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn pause(mut self, pause: Arc<dyn PauseSignal>) -> Self {
        self.pause = Some(pause);
        self
    }

    pub fn exclusions(mut self, exclusions: Arc<dyn ExclusionSource>) -> Self {
        self.exclusions = Some(exclusions);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn DirectoryClient>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn lock(mut self, lock: Arc<dyn MutualExclusion>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Set the shared wait ceiling and backoff
    pub fn coordinator_config(mut self, config: CoordinatorConfig) -> Self {
        self.coordinator_config = config;
        self
    }

    /// Set how many groups are reconciled at once (minimum 1)
    pub fn max_concurrent_groups(mut self, n: usize) -> Self {
        if n == 0 {
            warn!("max_concurrent_groups of 0 treated as 1");
        }
        self.max_concurrent_groups = n.max(1);
        self
    }

    /// Override the wall clock
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the runner
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a required collaborator is missing.
    pub fn build(mut self) -> Result<SyncRunner> {
        let sink = required(self.sink.take(), "result sink")?;
        let pause = required(self.pause.take(), "pause signal")?;
        let lock = required(self.lock.take(), "lock backend")?;
        let coordinator_config = self.coordinator_config.clone();
        let max_concurrent_groups = self.max_concurrent_groups;

        Ok(SyncRunner {
            planner: self.build_planner()?,
            sink,
            coordinator: ExclusionCoordinator::with_config(pause, lock, coordinator_config),
            max_concurrent_groups,
        })
    }

    /// Build a planner; only the roster, exclusions and directory are needed
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if one of those is missing.
    pub fn build_planner(self) -> Result<SyncPlanner> {
        Ok(SyncPlanner {
            source: required(self.source, "roster source")?,
            exclusions: required(self.exclusions, "exclusion source")?,
            reconciler: Reconciler::new(required(self.directory, "directory client")?),
            clock: self.clock.unwrap_or_else(|| Arc::new(Utc::now) as Clock),
        })
    }
}

fn required<T>(value: Option<T>, name: &str) -> Result<T> {
    value.ok_or_else(|| Error::config(format!("sync runner requires a {name}")))
}

impl Default for SyncRunnerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
