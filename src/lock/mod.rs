//! Two-tier exclusion for reconciliation runs
//!
//! A run may only mutate the directory when two independent conditions hold:
//!
//! - the cooperative **maintenance flag** is clear. An operator sets it to
//!   pause automation while they edit the roster by hand. It is advisory and
//!   is polled, never cached.
//! - the run holds the hard **exclusive lock** for the roster, so two
//!   automated runs never mutate remote state concurrently.
//!
//! Both waits use the same exponential backoff (1s doubling, capped at 30s)
//! and draw from one [`Deadline`] measured from the start of the run.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │             ExclusionCoordinator             │
//! │   wait_until_maintenance_clear(&deadline)    │
//! │   acquire_exclusive_lock(&deadline)          │
//! └───────────┬──────────────────────┬───────────┘
//!             │                      │
//!      ┌──────▼──────┐        ┌──────▼─────────┐
//!      │ PauseSignal │        │ MutualExclusion│
//!      └──────┬──────┘        └──┬──────────┬──┘
//!             │                  │          │
//!     SqliteRosterStore      FileLock   RedisLock
//! ```

pub mod file;
pub mod lease;

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{Error, LockError, Result};
use crate::metrics;
use crate::utils::retry::RetryConfig;

pub use file::FileLock;
pub use lease::{RedisLock, RedisLockConfig};

/// Default ceiling shared by the maintenance wait and lock acquisition
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(3 * 60);

/// Default first backoff step
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1000;

/// Default backoff cap
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

// ============================================================================
// Capabilities
// ============================================================================

/// Cooperative pause switch controlled by humans
#[async_trait]
pub trait PauseSignal: Send + Sync {
    /// Read the flag. Implementations must not cache the value.
    async fn is_paused(&self) -> Result<bool>;
}

/// Hard exclusive lock scoped to one roster
#[async_trait]
pub trait MutualExclusion: Send + Sync {
    /// Try to take the lock, waiting at most `wait` for a holder to let go
    ///
    /// Returns `Ok(None)` when the lock is still held elsewhere after `wait`.
    async fn try_acquire(&self, wait: Duration) -> std::result::Result<Option<LockToken>, LockError>;

    /// Release a lock previously returned by `try_acquire`
    async fn release(&self, token: &LockToken) -> std::result::Result<(), LockError>;
}

// ============================================================================
// Flag values
// ============================================================================

/// Raw value of the maintenance flag as read from its store
#[derive(Debug, Clone, PartialEq)]
pub enum FlagValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl FlagValue {
    /// Interpret the value as "maintenance in progress"
    ///
    /// Text is set only for `ON`, `TRUE` or `1` (trimmed, any case). Other
    /// types follow their natural truthiness.
    pub fn is_set(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Integer(i) => *i != 0,
            Self::Real(f) => *f != 0.0 && !f.is_nan(),
            Self::Text(s) => matches!(
                s.trim().to_ascii_uppercase().as_str(),
                "ON" | "TRUE" | "1"
            ),
            Self::Blob(b) => !b.is_empty(),
        }
    }
}

impl From<rusqlite::types::Value> for FlagValue {
    fn from(value: rusqlite::types::Value) -> Self {
        use rusqlite::types::Value;
        match value {
            Value::Null => Self::Null,
            Value::Integer(i) => Self::Integer(i),
            Value::Real(f) => Self::Real(f),
            Value::Text(s) => Self::Text(s),
            Value::Blob(b) => Self::Blob(b),
        }
    }
}

// ============================================================================
// Deadline
// ============================================================================

/// Wall-clock budget shared by every wait of one run
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    ceiling: Duration,
}

impl Deadline {
    /// Start a budget now
    pub fn start_now(ceiling: Duration) -> Self {
        Self {
            start: Instant::now(),
            ceiling,
        }
    }

    /// Time since the run started
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time left before the ceiling
    pub fn remaining(&self) -> Duration {
        self.ceiling.saturating_sub(self.elapsed())
    }

    /// Whether the ceiling has been reached
    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.ceiling
    }

    /// Configured ceiling
    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

// ============================================================================
// Lock handle
// ============================================================================

/// Opaque proof of lock ownership
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Generate a fresh random token
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the token as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exclusive ownership of a run
///
/// `release` may be called any number of times; only the first call while
/// held reaches the backend. A handle dropped while still held schedules a
/// release on the current tokio runtime.
pub struct LockHandle {
    lock: Arc<dyn MutualExclusion>,
    token: LockToken,
    held: AtomicBool,
    attempts: u32,
}

impl LockHandle {
    fn new(lock: Arc<dyn MutualExclusion>, token: LockToken, attempts: u32) -> Self {
        Self {
            lock,
            token,
            held: AtomicBool::new(true),
            attempts,
        }
    }

    /// Token identifying this ownership
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// Whether the lock is still held by this handle
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Number of acquisition attempts it took to get the lock
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Release the lock. No-op if already released.
    pub async fn release(&self) -> Result<()> {
        if !self.held.swap(false, Ordering::SeqCst) {
            debug!(token = %self.token, "Lock already released");
            return Ok(());
        }

        self.lock.release(&self.token).await?;
        info!(token = %self.token, "Exclusive lock released");
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.held.swap(false, Ordering::SeqCst) {
            return;
        }

        warn!(token = %self.token, "Lock handle dropped while held, releasing in background");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let lock = Arc::clone(&self.lock);
            let token = self.token.clone();
            runtime.spawn(async move {
                if let Err(e) = lock.release(&token).await {
                    warn!(token = %token, error = %e, "Background lock release failed");
                }
            });
        }
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("token", &self.token)
            .field("held", &self.is_held())
            .field("attempts", &self.attempts)
            .finish()
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Timing parameters for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Ceiling shared by both waits, measured from run start
    pub max_wait: Duration,

    /// Backoff schedule between polls and attempts
    pub backoff: RetryConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_MAX_WAIT,
            backoff: RetryConfig::with_delays(0, DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_BACKOFF_MS),
        }
    }
}

/// Combines the pause signal and the exclusive lock under one deadline
pub struct ExclusionCoordinator {
    pause: Arc<dyn PauseSignal>,
    lock: Arc<dyn MutualExclusion>,
    config: CoordinatorConfig,
}

impl ExclusionCoordinator {
    /// Create a coordinator with default timing
    pub fn new(pause: Arc<dyn PauseSignal>, lock: Arc<dyn MutualExclusion>) -> Self {
        Self::with_config(pause, lock, CoordinatorConfig::default())
    }

    /// Create a coordinator with custom timing
    pub fn with_config(
        pause: Arc<dyn PauseSignal>,
        lock: Arc<dyn MutualExclusion>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            pause,
            lock,
            config,
        }
    }

    /// Start the shared budget for a new run
    pub fn start_deadline(&self) -> Deadline {
        Deadline::start_now(self.config.max_wait)
    }

    /// Fresh read of the maintenance flag
    pub async fn check_maintenance_flag(&self) -> Result<bool> {
        self.pause.is_paused().await
    }

    /// Block until the maintenance flag reads clear
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` once the deadline is reached with the flag
    /// still set. Never returns it earlier.
    pub async fn wait_until_maintenance_clear(&self, deadline: &Deadline) -> Result<()> {
        let mut backoff = self.config.backoff.backoff();

        loop {
            if !self.check_maintenance_flag().await? {
                if backoff.steps() > 0 {
                    info!(
                        elapsed_ms = deadline.elapsed().as_millis() as u64,
                        polls = backoff.steps() + 1,
                        "Maintenance flag cleared"
                    );
                }
                metrics::record_maintenance_wait(deadline.elapsed().as_secs_f64());
                return Ok(());
            }

            if deadline.is_expired() {
                let elapsed = deadline.elapsed();
                error!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    ceiling_secs = deadline.ceiling().as_secs(),
                    "Maintenance flag still set at deadline"
                );
                return Err(Error::timeout("maintenance flag to clear", elapsed));
            }

            let delay = backoff.advance().min(deadline.remaining());
            warn!(
                delay_ms = delay.as_millis() as u64,
                elapsed_ms = deadline.elapsed().as_millis() as u64,
                "Roster is in maintenance mode, waiting"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Acquire the exclusive lock within the remaining budget
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` if the deadline is reached without the lock,
    /// or `Error::Lock` if the backend fails.
    pub async fn acquire_exclusive_lock(&self, deadline: &Deadline) -> Result<LockHandle> {
        let mut backoff = self.config.backoff.backoff();
        let mut attempts = 0u32;

        while !deadline.is_expired() {
            attempts += 1;
            let wait = backoff.current().min(deadline.remaining());

            if let Some(token) = self.lock.try_acquire(wait).await? {
                let elapsed = deadline.elapsed();
                info!(
                    attempts = attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    token = %token,
                    "Exclusive lock acquired"
                );
                metrics::record_lock_wait(elapsed.as_secs_f64());
                return Ok(LockHandle::new(Arc::clone(&self.lock), token, attempts));
            }

            let delay = backoff.advance().min(deadline.remaining());
            warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Exclusive lock busy, retrying"
            );
            tokio::time::sleep(delay).await;
        }

        let elapsed = deadline.elapsed();
        error!(
            attempts = attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            "Could not acquire exclusive lock before deadline"
        );
        Err(Error::timeout("exclusive lock", elapsed))
    }
}
