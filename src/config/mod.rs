//! Configuration management for roster-sync
//!
//! This module handles loading and validating configuration from environment variables,
//! TOML files, and command-line arguments.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lock::{
    CoordinatorConfig, RedisLockConfig, DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_BACKOFF_MS,
    DEFAULT_MAX_WAIT,
};
use crate::models::MemberEmail;
use crate::utils::retry::RetryConfig;
use crate::utils::split_list;

/// Environment variable holding the directory bearer token
pub const TOKEN_ENV: &str = "ROSTER_SYNC_DIRECTORY_TOKEN";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Roster store configuration
    pub roster: RosterConfig,

    /// Remote directory configuration
    pub directory: DirectoryConfig,

    /// Maintenance wait and exclusive lock configuration
    pub lock: LockConfig,

    /// Reconciliation configuration
    pub sync: SyncConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Roster store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    /// SQLite roster database path
    pub path: PathBuf,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/roster.db"),
        }
    }
}

/// Remote directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Base URL of the directory API
    pub base_url: String,

    /// Bearer token; never written back out
    #[serde(skip_serializing)]
    pub token: Option<String>,

    /// Rate limit (requests per second)
    pub requests_per_second: u32,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Retries for transient HTTP failures
    pub max_retries: u32,

    /// Page size when listing memberships
    pub page_size: u32,

    /// User agent string
    pub user_agent: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("https://cloudidentity.googleapis.com"),
            token: None,
            requests_per_second: 10,
            request_timeout_secs: 30,
            max_retries: 3,
            page_size: 200,
            user_agent: format!("roster-sync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Exclusive lock backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// Advisory lock file next to the roster database
    #[default]
    File,
    /// Redis lease, for runs spread across hosts
    Redis,
}

impl std::str::FromStr for LockBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "redis" => Ok(Self::Redis),
            other => anyhow::bail!("unknown lock backend: {other}"),
        }
    }
}

/// Maintenance wait and exclusive lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock backend
    pub backend: LockBackend,

    /// Lock file path (file backend); defaults to the roster path with `.lock`
    pub path: Option<PathBuf>,

    /// Redis lease settings (redis backend)
    pub redis: RedisLockConfig,

    /// Ceiling shared by the maintenance wait and lock acquisition
    pub max_wait_secs: u64,

    /// First backoff step
    pub initial_backoff_ms: u64,

    /// Backoff cap
    pub max_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::File,
            path: None,
            redis: RedisLockConfig::default(),
            max_wait_secs: DEFAULT_MAX_WAIT.as_secs(),
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

/// Reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Identities never added or removed by automation
    pub excluded_users: Vec<String>,

    /// Groups reconciled at the same time
    pub max_concurrent_groups: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            excluded_users: Vec::new(),
            max_concurrent_groups: 1,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Register Prometheus metrics
    pub enabled: bool,

    /// Write the registry here after every run (node-exporter textfile)
    pub textfile_path: Option<PathBuf>,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let roster_path = std::env::var("ROSTER_SYNC_ROSTER_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.roster.path);

        let directory = DirectoryConfig {
            base_url: std::env::var("ROSTER_SYNC_DIRECTORY_URL")
                .unwrap_or(defaults.directory.base_url),
            token: std::env::var(TOKEN_ENV).ok().filter(|t| !t.trim().is_empty()),
            requests_per_second: env_parse("ROSTER_SYNC_RATE_LIMIT")
                .unwrap_or(defaults.directory.requests_per_second),
            request_timeout_secs: env_parse("ROSTER_SYNC_REQUEST_TIMEOUT")
                .unwrap_or(defaults.directory.request_timeout_secs),
            max_retries: env_parse("ROSTER_SYNC_MAX_RETRIES")
                .unwrap_or(defaults.directory.max_retries),
            page_size: env_parse("ROSTER_SYNC_PAGE_SIZE").unwrap_or(defaults.directory.page_size),
            user_agent: std::env::var("ROSTER_SYNC_USER_AGENT")
                .unwrap_or(defaults.directory.user_agent),
        };

        let backend = match std::env::var("ROSTER_SYNC_LOCK_BACKEND") {
            Ok(v) => v.parse::<LockBackend>()?,
            Err(_) => defaults.lock.backend,
        };

        let mut redis = defaults.lock.redis;
        if let Ok(url) = std::env::var("REDIS_URL") {
            redis.url = url;
        }
        if let Some(ttl) = env_parse("ROSTER_SYNC_LEASE_TTL") {
            redis.lease_ttl_secs = ttl;
        }

        let lock = LockConfig {
            backend,
            path: std::env::var("ROSTER_SYNC_LOCK_PATH").ok().map(PathBuf::from),
            redis,
            max_wait_secs: env_parse("ROSTER_SYNC_MAX_WAIT").unwrap_or(defaults.lock.max_wait_secs),
            initial_backoff_ms: env_parse("ROSTER_SYNC_INITIAL_BACKOFF_MS")
                .unwrap_or(defaults.lock.initial_backoff_ms),
            max_backoff_ms: env_parse("ROSTER_SYNC_MAX_BACKOFF_MS")
                .unwrap_or(defaults.lock.max_backoff_ms),
        };

        let sync = SyncConfig {
            excluded_users: std::env::var("ROSTER_SYNC_EXCLUDED_USERS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            max_concurrent_groups: env_parse("ROSTER_SYNC_MAX_CONCURRENT_GROUPS")
                .unwrap_or(defaults.sync.max_concurrent_groups),
        };

        let logging = LoggingConfig {
            level: std::env::var("ROSTER_SYNC_LOG_LEVEL").unwrap_or(defaults.logging.level),
            format: std::env::var("ROSTER_SYNC_LOG_FORMAT").unwrap_or(defaults.logging.format),
        };

        let metrics = MetricsConfig {
            enabled: env_parse("ROSTER_SYNC_METRICS").unwrap_or(defaults.metrics.enabled),
            textfile_path: std::env::var("ROSTER_SYNC_METRICS_TEXTFILE")
                .ok()
                .map(PathBuf::from),
        };

        Ok(Self {
            roster: RosterConfig { path: roster_path },
            directory,
            lock,
            sync,
            logging,
            metrics,
        })
    }

    /// Load configuration from a file
    ///
    /// The directory token falls back to `ROSTER_SYNC_DIRECTORY_TOKEN` when
    /// the file does not carry one.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        if config.directory.token.is_none() {
            config.directory.token = std::env::var(TOKEN_ENV).ok().filter(|t| !t.trim().is_empty());
        }

        Ok(config)
    }

    /// Load from a file if given, otherwise from the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.roster.path.as_os_str().is_empty() {
            anyhow::bail!("roster.path must not be empty");
        }

        url::Url::parse(&self.directory.base_url)
            .with_context(|| format!("directory.base_url is not a URL: {}", self.directory.base_url))?;

        if self.directory.requests_per_second == 0 {
            anyhow::bail!("requests_per_second must be greater than 0");
        }

        if self.directory.page_size == 0 {
            anyhow::bail!("page_size must be greater than 0");
        }

        if self.lock.max_wait_secs == 0 {
            anyhow::bail!("max_wait_secs must be greater than 0");
        }

        if self.lock.initial_backoff_ms == 0 || self.lock.max_backoff_ms < self.lock.initial_backoff_ms {
            anyhow::bail!("backoff must start above 0 and max_backoff_ms must be >= initial_backoff_ms");
        }

        if self.sync.max_concurrent_groups == 0 {
            anyhow::bail!("max_concurrent_groups must be greater than 0");
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("logging.format must be 'text' or 'json'");
        }

        Ok(())
    }

    /// Timing for the maintenance wait and lock acquisition
    #[must_use]
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_wait: Duration::from_secs(self.lock.max_wait_secs),
            backoff: RetryConfig::with_delays(0, self.lock.initial_backoff_ms, self.lock.max_backoff_ms),
        }
    }

    /// Excluded identities as a set
    #[must_use]
    pub fn excluded_users(&self) -> BTreeSet<MemberEmail> {
        self.sync
            .excluded_users
            .iter()
            .map(MemberEmail::new)
            .filter(|m| !m.is_empty())
            .collect()
    }

    /// Lock file path for the file backend
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.lock
            .path
            .clone()
            .unwrap_or_else(|| self.roster.path.with_extension("lock"))
    }
}
