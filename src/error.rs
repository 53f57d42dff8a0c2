//! Unified error handling for the roster-sync crate
//!
//! This module provides a unified error type that consolidates the
//! coordination, reconciliation and collaborator errors into a single
//! `Error` enum, while keeping the collaborator-specific errors available
//! when callers need them.
//!
//! # Architecture
//!
//! - [`SyncErrorTrait`] - Common interface implemented by the unified error
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use roster_sync::error::{Error, ErrorCategory, SyncErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     if err.category() == ErrorCategory::Coordination {
//!         eprintln!("Another run or an operator holds the roster: {err}");
//!     }
//! }
//! ```

use std::io;
use std::time::Duration;
use thiserror::Error;

pub use crate::utils::error::{DirectoryError, LockError, RosterError};

/// Common trait for roster-sync error types
pub trait SyncErrorTrait: std::error::Error {
    /// Check if a later scheduled run can be expected to succeed
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Maintenance flag or exclusive lock could not be obtained in time
    Coordination,
    /// A declared group does not exist in the directory
    NotFound,
    /// Remote directory failures
    Directory,
    /// Roster store and I/O errors
    Storage,
    /// Configuration and validation errors
    Config,
}

impl ErrorCategory {
    /// Short label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordination => "coordination",
            Self::NotFound => "not_found",
            Self::Directory => "directory",
            Self::Storage => "storage",
            Self::Config => "config",
        }
    }
}

/// Unified error type for the roster-sync crate
#[derive(Error, Debug)]
pub enum Error {
    /// Maintenance wait or lock acquisition exceeded the shared ceiling
    #[error("Timed out waiting for {operation} after {}s", .elapsed.as_secs())]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// A declared group does not resolve in the remote directory
    #[error("Group not found in directory: {group}")]
    GroupNotFound { group: String },

    /// Remote directory errors
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Roster store errors
    #[error("Roster store error: {0}")]
    Roster(#[from] RosterError),

    /// Exclusive lock backend errors
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),
}

impl SyncErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::GroupNotFound { .. } => false,
            Self::Directory(e) => e.is_recoverable(),
            Self::Roster(RosterError::NotFound(_)) => false,
            Self::Roster(_) => true,
            Self::Lock(_) => true,
            Self::Io(_) => true, // I/O errors are often transient
            Self::Config(_) => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout { .. } | Self::Lock(_) => ErrorCategory::Coordination,
            Self::GroupNotFound { .. } => ErrorCategory::NotFound,
            Self::Directory(_) => ErrorCategory::Directory,
            Self::Roster(RosterError::NotFound(_)) | Self::Config(_) => ErrorCategory::Config,
            Self::Roster(_) | Self::Io(_) => ErrorCategory::Storage,
        }
    }
}

impl Error {
    /// Create a timeout error for a coordination step
    pub fn timeout(operation: &'static str, elapsed: Duration) -> Self {
        Self::Timeout { operation, elapsed }
    }

    /// Create a group-not-found error
    pub fn group_not_found(group: impl Into<String>) -> Self {
        Self::GroupNotFound {
            group: group.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

// Roster store failures that surface through rusqlite directly
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Roster(RosterError::Sqlite(err))
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        let timeout = Error::timeout("maintenance flag", Duration::from_secs(180));
        assert_eq!(timeout.category(), ErrorCategory::Coordination);

        let missing = Error::group_not_found("team@example.com");
        assert_eq!(missing.category(), ErrorCategory::NotFound);

        let store = Error::Roster(RosterError::NotFound("roster.db".to_string()));
        assert_eq!(store.category(), ErrorCategory::Config);
    }

    #[test]
    fn test_is_recoverable() {
        let timeout = Error::timeout("exclusive lock", Duration::from_secs(180));
        assert!(timeout.is_recoverable());

        let missing = Error::group_not_found("team@example.com");
        assert!(!missing.is_recoverable());
    }

    #[test]
    fn test_timeout_message() {
        let err = Error::timeout("maintenance flag", Duration::from_secs(180));
        assert_eq!(
            err.to_string(),
            "Timed out waiting for maintenance flag after 180s"
        );
    }

    #[test]
    fn test_error_conversion() {
        let dir_err = DirectoryError::RateLimit;
        let unified: Error = dir_err.into();
        assert!(matches!(unified, Error::Directory(_)));
        assert_eq!(unified.category(), ErrorCategory::Directory);
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("roster database path is empty");
        assert_eq!(err.category(), ErrorCategory::Config);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_category_labels() {
        assert_eq!(ErrorCategory::Coordination.as_str(), "coordination");
        assert_eq!(ErrorCategory::NotFound.as_str(), "not_found");
        assert_eq!(ErrorCategory::Storage.as_str(), "storage");
    }
}
