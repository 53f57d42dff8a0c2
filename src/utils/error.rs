//! Error types for the roster-sync collaborators
//!
//! This module defines the errors raised by the remote directory client,
//! the roster store and the exclusive lock backends.

use thiserror::Error;

/// Errors that can occur while talking to the remote group directory
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Rate limit exceeded (HTTP 429)
    #[error("Rate limit exceeded")]
    RateLimit,

    /// Server error with status code
    #[error("Server error: {0}")]
    ServerError(u16),

    /// Client error with status code and response body
    #[error("Request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Response was missing a field the directory contract requires
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Invalid base URL or resource path
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Injected or backend-specific failure
    #[error("Directory operation failed: {0}")]
    Operation(String),
}

impl DirectoryError {
    /// Check if the error is transient and worth retrying at the transport level
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::RateLimit | Self::ServerError(_) => true,
            Self::Rejected { .. }
            | Self::MalformedResponse(_)
            | Self::InvalidUrl(_)
            | Self::Operation(_) => false,
        }
    }
}

/// Errors raised by the roster store
#[derive(Error, Debug)]
pub enum RosterError {
    /// Underlying SQLite failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The roster database does not exist
    #[error("Roster database not found: {0}")]
    NotFound(String),

    /// The connection mutex was poisoned by a panicking writer
    #[error("Roster store connection poisoned")]
    Poisoned,
}

/// Errors raised by exclusive lock backends
#[derive(Error, Debug)]
pub enum LockError {
    /// Lock file could not be opened or locked
    #[error("Lock file error at '{path}': {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Redis command failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis connection pool failure
    #[error("Redis pool error: {0}")]
    Pool(String),

    /// Release was called with a token that does not own the lock
    #[error("Lock token '{0}' does not hold the lock")]
    NotOwner(String),
}
