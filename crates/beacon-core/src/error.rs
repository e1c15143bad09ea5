//! Error types for beacon-core.
//!
//! Each subsystem has its own leaf enum; [`CoreError`] is the union an
//! embedder propagates with `?`.

use std::path::PathBuf;
use thiserror::Error;

/// Union of every error the library surfaces.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Request store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Launch resolution errors
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Request-store specific errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to open the backing database
    #[error("Failed to open request store at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Store migration failed: {0}")]
    MigrationFailed(String),

    /// Store is locked by another writer
    #[error("Request store is locked")]
    Locked,
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Missing required configuration key
    #[error("Missing required configuration key: {0}")]
    MissingKey(String),

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),
}

/// Launch-resolution specific errors.
///
/// These are almost always swallowed at the call site: a launch that cannot
/// be resolved degrades to its unresolved form rather than failing the
/// session. They exist so the degraded path can log what went wrong.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The resolution endpoint could not be reached
    #[error("Resolution request failed: {0}")]
    RequestFailed(String),

    /// The resolution endpoint answered with a non-success status
    #[error("Resolution endpoint returned {status}")]
    BadStatus { status: u16 },

    /// The resolution response body was not the expected JSON shape
    #[error("Malformed resolution response: {0}")]
    MalformedResponse(String),

    /// Bounded wait elapsed before the resolution completed
    #[error("Resolution timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },
}

// Helper implementations for converting from other error types

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(err, _msg) => {
                if err.code == rusqlite::ErrorCode::DatabaseLocked {
                    StoreError::Locked
                } else {
                    StoreError::QueryFailed(err.to_string())
                }
            }
            _ => StoreError::QueryFailed(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for ResolveError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ResolveError::Timeout { timeout_secs: 5 }
        } else {
            ResolveError::RequestFailed(err.to_string())
        }
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
