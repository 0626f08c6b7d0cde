//! Error types for the state database.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Cannot open state database {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Cannot create state directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State database schema update failed: {0}")]
    Schema(#[source] rusqlite::Error),

    #[error("State database query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("State database schema version {found} is newer than this build understands ({supported})")]
    UnsupportedSchemaVersion { found: i32, supported: i32 },

    /// The persisted snapshot was written under a different identity scheme
    /// (for example keyed by path). Resolved by a one-time reset.
    #[error("Persisted snapshot uses identity scheme '{found}', expected '{expected}'")]
    SchemeMismatch { found: String, expected: &'static str },

    #[error("State database lock poisoned")]
    Poisoned,

    #[error("State database task failed: {0}")]
    Spawn(#[from] tokio::task::JoinError),
}
