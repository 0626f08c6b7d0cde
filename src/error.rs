//! Engine-level error taxonomy.

use std::path::PathBuf;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::key::{ContentKey, KeyError};
use crate::lifecycle::{LibraryStatus, LifecycleEvent, Phase};
use crate::state::error::StateError;

/// Errors surfaced by the reconciliation engine.
///
/// Per-item failures inside a sync batch are not returned through this type
/// as a whole-batch error; they are recorded in the batch report instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input to content key derivation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] KeyError),

    /// Scan, read or cache failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Network or catalog failure for one item; carries the key for retry.
    #[error("Remote catalog failed for {key}: {source}")]
    Remote {
        key: ContentKey,
        #[source]
        source: CatalogError,
    },

    /// A run was requested while one was already in flight.
    #[error("{phase} already in progress, try again later")]
    ConcurrencyRejected { phase: Phase },

    /// The lifecycle state machine refused an event.
    #[error("Cannot handle {event:?} while {status}")]
    Lifecycle {
        status: LibraryStatus,
        event: LifecycleEvent,
    },

    /// Persisted snapshot database failure (includes identity scheme checks).
    #[error(transparent)]
    State(#[from] StateError),

    #[error("Cannot watch directory: {0}")]
    Watch(#[from] notify::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_concurrency_rejected(&self) -> bool {
        matches!(self, Self::ConcurrencyRejected { .. })
    }
}
