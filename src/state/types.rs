//! Row types for the state database.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Counts for a single reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRunStats {
    /// Remote adds confirmed.
    pub added: u64,
    /// Remote removes confirmed.
    pub removed: u64,
    /// Items that failed and stay queued for the next pass.
    pub failed: u64,
    /// Whether the pass was cut short (directory switched, shutdown).
    pub interrupted: bool,
}

/// A stored sync pass.
#[derive(Debug, Clone)]
pub struct SyncRunRecord {
    pub id: i64,
    pub directory: PathBuf,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stats: SyncRunStats,
}

/// Summary of the state database, for `imgsync status`.
#[derive(Debug, Clone, Default)]
pub struct StateSummary {
    /// Images in the persisted snapshot.
    pub total_images: u64,
    /// Total bytes of the persisted images.
    pub total_bytes: u64,
    /// When the persisted snapshot last changed.
    pub last_update: Option<DateTime<Utc>>,
    /// Last error recorded by the engine, if it has not been cleared.
    pub last_error: Option<String>,
    /// Identity scheme the snapshot was written under.
    pub identity_scheme: Option<String>,
    pub last_sync_started: Option<DateTime<Utc>>,
    pub last_sync_completed: Option<DateTime<Utc>>,
}
