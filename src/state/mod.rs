//! Durable storage for the persisted snapshot.
//!
//! SQLite keeps the last snapshot the remote catalog acknowledged, the
//! identity scheme it was written under, and a history of sync passes for
//! status reporting.

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{SqliteStateDb, StateDb};
pub use types::SyncRunStats;
