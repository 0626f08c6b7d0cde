//! Delta computation between the live and persisted snapshots.
//!
//! Identity is the content key, so:
//! - a rename or move (same name, size and mtime) produces no change;
//! - an edited file produces a new key, reported as the old record removed
//!   and the new record added in the same pass. There is no third change kind.

use crate::snapshot::{ImageRecord, Snapshot};

/// Added/removed delta for one reconciliation pass. No ordering is
/// guaranteed within either list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: Vec<ImageRecord>,
    pub removed: Vec<ImageRecord>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len()
    }
}

/// Set difference over keys, linear in `|live| + |persisted|`.
///
/// `added` holds the live record for every key only in `live`; `removed`
/// holds the persisted record for every key only in `persisted`. Records are
/// cloned out so the change set owns its data.
pub fn diff(live: &Snapshot, persisted: &Snapshot) -> ChangeSet {
    let added = live
        .records()
        .filter(|r| !persisted.contains_key(&r.content_key))
        .cloned()
        .collect();
    let removed = persisted
        .records()
        .filter(|r| !live.contains_key(&r.content_key))
        .cloned()
        .collect();
    ChangeSet { added, removed }
}
