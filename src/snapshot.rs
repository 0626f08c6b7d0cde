//! Snapshots of "what images exist", keyed by content key.
//!
//! [`SnapshotStore`] owns the two halves the engine reconciles:
//! - the *live* snapshot, rebuilt by a full scan and patched by watch events;
//! - the *persisted* snapshot, the last state the remote catalog acknowledged.
//!
//! The halves never share records: reads hand out clones, so a pending
//! mutation on one side is never observed through the other. Live patches are
//! tagged with the generation they were produced under; a full rebuild bumps
//! the generation and stale patches are dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::key::{ContentKey, KeyError};
use crate::scan::ImageInfo;

/// One observed image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    /// Absolute path of the file when it was observed.
    pub file_path: PathBuf,
    pub file_name: String,
    /// Derived from `(file_name, size, modified_ms)`; never from the path.
    pub content_key: ContentKey,
    /// File size in bytes.
    pub size: u64,
    /// Modification time in epoch milliseconds.
    pub modified_ms: i64,
    /// Creation time in epoch milliseconds, when the platform reports it.
    pub created_ms: Option<i64>,
}

impl ImageRecord {
    /// Build a record from observed metadata, deriving its content key.
    pub fn from_info(info: ImageInfo) -> Result<Self, KeyError> {
        let content_key = ContentKey::for_file(&info.file_name, info.size, info.modified_ms)?;
        Ok(Self {
            file_path: info.file_path,
            file_name: info.file_name,
            content_key,
            size: info.size,
            modified_ms: info.modified_ms,
            created_ms: info.created_ms,
        })
    }

    /// Directory containing the file, with forward slashes, as the catalog
    /// expects it.
    pub fn source_dir(&self) -> String {
        self.file_path
            .parent()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default()
    }
}

/// Mapping from content key to record. Insertion order is irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    records: HashMap<ContentKey, ImageRecord>,
    /// Path -> key of the record currently observed at that path.
    by_path: HashMap<PathBuf, ContentKey>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record under its own content key, replacing any record that
    /// already holds the key.
    pub fn put(&mut self, record: ImageRecord) -> Option<ImageRecord> {
        let key = record.content_key.clone();
        self.by_path.insert(record.file_path.clone(), key.clone());
        let previous = self.records.insert(key.clone(), record);
        if let Some(prev) = &previous {
            let moved = self
                .records
                .get(&key)
                .is_some_and(|r| r.file_path != prev.file_path);
            if moved && self.by_path.get(&prev.file_path) == Some(&key) {
                self.by_path.remove(&prev.file_path);
            }
        }
        previous
    }

    pub fn remove(&mut self, key: &ContentKey) -> Option<ImageRecord> {
        let record = self.records.remove(key)?;
        if self.by_path.get(&record.file_path) == Some(key) {
            self.by_path.remove(&record.file_path);
        }
        Some(record)
    }

    pub fn get(&self, key: &ContentKey) -> Option<&ImageRecord> {
        self.records.get(key)
    }

    pub fn contains_key(&self, key: &ContentKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ContentKey> {
        self.records.keys()
    }

    pub fn records(&self) -> impl Iterator<Item = &ImageRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove the record currently observed at `path`, if any.
    pub fn remove_path(&mut self, path: &Path) -> Option<ImageRecord> {
        let key = self.by_path.get(path)?.clone();
        self.remove(&key)
    }

    /// Remove every record located under `dir` (component-wise prefix).
    pub fn remove_under(&mut self, dir: &Path) -> Vec<ImageRecord> {
        let keys: Vec<ContentKey> = self
            .records
            .iter()
            .filter(|(_, r)| r.file_path.starts_with(dir))
            .map(|(k, _)| k.clone())
            .collect();
        keys.iter().filter_map(|k| self.remove(k)).collect()
    }
}

impl FromIterator<ImageRecord> for Snapshot {
    fn from_iter<I: IntoIterator<Item = ImageRecord>>(iter: I) -> Self {
        let mut snapshot = Snapshot::new();
        for record in iter {
            snapshot.put(record);
        }
        snapshot
    }
}

/// A single incremental change to the live snapshot.
#[derive(Debug, Clone)]
pub enum LivePatch {
    /// A file appeared or changed; replaces whatever was observed at its path.
    Upsert(ImageRecord),
    /// A file disappeared.
    RemovePath(PathBuf),
    /// A directory disappeared with everything under it.
    RemoveDir(PathBuf),
}

/// Owner of the live and persisted snapshots for one watched directory.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    live: Snapshot,
    persisted: Snapshot,
    generation: u64,
}

impl SnapshotStore {
    /// Start from a persisted snapshot loaded from durable storage.
    pub fn new(persisted: Snapshot) -> Self {
        Self {
            live: Snapshot::new(),
            persisted,
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Discard the live snapshot and start a new generation. Patches tagged
    /// with an older generation are dropped from now on.
    pub fn begin_rebuild(&mut self) -> u64 {
        self.generation += 1;
        self.live = Snapshot::new();
        self.generation
    }

    /// Install a freshly scanned live snapshot. Returns `false` (and changes
    /// nothing) when another rebuild started after `generation`.
    pub fn finish_rebuild(&mut self, generation: u64, live: Snapshot) -> bool {
        if generation != self.generation {
            return false;
        }
        self.live = live;
        true
    }

    /// Apply an incremental patch produced under `generation`.
    pub fn apply_patch(&mut self, generation: u64, patch: LivePatch) -> bool {
        if generation != self.generation {
            tracing::debug!(
                patch_generation = generation,
                current_generation = self.generation,
                "Dropping stale live patch"
            );
            return false;
        }
        match patch {
            LivePatch::Upsert(record) => {
                self.live.remove_path(&record.file_path);
                self.live.put(record);
            }
            LivePatch::RemovePath(path) => {
                self.live.remove_path(&path);
            }
            LivePatch::RemoveDir(dir) => {
                let removed = self.live.remove_under(&dir);
                tracing::debug!(dir = %dir.display(), count = removed.len(), "Removed directory from live snapshot");
            }
        }
        true
    }

    pub fn live(&self) -> &Snapshot {
        &self.live
    }

    pub fn persisted(&self) -> &Snapshot {
        &self.persisted
    }

    /// Replace the persisted half after a confirmed sync batch.
    pub fn replace_persisted(&mut self, persisted: Snapshot) {
        self.persisted = persisted;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn record(path: &str, size: u64, modified_ms: i64) -> ImageRecord {
        let file_path = PathBuf::from(path);
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        ImageRecord::from_info(ImageInfo {
            file_path,
            file_name,
            size,
            modified_ms,
            created_ms: None,
        })
        .unwrap()
    }

    #[test]
    fn test_put_get_remove() {
        let mut s = Snapshot::new();
        let r = record("/photos/a.jpg", 100, 1);
        let key = r.content_key.clone();
        assert!(s.put(r.clone()).is_none());
        assert_eq!(s.get(&key), Some(&r));
        assert_eq!(s.keys().count(), 1);
        assert_eq!(s.remove(&key), Some(r));
        assert!(s.is_empty());
    }

    #[test]
    fn test_remove_path() {
        let mut s = Snapshot::new();
        s.put(record("/photos/a.jpg", 100, 1));
        s.put(record("/photos/b.jpg", 200, 1));
        let removed = s.remove_path(Path::new("/photos/a.jpg")).unwrap();
        assert_eq!(removed.file_name, "a.jpg");
        assert_eq!(s.len(), 1);
        assert!(s.remove_path(Path::new("/photos/a.jpg")).is_none());
    }

    #[test]
    fn test_same_key_at_new_path_moves_index() {
        let mut s = Snapshot::new();
        s.put(record("/photos/2023/a.jpg", 100, 1));
        s.put(record("/photos/2024/a.jpg", 100, 1));
        assert_eq!(s.len(), 1);
        // The old path no longer owns the key.
        assert!(s.remove_path(Path::new("/photos/2023/a.jpg")).is_none());
        assert!(s.remove_path(Path::new("/photos/2024/a.jpg")).is_some());
    }

    #[test]
    fn test_remove_under_is_component_wise() {
        let mut s = Snapshot::new();
        s.put(record("/photos/trip/a.jpg", 1, 1));
        s.put(record("/photos/trip/day2/b.jpg", 2, 1));
        s.put(record("/photos/trips/c.jpg", 3, 1));
        let removed = s.remove_under(Path::new("/photos/trip"));
        assert_eq!(removed.len(), 2);
        assert_eq!(s.len(), 1);
        assert_eq!(s.records().next().unwrap().file_name, "c.jpg");
    }

    #[test]
    fn test_source_dir_uses_forward_slashes() {
        let r = record("/photos/trip/a.jpg", 1, 1);
        assert_eq!(r.source_dir(), "/photos/trip");
    }

    #[test]
    fn test_upsert_patch_replaces_record_at_same_path() {
        let mut store = SnapshotStore::default();
        let generation = store.begin_rebuild();
        assert!(store.apply_patch(generation, LivePatch::Upsert(record("/p/a.jpg", 100, 1))));
        assert!(store.apply_patch(generation, LivePatch::Upsert(record("/p/a.jpg", 120, 2))));
        assert_eq!(store.live().len(), 1);
        assert_eq!(store.live().records().next().unwrap().size, 120);
    }

    #[test]
    fn test_stale_patch_is_dropped() {
        let mut store = SnapshotStore::default();
        let old = store.begin_rebuild();
        let new = store.begin_rebuild();
        assert!(!store.apply_patch(old, LivePatch::Upsert(record("/p/a.jpg", 1, 1))));
        assert!(store.live().is_empty());
        assert!(store.apply_patch(new, LivePatch::Upsert(record("/p/a.jpg", 1, 1))));
        assert_eq!(store.live().len(), 1);
    }

    #[test]
    fn test_stale_rebuild_is_rejected() {
        let mut store = SnapshotStore::default();
        let first = store.begin_rebuild();
        let _second = store.begin_rebuild();
        let scanned: Snapshot = [record("/p/a.jpg", 1, 1)].into_iter().collect();
        assert!(!store.finish_rebuild(first, scanned));
        assert!(store.live().is_empty());
    }

    #[test]
    fn test_live_and_persisted_do_not_share_records() {
        let mut store = SnapshotStore::new(Snapshot::new());
        let generation = store.begin_rebuild();
        store.apply_patch(generation, LivePatch::Upsert(record("/p/a.jpg", 1, 1)));
        let mut copy = store.live().clone();
        copy.remove_path(Path::new("/p/a.jpg"));
        store.replace_persisted(copy);
        assert_eq!(store.live().len(), 1);
        assert!(store.persisted().is_empty());
    }
}
