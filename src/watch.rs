//! Filesystem watch adapter.
//!
//! Wraps a recursive `notify` watcher and turns raw events into
//! [`WatchEvent`]s on a bounded channel. The notify callback runs on the
//! watcher's own thread, so it stats files synchronously and never blocks on
//! the channel: when the consumer falls behind, events are dropped and the
//! adapter is flagged as overflowed until the consumer rescans.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use notify::event::{ModifyKind, RemoveKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::error::EngineError;
use crate::scan::{is_hidden, is_image_path, ImageInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(ImageInfo),
    Changed(ImageInfo),
    Deleted(PathBuf),
    /// A directory (or a non-image path) disappeared; everything under it is gone.
    DirDeleted(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Added(info) | WatchEvent::Changed(info) => &info.file_path,
            WatchEvent::Deleted(path) | WatchEvent::DirDeleted(path) => path,
        }
    }
}

/// Live watch on one directory. Dropping it stops the OS watcher and closes
/// the event channel.
pub struct WatchAdapter {
    root: PathBuf,
    overflowed: Arc<AtomicBool>,
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for WatchAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchAdapter")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl WatchAdapter {
    /// Start watching `root` recursively. `buffer` bounds the channel.
    pub fn start(
        root: &Path,
        buffer: usize,
    ) -> Result<(Self, mpsc::Receiver<WatchEvent>), EngineError> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let filter_root = root.to_path_buf();
        let overflowed = Arc::new(AtomicBool::new(false));
        let overflow_flag = Arc::clone(&overflowed);

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for watch_event in translate(&filter_root, &event) {
                        tracing::trace!(?watch_event, "Watch event");
                        match tx.try_send(watch_event) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(dropped)) => {
                                overflow_flag.store(true, Ordering::SeqCst);
                                tracing::warn!(
                                    path = %dropped.path().display(),
                                    "Watch event buffer full; dropping event until next rescan"
                                );
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }
                }
                Err(e) => tracing::error!("Watch error: {}", e),
            },
            Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        tracing::info!("Watching {}", root.display());

        Ok((
            Self {
                root: root.to_path_buf(),
                overflowed,
                _watcher: watcher,
            },
            rx,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether events were dropped since the last call. Clears the flag.
    pub fn take_overflow(&self) -> bool {
        self.overflowed.swap(false, Ordering::SeqCst)
    }
}

/// Any component below `root` is a dotfile or dot-directory.
fn is_hidden_below(root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.ancestors().any(|p| !p.as_os_str().is_empty() && is_hidden(p))
}

fn stat(path: &Path) -> Option<ImageInfo> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        Ok(_) => return None,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Dropping watch event; stat failed");
            return None;
        }
    };
    match ImageInfo::from_metadata(path, &metadata) {
        Ok(info) => Some(info),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Dropping watch event; stat failed");
            None
        }
    }
}

fn appeared(root: &Path, path: &Path, out: &mut Vec<WatchEvent>) {
    if path.is_dir() {
        // Files landing together with their directory can beat the new
        // directory watch; pick them up directly.
        let walker = WalkDir::new(path)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.path()))
            .filter_map(Result::ok);
        for entry in walker {
            if entry.file_type().is_file() && is_image_path(entry.path()) {
                out.extend(stat(entry.path()).map(WatchEvent::Added));
            }
        }
    } else if is_image_path(path) && !is_hidden_below(root, path) {
        out.extend(stat(path).map(WatchEvent::Added));
    }
}

fn disappeared(path: &Path, folder: bool, out: &mut Vec<WatchEvent>) {
    if folder || !is_image_path(path) {
        out.push(WatchEvent::DirDeleted(path.to_path_buf()));
    } else {
        out.push(WatchEvent::Deleted(path.to_path_buf()));
    }
}

/// Translate one raw notify event. Pure apart from stat calls.
pub(crate) fn translate(root: &Path, event: &Event) -> Vec<WatchEvent> {
    let mut out = Vec::new();
    let paths = event
        .paths
        .iter()
        .filter(|p| !is_hidden_below(root, p));

    match event.kind {
        EventKind::Create(_) => {
            for path in paths {
                appeared(root, path, &mut out);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [from, to] = event.paths.as_slice() {
                if !is_hidden_below(root, from) {
                    disappeared(from, !is_image_path(from), &mut out);
                }
                if !is_hidden_below(root, to) {
                    appeared(root, to, &mut out);
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in paths {
                disappeared(path, false, &mut out);
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // `To` or a rename whose direction the platform did not report:
            // whatever exists now has appeared, whatever is gone vanished.
            for path in paths {
                if path.exists() {
                    appeared(root, path, &mut out);
                } else {
                    disappeared(path, false, &mut out);
                }
            }
        }
        EventKind::Modify(_) => {
            for path in paths.filter(|p| is_image_path(p)) {
                out.extend(stat(path).map(WatchEvent::Changed));
            }
        }
        EventKind::Remove(kind) => {
            for path in paths {
                disappeared(path, kind == RemoveKind::Folder, &mut out);
            }
        }
        EventKind::Any | EventKind::Access(_) | EventKind::Other => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::tests::test_dir;
    use notify::event::{CreateKind, DataChange};
    use std::fs;
    use std::time::Duration;

    fn event(kind: EventKind, paths: &[&Path]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |e, p| e.add_path(p.to_path_buf()))
    }

    #[test]
    fn test_create_image_is_added_with_metadata() {
        let dir = test_dir("watch_create");
        let path = dir.join("a.jpg");
        fs::write(&path, vec![0u8; 64]).unwrap();

        let events = translate(&dir, &event(EventKind::Create(CreateKind::File), &[&path]));
        assert_eq!(events.len(), 1);
        match &events[0] {
            WatchEvent::Added(info) => {
                assert_eq!(info.file_name, "a.jpg");
                assert_eq!(info.size, 64);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_non_image_and_hidden_are_ignored() {
        let dir = test_dir("watch_ignored");
        fs::create_dir_all(dir.join(".cache")).unwrap();
        let txt = dir.join("notes.txt");
        let hidden = dir.join(".cache/a.jpg");
        fs::write(&txt, b"x").unwrap();
        fs::write(&hidden, b"x").unwrap();

        assert!(translate(&dir, &event(EventKind::Create(CreateKind::File), &[&txt])).is_empty());
        assert!(translate(&dir, &event(EventKind::Create(CreateKind::File), &[&hidden])).is_empty());
        assert!(translate(&dir, &event(EventKind::Remove(RemoveKind::File), &[&hidden])).is_empty());
    }

    #[test]
    fn test_stat_failure_drops_event() {
        let dir = test_dir("watch_stat_fail");
        let gone = dir.join("gone.jpg");
        assert!(translate(&dir, &event(EventKind::Create(CreateKind::File), &[&gone])).is_empty());
    }

    #[test]
    fn test_modify_is_changed() {
        let dir = test_dir("watch_modify");
        let path = dir.join("a.png");
        fs::write(&path, b"png").unwrap();
        let events = translate(
            &dir,
            &event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), &[&path]),
        );
        assert!(matches!(events.as_slice(), [WatchEvent::Changed(_)]));
    }

    #[test]
    fn test_removals() {
        let dir = test_dir("watch_remove");
        let image = dir.join("a.jpg");
        let folder = dir.join("trip");
        assert_eq!(
            translate(&dir, &event(EventKind::Remove(RemoveKind::File), &[&image])),
            vec![WatchEvent::Deleted(image.clone())]
        );
        assert_eq!(
            translate(&dir, &event(EventKind::Remove(RemoveKind::Folder), &[&folder])),
            vec![WatchEvent::DirDeleted(folder.clone())]
        );
        // No image extension: assumed to be a folder.
        assert_eq!(
            translate(&dir, &event(EventKind::Remove(RemoveKind::Any), &[&folder])),
            vec![WatchEvent::DirDeleted(folder)]
        );
    }

    #[test]
    fn test_rename_both_is_delete_then_add() {
        let dir = test_dir("watch_rename");
        let from = dir.join("old.jpg");
        let to = dir.join("new.jpg");
        fs::write(&to, b"x").unwrap();
        let events = translate(
            &dir,
            &event(EventKind::Modify(ModifyKind::Name(RenameMode::Both)), &[&from, &to]),
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], WatchEvent::Deleted(from));
        assert!(matches!(&events[1], WatchEvent::Added(info) if info.file_path == to));
    }

    #[test]
    fn test_new_folder_reports_images_inside() {
        let dir = test_dir("watch_new_folder");
        let folder = dir.join("import");
        fs::create_dir_all(folder.join("nested")).unwrap();
        fs::write(folder.join("a.jpg"), b"a").unwrap();
        fs::write(folder.join("nested/b.gif"), b"b").unwrap();
        fs::write(folder.join("readme.md"), b"c").unwrap();

        let events = translate(&dir, &event(EventKind::Create(CreateKind::Folder), &[&folder]));
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(e, WatchEvent::Added(_))));
    }

    #[tokio::test]
    async fn test_adapter_delivers_events() {
        let dir = test_dir("watch_adapter");
        let (adapter, mut rx) = WatchAdapter::start(&dir, 64).unwrap();
        assert_eq!(adapter.root(), dir);

        fs::write(dir.join("a.jpg"), vec![1u8; 10]).unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = rx.recv().await {
                if event.path().ends_with("a.jpg") {
                    return Some(event);
                }
            }
            None
        })
        .await
        .unwrap();
        assert!(matches!(
            received,
            Some(WatchEvent::Added(_) | WatchEvent::Changed(_))
        ));

        drop(adapter);
        // Channel closes once the watcher (and its sender) is gone.
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_full_buffer_flags_overflow() {
        let dir = test_dir("watch_overflow");
        let (adapter, mut rx) = WatchAdapter::start(&dir, 1).unwrap();
        assert!(!adapter.take_overflow());

        for i in 0..10 {
            fs::write(dir.join(format!("{i}.jpg")), vec![1u8; 10]).unwrap();
        }
        let overflowed = tokio::time::timeout(Duration::from_secs(5), async {
            while !adapter.take_overflow() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(overflowed.is_ok());

        // The one buffered event is still delivered.
        assert!(rx.try_recv().is_ok());
    }
}
