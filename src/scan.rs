//! Full directory scan and the image metadata it produces.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use walkdir::WalkDir;

use crate::error::EngineError;
use crate::snapshot::ImageRecord;

/// Extensions (lowercase) treated as images.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];

/// Metadata needed to identify an image without reading its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub file_path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub modified_ms: i64,
    pub created_ms: Option<i64>,
}

impl ImageInfo {
    pub fn from_metadata(path: &Path, metadata: &Metadata) -> std::io::Result<Self> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| std::io::Error::other("path has no file name"))?;
        Ok(Self {
            file_path: path.to_path_buf(),
            file_name,
            size: metadata.len(),
            modified_ms: system_time_ms(metadata.modified()?),
            created_ms: metadata.created().ok().map(system_time_ms),
        })
    }

    /// Stat `path` and capture its metadata.
    pub async fn stat(path: &Path) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(std::io::Error::other("not a regular file"));
        }
        Self::from_metadata(path, &metadata)
    }
}

/// Milliseconds since the Unix epoch; negative for earlier times.
fn system_time_ms(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_millis()).unwrap_or(i64::MAX),
    }
}

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Dotfiles and dot-directories are never part of the library.
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

/// Result of a full scan.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub records: Vec<ImageRecord>,
    /// Entries that failed to stat or key and were left out.
    pub skipped: usize,
}

/// Recursively scan `root` for images.
///
/// An unreadable root fails the whole scan; a failing individual entry is
/// logged and skipped.
pub async fn scan_directory(root: &Path) -> Result<ScanOutcome, EngineError> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || scan_blocking(&root)).await?
}

fn scan_blocking(root: &Path) -> Result<ScanOutcome, EngineError> {
    let metadata = std::fs::metadata(root).map_err(|e| EngineError::io(root, e))?;
    if !metadata.is_dir() {
        return Err(EngineError::io(
            root,
            std::io::Error::other("not a directory"),
        ));
    }

    let mut outcome = ScanOutcome::default();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.path()));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if e.depth() == 0 {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
                    return Err(EngineError::io(path, source));
                }
                tracing::warn!(error = %e, "Skipping unreadable entry");
                outcome.skipped += 1;
                continue;
            }
        };

        if !entry.file_type().is_file() || !is_image_path(entry.path()) {
            continue;
        }

        let record = entry
            .metadata()
            .map_err(|e| e.to_string())
            .and_then(|m| ImageInfo::from_metadata(entry.path(), &m).map_err(|e| e.to_string()))
            .and_then(|info| ImageRecord::from_info(info).map_err(|e| e.to_string()));

        match record {
            Ok(record) => outcome.records.push(record),
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "Skipping image");
                outcome.skipped += 1;
            }
        }
    }

    tracing::debug!(
        root = %root.display(),
        images = outcome.records.len(),
        skipped = outcome.skipped,
        "Directory scan finished"
    );
    Ok(outcome)
}
