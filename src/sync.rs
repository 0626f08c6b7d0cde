//! Sync orchestrator: pushes a [`ChangeSet`] to the remote catalog.
//!
//! Removes are issued (and settle) before any add, so an edited file's old
//! key is gone from the persisted snapshot before its new key lands. Within
//! each half, calls fan out with bounded concurrency and every item settles
//! on its own; one failure never cancels its siblings. Only confirmed items
//! touch the persisted snapshot, which is written once at the end.

use std::future;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use crate::catalog::{AddImage, CatalogClient, CatalogError, Operation, RemoveImage};
use crate::error::EngineError;
use crate::key::ContentKey;
use crate::reconcile::ChangeSet;
use crate::retry::{self, RetryAction, RetryConfig};
use crate::snapshot::{ImageRecord, Snapshot};
use crate::state::{StateDb, SyncRunStats};

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum remote calls in flight.
    pub concurrency: usize,
    pub retry: RetryConfig,
    pub no_progress_bar: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryConfig::default(),
            no_progress_bar: false,
        }
    }
}

/// Result of one remote operation.
#[derive(Debug)]
pub struct ItemOutcome {
    pub operation: Operation,
    pub key: ContentKey,
    pub file_path: PathBuf,
    pub result: Result<(), EngineError>,
}

impl ItemOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-item results of one batch.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub outcomes: Vec<ItemOutcome>,
    /// The session was cancelled; nothing was committed.
    pub interrupted: bool,
    /// Items never issued because the session was cancelled first.
    pub skipped: usize,
    /// The persisted snapshot as saved, when the batch committed anything.
    pub committed: Option<Snapshot>,
}

impl SyncReport {
    pub fn succeeded(&self, operation: Operation) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.operation == operation && o.is_ok())
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }

    pub fn failed(&self) -> usize {
        self.failures().count()
    }

    /// Every item confirmed and nothing skipped.
    pub fn is_clean(&self) -> bool {
        !self.interrupted && self.skipped == 0 && self.failed() == 0
    }

    pub fn stats(&self) -> SyncRunStats {
        SyncRunStats {
            added: self.succeeded(Operation::Add) as u64,
            removed: self.succeeded(Operation::Remove) as u64,
            failed: self.failed() as u64,
            interrupted: self.interrupted,
        }
    }
}

fn classify(e: &CatalogError) -> RetryAction {
    if e.is_retryable() {
        RetryAction::Retry
    } else {
        RetryAction::Abort
    }
}

/// Hidden when disabled or stdout is not a terminal, so piped output stays clean.
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    if let Ok(style) =
        ProgressStyle::with_template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

pub struct SyncOrchestrator {
    catalog: Arc<dyn CatalogClient>,
    state: Arc<dyn StateDb>,
    config: SyncConfig,
}

impl SyncOrchestrator {
    pub fn new(catalog: Arc<dyn CatalogClient>, state: Arc<dyn StateDb>, config: SyncConfig) -> Self {
        Self {
            catalog,
            state,
            config,
        }
    }

    /// Apply `changes` against a working copy of `persisted`.
    ///
    /// Per-item failures land in the report. An `Err` means the batch could
    /// not be recorded (state database failure); remote effects may already
    /// have happened and are picked up again by the next diff.
    pub async fn apply(
        &self,
        directory: &Path,
        changes: &ChangeSet,
        persisted: &Snapshot,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, EngineError> {
        let mut report = SyncReport::default();
        if changes.is_empty() {
            return Ok(report);
        }

        let started = Instant::now();
        let run_id = self.state.start_sync_run(directory).await?;
        let pb = create_progress_bar(self.config.no_progress_bar, changes.len() as u64);
        let mut working = persisted.clone();
        let concurrency = self.config.concurrency.max(1);

        tracing::info!(
            "Syncing {} removal(s) and {} addition(s) (concurrency: {})",
            changes.removed.len(),
            changes.added.len(),
            concurrency
        );

        // Once the session is cancelled no new call starts; in-flight ones drain.
        let mut removes = stream::iter(changes.removed.iter().cloned())
            .take_while(|_| future::ready(!cancel.is_cancelled()))
            .map(|record| self.remove_one(record, cancel))
            .buffer_unordered(concurrency);
        let mut issued = 0;
        while let Some(outcome) = removes.next().await {
            issued += 1;
            if outcome.is_ok() {
                working.remove(&outcome.key);
            }
            self.track(&pb, &outcome);
            report.outcomes.push(outcome);
        }
        drop(removes);
        report.skipped += changes.removed.len() - issued;

        let mut adds = stream::iter(changes.added.iter().cloned())
            .take_while(|_| future::ready(!cancel.is_cancelled()))
            .map(|record| self.add_one(record, cancel))
            .buffer_unordered(concurrency);
        let mut issued = 0;
        while let Some((record, outcome)) = adds.next().await {
            issued += 1;
            if outcome.is_ok() {
                working.put(record);
            }
            self.track(&pb, &outcome);
            report.outcomes.push(outcome);
        }
        drop(adds);
        report.skipped += changes.added.len() - issued;
        pb.finish_and_clear();

        if cancel.is_cancelled() {
            tracing::info!("Sync session cancelled; discarding batch results");
            report.interrupted = true;
        } else if report.outcomes.iter().any(ItemOutcome::is_ok) {
            self.state.save_persisted(&working).await?;
            report.committed = Some(working);
        }

        let stats = report.stats();
        self.state.complete_sync_run(run_id, &stats).await?;

        tracing::info!("── Sync Summary ──");
        tracing::info!(
            "  {} added, {} removed, {} failed{}",
            stats.added,
            stats.removed,
            stats.failed,
            if stats.interrupted { " (interrupted)" } else { "" }
        );
        tracing::info!("  elapsed: {:.1}s", started.elapsed().as_secs_f64());
        Ok(report)
    }

    fn track(&self, pb: &ProgressBar, outcome: &ItemOutcome) {
        if let Some(name) = outcome.file_path.file_name() {
            pb.set_message(name.to_string_lossy().into_owned());
        }
        if let Err(e) = &outcome.result {
            pb.suspend(|| {
                tracing::error!(
                    "Catalog {} failed: {}: {}",
                    outcome.operation,
                    outcome.file_path.display(),
                    e
                );
            });
        }
        pb.inc(1);
    }

    async fn remove_one(&self, record: ImageRecord, cancel: &CancellationToken) -> ItemOutcome {
        let request = RemoveImage::from(&record);
        let result = retry::retry_with_backoff(&self.config.retry, cancel, classify, || {
            self.catalog.remove_image(&request)
        })
        .await
        .map_err(|e| EngineError::Remote {
            key: record.content_key.clone(),
            source: e.into_inner(),
        });
        ItemOutcome {
            operation: Operation::Remove,
            key: record.content_key,
            file_path: record.file_path,
            result,
        }
    }

    async fn add_one(&self, record: ImageRecord, cancel: &CancellationToken) -> (ImageRecord, ItemOutcome) {
        let result = self.upload(&record, cancel).await;
        let outcome = ItemOutcome {
            operation: Operation::Add,
            key: record.content_key.clone(),
            file_path: record.file_path.clone(),
            result,
        };
        (record, outcome)
    }

    /// Bytes are read only now; a file deleted since the diff fails this
    /// item alone.
    async fn upload(&self, record: &ImageRecord, cancel: &CancellationToken) -> Result<(), EngineError> {
        let bytes = tokio::fs::read(&record.file_path)
            .await
            .map_err(|e| EngineError::io(&record.file_path, e))?;
        let request = AddImage::new(record, bytes);
        retry::retry_with_backoff(&self.config.retry, cancel, classify, || {
            self.catalog.add_image(&request)
        })
        .await
        .map_err(|e| EngineError::Remote {
            key: record.content_key.clone(),
            source: e.into_inner(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fake::FakeCatalog;
    use crate::reconcile::diff;
    use crate::scan::{tests::test_dir, ImageInfo};
    use crate::snapshot::tests::record;
    use crate::state::SqliteStateDb;
    use std::fs;
    use std::time::Duration;

    fn config() -> SyncConfig {
        SyncConfig {
            concurrency: 4,
            retry: RetryConfig::none(),
            no_progress_bar: true,
        }
    }

    async fn on_disk(dir: &Path, name: &str, len: usize) -> ImageRecord {
        let path = dir.join(name);
        fs::write(&path, vec![7u8; len]).unwrap();
        ImageRecord::from_info(ImageInfo::stat(&path).await.unwrap()).unwrap()
    }

    fn setup(catalog: FakeCatalog) -> (Arc<FakeCatalog>, Arc<SqliteStateDb>, SyncOrchestrator) {
        let catalog = Arc::new(catalog);
        let state = Arc::new(SqliteStateDb::open_in_memory().unwrap());
        let orchestrator = SyncOrchestrator::new(catalog.clone(), state.clone(), config());
        (catalog, state, orchestrator)
    }

    #[tokio::test]
    async fn test_empty_changeset_is_a_no_op() {
        let (catalog, state, orchestrator) = setup(FakeCatalog::new());
        let report = orchestrator
            .apply(Path::new("/p"), &ChangeSet::default(), &Snapshot::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_clean());
        assert!(report.committed.is_none());
        assert!(catalog.calls().is_empty());
        assert!(state.recent_sync_runs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_failed_add_does_not_block_siblings() {
        let dir = test_dir("sync_partial_failure");
        let a = on_disk(&dir, "a.jpg", 10).await;
        let b = on_disk(&dir, "b.jpg", 20).await;
        let c = on_disk(&dir, "c.jpg", 30).await;
        let live: Snapshot = [a.clone(), b.clone(), c.clone()].into_iter().collect();

        let (catalog, state, orchestrator) = setup(FakeCatalog::new());
        catalog.fail_always(&b.content_key, 500);

        let changes = diff(&live, &Snapshot::new());
        let report = orchestrator
            .apply(&dir, &changes, &Snapshot::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.succeeded(Operation::Add), 2);
        assert_eq!(report.failed(), 1);
        let failure = report.failures().next().unwrap();
        assert_eq!(failure.key, b.content_key);
        assert!(matches!(failure.result, Err(EngineError::Remote { .. })));

        let committed = report.committed.as_ref().unwrap();
        assert!(committed.contains_key(&a.content_key));
        assert!(!committed.contains_key(&b.content_key));
        assert!(committed.contains_key(&c.content_key));
        assert_eq!(&state.load_persisted().await.unwrap(), committed);

        // The failed item is still pending on the next pass.
        let retry = diff(&live, committed);
        assert_eq!(retry.added.len(), 1);
        assert_eq!(retry.added[0].content_key, b.content_key);

        let runs = state.recent_sync_runs(1).await.unwrap();
        assert_eq!(runs[0].stats.added, 2);
        assert_eq!(runs[0].stats.failed, 1);
    }

    #[tokio::test]
    async fn test_removes_settle_before_adds() {
        let dir = test_dir("sync_order");
        let old = record(&dir.join("a.jpg").to_string_lossy(), 10, 1);
        let new = on_disk(&dir, "a.jpg", 12).await;
        let persisted: Snapshot = [old.clone()].into_iter().collect();
        let live: Snapshot = [new.clone()].into_iter().collect();

        let (catalog, _state, orchestrator) = setup(FakeCatalog::with_delay(Duration::from_millis(5)));
        catalog.seed(&old.content_key);

        let changes = diff(&live, &persisted);
        let report = orchestrator
            .apply(&dir, &changes, &persisted, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_clean());

        let calls = catalog.calls();
        assert_eq!(
            calls,
            vec![
                (Operation::Remove, old.content_key.clone()),
                (Operation::Add, new.content_key.clone()),
            ]
        );
        let committed = report.committed.unwrap();
        assert_eq!(committed.len(), 1);
        assert!(committed.contains_key(&new.content_key));
    }

    #[tokio::test]
    async fn test_missing_file_fails_only_that_item() {
        let dir = test_dir("sync_missing_file");
        let present = on_disk(&dir, "a.jpg", 10).await;
        let gone = on_disk(&dir, "b.jpg", 10).await;
        fs::remove_file(&gone.file_path).unwrap();
        let live: Snapshot = [present.clone(), gone.clone()].into_iter().collect();

        let (catalog, _state, orchestrator) = setup(FakeCatalog::new());
        let report = orchestrator
            .apply(&dir, &diff(&live, &Snapshot::new()), &Snapshot::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.succeeded(Operation::Add), 1);
        let failure = report.failures().next().unwrap();
        assert_eq!(failure.key, gone.content_key);
        assert!(matches!(failure.result, Err(EngineError::Io { .. })));
        // No remote call was made for the unreadable file.
        assert_eq!(catalog.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_remove_keeps_key_persisted() {
        let kept = record("/p/a.jpg", 1, 1);
        let dropped = record("/p/b.jpg", 2, 2);
        let persisted: Snapshot = [kept.clone(), dropped.clone()].into_iter().collect();

        let (catalog, _state, orchestrator) = setup(FakeCatalog::new());
        catalog.fail_always(&kept.content_key, 503);

        let changes = diff(&Snapshot::new(), &persisted);
        let report = orchestrator
            .apply(Path::new("/p"), &changes, &persisted, &CancellationToken::new())
            .await
            .unwrap();

        let committed = report.committed.unwrap();
        assert!(committed.contains_key(&kept.content_key));
        assert!(!committed.contains_key(&dropped.content_key));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let dir = test_dir("sync_retry");
        let a = on_disk(&dir, "a.jpg", 10).await;
        let live: Snapshot = [a.clone()].into_iter().collect();

        let catalog = Arc::new(FakeCatalog::new());
        catalog.fail_times(&a.content_key, 503, 1);
        let state = Arc::new(SqliteStateDb::open_in_memory().unwrap());
        let orchestrator = SyncOrchestrator::new(
            catalog.clone(),
            state,
            SyncConfig {
                retry: RetryConfig {
                    max_retries: 2,
                    base_delay_secs: 0,
                    max_delay_secs: 0,
                },
                ..config()
            },
        );

        let report = orchestrator
            .apply(&dir, &diff(&live, &Snapshot::new()), &Snapshot::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_clean());
        assert_eq!(catalog.calls().len(), 2);
        assert!(catalog.holds(&a.content_key));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let dir = test_dir("sync_bounded");
        let mut records = Vec::new();
        for i in 0..10 {
            records.push(on_disk(&dir, &format!("{i}.jpg"), 10 + i).await);
        }
        let live: Snapshot = records.into_iter().collect();

        let catalog = Arc::new(FakeCatalog::with_delay(Duration::from_millis(10)));
        let state = Arc::new(SqliteStateDb::open_in_memory().unwrap());
        let orchestrator = SyncOrchestrator::new(
            catalog.clone(),
            state,
            SyncConfig {
                concurrency: 3,
                ..config()
            },
        );
        orchestrator
            .apply(&dir, &diff(&live, &Snapshot::new()), &Snapshot::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(catalog.held_count(), 10);
        assert!(catalog.max_in_flight() <= 3);
    }

    #[tokio::test]
    async fn test_cancelled_session_commits_nothing() {
        let dir = test_dir("sync_cancelled");
        let a = on_disk(&dir, "a.jpg", 10).await;
        let stale = record("/elsewhere/b.jpg", 1, 1);
        let persisted: Snapshot = [stale.clone()].into_iter().collect();
        let live: Snapshot = [a].into_iter().collect();

        let (catalog, state, orchestrator) = setup(FakeCatalog::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = orchestrator
            .apply(&dir, &diff(&live, &persisted), &persisted, &cancel)
            .await
            .unwrap();
        assert!(report.interrupted);
        assert_eq!(report.skipped, 2);
        assert!(report.committed.is_none());
        assert!(catalog.calls().is_empty());
        assert!(state.load_persisted().await.unwrap().is_empty());
        assert!(state.recent_sync_runs(1).await.unwrap()[0].stats.interrupted);
    }

    #[tokio::test]
    async fn test_cancel_mid_batch_stops_issuing_calls() {
        let persisted: Snapshot = (0..20)
            .map(|i| record(&format!("/p/{i}.jpg"), 10 + i, 1))
            .collect();
        let catalog = Arc::new(FakeCatalog::with_delay(Duration::from_millis(20)));
        for r in persisted.records() {
            catalog.seed(&r.content_key);
        }
        let state = Arc::new(SqliteStateDb::open_in_memory().unwrap());
        let orchestrator = SyncOrchestrator::new(
            catalog.clone(),
            state,
            SyncConfig {
                concurrency: 2,
                ..config()
            },
        );

        let changes = diff(&Snapshot::new(), &persisted);
        let cancel = CancellationToken::new();
        let (report, ()) = tokio::join!(
            orchestrator.apply(Path::new("/p"), &changes, &persisted, &cancel),
            async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                cancel.cancel();
            }
        );
        let report = report.unwrap();

        assert!(report.interrupted);
        assert!(report.committed.is_none());
        let issued = catalog.calls().len();
        assert!(issued < 20, "{issued} calls issued after cancel");
        assert_eq!(report.outcomes.len(), issued);
        assert_eq!(report.outcomes.len() + report.skipped, 20);
    }
}
