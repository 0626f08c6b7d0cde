//! The watched library: ties scan, snapshots, lifecycle, watch and sync
//! together for one directory at a time.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::catalog::CatalogClient;
use crate::error::EngineError;
use crate::lifecycle::{LibraryStats, LibraryStatus, Lifecycle, LifecycleEvent, Phase};
use crate::reconcile::{self, ChangeSet};
use crate::scan;
use crate::snapshot::{ImageRecord, LivePatch, Snapshot, SnapshotStore};
use crate::state::StateDb;
use crate::sync::{SyncConfig, SyncOrchestrator, SyncReport};
use crate::watch::{WatchAdapter, WatchEvent};

#[derive(Debug, Clone)]
pub struct LibraryConfig {
    pub sync: SyncConfig,
    /// Quiet period after the last watch event before a pass starts.
    pub debounce: Duration,
    /// Capacity of the watch event channel.
    pub event_buffer: usize,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            debounce: Duration::from_millis(500),
            event_buffer: 1024,
        }
    }
}

/// Result of a directory selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub images: usize,
    pub skipped: usize,
}

pub struct Library {
    lifecycle: Lifecycle,
    store: Mutex<SnapshotStore>,
    state: Arc<dyn StateDb>,
    orchestrator: SyncOrchestrator,
    config: LibraryConfig,
    /// Cancelled when the directory is switched, watching stops, or the
    /// process shuts down.
    session: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl Library {
    /// Load the persisted snapshot and start `Uninitialized`.
    pub async fn open(
        state: Arc<dyn StateDb>,
        catalog: Arc<dyn CatalogClient>,
        config: LibraryConfig,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, EngineError> {
        let persisted = state.load_persisted().await?;
        tracing::debug!(images = persisted.len(), "Opened library");
        let orchestrator = SyncOrchestrator::new(catalog, state.clone(), config.sync.clone());
        Ok(Arc::new(Self {
            lifecycle: Lifecycle::new(),
            store: Mutex::new(SnapshotStore::new(persisted)),
            state,
            orchestrator,
            config,
            session: Mutex::new(None),
            shutdown,
        }))
    }

    fn store(&self) -> MutexGuard<'_, SnapshotStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self) -> Option<CancellationToken> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn end_session(&self) {
        if let Some(token) = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
    }

    pub fn status(&self) -> LibraryStatus {
        self.lifecycle.status()
    }

    pub fn stats(&self) -> LibraryStats {
        self.lifecycle.stats()
    }

    pub fn directory(&self) -> Option<PathBuf> {
        self.lifecycle.stats().directory
    }

    pub fn live_len(&self) -> usize {
        self.store().live().len()
    }

    pub fn persisted(&self) -> Snapshot {
        self.store().persisted().clone()
    }

    async fn record_error(&self, message: Option<String>) {
        if let Err(e) = self.state.set_last_error(message.as_deref()).await {
            tracing::warn!("Failed to record last error: {}", e);
        }
        self.lifecycle.set_last_error(message);
    }

    /// Switch to `directory` and rebuild the live snapshot from a full scan.
    ///
    /// Any previous watch session is cancelled first; its late events carry
    /// a stale generation and are dropped.
    pub async fn select_directory(&self, directory: &Path) -> Result<ScanSummary, EngineError> {
        let _processing = self.lifecycle.try_enter(Phase::Processing)?;
        self.lifecycle.fire(LifecycleEvent::SelectDirectory)?;
        self.end_session();
        self.lifecycle.set_directory(Some(directory));
        let generation = self.store().begin_rebuild();
        tracing::info!("Scanning {}", directory.display());

        let outcome = match scan::scan_directory(directory).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.lifecycle.fire(LifecycleEvent::ScanFailed)?;
                self.record_error(Some(e.to_string())).await;
                return Err(e);
            }
        };

        let summary = ScanSummary {
            images: outcome.records.len(),
            skipped: outcome.skipped,
        };
        let live: Snapshot = outcome.records.into_iter().collect();
        if self.store().finish_rebuild(generation, live) {
            self.lifecycle.touch(summary.images);
        } else {
            tracing::warn!("Scan of {} was superseded", directory.display());
        }
        self.lifecycle.fire(LifecycleEvent::ScanCompleted)?;
        tracing::info!(
            "Found {} image(s) in {}{}",
            summary.images,
            directory.display(),
            if summary.skipped > 0 {
                format!(" ({} skipped)", summary.skipped)
            } else {
                String::new()
            }
        );
        Ok(summary)
    }

    /// Rebuild the live snapshot of the watched directory in place, without
    /// leaving the current lifecycle state. Returns the new generation.
    ///
    /// The scan runs before the rebuild starts, so a failed scan leaves the
    /// live snapshot untouched.
    pub async fn rescan(&self, directory: &Path) -> Result<u64, EngineError> {
        let _processing = self.lifecycle.try_enter(Phase::Processing)?;
        let outcome = scan::scan_directory(directory).await?;
        let images = outcome.records.len();
        let generation = {
            let mut store = self.store();
            let generation = store.begin_rebuild();
            store.finish_rebuild(generation, outcome.records.into_iter().collect());
            generation
        };
        self.lifecycle.touch(images);
        tracing::info!("Rescanned {}: {} image(s)", directory.display(), images);
        Ok(generation)
    }

    /// Accept the scanned directory and start a watch session.
    pub fn confirm(&self) -> Result<(), EngineError> {
        self.lifecycle.fire(LifecycleEvent::UserConfirmed)?;
        let token = self.shutdown.child_token();
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(token);
        Ok(())
    }

    /// Cancel the watch session. In-flight remote calls drain but their
    /// results are discarded.
    pub fn stop_watching(&self) -> Result<(), EngineError> {
        self.end_session();
        self.lifecycle.fire(LifecycleEvent::StopWatching)?;
        Ok(())
    }

    /// Compare the snapshots without touching the catalog.
    pub fn diff_preview(&self) -> Result<ChangeSet, EngineError> {
        let _comparing = self.lifecycle.try_enter(Phase::Comparing)?;
        let store = self.store();
        Ok(reconcile::diff(store.live(), store.persisted()))
    }

    /// One reconciliation pass: diff, then push the delta to the catalog.
    ///
    /// Fails with `ConcurrencyRejected` while another pass or a scan is in
    /// flight; callers coalesce and try again later.
    pub async fn reconcile(&self) -> Result<SyncReport, EngineError> {
        let _comparing = self.lifecycle.try_enter(Phase::Comparing)?;
        let (changes, persisted) = {
            let store = self.store();
            (
                reconcile::diff(store.live(), store.persisted()),
                store.persisted().clone(),
            )
        };
        if changes.is_empty() {
            tracing::debug!("Live and persisted snapshots agree");
            return Ok(SyncReport::default());
        }

        let _syncing = self.lifecycle.try_enter(Phase::Syncing)?;
        let Some(token) = self.session() else {
            return Err(EngineError::Lifecycle {
                status: self.lifecycle.status(),
                event: LifecycleEvent::ChangeDetected,
            });
        };
        self.lifecycle.fire(LifecycleEvent::ChangeDetected)?;
        let directory = self.directory().unwrap_or_default();

        let result = self
            .orchestrator
            .apply(&directory, &changes, &persisted, &token)
            .await;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                self.lifecycle.fail(e.to_string());
                self.record_error(Some(e.to_string())).await;
                return Err(e);
            }
        };

        if !token.is_cancelled() {
            if let Some(committed) = &report.committed {
                let total = committed.len();
                self.store().replace_persisted(committed.clone());
                self.lifecycle.touch(total);
            }
        }
        if self.lifecycle.status() == LibraryStatus::Syncing {
            self.lifecycle.fire(LifecycleEvent::SyncSettled)?;
        }

        if report.failed() > 0 {
            self.record_error(Some(format!(
                "{} item(s) failed to sync; retrying on the next pass",
                report.failed()
            )))
            .await;
        } else if !report.interrupted {
            self.record_error(None).await;
        }
        Ok(report)
    }

    /// Apply one watch event to the live snapshot if it belongs to
    /// `generation`.
    pub fn apply_event(&self, generation: u64, event: WatchEvent) -> bool {
        let patch = match event {
            WatchEvent::Added(info) | WatchEvent::Changed(info) => {
                match ImageRecord::from_info(info) {
                    Ok(record) => LivePatch::Upsert(record),
                    Err(e) => {
                        tracing::warn!("Ignoring watch event: {}", e);
                        return false;
                    }
                }
            }
            WatchEvent::Deleted(path) => LivePatch::RemovePath(path),
            WatchEvent::DirDeleted(path) => LivePatch::RemoveDir(path),
        };
        self.store().apply_patch(generation, patch)
    }

    /// Watch the selected directory and reconcile after each quiet period.
    ///
    /// If the adapter dropped events, the pass is preceded by a rescan. The
    /// task ends when the session is cancelled.
    pub fn spawn_watch_session(self: &Arc<Self>) -> Result<JoinHandle<()>, EngineError> {
        let Some(token) = self.session() else {
            return Err(EngineError::Lifecycle {
                status: self.lifecycle.status(),
                event: LifecycleEvent::ChangeDetected,
            });
        };
        let directory = self.directory().unwrap_or_default();
        let (adapter, mut rx) = WatchAdapter::start(&directory, self.config.event_buffer)?;
        let mut generation = self.store().generation();
        let debounce = self.config.debounce;
        let library = Arc::clone(self);

        Ok(tokio::spawn(async move {
            let mut deadline: Option<Instant> = None;
            let mut needs_rescan = false;

            loop {
                let wait = async move {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    () = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => {
                            library.apply_event(generation, event);
                            deadline = Some(Instant::now() + debounce);
                        }
                        None => break,
                    },
                    () = wait => {
                        deadline = None;
                        needs_rescan |= adapter.take_overflow();
                        if needs_rescan {
                            // The scan supersedes whatever is queued.
                            while rx.try_recv().is_ok() {}
                            match library.rescan(&directory).await {
                                Ok(next) => {
                                    generation = next;
                                    needs_rescan = false;
                                }
                                Err(e) => {
                                    tracing::warn!("Rescan after dropped watch events failed: {}", e);
                                    deadline = Some(Instant::now() + debounce);
                                    continue;
                                }
                            }
                        } else {
                            while let Ok(event) = rx.try_recv() {
                                library.apply_event(generation, event);
                            }
                        }
                        match library.reconcile().await {
                            Ok(report) if !report.is_clean() => {
                                tracing::warn!("{} item(s) left for the next pass", report.failed() + report.skipped);
                            }
                            Ok(_) => {}
                            Err(e) if e.is_concurrency_rejected() => {
                                tracing::debug!("{}; coalescing into the next pass", e);
                                deadline = Some(Instant::now() + debounce);
                            }
                            Err(e) => tracing::error!("Reconciliation failed: {}", e),
                        }
                    }
                }
            }
            tracing::info!("Stopped watching {}", directory.display());
        }))
    }
}
