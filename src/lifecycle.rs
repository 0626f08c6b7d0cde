//! Library lifecycle state machine and phase guards.
//!
//! ```text
//! Uninitialized --select--> Processing --scan ok--> PendingConfirmation
//!                               |                         |
//!                           scan error                 confirm
//!                               v                         v
//!                             Error            Watching <--> Syncing
//! ```
//!
//! Every state answers every event, either with a next state or a rejection.
//! `Error` is left only through directory selection.
//!
//! Independently of the status, three phases (processing, comparing, syncing)
//! are guarded by flags. A [`PhaseGuard`] releases its flag on drop, so every
//! exit path (success, error, early return, cancellation) frees it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::EngineError;

/// Status of the watched library. Exactly one holds at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryStatus {
    Uninitialized,
    Processing,
    PendingConfirmation,
    Watching,
    Syncing,
    Error,
}

impl LibraryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Processing => "processing",
            Self::PendingConfirmation => "pending confirmation",
            Self::Watching => "watching",
            Self::Syncing => "syncing",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LibraryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    SelectDirectory,
    ScanCompleted,
    ScanFailed,
    UserConfirmed,
    ChangeDetected,
    SyncSettled,
    StopWatching,
    FatalError,
}

/// Pure transition function.
pub fn transition(
    status: LibraryStatus,
    event: LifecycleEvent,
) -> Result<LibraryStatus, EngineError> {
    use LibraryStatus as S;
    use LifecycleEvent as E;

    let next = match (status, event) {
        (_, E::FatalError) => Some(S::Error),

        (S::Processing | S::Syncing, E::SelectDirectory) => None,
        (_, E::SelectDirectory) => Some(S::Processing),

        (S::Processing, E::ScanCompleted) => Some(S::PendingConfirmation),
        (S::Processing, E::ScanFailed) => Some(S::Error),
        (_, E::ScanCompleted | E::ScanFailed) => None,

        (S::PendingConfirmation, E::UserConfirmed) => Some(S::Watching),
        (_, E::UserConfirmed) => None,

        (S::Watching, E::ChangeDetected) => Some(S::Syncing),
        (_, E::ChangeDetected) => None,

        (S::Syncing, E::SyncSettled) => Some(S::Watching),
        (_, E::SyncSettled) => None,

        (S::Uninitialized | S::PendingConfirmation | S::Watching | S::Syncing, E::StopWatching) => {
            Some(S::Uninitialized)
        }
        (S::Processing | S::Error, E::StopWatching) => None,
    };

    next.ok_or(EngineError::Lifecycle { status, event })
}

/// Mutually exclusive pipeline phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Processing,
    Comparing,
    Syncing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Processing => "Directory processing",
            Phase::Comparing => "Snapshot comparison",
            Phase::Syncing => "Catalog sync",
        })
    }
}

#[derive(Debug, Default)]
struct PhaseFlags {
    processing: bool,
    comparing: bool,
    syncing: bool,
}

impl PhaseFlags {
    fn get_mut(&mut self, phase: Phase) -> &mut bool {
        match phase {
            Phase::Processing => &mut self.processing,
            Phase::Comparing => &mut self.comparing,
            Phase::Syncing => &mut self.syncing,
        }
    }

    /// The phase that blocks `phase` from starting, if any.
    fn conflict(&self, phase: Phase) -> Option<Phase> {
        match phase {
            // A rebuild must not overlap another rebuild or a sync batch.
            Phase::Processing if self.processing => Some(Phase::Processing),
            Phase::Processing if self.syncing => Some(Phase::Syncing),
            // Comparing against a half-built live snapshot would report
            // everything as removed.
            Phase::Comparing if self.comparing => Some(Phase::Comparing),
            Phase::Comparing if self.processing => Some(Phase::Processing),
            Phase::Syncing if self.syncing => Some(Phase::Syncing),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    status: LibraryStatus,
    directory: Option<PathBuf>,
    last_error: Option<String>,
    total_images: usize,
    last_update: Option<DateTime<Utc>>,
}

/// Point-in-time view exposed to the status layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryStats {
    pub status: LibraryStatus,
    pub directory: Option<PathBuf>,
    pub total_images: usize,
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl LibraryStats {
    /// One-line summary used by the CLI and systemd status.
    pub fn status_line(&self) -> String {
        let updated = self
            .last_update
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string());
        let mut line = format!(
            "{}: {} images, last update {}",
            self.status, self.total_images, updated
        );
        if let Some(dir) = &self.directory {
            line.push_str(&format!(" in {}", dir.display()));
        }
        if let Some(err) = &self.last_error {
            line.push_str(&format!(" (last error: {})", err));
        }
        line
    }
}

/// Shared lifecycle state for one watched directory.
#[derive(Debug)]
pub struct Lifecycle {
    inner: Mutex<Inner>,
    phases: Mutex<PhaseFlags>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                status: LibraryStatus::Uninitialized,
                directory: None,
                last_error: None,
                total_images: 0,
                last_update: None,
            }),
            phases: Mutex::new(PhaseFlags::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a panic elsewhere; the data is plain values.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> LibraryStatus {
        self.lock().status
    }

    /// Apply `event`, logging the transition.
    pub fn fire(&self, event: LifecycleEvent) -> Result<LibraryStatus, EngineError> {
        let mut inner = self.lock();
        let next = transition(inner.status, event)?;
        if next != inner.status {
            tracing::info!(from = %inner.status, to = %next, ?event, "Library status changed");
        }
        inner.status = next;
        Ok(next)
    }

    /// Record a failure and move to `Error`.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        let mut inner = self.lock();
        tracing::error!(from = %inner.status, error = %message, "Library entered error state");
        inner.status = LibraryStatus::Error;
        inner.last_error = Some(message);
    }

    pub fn set_directory(&self, directory: Option<&Path>) {
        self.lock().directory = directory.map(Path::to_path_buf);
    }

    pub fn set_last_error(&self, message: Option<String>) {
        self.lock().last_error = message;
    }

    /// Refresh the image count and stamp `last_update` with now.
    pub fn touch(&self, total_images: usize) {
        let mut inner = self.lock();
        inner.total_images = total_images;
        inner.last_update = Some(Utc::now());
    }

    pub fn stats(&self) -> LibraryStats {
        let inner = self.lock();
        LibraryStats {
            status: inner.status,
            directory: inner.directory.clone(),
            total_images: inner.total_images,
            last_update: inner.last_update,
            last_error: inner.last_error.clone(),
        }
    }

    /// Claim `phase`, or fail with `ConcurrencyRejected` if it (or a
    /// conflicting phase) is already in flight.
    pub fn try_enter(&self, phase: Phase) -> Result<PhaseGuard<'_>, EngineError> {
        let mut flags = self.phases.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(busy) = flags.conflict(phase) {
            tracing::debug!(requested = %phase, busy = %busy, "Rejecting phase request");
            return Err(EngineError::ConcurrencyRejected { phase: busy });
        }
        *flags.get_mut(phase) = true;
        Ok(PhaseGuard {
            lifecycle: self,
            phase,
        })
    }

    pub fn is_busy(&self, phase: Phase) -> bool {
        let mut flags = self.phases.lock().unwrap_or_else(|e| e.into_inner());
        *flags.get_mut(phase)
    }
}

/// Holds a phase flag; releases it on drop.
#[derive(Debug)]
pub struct PhaseGuard<'a> {
    lifecycle: &'a Lifecycle,
    phase: Phase,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        let mut flags = self
            .lifecycle
            .phases
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *flags.get_mut(self.phase) = false;
    }
}
