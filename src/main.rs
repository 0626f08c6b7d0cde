//! imgsync: keeps a remote image catalog in step with a local photo directory.
//!
//! Images are identified by a content key derived from file name, size and
//! modification time, so moving a file is free and editing it is a remove
//! plus an add. A full scan builds the live snapshot, filesystem events patch
//! it, and each reconciliation pass pushes the difference against the last
//! acknowledged (persisted) snapshot to the catalog.

#![warn(clippy::all)]

mod catalog;
mod cli;
mod config;
mod error;
mod key;
mod library;
mod lifecycle;
mod reconcile;
mod retry;
mod scan;
mod shutdown;
mod snapshot;
mod state;
mod sync;
mod systemd;
mod types;
mod watch;

use std::io::{IsTerminal, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Command, GlobalArgs};
use config::Config;
use library::Library;
use reconcile::ChangeSet;
use snapshot::Snapshot;
use state::StateDb;
use systemd::SystemdNotifier;
use types::RunMode;

/// How often the watch loop refreshes the systemd status line.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Changes listed individually before the rest are summarized.
const MAX_LISTED_CHANGES: usize = 20;

fn print_changes(changes: &ChangeSet) {
    println!(
        "{} to add, {} to remove",
        changes.added.len(),
        changes.removed.len()
    );
    let mut listed = 0;
    for (sign, records) in [("+", &changes.added), ("-", &changes.removed)] {
        for record in records.iter() {
            if listed == MAX_LISTED_CHANGES {
                println!("  ... and {} more", changes.len() - listed);
                return;
            }
            println!("  {} {} ({})", sign, record.file_path.display(), record.content_key);
            listed += 1;
        }
    }
}

/// Ask a y/N question on the terminal.
fn confirm(question: &str) -> anyhow::Result<bool> {
    print!("{} [y/N] ", question);
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Run the status command.
async fn run_status(global: &GlobalArgs, args: cli::StatusArgs) -> anyhow::Result<()> {
    let db_path = config::state_db_path(&global.state_dir);

    if !db_path.exists() {
        println!("No state database found at {}", db_path.display());
        println!("Run a sync first to create the database.");
        return Ok(());
    }

    let db = state::SqliteStateDb::open(&db_path).await?;
    let summary = db.get_summary().await?;

    println!("State Database: {}", db_path.display());
    println!();
    println!("Persisted snapshot:");
    println!("  Images:     {}", summary.total_images);
    println!("  Size:       {} bytes", summary.total_bytes);
    if let Some(scheme) = &summary.identity_scheme {
        println!("  Identity:   {}", scheme);
    }
    if let Some(updated) = &summary.last_update {
        println!("  Updated:    {}", updated.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(err) = &summary.last_error {
        println!("  Last error: {}", err);
    }

    let runs = db.recent_sync_runs(args.runs).await?;
    if !runs.is_empty() {
        println!();
        println!("Recent sync runs:");
        for run in runs {
            let state = match (&run.completed_at, run.stats.interrupted) {
                (None, _) => "incomplete".to_string(),
                (Some(_), true) => "interrupted".to_string(),
                (Some(done), false) => format!("done {}", done.format("%H:%M:%S")),
            };
            println!(
                "  #{} {} {}: +{} -{} failed {} ({})",
                run.id,
                run.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                run.directory.display(),
                run.stats.added,
                run.stats.removed,
                run.stats.failed,
                state
            );
        }
    }

    Ok(())
}

/// Run the reset-state command.
fn run_reset_state(global: &GlobalArgs, args: cli::ResetStateArgs) -> anyhow::Result<()> {
    let db_path = config::state_db_path(&global.state_dir);

    if !db_path.exists() {
        println!("No state database found at {}", db_path.display());
        return Ok(());
    }

    if !args.yes {
        println!("This will delete the state database at:");
        println!("  {}", db_path.display());
        println!("The next sync will re-upload every image.");
        println!();
        if !confirm("Are you sure?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    std::fs::remove_file(&db_path)?;
    println!("State database deleted.");

    let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
    let _ = std::fs::remove_file(db_path.with_extension("db-shm"));

    Ok(())
}

/// Run the diff command: scan and compare, no catalog I/O.
async fn run_diff(global: &GlobalArgs, args: cli::DiffArgs) -> anyhow::Result<()> {
    let db_path = config::state_db_path(&global.state_dir);
    let directory = config::expand_tilde(&args.directory);

    let persisted = if db_path.exists() {
        state::SqliteStateDb::open(&db_path)
            .await?
            .load_persisted()
            .await?
    } else {
        Snapshot::new()
    };
    let outcome = scan::scan_directory(&directory).await?;
    if outcome.skipped > 0 {
        println!("{} unreadable entries skipped", outcome.skipped);
    }
    let live: Snapshot = outcome.records.into_iter().collect();
    print_changes(&reconcile::diff(&live, &persisted));
    Ok(())
}

fn report_failures(report: &sync::SyncReport) {
    for failure in report.failures() {
        if let Err(e) = &failure.result {
            println!("  {} {}: {}", failure.operation, failure.file_path.display(), e);
        }
    }
}

/// Run the watch and sync commands.
async fn run_sync(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        concurrency = config.library.sync.concurrency,
        directory = %config.directory().display(),
        "Starting imgsync"
    );
    let shutdown = shutdown::install_signal_handler()?;
    let notifier = SystemdNotifier::new(config.notify_systemd);

    let db_path = config.state_db_path();
    let state: Arc<dyn StateDb> = Arc::new(state::SqliteStateDb::open(&db_path).await?);
    tracing::debug!("State database at {}", db_path.display());
    let catalog = Arc::new(catalog::HttpCatalog::new(&config.catalog)?);
    let library = Library::open(state, catalog, config.library.clone(), shutdown.clone()).await?;

    library.select_directory(config.directory()).await?;
    let preview = library.diff_preview()?;
    print_changes(&preview);

    if !config.assume_yes && !preview.is_empty() {
        if !std::io::stdin().is_terminal() {
            anyhow::bail!("Not running interactively; pass --yes to sync without confirmation");
        }
        if !confirm("Sync these changes to the catalog?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }
    library.confirm()?;

    match config.mode {
        RunMode::Once => run_once(&library).await,
        RunMode::Watch => run_watch(&library, &notifier, &shutdown, config.directory()).await,
    }
}

async fn run_once(library: &Arc<Library>) -> anyhow::Result<()> {
    let report = library.reconcile().await?;
    library.stop_watching()?;

    if report.interrupted {
        anyhow::bail!("Sync interrupted; unconfirmed changes will be retried next run");
    }
    if report.failed() > 0 {
        println!("Failed items:");
        report_failures(&report);
        anyhow::bail!("{} item(s) failed to sync", report.failed());
    }
    println!("{}", library.stats().status_line());
    Ok(())
}

async fn run_watch(
    library: &Arc<Library>,
    notifier: &SystemdNotifier,
    shutdown: &tokio_util::sync::CancellationToken,
    directory: &Path,
) -> anyhow::Result<()> {
    // Watch before the first pass so changes made during it are not missed.
    let session = library.spawn_watch_session()?;

    match library.reconcile().await {
        Ok(report) => report_failures(&report),
        Err(e) if e.is_concurrency_rejected() => {
            tracing::debug!("Initial pass deferred to the watch session: {}", e);
        }
        Err(e) => return Err(e.into()),
    }

    notifier.notify_ready();
    notifier.notify_stats(&library.stats());
    tracing::info!("Watching {} for changes (Ctrl+C to stop)", directory.display());

    let mut status_tick = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = status_tick.tick() => notifier.notify_stats(&library.stats()),
        }
    }

    notifier.notify_stopping();
    if let Err(e) = library.stop_watching() {
        tracing::debug!("Stopping watch: {}", e);
    }
    session.await?;
    println!("{}", library.stats().status_line());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.global.log_level.as_filter())),
        )
        .init();

    let global = cli.global.clone();
    match cli.effective_command() {
        Command::Status(args) => run_status(&global, args).await,
        Command::ResetState(args) => run_reset_state(&global, args),
        Command::Diff(args) => run_diff(&global, args).await,
        Command::Sync(args) => run_sync(Config::from_cli(args, &global, RunMode::Once)?).await,
        Command::Watch(args) => run_sync(Config::from_cli(args, &global, RunMode::Watch)?).await,
    }
}
