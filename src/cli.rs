use clap::{Args, Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "imgsync",
    version,
    about = "Keep a remote image catalog in step with a local photo directory",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Arguments for the default `watch` command
    #[command(flatten)]
    pub watch: SyncArgs,

    #[command(flatten)]
    pub global: GlobalArgs,
}

impl Cli {
    /// The subcommand to run, `watch` when none was given.
    pub fn effective_command(self) -> Command {
        self.command.unwrap_or(Command::Watch(self.watch))
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scan, confirm, sync, then watch for changes until interrupted
    Watch(SyncArgs),

    /// Scan and sync once, then exit (non-zero if any item failed)
    Sync(SyncArgs),

    /// Show what a sync would add and remove, without contacting the catalog
    Diff(DiffArgs),

    /// Show the persisted snapshot and recent sync runs
    Status(StatusArgs),

    /// Delete the state database, forcing a full resync
    ResetState(ResetStateArgs),
}

/// Options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Directory holding the state database
    #[arg(long, global = true, default_value = "~/.imgsync")]
    pub state_dir: String,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Args, Debug, Clone, Default)]
pub struct SyncArgs {
    /// Photo directory to watch
    #[arg(short = 'd', long)]
    pub directory: Option<String>,

    /// Catalog server base URL
    #[arg(long, env = "IMGSYNC_SERVER_URL")]
    pub server_url: Option<String>,

    /// Catalog bearer token.
    /// WARNING: passing via --token is visible in process listings.
    /// Prefer the IMGSYNC_TOKEN environment variable instead.
    #[arg(long, env = "IMGSYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Catalog owner ID (sent as `userId`)
    #[arg(long, env = "IMGSYNC_OWNER_ID")]
    pub owner_id: Option<String>,

    /// Device name (sent as `dev`)
    #[arg(long, default_value = "development")]
    pub device: String,

    /// Maximum catalog calls in flight
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Retries per catalog call on transient failures
    #[arg(long, default_value_t = 2)]
    pub max_retries: u32,

    /// Base delay in seconds between retries (doubles each attempt)
    #[arg(long, default_value_t = 5)]
    pub retry_delay: u64,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 120)]
    pub request_timeout: u64,

    /// Quiet period in milliseconds after the last change before syncing
    #[arg(long, default_value_t = 500)]
    pub debounce_ms: u64,

    /// Watch events buffered before new ones are dropped
    #[arg(long, default_value_t = 1024)]
    pub event_buffer: usize,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,

    /// Send sd_notify messages (READY, STATUS, STOPPING)
    #[arg(long)]
    pub notify_systemd: bool,

    /// Sync without asking for confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DiffArgs {
    /// Photo directory to compare
    #[arg(short = 'd', long)]
    pub directory: String,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Number of recent sync runs to show
    #[arg(long, default_value_t = 5)]
    pub runs: u32,
}

#[derive(Args, Debug, Clone)]
pub struct ResetStateArgs {
    /// Skip confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,
}
