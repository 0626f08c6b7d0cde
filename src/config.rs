use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::CatalogConfig;
use crate::cli::{GlobalArgs, SyncArgs};
use crate::library::LibraryConfig;
use crate::retry::RetryConfig;
use crate::sync::SyncConfig;
use crate::types::RunMode;

/// File name of the state database inside the state directory.
pub const STATE_DB_FILE: &str = "library.db";

/// Upper bound for the exponential retry delay.
const MAX_RETRY_DELAY_SECS: u64 = 60;

/// Resolved configuration for the `watch` and `sync` commands.
pub struct Config {
    pub directory: PathBuf,
    pub state_dir: PathBuf,
    pub catalog: CatalogConfig,
    pub library: LibraryConfig,
    pub mode: RunMode,
    pub notify_systemd: bool,
    pub assume_yes: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // CatalogConfig's Debug redacts the token.
        f.debug_struct("Config")
            .field("directory", &self.directory)
            .field("state_dir", &self.state_dir)
            .field("catalog", &self.catalog)
            .field("mode", &self.mode)
            .field("concurrency", &self.library.sync.concurrency)
            .finish_non_exhaustive()
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Path of the state database for `--state-dir`.
pub fn state_db_path(state_dir: &str) -> PathBuf {
    expand_tilde(state_dir).join(STATE_DB_FILE)
}

impl Config {
    pub fn from_cli(args: SyncArgs, global: &GlobalArgs, mode: RunMode) -> anyhow::Result<Self> {
        let directory = args
            .directory
            .as_deref()
            .map(expand_tilde)
            .ok_or_else(|| anyhow::anyhow!("--directory is required"))?;

        let server_url = args
            .server_url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("--server-url (or IMGSYNC_SERVER_URL) is required"))?;
        if !(server_url.starts_with("http://") || server_url.starts_with("https://")) {
            anyhow::bail!("--server-url must start with http:// or https://, got '{}'", server_url);
        }

        let owner_id = args
            .owner_id
            .filter(|o| !o.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("--owner-id (or IMGSYNC_OWNER_ID) is required"))?;

        if args.concurrency == 0 {
            anyhow::bail!("--concurrency must be at least 1");
        }
        if args.event_buffer == 0 {
            anyhow::bail!("--event-buffer must be at least 1");
        }

        let retry = RetryConfig {
            max_retries: args.max_retries,
            base_delay_secs: args.retry_delay,
            max_delay_secs: MAX_RETRY_DELAY_SECS.max(args.retry_delay),
        };

        Ok(Self {
            directory,
            state_dir: expand_tilde(&global.state_dir),
            catalog: CatalogConfig {
                server_url,
                token: args.token.filter(|t| !t.is_empty()),
                owner_id,
                device: args.device,
                timeout: Duration::from_secs(args.request_timeout.max(1)),
            },
            library: LibraryConfig {
                sync: SyncConfig {
                    concurrency: args.concurrency,
                    retry,
                    no_progress_bar: args.no_progress_bar,
                },
                debounce: Duration::from_millis(args.debounce_ms),
                event_buffer: args.event_buffer,
            },
            mode,
            notify_systemd: args.notify_systemd,
            assume_yes: args.yes,
        })
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.state_dir.join(STATE_DB_FILE)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}
