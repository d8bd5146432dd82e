pub mod diff;
pub mod fsck;
pub mod gc;
pub mod init;
pub mod list;
pub mod pack;
pub mod prune;
pub mod restore;
pub mod snapshot;
pub mod verify;

use crate::config::{Config, current_dir};
use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use timeclaw_core::{LockOptions, Repository};
use tracing::debug;

/// An opened destination plus the config it came from.
pub struct Session {
    pub config: Config,
    pub repo: Repository,
    pub cwd: PathBuf,
}

impl Session {
    /// Loads the config and opens the destination, which must be initialized.
    pub async fn open(cli: &crate::Cli) -> Result<Self> {
        let config = Config::load(cli.config.as_deref()).await?;
        let repo = Repository::open(&config.dest, &config.settings.machine_id).await?;
        debug!(
            config = %config.path.display(),
            dest = %config.dest.display(),
            machine = %config.settings.machine_id,
            "opened destination"
        );
        Ok(Self {
            config,
            repo,
            cwd: current_dir()?,
        })
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        crate::config::absolutize(path, &self.cwd)
    }
}

pub fn lock_options(cli: &crate::Cli) -> LockOptions {
    LockOptions {
        force: cli.force_lock,
        ..LockOptions::default()
    }
}

/// Prints `value` as JSON with `--json`, otherwise runs the human renderer.
pub fn emit<T: Serialize>(cli: &crate::Cli, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }
}
