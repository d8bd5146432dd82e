use crate::config::{self, CONFIG_FILE, Settings, absolutize, current_dir};
use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use timeclaw_core::Repository;
use tracing::info;

#[derive(Args)]
pub struct InitCommand {
    #[arg(long, help = "Backup destination path (defaults to the config's dest)")]
    dest: Option<PathBuf>,

    #[arg(long = "machine", help = "Machine id (defaults to the hostname)")]
    machine_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitReport {
    ok: bool,
    dest: PathBuf,
    machine_id: String,
    config: PathBuf,
    config_written: bool,
}

impl InitCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let cwd = current_dir()?;
        let config_path = cli
            .config
            .as_deref()
            .map(|p| absolutize(p, &cwd))
            .unwrap_or_else(|| cwd.join(CONFIG_FILE));

        let existing = if config_path.is_file() {
            let raw = tokio::fs::read_to_string(&config_path).await?;
            Some(Settings::parse(&config_path, &raw)?)
        } else {
            None
        };

        let dest = match (&self.dest, existing.as_ref().and_then(|s| s.dest.as_ref())) {
            (Some(dest), _) | (None, Some(dest)) => absolutize(dest, &cwd),
            (None, None) => return Err(timeclaw_core::Error::ConfigMissingDest.into()),
        };
        let machine_id = self
            .machine_id
            .clone()
            .or_else(|| existing.as_ref().map(|s| s.machine_id.clone()))
            .unwrap_or_else(config::default_machine_id);

        info!("Initializing destination at: {}", dest.display());
        Repository::init(&dest, &machine_id).await?;

        let config_written = existing.is_none();
        if config_written {
            let starter = Settings::starter(&dest, &machine_id, &cwd);
            if let Some(parent) = config_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&config_path, starter.to_document(&config_path)?).await?;
        }

        let report = InitReport {
            ok: true,
            dest,
            machine_id,
            config: config_path,
            config_written,
        };
        super::emit(cli, &report, |r| {
            println!("✅ Initialized {} for machine {}", r.dest.display(), r.machine_id);
            if r.config_written {
                println!("📝 Wrote starter config: {}", r.config.display());
            } else {
                println!("📝 Using config: {}", r.config.display());
            }
        })
    }
}
