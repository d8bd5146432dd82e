use super::{Session, emit, format_bytes};
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use timeclaw_core::restore::{default_restore_dir, restore};
use tracing::info;

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(help = "Snapshot ID to restore from")]
    snapshot_id: String,

    #[arg(long, help = "Target directory for restore")]
    target: Option<PathBuf>,

    #[arg(long, help = "Check the snapshot without writing")]
    dry_run: bool,
}

impl RestoreCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let session = Session::open(cli).await?;
        let target = match &self.target {
            Some(target) => session.resolve(target),
            None => session.cwd.join(default_restore_dir(&self.snapshot_id)),
        };

        info!("Restoring snapshot {} into {}", self.snapshot_id, target.display());
        let report = restore(&session.repo, &self.snapshot_id, &target, self.dry_run).await?;

        emit(cli, &report, |r| {
            if r.dry_run {
                println!("Dry run - would restore {} files into {}", r.files, r.target.display());
            } else {
                println!("✅ Restore completed!");
                println!("📁 Restored: {} files ({})", r.files, format_bytes(r.bytes));
                println!("📂 Location: {}", r.target.display());
            }
        })
    }
}
