use super::{Session, emit, lock_options};
use anyhow::Result;
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use timeclaw_core::create_snapshot;
use tracing::info;

#[derive(Args)]
pub struct SnapshotCommand {
    #[arg(long, help = "Label stored in the manifest")]
    label: Option<String>,

    #[arg(long, help = "Report what would be captured without writing")]
    dry_run: bool,

    #[arg(long, help = "Re-hash every file instead of trusting size and mtime")]
    no_trust_mtime: bool,

    #[arg(long, help = "Number of parallel hash workers")]
    workers: Option<usize>,
}

impl SnapshotCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let session = Session::open(cli).await?;
        let mut req = session.config.settings.snapshot_request(&session.cwd);
        req.label = self.label.clone();
        req.dry_run = self.dry_run;
        if self.no_trust_mtime {
            req.trust_mtime = false;
        }
        if let Some(workers) = self.workers {
            req.hash_workers = workers.max(1);
        }

        info!("Snapshotting {}", req.source_root.display());

        let pb = if cli.json || cli.quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap(),
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(if self.dry_run {
            "Scanning files..."
        } else {
            "Hashing and storing files..."
        });

        let result = create_snapshot(&session.repo, &req, &lock_options(cli)).await;
        pb.finish_and_clear();
        let result = result?;

        emit(cli, &result, |r| match &r.manifest {
            Some(manifest) => {
                println!("✅ Snapshot completed successfully!");
                println!("📸 Snapshot: {}", r.snapshot_id);
                if let Some(label) = &manifest.label {
                    println!("🏷️  Label: {label}");
                }
                println!("📁 Files: {}", manifest.stats.files);
                println!("💾 Stored: {}  Reused: {}", manifest.stats.stored, manifest.stats.reused);
            }
            None => {
                println!("Dry run completed - would snapshot {} files as {}", r.candidates, r.snapshot_id);
            }
        })
    }
}
