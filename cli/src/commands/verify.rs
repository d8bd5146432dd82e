use super::{Session, emit, lock_options};
use crate::Reported;
use anyhow::{Result, anyhow};
use clap::Args;
use timeclaw_core::integrity::verify;
use timeclaw_core::legacy::{self, Layout, migrate_locked};
use tracing::info;

#[derive(Args)]
pub struct VerifyCommand {
    #[arg(help = "Snapshot ID (defaults to the latest snapshot)")]
    snapshot_id: Option<String>,

    #[arg(long, help = "Migrate a legacy snapshot before verifying it")]
    migrate: bool,

    #[arg(long, help = "With --migrate, report what would be migrated only")]
    dry_run: bool,
}

impl VerifyCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let session = Session::open(cli).await?;
        let snapshot_id = match &self.snapshot_id {
            Some(id) => id.clone(),
            None => session
                .repo
                .read_latest()
                .await?
                .ok_or_else(|| anyhow!("No snapshots yet; pass a snapshot id"))?,
        };

        if self.migrate {
            let snapshot_dir = session.repo.snapshot_dir(&snapshot_id);
            if matches!(legacy::detect(&snapshot_dir).await, Layout::LegacyTree) {
                let report =
                    migrate_locked(&session.repo, &snapshot_id, None, self.dry_run, &lock_options(cli))
                        .await?;
                info!(snapshot = %snapshot_id, files = report.files, "migration finished");
                if self.dry_run {
                    return emit(cli, &report, |r| {
                        println!("Dry run - would migrate {} files in {}", r.files, r.snapshot_id);
                    });
                }
            }
        }

        let report = verify(&session.repo, &snapshot_id).await?;
        emit(cli, &report, |r| {
            for check in r.checks.iter().filter(|c| !c.matched) {
                let why = check.error.as_deref().unwrap_or("hash mismatch");
                println!("❌ {} ({}): {}", check.rel, check.hash, why);
            }
            if r.ok {
                println!("✅ {}: {} files verified", r.snapshot_id, r.checked);
            } else {
                let failed = r.checks.iter().filter(|c| !c.matched).count();
                println!("❌ {}: {failed} of {} files failed verification", r.snapshot_id, r.checked);
            }
        })?;

        if report.ok {
            Ok(())
        } else {
            Err(Reported(6).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Cli, Commands};
    use clap::Parser;
    use std::path::Path;
    use tempfile::TempDir;
    use timeclaw_core::Repository;

    const ID: &str = "2025-12-01T08-00-00.000Z";

    async fn run_verify(config: &Path, extra: &[&str]) -> anyhow::Result<()> {
        let mut args = vec!["timeclaw", "--config", config.to_str().unwrap(), "verify", ID];
        args.extend_from_slice(extra);
        let cli = Cli::parse_from(args);
        let Commands::Verify(cmd) = &cli.command else {
            panic!("parsed a different command");
        };
        cmd.run(&cli).await
    }

    #[tokio::test]
    async fn test_migrate_repairs_malformed_manifest() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("dest");
        let repo = Repository::init(&dest, "m1").await.unwrap();
        let config = dir.path().join("timeclaw.config.json");
        let settings = serde_json::json!({ "dest": dest, "machineId": "m1" });
        std::fs::write(&config, settings.to_string()).unwrap();

        let snap = repo.snapshot_dir(ID);
        std::fs::create_dir_all(&snap).unwrap();
        std::fs::write(snap.join("a.txt"), b"alpha").unwrap();
        std::fs::write(snap.join("manifest.json"), b"{ broken").unwrap();

        let err = run_verify(&config, &[]).await.unwrap_err();
        let core = err.downcast_ref::<timeclaw_core::Error>().unwrap();
        assert_eq!(core.code(), "SNAPSHOT_LEGACY");

        run_verify(&config, &["--migrate"]).await.unwrap();
        let manifest = repo.load_manifest(ID).await.unwrap();
        assert!(manifest.legacy.is_some());
        assert_eq!(manifest.sha256.len(), 1);
        assert!(manifest.sha256.contains_key("a.txt"));
        assert!(!repo.lock_dir().exists());
    }
}
