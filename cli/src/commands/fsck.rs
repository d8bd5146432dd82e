use super::{Session, emit};
use anyhow::Result;
use clap::Args;
use timeclaw_core::integrity::fsck;

#[derive(Args)]
pub struct FsckCommand {
    #[arg(long, help = "Re-hash every referenced object")]
    verify_hash: bool,
}

impl FsckCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let session = Session::open(cli).await?;
        let report = fsck(&session.repo, self.verify_hash).await?;

        emit(cli, &report, |r| {
            println!(
                "✅ {} snapshots checked, {} manifests ok",
                r.snapshots_checked, r.manifests_ok
            );
            if !r.missing_manifests.is_empty() {
                println!(
                    "ℹ️  {} snapshots without a manifest: {}",
                    r.missing_manifests.len(),
                    r.missing_manifests.join(", ")
                );
            }
        })
    }
}
