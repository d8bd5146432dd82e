use super::{Session, emit, lock_options};
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use timeclaw_core::pack::{default_pack_name, export_pack, import_pack};
use tracing::info;

#[derive(Args)]
pub struct ExportCommand {
    #[arg(help = "Snapshot ID to export")]
    snapshot_id: String,

    #[arg(long, help = "Output pack path")]
    out: Option<PathBuf>,
}

impl ExportCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let session = Session::open(cli).await?;
        let out = match &self.out {
            Some(out) => session.resolve(out),
            None => session.cwd.join(default_pack_name(&self.snapshot_id)),
        };

        info!("Exporting {} to {}", self.snapshot_id, out.display());
        let report = export_pack(&session.repo, &self.snapshot_id, &out).await?;

        emit(cli, &report, |r| {
            println!("📦 Exported {} ({} objects)", r.snapshot_id, r.objects);
            println!("📂 Pack: {}", r.out.display());
        })
    }
}

#[derive(Args)]
pub struct ImportCommand {
    #[arg(help = "Pack file to import")]
    pack: PathBuf,

    #[arg(long, help = "Overwrite an existing snapshot manifest")]
    force: bool,
}

impl ImportCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let session = Session::open(cli).await?;
        let pack = session.resolve(&self.pack);

        info!("Importing {}", pack.display());
        let report = import_pack(&session.repo, &pack, self.force, &lock_options(cli)).await?;

        emit(cli, &report, |r| {
            println!("✅ Imported {}", r.snapshot_id);
            println!(
                "📁 Objects: {} referenced, {} received, {} new",
                r.referenced, r.received, r.stored
            );
        })
    }
}
