use super::{Session, emit, format_bytes, lock_options};
use anyhow::Result;
use clap::Args;
use timeclaw_core::integrity::gc;

#[derive(Args)]
pub struct GcCommand {
    #[arg(long, help = "Report what would be removed")]
    dry_run: bool,
}

impl GcCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let session = Session::open(cli).await?;
        let report = gc(&session.repo, self.dry_run, &lock_options(cli)).await?;

        emit(cli, &report, |r| {
            let verb = if r.dry_run { "Would remove" } else { "Removed" };
            println!(
                "{verb} {} objects ({}), kept {} ({})",
                r.removed,
                format_bytes(r.bytes_removed),
                r.kept,
                format_bytes(r.bytes_kept)
            );
            if r.temp_removed > 0 {
                println!("{verb} {} leftover temp files", r.temp_removed);
            }
        })
    }
}
