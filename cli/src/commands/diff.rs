use super::{Session, emit};
use anyhow::Result;
use clap::Args;
use timeclaw_core::integrity::diff_snapshots;

#[derive(Args)]
pub struct DiffCommand {
    #[arg(help = "Older snapshot ID")]
    a: String,

    #[arg(help = "Newer snapshot ID")]
    b: String,
}

impl DiffCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let session = Session::open(cli).await?;
        let report = diff_snapshots(&session.repo, &self.a, &self.b).await?;

        emit(cli, &report, |r| {
            for rel in &r.added {
                println!("+ {rel}");
            }
            for rel in &r.removed {
                println!("- {rel}");
            }
            for rel in &r.changed {
                println!("~ {rel}");
            }
            println!(
                "{} added, {} removed, {} changed ({} -> {} files)",
                r.summary.added, r.summary.removed, r.summary.changed, r.summary.total_a, r.summary.total_b
            );
        })
    }
}
