use super::{Session, emit};
use anyhow::Result;
use clap::Args;
use serde::Serialize;
use timeclaw_core::repository::SnapshotSummary;

#[derive(Args)]
pub struct ListCommand {
    #[arg(long, help = "Show only the latest N snapshots")]
    latest: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListReport {
    latest: Option<String>,
    snapshots: Vec<SnapshotSummary>,
}

impl ListCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let session = Session::open(cli).await?;
        let mut snapshots = session.repo.list_snapshots().await?;
        if let Some(latest) = self.latest {
            let skip = snapshots.len().saturating_sub(latest);
            snapshots.drain(..skip);
        }
        let report = ListReport {
            latest: session.repo.read_latest().await?,
            snapshots,
        };

        emit(cli, &report, |r| {
            if r.snapshots.is_empty() {
                println!("No snapshots found");
                return;
            }
            println!("{:<26} {:<12} {:>7}  {}", "ID", "Layout", "Files", "Label");
            println!("{:-<70}", "");
            for s in &r.snapshots {
                let marker = if r.latest.as_deref() == Some(s.id.as_str()) { " *" } else { "" };
                println!(
                    "{:<26} {:<12} {:>7}  {}{}",
                    s.id,
                    s.layout,
                    s.files.map(|f| f.to_string()).unwrap_or_else(|| "-".to_string()),
                    s.label.as_deref().unwrap_or(""),
                    marker
                );
            }
        })
    }
}
