use super::{Session, emit, lock_options};
use anyhow::Result;
use chrono::Utc;
use clap::Args;
use timeclaw_core::retention::prune;

#[derive(Args)]
pub struct PruneCommand {
    #[arg(long, help = "Report which snapshots would be removed")]
    dry_run: bool,

    #[arg(long, help = "Override the hourly window (hours)")]
    hourly_hours: Option<u32>,

    #[arg(long, help = "Override the daily window (days)")]
    daily_days: Option<u32>,

    #[arg(long, help = "Override the weekly window (weeks)")]
    weekly_weeks: Option<u32>,
}

impl PruneCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let session = Session::open(cli).await?;
        let mut policy = session.config.settings.retention;
        if let Some(hours) = self.hourly_hours {
            policy.hourly_hours = hours;
        }
        if let Some(days) = self.daily_days {
            policy.daily_days = days;
        }
        if let Some(weeks) = self.weekly_weeks {
            policy.weekly_weeks = weeks;
        }

        let report = prune(&session.repo, &policy, Utc::now(), self.dry_run, &lock_options(cli)).await?;

        emit(cli, &report, |r| {
            let verb = if r.dry_run { "Would remove" } else { "Removed" };
            for id in &r.removed {
                println!("🗑️  {verb} {id}");
            }
            println!("{verb} {} snapshots, kept {}", r.removed.len(), r.kept.len());
        })
    }
}
