//! Time-Machine-style decay: hourly snapshots for a day, daily for a month,
//! weekly after that.

use crate::lock::{LockOptions, MachineLock};
use crate::repository::Repository;
use crate::types::parse_snapshot_id;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tokio::fs;
use tracing::info;

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 24 * HOUR_MS;
const WEEK_MS: i64 = 7 * DAY_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetentionConfig {
    pub hourly_hours: u32,
    pub daily_days: u32,
    pub weekly_weeks: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            hourly_hours: 24,
            daily_days: 30,
            weekly_weeks: 520,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotStamp {
    pub id: String,
    pub timestamp: DateTime<Utc>,
}

/// Ids to keep. The newest snapshot always survives; otherwise each
/// hour/day/week bucket keeps the earliest snapshot that falls into it.
pub fn classify(
    snapshots: &[SnapshotStamp],
    now: DateTime<Utc>,
    config: &RetentionConfig,
) -> BTreeSet<String> {
    let mut by_time: Vec<&SnapshotStamp> = snapshots.iter().collect();
    by_time.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

    let mut keep = BTreeSet::new();
    if let Some(newest) = by_time.last() {
        keep.insert(newest.id.clone());
    }

    let hourly_window = i64::from(config.hourly_hours) * HOUR_MS;
    let daily_window = i64::from(config.daily_days) * DAY_MS;
    let weekly_window = i64::from(config.weekly_weeks) * WEEK_MS;

    let mut hourly: HashMap<i64, &str> = HashMap::new();
    let mut daily: HashMap<i64, &str> = HashMap::new();
    let mut weekly: HashMap<i64, &str> = HashMap::new();

    let now_ms = now.timestamp_millis();
    for snap in by_time {
        let ts = snap.timestamp.timestamp_millis();
        let age = now_ms - ts;
        let (buckets, bucket) = if age <= hourly_window {
            (&mut hourly, ts.div_euclid(HOUR_MS))
        } else if age <= daily_window {
            (&mut daily, ts.div_euclid(DAY_MS))
        } else if age <= weekly_window {
            (&mut weekly, ts.div_euclid(WEEK_MS))
        } else {
            continue;
        };
        buckets.entry(bucket).or_insert(snap.id.as_str());
    }

    for id in hourly.values().chain(daily.values()).chain(weekly.values()) {
        keep.insert(id.to_string());
    }
    keep
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub dry_run: bool,
    pub kept: Vec<String>,
    pub removed: Vec<String>,
}

/// Applies the retention policy to the machine's snapshot directories.
/// Ids that are not timestamps are left alone.
pub async fn prune(
    repo: &Repository,
    config: &RetentionConfig,
    now: DateTime<Utc>,
    dry_run: bool,
    lock: &LockOptions,
) -> Result<PruneReport> {
    let held = if dry_run {
        None
    } else {
        Some(MachineLock::acquire(repo, "prune", lock).await?)
    };
    let result = prune_unlocked(repo, config, now, dry_run).await;
    match held {
        Some(held) => held.release_after(result).await,
        None => result,
    }
}

async fn prune_unlocked(
    repo: &Repository,
    config: &RetentionConfig,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<PruneReport> {
    let ids = repo.snapshot_ids().await?;
    let stamps: Vec<SnapshotStamp> = ids
        .iter()
        .filter_map(|id| {
            parse_snapshot_id(id).map(|timestamp| SnapshotStamp {
                id: id.clone(),
                timestamp,
            })
        })
        .collect();
    let keep = classify(&stamps, now, config);

    let mut report = PruneReport {
        dry_run,
        kept: Vec::new(),
        removed: Vec::new(),
    };
    for id in ids {
        let dated = stamps.iter().any(|s| s.id == id);
        if !dated || keep.contains(&id) {
            report.kept.push(id);
            continue;
        }
        if !dry_run {
            fs::remove_dir_all(repo.snapshot_dir(&id))
                .await
                .map_err(|e| Error::io(format!("removing snapshot {id}"), e))?;
            info!(snapshot = %id, "pruned snapshot");
        }
        report.removed.push(id);
    }
    Ok(report)
}
