//! Per-machine mutual exclusion.
//!
//! The lock is the `lock/` directory under the machine root: `create_dir`
//! either creates it or fails because it exists, which makes it the
//! test-and-set. `lock.json` inside it is diagnostic only.

use crate::repository::{Repository, write_json};
use crate::types::iso_now;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

pub const LOCK_FILE: &str = "lock.json";
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Who holds the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub pid: u32,
    pub hostname: String,
    pub started_at: String,
    #[serde(default)]
    pub command: Option<String>,
}

impl LockRecord {
    pub fn current(command: &str) -> Self {
        Self {
            pid: std::process::id(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            started_at: iso_now(),
            command: Some(command.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    /// Break an existing lock instead of failing.
    pub force: bool,
    /// Age beyond which a held lock is reported as possibly stale.
    pub max_age: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            force: false,
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

/// A held machine lock. Release it with [`MachineLock::release`] or
/// [`MachineLock::release_after`].
#[derive(Debug)]
pub struct MachineLock {
    dir: PathBuf,
    record: LockRecord,
}

impl MachineLock {
    pub async fn acquire(repo: &Repository, command: &str, opts: &LockOptions) -> Result<Self> {
        fs::create_dir_all(repo.machine_root())
            .await
            .map_err(|e| Error::io("creating machine root", e))?;

        let dir = repo.lock_dir();
        match Self::attempt(&dir, command).await {
            Ok(lock) => Ok(lock),
            Err(AttemptError::Held) if opts.force => {
                warn!(lock = %dir.display(), command, "breaking existing lock");
                fs::remove_dir_all(&dir)
                    .await
                    .map_err(|e| Error::io("removing lock", e))?;
                match Self::attempt(&dir, command).await {
                    Ok(lock) => Ok(lock),
                    Err(AttemptError::Held) => Err(contention(&dir, command, opts.max_age).await),
                    Err(AttemptError::Failed(e)) => Err(e),
                }
            }
            Err(AttemptError::Held) => Err(contention(&dir, command, opts.max_age).await),
            Err(AttemptError::Failed(e)) => Err(e),
        }
    }

    async fn attempt(dir: &Path, command: &str) -> std::result::Result<Self, AttemptError> {
        match fs::create_dir(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Err(AttemptError::Held),
            Err(e) => return Err(AttemptError::Failed(Error::io("creating lock", e))),
        }

        let record = LockRecord::current(command);
        write_json(&dir.join(LOCK_FILE), &record)
            .await
            .map_err(AttemptError::Failed)?;
        info!(lock = %dir.display(), command, pid = record.pid, "acquired machine lock");
        Ok(Self {
            dir: dir.to_path_buf(),
            record,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub async fn release(self) -> Result<()> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io("releasing lock", e)),
        }
        debug!(lock = %self.dir.display(), "released machine lock");
        Ok(())
    }

    /// Releases the lock and returns `result`. A release failure surfaces
    /// only when the command itself succeeded; otherwise it is logged and
    /// the command's error wins.
    pub async fn release_after<T>(self, result: Result<T>) -> Result<T> {
        let dir = self.dir.clone();
        match (result, self.release().await) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                warn!(lock = %dir.display(), error = %release_err, "failed to release lock");
                Err(err)
            }
        }
    }
}

enum AttemptError {
    Held,
    Failed(Error),
}

/// Reads whatever the current holder left behind.
pub async fn read_holder(dir: &Path) -> Option<LockRecord> {
    let data = fs::read(dir.join(LOCK_FILE)).await.ok()?;
    serde_json::from_slice(&data).ok()
}

/// Lock age from the recorded start time, falling back to the record's or
/// the directory's mtime.
async fn lock_age(dir: &Path, holder: Option<&LockRecord>) -> Option<Duration> {
    if let Some(started) = holder
        .and_then(|h| DateTime::parse_from_rfc3339(&h.started_at).ok())
    {
        let elapsed = Utc::now().signed_duration_since(started.with_timezone(&Utc));
        return elapsed.to_std().ok();
    }

    let meta = match fs::metadata(dir.join(LOCK_FILE)).await {
        Ok(meta) => meta,
        Err(_) => fs::metadata(dir).await.ok()?,
    };
    let modified = meta.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

async fn contention(dir: &Path, command: &str, max_age: Duration) -> Error {
    let holder = read_holder(dir).await;
    let age = lock_age(dir, holder.as_ref()).await;
    let stale = age.is_some_and(|age| age > max_age);
    Error::Locked {
        dir: dir.to_path_buf(),
        holder,
        age,
        stale,
        max_age,
        command: command.to_string(),
    }
}
