use crate::integrity::FsckReport;
use crate::lock::LockRecord;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No config found at {path}")]
    ConfigMissing { path: String },

    #[error("Invalid config {path}: {reason}")]
    ConfigInvalid { path: String, reason: String },

    #[error("Config missing required field: dest")]
    ConfigMissingDest,

    #[error("Destination is not initialized: {dest}")]
    NotInitialized { dest: String },

    #[error("Another TimeClaw command is already running for this destination and machine")]
    Locked {
        dir: PathBuf,
        holder: Option<LockRecord>,
        age: Option<Duration>,
        stale: bool,
        max_age: Duration,
        command: String,
    },

    #[error("Snapshot not found: {id}")]
    SnapshotNotFound { id: String },

    #[error("Snapshot is empty: {id}")]
    SnapshotEmpty { id: String },

    #[error("Snapshot uses legacy layout: {id}")]
    SnapshotLegacy { id: String },

    #[error("Snapshot manifest not found: {id}")]
    SnapshotNotMigrated { id: String },

    #[error("Snapshot already exists: {id}")]
    SnapshotExists { id: String },

    #[error("Snapshot {id} records an unsafe path: {path}")]
    InvalidSnapshotPath { id: String, path: String },

    #[error("Missing object {hash}{}", .path.as_ref().map(|p| format!(" for {p}")).unwrap_or_default())]
    ObjectMissing { hash: String, path: Option<String> },

    #[error("Object {hash} is corrupt (content hashes to {actual})")]
    ObjectCorrupt { hash: String, actual: String },

    #[error("Pack not found: {path}")]
    PackMissing { path: String },

    #[error("{0}")]
    PackInvalid(String),

    #[error("Unsupported pack schema: {schema}")]
    PackUnsupported { schema: String },

    #[error("Pack missing object for {hash}")]
    PackIncomplete { hash: String },

    #[error("Permission denied while {action}")]
    Permission {
        action: String,
        #[source]
        source: io::Error,
    },

    #[error("fsck found integrity errors")]
    FsckFailed { report: Box<FsckReport> },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Highest pack schema this build understands; surfaced in hints.
const PACK_SCHEMA_HINT: u32 = crate::pack::PACK_SCHEMA;

impl Error {
    /// Wraps an IO failure, translating access-denied codes into `Permission`.
    pub fn io(action: impl Into<String>, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                Error::Permission {
                    action: action.into(),
                    source,
                }
            }
            _ => Error::Io(source),
        }
    }

    pub fn pack_invalid(msg: impl Into<String>) -> Self {
        Error::PackInvalid(msg.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) | Error::Serialization(_) | Error::Other(_) => "ERR",
            Error::ConfigMissing { .. } => "CONFIG_MISSING",
            Error::ConfigInvalid { .. } => "CONFIG_INVALID",
            Error::ConfigMissingDest => "CONFIG_MISSING_DEST",
            Error::NotInitialized { .. } => "DEST_NOT_INITIALIZED",
            Error::Locked { .. } => "LOCKED",
            Error::SnapshotNotFound { .. } => "SNAPSHOT_NOT_FOUND",
            Error::SnapshotEmpty { .. } => "SNAPSHOT_EMPTY",
            Error::SnapshotLegacy { .. } => "SNAPSHOT_LEGACY",
            Error::SnapshotNotMigrated { .. } => "SNAPSHOT_MISSING",
            Error::SnapshotExists { .. } => "SNAPSHOT_EXISTS",
            Error::InvalidSnapshotPath { .. } => "SNAPSHOT_INVALID",
            Error::ObjectMissing { .. } => "OBJECT_MISSING",
            Error::ObjectCorrupt { .. } => "OBJECT_CORRUPT",
            Error::PackMissing { .. } => "PACK_MISSING",
            Error::PackInvalid(_) => "PACK_INVALID",
            Error::PackUnsupported { .. } => "PACK_UNSUPPORTED",
            Error::PackIncomplete { .. } => "PACK_INCOMPLETE",
            Error::Permission { .. } => "PERMISSION",
            Error::FsckFailed { .. } => "FSCK_ERRORS",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Io(_) | Error::Serialization(_) | Error::Other(_) => 1,
            Error::ConfigMissing { .. }
            | Error::ConfigInvalid { .. }
            | Error::ConfigMissingDest
            | Error::NotInitialized { .. } => 2,
            Error::PackMissing { .. }
            | Error::PackInvalid(_)
            | Error::PackUnsupported { .. }
            | Error::PackIncomplete { .. }
            | Error::SnapshotExists { .. } => 3,
            Error::SnapshotNotMigrated { .. } => 4,
            Error::Permission { .. } => 5,
            Error::SnapshotNotFound { .. }
            | Error::SnapshotEmpty { .. }
            | Error::SnapshotLegacy { .. }
            | Error::InvalidSnapshotPath { .. }
            | Error::ObjectMissing { .. }
            | Error::ObjectCorrupt { .. } => 6,
            Error::Locked { .. } => 7,
            Error::FsckFailed { .. } => 8,
        }
    }

    pub fn hint(&self) -> Option<String> {
        let hint = match self {
            Error::ConfigMissing { .. } => {
                "Provide --config <path> or create timeclaw.config.json in the current directory."
                    .to_string()
            }
            Error::ConfigInvalid { .. } => "Fix the config file syntax and re-run.".to_string(),
            Error::ConfigMissingDest => "Set \"dest\" to the backup destination path.".to_string(),
            Error::NotInitialized { .. } => {
                "Initialize the destination before running other commands.".to_string()
            }
            Error::Locked {
                dir,
                holder,
                age,
                stale,
                max_age,
                ..
            } => lock_detail(dir, holder.as_ref(), *age, *stale, *max_age),
            Error::SnapshotNotFound { .. } => "Run list to see available snapshots.".to_string(),
            Error::SnapshotEmpty { .. } => {
                "The snapshot directory exists but contains no files or manifest.".to_string()
            }
            Error::SnapshotLegacy { id } => {
                format!("Run timeclaw verify {id} --migrate to convert the snapshot.")
            }
            Error::SnapshotNotMigrated { .. } => {
                "Legacy snapshots cannot be exported. Use verify --migrate first.".to_string()
            }
            Error::SnapshotExists { .. } => {
                "Use --force to overwrite the existing manifest.".to_string()
            }
            Error::InvalidSnapshotPath { .. } => {
                "The manifest may have been tampered with; run fsck.".to_string()
            }
            Error::ObjectMissing { .. } => {
                "The snapshot may be incomplete. Try verify or re-snapshot.".to_string()
            }
            Error::ObjectCorrupt { .. } => {
                "Run fsck --verify-hash to find every affected snapshot.".to_string()
            }
            Error::PackMissing { .. } => {
                "Provide the path to a pack file created by timeclaw export.".to_string()
            }
            Error::PackInvalid(_) => {
                "The pack may be corrupted or was not created by timeclaw export.".to_string()
            }
            Error::PackUnsupported { .. } => format!("Expected schema {PACK_SCHEMA_HINT}."),
            Error::PackIncomplete { .. } => {
                "Re-export the pack; it should include all referenced objects.".to_string()
            }
            Error::Permission { .. } => {
                "Check file permissions and ensure the destination is writable.".to_string()
            }
            Error::FsckFailed { report } => {
                if report.verify_hash {
                    "Repair missing/corrupt objects and re-run fsck.".to_string()
                } else {
                    "Re-run with --verify-hash for full hash checking.".to_string()
                }
            }
            Error::Io(_) | Error::Serialization(_) | Error::Other(_) => return None,
        };
        Some(hint)
    }

    pub fn next(&self) -> Option<String> {
        match self {
            Error::NotInitialized { dest } => Some(format!("timeclaw init --dest {dest}")),
            Error::Locked { command, .. } => Some(format!("timeclaw {command} --force-lock")),
            Error::SnapshotNotFound { .. } | Error::SnapshotEmpty { .. } => {
                Some("timeclaw list".to_string())
            }
            Error::SnapshotLegacy { id } | Error::SnapshotNotMigrated { id } => {
                Some(format!("timeclaw verify {id} --migrate"))
            }
            Error::ObjectMissing { .. } => Some("timeclaw fsck".to_string()),
            _ => None,
        }
    }
}

fn lock_detail(
    dir: &std::path::Path,
    holder: Option<&LockRecord>,
    age: Option<Duration>,
    stale: bool,
    max_age: Duration,
) -> String {
    let mut parts = Vec::new();
    if let Some(holder) = holder {
        if let Some(command) = &holder.command {
            parts.push(format!("command {command}"));
        }
        parts.push(format!("pid {}", holder.pid));
        parts.push(format!("host {}", holder.hostname));
        parts.push(format!("started {}", holder.started_at));
    }
    if let Some(age) = age {
        let stale_mark = if stale { " (stale?)" } else { "" };
        parts.push(format!("age {}{stale_mark}", format_age(age)));
    }

    let meta = if parts.is_empty() {
        "no metadata available".to_string()
    } else {
        parts.join(", ")
    };
    let stale_note = if stale {
        format!(" Lock age exceeds {}.", format_age(max_age))
    } else {
        String::new()
    };

    format!(
        "Lock: {}. Owner: {meta}.{stale_note} If you are sure no other TimeClaw command is running, re-run with --force-lock to break the lock.",
        dir.display()
    )
}

pub(crate) fn format_age(age: Duration) -> String {
    let seconds = age.as_secs();
    if seconds < 60 {
        return format!("{seconds}s");
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{minutes}m");
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{hours}h");
    }
    format!("{}d", hours / 24)
}
