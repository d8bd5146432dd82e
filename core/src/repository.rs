use crate::legacy::{self, Layout};
use crate::manifest::{MANIFEST_FILE, Manifest};
use crate::store::ObjectStore;
use crate::types::{SnapshotId, iso_now, parse_snapshot_id};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

pub const TIMECLAW_DIRNAME: &str = "TimeClaw";
pub const TIMECLAW_MARKER: &str = "TIMECLAW_ROOT.json";
pub const TOOL_TAG: &str = "timeclaw";

/// One machine's view of a backup destination.
///
/// Every core operation takes a `Repository` instead of consulting ambient
/// state, so the destination and machine are always explicit.
///
/// ```text
/// <dest>/TimeClaw/
/// ├── TIMECLAW_ROOT.json            # presence = initialized
/// └── machines/<machineId>/
///     ├── snapshots/<id>/manifest.json
///     ├── objects/<2-hex>/<64-hex>
///     ├── staging/<tmp>/
///     ├── lock/lock.json
///     └── latest.json
/// ```
#[derive(Debug, Clone)]
pub struct Repository {
    dest: PathBuf,
    machine_id: String,
    machine_root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Marker {
    created_at: String,
    schema: u32,
    tool: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestPointer {
    snapshot_id: Option<SnapshotId>,
    updated_at: Option<String>,
}

/// Listing entry for one snapshot directory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub id: SnapshotId,
    pub timestamp: Option<DateTime<Utc>>,
    pub layout: &'static str,
    pub label: Option<String>,
    pub files: Option<u64>,
}

impl Repository {
    /// Marks `dest` as a TimeClaw destination and creates the machine root.
    /// Re-running on an initialized destination is a no-op.
    pub async fn init<P: AsRef<Path>>(dest: P, machine_id: &str) -> Result<Self> {
        let repo = Self::at(dest, machine_id);
        let tc_root = repo.tc_root();
        fs::create_dir_all(&tc_root)
            .await
            .map_err(|e| Error::io("initializing destination", e))?;

        let marker_path = repo.marker_path();
        if !marker_path.exists() {
            let marker = Marker {
                created_at: iso_now(),
                schema: 1,
                tool: TOOL_TAG.to_string(),
            };
            write_json(&marker_path, &marker).await?;
            info!(dest = %repo.dest.display(), "initialized destination");
        }

        fs::create_dir_all(&repo.machine_root)
            .await
            .map_err(|e| Error::io("creating machine root", e))?;
        Ok(repo)
    }

    /// Opens an initialized destination.
    pub async fn open<P: AsRef<Path>>(dest: P, machine_id: &str) -> Result<Self> {
        let repo = Self::at(dest, machine_id);
        if !repo.marker_path().exists() {
            return Err(Error::NotInitialized {
                dest: repo.dest.display().to_string(),
            });
        }
        Ok(repo)
    }

    /// Builds the context without touching the filesystem.
    pub fn at<P: AsRef<Path>>(dest: P, machine_id: &str) -> Self {
        let dest = dest.as_ref().to_path_buf();
        let machine_root = dest
            .join(TIMECLAW_DIRNAME)
            .join("machines")
            .join(machine_id);
        Self {
            dest,
            machine_id: machine_id.to_string(),
            machine_root,
        }
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn tc_root(&self) -> PathBuf {
        self.dest.join(TIMECLAW_DIRNAME)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.tc_root().join(TIMECLAW_MARKER)
    }

    pub fn machine_root(&self) -> &Path {
        &self.machine_root
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.machine_root.join("snapshots")
    }

    pub fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.snapshots_dir().join(id)
    }

    pub fn manifest_path(&self, id: &str) -> PathBuf {
        self.snapshot_dir(id).join(MANIFEST_FILE)
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.machine_root.join("objects")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.machine_root.join("staging")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.machine_root.join("lock")
    }

    pub fn latest_path(&self) -> PathBuf {
        self.machine_root.join("latest.json")
    }

    pub fn objects(&self) -> ObjectStore {
        ObjectStore::new(self.objects_dir())
    }

    /// Snapshot id the latest pointer names, if any.
    pub async fn read_latest(&self) -> Result<Option<SnapshotId>> {
        let path = self.latest_path();
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io("reading latest pointer", e)),
        };
        let pointer: LatestPointer = serde_json::from_slice(&data)?;
        Ok(pointer.snapshot_id.filter(|id| !id.is_empty()))
    }

    pub async fn write_latest(&self, snapshot_id: &str) -> Result<()> {
        let pointer = LatestPointer {
            snapshot_id: Some(snapshot_id.to_string()),
            updated_at: Some(iso_now()),
        };
        write_json_atomic(&self.latest_path(), &pointer).await?;
        debug!(snapshot = snapshot_id, "updated latest pointer");
        Ok(())
    }

    /// Snapshot directory names, sorted.
    pub async fn snapshot_ids(&self) -> Result<Vec<SnapshotId>> {
        let dir = self.snapshots_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io("listing snapshots", e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Loads a snapshot's manifest, failing with the lookup error that
    /// matches its layout.
    pub async fn load_manifest(&self, id: &str) -> Result<Manifest> {
        let dir = self.snapshot_dir(id);
        if !dir.is_dir() {
            return Err(Error::SnapshotNotFound { id: id.to_string() });
        }
        match legacy::detect(&dir).await {
            Layout::Cas(manifest) => Ok(*manifest),
            Layout::LegacyTree => Err(Error::SnapshotLegacy { id: id.to_string() }),
            Layout::Empty => Err(Error::SnapshotEmpty { id: id.to_string() }),
        }
    }

    /// Every snapshot with its layout, oldest first.
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>> {
        let mut summaries = Vec::new();
        for id in self.snapshot_ids().await? {
            let layout = legacy::detect(&self.snapshot_dir(&id)).await;
            let (label, files) = match &layout {
                Layout::Cas(manifest) => (manifest.label.clone(), Some(manifest.stats.files)),
                _ => (None, None),
            };
            summaries.push(SnapshotSummary {
                timestamp: parse_snapshot_id(&id),
                layout: layout.name(),
                id,
                label,
                files,
            });
        }
        summaries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(summaries)
    }
}

pub(crate) async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io("creating directory", e))?;
    }
    let mut data = serde_json::to_vec_pretty(value)?;
    data.push(b'\n');
    fs::write(path, data)
        .await
        .map_err(|e| Error::io(format!("writing {}", path.display()), e))
}

/// Writes through a sibling temp file and renames over `path`.
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut data = serde_json::to_vec_pretty(value)?;
    data.push(b'\n');
    write_bytes_atomic(path, &data).await
}

pub(crate) async fn write_bytes_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io("creating directory", e))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(
        "{file_name}.tmp.{}",
        crate::store::random_suffix()
    ));
    fs::write(&tmp, data)
        .await
        .map_err(|e| Error::io(format!("writing {}", path.display()), e))?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(Error::io(format!("writing {}", path.display()), e));
    }
    Ok(())
}
