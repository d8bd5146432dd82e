//! Pre-CAS snapshots were plain copies of the source tree. This module tells
//! the layouts apart and converts old trees in place.

use crate::lock::{LockOptions, MachineLock};
use crate::manifest::{LegacyInfo, MANIFEST_FILE, Manifest, normalize_rel};
use crate::repository::Repository;
use crate::{Error, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};
use walkdir::WalkDir;

/// What a snapshot directory holds.
#[derive(Debug, Clone)]
pub enum Layout {
    /// A readable manifest describing content-addressed objects.
    Cas(Box<Manifest>),
    /// Files without a usable manifest.
    LegacyTree,
    /// Neither files nor a manifest.
    Empty,
}

impl Layout {
    pub fn name(&self) -> &'static str {
        match self {
            Layout::Cas(_) => "cas",
            Layout::LegacyTree => "legacy-tree",
            Layout::Empty => "empty",
        }
    }
}

/// Classifies `snapshot_dir`. Never fails: unreadable manifests and
/// unreadable directories fall back to the conservative variant.
pub async fn detect(snapshot_dir: &Path) -> Layout {
    let manifest_path = snapshot_dir.join(MANIFEST_FILE);
    match fs::read(&manifest_path).await {
        Ok(data) => {
            return match Manifest::from_slice(&data) {
                Ok(manifest) => Layout::Cas(Box::new(manifest)),
                Err(reason) => {
                    warn!(path = %manifest_path.display(), %reason, "manifest is malformed");
                    Layout::LegacyTree
                }
            };
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(_) => return Layout::LegacyTree,
    }

    let mut entries = match fs::read_dir(snapshot_dir).await {
        Ok(entries) => entries,
        Err(_) => return Layout::Empty,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(file_type) = entry.file_type().await {
            if file_type.is_file() || file_type.is_dir() {
                return Layout::LegacyTree;
            }
        }
    }
    Layout::Empty
}

/// Result of migrating one legacy snapshot.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub snapshot_id: String,
    pub files: usize,
    pub dry_run: bool,
    pub manifest: Manifest,
}

/// Files of a legacy tree, as (absolute, normalized relative) pairs,
/// excluding any stray manifest at the top level.
pub fn legacy_files(snapshot_dir: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(snapshot_dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Other(format!("walking legacy snapshot: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(snapshot_dir)
            .map_err(|e| Error::Other(e.to_string()))?;
        let rel = normalize_rel(rel);
        if rel == MANIFEST_FILE {
            continue;
        }
        files.push((entry.path().to_path_buf(), rel));
    }
    Ok(files)
}

/// Hashes every file of a legacy tree into the object store and writes a
/// synthesized manifest next to them. The directory keeps its name and its
/// original files; afterwards it detects as `Cas`.
pub async fn migrate(
    repo: &Repository,
    snapshot_id: &str,
    label: Option<&str>,
    dry_run: bool,
) -> Result<MigrationReport> {
    let snapshot_dir = repo.snapshot_dir(snapshot_id);
    match detect(&snapshot_dir).await {
        Layout::LegacyTree => {}
        Layout::Cas(_) => {
            return Err(Error::Other(format!(
                "Snapshot {snapshot_id} already has a manifest"
            )));
        }
        Layout::Empty if snapshot_dir.is_dir() => {
            return Err(Error::SnapshotEmpty {
                id: snapshot_id.to_string(),
            });
        }
        Layout::Empty => {
            return Err(Error::SnapshotNotFound {
                id: snapshot_id.to_string(),
            });
        }
    }

    let store = repo.objects();
    let dir = snapshot_dir.clone();
    let mut manifest = Manifest::new(snapshot_id.to_string(), repo.machine_id());
    manifest.label = label.map(str::to_string);
    manifest.legacy = Some(LegacyInfo {
        layout: "tree".to_string(),
        migrated_at: Utc::now(),
    });

    let (manifest, files) = tokio::task::spawn_blocking(move || -> Result<(Manifest, usize)> {
        let files = legacy_files(&dir)?;
        let count = files.len();
        if dry_run {
            return Ok((manifest, count));
        }
        for (abs, rel) in files {
            let outcome = store.put_file(&abs)?;
            manifest.sha256.insert(rel, outcome.id);
            manifest.stats.files += 1;
            if outcome.stored {
                manifest.stats.stored += 1;
            } else {
                manifest.stats.reused += 1;
            }
        }
        Ok((manifest, count))
    })
    .await
    .map_err(|e| Error::Other(format!("migration task failed: {e}")))??;

    if !dry_run {
        // A malformed manifest-like document is replaced by the synthesized one.
        crate::repository::write_bytes_atomic(
            &snapshot_dir.join(MANIFEST_FILE),
            &manifest.to_json()?,
        )
        .await?;
        info!(
            snapshot = snapshot_id,
            files,
            stored = manifest.stats.stored,
            "migrated legacy snapshot"
        );
    }

    Ok(MigrationReport {
        snapshot_id: snapshot_id.to_string(),
        files,
        dry_run,
        manifest,
    })
}

/// [`migrate`] under the machine lock; dry runs skip the lock.
pub async fn migrate_locked(
    repo: &Repository,
    snapshot_id: &str,
    label: Option<&str>,
    dry_run: bool,
    lock: &LockOptions,
) -> Result<MigrationReport> {
    if dry_run {
        return migrate(repo, snapshot_id, label, dry_run).await;
    }
    let held = MachineLock::acquire(repo, "verify", lock).await?;
    let result = migrate(repo, snapshot_id, label, dry_run).await;
    held.release_after(result).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::hash_file;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    async fn legacy_repo() -> (TempDir, Repository, String) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "m1").await.unwrap();
        let id = "2025-12-01T08-00-00.000Z".to_string();
        let snap = repo.snapshot_dir(&id);
        std::fs::create_dir_all(snap.join("memory")).unwrap();
        std::fs::write(snap.join("MEMORY.md"), b"# hi\n").unwrap();
        std::fs::write(snap.join("memory/2026-01-01.md"), b"x\n").unwrap();
        std::fs::write(snap.join("memory/copy.md"), b"x\n").unwrap();
        (dir, repo, id)
    }

    #[tokio::test]
    async fn test_detect_variants() {
        let dir = TempDir::new().unwrap();
        let snap = dir.path().join("snap");
        std::fs::create_dir_all(&snap).unwrap();
        assert!(matches!(detect(&snap).await, Layout::Empty));

        std::fs::write(snap.join("file.txt"), b"data").unwrap();
        assert!(matches!(detect(&snap).await, Layout::LegacyTree));

        std::fs::write(snap.join(MANIFEST_FILE), b"{ broken").unwrap();
        assert!(matches!(detect(&snap).await, Layout::LegacyTree));

        std::fs::write(snap.join(MANIFEST_FILE), br#"{"id": "", "sha256": {}}"#).unwrap();
        assert!(matches!(detect(&snap).await, Layout::LegacyTree));

        std::fs::write(snap.join(MANIFEST_FILE), br#"{"id": "s1", "sha256": {}}"#).unwrap();
        match detect(&snap).await {
            Layout::Cas(manifest) => assert_eq!(manifest.id, "s1"),
            other => panic!("expected cas layout, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_migrate_matches_fresh_rehash() {
        let (_dir, repo, id) = legacy_repo().await;
        let report = migrate(&repo, &id, None, false).await.unwrap();
        assert_eq!(report.files, 3);

        let snap = repo.snapshot_dir(&id);
        let mut expected = BTreeMap::new();
        for (abs, rel) in legacy_files(&snap).unwrap() {
            expected.insert(rel, hash_file(&abs).unwrap());
        }

        let manifest = repo.load_manifest(&id).await.unwrap();
        assert_eq!(manifest.sha256, expected);
        assert_eq!(manifest.stats.files, 3);
        assert_eq!(manifest.stats.stored, 2);
        assert_eq!(manifest.stats.reused, 1);
        assert_eq!(manifest.legacy.as_ref().unwrap().layout, "tree");
        assert!(manifest.source_root.is_none());
        assert!(snap.join("MEMORY.md").is_file());

        let store = repo.objects();
        for hash in manifest.sha256.values() {
            assert!(store.contains(hash));
        }
        assert!(repo.read_latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_migrate_dry_run_writes_nothing() {
        let (_dir, repo, id) = legacy_repo().await;
        let report = migrate(&repo, &id, None, true).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.files, 3);
        assert!(!repo.manifest_path(&id).exists());
        assert!(!repo.objects_dir().exists());
    }

    #[tokio::test]
    async fn test_migrate_replaces_malformed_manifest() {
        let (_dir, repo, id) = legacy_repo().await;
        std::fs::write(repo.manifest_path(&id), b"not json").unwrap();
        let report = migrate(&repo, &id, Some("imported"), false).await.unwrap();
        assert_eq!(report.files, 3);
        let manifest = repo.load_manifest(&id).await.unwrap();
        assert!(!manifest.sha256.contains_key(MANIFEST_FILE));
        assert_eq!(manifest.label.as_deref(), Some("imported"));
    }
}
