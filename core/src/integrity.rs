use crate::legacy::{self, Layout};
use crate::lock::{LockOptions, MachineLock};
use crate::manifest::Manifest;
use crate::repository::Repository;
use crate::store::{ObjectStore, StoredObject};
use crate::types::ObjectId;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct VerifyCheck {
    pub rel: String,
    pub hash: ObjectId,
    #[serde(rename = "match")]
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub ok: bool,
    pub snapshot_id: String,
    pub checked: usize,
    pub checks: Vec<VerifyCheck>,
}

/// Re-hashes every object the snapshot names and compares it with the
/// recorded hash.
pub async fn verify(repo: &Repository, snapshot_id: &str) -> Result<VerifyReport> {
    let manifest = repo.load_manifest(snapshot_id).await?;
    let store = repo.objects();
    let entries: Vec<(String, ObjectId)> = manifest.sha256.into_iter().collect();

    let checks = tokio::task::spawn_blocking(move || {
        let mut seen: HashMap<ObjectId, std::result::Result<bool, String>> = HashMap::new();
        entries
            .into_iter()
            .map(|(rel, hash)| {
                let state = seen
                    .entry(hash)
                    .or_insert_with(|| check_object(&store, &hash))
                    .clone();
                let (matched, error) = match state {
                    Ok(matched) => (matched, None),
                    Err(error) => (false, Some(error)),
                };
                VerifyCheck {
                    rel,
                    hash,
                    matched,
                    error,
                }
            })
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|e| Error::Other(format!("verify task failed: {e}")))?;

    let ok = checks.iter().all(|c| c.matched);
    debug!(snapshot = snapshot_id, checked = checks.len(), ok, "verified snapshot");
    Ok(VerifyReport {
        ok,
        snapshot_id: snapshot_id.to_string(),
        checked: checks.len(),
        checks,
    })
}

fn check_object(store: &ObjectStore, hash: &ObjectId) -> std::result::Result<bool, String> {
    store
        .rehash(hash)
        .map(|actual| actual == *hash)
        .map_err(|e| e.to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
    pub total_a: usize,
    pub total_b: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub summary: DiffSummary,
}

/// Compares two path → hash maps. Lists come out sorted.
pub fn diff(a: &BTreeMap<String, ObjectId>, b: &BTreeMap<String, ObjectId>) -> DiffReport {
    let mut report = DiffReport::default();
    for (path, hash_b) in b {
        match a.get(path) {
            None => report.added.push(path.clone()),
            Some(hash_a) if hash_a != hash_b => report.changed.push(path.clone()),
            Some(_) => {}
        }
    }
    report.removed = a.keys().filter(|path| !b.contains_key(*path)).cloned().collect();
    report.summary = DiffSummary {
        added: report.added.len(),
        removed: report.removed.len(),
        changed: report.changed.len(),
        total_a: a.len(),
        total_b: b.len(),
    };
    report
}

pub async fn diff_snapshots(repo: &Repository, a: &str, b: &str) -> Result<DiffReport> {
    let manifest_a = repo.load_manifest(a).await?;
    let manifest_b = repo.load_manifest(b).await?;
    Ok(diff(&manifest_a.sha256, &manifest_b.sha256))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidManifest {
    pub snapshot_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectProblem {
    pub snapshot_id: String,
    pub rel: String,
    pub hash: ObjectId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub got: Option<ObjectId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsckReport {
    pub ok: bool,
    pub verify_hash: bool,
    pub snapshots_checked: usize,
    pub manifests_ok: usize,
    pub missing_objects: usize,
    pub corrupt_objects: usize,
    pub invalid_manifests: Vec<InvalidManifest>,
    /// Snapshot directories without a manifest (legacy trees, empty dirs).
    /// Listed for information; they do not fail the check.
    pub missing_manifests: Vec<String>,
    pub missing: Vec<ObjectProblem>,
    pub corrupt: Vec<ObjectProblem>,
}

#[derive(Debug, Clone)]
enum ObjectState {
    Ok,
    Missing,
    Corrupt(ObjectId),
    Unreadable(String),
}

/// Audits every snapshot of the machine against the object store. With
/// `verify_hash` each referenced object is re-hashed as well. Returns
/// `FsckFailed` carrying the report when anything is wrong.
pub async fn fsck(repo: &Repository, verify_hash: bool) -> Result<FsckReport> {
    let mut report = FsckReport {
        verify_hash,
        ..FsckReport::default()
    };
    let mut manifests = Vec::new();

    for id in repo.snapshot_ids().await? {
        report.snapshots_checked += 1;
        let path = repo.manifest_path(&id);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                report.missing_manifests.push(id);
                continue;
            }
            Err(e) => {
                report.invalid_manifests.push(InvalidManifest {
                    snapshot_id: id,
                    error: e.to_string(),
                });
                continue;
            }
        };
        match Manifest::from_slice(&data) {
            Ok(manifest) => {
                report.manifests_ok += 1;
                manifests.push((id, manifest));
            }
            Err(error) => report.invalid_manifests.push(InvalidManifest {
                snapshot_id: id,
                error,
            }),
        }
    }

    let store = repo.objects();
    let report = tokio::task::spawn_blocking(move || {
        let mut states: HashMap<ObjectId, ObjectState> = HashMap::new();
        for (snapshot_id, manifest) in &manifests {
            for (rel, hash) in referenced_paths(manifest) {
                let state = states
                    .entry(hash)
                    .or_insert_with(|| object_state(&store, &hash, verify_hash));
                let problem = |got, error| ObjectProblem {
                    snapshot_id: snapshot_id.clone(),
                    rel: rel.clone(),
                    hash,
                    got,
                    error,
                };
                match state {
                    ObjectState::Ok => {}
                    ObjectState::Missing => {
                        report.missing_objects += 1;
                        report.missing.push(problem(None, None));
                    }
                    ObjectState::Corrupt(actual) => {
                        report.corrupt_objects += 1;
                        report.corrupt.push(problem(Some(*actual), None));
                    }
                    ObjectState::Unreadable(error) => {
                        report.corrupt_objects += 1;
                        report.corrupt.push(problem(None, Some(error.clone())));
                    }
                }
            }
        }
        report.ok = report.invalid_manifests.is_empty()
            && report.missing_objects == 0
            && report.corrupt_objects == 0;
        report
    })
    .await
    .map_err(|e| Error::Other(format!("fsck task failed: {e}")))?;

    info!(
        snapshots = report.snapshots_checked,
        missing = report.missing_objects,
        corrupt = report.corrupt_objects,
        invalid = report.invalid_manifests.len(),
        "fsck finished"
    );
    if report.ok {
        Ok(report)
    } else {
        Err(Error::FsckFailed {
            report: Box::new(report),
        })
    }
}

/// Every (path, hash) pair a manifest depends on: the hash map plus any
/// file-index entry that disagrees with it.
fn referenced_paths(manifest: &Manifest) -> Vec<(String, ObjectId)> {
    let mut pairs: Vec<(String, ObjectId)> = manifest
        .sha256
        .iter()
        .map(|(rel, hash)| (rel.clone(), *hash))
        .collect();
    if let Some(files) = &manifest.files {
        for (rel, meta) in files {
            if manifest.sha256.get(rel) != Some(&meta.sha256) {
                pairs.push((rel.clone(), meta.sha256));
            }
        }
    }
    pairs
}

fn object_state(store: &ObjectStore, hash: &ObjectId, verify_hash: bool) -> ObjectState {
    if !store.contains(hash) {
        return ObjectState::Missing;
    }
    if !verify_hash {
        return ObjectState::Ok;
    }
    match store.rehash(hash) {
        Ok(actual) if actual == *hash => ObjectState::Ok,
        Ok(actual) => ObjectState::Corrupt(actual),
        Err(e) => ObjectState::Unreadable(e.to_string()),
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcReport {
    pub dry_run: bool,
    pub referenced: usize,
    pub removed: usize,
    pub kept: usize,
    pub bytes_removed: u64,
    pub bytes_kept: u64,
    /// Leftover temp files and staging directories from interrupted runs.
    pub temp_removed: usize,
}

/// Removes objects no manifest references. Refuses to run when any manifest
/// is unreadable, since its references are unknown. Holds the machine lock
/// unless `dry_run`.
pub async fn gc(repo: &Repository, dry_run: bool, lock: &LockOptions) -> Result<GcReport> {
    let held = if dry_run {
        None
    } else {
        Some(MachineLock::acquire(repo, "gc", lock).await?)
    };
    let result = gc_unlocked(repo, dry_run).await;
    match held {
        Some(held) => held.release_after(result).await,
        None => result,
    }
}

async fn gc_unlocked(repo: &Repository, dry_run: bool) -> Result<GcReport> {
    let mut referenced: BTreeSet<ObjectId> = BTreeSet::new();
    for id in repo.snapshot_ids().await? {
        match legacy::detect(&repo.snapshot_dir(&id)).await {
            Layout::Cas(manifest) => referenced.extend(manifest.referenced_objects()),
            _ if repo.manifest_path(&id).exists() => {
                return Err(Error::Other(format!(
                    "Refusing to collect garbage: manifest of snapshot {id} is unreadable. Run fsck."
                )));
            }
            _ => {}
        }
    }

    let store = repo.objects();
    let staging = repo.staging_dir();
    let referenced_count = referenced.len();
    let mut report = tokio::task::spawn_blocking(move || -> Result<GcReport> {
        let (objects, strays) = store.scan()?;
        let mut report = GcReport {
            dry_run,
            ..GcReport::default()
        };

        for StoredObject { id, size, .. } in objects {
            if referenced.contains(&id) {
                report.kept += 1;
                report.bytes_kept += size;
                continue;
            }
            report.removed += 1;
            report.bytes_removed += size;
            if !dry_run {
                store.delete(&id)?;
            }
        }

        for stray in strays {
            report.temp_removed += 1;
            if !dry_run {
                std::fs::remove_file(&stray).map_err(|e| Error::io("removing temp file", e))?;
                if let Some(shard) = stray.parent().filter(|p| *p != store.root()) {
                    crate::store::remove_dir_if_empty(shard);
                }
            }
        }

        if let Ok(entries) = std::fs::read_dir(&staging) {
            for entry in entries.flatten() {
                report.temp_removed += 1;
                if !dry_run {
                    std::fs::remove_dir_all(entry.path())
                        .or_else(|_| std::fs::remove_file(entry.path()))
                        .map_err(|e| Error::io("removing staging leftovers", e))?;
                }
            }
        }
        Ok(report)
    })
    .await
    .map_err(|e| Error::Other(format!("gc task failed: {e}")))??;

    report.referenced = referenced_count;
    if report.removed > 0 && !dry_run {
        info!(
            removed = report.removed,
            bytes = report.bytes_removed,
            "removed unreferenced objects"
        );
    } else if report.removed > 0 {
        warn!(removed = report.removed, "dry run: unreferenced objects left in place");
    }
    Ok(report)
}
