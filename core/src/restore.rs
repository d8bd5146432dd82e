use crate::manifest::{MANIFEST_FILE, is_safe_rel};
use crate::repository::Repository;
use crate::store::{ObjectStore, copy_hashing, random_suffix};
use crate::types::ObjectId;
use crate::{Error, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub snapshot_id: String,
    pub target: PathBuf,
    pub files: usize,
    pub bytes: u64,
    pub dry_run: bool,
}

pub fn default_restore_dir(snapshot_id: &str) -> String {
    format!("timeclaw-restore-{snapshot_id}")
}

/// Materializes a snapshot under `target`. Paths and object presence are
/// checked before anything is written; each file lands via temp + rename
/// and is re-verified against its hash on the way out.
pub async fn restore(
    repo: &Repository,
    snapshot_id: &str,
    target: &Path,
    dry_run: bool,
) -> Result<RestoreReport> {
    let manifest = repo.load_manifest(snapshot_id).await?;

    if let Some(bad) = manifest.sha256.keys().find(|rel| !is_safe_rel(rel)) {
        return Err(Error::InvalidSnapshotPath {
            id: snapshot_id.to_string(),
            path: bad.clone(),
        });
    }

    let store = repo.objects();
    if let Some((rel, hash)) = manifest.sha256.iter().find(|(_, hash)| !store.contains(hash)) {
        return Err(Error::ObjectMissing {
            hash: hash.to_hex(),
            path: Some(rel.clone()),
        });
    }

    let files = manifest.sha256.len();
    if dry_run {
        return Ok(RestoreReport {
            snapshot_id: snapshot_id.to_string(),
            target: target.to_path_buf(),
            files,
            bytes: 0,
            dry_run,
        });
    }

    let entries: Vec<(String, ObjectId)> = manifest.sha256.into_iter().collect();
    let manifest_src = repo.manifest_path(snapshot_id);
    let root = target.to_path_buf();
    let bytes = tokio::task::spawn_blocking(move || -> Result<u64> {
        fs::create_dir_all(&root).map_err(|e| Error::io("creating restore target", e))?;
        let mut total = 0;
        for (rel, hash) in &entries {
            total += restore_file(&store, hash, &root.join(rel))?;
        }
        fs::copy(&manifest_src, root.join(MANIFEST_FILE))
            .map_err(|e| Error::io("copying manifest", e))?;
        Ok(total)
    })
    .await
    .map_err(|e| Error::Other(format!("restore task failed: {e}")))??;

    info!(snapshot = snapshot_id, target = %target.display(), files, bytes, "restored snapshot");
    Ok(RestoreReport {
        snapshot_id: snapshot_id.to_string(),
        target: target.to_path_buf(),
        files,
        bytes,
        dry_run,
    })
}

fn restore_file(store: &ObjectStore, hash: &ObjectId, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io("creating restore directory", e))?;
    }
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dest.with_file_name(format!("{file_name}.tmp.{}", random_suffix()));

    let source = store.open(hash)?;
    let copied = File::create(&tmp).and_then(|mut out| {
        let result = copy_hashing(source, &mut out)?;
        out.sync_all()?;
        Ok(result)
    });
    let (actual, size) = match copied {
        Ok(result) => result,
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            return Err(Error::io(format!("writing {}", dest.display()), e));
        }
    };
    if actual != *hash {
        let _ = fs::remove_file(&tmp);
        return Err(Error::ObjectCorrupt {
            hash: hash.to_hex(),
            actual: actual.to_hex(),
        });
    }
    fs::rename(&tmp, dest).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::io(format!("writing {}", dest.display()), e)
    })?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::manifest_with;
    use tempfile::TempDir;

    async fn repo_with(entries: &[(&str, &[u8])]) -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path().join("dest"), "m1").await.unwrap();
        for (_, content) in entries {
            repo.objects().put(content).unwrap();
        }
        let manifest = manifest_with("s1", entries);
        std::fs::create_dir_all(repo.snapshot_dir("s1")).unwrap();
        std::fs::write(repo.manifest_path("s1"), manifest.to_json().unwrap()).unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn test_restore_materializes_tree() {
        let (dir, repo) = repo_with(&[("MEMORY.md", b"# hi\n"), ("memory/a.md", b"a\n")]).await;
        let target = dir.path().join("restore");
        let report = restore(&repo, "s1", &target, false).await.unwrap();

        assert_eq!(report.files, 2);
        assert_eq!(report.bytes, 7);
        assert_eq!(std::fs::read(target.join("MEMORY.md")).unwrap(), b"# hi\n");
        assert_eq!(std::fs::read(target.join("memory/a.md")).unwrap(), b"a\n");
        assert!(target.join(MANIFEST_FILE).is_file());
        assert!(repo.read_latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_dry_run_and_missing_object() {
        let (dir, repo) = repo_with(&[("a.txt", b"alpha")]).await;
        let target = dir.path().join("restore");
        let report = restore(&repo, "s1", &target, true).await.unwrap();
        assert!(report.dry_run);
        assert!(!target.exists());

        repo.objects().delete(&ObjectId::from_data(b"alpha")).unwrap();
        let err = restore(&repo, "s1", &target, false).await.unwrap_err();
        assert_eq!(err.code(), "OBJECT_MISSING");
        assert!(err.to_string().contains("a.txt"));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_restore_rejects_escaping_paths() {
        let (dir, repo) = repo_with(&[("../escape.txt", b"x")]).await;
        let target = dir.path().join("restore");
        let err = restore(&repo, "s1", &target, false).await.unwrap_err();
        assert_eq!(err.code(), "SNAPSHOT_INVALID");
        assert!(!dir.path().join("escape.txt").exists());
    }
}
