use crate::glob::PathFilter;
use crate::lock::{LockOptions, MachineLock};
use crate::manifest::{FileMeta, MANIFEST_FILE, Manifest};
use crate::repository::Repository;
use crate::store::{ObjectStore, hash_file, random_suffix};
use crate::types::{ObjectId, SnapshotId, make_snapshot_id};
use crate::walk::{SourceFile, collect_files};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, warn};

const MAX_HASH_WORKERS: usize = 8;

/// Hash worker count: `min(8, available parallelism)`, at least one.
pub fn default_hash_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_HASH_WORKERS)
}

#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub source_root: PathBuf,
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    pub label: Option<String>,
    pub dry_run: bool,
    /// Reuse the previous hash when size and mtime are unchanged. This is a
    /// heuristic; turn it off to re-read every file.
    pub trust_mtime: bool,
    pub hash_workers: usize,
}

impl SnapshotRequest {
    pub fn new<P: Into<PathBuf>>(source_root: P) -> Self {
        Self {
            source_root: source_root.into(),
            includes: Vec::new(),
            excludes: Vec::new(),
            label: None,
            dry_run: false,
            trust_mtime: true,
            hash_workers: default_hash_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResult {
    pub snapshot_id: SnapshotId,
    pub dry_run: bool,
    /// Files the filters selected.
    pub candidates: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Manifest>,
}

/// What one hash worker learned about one file.
#[derive(Debug)]
struct HashedFile {
    file: SourceFile,
    hash: ObjectId,
    fast_path: bool,
}

/// Result of storing one group of files sharing a hash.
#[derive(Debug, Default)]
struct GroupOutcome {
    /// Paths whose bytes no longer hashed to the group's hash, with the hash
    /// they were actually stored under.
    rehashed: Vec<(usize, ObjectId)>,
    stored: u64,
}

/// Takes a snapshot of `req.source_root`. Everything except a dry run
/// happens under the machine lock.
pub async fn create_snapshot(
    repo: &Repository,
    req: &SnapshotRequest,
    lock: &LockOptions,
) -> Result<SnapshotResult> {
    if req.dry_run {
        return create_snapshot_at(repo, req, Utc::now()).await;
    }
    let held = MachineLock::acquire(repo, "snapshot", lock).await?;
    let result = create_snapshot_at(repo, req, Utc::now()).await;
    held.release_after(result).await
}

pub(crate) async fn create_snapshot_at(
    repo: &Repository,
    req: &SnapshotRequest,
    now: DateTime<Utc>,
) -> Result<SnapshotResult> {
    let snapshot_id = make_snapshot_id(now);
    if repo.snapshot_dir(&snapshot_id).exists() {
        return Err(Error::SnapshotExists { id: snapshot_id });
    }
    if !req.source_root.is_dir() {
        return Err(Error::Other(format!(
            "Source root is not a directory: {}",
            req.source_root.display()
        )));
    }

    let root = req.source_root.clone();
    let filter = PathFilter::new(&req.includes, &req.excludes);
    let files = tokio::task::spawn_blocking(move || collect_files(&root, &filter))
        .await
        .map_err(|e| Error::Other(format!("file walk failed: {e}")))??;
    let candidates = files.len();
    debug!(snapshot = %snapshot_id, candidates, "collected source files");

    if req.dry_run {
        return Ok(SnapshotResult {
            snapshot_id,
            dry_run: true,
            candidates,
            manifest: None,
        });
    }

    let prev = repo.read_latest().await?;
    let prev_index = match (&prev, req.trust_mtime) {
        (Some(prev_id), true) => load_prev_index(repo, prev_id).await,
        _ => HashMap::new(),
    };

    let workers = req.hash_workers.max(1);
    let mut hashed = hash_files(files, &prev_index, workers).await?;
    let store = repo.objects();
    let stored = store_missing(&store, &mut hashed, workers).await?;

    let mut manifest = Manifest::new(snapshot_id.clone(), repo.machine_id());
    manifest.created_at = now;
    manifest.source_root = Some(req.source_root.display().to_string());
    manifest.label = req.label.clone();
    manifest.prev = prev;

    let mut file_index = BTreeMap::new();
    for entry in &hashed {
        manifest.sha256.insert(entry.file.rel.clone(), entry.hash);
        file_index.insert(
            entry.file.rel.clone(),
            FileMeta {
                sha256: entry.hash,
                size: entry.file.size,
                mtime_ms: entry.file.mtime_ms,
            },
        );
    }
    manifest.files = Some(file_index);
    manifest.stats.files = hashed.len() as u64;
    manifest.stats.stored = stored;
    manifest.stats.reused = manifest.stats.files - stored;

    publish(repo, &manifest).await?;
    repo.write_latest(&snapshot_id).await?;

    info!(
        snapshot = %snapshot_id,
        files = manifest.stats.files,
        stored = manifest.stats.stored,
        reused = manifest.stats.reused,
        fast_path = hashed.iter().filter(|h| h.fast_path).count(),
        "published snapshot"
    );

    Ok(SnapshotResult {
        snapshot_id,
        dry_run: false,
        candidates,
        manifest: Some(manifest),
    })
}

/// The previous snapshot's size/mtime index. Anything unreadable simply
/// disables the fast path.
async fn load_prev_index(repo: &Repository, prev_id: &str) -> HashMap<String, FileMeta> {
    match repo.load_manifest(prev_id).await {
        Ok(manifest) => manifest.files.unwrap_or_default().into_iter().collect(),
        Err(e) => {
            debug!(prev = prev_id, error = %e, "previous snapshot has no usable file index");
            HashMap::new()
        }
    }
}

/// Fan-out: every file is hashed by an independent blocking task that
/// returns its own record. Results are merged afterwards, sorted by path.
async fn hash_files(
    files: Vec<SourceFile>,
    prev_index: &HashMap<String, FileMeta>,
    workers: usize,
) -> Result<Vec<HashedFile>> {
    let mut results: Vec<HashedFile> = stream::iter(files)
        .map(|file| {
            let prev = prev_index.get(&file.rel).cloned();
            tokio::task::spawn_blocking(move || hash_one(file, prev))
        })
        .buffer_unordered(workers)
        .map(|joined| {
            joined
                .map_err(|e| Error::Other(format!("hash worker failed: {e}")))
                .and_then(|hashed| hashed)
        })
        .collect::<Vec<Result<HashedFile>>>()
        .await
        .into_iter()
        .collect::<Result<_>>()?;

    results.sort_by(|a, b| a.file.rel.cmp(&b.file.rel));
    Ok(results)
}

fn hash_one(file: SourceFile, prev: Option<FileMeta>) -> Result<HashedFile> {
    if let Some(prev) = prev {
        if prev.size == file.size && prev.mtime_ms == file.mtime_ms {
            return Ok(HashedFile {
                hash: prev.sha256,
                file,
                fast_path: true,
            });
        }
    }
    let hash = hash_file(&file.abs)
        .map_err(|e| Error::io(format!("hashing {}", file.abs.display()), e))?;
    Ok(HashedFile {
        file,
        hash,
        fast_path: false,
    })
}

/// Fan-in: groups files by hash and stores each absent hash once. Files
/// that changed since hashing are recorded under whatever they were stored
/// as. Returns the number of newly written objects.
async fn store_missing(
    store: &ObjectStore,
    hashed: &mut [HashedFile],
    workers: usize,
) -> Result<u64> {
    let mut groups: BTreeMap<ObjectId, Vec<(usize, PathBuf)>> = BTreeMap::new();
    for (i, entry) in hashed.iter().enumerate() {
        groups
            .entry(entry.hash)
            .or_default()
            .push((i, entry.file.abs.clone()));
    }
    groups.retain(|hash, _| !store.contains(hash));

    let outcomes: Vec<GroupOutcome> = stream::iter(groups)
        .map(|(expected, members)| {
            let store = store.clone();
            tokio::task::spawn_blocking(move || store_group(&store, expected, members))
        })
        .buffer_unordered(workers)
        .map(|joined| {
            joined
                .map_err(|e| Error::Other(format!("store worker failed: {e}")))
                .and_then(|outcome| outcome)
        })
        .collect::<Vec<Result<GroupOutcome>>>()
        .await
        .into_iter()
        .collect::<Result<_>>()?;

    let mut stored = 0;
    for outcome in outcomes {
        stored += outcome.stored;
        for (i, actual) in outcome.rehashed {
            hashed[i].hash = actual;
        }
    }
    Ok(stored)
}

fn store_group(
    store: &ObjectStore,
    expected: ObjectId,
    members: Vec<(usize, PathBuf)>,
) -> Result<GroupOutcome> {
    let mut outcome = GroupOutcome::default();
    for (i, path) in members {
        let put = store.put_file(&path)?;
        if put.stored {
            outcome.stored += 1;
        }
        if put.id == expected {
            return Ok(outcome);
        }
        warn!(path = %path.display(), "file changed while snapshotting");
        outcome.rehashed.push((i, put.id));
    }
    Ok(outcome)
}

/// Writes the manifest into a private staging directory and renames that
/// directory into `snapshots/<id>`. The rename is the only moment the
/// snapshot becomes visible.
async fn publish(repo: &Repository, manifest: &Manifest) -> Result<()> {
    let staging = repo
        .staging_dir()
        .join(format!("{}.tmp.{}", manifest.id, random_suffix()));
    fs::create_dir_all(&staging)
        .await
        .map_err(|e| Error::io("creating staging directory", e))?;
    fs::create_dir_all(repo.snapshots_dir())
        .await
        .map_err(|e| Error::io("creating snapshots directory", e))?;

    let written = fs::write(staging.join(MANIFEST_FILE), manifest.to_json()?)
        .await
        .map_err(|e| Error::io("writing manifest", e));
    if let Err(e) = written {
        let _ = fs::remove_dir_all(&staging).await;
        return Err(e);
    }

    let target = repo.snapshot_dir(&manifest.id);
    if target.exists() {
        let _ = fs::remove_dir_all(&staging).await;
        return Err(Error::SnapshotExists {
            id: manifest.id.clone(),
        });
    }
    if let Err(e) = fs::rename(&staging, &target).await {
        let _ = fs::remove_dir_all(&staging).await;
        if target.exists() {
            return Err(Error::SnapshotExists {
                id: manifest.id.clone(),
            });
        }
        return Err(Error::io("publishing snapshot", e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        source: PathBuf,
        repo: Repository,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        stdfs::create_dir_all(source.join("memory")).unwrap();
        stdfs::write(source.join("MEMORY.md"), b"# memory\n").unwrap();
        stdfs::write(source.join("memory/a.md"), b"alpha\n").unwrap();
        stdfs::write(source.join("memory/b.md"), b"alpha\n").unwrap();
        let repo = Repository::init(dir.path().join("dest"), "m1").await.unwrap();
        Fixture {
            _dir: dir,
            source,
            repo,
        }
    }

    fn at(offset_ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_770_000_000_000 + offset_ms).unwrap()
    }

    fn set_mtime(path: &std::path::Path, mtime: SystemTime) {
        stdfs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_publishes_manifest_and_latest() {
        let fx = fixture().await;
        let req = SnapshotRequest::new(&fx.source);
        let result = create_snapshot_at(&fx.repo, &req, at(0)).await.unwrap();
        let manifest = result.manifest.unwrap();

        assert_eq!(result.candidates, 3);
        assert_eq!(manifest.stats.files, 3);
        assert_eq!(manifest.stats.stored, 2);
        assert_eq!(manifest.stats.reused, 1);
        assert!(manifest.prev.is_none());
        assert_eq!(manifest.sha256["memory/a.md"], manifest.sha256["memory/b.md"]);

        let (objects, _) = fx.repo.objects().scan().unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(
            fx.repo.read_latest().await.unwrap().as_deref(),
            Some(result.snapshot_id.as_str())
        );
        assert_eq!(fx.repo.load_manifest(&result.snapshot_id).await.unwrap(), manifest);

        let mut staging = stdfs::read_dir(fx.repo.staging_dir()).unwrap();
        assert!(staging.next().is_none());
    }

    #[tokio::test]
    async fn test_unchanged_tree_is_fully_reused() {
        let fx = fixture().await;
        let req = SnapshotRequest::new(&fx.source);
        let first = create_snapshot_at(&fx.repo, &req, at(0)).await.unwrap();
        let second = create_snapshot_at(&fx.repo, &req, at(1000)).await.unwrap();

        let a = first.manifest.unwrap();
        let b = second.manifest.unwrap();
        assert_eq!(b.stats.stored, 0);
        assert_eq!(b.stats.reused, b.stats.files);
        assert_eq!(b.files, a.files);
        assert_eq!(b.prev.as_deref(), Some(first.snapshot_id.as_str()));
    }

    #[tokio::test]
    async fn test_changed_file_is_rehashed() {
        let fx = fixture().await;
        let req = SnapshotRequest::new(&fx.source);
        let first = create_snapshot_at(&fx.repo, &req, at(0)).await.unwrap().manifest.unwrap();

        let path = fx.source.join("MEMORY.md");
        stdfs::write(&path, b"# memory, edited\n").unwrap();
        set_mtime(&path, SystemTime::now() + Duration::from_secs(60));

        let second = create_snapshot_at(&fx.repo, &req, at(1000)).await.unwrap().manifest.unwrap();
        assert_ne!(first.sha256["MEMORY.md"], second.sha256["MEMORY.md"]);
        assert_eq!(second.sha256["MEMORY.md"], ObjectId::from_data(b"# memory, edited\n"));
        assert_eq!(second.stats.stored, 1);
        assert_eq!(second.stats.reused, 2);
    }

    #[tokio::test]
    async fn test_trust_mtime_can_be_disabled() {
        let fx = fixture().await;
        let mut req = SnapshotRequest::new(&fx.source);
        create_snapshot_at(&fx.repo, &req, at(0)).await.unwrap();

        // Same size, same mtime, different bytes.
        let path = fx.source.join("memory/a.md");
        let mtime = stdfs::metadata(&path).unwrap().modified().unwrap();
        stdfs::write(&path, b"omega\n").unwrap();
        set_mtime(&path, mtime);

        let trusted = create_snapshot_at(&fx.repo, &req, at(1000)).await.unwrap().manifest.unwrap();
        assert_eq!(trusted.sha256["memory/a.md"], ObjectId::from_data(b"alpha\n"));

        req.trust_mtime = false;
        let strict = create_snapshot_at(&fx.repo, &req, at(2000)).await.unwrap().manifest.unwrap();
        assert_eq!(strict.sha256["memory/a.md"], ObjectId::from_data(b"omega\n"));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let fx = fixture().await;
        let mut req = SnapshotRequest::new(&fx.source);
        req.dry_run = true;
        req.excludes = vec!["memory/".into()];
        let result = create_snapshot_at(&fx.repo, &req, at(0)).await.unwrap();

        assert!(result.dry_run);
        assert_eq!(result.snapshot_id, make_snapshot_id(at(0)));
        assert_eq!(result.candidates, 1);
        assert!(result.manifest.is_none());
        assert!(!fx.repo.snapshots_dir().exists());
        assert!(!fx.repo.objects_dir().exists());
        assert!(fx.repo.read_latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_id_collision_is_refused() {
        let fx = fixture().await;
        let req = SnapshotRequest::new(&fx.source);
        create_snapshot_at(&fx.repo, &req, at(0)).await.unwrap();
        let err = create_snapshot_at(&fx.repo, &req, at(0)).await.unwrap_err();
        assert_eq!(err.code(), "SNAPSHOT_EXISTS");
    }

    #[tokio::test]
    async fn test_single_worker_matches_parallel() {
        let fx = fixture().await;
        let mut req = SnapshotRequest::new(&fx.source);
        req.trust_mtime = false;
        req.hash_workers = 1;
        let serial = create_snapshot_at(&fx.repo, &req, at(0)).await.unwrap().manifest.unwrap();
        req.hash_workers = 8;
        let parallel = create_snapshot_at(&fx.repo, &req, at(1000)).await.unwrap().manifest.unwrap();
        assert_eq!(serial.sha256, parallel.sha256);
    }

    #[tokio::test]
    async fn test_snapshot_holds_machine_lock() {
        let fx = fixture().await;
        let req = SnapshotRequest::new(&fx.source);
        let held = MachineLock::acquire(&fx.repo, "gc", &LockOptions::default())
            .await
            .unwrap();
        let err = create_snapshot(&fx.repo, &req, &LockOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LOCKED");
        held.release().await.unwrap();

        create_snapshot(&fx.repo, &req, &LockOptions::default())
            .await
            .unwrap();
        assert!(!fx.repo.lock_dir().exists());
    }

    #[test]
    fn test_default_workers_bounded() {
        let n = default_hash_workers();
        assert!((1..=MAX_HASH_WORKERS).contains(&n));
    }
}
