//! Portable snapshot archives.
//!
//! A pack is a gzip-compressed tar stream holding, in order, `pack.json`,
//! the snapshot's `manifest.json` (byte-for-byte as stored) and one
//! `objects/<2-hex>/<64-hex>` entry per referenced object. Import treats
//! the archive as untrusted: every entry path is validated, every object is
//! hashed while it streams, and the manifest only becomes visible once every
//! object it references is present.

use crate::legacy::{self, Layout};
use crate::lock::{LockOptions, MachineLock};
use crate::manifest::{MANIFEST_FILE, Manifest};
use crate::repository::{Repository, TOOL_TAG, write_bytes_atomic};
use crate::store::{ObjectStore, random_suffix};
use crate::types::{ObjectId, iso_now, to_iso};
use crate::{Error, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, info, warn};

pub const PACK_SCHEMA: u32 = 1;
pub const PACK_META_FILE: &str = "pack.json";
/// Upper bound for `pack.json` and `manifest.json` inside a pack.
pub const MAX_META_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackMeta {
    pub schema: u32,
    pub tool: String,
    pub snapshot_id: String,
    pub machine_id: String,
    pub created_at: String,
    pub packed_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportReport {
    pub snapshot_id: String,
    pub out: PathBuf,
    pub objects: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub snapshot_id: String,
    /// Objects the manifest references.
    pub referenced: usize,
    /// Object entries received from the archive.
    pub received: usize,
    /// Objects that were not already present.
    pub stored: usize,
}

pub fn default_pack_name(snapshot_id: &str) -> String {
    format!("timeclaw-pack-{snapshot_id}.tgz")
}

/// Writes `snapshot_id` and everything it references to `out`. The archive
/// is assembled under a temporary name and renamed once complete.
pub async fn export_pack(repo: &Repository, snapshot_id: &str, out: &Path) -> Result<ExportReport> {
    let snapshot_dir = repo.snapshot_dir(snapshot_id);
    if !snapshot_dir.is_dir() {
        return Err(Error::SnapshotNotFound {
            id: snapshot_id.to_string(),
        });
    }
    let manifest = match legacy::detect(&snapshot_dir).await {
        Layout::Cas(manifest) => *manifest,
        Layout::LegacyTree | Layout::Empty => {
            return Err(Error::SnapshotNotMigrated {
                id: snapshot_id.to_string(),
            });
        }
    };
    let manifest_bytes = tokio::fs::read(repo.manifest_path(snapshot_id))
        .await
        .map_err(|e| Error::io("reading manifest", e))?;

    let store = repo.objects();
    let hashes = manifest.referenced_objects();
    for hash in &hashes {
        if !store.contains(hash) {
            return Err(Error::ObjectMissing {
                hash: hash.to_hex(),
                path: None,
            });
        }
    }

    let meta = PackMeta {
        schema: PACK_SCHEMA,
        tool: TOOL_TAG.to_string(),
        snapshot_id: manifest.id.clone(),
        machine_id: if manifest.machine_id.is_empty() {
            repo.machine_id().to_string()
        } else {
            manifest.machine_id.clone()
        },
        created_at: to_iso(manifest.created_at),
        packed_at: iso_now(),
    };

    let out = out.to_path_buf();
    let objects = hashes.len();
    let target = out.clone();
    tokio::task::spawn_blocking(move || write_pack(&store, &meta, &manifest_bytes, &hashes, &target))
        .await
        .map_err(|e| Error::Other(format!("export task failed: {e}")))??;

    info!(snapshot = snapshot_id, out = %out.display(), objects, "exported pack");
    Ok(ExportReport {
        snapshot_id: snapshot_id.to_string(),
        out,
        objects,
    })
}

fn write_pack(
    store: &ObjectStore,
    meta: &PackMeta,
    manifest_bytes: &[u8],
    hashes: &BTreeSet<ObjectId>,
    out: &Path,
) -> Result<()> {
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::io("creating pack directory", e))?;
    }
    let file_name = out
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "pack".to_string());
    let tmp = out.with_file_name(format!("{file_name}.tmp.{}", random_suffix()));

    let written = (|| -> Result<()> {
        let file = File::create(&tmp).map_err(|e| Error::io("writing pack", e))?;
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));

        let mut meta_bytes = serde_json::to_vec_pretty(meta)?;
        meta_bytes.push(b'\n');
        append_bytes(&mut builder, PACK_META_FILE, &meta_bytes)?;
        append_bytes(&mut builder, MANIFEST_FILE, manifest_bytes)?;

        for hash in hashes {
            let object = store.open(hash)?;
            let size = object.metadata()?.len();
            let mut header = entry_header(size);
            builder.append_data(
                &mut header,
                format!("objects/{}/{}", hash.shard(), hash.to_hex()),
                object,
            )?;
            debug!(object = %hash, size, "packed object");
        }

        let file = builder.into_inner()?.finish()?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, out).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::io("writing pack", e)
    })
}

fn entry_header(size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header
}

fn append_bytes<W: io::Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = entry_header(data.len() as u64);
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

/// What an accepted entry path names.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryKind {
    PackMeta,
    Manifest,
    Object(ObjectId),
}

/// Normalizes a raw archive path. `None` for anything that could escape the
/// destination: absolute paths, `..`, NUL, backslashes, non-UTF-8.
fn normalize_entry_path(raw: &[u8]) -> Option<String> {
    let path = std::str::from_utf8(raw).ok()?;
    if path.is_empty() || path.contains('\0') || path.contains('\\') || path.starts_with('/') {
        return None;
    }
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

fn classify_entry(name: &str) -> Result<EntryKind> {
    match name {
        PACK_META_FILE => return Ok(EntryKind::PackMeta),
        MANIFEST_FILE => return Ok(EntryKind::Manifest),
        _ => {}
    }

    let Some(rest) = name.strip_prefix("objects/") else {
        return Err(Error::pack_invalid(format!("Unexpected pack entry: {name}")));
    };
    let Some((prefix, hash)) = rest.split_once('/') else {
        return Err(Error::pack_invalid(format!("Invalid object entry: {name}")));
    };
    let is_hex_prefix = prefix.len() == 2
        && prefix
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    let id = match ObjectId::parse_strict(hash) {
        Some(id) if is_hex_prefix => id,
        _ => return Err(Error::pack_invalid(format!("Invalid object hash path: {name}"))),
    };
    if id.shard() != prefix {
        return Err(Error::pack_invalid(format!("Object prefix mismatch: {name}")));
    }
    Ok(EntryKind::Object(id))
}

/// Snapshot ids become directory names; a pack may only name a single plain
/// path segment.
fn is_safe_snapshot_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains('/')
        && !id.contains('\\')
        && !id.contains('\0')
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingMeta {
    schema: Option<serde_json::Value>,
    snapshot_id: Option<String>,
    machine_id: Option<String>,
    created_at: Option<String>,
}

/// Everything the archive delivered.
#[derive(Debug, Default)]
struct Extracted {
    meta: Option<Vec<u8>>,
    manifest: Option<Vec<u8>>,
    received: usize,
    stored: usize,
}

/// Imports a pack into `repo`, holding the machine lock.
pub async fn import_pack(
    repo: &Repository,
    pack_path: &Path,
    force: bool,
    lock: &LockOptions,
) -> Result<ImportReport> {
    if !pack_path.is_file() {
        return Err(Error::PackMissing {
            path: pack_path.display().to_string(),
        });
    }
    let held = MachineLock::acquire(repo, "import", lock).await?;
    let result = import_unlocked(repo, pack_path, force).await;
    held.release_after(result).await
}

async fn import_unlocked(repo: &Repository, pack_path: &Path, force: bool) -> Result<ImportReport> {
    let store = repo.objects();
    let path = pack_path.to_path_buf();
    let extracted = tokio::task::spawn_blocking(move || extract(&store, &path))
        .await
        .map_err(|e| Error::Other(format!("import task failed: {e}")))??;

    let meta_bytes = extracted
        .meta
        .ok_or_else(|| Error::pack_invalid("Pack missing pack.json"))?;
    let manifest_bytes = extracted
        .manifest
        .ok_or_else(|| Error::pack_invalid("Pack missing manifest.json"))?;

    let meta: IncomingMeta = serde_json::from_slice(&meta_bytes)
        .map_err(|e| Error::pack_invalid(format!("Invalid JSON in pack.json: {e}")))?;
    match meta.schema.as_ref().and_then(serde_json::Value::as_u64) {
        Some(schema) if schema == u64::from(PACK_SCHEMA) => {}
        _ => {
            return Err(Error::PackUnsupported {
                schema: meta
                    .schema
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "missing".to_string()),
            });
        }
    }
    let (Some(snapshot_id), Some(_), Some(_)) = (
        meta.snapshot_id.filter(|s| !s.is_empty()),
        meta.machine_id.filter(|s| !s.is_empty()),
        meta.created_at.filter(|s| !s.is_empty()),
    ) else {
        return Err(Error::pack_invalid(
            "pack.json missing required fields (snapshotId, machineId, createdAt)",
        ));
    };

    let manifest = Manifest::from_slice(&manifest_bytes)
        .map_err(|reason| Error::pack_invalid(format!("Invalid manifest.json: {reason}")))?;
    if manifest.id != snapshot_id {
        return Err(Error::pack_invalid(format!(
            "Pack snapshot id {snapshot_id} does not match manifest id {}",
            manifest.id
        )));
    }
    if !is_safe_snapshot_id(&snapshot_id) {
        return Err(Error::pack_invalid(format!("Invalid snapshot id: {snapshot_id}")));
    }

    let store = repo.objects();
    let referenced = manifest.referenced_objects();
    if let Some(missing) = referenced.iter().find(|hash| !store.contains(hash)) {
        return Err(Error::PackIncomplete {
            hash: missing.to_hex(),
        });
    }

    let manifest_path = repo.manifest_path(&snapshot_id);
    if manifest_path.exists() && !force {
        return Err(Error::SnapshotExists { id: snapshot_id });
    }
    write_bytes_atomic(&manifest_path, &manifest_bytes).await?;

    info!(
        snapshot = %snapshot_id,
        referenced = referenced.len(),
        stored = extracted.stored,
        "imported pack"
    );
    Ok(ImportReport {
        snapshot_id,
        referenced: referenced.len(),
        received: extracted.received,
        stored: extracted.stored,
    })
}

/// Streams the archive entry by entry. Objects are verified and installed as
/// they arrive; metadata documents are buffered up to the size cap.
fn extract(store: &ObjectStore, pack_path: &Path) -> Result<Extracted> {
    let file = File::open(pack_path).map_err(|e| Error::io("reading pack", e))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let mut extracted = Extracted::default();

    let entries = archive.entries().map_err(unreadable)?;
    for entry in entries {
        let mut entry = entry.map_err(unreadable)?;
        let raw = entry.path_bytes().into_owned();
        let shown = String::from_utf8_lossy(&raw).to_string();
        let Some(name) = normalize_entry_path(&raw) else {
            warn!(entry = %shown, "rejected pack entry path");
            return Err(Error::pack_invalid(format!("Invalid pack entry path: {shown}")));
        };

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            continue;
        }
        if !(entry_type.is_file() || entry_type == EntryType::Continuous) {
            warn!(entry = %name, "rejected non-regular pack entry");
            return Err(Error::pack_invalid(format!("Unsupported pack entry type: {name}")));
        }

        match classify_entry(&name)? {
            EntryKind::PackMeta => {
                let data = read_meta(&mut entry, &name)?;
                if extracted.meta.replace(data).is_some() {
                    return Err(Error::pack_invalid("Duplicate pack.json in pack"));
                }
            }
            EntryKind::Manifest => {
                let data = read_meta(&mut entry, &name)?;
                if extracted.manifest.replace(data).is_some() {
                    return Err(Error::pack_invalid("Duplicate manifest.json in pack"));
                }
            }
            EntryKind::Object(id) => {
                let written = store.put_verified(&id, &mut entry).map_err(|e| match e {
                    Error::ObjectCorrupt { hash, .. } => {
                        warn!(object = %hash, "pack object failed verification");
                        Error::pack_invalid(format!("Object hash mismatch: {hash}"))
                    }
                    Error::Io(io) => unreadable(io),
                    other => other,
                })?;
                extracted.received += 1;
                if written {
                    extracted.stored += 1;
                }
            }
        }
    }
    Ok(extracted)
}

fn read_meta<R: Read>(entry: &mut tar::Entry<'_, R>, name: &str) -> Result<Vec<u8>> {
    if entry.header().size().unwrap_or(0) > MAX_META_BYTES {
        return Err(Error::pack_invalid(format!("{name} is too large")));
    }
    let mut data = Vec::new();
    entry
        .take(MAX_META_BYTES + 1)
        .read_to_end(&mut data)
        .map_err(unreadable)?;
    if data.len() as u64 > MAX_META_BYTES {
        return Err(Error::pack_invalid(format!("{name} is too large")));
    }
    Ok(data)
}

fn unreadable(e: io::Error) -> Error {
    Error::pack_invalid(format!("Pack is not a readable gzip tar archive: {e}"))
}
