use crate::types::{ObjectId, SnapshotId, iso8601};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const MANIFEST_FILE: &str = "manifest.json";

/// The document describing one snapshot.
///
/// `sha256` is the authoritative path → object map. `files` carries the
/// size and mtime used by the next snapshot's fast path; migrated
/// snapshots have none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: SnapshotId,
    #[serde(with = "iso8601", default = "epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub machine_id: String,
    #[serde(default)]
    pub source_root: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub prev: Option<SnapshotId>,
    #[serde(default)]
    pub stats: Stats,
    pub sha256: BTreeMap<String, ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<BTreeMap<String, FileMeta>>,
    #[serde(default)]
    pub host: HostInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy: Option<LegacyInfo>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub files: u64,
    pub reused: u64,
    pub stored: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub sha256: ObjectId,
    pub size: u64,
    pub mtime_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub platform: String,
    pub release: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyInfo {
    pub layout: String,
    #[serde(with = "iso8601")]
    pub migrated_at: DateTime<Utc>,
}

fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

impl HostInfo {
    pub fn current() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            hostname,
            platform: std::env::consts::OS.to_string(),
            release: os_info::get().version().to_string(),
        }
    }
}

impl Manifest {
    pub fn new(id: SnapshotId, machine_id: &str) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            machine_id: machine_id.to_string(),
            source_root: None,
            label: None,
            prev: None,
            stats: Stats::default(),
            sha256: BTreeMap::new(),
            files: None,
            host: HostInfo::current(),
            legacy: None,
        }
    }

    /// Every object the snapshot depends on, from both maps.
    pub fn referenced_objects(&self) -> BTreeSet<ObjectId> {
        let mut ids: BTreeSet<ObjectId> = self.sha256.values().copied().collect();
        if let Some(files) = &self.files {
            ids.extend(files.values().map(|meta| meta.sha256));
        }
        ids
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        let mut out = serde_json::to_vec_pretty(self)?;
        out.push(b'\n');
        Ok(out)
    }

    /// Parses a manifest document, rejecting shapes the store cannot use
    /// (empty id, non-object hash map, malformed hashes).
    pub fn from_slice(data: &[u8]) -> std::result::Result<Self, String> {
        let manifest: Manifest = serde_json::from_slice(data).map_err(|e| e.to_string())?;
        if manifest.id.trim().is_empty() {
            return Err("manifest id is empty".to_string());
        }
        Ok(manifest)
    }
}

/// Normalizes a relative path to forward slashes.
pub fn normalize_rel(rel: &std::path::Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// True when a manifest path stays inside whatever root it is joined to.
pub fn is_safe_rel(rel: &str) -> bool {
    !rel.is_empty()
        && !rel.starts_with('/')
        && !rel.contains('\\')
        && !rel.contains('\0')
        && rel.split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn manifest_with(id: &str, entries: &[(&str, &[u8])]) -> Manifest {
        let mut manifest = Manifest::new(id.to_string(), "test-machine");
        for (path, content) in entries {
            manifest
                .sha256
                .insert(path.to_string(), ObjectId::from_data(content));
        }
        manifest
    }

    #[test]
    fn test_manifest_document_shape() {
        let mut manifest = manifest_with("2026-02-03T17-18-00.000Z", &[("a.txt", b"a")]);
        manifest.label = Some("nightly".into());
        let json: serde_json::Value = serde_json::from_slice(&manifest.to_json().unwrap()).unwrap();

        assert_eq!(json["id"], "2026-02-03T17-18-00.000Z");
        assert_eq!(json["machineId"], "test-machine");
        assert_eq!(json["label"], "nightly");
        assert!(json["prev"].is_null());
        assert_eq!(json["stats"]["files"], 0);
        assert!(json["sha256"]["a.txt"].is_string());
        assert!(json.get("files").is_none());
        assert!(json["host"]["hostname"].is_string());
    }

    #[test]
    fn test_from_slice_rejects_bad_shapes() {
        assert!(Manifest::from_slice(b"{not json").is_err());
        assert!(Manifest::from_slice(br#"{"id": "x", "sha256": []}"#).is_err());
        assert!(Manifest::from_slice(br#"{"sha256": {}}"#).is_err());
        assert!(Manifest::from_slice(br#"{"id": "x", "sha256": {"a": "zz"}}"#).is_err());
        assert!(Manifest::from_slice(br#"{"id": "x", "sha256": {}}"#).is_ok());

        let mut manifest = manifest_with("x", &[]);
        manifest.id = "  ".into();
        assert!(Manifest::from_slice(&manifest.to_json().unwrap()).is_err());
    }

    #[test]
    fn test_referenced_objects_merges_maps() {
        let mut manifest = manifest_with("x", &[("a", b"a")]);
        let extra = ObjectId::from_data(b"b");
        manifest.files = Some(BTreeMap::from([(
            "b".to_string(),
            FileMeta {
                sha256: extra,
                size: 1,
                mtime_ms: 0,
            },
        )]));
        assert_eq!(manifest.referenced_objects().len(), 2);
    }

    #[test]
    fn test_is_safe_rel() {
        assert!(is_safe_rel("memory/2026-01-01.md"));
        assert!(!is_safe_rel("../etc/passwd"));
        assert!(!is_safe_rel("/etc/passwd"));
        assert!(!is_safe_rel("a/../../b"));
        assert!(!is_safe_rel("a\\b"));
        assert!(!is_safe_rel(""));
    }
}
