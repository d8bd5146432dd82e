use crate::glob::PathFilter;
use crate::manifest::normalize_rel;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A regular file selected for a snapshot.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub abs: PathBuf,
    pub rel: String,
    pub size: u64,
    pub mtime_ms: i64,
}

/// Lists regular files under `root` accepted by `filter`, sorted by
/// relative path. Excluded directories are never descended into; symlinks
/// are not followed.
pub fn collect_files(root: &Path, filter: &PathFilter) -> Result<Vec<SourceFile>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            if !entry.file_type().is_dir() {
                return true;
            }
            match entry.path().strip_prefix(root) {
                Ok(rel) => !filter.prunes_dir(&normalize_rel(rel)),
                Err(_) => true,
            }
        });

    for entry in walker {
        let entry = entry.map_err(walk_error)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::Other(e.to_string()))?;
        let rel = normalize_rel(rel);
        if !filter.accepts_file(&rel) {
            continue;
        }
        let meta = entry.metadata().map_err(walk_error)?;
        files.push(SourceFile {
            abs: entry.path().to_path_buf(),
            size: meta.len(),
            mtime_ms: mtime_ms(&meta),
            rel,
        });
    }

    files.sort_by(|a, b| a.rel.cmp(&b.rel));
    Ok(files)
}

/// Modification time in whole milliseconds since the epoch.
pub fn mtime_ms(meta: &Metadata) -> i64 {
    meta.modified()
        .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
        .unwrap_or(0)
}

fn walk_error(err: walkdir::Error) -> Error {
    let path = err
        .path()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    match err.into_io_error() {
        Some(io) => Error::io(format!("reading {path}"), io),
        None => Error::Other(format!("filesystem loop at {path}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("memory/private")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::write(root.join("MEMORY.md"), b"m").unwrap();
        fs::write(root.join("memory/2026-01-01.md"), b"a").unwrap();
        fs::write(root.join("memory/private/secret.md"), b"s").unwrap();
        fs::write(root.join("node_modules/pkg/index.js"), b"js").unwrap();
        dir
    }

    fn rels(files: &[SourceFile]) -> Vec<&str> {
        files.iter().map(|f| f.rel.as_str()).collect()
    }

    #[test]
    fn test_collects_everything_without_patterns() {
        let dir = tree();
        let files = collect_files(dir.path(), &PathFilter::default()).unwrap();
        assert_eq!(
            rels(&files),
            vec![
                "MEMORY.md",
                "memory/2026-01-01.md",
                "memory/private/secret.md",
                "node_modules/pkg/index.js",
            ]
        );
        assert_eq!(files[0].size, 1);
        assert!(files[0].mtime_ms > 0);
    }

    #[test]
    fn test_excluded_directories_are_pruned() {
        let dir = tree();
        let filter = PathFilter::new(&["memory", "MEMORY.md"], &["memory/private", "node_modules/"]);
        let files = collect_files(dir.path(), &filter).unwrap();
        assert_eq!(rels(&files), vec!["MEMORY.md", "memory/2026-01-01.md"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_excluded_directory_is_never_read() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tree();
        let sealed = dir.path().join("media");
        fs::create_dir_all(sealed.join("album")).unwrap();
        fs::write(sealed.join("album/photo.jpg"), b"jpg").unwrap();
        fs::set_permissions(&sealed, fs::Permissions::from_mode(0o000)).unwrap();

        let filter = PathFilter::new::<&str>(&[], &["media/", "**/node_modules/**"]);
        let result = collect_files(dir.path(), &filter);
        fs::set_permissions(&sealed, fs::Permissions::from_mode(0o755)).unwrap();

        let files = result.unwrap();
        assert_eq!(
            rels(&files),
            vec!["MEMORY.md", "memory/2026-01-01.md", "memory/private/secret.md"]
        );
    }
}
