use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use timeclaw_core::snapshot::default_hash_workers;
use timeclaw_core::{Error, Result, RetentionConfig, SnapshotRequest};

pub const CONFIG_FILE: &str = "timeclaw.config.json";

/// The config document as written on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<PathBuf>,
    #[serde(default = "default_machine_id")]
    pub machine_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_root: Option<PathBuf>,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default = "default_trust_mtime")]
    pub trust_mtime: bool,
    #[serde(default = "default_hash_workers")]
    pub hash_workers: usize,
}

/// A loaded config with its destination resolved.
#[derive(Debug, Clone)]
pub struct Config {
    pub path: PathBuf,
    pub dest: PathBuf,
    pub settings: Settings,
}

pub fn default_machine_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_trust_mtime() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dest: None,
            machine_id: default_machine_id(),
            source_root: None,
            includes: Vec::new(),
            excludes: Vec::new(),
            retention: RetentionConfig::default(),
            trust_mtime: default_trust_mtime(),
            hash_workers: default_hash_workers(),
        }
    }
}

impl Settings {
    /// Starter document written by `init` next to the user.
    pub fn starter(dest: &Path, machine_id: &str, source_root: &Path) -> Self {
        Self {
            dest: Some(dest.to_path_buf()),
            machine_id: machine_id.to_string(),
            source_root: Some(source_root.to_path_buf()),
            includes: ["openclaw.json", "workspace/skills", "MEMORY.md", "memory"]
                .map(String::from)
                .to_vec(),
            excludes: ["workspace/tmp", "media", "tmp"].map(String::from).to_vec(),
            ..Self::default()
        }
    }

    pub fn parse(path: &Path, raw: &str) -> Result<Self> {
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let parsed = if is_toml {
            toml::from_str(raw).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(raw).map_err(|e| e.to_string())
        };
        parsed.map_err(|reason| Error::ConfigInvalid {
            path: path.display().to_string(),
            reason,
        })
    }

    pub fn to_document(&self, path: &Path) -> Result<String> {
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            toml::to_string_pretty(self).map_err(|e| Error::Other(e.to_string()))
        } else {
            let mut out = serde_json::to_string_pretty(self)?;
            out.push('\n');
            Ok(out)
        }
    }

    pub fn snapshot_request(&self, cwd: &Path) -> SnapshotRequest {
        let root = match &self.source_root {
            Some(root) => absolutize(root, cwd),
            None => cwd.to_path_buf(),
        };
        let mut req = SnapshotRequest::new(root);
        req.includes = self.includes.clone();
        req.excludes = self.excludes.clone();
        req.trust_mtime = self.trust_mtime;
        req.hash_workers = self.hash_workers.max(1);
        req
    }
}

impl Config {
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let cwd = current_dir()?;
        let path = resolve_path(explicit, &cwd)?;
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::ConfigMissing {
                path: path.display().to_string(),
            },
            _ => Error::io(format!("reading {}", path.display()), e),
        })?;
        let settings = Settings::parse(&path, &raw)?;
        let dest = settings
            .dest
            .as_deref()
            .map(|d| absolutize(d, &cwd))
            .ok_or(Error::ConfigMissingDest)?;
        Ok(Self {
            path,
            dest,
            settings,
        })
    }
}

/// `--config`, then `./timeclaw.config.json`, then the per-user config dir.
pub fn resolve_path(explicit: Option<&Path>, cwd: &Path) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(absolutize(path, cwd));
    }
    let local = cwd.join(CONFIG_FILE);
    if local.is_file() {
        return Ok(local);
    }
    if let Some(user) = user_config_path() {
        if user.is_file() {
            return Ok(user);
        }
    }
    Err(Error::ConfigMissing {
        path: local.display().to_string(),
    })
}

pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "timeclaw").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

pub fn current_dir() -> Result<PathBuf> {
    std::env::current_dir().map_err(|e| Error::io("reading current directory", e))
}

pub fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_json_with_defaults() {
        let settings = Settings::parse(
            Path::new("timeclaw.config.json"),
            r#"{"dest": "/mnt/backup", "excludes": ["tmp/"], "retention": {"dailyDays": 7}}"#,
        )
        .unwrap();

        assert_eq!(settings.dest, Some(PathBuf::from("/mnt/backup")));
        assert_eq!(settings.machine_id, default_machine_id());
        assert!(settings.includes.is_empty());
        assert_eq!(settings.excludes, vec!["tmp/"]);
        assert_eq!(settings.retention.hourly_hours, 24);
        assert_eq!(settings.retention.daily_days, 7);
        assert!(settings.trust_mtime);
        assert!(settings.hash_workers >= 1);
    }

    #[test]
    fn test_parse_toml_by_extension() {
        let raw = r#"
dest = "/srv/timeclaw"
machineId = "laptop"
trustMtime = false
hashWorkers = 2

[retention]
weeklyWeeks = 52
"#;
        let settings = Settings::parse(Path::new("timeclaw.toml"), raw).unwrap();
        assert_eq!(settings.machine_id, "laptop");
        assert!(!settings.trust_mtime);
        assert_eq!(settings.hash_workers, 2);
        assert_eq!(settings.retention.weekly_weeks, 52);
    }

    #[test]
    fn test_invalid_document() {
        let err = Settings::parse(Path::new("c.json"), "{ not json").unwrap_err();
        assert_eq!(err.code(), "CONFIG_INVALID");
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_load_requires_dest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(&path, r#"{"machineId": "m1"}"#).unwrap();
        let err = Config::load(Some(&path)).await.unwrap_err();
        assert_eq!(err.code(), "CONFIG_MISSING_DEST");

        let missing = Config::load(Some(&dir.path().join("absent.json")))
            .await
            .unwrap_err();
        assert_eq!(missing.code(), "CONFIG_MISSING");
    }

    #[tokio::test]
    async fn test_starter_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let starter = Settings::starter(&dir.path().join("dest"), "m1", dir.path());
        std::fs::write(&path, starter.to_document(&path).unwrap()).unwrap();

        let config = Config::load(Some(&path)).await.unwrap();
        assert_eq!(config.dest, dir.path().join("dest"));
        assert_eq!(config.settings.machine_id, "m1");
        assert_eq!(config.settings.includes.len(), 4);

        let req = config.settings.snapshot_request(Path::new("/elsewhere"));
        assert_eq!(req.source_root, dir.path());
        assert_eq!(req.excludes, vec!["workspace/tmp", "media", "tmp"]);
    }
}
