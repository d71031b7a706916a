//! Configuration loading and validation for the retrace service.
//!
//! Configuration is a single JSON document describing one or more watch
//! groups (directory trees plus per-tree capture policy), the HTTP bind
//! address, and the database path. Loading applies defaults first, then
//! validates; a configuration that fails validation aborts start-up.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default exclusion patterns applied when a group does not configure any.
pub const DEFAULT_EXCLUDE_PATTERNS: &[&str] = &[
    "**/node_modules/**",
    "**/.git/**",
    "**/vendor/**",
    "**/dist/**",
    "**/build/**",
    "**/.next/**",
    "**/__pycache__/**",
    "**/target/**",
    "**/*.min.js",
    "**/*.min.css",
    "**/*.lock",
    "**/package-lock.json",
    "**/pnpm-lock.yaml",
];

const DEFAULT_DEBOUNCE_SEC: u64 = 2;
const DEFAULT_MAX_FILE_SIZE: u64 = 1_048_576;
const DEFAULT_PORT: u16 = 9876;
const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
const DEFAULT_DB_PATH: &str = "~/.local/share/retrace/history.db";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("watchGroups must not be empty")]
    NoGroups,

    #[error("watch group name must not be empty")]
    EmptyGroupName,

    #[error("duplicate watch group name {0:?}")]
    DuplicateGroupName(String),

    #[error("watch group {0:?}: dirs must not be empty")]
    NoDirs(String),

    #[error("watch group {group:?}: dir {dir:?}: {source}")]
    DirUnusable {
        group: String,
        dir: PathBuf,
        source: std::io::Error,
    },

    #[error("watch group {group:?}: {dir:?} is not a directory")]
    NotADirectory { group: String, dir: PathBuf },

    #[error("directory {0:?} appears in more than one watch group")]
    DuplicateDir(PathBuf),

    #[error("watch group {0:?}: debounceSec must be >= 1")]
    DebounceTooSmall(String),

    #[error("watch group {0:?}: maxFileSize must be >= 1")]
    MaxFileSizeTooSmall(String),

    #[error("port must be between 1 and 65535")]
    InvalidPort,

    #[error("basicAuth.username must not be empty when basicAuth is configured")]
    EmptyAuthUsername,

    #[error("basicAuth.password must not be empty when basicAuth is configured")]
    EmptyAuthPassword,

    #[error("expanding dbPath: home directory not available")]
    NoHomeDir,
}

/// Basic authentication credentials for the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// A named bundle of monitoring policy over a set of directory trees.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchGroup {
    pub name: String,

    #[serde(default)]
    pub dirs: Vec<PathBuf>,

    /// Optional allow-list of file-name suffixes (e.g. ".rs"). Absent means
    /// every text file is eligible.
    #[serde(default)]
    pub extensions: Option<Vec<String>>,

    /// Double-star glob patterns; paths matching any pattern are ignored.
    #[serde(default)]
    pub exclude_patterns: Option<Vec<String>>,

    #[serde(default)]
    pub debounce_sec: u64,

    #[serde(default)]
    pub max_file_size: u64,

    /// Per-file snapshot retention cap. Zero keeps every snapshot.
    #[serde(default)]
    pub max_snapshots: u32,
}

impl WatchGroup {
    /// The exclusion patterns in effect for this group.
    pub fn exclude_patterns(&self) -> Vec<String> {
        match &self.exclude_patterns {
            Some(patterns) => patterns.clone(),
            None => DEFAULT_EXCLUDE_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub watch_groups: Vec<WatchGroup>,

    #[serde(default)]
    pub bind_address: String,

    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub db_path: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
}

impl Config {
    /// Reads a JSON config file, applies defaults, expands `~` in the
    /// database path, and validates the result.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut cfg: Config = serde_json::from_slice(&data)?;
        cfg.apply_defaults();
        cfg.db_path = expand_path(&cfg.db_path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_defaults(&mut self) {
        if self.bind_address.is_empty() {
            self.bind_address = DEFAULT_BIND_ADDRESS.to_string();
        }
        if self.port == 0 {
            self.port = DEFAULT_PORT;
        }
        if self.db_path.as_os_str().is_empty() {
            self.db_path = PathBuf::from(DEFAULT_DB_PATH);
        }
        for group in &mut self.watch_groups {
            if group.debounce_sec == 0 {
                group.debounce_sec = DEFAULT_DEBOUNCE_SEC;
            }
            if group.max_file_size == 0 {
                group.max_file_size = DEFAULT_MAX_FILE_SIZE;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.watch_groups.is_empty() {
            return Err(ConfigError::NoGroups);
        }

        let mut names = HashSet::new();
        let mut dirs = HashSet::new();
        for group in &self.watch_groups {
            if group.name.is_empty() {
                return Err(ConfigError::EmptyGroupName);
            }
            if !names.insert(group.name.as_str()) {
                return Err(ConfigError::DuplicateGroupName(group.name.clone()));
            }
            if group.dirs.is_empty() {
                return Err(ConfigError::NoDirs(group.name.clone()));
            }
            for dir in &group.dirs {
                let meta = std::fs::metadata(dir).map_err(|source| ConfigError::DirUnusable {
                    group: group.name.clone(),
                    dir: dir.clone(),
                    source,
                })?;
                if !meta.is_dir() {
                    return Err(ConfigError::NotADirectory {
                        group: group.name.clone(),
                        dir: dir.clone(),
                    });
                }
                if !dirs.insert(dir.clone()) {
                    return Err(ConfigError::DuplicateDir(dir.clone()));
                }
            }
            if group.debounce_sec < 1 {
                return Err(ConfigError::DebounceTooSmall(group.name.clone()));
            }
            if group.max_file_size < 1 {
                return Err(ConfigError::MaxFileSizeTooSmall(group.name.clone()));
            }
        }

        if self.port < 1 {
            return Err(ConfigError::InvalidPort);
        }

        if let Some(auth) = &self.basic_auth {
            if auth.username.is_empty() {
                return Err(ConfigError::EmptyAuthUsername);
            }
            if auth.password.is_empty() {
                return Err(ConfigError::EmptyAuthPassword);
            }
        }

        Ok(())
    }

    /// Every watched root directory across all groups.
    pub fn all_dirs(&self) -> Vec<PathBuf> {
        self.watch_groups
            .iter()
            .flat_map(|g| g.dirs.iter().cloned())
            .collect()
    }
}

/// Replaces a leading `~` with the user's home directory.
fn expand_path(path: &Path) -> Result<PathBuf, ConfigError> {
    let Ok(rest) = path.strip_prefix("~") else {
        return Ok(path.to_path_buf());
    };
    let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(home.join(rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_config(dir: &Path, json: &str) -> PathBuf {
        let path = dir.join("config.json");
        fs::write(&path, json).unwrap();
        path
    }

    fn minimal_config(watch_dir: &Path) -> String {
        format!(
            r#"{{"watchGroups": [{{"name": "main", "dirs": ["{}"]}}], "dbPath": "/tmp/test.db"}}"#,
            watch_dir.display()
        )
    }

    #[test]
    fn applies_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(tmp.path(), &minimal_config(tmp.path()));

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.port, 9876);
        assert_eq!(cfg.bind_address, "0.0.0.0");
        let group = &cfg.watch_groups[0];
        assert_eq!(group.debounce_sec, 2);
        assert_eq!(group.max_file_size, 1_048_576);
        assert_eq!(group.max_snapshots, 0);
        assert!(group.exclude_patterns().contains(&"**/.git/**".to_string()));
    }

    #[test]
    fn rejects_missing_watch_groups() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(tmp.path(), r#"{"dbPath": "/tmp/test.db"}"#);

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::NoGroups));
    }

    #[test]
    fn rejects_nonexistent_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let json = r#"{"watchGroups": [{"name": "main", "dirs": ["/does/not/exist"]}]}"#;
        let path = write_config(tmp.path(), json);

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::DirUnusable { .. }));
    }

    #[test]
    fn rejects_duplicate_group_names() {
        let tmp = tempfile::tempdir().unwrap();
        let json = format!(
            r#"{{"watchGroups": [
                {{"name": "main", "dirs": ["{0}"]}},
                {{"name": "main", "dirs": ["{0}"]}}
            ]}}"#,
            tmp.path().display()
        );
        let path = write_config(tmp.path(), &json);

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateGroupName(_)));
    }

    #[test]
    fn rejects_shared_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let json = format!(
            r#"{{"watchGroups": [
                {{"name": "a", "dirs": ["{0}"]}},
                {{"name": "b", "dirs": ["{0}"]}}
            ]}}"#,
            tmp.path().display()
        );
        let path = write_config(tmp.path(), &json);

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateDir(_)));
    }

    #[test]
    fn allows_nested_directories_across_groups() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("sub");
        fs::create_dir(&sub).unwrap();
        let json = format!(
            r#"{{"watchGroups": [
                {{"name": "parent", "dirs": ["{}"]}},
                {{"name": "child", "dirs": ["{}"]}}
            ]}}"#,
            tmp.path().display(),
            sub.display()
        );
        let path = write_config(tmp.path(), &json);

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.watch_groups.len(), 2);
    }

    #[test]
    fn rejects_partial_basic_auth() {
        let tmp = tempfile::tempdir().unwrap();
        let json = format!(
            r#"{{"watchGroups": [{{"name": "main", "dirs": ["{}"]}}],
                "basicAuth": {{"username": "admin", "password": ""}}}}"#,
            tmp.path().display()
        );
        let path = write_config(tmp.path(), &json);

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyAuthPassword));
    }

    #[test]
    fn expands_home_in_db_path() {
        let tmp = tempfile::tempdir().unwrap();
        let json = format!(
            r#"{{"watchGroups": [{{"name": "main", "dirs": ["{}"]}}],
                "dbPath": "~/state/history.db"}}"#,
            tmp.path().display()
        );
        let path = write_config(tmp.path(), &json);

        let cfg = Config::load(&path).unwrap();
        assert!(!cfg.db_path.starts_with("~"));
        assert!(cfg.db_path.ends_with("state/history.db"));
    }

    #[test]
    fn rejects_zero_debounce_only_when_explicit() {
        // An explicit 0 is replaced by the default rather than rejected, the
        // same as an absent field.
        let tmp = tempfile::tempdir().unwrap();
        let json = format!(
            r#"{{"watchGroups": [{{"name": "main", "dirs": ["{}"], "debounceSec": 0}}]}}"#,
            tmp.path().display()
        );
        let path = write_config(tmp.path(), &json);

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.watch_groups[0].debounce_sec, 2);
    }
}
