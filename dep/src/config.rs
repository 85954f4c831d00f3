//! Pipeline configuration (`dep.toml`).
//!
//! Every section and key is optional; missing values fall back to the
//! defaults below. A handful of environment variables override the file so
//! operators can redirect a single run without editing it.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::RepositoryConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("No dep.toml found in standard locations")]
    NotFound,
    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepConfig {
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    #[serde(default)]
    pub digest: DigestSettings,
    #[serde(default)]
    pub assign: AssignSettings,
    /// `[repository]` and `[postgres]` tables.
    #[serde(flatten)]
    pub store: RepositoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    #[serde(default = "default_rootdir")]
    pub rootdir: PathBuf,
    /// Directory holding `KOA_{INSTR}_Keyword_Table.txt` files.
    #[serde(default = "default_keyword_dir")]
    pub keyword_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_proposal_api")]
    pub proposal_api: String,
    #[serde(default = "default_sun_api")]
    pub sun_api: String,
    #[serde(default = "default_ingest_api")]
    pub ingest_api: String,
    #[serde(default = "default_api_timeout")]
    pub timeout_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub dir: String,
    #[serde(default = "default_transfer_timeout")]
    pub timeout_sec: u64,
    /// When false the transfer and ingest steps are skipped.
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSettings {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestSettings {
    #[serde(default = "default_min_notify_interval")]
    pub min_notify_interval_sec: u64,
    #[serde(default = "default_stuck_after")]
    pub stuck_after_sec: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignSettings {
    /// `"U205,10:21:00,C251"` style override for single-file runs.
    #[serde(default)]
    pub assign_progname: Option<String>,
    /// Replaces the sun midpoint when splitting unwindowed programs (`HH:MM`).
    #[serde(default)]
    pub split_time: Option<String>,
}

fn default_rootdir() -> PathBuf {
    PathBuf::from("/koadata")
}

fn default_keyword_dir() -> PathBuf {
    PathBuf::from("/koadata/keywords")
}

fn default_proposal_api() -> String {
    "https://www.keck.hawaii.edu/software/db_api/proposalsAPI.php".to_string()
}

fn default_sun_api() -> String {
    "https://www.keck.hawaii.edu/software/db_api/metrics.php".to_string()
}

fn default_ingest_api() -> String {
    "https://koa.ipac.caltech.edu/cgi-bin/KOA/nph-KOAingest".to_string()
}

fn default_api_timeout() -> u64 {
    30
}

fn default_transfer_timeout() -> u64 {
    3600
}

fn default_max_workers() -> usize {
    10
}

fn default_poll_interval() -> u64 {
    5
}

fn default_min_notify_interval() -> u64 {
    7200
}

fn default_stuck_after() -> u64 {
    900
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            rootdir: default_rootdir(),
            keyword_dir: default_keyword_dir(),
        }
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            proposal_api: default_proposal_api(),
            sun_api: default_sun_api(),
            ingest_api: default_ingest_api(),
            timeout_sec: default_api_timeout(),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            account: String::new(),
            server: String::new(),
            dir: String::new(),
            timeout_sec: default_transfer_timeout(),
            enabled: false,
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            poll_interval_sec: default_poll_interval(),
        }
    }
}

impl Default for DigestSettings {
    fn default() -> Self {
        Self {
            min_notify_interval_sec: default_min_notify_interval(),
            stuck_after_sec: default_stuck_after(),
        }
    }
}

impl ApiSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }
}

impl DepConfig {
    pub fn parse_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load a file and apply environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: DepConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env()?;
        Ok(config)
    }

    /// Search `dep.toml`, `dep/dep.toml`, `../dep.toml`.
    pub fn from_default_location() -> Result<Self, ConfigError> {
        let search_paths = [
            PathBuf::from("dep.toml"),
            PathBuf::from("dep/dep.toml"),
            PathBuf::from("../dep.toml"),
        ];
        for path in search_paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }
        Err(ConfigError::NotFound)
    }

    /// The file when one exists, otherwise defaults. Env overrides apply to both.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        match Self::from_default_location() {
            Err(ConfigError::NotFound) => {
                let mut config = Self::default();
                config.apply_env()?;
                Ok(config)
            }
            other => other,
        }
    }

    /// `DEP_ROOTDIR` and `DEP_MAX_WORKERS`. Store selection variables are
    /// read by the repository factory.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(rootdir) = std::env::var("DEP_ROOTDIR") {
            self.paths.rootdir = PathBuf::from(rootdir);
        }
        if let Ok(raw) = std::env::var("DEP_MAX_WORKERS") {
            self.dispatcher.max_workers = raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidEnv {
                    key: "DEP_MAX_WORKERS".to_string(),
                    value: raw,
                })?;
        }
        Ok(())
    }
}
