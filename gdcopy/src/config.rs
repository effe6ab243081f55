//! YAML configuration.
//!
//! `config.yml` is read first and `config.custom.yml` is merged over it: maps
//! merge key by key, any other value replaces what was there. Relative paths
//! resolve against the config directory. A few `GDCOPY_*` environment
//! variables override the merged result.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;

use crate::remote::backoff::Backoff;
use crate::remote::executor::RetryPolicy;
use crate::remote::rate_limit::RateLimitConfig;
use crate::sync::engine::SyncOptions;
use crate::sync::filter::{FilterError, IgnoreFilter};

pub const CONFIG_FILE: &str = "config.yml";
pub const CUSTOM_CONFIG_FILE: &str = "config.custom.yml";

pub const ENV_CONFIG_DIR: &str = "GDCOPY_CONFIG_DIR";
pub const ENV_CREDENTIALS: &str = "GDCOPY_CREDENTIALS";
pub const ENV_LEDGER_PATH: &str = "GDCOPY_LEDGER_PATH";
pub const ENV_ACCESS_TOKEN: &str = "GDCOPY_ACCESS_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    pub application_name: String,
    pub credentials_path: PathBuf,
    pub tmp_path: PathBuf,
    pub ledger_path: PathBuf,
    /// Optional file receiving warnings and errors in addition to stderr.
    pub log_path: Option<PathBuf>,
    pub ignored_file_extension_regexes: Vec<String>,
    pub rate_limit: RateLimitSection,
    pub retry: RetrySection,
    pub sync: SyncSection,
    pub api_base_url: Option<String>,
    pub oauth_base_url: Option<String>,
    /// Only ever set from the environment.
    #[serde(skip)]
    pub access_token: Option<String>,
    #[serde(skip)]
    pub config_dir: PathBuf,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            application_name: "gdcopy".to_string(),
            credentials_path: PathBuf::from("credentials.json"),
            tmp_path: PathBuf::from("tmp"),
            ledger_path: PathBuf::from("ledger.sqlite"),
            log_path: None,
            ignored_file_extension_regexes: Vec::new(),
            rate_limit: RateLimitSection::default(),
            retry: RetrySection::default(),
            sync: SyncSection::default(),
            api_base_url: None,
            oauth_base_url: None,
            access_token: None,
            config_dir: PathBuf::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub max_requests: u32,
    pub window_secs: u64,
    pub cooldown_ms: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_secs: 10,
            cooldown_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub unit_ms: u64,
    pub jitter: bool,
    pub max_attempts: Option<u32>,
    pub deadline_secs: Option<u64>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            unit_ms: 1000,
            jitter: true,
            max_attempts: None,
            deadline_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub detect_duplicates: bool,
    pub max_depth: usize,
    pub page_size: u32,
    pub nest_under_source_name: bool,
}

impl Default for SyncSection {
    fn default() -> Self {
        let options = SyncOptions::default();
        Self {
            detect_duplicates: options.detect_duplicates,
            max_depth: options.max_depth,
            page_size: 1000,
            nest_under_source_name: options.nest_under_source_name,
        }
    }
}

impl CopyConfig {
    /// Loads from `GDCOPY_CONFIG_DIR` (or the default directory) and applies
    /// environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let dir = std::env::var_os(ENV_CONFIG_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(default_config_dir);
        let mut config = Self::load(&dir)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Reads and merges the config files in `dir`. Missing files are skipped.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let mut merged = Value::Mapping(Default::default());
        for name in [CONFIG_FILE, CUSTOM_CONFIG_FILE] {
            let path = dir.join(name);
            if !path.exists() {
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            let value: Value = serde_yaml::from_str(&content)
                .map_err(|source| ConfigError::Parse { path, source })?;
            if !value.is_null() {
                merge_values(&mut merged, value);
            }
        }

        let mut config: CopyConfig = serde_yaml::from_value(merged)?;
        config.resolve_paths(dir);
        Ok(config)
    }

    /// Applies `GDCOPY_*` overrides; `lookup` returns a variable's value.
    /// Paths resolve like the ones in the config files.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let value = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let home = dirs::home_dir();
        let dir = self.config_dir.clone();
        let resolve = |path: String| resolve_path(Path::new(&path), &dir, home.as_deref());
        if let Some(path) = value(ENV_CREDENTIALS) {
            self.credentials_path = resolve(path);
        }
        if let Some(path) = value(ENV_LEDGER_PATH) {
            self.ledger_path = resolve(path);
        }
        if let Some(token) = value(ENV_ACCESS_TOKEN) {
            self.access_token = Some(token);
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: self.rate_limit.max_requests,
            window: Duration::from_secs(self.rate_limit.window_secs),
            cooldown: Duration::from_millis(self.rate_limit.cooldown_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            deadline: self.retry.deadline_secs.map(Duration::from_secs),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(Duration::from_millis(self.retry.unit_ms), self.retry.jitter)
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            detect_duplicates: self.sync.detect_duplicates,
            max_depth: self.sync.max_depth,
            nest_under_source_name: self.sync.nest_under_source_name,
        }
    }

    pub fn ignore_filter(&self) -> Result<IgnoreFilter, FilterError> {
        IgnoreFilter::new(&self.ignored_file_extension_regexes)
    }

    fn resolve_paths(&mut self, dir: &Path) {
        let home = dirs::home_dir();
        let resolve = |path: &Path| resolve_path(path, dir, home.as_deref());
        self.credentials_path = resolve(&self.credentials_path);
        self.tmp_path = resolve(&self.tmp_path);
        self.ledger_path = resolve(&self.ledger_path);
        self.log_path = self.log_path.as_deref().map(resolve);
        self.config_dir = dir.to_path_buf();
    }
}

/// `./config` when present, otherwise `$XDG_CONFIG_HOME/gdcopy`.
fn default_config_dir() -> PathBuf {
    let local = PathBuf::from("config");
    if local.is_dir() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("gdcopy"))
        .unwrap_or(local)
}

fn resolve_path(path: &Path, dir: &Path, home: Option<&Path>) -> PathBuf {
    if let Some(home) = home
        && let Ok(rest) = path.strip_prefix("~")
    {
        return home.join(rest);
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
