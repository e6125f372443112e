//! Process configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::persistent_store::DEFAULT_CHECKPOINT_EVERY;
use crate::replicator::{
    ReplicatorSettings, DEFAULT_ALLOWABLE_FAILURES, DEFAULT_FAILURE_PENALTY, MIN_POLL_INTERVAL_MS,
};

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSyncConfig {
    /// File overwritten with the latest unexpected failure.
    #[serde(default = "default_monitoring_log")]
    pub monitoring_log: PathBuf,
    /// Replication state backend.
    #[serde(default)]
    pub state: StateConfig,
    /// Backoff tunables shared by every replication set.
    #[serde(default)]
    pub sync: SyncConfig,
    /// One entry per (source, target) pair.
    #[serde(default)]
    pub replication_sets: Vec<ReplicationSetConfig>,
}

/// Where replication state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Lost on restart.
    Memory,
    /// Log plus checkpoint files under [`StateConfig::dir`].
    #[default]
    Persistent,
}

/// Replication state settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Backend kind.
    #[serde(default)]
    pub backend: StateBackend,
    /// Directory of the persistent backend.
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
    /// Log records between automatic checkpoints.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::default(),
            dir: default_state_dir(),
            checkpoint_every: default_checkpoint_every(),
        }
    }
}

/// Failure backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Consecutive failures tolerated before a group is penalized.
    #[serde(default = "default_allowable_failures")]
    pub allowable_failures: u64,
    /// Cycles a penalized group sits out.
    #[serde(default = "default_failure_penalty")]
    pub failure_penalty: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            allowable_failures: DEFAULT_ALLOWABLE_FAILURES,
            failure_penalty: DEFAULT_FAILURE_PENALTY,
        }
    }
}

/// One replication pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSetConfig {
    /// Unique name of the set.
    pub name: String,
    /// Sleep between cycles; 0 falls back to one minute.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Where groups come from.
    pub source: SourceConfig,
    /// Where groups go.
    pub target: TargetConfig,
}

/// Source adapter selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    /// JSON export of the group definition tables.
    File(FileSourceConfig),
}

impl SourceConfig {
    /// Source id.
    pub fn id(&self) -> &str {
        match self {
            SourceConfig::File(c) => &c.id,
        }
    }
}

/// [`crate::adapters::FileGroupSource`] settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSourceConfig {
    /// Source id.
    pub id: String,
    /// Path of the JSON export.
    pub path: PathBuf,
}

/// Target adapter selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TargetConfig {
    /// REST directory service.
    Directory(DirectoryTargetConfig),
}

impl TargetConfig {
    /// Target id.
    pub fn id(&self) -> &str {
        match self {
            TargetConfig::Directory(c) => &c.id,
        }
    }
}

/// [`crate::adapters::DirectoryTarget`] settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryTargetConfig {
    /// Target id.
    pub id: String,
    /// API root, e.g. `https://directory.example.edu/api/v1`.
    pub base_url: String,
    /// Domain appended to group names to form group keys.
    pub domain: String,
    /// Service account the token belongs to. Targets with the same
    /// credential share one rate limiter.
    pub credential: String,
    /// Environment variable holding the bearer token.
    pub token_env: String,
    /// Maximum requests issued concurrently.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Description set along with the default settings of created groups.
    /// When unset, the description given at creation is left alone.
    #[serde(default)]
    pub group_description: Option<String>,
    /// Remote call quota per window.
    #[serde(default = "default_queries_per_timestep")]
    pub queries_per_timestep: u64,
    /// Window length in milliseconds.
    #[serde(default = "default_timestep_ms")]
    pub timestep_ms: u64,
}

fn default_monitoring_log() -> PathBuf {
    PathBuf::from("logs/last_exception.log")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/groupsync/state")
}

fn default_checkpoint_every() -> u64 {
    DEFAULT_CHECKPOINT_EVERY
}

fn default_allowable_failures() -> u64 {
    DEFAULT_ALLOWABLE_FAILURES
}

fn default_failure_penalty() -> u64 {
    DEFAULT_FAILURE_PENALTY
}

fn default_poll_interval_ms() -> u64 {
    MIN_POLL_INTERVAL_MS
}

fn default_batch_size() -> usize {
    50
}

fn default_queries_per_timestep() -> u64 {
    1500
}

fn default_timestep_ms() -> u64 {
    100_000
}

fn invalid(msg: impl Into<String>) -> SyncError {
    SyncError::Config { msg: msg.into() }
}

impl GroupSyncConfig {
    /// Parse a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Parse and validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = Self::from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the process cannot run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.replication_sets.is_empty() {
            return Err(invalid("no replication_sets configured"));
        }
        if self.state.backend == StateBackend::Persistent && self.state.dir.as_os_str().is_empty() {
            return Err(invalid("state.dir is required for the persistent backend"));
        }

        let mut names = HashSet::new();
        for set in &self.replication_sets {
            if set.name.trim().is_empty() {
                return Err(invalid("replication set with an empty name"));
            }
            if !names.insert(set.name.as_str()) {
                return Err(invalid(format!("duplicate replication set '{}'", set.name)));
            }
            if set.source.id().trim().is_empty() {
                return Err(invalid(format!("set '{}': source id is empty", set.name)));
            }
            if set.target.id().trim().is_empty() {
                return Err(invalid(format!("set '{}': target id is empty", set.name)));
            }
            match &set.target {
                TargetConfig::Directory(t) => validate_directory(&set.name, t)?,
            }
        }
        Ok(())
    }

    /// Replicator tunables for one set.
    pub fn replicator_settings(&self, set: &ReplicationSetConfig) -> ReplicatorSettings {
        ReplicatorSettings {
            poll_interval_ms: set.poll_interval_ms,
            allowable_failures: self.sync.allowable_failures,
            failure_penalty: self.sync.failure_penalty,
        }
    }
}

fn validate_directory(set: &str, t: &DirectoryTargetConfig) -> Result<(), SyncError> {
    for (field, value) in [
        ("base_url", &t.base_url),
        ("domain", &t.domain),
        ("credential", &t.credential),
        ("token_env", &t.token_env),
    ] {
        if value.trim().is_empty() {
            return Err(invalid(format!("set '{}': target {} is empty", set, field)));
        }
    }
    if t.batch_size == 0 {
        return Err(invalid(format!("set '{}': batch_size must be positive", set)));
    }
    if t.queries_per_timestep == 0 || t.timestep_ms == 0 {
        return Err(invalid(format!(
            "set '{}': queries_per_timestep and timestep_ms must be positive",
            set
        )));
    }
    if t.queries_per_timestep < t.batch_size as u64 {
        return Err(invalid(format!(
            "set '{}': batch_size {} exceeds the rate limit quota {}",
            set, t.batch_size, t.queries_per_timestep
        )));
    }
    if std::env::var(&t.token_env).map_or(true, |v| v.is_empty()) {
        return Err(invalid(format!(
            "set '{}': environment variable {} is not set",
            set, t.token_env
        )));
    }
    Ok(())
}
