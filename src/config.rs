//! Configuration system for the embodiment engine
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (EMBODIMENT_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::analysis::{AnalysisConfig, AnalyzerKind};
use crate::boundary::{DenyList, DEFAULT_DENY_LIST};
use crate::error::{Error, Result};
use crate::evolution::EvolutionConfig;
use crate::queue::{BreakerConfig, QueueConfig};

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Schema source and cache
    pub schema: SchemaSettings,

    /// Deny-list and namespace
    pub boundary: BoundarySettings,

    /// Candidate accumulation policy
    pub evolution: EvolutionConfig,

    /// Deferred analysis queue
    pub queue: QueueConfig,

    /// Per-dependency circuit breakers
    pub breaker: BreakerConfig,

    /// Which analyzer serves the queue
    pub analysis: AnalysisConfig,

    /// Audit store location
    pub storage: StorageSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Schema settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaSettings {
    /// Schema document path; the embedded schema is used when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// How long a cached schema is served before the source is re-checked
    pub cache_ttl_secs: u64,

    /// Background refresh interval for `run`
    pub refresh_interval_secs: u64,
}

/// Boundary settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundarySettings {
    /// Path patterns never accepted as research data
    pub deny_list: Vec<String>,

    /// Extra root segments treated as embodiment data
    pub extra_roots: Vec<String>,
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Base data directory
    pub data_dir: String,

    /// Persist records to `<data_dir>/audit.jsonl`
    pub journal: bool,

    /// Salt for deriving pseudonyms from user ids
    pub pseudonym_salt: String,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema: SchemaSettings::default(),
            boundary: BoundarySettings::default(),
            evolution: EvolutionConfig::default(),
            queue: QueueConfig::default(),
            breaker: BreakerConfig::default(),
            analysis: AnalysisConfig::default(),
            storage: StorageSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for SchemaSettings {
    fn default() -> Self {
        Self {
            source: None,
            cache_ttl_secs: 60,
            refresh_interval_secs: 60,
        }
    }
}

impl Default for BoundarySettings {
    fn default() -> Self {
        Self {
            deny_list: DEFAULT_DENY_LIST.iter().map(|s| s.to_string()).collect(),
            extra_roots: Vec::new(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.embodiment/data".to_string(),
            journal: true,
            pseudonym_salt: String::new(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_files: 5,
            json_format: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            config = Self::from_file(&path)?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Parse one file without overrides or validation
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading configuration file");
        let content = fs::read_to_string(path).map_err(|e| Error::IoRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // Explicit path must exist
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        let search_paths = [
            PathBuf::from("embodiment.toml"),
            dirs::config_dir()
                .map(|p| p.join("embodiment").join("engine.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".embodiment").join("engine.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/embodiment/engine.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Schema
        if let Ok(val) = std::env::var("EMBODIMENT_SCHEMA_SOURCE") {
            self.schema.source = Some(val);
        }
        if let Some(n) = env_parse("EMBODIMENT_SCHEMA_CACHE_TTL_SECS") {
            self.schema.cache_ttl_secs = n;
        }

        // Boundary
        if let Ok(val) = std::env::var("EMBODIMENT_DENY_LIST") {
            self.boundary.deny_list = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        // Evolution
        if let Some(n) = env_parse("EMBODIMENT_MIN_SUPPORT") {
            self.evolution.min_support = n;
        }
        if let Some(b) = env_bool("EMBODIMENT_AUTO_EXTEND") {
            self.evolution.auto_extend = b;
        }

        // Queue
        if let Some(b) = env_bool("EMBODIMENT_QUEUE_ENABLED") {
            self.queue.enabled = b;
        }
        if let Some(n) = env_parse("EMBODIMENT_QUEUE_WORKERS") {
            self.queue.workers = n;
        }
        if let Some(n) = env_parse("EMBODIMENT_MAX_RETRIES") {
            self.queue.max_retries = n;
        }
        if let Some(n) = env_parse("EMBODIMENT_LEASE_SECS") {
            self.queue.lease_secs = n;
        }
        if let Some(n) = env_parse("EMBODIMENT_CALL_TIMEOUT_MS") {
            self.queue.call_timeout_ms = n;
        }

        // Breaker
        if let Some(n) = env_parse("EMBODIMENT_BREAKER_THRESHOLD") {
            self.breaker.failure_threshold = n;
        }
        if let Some(n) = env_parse("EMBODIMENT_BREAKER_COOLDOWN_SECS") {
            self.breaker.cooldown_secs = n;
        }

        // Analysis
        if let Some(kind) = std::env::var("EMBODIMENT_ANALYZER")
            .ok()
            .and_then(|v| AnalyzerKind::from_str(&v))
        {
            self.analysis.kind = kind;
        }
        if let Ok(val) = std::env::var("EMBODIMENT_ANALYSIS_URL") {
            self.analysis.remote.base_url = val;
        }
        if let Ok(val) = std::env::var("EMBODIMENT_ANALYSIS_API_KEY") {
            self.analysis.remote.api_key = val;
        }

        // Storage
        if let Ok(val) = std::env::var("EMBODIMENT_DATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Some(b) = env_bool("EMBODIMENT_JOURNAL") {
            self.storage.journal = b;
        }
        if let Ok(val) = std::env::var("EMBODIMENT_PSEUDONYM_SALT") {
            self.storage.pseudonym_salt = val;
        }

        // Logging
        if let Ok(val) = std::env::var("EMBODIMENT_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("EMBODIMENT_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Some(b) = env_bool("EMBODIMENT_LOG_JSON") {
            self.logging.json_format = b;
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        self.storage.data_dir = expand_path(&self.storage.data_dir);
        if let Some(ref source) = self.schema.source {
            self.schema.source = Some(expand_path(source));
        }
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        if self.evolution.min_support == 0 {
            return Err(Error::config_field_invalid(
                "evolution.min_support",
                "min_support must be at least 1",
            ));
        }

        if self.queue.enabled && self.queue.workers == 0 {
            return Err(Error::config_field_invalid(
                "queue.workers",
                "at least one worker is required while the queue is enabled",
            ));
        }
        if !(0.0..=1.0).contains(&self.queue.jitter) {
            return Err(Error::config_field_invalid(
                "queue.jitter",
                "jitter must be between 0 and 1",
            ));
        }
        if self.queue.call_timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "queue.call_timeout_ms",
                "call timeout must be positive",
            ));
        }
        if self.queue.lease_secs.saturating_mul(1000) <= self.queue.call_timeout_ms {
            return Err(Error::config_field_invalid(
                "queue.lease_secs",
                "the lease must outlast a single analysis call timeout",
            ));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(Error::config_field_invalid(
                "breaker.failure_threshold",
                "failure_threshold must be at least 1",
            ));
        }

        if self.analysis.kind == AnalyzerKind::Remote {
            let url = &self.analysis.remote.base_url;
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::config_field_invalid(
                    "analysis.remote.base_url",
                    "analysis service URL must start with http:// or https://",
                ));
            }
        }

        if self.storage.journal && self.storage.data_dir.trim().is_empty() {
            return Err(Error::config_field_invalid(
                "storage.data_dir",
                "a data directory is required when the journal is enabled",
            ));
        }

        Ok(())
    }

    /// Get the data directory as a PathBuf
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
    }

    pub fn schema_source(&self) -> Option<PathBuf> {
        self.schema.source.as_ref().map(PathBuf::from)
    }

    pub fn schema_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.schema.cache_ttl_secs)
    }

    pub fn schema_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.schema.refresh_interval_secs.max(1))
    }

    pub fn deny_list(&self) -> DenyList {
        DenyList::new(&self.boundary.deny_list)
    }

    /// Serialize back to TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| v.to_lowercase() == "true" || v == "1")
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Default location written by `config init`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".embodiment")
        .join("engine.toml")
}

/// Initialize a new configuration file, returning where it was written
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(default_config_path);

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# Embodiment Engine Configuration

[schema]
# Schema document (TOML); the embedded default schema is used when unset
# source = "~/.embodiment/schema.toml"

# Seconds a cached schema is served before the source is re-checked
cache_ttl_secs = 60

# Background refresh interval while running
refresh_interval_secs = 60

[boundary]
# Path patterns never stored as research data; "*" matches one segment
deny_list = ["name", "first_name", "last_name", "full_name", "username", "email", "*.email", "user", "user_id", "session", "session_id", "phone", "address", "ip", "ip_address", "password", "token", "api_key"]

# Extra root segments routed to the engine
extra_roots = []

[evolution]
# Observations before a candidate field may be auto-approved
min_support = 5

# Approve candidates automatically at min_support
auto_extend = false

# Example values and detection contexts kept per candidate
max_samples = 10
max_contexts = 10

[queue]
# Deferred bias analysis; when disabled, requests are accepted and dropped
enabled = true

# Background workers
workers = 2

# Retries before a job is dead-lettered
max_retries = 3

# Visibility lease held while a worker runs a job
lease_secs = 60

# Idle poll interval
poll_interval_ms = 500

# Exponential backoff between retries
backoff_base_ms = 2000
backoff_max_ms = 300000
jitter = 0.5

# Timeout for one analysis call
call_timeout_ms = 10000

[breaker]
# Consecutive failures within window_secs that open a circuit
failure_threshold = 5
window_secs = 60

# Seconds an open circuit fails fast
cooldown_secs = 30

[analysis]
# heuristic | remote | mock
kind = "heuristic"

[analysis.remote]
base_url = "http://localhost:8090"
api_key = ""
timeout_secs = 30

[storage]
# Base data directory
data_dir = "~/.embodiment/data"

# Persist records to <data_dir>/audit.jsonl
journal = true

# Salt for deriving pseudonyms from user ids
pseudonym_salt = ""

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.embodiment/logs/engine.log"

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
