//! Configuration management for CLI, environment variables, and config files.

use crate::buffer::DEFAULT_FLUSH_INTERVAL;
use crate::cache::DEFAULT_CACHE_TTL;
use crate::circuit_breaker::BreakerSettings;
use crate::error::{CounterError, ValidationIssue};
use crate::ring::DEFAULT_VIRTUAL_NODES;
use crate::store::ShardAddress;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const MAX_VIRTUAL_NODES: usize = 10_000;
const MAX_FLUSH_INTERVAL_SECS: u64 = 3600;
const MAX_STORE_TIMEOUT_MS: u64 = 60_000;
const VALID_LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Main configuration for visit-counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub shards: ShardsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Store nodes and how keys are spread across them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardsConfig {
    /// Shard addresses, `redis://[:password@]host[:port][/db]` or `host[:port]`
    pub nodes: Vec<String>,
    pub virtual_nodes: usize,
    /// Password for shards whose address carries none
    pub password: Option<String>,
    /// Database for shards whose address names none
    pub db: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub flush_interval_secs: u64,
    /// How long shutdown waits for an in-flight flush before the final drain
    pub shutdown_grace_secs: u64,
}

/// Per-operation store limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub timeout_ms: u64,
    pub failure_threshold: u32,
    pub breaker_reset_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ShardsConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["redis://127.0.0.1:6379".to_string()],
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            password: None,
            db: 0,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_CACHE_TTL.as_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL.as_secs(),
            shutdown_grace_secs: 5,
        }
    }
}

impl BufferConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        let breaker = BreakerSettings::default();
        Self {
            timeout_ms: 2000,
            failure_threshold: breaker.failure_threshold,
            breaker_reset_secs: breaker.reset_after.as_secs(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.failure_threshold,
            reset_after: Duration::from_secs(self.breaker_reset_secs),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T, CounterError> {
    value
        .trim()
        .parse()
        .map_err(|_| CounterError::InvalidArgument(format!("{} has invalid format", name)))
}

/// Split a comma separated shard list, dropping empty items.
pub fn parse_shard_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self, CounterError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| CounterError::IoError(e.to_string()))?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());
        match ext.as_deref() {
            Some("json") => {
                serde_json::from_str(&content).map_err(|e| CounterError::ParseError(e.to_string()))
            }
            _ => toml::from_str(&content).map_err(|e| CounterError::ParseError(e.to_string())),
        }
    }

    pub fn from_default_locations() -> Result<Self, CounterError> {
        let config_paths = [
            dirs::config_dir().map(|d| d.join("visit-counter/config.toml")),
            Some(PathBuf::from("/etc/visit-counter/config.toml")),
            Some(PathBuf::from("./visit-counter.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        Ok(Self::default())
    }

    pub fn merge_from_env(mut self) -> Result<Self, CounterError> {
        if let Ok(val) = std::env::var("VISIT_COUNTER_SHARDS") {
            self.shards.nodes = parse_shard_list(&val);
        }
        if let Ok(val) = std::env::var("VISIT_COUNTER_VIRTUAL_NODES") {
            self.shards.virtual_nodes = parse_env("VISIT_COUNTER_VIRTUAL_NODES", &val)?;
        }
        if let Ok(val) = std::env::var("VISIT_COUNTER_SHARD_PASSWORD") {
            self.shards.password = Some(val).filter(|p| !p.is_empty());
        }
        if let Ok(val) = std::env::var("VISIT_COUNTER_SHARD_DB") {
            self.shards.db = parse_env("VISIT_COUNTER_SHARD_DB", &val)?;
        }
        if let Ok(val) = std::env::var("VISIT_COUNTER_CACHE_TTL") {
            self.cache.ttl_secs = parse_env("VISIT_COUNTER_CACHE_TTL", &val)?;
        }
        if let Ok(val) = std::env::var("VISIT_COUNTER_FLUSH_INTERVAL") {
            self.buffer.flush_interval_secs = parse_env("VISIT_COUNTER_FLUSH_INTERVAL", &val)?;
        }
        if let Ok(val) = std::env::var("VISIT_COUNTER_STORE_TIMEOUT_MS") {
            self.store.timeout_ms = parse_env("VISIT_COUNTER_STORE_TIMEOUT_MS", &val)?;
        }
        if let Ok(val) = std::env::var("VISIT_COUNTER_LOG_LEVEL") {
            self.logging.level = val;
        }

        Ok(self)
    }

    pub fn merge_from_cli(mut self, cli: &CliArgs) -> Self {
        if let Some(ref shards) = cli.shards {
            self.shards.nodes = shards.clone();
        }

        if let Some(ref level) = cli.log_level {
            self.logging.level = level.clone();
        }

        self
    }

    /// Load from the CLI's config file, or the default locations, then apply
    /// the environment and CLI overrides.
    pub fn load_with_cli(cli: &CliArgs) -> Result<Self, CounterError> {
        let base = match cli.config_file {
            Some(ref path) => Self::from_file(path)?,
            None => Self::from_default_locations()?,
        };
        Ok(base.merge_from_env()?.merge_from_cli(cli))
    }

    pub fn validate(&self) -> Result<(), CounterError> {
        let mut issues = Vec::new();
        let mut issue = |field: &str, message: String| {
            issues.push(ValidationIssue {
                field: field.to_string(),
                message,
            })
        };

        if self.shards.nodes.is_empty() {
            issue("shards.nodes", "At least one shard is required".to_string());
        }
        let mut seen = HashSet::new();
        for node in &self.shards.nodes {
            if !seen.insert(node.as_str()) {
                issue("shards.nodes", format!("Duplicate shard '{}'", node));
            }
            if let Err(e) = node.parse::<ShardAddress>() {
                issue("shards.nodes", e.to_string());
            }
        }

        if !(1..=MAX_VIRTUAL_NODES).contains(&self.shards.virtual_nodes) {
            issue(
                "shards.virtual_nodes",
                format!("Must be between 1 and {}", MAX_VIRTUAL_NODES),
            );
        }

        if self.cache.ttl_secs == 0 {
            issue("cache.ttl_secs", "Must be at least 1 second".to_string());
        }

        if !(1..=MAX_FLUSH_INTERVAL_SECS).contains(&self.buffer.flush_interval_secs) {
            issue(
                "buffer.flush_interval_secs",
                format!("Must be between 1 and {} seconds", MAX_FLUSH_INTERVAL_SECS),
            );
        }

        if !(1..=MAX_STORE_TIMEOUT_MS).contains(&self.store.timeout_ms) {
            issue(
                "store.timeout_ms",
                format!("Must be between 1 and {} milliseconds", MAX_STORE_TIMEOUT_MS),
            );
        }

        if self.store.failure_threshold == 0 {
            issue("store.failure_threshold", "Must be at least 1".to_string());
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            issue(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Valid levels: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            );
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(CounterError::ValidationError(issues))
        }
    }
}

/// Command-line arguments that override configuration values.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config_file: Option<PathBuf>,
    pub shards: Option<Vec<String>>,
    pub log_level: Option<String>,
}
