//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TIDEPOOL_SYNC_STRATEGY=push                                        │
//! │     TIDEPOOL_AUTO_SYNC=true                                            │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tidepool/sync.toml (Linux)                               │
//! │     ~/Library/Application Support/dev.tidepool.tidepool/sync.toml      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     bidirectional, last-write-wins, manual sync                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [tables]
//! todos = "todos"           # local name = remote name
//! users = "app_users"
//!
//! [sync]
//! strategy = "bidirectional"  # push | pull | bidirectional
//! conflict_resolution = "last-write-wins"
//! auto_sync = true
//! sync_interval_ms = 30000
//! realtime = false
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use tidepool_core::validation::validate_table_name;
use tidepool_core::{ConflictStrategy, DEFAULT_CONFLICT_THRESHOLD_MS};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Sync Strategy
// =============================================================================

/// What a scheduled or `sync()` cycle does.
///
/// ```text
/// PUSH            local change log ──► remote
/// PULL            remote ──► local store (conflict resolution)
/// BIDIRECTIONAL   pull, then push, under one guard (default)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    Push,
    Pull,
    #[default]
    Bidirectional,
}

impl std::fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStrategy::Push => write!(f, "push"),
            SyncStrategy::Pull => write!(f, "pull"),
            SyncStrategy::Bidirectional => write!(f, "bidirectional"),
        }
    }
}

impl std::str::FromStr for SyncStrategy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "push" => Ok(SyncStrategy::Push),
            "pull" => Ok(SyncStrategy::Pull),
            "bidirectional" | "both" | "full" => Ok(SyncStrategy::Bidirectional),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown sync strategy: '{}'. Valid options: push, pull, bidirectional",
                other
            ))),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync behavior settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// What `sync()` and auto-sync ticks run.
    #[serde(default)]
    pub strategy: SyncStrategy,

    /// Built-in conflict policy name. Unknown names fall back to
    /// last-write-wins. Custom handlers are set on the engine builder.
    #[serde(default = "default_conflict_resolution")]
    pub conflict_resolution: String,

    /// Run `strategy` on a timer.
    #[serde(default)]
    pub auto_sync: bool,

    /// Auto-sync period (milliseconds). The first tick is one period after start.
    #[serde(default = "default_sync_interval")]
    pub sync_interval_ms: u64,

    /// Subscribe to the backend change feed.
    #[serde(default)]
    pub realtime: bool,

    /// Minimum timestamp gap (milliseconds) treated as a conflict on pull.
    #[serde(default = "default_conflict_threshold")]
    pub conflict_threshold_ms: i64,

    /// Initial delay (milliseconds) before resubscribing a closed change feed.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound (milliseconds) for the resubscribe delay.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_conflict_resolution() -> String {
    "last-write-wins".to_string()
}
fn default_sync_interval() -> u64 {
    30_000
}
fn default_conflict_threshold() -> i64 {
    DEFAULT_CONFLICT_THRESHOLD_MS
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60_000
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            strategy: SyncStrategy::default(),
            conflict_resolution: default_conflict_resolution(),
            auto_sync: false,
            sync_interval_ms: default_sync_interval(),
            realtime: false,
            conflict_threshold_ms: default_conflict_threshold(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
///
/// ## Example
/// ```rust
/// use tidepool_sync::{SyncConfig, SyncStrategy};
///
/// let config = SyncConfig::new()
///     .table("todos", "todos")
///     .table("users", "app_users")
///     .strategy(SyncStrategy::Push);
///
/// assert_eq!(config.remote_table("users"), Some("app_users"));
/// assert_eq!(config.local_table("app_users"), Some("users"));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Local table name → remote table name.
    #[serde(default)]
    pub tables: BTreeMap<String, String>,

    /// Sync behavior settings.
    #[serde(default)]
    pub sync: SyncSettings,
}

impl SyncConfig {
    /// Creates a config with defaults and no tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a local table to a remote one.
    pub fn table(mut self, local: impl Into<String>, remote: impl Into<String>) -> Self {
        self.tables.insert(local.into(), remote.into());
        self
    }

    pub fn strategy(mut self, strategy: SyncStrategy) -> Self {
        self.sync.strategy = strategy;
        self
    }

    /// Enables auto-sync with the given period.
    pub fn auto_sync(mut self, interval: Duration) -> Self {
        self.sync.auto_sync = true;
        self.sync.sync_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn realtime(mut self, enabled: bool) -> Self {
        self.sync.realtime = enabled;
        self
    }

    pub fn conflict_resolution(mut self, name: impl Into<String>) -> Self {
        self.sync.conflict_resolution = name.into();
        self
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_overrides(|name| std::env::var(name).ok());

        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        for (local, remote) in &self.tables {
            validate_table_name(local)
                .map_err(|e| SyncError::InvalidConfig(format!("table '{}': {}", local, e)))?;
            if remote.trim().is_empty() {
                return Err(SyncError::InvalidConfig(format!(
                    "table '{}' has an empty remote name",
                    local
                )));
            }
        }

        let mut remotes: Vec<&String> = self.tables.values().collect();
        remotes.sort();
        if let Some(pair) = remotes.windows(2).find(|w| w[0] == w[1]) {
            return Err(SyncError::InvalidConfig(format!(
                "remote table '{}' is mapped more than once",
                pair[0]
            )));
        }

        if self.sync.auto_sync && self.sync.sync_interval_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "sync_interval_ms must be greater than 0 when auto_sync is on".into(),
            ));
        }

        if self.sync.conflict_threshold_ms < 0 {
            return Err(SyncError::InvalidConfig(
                "conflict_threshold_ms must not be negative".into(),
            ));
        }

        if self.sync.initial_backoff_ms == 0
            || self.sync.initial_backoff_ms > self.sync.max_backoff_ms
        {
            return Err(SyncError::InvalidConfig(
                "initial_backoff_ms must be in 1..=max_backoff_ms".into(),
            ));
        }

        Ok(())
    }

    /// Applies overrides from a variable lookup (the process environment in
    /// [`SyncConfig::load`]).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(strategy) = lookup("TIDEPOOL_SYNC_STRATEGY") {
            match strategy.parse::<SyncStrategy>() {
                Ok(parsed) => {
                    debug!(strategy = %strategy, "Overriding sync strategy from environment");
                    self.sync.strategy = parsed;
                }
                Err(e) => warn!(%e, "Ignoring TIDEPOOL_SYNC_STRATEGY"),
            }
        }

        if let Some(name) = lookup("TIDEPOOL_CONFLICT_RESOLUTION") {
            debug!(conflict_resolution = %name, "Overriding conflict resolution from environment");
            self.sync.conflict_resolution = name;
        }

        if let Some(flag) = lookup("TIDEPOOL_AUTO_SYNC") {
            match parse_flag(&flag) {
                Some(on) => self.sync.auto_sync = on,
                None => warn!(value = %flag, "Ignoring TIDEPOOL_AUTO_SYNC"),
            }
        }

        if let Some(ms) = lookup("TIDEPOOL_SYNC_INTERVAL_MS") {
            match ms.parse::<u64>() {
                Ok(ms) => self.sync.sync_interval_ms = ms,
                Err(_) => warn!(value = %ms, "Ignoring TIDEPOOL_SYNC_INTERVAL_MS"),
            }
        }

        if let Some(flag) = lookup("TIDEPOOL_REALTIME") {
            match parse_flag(&flag) {
                Some(on) => self.sync.realtime = on,
                None => warn!(value = %flag, "Ignoring TIDEPOOL_REALTIME"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "tidepool", "tidepool")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Remote name of a local table.
    pub fn remote_table(&self, local: &str) -> Option<&str> {
        self.tables.get(local).map(String::as_str)
    }

    /// Local name of a remote table.
    pub fn local_table(&self, remote: &str) -> Option<&str> {
        self.tables
            .iter()
            .find(|(_, r)| r.as_str() == remote)
            .map(|(l, _)| l.as_str())
    }

    /// Local table names, sorted.
    pub fn local_tables(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// The built-in conflict policy named by `conflict_resolution`.
    pub fn conflict_strategy(&self) -> ConflictStrategy {
        ConflictStrategy::from_name(&self.sync.conflict_resolution)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync.sync_interval_ms)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("push".parse::<SyncStrategy>().unwrap(), SyncStrategy::Push);
        assert_eq!("PULL".parse::<SyncStrategy>().unwrap(), SyncStrategy::Pull);
        assert_eq!(
            "bidirectional".parse::<SyncStrategy>().unwrap(),
            SyncStrategy::Bidirectional
        );
        assert!("sideways".parse::<SyncStrategy>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(config.tables.is_empty());
        assert_eq!(config.sync.strategy, SyncStrategy::Bidirectional);
        assert_eq!(config.sync.sync_interval_ms, 30_000);
        assert_eq!(config.sync.conflict_threshold_ms, 1000);
        assert!(!config.sync.auto_sync);
        assert_eq!(config.conflict_strategy().name(), "last-write-wins");
    }

    #[test]
    fn test_unknown_conflict_name_falls_back() {
        let config = SyncConfig::new().conflict_resolution("coin-flip");
        assert_eq!(config.conflict_strategy().name(), "last-write-wins");
        let config = SyncConfig::new().conflict_resolution("remote-wins");
        assert_eq!(config.conflict_strategy().name(), "remote-wins");
    }

    #[test]
    fn test_config_validation() {
        assert!(SyncConfig::new().table("todos", "todos").validate().is_ok());
        assert!(SyncConfig::new().table("_meta", "m").validate().is_err());
        assert!(SyncConfig::new().table("todos", " ").validate().is_err());
        assert!(SyncConfig::new()
            .table("a", "same")
            .table("b", "same")
            .validate()
            .is_err());

        let mut config = SyncConfig::new();
        config.sync.auto_sync = true;
        config.sync.sync_interval_ms = 0;
        assert!(config.validate().unwrap_err().is_config_error());

        let mut config = SyncConfig::new();
        config.sync.initial_backoff_ms = 10_000;
        config.sync.max_backoff_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TIDEPOOL_SYNC_STRATEGY", "pull"),
            ("TIDEPOOL_CONFLICT_RESOLUTION", "local-wins"),
            ("TIDEPOOL_AUTO_SYNC", "yes"),
            ("TIDEPOOL_SYNC_INTERVAL_MS", "1500"),
            ("TIDEPOOL_REALTIME", "maybe"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::new();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.sync.strategy, SyncStrategy::Pull);
        assert_eq!(config.sync.conflict_resolution, "local-wins");
        assert!(config.sync.auto_sync);
        assert_eq!(config.sync_interval(), Duration::from_millis(1500));
        assert!(!config.sync.realtime);
    }

    #[test]
    fn test_toml_roundtrip_and_defaults() {
        let parsed: SyncConfig = toml::from_str(
            r#"
            [tables]
            todos = "remote_todos"

            [sync]
            strategy = "push"
            auto_sync = true
            "#,
        )
        .unwrap();
        assert_eq!(parsed.remote_table("todos"), Some("remote_todos"));
        assert_eq!(parsed.sync.strategy, SyncStrategy::Push);
        assert_eq!(parsed.sync.sync_interval_ms, 30_000);

        let text = toml::to_string_pretty(&parsed).unwrap();
        assert!(text.contains("[tables]"));
        assert!(text.contains("[sync]"));
        assert_eq!(toml::from_str::<SyncConfig>(&text).unwrap(), parsed);
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("tidepool-config-{}", std::process::id()));
        let path = dir.join("sync.toml");

        let config = SyncConfig::new()
            .table("todos", "todos")
            .conflict_resolution("remote-wins");
        config.save(Some(path.clone())).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let loaded: SyncConfig = toml::from_str(&text).unwrap();
        assert_eq!(loaded, config);

        std::fs::remove_dir_all(&dir).ok();
    }
}
