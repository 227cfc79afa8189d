//! Configuration resolution for workpool.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/workpool/settings.json)
//! 3. Project config (.workpool/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::map::Entry;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default pattern for benign progress chatter on a worker's stderr.
pub const DEFAULT_STDERR_SUPPRESS_PATTERN: &str = r"(?i)downloading: ([0-9]+)%";

/// Complete workpool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub pools: PoolDefaults,
}

/// Host process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub log_level: String,
    pub log_json: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Defaults applied to every pool the process manager creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolDefaults {
    /// Workers launched when a caller does not pass a count.
    pub default_workers: usize,
    /// Seconds a disconnected worker gets to exit before it is killed.
    pub terminate_timeout_secs: u64,
    /// Stream-worker stderr lines matching this regex are not logged.
    pub stderr_suppress_pattern: String,
    /// Executable re-launched for forked workers (defaults to the current binary).
    pub worker_program: Option<PathBuf>,
}

impl Default for PoolDefaults {
    fn default() -> Self {
        Self {
            default_workers: 1,
            terminate_timeout_secs: 5,
            stderr_suppress_pattern: DEFAULT_STDERR_SUPPRESS_PATTERN.to_string(),
            worker_program: None,
        }
    }
}

impl Config {
    /// Reject values the pools cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pools.default_workers == 0 {
            return Err(Error::Config(
                "pools.default_workers must be at least 1".to_string(),
            ));
        }
        regex::Regex::new(&self.pools.stderr_suppress_pattern).map_err(|e| {
            Error::Config(format!(
                "Invalid pools.stderr_suppress_pattern {:?}: {e}",
                self.pools.stderr_suppress_pattern
            ))
        })?;
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
///
/// Each file layer only overrides the keys it actually contains.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            tracing::debug!(path = %global_path.display(), "Loading global config");
            merge_values(&mut merged, load_config_file(&global_path)?);
        }
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".workpool").join("settings.json");
        if project_path.exists() {
            tracing::debug!(path = %project_path.display(), "Loading project config");
            merge_values(&mut merged, load_config_file(&project_path)?);
        }
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    apply_env_overrides(&mut config);

    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("workpool").join("settings.json"))
}

/// Read one settings file as a raw JSON object.
fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    if !value.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must contain a JSON object",
            path.display()
        )));
    }
    Ok(value)
}

/// Recursively overlay `overlay` onto `base`. Objects merge key by key;
/// any other value replaces what was there.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.entry(key) {
                    Entry::Occupied(mut slot) => merge_values(slot.get_mut(), value),
                    Entry::Vacant(slot) => {
                        slot.insert(value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("WORKPOOL_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Ok(val) = std::env::var("WORKPOOL_LOG_JSON") {
        config.daemon.log_json = matches!(val.as_str(), "1" | "true" | "yes");
    }
    if let Ok(val) = std::env::var("WORKPOOL_DEFAULT_WORKERS") {
        if let Ok(n) = val.parse() {
            config.pools.default_workers = n;
        }
    }
    if let Ok(val) = std::env::var("WORKPOOL_TERMINATE_TIMEOUT") {
        if let Ok(n) = val.parse() {
            config.pools.terminate_timeout_secs = n;
        }
    }
}
