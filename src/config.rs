use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

/// Default configuration file path when `SNOOZED_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/snooze.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-dimension idleness ceilings. A snapshot is idle only when every
/// dimension is strictly below its ceiling (input idle time is the
/// exception — it must be at or above its floor).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Thresholds {
    /// CPU utilization ceiling, percent across all cores.
    pub cpu_percent: f64,

    /// Physical memory usage ceiling, percent.
    pub memory_percent: f64,

    /// Aggregate network throughput ceiling, KB/s (rx + tx).
    pub network_kbps: f64,

    /// Aggregate disk I/O ceiling, KB/s (read + write).
    pub disk_kbps: f64,

    /// Minimum seconds since last keyboard/pointer activity.
    pub input_idle_secs: u64,

    /// Per-accelerator utilization ceiling, percent.
    pub gpu_percent: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 10.0,
            memory_percent: 30.0,
            network_kbps: 50.0,
            disk_kbps: 100.0,
            input_idle_secs: 900,
            gpu_percent: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SnoozeConfig {
    /// Idleness ceilings per dimension.
    pub thresholds: Thresholds,

    /// Required continuous idle duration before a stop is issued.
    pub naptime_minutes: u64,

    /// Sampling cadence in seconds.
    pub sample_interval_secs: u64,

    /// Sample accelerators (nvidia-smi / amdgpu sysfs) each tick.
    pub gpu_sampling_enabled: bool,

    /// Write instance tags before stopping.
    pub tagging_enabled: bool,

    /// Also tag per-dimension readings, instance type, region, naptime.
    pub detailed_tagging: bool,

    /// Tag key prefix; keys are written as "<prefix>:<SubKey>".
    pub tag_prefix: String,

    /// Publish RestartAllowed / AllowedRestarters tags at stop time.
    pub restart_authorization: bool,

    /// Service identifiers permitted to restart the instance.
    pub allowed_restarters: Vec<String>,

    /// Tracing filter level for the daemon's own spans (e.g. "info").
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Control socket path.
    pub socket_path: PathBuf,

    /// Append-only event log path (one JSON object per line).
    pub event_log_path: PathBuf,

    /// In-memory event ring capacity; older records are dropped.
    pub event_log_capacity: usize,

    /// Exit with code 3 when the permission pre-flight fails at startup.
    /// When false the daemon keeps running, reports `permission-missing`
    /// over the socket, and rechecks hourly without attempting stops.
    pub strict_permissions: bool,

    /// Provider name ("aws") or "auto" to probe registered providers.
    pub provider: String,

    /// Provider-specific settings, opaque to the core.
    pub provider_config: serde_json::Value,
}

impl Default for SnoozeConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            naptime_minutes: 30,
            sample_interval_secs: 60,
            gpu_sampling_enabled: true,
            tagging_enabled: true,
            detailed_tagging: false,
            tag_prefix: "CloudSnooze".to_string(),
            restart_authorization: false,
            allowed_restarters: Vec::new(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            socket_path: PathBuf::from("/var/run/snooze.sock"),
            event_log_path: PathBuf::from("/var/log/snooze/events.jsonl"),
            event_log_capacity: 1000,
            strict_permissions: false,
            provider: "auto".to_string(),
            provider_config: serde_json::Value::Null,
        }
    }
}

impl SnoozeConfig {
    /// Parse and validate a configuration document.
    pub fn from_json(path: &Path, raw: &str) -> Result<Self, ConfigError> {
        let config: SnoozeConfig =
            serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn naptime(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.naptime_minutes as i64)
    }

    pub fn sample_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sample_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.thresholds;

        for (name, value) in [
            ("thresholds.cpu_percent", t.cpu_percent),
            ("thresholds.memory_percent", t.memory_percent),
            ("thresholds.network_kbps", t.network_kbps),
            ("thresholds.disk_kbps", t.disk_kbps),
            ("thresholds.gpu_percent", t.gpu_percent),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }

        for (name, value) in [
            ("thresholds.cpu_percent", t.cpu_percent),
            ("thresholds.memory_percent", t.memory_percent),
            ("thresholds.gpu_percent", t.gpu_percent),
        ] {
            if value > 100.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} is a percentage and must be <= 100, got {value}"
                )));
            }
        }

        if self.naptime_minutes < 1 {
            return Err(ConfigError::Invalid(
                "naptime_minutes must be at least 1".to_string(),
            ));
        }

        if self.sample_interval_secs < 1 {
            return Err(ConfigError::Invalid(
                "sample_interval_secs must be at least 1".to_string(),
            ));
        }

        if self.tagging_enabled && self.tag_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "tag_prefix must be non-empty when tagging is enabled".to_string(),
            ));
        }

        for id in &self.allowed_restarters {
            if id.is_empty()
                || !id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/'))
            {
                return Err(ConfigError::Invalid(format!(
                    "allowed_restarters entry {id:?} is not a plain identifier"
                )));
            }
        }

        if self.event_log_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_log_capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Owns the active configuration and lends read-only snapshots.
///
/// Reloads swap the whole `Arc` after revalidation, so readers holding a
/// snapshot never observe a partially-applied change.
///
/// Cloning is cheap — clones share the same underlying data via Arc.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    active: Arc<RwLock<Arc<SnoozeConfig>>>,
}

impl ConfigStore {
    /// Load and validate the document at `path`. Any failure here is
    /// fatal at startup (exit code 2).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = read_config(&path)?;
        Ok(Self {
            path,
            active: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    /// Get the active configuration snapshot.
    pub async fn current(&self) -> Arc<SnoozeConfig> {
        self.active.read().await.clone()
    }

    /// Re-read the file and atomically swap the active configuration.
    /// On any error the active configuration is left untouched.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        let fresh = read_config(&self.path)?;
        let mut active = self.active.write().await;
        *active = Arc::new(fresh);
        info!(path = %self.path.display(), "Configuration reloaded");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn test_store(config: SnoozeConfig) -> Self {
        Self {
            path: PathBuf::from("/nonexistent/snooze.json"),
            active: Arc::new(RwLock::new(Arc::new(config))),
        }
    }
}

fn read_config(path: &Path) -> Result<SnoozeConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    SnoozeConfig::from_json(path, &raw)
}
