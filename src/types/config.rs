//! Configuration structures.
//!
//! Configuration is loaded from a JSON file; every section falls back to its
//! defaults when omitted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::errors::Result;

/// Global host configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Service supervisor policy.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Worker unit configuration.
    #[serde(default)]
    pub workers: WorkersConfig,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// A directory scanned for service definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicesDir {
    /// Service dir path.
    pub dir: PathBuf,

    /// Whether definitions in this dir are regenerated from sources.
    #[serde(default = "default_true")]
    pub generate: bool,
}

/// Service supervisor policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorConfig {
    /// Start services flagged `autoStart` when the host boots.
    pub auto_start: bool,

    /// Global switch for restarting crashed services.
    pub auto_reload: bool,

    /// Log every recorded service error.
    pub print_errors: bool,

    /// Root-cause codes that suppress auto-reload for the crash they caused.
    pub ignore_auto_reload_errors: Vec<String>,

    /// Directories holding service definitions.
    pub services_dirs: Vec<ServicesDir>,

    /// Delay before a crashed service is restarted.
    #[serde(with = "humantime_serde")]
    pub restart_delay: Duration,

    /// Error counter value after which new errors are no longer stored.
    pub max_recorded_errors: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            auto_start: true,
            auto_reload: true,
            print_errors: true,
            ignore_auto_reload_errors: [
                "CTR_CONF_EXTENDS_PROBLEM",
                "CTR_ERROR_INIT_DEVICE",
                "CTR_DEVICE_PROCESS_EXCEPTION",
                "CTR_DEVICE_PROCESS_PROMISE_EXCEPTION",
                "CTR_ERROR_INIT_CONNECTION",
                "CTR_IGNORE_SERVICE_AUTORELOAD",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            services_dirs: vec![ServicesDir {
                dir: PathBuf::from("./services"),
                generate: true,
            }],
            restart_delay: Duration::from_millis(5000),
            max_recorded_errors: 5,
        }
    }
}

/// Worker unit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkersConfig {
    /// Executable started for process-isolated workers.
    pub program: Option<PathBuf>,

    /// Arguments passed to the worker executable.
    pub args: Vec<String>,

    /// Maximum frame payload size in bytes on a worker pipe.
    pub max_frame_bytes: u32,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            max_frame_bytes: 5 * 1024 * 1024,
        }
    }
}

fn default_true() -> bool {
    true
}
