//! Plugin runtime configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Plugin runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Root directory for externally installed plugins.
    #[serde(default = "default_plugins_path")]
    pub plugins_path: PathBuf,
    /// Directory holding plugins bundled with the host.
    #[serde(default)]
    pub bundled_plugins_path: Option<PathBuf>,
    /// Root of the host's static assets; core plugins live below it.
    #[serde(default = "default_static_root_path")]
    pub static_root_path: PathBuf,
    /// Remote plugin repository used for installs and update checks.
    #[serde(default = "default_repo_url")]
    pub repo_url: String,
    /// Poll interval of the crash-restart watchdog, in milliseconds.
    #[serde(default = "default_restart_interval")]
    pub restart_interval_ms: u64,
    /// Interval between update checks, in seconds.
    #[serde(default = "default_update_check_interval")]
    pub update_check_interval_seconds: u64,
    /// Whether the periodic update check runs at all.
    #[serde(default = "default_true")]
    pub update_checks_enabled: bool,
    /// Upper bound for a graceful plugin stop, in seconds.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: u64,
    /// Host version advertised to backend processes.
    #[serde(default = "default_host_version")]
    pub host_version: String,
    /// Hosts that datasource URLs may point at. Empty allows every host.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// Per-plugin settings exported to backend processes as environment variables.
    #[serde(default)]
    pub settings: HashMap<String, HashMap<String, String>>,
}

impl PluginConfig {
    /// Rejects values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.restart_interval_ms == 0 {
            return Err(AppError::configuration(
                "plugins.restart_interval_ms must be greater than zero",
            ));
        }
        if self.update_check_interval_seconds == 0 {
            return Err(AppError::configuration(
                "plugins.update_check_interval_seconds must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Restart watchdog poll interval, at least one millisecond.
    pub fn restart_interval(&self) -> Duration {
        Duration::from_millis(self.restart_interval_ms.max(1))
    }

    /// Update check interval, at least one second.
    pub fn update_check_interval(&self) -> Duration {
        Duration::from_secs(self.update_check_interval_seconds.max(1))
    }

    /// Graceful stop timeout.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }

    /// Directories holding the core plugins shipped with the host.
    pub fn core_plugin_dirs(&self) -> Vec<PathBuf> {
        let plugins = self.static_root_path.join("app").join("plugins");
        vec![plugins.join("datasource"), plugins.join("panel")]
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            plugins_path: default_plugins_path(),
            bundled_plugins_path: None,
            static_root_path: default_static_root_path(),
            repo_url: default_repo_url(),
            restart_interval_ms: default_restart_interval(),
            update_check_interval_seconds: default_update_check_interval(),
            update_checks_enabled: true,
            stop_timeout_seconds: default_stop_timeout(),
            host_version: default_host_version(),
            allowed_hosts: Vec::new(),
            settings: HashMap::new(),
        }
    }
}

fn default_plugins_path() -> PathBuf {
    PathBuf::from("./data/plugins")
}

fn default_static_root_path() -> PathBuf {
    PathBuf::from("./public")
}

fn default_repo_url() -> String {
    "https://plugins.plugd.dev/api/plugins".to_string()
}

fn default_restart_interval() -> u64 {
    1000
}

fn default_update_check_interval() -> u64 {
    600
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_host_version() -> String {
    "0.0.0".to_string()
}

fn default_true() -> bool {
    true
}
