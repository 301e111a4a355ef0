//! Installer for hosts without access to a remote plugin repository.

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use crate::error::{PluginError, PluginResult};
use crate::traits::{PluginInstaller, UpdateInfo};

/// Installer that can only remove plugins.
///
/// Installs and update lookups fail; latest-version checks report nothing.
#[derive(Debug, Clone, Default)]
pub struct OfflineInstaller;

impl OfflineInstaller {
    /// Creates the installer.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PluginInstaller for OfflineInstaller {
    async fn install(
        &self,
        plugin_id: &str,
        version: &str,
        _plugins_dir: &Path,
        _zip_url: Option<&str>,
        repo_url: &str,
    ) -> PluginResult<()> {
        Err(PluginError::Install {
            reason: format!("cannot download {plugin_id}@{version} from {repo_url}: installer is offline"),
        })
    }

    async fn uninstall(&self, plugin_dir: &Path) -> PluginResult<()> {
        tokio::fs::remove_dir_all(plugin_dir).await?;
        info!(path = %plugin_dir.display(), "Plugin directory removed");
        Ok(())
    }

    async fn get_update_info(
        &self,
        plugin_id: &str,
        version: &str,
        repo_url: &str,
    ) -> PluginResult<UpdateInfo> {
        Err(PluginError::Install {
            reason: format!("cannot resolve {plugin_id}@{version} from {repo_url}: installer is offline"),
        })
    }

    async fn latest_version(
        &self,
        _plugin_id: &str,
        _repo_url: &str,
    ) -> PluginResult<Option<String>> {
        Ok(None)
    }
}
