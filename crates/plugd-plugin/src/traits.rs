//! Collaborator traits the lifecycle manager and dispatcher are built on.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::BackendClient;
use crate::descriptor::{PluginClass, PluginDescriptor};
use crate::error::PluginResult;

/// Builds the in-process client of a core backend plugin from its ID.
pub type BackendFactory =
    Arc<dyn Fn(&str) -> PluginResult<Arc<dyn BackendClient>> + Send + Sync>;

/// A directory plugins are loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSource {
    /// Class given to every plugin found under this root.
    pub class: PluginClass,
    /// Root directory.
    pub path: PathBuf,
}

impl PluginSource {
    /// Creates a source.
    pub fn new(class: PluginClass, path: impl Into<PathBuf>) -> Self {
        Self {
            class,
            path: path.into(),
        }
    }
}

/// Turns plugin directories into descriptors.
#[async_trait]
pub trait PluginLoader: Send + Sync {
    /// Loads every plugin under `sources` whose ID is not in `already_registered`.
    async fn load_all(
        &self,
        sources: &[PluginSource],
        already_registered: &HashSet<String>,
    ) -> PluginResult<Vec<PluginDescriptor>>;

    /// Loads the plugin at `path` as a core plugin backed by `factory`.
    async fn load_with_factory(
        &self,
        path: &Path,
        factory: BackendFactory,
    ) -> PluginResult<PluginDescriptor>;
}

/// Where to download an update from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    /// Archive URL of the requested version.
    pub zip_url: String,
}

/// Fetches plugin archives and removes installed plugins.
#[async_trait]
pub trait PluginInstaller: Send + Sync {
    /// Installs `plugin_id` at `version` into `plugins_dir`.
    ///
    /// `zip_url` overrides the archive location resolved from `repo_url`.
    async fn install(
        &self,
        plugin_id: &str,
        version: &str,
        plugins_dir: &Path,
        zip_url: Option<&str>,
        repo_url: &str,
    ) -> PluginResult<()>;

    /// Removes an installed plugin directory.
    async fn uninstall(&self, plugin_dir: &Path) -> PluginResult<()>;

    /// Resolves where `plugin_id` at `version` can be downloaded from.
    async fn get_update_info(
        &self,
        plugin_id: &str,
        version: &str,
        repo_url: &str,
    ) -> PluginResult<UpdateInfo>;

    /// Latest version published for `plugin_id`, if known.
    async fn latest_version(&self, plugin_id: &str, repo_url: &str)
    -> PluginResult<Option<String>>;
}

/// Decides whether the host may call out to a target URL.
pub trait RequestValidator: Send + Sync {
    /// Fails with [`crate::PluginError::AccessDenied`] if the call is not allowed.
    fn validate(&self, target_url: &str, request: Option<&http::request::Parts>)
    -> PluginResult<()>;
}
