//! Plugin descriptor — identity, capabilities and live client of one plugin.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::client::BackendClient;

/// Kind of plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    /// Talks to an external data system.
    Datasource,
    /// Renders a visualization.
    Panel,
    /// Bundles pages, panels and datasources.
    App,
    /// Renders images of dashboards.
    Renderer,
    /// Part of the host itself.
    Core,
}

impl PluginType {
    /// Every plugin type.
    pub const ALL: [PluginType; 5] = [
        PluginType::Datasource,
        PluginType::Panel,
        PluginType::App,
        PluginType::Renderer,
        PluginType::Core,
    ];

    /// Lowercase name as used in manifests and URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Datasource => "datasource",
            Self::Panel => "panel",
            Self::App => "app",
            Self::Renderer => "renderer",
            Self::Core => "core",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a plugin comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginClass {
    /// Shipped inside the host's static assets.
    Core,
    /// Shipped next to the host in the bundled plugins directory.
    Bundled,
    /// Installed by an operator into the external plugins directory.
    External,
}

/// Static asset route served by the host for one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoute {
    /// Plugin the assets belong to.
    pub plugin_id: String,
    /// Directory the assets are served from.
    pub directory: PathBuf,
}

/// In-memory record of one loaded plugin.
///
/// Descriptors are shared as `Arc<PluginDescriptor>` and never mutated after
/// loading, apart from the one-way decommission flag.
pub struct PluginDescriptor {
    /// Unique plugin ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Installed version.
    pub version: String,
    /// Plugin kind.
    pub plugin_type: PluginType,
    /// Where the plugin was loaded from.
    pub class: PluginClass,
    /// Directory containing the plugin.
    pub plugin_dir: PathBuf,
    /// Whether the plugin has a backend.
    pub backend: bool,
    /// Whether this runtime owns the backend process lifecycle.
    pub managed: bool,
    /// URL prefix of the plugin's public assets.
    pub base_url: String,
    /// Frontend module path.
    pub module: String,
    client: Option<Arc<dyn BackendClient>>,
    decommissioned: AtomicBool,
}

impl PluginDescriptor {
    /// Creates a descriptor without a backend.
    pub fn new(
        id: impl Into<String>,
        plugin_type: PluginType,
        class: PluginClass,
        plugin_dir: impl Into<PathBuf>,
    ) -> Self {
        let id = id.into();
        let plugin_dir = plugin_dir.into();
        let (module, base_url) = module_paths(&id, plugin_type, class, &plugin_dir);

        Self {
            name: id.clone(),
            id,
            version: String::new(),
            plugin_type,
            class,
            plugin_dir,
            backend: false,
            managed: false,
            base_url,
            module,
            client: None,
            decommissioned: AtomicBool::new(false),
        }
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Attaches a backend client.
    ///
    /// `managed` marks the backend process as owned by the process supervisor.
    pub fn with_backend(mut self, client: Arc<dyn BackendClient>, managed: bool) -> Self {
        self.backend = true;
        self.managed = managed;
        self.client = Some(client);
        self
    }

    /// Client used to issue RPCs, if the plugin has a backend.
    pub fn client(&self) -> Option<&Arc<dyn BackendClient>> {
        self.client.as_ref()
    }

    /// Whether the plugin was installed into the external plugins directory.
    pub fn is_external(&self) -> bool {
        self.class == PluginClass::External
    }

    /// Whether this plugin renders images.
    pub fn is_renderer(&self) -> bool {
        self.plugin_type == PluginType::Renderer
    }

    /// Marks the plugin as permanently inactive.
    ///
    /// Returns `false` if it was already decommissioned.
    pub fn decommission(&self) -> bool {
        !self.decommissioned.swap(true, Ordering::AcqRel)
    }

    /// Whether the plugin has been decommissioned.
    pub fn is_decommissioned(&self) -> bool {
        self.decommissioned.load(Ordering::Acquire)
    }

    /// Whether the backend process has exited.
    pub fn exited(&self) -> bool {
        self.client.as_ref().is_some_and(|c| c.exited())
    }

    /// Route under which the host serves this plugin's static assets.
    pub fn static_route(&self) -> StaticRoute {
        StaticRoute {
            plugin_id: self.id.clone(),
            directory: self.plugin_dir.clone(),
        }
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("plugin_type", &self.plugin_type)
            .field("class", &self.class)
            .field("plugin_dir", &self.plugin_dir)
            .field("backend", &self.backend)
            .field("managed", &self.managed)
            .field("decommissioned", &self.is_decommissioned())
            .finish()
    }
}

/// Module and base URL of a plugin's frontend assets.
fn module_paths(
    id: &str,
    plugin_type: PluginType,
    class: PluginClass,
    plugin_dir: &Path,
) -> (String, String) {
    if class == PluginClass::External {
        return (
            format!("plugins/{id}/module"),
            format!("public/plugins/{id}"),
        );
    }

    // Built-in plugins are addressed by their directory name, not their ID.
    let dir_name = plugin_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| id.to_string());

    (
        format!("app/plugins/{plugin_type}/{dir_name}/module"),
        format!("public/app/plugins/{plugin_type}/{dir_name}"),
    )
}
