//! Plugin manager — lifecycle management for all plugins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use plugd_core::config::PluginConfig;

use crate::descriptor::{PluginClass, PluginDescriptor, PluginType, StaticRoute};
use crate::dispatcher::RequestDispatcher;
use crate::error::{PluginError, PluginResult};
use crate::instrumentation::PluginMetrics;
use crate::registry::PluginRegistry;
use crate::supervisor::ProcessSupervisor;
use crate::traits::{
    BackendFactory, PluginInstaller, PluginLoader, PluginSource, RequestValidator,
};

/// Options for [`PluginManager::install`].
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Repository to download from; defaults to the configured repository.
    pub repo_url: Option<String>,
    /// Directory to install into; defaults to the external plugins directory.
    pub install_dir: Option<PathBuf>,
    /// Archive URL overriding the one resolved from the repository.
    pub zip_url: Option<String>,
}

/// Manages the full lifecycle of plugins: load, register, start, stop, install, uninstall.
pub struct PluginManager {
    /// Runtime configuration.
    config: PluginConfig,
    /// Plugin registry.
    registry: Arc<PluginRegistry>,
    /// Backend process supervisor.
    supervisor: Arc<ProcessSupervisor>,
    /// Request dispatcher.
    dispatcher: RequestDispatcher,
    /// Descriptor loader.
    loader: Arc<dyn PluginLoader>,
    /// Archive installer.
    installer: Arc<dyn PluginInstaller>,
    /// Plugin ID → newer version available in the repository.
    updates: RwLock<HashMap<String, String>>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins_path", &self.config.plugins_path)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    /// Creates a new plugin manager.
    pub fn new(
        config: PluginConfig,
        loader: Arc<dyn PluginLoader>,
        installer: Arc<dyn PluginInstaller>,
        validator: Arc<dyn RequestValidator>,
    ) -> PluginResult<Self> {
        let registry = Arc::new(PluginRegistry::new());
        let dispatcher =
            RequestDispatcher::new(Arc::clone(&registry), validator, PluginMetrics::new()?);

        Ok(Self {
            supervisor: Arc::new(ProcessSupervisor::new(config.restart_interval())),
            config,
            registry,
            dispatcher,
            loader,
            installer,
            updates: RwLock::new(HashMap::new()),
        })
    }

    /// Creates the external plugins directory and loads core, bundled and
    /// external plugins, in that order.
    pub async fn init(&self) -> PluginResult<()> {
        let plugins_path = &self.config.plugins_path;
        if !tokio::fs::try_exists(plugins_path).await? {
            tokio::fs::create_dir_all(plugins_path).await.map_err(|e| {
                error!(dir = %plugins_path.display(), error = %e, "Failed to create external plugins directory");
                e
            })?;
            debug!(dir = %plugins_path.display(), "External plugins directory created");
        }

        let core: Vec<PluginSource> = self
            .config
            .core_plugin_dirs()
            .into_iter()
            .map(|dir| PluginSource::new(PluginClass::Core, dir))
            .collect();
        self.load(&core).await?;

        if let Some(bundled) = &self.config.bundled_plugins_path {
            self.load(&[PluginSource::new(PluginClass::Bundled, bundled)])
                .await?;
        }

        self.load(&[PluginSource::new(PluginClass::External, plugins_path)])
            .await?;

        info!(count = self.registry.count().await, "Plugin manager initialized");
        Ok(())
    }

    /// Loads every plugin under `sources` that is not registered yet, then
    /// registers and starts it.
    pub async fn load(&self, sources: &[PluginSource]) -> PluginResult<()> {
        let already_registered = self.registry.registered_ids().await;
        let loaded = self.loader.load_all(sources, &already_registered).await?;

        for plugin in loaded {
            self.register_and_start(Arc::new(plugin)).await?;
        }

        Ok(())
    }

    /// Registers a plugin and starts its backend.
    ///
    /// A plugin that fails to start stays registered.
    pub async fn register_and_start(&self, plugin: Arc<PluginDescriptor>) -> PluginResult<()> {
        self.registry.register(Arc::clone(&plugin)).await?;

        self.supervisor.start(&plugin).await.map_err(|e| {
            error!(plugin_id = %plugin.id, error = %e, "Failed to start plugin");
            e
        })?;

        info!(
            plugin_id = %plugin.id,
            version = %plugin.version,
            plugin_type = %plugin.plugin_type,
            "Plugin registered"
        );
        Ok(())
    }

    /// Installs `plugin_id` at `version`, replacing an installed external version.
    pub async fn install(
        &self,
        plugin_id: &str,
        version: &str,
        options: InstallOptions,
    ) -> PluginResult<()> {
        let repo_url = options
            .repo_url
            .unwrap_or_else(|| self.config.repo_url.clone());
        let mut resolved_zip_url = None;

        if let Some(existing) = self.registry.lookup(plugin_id).await {
            if !existing.is_external() {
                return Err(PluginError::CannotInstallCore {
                    plugin_id: plugin_id.to_string(),
                });
            }

            if existing.version == version {
                return Err(PluginError::DuplicatePlugin {
                    plugin_id: plugin_id.to_string(),
                    existing_dir: existing.plugin_dir.clone(),
                });
            }

            let update = self
                .installer
                .get_update_info(plugin_id, version, &repo_url)
                .await?;
            resolved_zip_url = Some(update.zip_url);

            self.uninstall(plugin_id).await?;
        }

        let install_dir = options
            .install_dir
            .unwrap_or_else(|| self.config.plugins_path.clone());
        let zip_url = options.zip_url.or(resolved_zip_url);

        self.installer
            .install(
                plugin_id,
                version,
                &install_dir,
                zip_url.as_deref(),
                &repo_url,
            )
            .await?;

        info!(plugin_id = %plugin_id, version = %version, "Plugin installed");

        self.load(&[PluginSource::new(PluginClass::External, install_dir)])
            .await
    }

    /// Stops, unregisters and removes an external plugin.
    pub async fn uninstall(&self, plugin_id: &str) -> PluginResult<()> {
        let plugin = self
            .registry
            .lookup(plugin_id)
            .await
            .ok_or_else(|| PluginError::NotInstalled {
                plugin_id: plugin_id.to_string(),
            })?;

        if !plugin.is_external() {
            return Err(PluginError::CannotUninstallCore {
                plugin_id: plugin_id.to_string(),
            });
        }

        ensure_inside(&self.config.plugins_path, &plugin.plugin_dir).await?;

        self.unregister_and_stop(&plugin).await;
        self.updates.write().await.remove(plugin_id);

        self.installer.uninstall(&plugin.plugin_dir).await?;

        info!(plugin_id = %plugin_id, "Plugin uninstalled");
        Ok(())
    }

    async fn unregister_and_stop(&self, plugin: &PluginDescriptor) {
        debug!(plugin_id = %plugin.id, "Stopping plugin process");
        plugin.decommission();

        if let Err(e) = self
            .supervisor
            .stop(plugin, self.config.stop_timeout())
            .await
        {
            warn!(plugin_id = %plugin.id, error = %e, "Failed to stop plugin");
        }

        self.registry.unregister(&plugin.id).await;
    }

    /// Registers a core backend plugin whose client is built in-process by `factory`.
    pub async fn load_and_register(
        &self,
        plugin_id: &str,
        factory: BackendFactory,
    ) -> PluginResult<()> {
        if self.registry.lookup(plugin_id).await.is_some() {
            return Err(PluginError::AlreadyRegistered {
                plugin_id: plugin_id.to_string(),
            });
        }

        let path = self
            .config
            .static_root_path
            .join("app")
            .join("plugins")
            .join(PluginType::Datasource.as_str())
            .join(plugin_id);

        let plugin = self.loader.load_with_factory(&path, factory).await?;
        self.registry.register(Arc::new(plugin)).await
    }

    /// Gets a live plugin by ID.
    pub async fn plugin(&self, plugin_id: &str) -> Option<Arc<PluginDescriptor>> {
        self.registry.lookup(plugin_id).await
    }

    /// Lists plugins of the given types; an empty slice means all types.
    pub async fn plugins(&self, types: &[PluginType]) -> Vec<Arc<PluginDescriptor>> {
        self.registry.list_by_type(types).await
    }

    /// The first registered image renderer, if any.
    pub async fn renderer(&self) -> Option<Arc<PluginDescriptor>> {
        self.registry
            .list_by_type(&[PluginType::Renderer])
            .await
            .into_iter()
            .next()
    }

    /// Static asset route of every registered plugin.
    pub async fn routes(&self) -> Vec<StaticRoute> {
        self.plugins(&[])
            .await
            .iter()
            .map(|p| p.static_route())
            .collect()
    }

    /// Asks the installer for the latest version of every external plugin.
    pub async fn check_for_updates(&self) {
        for plugin in self.plugins(&[]).await {
            if !plugin.is_external() || plugin.is_decommissioned() {
                continue;
            }

            match self
                .installer
                .latest_version(&plugin.id, &self.config.repo_url)
                .await
            {
                Ok(Some(latest)) if latest != plugin.version => {
                    debug!(plugin_id = %plugin.id, current = %plugin.version, latest = %latest, "Plugin update available");
                    self.updates.write().await.insert(plugin.id.clone(), latest);
                }
                Ok(_) => {
                    self.updates.write().await.remove(&plugin.id);
                }
                Err(e) => {
                    warn!(plugin_id = %plugin.id, error = %e, "Failed to check for plugin update");
                }
            }
        }
    }

    /// Newer version recorded by the last update check.
    pub async fn available_update(&self, plugin_id: &str) -> Option<String> {
        self.updates.read().await.get(plugin_id).cloned()
    }

    /// Runs the periodic update check until `cancel` fires, then shuts down.
    pub async fn run(&self, cancel: CancellationToken) {
        if self.config.update_checks_enabled {
            let mut ticker = tokio::time::interval(self.config.update_check_interval());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.check_for_updates().await,
                }
            }
        } else {
            cancel.cancelled().await;
        }

        self.shutdown().await;
    }

    /// Stops watchdogs, then every registered plugin concurrently.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;

        let timeout = self.config.stop_timeout();
        let mut tasks = JoinSet::new();
        for plugin in self.plugins(&[]).await {
            let supervisor = Arc::clone(&self.supervisor);
            tasks.spawn(async move {
                debug!(plugin_id = %plugin.id, "Stopping plugin");
                if let Err(e) = supervisor.stop(&plugin, timeout).await {
                    error!(plugin_id = %plugin.id, error = %e, "Failed to stop plugin");
                }
            });
        }

        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "Plugin stop task failed");
            }
        }

        info!("All plugins stopped");
    }

    /// Returns the request dispatcher.
    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    /// Returns the plugin registry.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Returns the process supervisor.
    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }
}

/// Fails unless `dir` resolves to a location strictly inside `root`.
async fn ensure_inside(root: &Path, dir: &Path) -> PluginResult<()> {
    let unsafe_path = || PluginError::UnsafeUninstallPath {
        path: dir.to_path_buf(),
    };

    let root = tokio::fs::canonicalize(root).await.map_err(|_| unsafe_path())?;
    let resolved = tokio::fs::canonicalize(dir).await.map_err(|_| unsafe_path())?;

    if resolved == root || !resolved.starts_with(&root) {
        return Err(unsafe_path());
    }

    Ok(())
}
