//! Manifest-based plugin loader.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use plugd_core::config::PluginConfig;

use crate::descriptor::{PluginClass, PluginDescriptor};
use crate::env::plugin_env;
use crate::error::{PluginError, PluginResult};
use crate::manifest::{self, MANIFEST_FILE, PluginManifest};
use crate::traits::{BackendFactory, PluginLoader, PluginSource};
use crate::transport::ProcessClient;

/// Loads plugins from `plugin.json` manifests.
///
/// Backend plugins get a [`ProcessClient`] running the manifest's executable
/// with the plugin environment built from the configuration.
#[derive(Debug, Clone)]
pub struct ManifestLoader {
    config: PluginConfig,
}

impl ManifestLoader {
    /// Creates a loader.
    pub fn new(config: PluginConfig) -> Self {
        Self { config }
    }

    fn build(
        &self,
        class: PluginClass,
        dir: PathBuf,
        manifest: PluginManifest,
    ) -> Option<PluginDescriptor> {
        let descriptor = PluginDescriptor::new(&manifest.id, manifest.plugin_type, class, &dir)
            .with_name(&manifest.name)
            .with_version(&manifest.info.version);

        if !manifest.backend {
            return Some(descriptor);
        }

        let Some(executable) = manifest.executable_path(&dir) else {
            warn!(
                plugin_id = %manifest.id,
                path = %dir.display(),
                "Backend plugin has no valid executable, skipping"
            );
            return None;
        };

        let client = ProcessClient::new(&manifest.id, executable)
            .with_working_dir(&dir)
            .with_env(plugin_env(&manifest.id, &self.config));

        Some(descriptor.with_backend(Arc::new(client), true))
    }
}

#[async_trait]
impl PluginLoader for ManifestLoader {
    async fn load_all(
        &self,
        sources: &[PluginSource],
        already_registered: &HashSet<String>,
    ) -> PluginResult<Vec<PluginDescriptor>> {
        let roots = sources.to_vec();
        let discovered = tokio::task::spawn_blocking(move || {
            roots
                .into_iter()
                .map(|source| (source.class, manifest::discover(&source.path)))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| PluginError::Load {
            reason: format!("plugin discovery task failed: {e}"),
        })?;

        let mut seen = HashSet::new();
        let mut loaded = Vec::new();

        for (class, found) in discovered {
            for (dir, manifest) in found {
                if already_registered.contains(&manifest.id) {
                    debug!(plugin_id = %manifest.id, "Plugin already registered, skipping");
                    continue;
                }
                if !seen.insert(manifest.id.clone()) {
                    warn!(
                        plugin_id = %manifest.id,
                        path = %dir.display(),
                        "Duplicate plugin ID, skipping"
                    );
                    continue;
                }

                if let Some(descriptor) = self.build(class, dir, manifest) {
                    loaded.push(descriptor);
                }
            }
        }

        info!(count = loaded.len(), "Plugins loaded from manifests");
        Ok(loaded)
    }

    async fn load_with_factory(
        &self,
        path: &Path,
        factory: BackendFactory,
    ) -> PluginResult<PluginDescriptor> {
        let manifest_path = path.join(MANIFEST_FILE);
        let manifest = tokio::task::spawn_blocking(move || manifest::load_manifest(&manifest_path))
            .await
            .map_err(|e| PluginError::Load {
                reason: format!("manifest task failed: {e}"),
            })?
            .ok_or_else(|| PluginError::Load {
                reason: format!("no valid {MANIFEST_FILE} in {}", path.display()),
            })?;

        let client = factory(&manifest.id)?;

        Ok(
            PluginDescriptor::new(&manifest.id, manifest.plugin_type, PluginClass::Core, path)
                .with_name(&manifest.name)
                .with_version(&manifest.info.version)
                .with_backend(client, true),
        )
    }
}
