//! Plugin registry — the single table of loaded plugin descriptors.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::descriptor::{PluginDescriptor, PluginType};
use crate::error::{PluginError, PluginResult};

/// Registry of all loaded plugins, keyed by plugin ID.
///
/// The lock is held only for the map operation itself; no method calls back
/// into the registry or awaits anything else while holding it.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    table: RwLock<Table>,
}

#[derive(Debug, Default)]
struct Table {
    /// Plugin ID → registration sequence and descriptor.
    plugins: HashMap<String, (u64, Arc<PluginDescriptor>)>,
    next_seq: u64,
}

impl PluginRegistry {
    /// Creates a new empty plugin registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin.
    ///
    /// Fails if the ID is present, including decommissioned entries that have
    /// not been unregistered yet.
    pub async fn register(&self, plugin: Arc<PluginDescriptor>) -> PluginResult<()> {
        let mut table = self.table.write().await;

        if table.plugins.contains_key(&plugin.id) {
            return Err(PluginError::AlreadyRegistered {
                plugin_id: plugin.id.clone(),
            });
        }

        debug!(plugin_id = %plugin.id, "Plugin registered");
        let seq = table.next_seq;
        table.next_seq += 1;
        table.plugins.insert(plugin.id.clone(), (seq, plugin));

        Ok(())
    }

    /// Gets a live plugin by ID.
    ///
    /// Decommissioned plugins are invisible here even before they are removed.
    pub async fn lookup(&self, plugin_id: &str) -> Option<Arc<PluginDescriptor>> {
        let plugin = self
            .table
            .read()
            .await
            .plugins
            .get(plugin_id)
            .map(|(_, plugin)| Arc::clone(plugin))?;

        if plugin.is_decommissioned() {
            return None;
        }

        Some(plugin)
    }

    /// Lists registered plugins of the given types in registration order;
    /// an empty slice means all types.
    pub async fn list_by_type(&self, types: &[PluginType]) -> Vec<Arc<PluginDescriptor>> {
        let requested: HashSet<PluginType> = if types.is_empty() {
            PluginType::ALL.into_iter().collect()
        } else {
            types.iter().copied().collect()
        };

        let table = self.table.read().await;
        let mut matching: Vec<_> = table
            .plugins
            .values()
            .filter(|(_, p)| requested.contains(&p.plugin_type))
            .collect();
        matching.sort_by_key(|(seq, _)| *seq);

        matching.into_iter().map(|(_, p)| Arc::clone(p)).collect()
    }

    /// IDs of every registered plugin that is not decommissioned.
    pub async fn registered_ids(&self) -> HashSet<String> {
        let table = self.table.read().await;
        table
            .plugins
            .values()
            .filter(|(_, p)| !p.is_decommissioned())
            .map(|(_, p)| p.id.clone())
            .collect()
    }

    /// Removes a plugin entirely.
    pub async fn unregister(&self, plugin_id: &str) -> Option<Arc<PluginDescriptor>> {
        let removed = self
            .table
            .write()
            .await
            .plugins
            .remove(plugin_id)
            .map(|(_, plugin)| plugin);

        if removed.is_some() {
            debug!(plugin_id = %plugin_id, "Plugin unregistered");
        }

        removed
    }

    /// Returns plugin count, decommissioned entries included.
    pub async fn count(&self) -> usize {
        self.table.read().await.plugins.len()
    }
}
