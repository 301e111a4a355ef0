//! Plugin manifest format (`plugin.json`) and directory scanning.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::descriptor::PluginType;

/// File name of a plugin manifest.
pub const MANIFEST_FILE: &str = "plugin.json";

/// Plugin manifest describing identity and backend of one plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin ID.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Plugin kind.
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    /// Release information.
    #[serde(default)]
    pub info: PluginInfo,
    /// Whether the plugin ships a backend executable.
    #[serde(default)]
    pub backend: bool,
    /// Backend executable, relative to the plugin directory.
    #[serde(default)]
    pub executable: Option<String>,
}

/// Release information of a plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Semver version string.
    #[serde(default)]
    pub version: String,
}

impl PluginManifest {
    /// Resolved path of the backend executable.
    ///
    /// `None` if the manifest names none or the path escapes `plugin_dir`.
    pub fn executable_path(&self, plugin_dir: &Path) -> Option<PathBuf> {
        let executable = self.executable.as_deref()?.trim();
        let relative = Path::new(executable);

        if !is_safe_relative_path(relative) {
            return None;
        }

        Some(plugin_dir.join(relative))
    }
}

fn is_safe_relative_path(path: &Path) -> bool {
    if path.as_os_str().is_empty() || path.is_absolute() {
        return false;
    }
    !path.components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Scans `root` and its immediate subdirectories for manifests.
///
/// Returns `(directory, manifest)` pairs. Unreadable directories and invalid
/// manifests are logged and skipped.
pub fn discover(root: &Path) -> Vec<(PathBuf, PluginManifest)> {
    let mut results = Vec::new();

    if !root.is_dir() {
        tracing::debug!(path = %root.display(), "Plugin directory does not exist, skipping");
        return results;
    }

    if let Some(manifest) = load_manifest(&root.join(MANIFEST_FILE)) {
        results.push((root.to_path_buf(), manifest));
    }

    let Ok(entries) = std::fs::read_dir(root) else {
        tracing::warn!(path = %root.display(), "Failed to read plugin directory");
        return results;
    };

    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    for path in dirs {
        if let Some(manifest) = load_manifest(&path.join(MANIFEST_FILE)) {
            tracing::debug!(
                plugin_id = %manifest.id,
                path = %path.display(),
                "Discovered plugin"
            );
            results.push((path, manifest));
        }
    }

    results
}

/// Reads and parses the manifest at `path`.
pub fn load_manifest(path: &Path) -> Option<PluginManifest> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<PluginManifest>(&content) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to parse plugin manifest"
            );
            None
        }
    }
}
