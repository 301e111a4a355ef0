//! Environment passed to plugin backend processes.

use std::collections::BTreeMap;

use plugd_core::config::PluginConfig;

/// Prefix of per-plugin setting variables.
pub const SETTING_PREFIX: &str = "PLUGD_PLUGIN";
/// Variable carrying the host version.
pub const VERSION_VAR: &str = "PLUGD_VERSION";

/// Builds the environment of `plugin_id`'s backend from the process environment.
pub fn plugin_env(plugin_id: &str, config: &PluginConfig) -> Vec<(String, String)> {
    plugin_env_with(plugin_id, config, |key| {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    })
}

/// Builds the environment of `plugin_id`'s backend.
///
/// Each configured setting becomes `PLUGD_PLUGIN_<KEY>`; `lookup` supplies
/// overrides already present in the host environment. The `path` and `id`
/// settings are never exported.
pub fn plugin_env_with<F>(plugin_id: &str, config: &PluginConfig, lookup: F) -> Vec<(String, String)>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = BTreeMap::new();

    if let Some(settings) = config.settings.get(plugin_id) {
        for (key, value) in settings {
            if key == "path" || key.eq_ignore_ascii_case("id") {
                continue;
            }

            let name = format!("{SETTING_PREFIX}_{}", key.to_ascii_uppercase());
            let value = lookup(&name).unwrap_or_else(|| value.clone());
            env.insert(name, value);
        }
    }

    let mut env: Vec<(String, String)> = env.into_iter().collect();
    env.push((VERSION_VAR.to_string(), config.host_version.clone()));
    env
}
