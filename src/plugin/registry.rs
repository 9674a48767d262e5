use super::Plugin;
use crate::error::{PluginError, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Name -> live plugin handle lookup.
///
/// Lookups are synchronous and never touch the network.
pub trait PluginRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<Arc<Plugin>>;
}

/// Resolve `name` to its shared client handle.
pub fn new_plugin_client(registry: &dyn PluginRegistry, name: &str) -> Result<Arc<Plugin>> {
    if name.is_empty() {
        return Err(PluginError::EmptyName);
    }

    registry.get(name).ok_or_else(|| {
        debug!(plugin = %name, "Plugin not registered");
        PluginError::NotFound {
            name: name.to_string(),
        }
    })
}

const REMOVED_CAUSE: &str = "plugin removed from registry";
const REPLACED_CAUSE: &str = "plugin replaced in registry";

/// In-memory registry
#[derive(Default)]
pub struct PluginStore {
    plugins: RwLock<BTreeMap<String, Arc<Plugin>>>,
}

impl PluginStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `plugin` under its name. A previous plugin with the same
    /// name is decommissioned.
    pub fn add(&self, plugin: Plugin) -> Arc<Plugin> {
        let plugin = Arc::new(plugin);
        let previous = self
            .plugins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin.name().to_string(), Arc::clone(&plugin));

        info!(
            plugin = %plugin.name(),
            endpoint = %plugin.endpoint().display(),
            "Registered plugin"
        );
        if let Some(previous) = previous {
            previous.decommission(REPLACED_CAUSE);
        }
        plugin
    }

    /// Remove and decommission a plugin. In-flight calls on it are cancelled.
    pub fn remove(&self, name: &str) -> Option<Arc<Plugin>> {
        let removed = self
            .plugins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);

        if let Some(plugin) = &removed {
            plugin.decommission(REMOVED_CAUSE);
        }
        removed
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PluginRegistry for PluginStore {
    fn get(&self, name: &str) -> Option<Arc<Plugin>> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}
