use crate::plugin::metrics::OperationObserver;
use crate::plugin::registry::PluginStore;
use crate::plugin::{Plugin, DEFAULT_CALL_TIMEOUT, DEFAULT_CONNECT_TIMEOUT};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// One `[[plugins]]` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginEntry {
    pub name: String,
    /// Unix socket the plugin listens on
    pub endpoint: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Bound on one logical call, fallback attempts included
    pub call_timeout_secs: u64,
    /// Bound on waiting for a fresh connection to leave idle
    pub connect_timeout_ms: u64,
    pub plugins: Vec<PluginEntry>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: DEFAULT_CALL_TIMEOUT.as_secs(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            plugins: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// $DRACTL_CONFIG_DIR/config.toml or ~/.config/dractl/config.toml
    pub fn config_path() -> PathBuf {
        crate::clienv::config_dir().join("config.toml")
    }

    /// Load from the default location, applying environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        if let Some(timeout) = crate::clienv::call_timeout_override() {
            config.call_timeout_secs = timeout.as_secs();
        }
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading client config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(
            plugins = config.plugins.len(),
            call_timeout_secs = config.call_timeout_secs,
            "Client config loaded"
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.call_timeout_secs == 0 {
            anyhow::bail!("call_timeout_secs must be greater than zero");
        }
        if self.connect_timeout_ms == 0 {
            anyhow::bail!("connect_timeout_ms must be greater than zero");
        }

        let mut seen = std::collections::HashSet::new();
        for entry in &self.plugins {
            if entry.name.is_empty() {
                anyhow::bail!(
                    "plugin entry with endpoint {} has an empty name",
                    entry.endpoint.display()
                );
            }
            if !seen.insert(entry.name.as_str()) {
                anyhow::bail!("plugin {} is listed more than once", entry.name);
            }
        }
        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Build a registry holding one plugin per entry, all reporting to
    /// `observer`.
    pub fn build_registry(&self, observer: Arc<dyn OperationObserver>) -> Result<PluginStore> {
        let store = PluginStore::new();
        for entry in &self.plugins {
            let plugin = Plugin::builder(entry.name.clone(), entry.endpoint.clone())
                .call_timeout(self.call_timeout())
                .connect_timeout(self.connect_timeout())
                .observer(Arc::clone(&observer))
                .build()
                .with_context(|| format!("Invalid plugin entry {}", entry.name))?;
            store.add(plugin);
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::metrics::NoopObserver;
    use crate::plugin::registry::{new_plugin_client, PluginRegistry};

    const SAMPLE: &str = r#"
call_timeout_secs = 10

[[plugins]]
name = "driver-A"
endpoint = "/run/plugins/driver-A.sock"

[[plugins]]
name = "driver-B"
endpoint = "/run/plugins/driver-B.sock"
"#;

    #[test]
    fn test_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.call_timeout(), Duration::from_secs(45));
        assert_eq!(config.connect_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_parse_fills_registry() {
        let config = ClientConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.call_timeout_secs, 10);
        assert_eq!(config.connect_timeout_ms, 1000);

        let store = config.build_registry(Arc::new(NoopObserver)).unwrap();
        assert_eq!(store.names(), vec!["driver-A", "driver-B"]);

        let plugin = new_plugin_client(&store, "driver-A").unwrap();
        assert_eq!(plugin.endpoint(), Path::new("/run/plugins/driver-A.sock"));
        assert_eq!(plugin.call_timeout(), Duration::from_secs(10));
        assert!(store.get("driver-C").is_none());
    }

    #[test]
    fn test_rejects_duplicate_and_empty_names() {
        let duplicate = r#"
[[plugins]]
name = "driver-A"
endpoint = "/a.sock"
[[plugins]]
name = "driver-A"
endpoint = "/b.sock"
"#;
        assert!(ClientConfig::parse(duplicate).is_err());

        let empty = r#"
[[plugins]]
name = ""
endpoint = "/a.sock"
"#;
        assert!(ClientConfig::parse(empty).is_err());
        assert!(ClientConfig::parse("call_timeout_secs = 0").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = ClientConfig::parse(SAMPLE).unwrap();

        config.save_to(&path).unwrap();
        assert_eq!(ClientConfig::load_from(&path).unwrap(), config);
    }
}
