//! Server configuration (TOML).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Which metadata backend the server opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Delta,
    Directory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub listen: String,
    /// Metadata store root (directory for delta/directory backends, parent
    /// of the database file for sqlite).
    pub store_root: String,
    pub backend: BackendKind,
    /// Path of the deployment/computer-sync database.
    pub deploy_db: String,
    /// Optional local content root; file URLs are rewritten onto it.
    pub content_root: Option<String>,
    pub max_updates_in_response: usize,
    /// Compatibility switch for the default action handed to bundles with
    /// no deployment row.
    pub legacy_bundle_action: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8530".to_string(),
            store_root: "./data/store".to_string(),
            backend: BackendKind::Delta,
            deploy_db: "./data/deploySync.db".to_string(),
            content_root: None,
            max_updates_in_response: wsusd_core::MAX_UPDATES_IN_RESPONSE,
            legacy_bundle_action: true,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        toml::from_str(&data).with_context(|| "Failed to parse config TOML")
    }

    pub fn to_file(&self, path: &Path) -> Result<()> {
        let data = toml::to_string_pretty(self)?;
        fs::write(path, data).with_context(|| format!("Failed to write config to {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wsusd.toml");
        let config = ServerConfig {
            backend: BackendKind::Sqlite,
            content_root: Some("http://wsus.local/content".into()),
            ..Default::default()
        };
        config.to_file(&path).unwrap();

        let loaded = ServerConfig::from_file(&path).unwrap();
        assert_eq!(loaded.backend, BackendKind::Sqlite);
        assert_eq!(loaded.content_root.as_deref(), Some("http://wsus.local/content"));
        assert_eq!(loaded.max_updates_in_response, 50);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ServerConfig = toml::from_str("listen = \"127.0.0.1:9000\"").unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.backend, BackendKind::Delta);
        assert!(config.legacy_bundle_action);
    }
}
