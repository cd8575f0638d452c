//! Application configuration
//!
//! Per-provider credential and endpoint settings, loaded from a JSON file.
//! Every section is optional: a missing section only makes that provider's
//! `init()` fail with a configuration error, leaving the others untouched.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::providers::types::StorageError;

/// Google Drive API configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoogleConfig {
    /// OAuth client id from the Google Cloud Console
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Requested OAuth scopes; sensible Drive defaults when empty
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// OneDrive (Microsoft Graph) configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OneDriveConfig {
    /// Application (client) id from the Azure portal
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

/// Azure Blob Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AzureConfig {
    /// Storage account connection string
    /// (`DefaultEndpointsProtocol=…;AccountName=…;AccountKey=…`)
    pub connection_string: String,
    /// Container holding the aggregated files
    pub container_name: String,
}

/// Dropbox configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DropboxConfig {
    /// App key from the Dropbox developer console
    pub app_key: String,
    #[serde(default)]
    pub app_secret: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub google: Option<GoogleConfig>,
    #[serde(default)]
    pub onedrive: Option<OneDriveConfig>,
    #[serde(default)]
    pub azure: Option<AzureConfig>,
    #[serde(default)]
    pub dropbox: Option<DropboxConfig>,
}

/// Default config file location
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("unicloud")
        .join("config.json")
}

/// Load configuration from the default location. A missing or unreadable
/// file yields the empty default; every provider will then report its own
/// configuration error at `init()`.
pub fn load_config() -> AppConfig {
    load_config_from(&config_path())
}

/// Load configuration from an explicit path.
pub fn load_config_from(path: &Path) -> AppConfig {
    if path.exists() {
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to parse config {}: {}", path.display(), e);
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config {}: {}", path.display(), e);
            }
        }
    }

    AppConfig::default()
}

/// Save configuration to an explicit path.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| StorageError::ParseError(format!("serialize config: {}", e)))?;
    fs::write(path, content)?;

    tracing::info!("Config saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_empty_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("nope.json"));
        assert!(config.google.is_none());
        assert!(config.azure.is_none());
    }

    #[test]
    fn partial_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = AppConfig {
            google: Some(GoogleConfig {
                client_id: "cid.apps.googleusercontent.com".to_string(),
                client_secret: None,
                scopes: vec![],
            }),
            azure: Some(AzureConfig {
                connection_string: "AccountName=a;AccountKey=az==".to_string(),
                container_name: "cloud-unified-storage".to_string(),
            }),
            ..Default::default()
        };
        save_config_to(&config, &path).unwrap();

        let loaded = load_config_from(&path);
        assert_eq!(
            loaded.google.unwrap().client_id,
            "cid.apps.googleusercontent.com"
        );
        assert_eq!(loaded.azure.unwrap().container_name, "cloud-unified-storage");
        assert!(loaded.onedrive.is_none());
        assert!(loaded.dropbox.is_none());
    }

    #[test]
    fn unknown_sections_do_not_break_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"dropbox": {"app_key": "k"}, "theme": "dark"}"#).unwrap();

        let loaded = load_config_from(&path);
        assert_eq!(loaded.dropbox.unwrap().app_key, "k");
    }
}
