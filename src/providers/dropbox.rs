//! Dropbox storage adapter
//!
//! Implements `StorageAdapter` for Dropbox using the HTTP API v2. Single
//! `files/upload` calls only, which caps uploads at 150 MiB; larger files
//! would need an upload session and are rejected up front.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::DropboxConfig;
use crate::credentials::CredentialStore;

use super::oauth::{OAuthConfig, TokenManager};
use super::types::{
    timestamp_or_epoch, trim_api_error, CloudFile, ConnectOutcome, DownloadOutcome, ProgressFn,
    ProviderId, Quota, StorageError, UploadOutcome, UploadPayload,
};
use super::StorageAdapter;

/// Dropbox API endpoints
const API_BASE: &str = "https://api.dropboxapi.com/2";
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2";

/// Single-call `files/upload` ceiling; larger files need an upload session.
const SINGLE_UPLOAD_LIMIT: u64 = 150 * 1024 * 1024;

/// Dropbox file metadata (subset)
#[derive(Debug, Deserialize)]
struct DropboxMetadata {
    #[serde(rename = ".tag", default)]
    tag: String,
    id: Option<String>,
    name: String,
    #[serde(default)]
    size: u64,
    client_modified: Option<String>,
    server_modified: Option<String>,
    path_display: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListFolderResult {
    #[serde(default)]
    entries: Vec<DropboxMetadata>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    matches: Vec<SearchMatch>,
}

#[derive(Debug, Deserialize)]
struct SearchMatch {
    metadata: SearchMetadataWrapper,
}

#[derive(Debug, Deserialize)]
struct SearchMetadataWrapper {
    metadata: DropboxMetadata,
}

#[derive(Debug, Deserialize)]
struct SpaceUsage {
    #[serde(default)]
    used: u64,
    allocation: Option<SpaceAllocation>,
}

#[derive(Debug, Deserialize)]
struct SpaceAllocation {
    #[serde(default)]
    allocated: u64,
}

/// Reject uploads beyond the single-call ceiling before any network call.
fn check_size_ceiling(size: u64) -> Result<(), StorageError> {
    if size > SINGLE_UPLOAD_LIMIT {
        return Err(StorageError::UnsupportedFileSize {
            provider: ProviderId::Dropbox.label().to_string(),
            size,
            limit: SINGLE_UPLOAD_LIMIT,
        });
    }
    Ok(())
}

/// Dropbox storage adapter
pub struct DropboxAdapter {
    config: Option<DropboxConfig>,
    tokens: TokenManager,
    client: reqwest::Client,
    initialized: bool,
    connected: bool,
    quota: Quota,
}

impl DropboxAdapter {
    pub fn new(config: Option<DropboxConfig>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            config,
            tokens: TokenManager::new(store),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            initialized: false,
            connected: false,
            quota: Quota::zero(),
        }
    }

    fn require_config(&self) -> Result<&DropboxConfig, StorageError> {
        self.config.as_ref().ok_or_else(|| {
            StorageError::ConfigurationMissing(
                "dropbox: section missing from configuration".to_string(),
            )
        })
    }

    fn oauth_config(&self) -> Result<OAuthConfig, StorageError> {
        let cfg = self.require_config()?;
        Ok(OAuthConfig::dropbox(
            &cfg.app_key,
            cfg.app_secret.as_deref(),
            cfg.redirect_uri.as_deref(),
        ))
    }

    async fn auth_header(&self) -> Result<HeaderValue, StorageError> {
        let token = self.tokens.get_valid_token(&self.oauth_config()?).await?;
        HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
            .map_err(|e| StorageError::AuthenticationFailed(format!("invalid token: {}", e)))
    }

    fn to_cloud_file(&self, meta: &DropboxMetadata) -> CloudFile {
        let modified = meta
            .client_modified
            .as_deref()
            .or(meta.server_modified.as_deref());
        CloudFile {
            id: meta
                .id
                .clone()
                .unwrap_or_else(|| meta.path_display.clone().unwrap_or_default()),
            name: meta.name.clone(),
            size: meta.size,
            modified: timestamp_or_epoch(modified),
            provider: ProviderId::Dropbox,
            provider_name: ProviderId::Dropbox.label().to_string(),
            // Dropbox does not report MIME types; guess from the name
            mime_type: mime_guess::from_path(&meta.name).first().map(|m| m.to_string()),
            // Dropbox exposes a display path rather than a web link
            web_link: meta.path_display.clone(),
        }
    }

    /// POST a JSON body to an RPC endpoint and decode the response.
    async fn rpc<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<T, StorageError> {
        let url = format!("{}/{}", API_BASE, endpoint);

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, self.auth_header().await?)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| StorageError::RemoteCallFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::RemoteCallFailed(format!(
                "Dropbox API error {}: {}",
                status,
                trim_api_error(&body)
            )));
        }

        response
            .json()
            .await
            .map_err(|e| StorageError::ParseError(e.to_string()))
    }

    async fn fetch_quota(&self) -> Result<Quota, StorageError> {
        let usage: SpaceUsage = self
            .rpc("users/get_space_usage", serde_json::json!({}))
            .await?;
        let total = usage.allocation.map(|a| a.allocated).unwrap_or(0);
        Ok(Quota::reconciled(total, usage.used))
    }

    /// Normalize a file id to the `id:` form get_metadata expects.
    fn id_arg(file_id: &str) -> String {
        if file_id.starts_with("id:") || file_id.starts_with('/') {
            file_id.to_string()
        } else {
            format!("id:{}", file_id)
        }
    }
}

#[async_trait]
impl StorageAdapter for DropboxAdapter {
    fn provider_id(&self) -> ProviderId {
        ProviderId::Dropbox
    }

    fn display_name(&self) -> String {
        ProviderId::Dropbox.label().to_string()
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn init(&mut self) -> Result<(), StorageError> {
        if self.initialized {
            return Ok(());
        }

        let cfg = self.require_config()?;
        if cfg.app_key.trim().is_empty() {
            return Err(StorageError::ConfigurationMissing(
                "dropbox.app_key is empty".to_string(),
            ));
        }

        if self.tokens.has_tokens(ProviderId::Dropbox) {
            debug!("Dropbox: stored credential found");
        }

        self.initialized = true;
        Ok(())
    }

    async fn connect(&mut self) -> Result<ConnectOutcome, StorageError> {
        if self.connected {
            return Ok(ConnectOutcome {
                provider: ProviderId::Dropbox,
                message: "Dropbox already connected".to_string(),
            });
        }

        let _ = self.tokens.get_valid_token(&self.oauth_config()?).await?;
        let quota = self.fetch_quota().await?;

        self.quota = quota;
        self.connected = true;

        info!("Connected to Dropbox");
        Ok(ConnectOutcome {
            provider: ProviderId::Dropbox,
            message: "Dropbox connected".to_string(),
        })
    }

    async fn disconnect(&mut self) -> Result<(), StorageError> {
        // Best-effort remote revocation; local state is cleared regardless.
        if let Some(tokens) = self.tokens.load_tokens(ProviderId::Dropbox) {
            let result = self
                .client
                .post(format!("{}/auth/token/revoke", API_BASE))
                .header(
                    AUTHORIZATION,
                    format!("Bearer {}", tokens.access_token),
                )
                .send()
                .await;
            if let Err(e) = result {
                warn!("Dropbox token revoke failed: {}", e);
            }
        }

        self.connected = false;
        self.quota = Quota::zero();
        if let Err(e) = self.tokens.delete_tokens(ProviderId::Dropbox) {
            warn!("Dropbox: could not clear stored tokens: {}", e);
        }

        info!("Disconnected from Dropbox");
        Ok(())
    }

    async fn list_files(&mut self, max_results: usize) -> Result<Vec<CloudFile>, StorageError> {
        if !self.connected {
            return Ok(Vec::new());
        }

        let result: ListFolderResult = self
            .rpc(
                "files/list_folder",
                serde_json::json!({
                    "path": "",
                    "recursive": false,
                    "include_deleted": false,
                    "limit": max_results,
                }),
            )
            .await?;

        Ok(result
            .entries
            .iter()
            .filter(|e| e.tag == "file")
            .map(|e| self.to_cloud_file(e))
            .collect())
    }

    async fn search_files(&mut self, query: &str) -> Result<Vec<CloudFile>, StorageError> {
        if !self.connected || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let result: SearchResult = self
            .rpc(
                "files/search_v2",
                serde_json::json!({
                    "query": query,
                    "options": {
                        "path": "",
                        "max_results": 50,
                        "file_status": "active",
                        "filename_only": true,
                    },
                }),
            )
            .await?;

        Ok(result
            .matches
            .iter()
            .filter(|m| m.metadata.metadata.tag == "file")
            .map(|m| self.to_cloud_file(&m.metadata.metadata))
            .collect())
    }

    async fn upload_file(
        &mut self,
        payload: &UploadPayload,
        on_progress: Option<&ProgressFn>,
    ) -> Result<UploadOutcome, StorageError> {
        if !self.connected {
            return Err(StorageError::ProviderNotConnected(self.display_name()));
        }

        check_size_ceiling(payload.size)?;

        if let Some(cb) = on_progress {
            cb(0.0);
        }

        let api_arg = serde_json::json!({
            "path": format!("/{}", payload.name),
            "mode": "add",
            "autorename": true,
            "mute": false,
        });

        let response = self
            .client
            .post(format!("{}/files/upload", CONTENT_BASE))
            .header(AUTHORIZATION, self.auth_header().await?)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(
                "Dropbox-API-Arg",
                HeaderValue::from_str(&api_arg.to_string()).map_err(|e| {
                    StorageError::ParseError(format!("file name not header-safe: {}", e))
                })?,
            )
            .body(payload.bytes.clone())
            .send()
            .await
            .map_err(|e| StorageError::RemoteCallFailed(e.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::RemoteCallFailed(format!(
                "upload failed: {}",
                trim_api_error(&body)
            )));
        }

        #[derive(Deserialize)]
        struct Uploaded {
            id: String,
        }
        let uploaded: Uploaded = response
            .json()
            .await
            .map_err(|e| StorageError::ParseError(e.to_string()))?;

        if let Err(e) = self.update_quota().await {
            warn!("Dropbox quota refresh after upload failed: {}", e);
        }

        if let Some(cb) = on_progress {
            cb(100.0);
        }

        info!("Uploaded {} to Dropbox", payload.name);
        Ok(UploadOutcome {
            provider: ProviderId::Dropbox,
            file_id: uploaded.id,
            message: format!("{} uploaded to Dropbox", payload.name),
        })
    }

    async fn download_file(
        &mut self,
        file_id: &str,
        dest: &Path,
    ) -> Result<DownloadOutcome, StorageError> {
        if !self.connected {
            return Err(StorageError::ProviderNotConnected(self.display_name()));
        }

        // Dropbox downloads address files by path; resolve the id first.
        let meta: DropboxMetadata = self
            .rpc(
                "files/get_metadata",
                serde_json::json!({ "path": Self::id_arg(file_id) }),
            )
            .await?;
        let path = meta.path_display.ok_or_else(|| {
            StorageError::RemoteCallFailed(format!("no path for file id {}", file_id))
        })?;

        let api_arg = serde_json::json!({ "path": path });
        let response = self
            .client
            .post(format!("{}/files/download", CONTENT_BASE))
            .header(AUTHORIZATION, self.auth_header().await?)
            .header(
                "Dropbox-API-Arg",
                HeaderValue::from_str(&api_arg.to_string()).map_err(|e| {
                    StorageError::ParseError(format!("file path not header-safe: {}", e))
                })?,
            )
            .send()
            .await
            .map_err(|e| StorageError::RemoteCallFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StorageError::RemoteCallFailed(format!(
                "download failed: {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| StorageError::RemoteCallFailed(e.to_string()))?;
        tokio::fs::write(dest, &bytes).await?;

        info!("Downloaded {} from Dropbox to {}", file_id, dest.display());
        Ok(DownloadOutcome {
            provider: ProviderId::Dropbox,
            path: dest.to_path_buf(),
            message: format!("saved to {}", dest.display()),
        })
    }

    fn get_quota(&self) -> Quota {
        self.quota
    }

    async fn update_quota(&mut self) -> Result<(), StorageError> {
        if !self.connected {
            return Ok(());
        }
        self.quota = self.fetch_quota().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;

    #[test]
    fn size_ceiling_is_enforced_without_network() {
        assert!(check_size_ceiling(SINGLE_UPLOAD_LIMIT).is_ok());
        let err = check_size_ceiling(SINGLE_UPLOAD_LIMIT + 1).unwrap_err();
        assert!(matches!(
            err,
            StorageError::UnsupportedFileSize { limit, .. } if limit == SINGLE_UPLOAD_LIMIT
        ));
    }

    #[test]
    fn file_ids_are_normalized_for_metadata_lookups() {
        assert_eq!(DropboxAdapter::id_arg("abc123"), "id:abc123");
        assert_eq!(DropboxAdapter::id_arg("id:abc123"), "id:abc123");
        assert_eq!(DropboxAdapter::id_arg("/docs/a.txt"), "/docs/a.txt");
    }

    #[tokio::test]
    async fn disconnected_adapter_is_inert() {
        let mut a = DropboxAdapter::new(
            Some(DropboxConfig {
                app_key: "key".to_string(),
                app_secret: Some("secret".to_string()),
                redirect_uri: None,
            }),
            Arc::new(MemoryCredentialStore::new()),
        );
        a.init().await.unwrap();
        assert!(a.list_files(10).await.unwrap().is_empty());
        assert!(a.search_files("x").await.unwrap().is_empty());
        let err = a
            .upload_file(&UploadPayload::from_bytes("a.txt", vec![1]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ProviderNotConnected(_)));
    }
}
