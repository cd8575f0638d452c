//! Google Drive storage adapter
//!
//! Implements `StorageAdapter` for Google Drive using the Drive API v3.
//! Uses OAuth2 bearer tokens restored from the credential store.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::GoogleConfig;
use crate::credentials::CredentialStore;

use super::oauth::{OAuthConfig, TokenManager};
use super::types::{
    timestamp_or_epoch, trim_api_error, CloudFile, ConnectOutcome, DownloadOutcome, ProgressFn,
    ProviderId, Quota, StorageError, UploadOutcome, UploadPayload,
};
use super::StorageAdapter;

/// Google Drive API base URLs
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_API_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// Fields requested for every file listing
const FILE_FIELDS: &str = "files(id,name,mimeType,size,modifiedTime,webViewLink)";

/// Google Drive file metadata from API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: Option<String>,
    #[serde(default)]
    size: Option<String>,
    modified_time: Option<String>,
    web_view_link: Option<String>,
}

/// Google Drive file list response
#[derive(Debug, Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AboutResponse {
    storage_quota: Option<DriveStorageQuota>,
}

/// Drive reports quota figures as decimal strings
#[derive(Debug, Deserialize)]
struct DriveStorageQuota {
    limit: Option<String>,
    usage: Option<String>,
}

/// Escape a user query for embedding in a Drive `q` expression.
fn escape_drive_query(query: &str) -> String {
    query.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Google Drive storage adapter
pub struct GoogleDriveAdapter {
    config: Option<GoogleConfig>,
    tokens: TokenManager,
    client: reqwest::Client,
    initialized: bool,
    connected: bool,
    quota: Quota,
}

impl GoogleDriveAdapter {
    pub fn new(config: Option<GoogleConfig>, store: Arc<dyn CredentialStore>) -> Self {
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

    fn require_config(&self) -> Result<&GoogleConfig, StorageError> {
        self.config.as_ref().ok_or_else(|| {
            StorageError::ConfigurationMissing(
                "google: section missing from configuration".to_string(),
            )
        })
    }

    fn oauth_config(&self) -> Result<OAuthConfig, StorageError> {
        let cfg = self.require_config()?;
        Ok(OAuthConfig::google(
            &cfg.client_id,
            cfg.client_secret.as_deref(),
            &cfg.scopes,
        ))
    }

    /// Get authorization header
    async fn auth_header(&self) -> Result<HeaderValue, StorageError> {
        let token = self.tokens.get_valid_token(&self.oauth_config()?).await?;
        HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
            .map_err(|e| StorageError::AuthenticationFailed(format!("invalid token: {}", e)))
    }

    fn to_cloud_file(&self, file: &DriveFile) -> CloudFile {
        CloudFile {
            id: file.id.clone(),
            name: file.name.clone(),
            size: file.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
            modified: timestamp_or_epoch(file.modified_time.as_deref()),
            provider: ProviderId::Google,
            provider_name: ProviderId::Google.label().to_string(),
            mime_type: file.mime_type.clone(),
            web_link: file.web_view_link.clone(),
        }
    }

    /// Run a files.list request with the given `q` expression.
    async fn list_with_query(
        &self,
        q: &str,
        page_size: usize,
    ) -> Result<Vec<CloudFile>, StorageError> {
        let url = format!(
            "{}/files?pageSize={}&fields={}&q={}",
            DRIVE_API_BASE,
            page_size,
            urlencoding::encode(FILE_FIELDS),
            urlencoding::encode(q),
        );

        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, self.auth_header().await?)
            .send()
            .await
            .map_err(|e| StorageError::RemoteCallFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::RemoteCallFailed(format!(
                "Drive API error {}: {}",
                status,
                trim_api_error(&body)
            )));
        }

        let list: DriveFileList = response
            .json()
            .await
            .map_err(|e| StorageError::ParseError(e.to_string()))?;

        Ok(list.files.iter().map(|f| self.to_cloud_file(f)).collect())
    }

    /// Fetch the account quota from the `about` endpoint.
    async fn fetch_quota(&self) -> Result<Quota, StorageError> {
        let url = format!("{}/about?fields=storageQuota", DRIVE_API_BASE);

        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, self.auth_header().await?)
            .send()
            .await
            .map_err(|e| StorageError::RemoteCallFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::RemoteCallFailed(format!(
                "Drive quota fetch failed {}: {}",
                status,
                trim_api_error(&body)
            )));
        }

        let about: AboutResponse = response
            .json()
            .await
            .map_err(|e| StorageError::ParseError(e.to_string()))?;

        let quota = about.storage_quota.unwrap_or(DriveStorageQuota {
            limit: None,
            usage: None,
        });
        let total = quota.limit.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);
        let used = quota.usage.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);

        Ok(Quota::reconciled(total, used))
    }
}

#[async_trait]
impl StorageAdapter for GoogleDriveAdapter {
    fn provider_id(&self) -> ProviderId {
        ProviderId::Google
    }

    fn display_name(&self) -> String {
        ProviderId::Google.label().to_string()
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn init(&mut self) -> Result<(), StorageError> {
        if self.initialized {
            return Ok(());
        }

        let cfg = self.require_config()?;
        if cfg.client_id.trim().is_empty() {
            return Err(StorageError::ConfigurationMissing(
                "google.client_id is empty".to_string(),
            ));
        }

        if self.tokens.has_tokens(ProviderId::Google) {
            debug!("Google Drive: stored credential found");
        }

        self.initialized = true;
        Ok(())
    }

    async fn connect(&mut self) -> Result<ConnectOutcome, StorageError> {
        if self.connected {
            return Ok(ConnectOutcome {
                provider: ProviderId::Google,
                message: "Google Drive already connected".to_string(),
            });
        }

        // Obtaining a valid token exercises the refresh exchange; the quota
        // fetch validates it against the live API.
        let _ = self.tokens.get_valid_token(&self.oauth_config()?).await?;
        let quota = self.fetch_quota().await?;

        self.quota = quota;
        self.connected = true;

        info!("Connected to Google Drive");
        Ok(ConnectOutcome {
            provider: ProviderId::Google,
            message: "Google Drive connected".to_string(),
        })
    }

    async fn disconnect(&mut self) -> Result<(), StorageError> {
        // Best-effort remote revocation; local state is cleared regardless.
        if let Some(tokens) = self.tokens.load_tokens(ProviderId::Google) {
            let url = format!(
                "https://oauth2.googleapis.com/revoke?token={}",
                urlencoding::encode(&tokens.access_token)
            );
            if let Err(e) = self.client.post(&url).send().await {
                warn!("Google Drive token revoke failed: {}", e);
            }
        }

        self.connected = false;
        self.quota = Quota::zero();
        if let Err(e) = self.tokens.delete_tokens(ProviderId::Google) {
            warn!("Google Drive: could not clear stored tokens: {}", e);
        }

        info!("Disconnected from Google Drive");
        Ok(())
    }

    async fn list_files(&mut self, max_results: usize) -> Result<Vec<CloudFile>, StorageError> {
        if !self.connected {
            return Ok(Vec::new());
        }

        // Folders are omitted from the aggregated view
        self.list_with_query(
            "trashed=false and mimeType!='application/vnd.google-apps.folder'",
            max_results,
        )
        .await
    }

    async fn search_files(&mut self, query: &str) -> Result<Vec<CloudFile>, StorageError> {
        if !self.connected || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let q = format!(
            "name contains '{}' and trashed=false",
            escape_drive_query(query)
        );
        self.list_with_query(&q, 50).await
    }

    async fn upload_file(
        &mut self,
        payload: &UploadPayload,
        on_progress: Option<&ProgressFn>,
    ) -> Result<UploadOutcome, StorageError> {
        if !self.connected {
            return Err(StorageError::ProviderNotConnected(
                self.display_name(),
            ));
        }

        if let Some(cb) = on_progress {
            cb(0.0);
        }

        let metadata = serde_json::json!({
            "name": payload.name,
            "mimeType": payload.mime_type.as_deref().unwrap_or("application/octet-stream"),
        });

        // Multipart/related body: JSON metadata part + raw content part
        let boundary = "unicloud_boundary";
        let mut body = Vec::with_capacity(payload.bytes.len() + 512);
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.extend_from_slice(metadata.to_string().as_bytes());
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(&payload.bytes);
        body.extend_from_slice(format!("\r\n--{}--", boundary).as_bytes());

        let url = format!("{}/files?uploadType=multipart", UPLOAD_API_BASE);

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, self.auth_header().await?)
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
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
            warn!("Google Drive quota refresh after upload failed: {}", e);
        }

        if let Some(cb) = on_progress {
            cb(100.0);
        }

        info!("Uploaded {} to Google Drive", payload.name);
        Ok(UploadOutcome {
            provider: ProviderId::Google,
            file_id: uploaded.id,
            message: format!("{} uploaded to Google Drive", payload.name),
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

        let url = format!("{}/files/{}?alt=media", DRIVE_API_BASE, file_id);

        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, self.auth_header().await?)
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

        info!("Downloaded {} from Google Drive to {}", file_id, dest.display());
        Ok(DownloadOutcome {
            provider: ProviderId::Google,
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

    fn adapter(config: Option<GoogleConfig>) -> GoogleDriveAdapter {
        GoogleDriveAdapter::new(config, Arc::new(MemoryCredentialStore::new()))
    }

    #[test]
    fn drive_query_escaping() {
        assert_eq!(escape_drive_query("it's"), "it\\'s");
        assert_eq!(escape_drive_query(r"a\b"), r"a\\b");
    }

    #[tokio::test]
    async fn init_requires_configuration() {
        let mut a = adapter(None);
        assert!(matches!(
            a.init().await,
            Err(StorageError::ConfigurationMissing(_))
        ));

        let mut a = adapter(Some(GoogleConfig {
            client_id: " ".to_string(),
            client_secret: None,
            scopes: vec![],
        }));
        assert!(matches!(
            a.init().await,
            Err(StorageError::ConfigurationMissing(_))
        ));
    }

    #[tokio::test]
    async fn disconnected_adapter_lists_nothing() {
        let mut a = adapter(Some(GoogleConfig {
            client_id: "cid".to_string(),
            client_secret: None,
            scopes: vec![],
        }));
        a.init().await.unwrap();
        assert!(!a.is_connected());
        assert!(a.list_files(10).await.unwrap().is_empty());
        assert!(a.search_files("x").await.unwrap().is_empty());
        assert_eq!(a.get_quota(), Quota::zero());
        // Quota refresh while disconnected is a no-op, not an error
        a.update_quota().await.unwrap();
    }
}
