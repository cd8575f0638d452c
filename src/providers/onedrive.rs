//! Microsoft OneDrive storage adapter
//!
//! Implements `StorageAdapter` for OneDrive using the Microsoft Graph API.
//! Only the simple upload path is implemented, which caps uploads at 4 MiB;
//! larger files require an upload session and are rejected up front.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::OneDriveConfig;
use crate::credentials::CredentialStore;

use super::oauth::{OAuthConfig, TokenManager};
use super::types::{
    timestamp_or_epoch, trim_api_error, CloudFile, ConnectOutcome, DownloadOutcome, ProgressFn,
    ProviderId, Quota, StorageError, UploadOutcome, UploadPayload,
};
use super::StorageAdapter;

/// Microsoft Graph base URL
const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Simple-upload ceiling; anything larger needs an upload session.
const SIMPLE_UPLOAD_LIMIT: u64 = 4 * 1024 * 1024;

/// Graph drive item (subset)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    name: String,
    #[serde(default)]
    size: u64,
    last_modified_date_time: Option<String>,
    web_url: Option<String>,
    /// Present only for files, absent for folders
    file: Option<FileFacet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileFacet {
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveItemList {
    #[serde(default)]
    value: Vec<DriveItem>,
}

#[derive(Debug, Deserialize)]
struct DriveResource {
    quota: Option<GraphQuota>,
}

#[derive(Debug, Deserialize)]
struct GraphQuota {
    total: Option<u64>,
    used: Option<u64>,
    remaining: Option<u64>,
}

/// Reconcile Graph quota figures to the free == total - used invariant.
/// Graph reports `remaining` directly, but it may lag `total - used`; the
/// invariant wins, with `remaining` only used to recover a missing total.
fn quota_from_graph(q: &GraphQuota) -> Quota {
    let used = q.used.unwrap_or(0);
    let total = match q.total {
        Some(total) => total,
        None => used + q.remaining.unwrap_or(0),
    };
    Quota::reconciled(total, used)
}

/// Reject uploads beyond the simple-upload ceiling before any network call.
fn check_size_ceiling(size: u64) -> Result<(), StorageError> {
    if size > SIMPLE_UPLOAD_LIMIT {
        return Err(StorageError::UnsupportedFileSize {
            provider: ProviderId::OneDrive.label().to_string(),
            size,
            limit: SIMPLE_UPLOAD_LIMIT,
        });
    }
    Ok(())
}

/// OneDrive storage adapter
pub struct OneDriveAdapter {
    config: Option<OneDriveConfig>,
    tokens: TokenManager,
    client: reqwest::Client,
    initialized: bool,
    connected: bool,
    quota: Quota,
}

impl OneDriveAdapter {
    pub fn new(config: Option<OneDriveConfig>, store: Arc<dyn CredentialStore>) -> Self {
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

    fn require_config(&self) -> Result<&OneDriveConfig, StorageError> {
        self.config.as_ref().ok_or_else(|| {
            StorageError::ConfigurationMissing(
                "onedrive: section missing from configuration".to_string(),
            )
        })
    }

    fn oauth_config(&self) -> Result<OAuthConfig, StorageError> {
        let cfg = self.require_config()?;
        Ok(OAuthConfig::onedrive(
            &cfg.client_id,
            cfg.client_secret.as_deref(),
            cfg.redirect_uri.as_deref(),
        ))
    }

    async fn auth_header(&self) -> Result<HeaderValue, StorageError> {
        let token = self.tokens.get_valid_token(&self.oauth_config()?).await?;
        HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
            .map_err(|e| StorageError::AuthenticationFailed(format!("invalid token: {}", e)))
    }

    fn to_cloud_file(&self, item: &DriveItem) -> CloudFile {
        CloudFile {
            id: item.id.clone(),
            name: item.name.clone(),
            size: item.size,
            modified: timestamp_or_epoch(item.last_modified_date_time.as_deref()),
            provider: ProviderId::OneDrive,
            provider_name: ProviderId::OneDrive.label().to_string(),
            mime_type: item.file.as_ref().and_then(|f| f.mime_type.clone()),
            web_link: item.web_url.clone(),
        }
    }

    /// GET a Graph collection endpoint and keep only file items.
    async fn fetch_items(&self, url: &str) -> Result<Vec<CloudFile>, StorageError> {
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, self.auth_header().await?)
            .send()
            .await
            .map_err(|e| StorageError::RemoteCallFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::RemoteCallFailed(format!(
                "Graph API error {}: {}",
                status,
                trim_api_error(&body)
            )));
        }

        let list: DriveItemList = response
            .json()
            .await
            .map_err(|e| StorageError::ParseError(e.to_string()))?;

        Ok(list
            .value
            .iter()
            .filter(|item| item.file.is_some())
            .map(|item| self.to_cloud_file(item))
            .collect())
    }

    async fn fetch_quota(&self) -> Result<Quota, StorageError> {
        let url = format!("{}/me/drive", GRAPH_API_BASE);

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
                "OneDrive quota fetch failed {}: {}",
                status,
                trim_api_error(&body)
            )));
        }

        let drive: DriveResource = response
            .json()
            .await
            .map_err(|e| StorageError::ParseError(e.to_string()))?;

        Ok(drive
            .quota
            .map(|q| quota_from_graph(&q))
            .unwrap_or_else(Quota::zero))
    }
}

#[async_trait]
impl StorageAdapter for OneDriveAdapter {
    fn provider_id(&self) -> ProviderId {
        ProviderId::OneDrive
    }

    fn display_name(&self) -> String {
        ProviderId::OneDrive.label().to_string()
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
                "onedrive.client_id is empty".to_string(),
            ));
        }

        if self.tokens.has_tokens(ProviderId::OneDrive) {
            debug!("OneDrive: stored credential found");
        }

        self.initialized = true;
        Ok(())
    }

    async fn connect(&mut self) -> Result<ConnectOutcome, StorageError> {
        if self.connected {
            return Ok(ConnectOutcome {
                provider: ProviderId::OneDrive,
                message: "OneDrive already connected".to_string(),
            });
        }

        let _ = self.tokens.get_valid_token(&self.oauth_config()?).await?;
        let quota = self.fetch_quota().await?;

        self.quota = quota;
        self.connected = true;

        info!("Connected to OneDrive");
        Ok(ConnectOutcome {
            provider: ProviderId::OneDrive,
            message: "OneDrive connected".to_string(),
        })
    }

    async fn disconnect(&mut self) -> Result<(), StorageError> {
        // Microsoft identity platform has no lightweight token revocation
        // endpoint; clearing the stored refresh token is the disconnect.
        self.connected = false;
        self.quota = Quota::zero();
        if let Err(e) = self.tokens.delete_tokens(ProviderId::OneDrive) {
            warn!("OneDrive: could not clear stored tokens: {}", e);
        }

        info!("Disconnected from OneDrive");
        Ok(())
    }

    async fn list_files(&mut self, max_results: usize) -> Result<Vec<CloudFile>, StorageError> {
        if !self.connected {
            return Ok(Vec::new());
        }

        let url = format!(
            "{}/me/drive/root/children?$top={}",
            GRAPH_API_BASE, max_results
        );
        self.fetch_items(&url).await
    }

    async fn search_files(&mut self, query: &str) -> Result<Vec<CloudFile>, StorageError> {
        if !self.connected || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let url = format!(
            "{}/me/drive/root/search(q='{}')",
            GRAPH_API_BASE,
            urlencoding::encode(query)
        );
        self.fetch_items(&url).await
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

        let url = format!(
            "{}/me/drive/root:/{}:/content",
            GRAPH_API_BASE,
            urlencoding::encode(&payload.name)
        );

        let response = self
            .client
            .put(&url)
            .header(AUTHORIZATION, self.auth_header().await?)
            .header(
                CONTENT_TYPE,
                payload
                    .mime_type
                    .as_deref()
                    .unwrap_or("application/octet-stream"),
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
            warn!("OneDrive quota refresh after upload failed: {}", e);
        }

        if let Some(cb) = on_progress {
            cb(100.0);
        }

        info!("Uploaded {} to OneDrive", payload.name);
        Ok(UploadOutcome {
            provider: ProviderId::OneDrive,
            file_id: uploaded.id,
            message: format!("{} uploaded to OneDrive", payload.name),
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

        let url = format!("{}/me/drive/items/{}/content", GRAPH_API_BASE, file_id);

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

        info!("Downloaded {} from OneDrive to {}", file_id, dest.display());
        Ok(DownloadOutcome {
            provider: ProviderId::OneDrive,
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
        assert!(check_size_ceiling(SIMPLE_UPLOAD_LIMIT).is_ok());
        let err = check_size_ceiling(SIMPLE_UPLOAD_LIMIT + 1).unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedFileSize { .. }));
    }

    #[test]
    fn graph_quota_reconciles_to_invariant() {
        // remaining diverges from total - used; the invariant wins
        let q = quota_from_graph(&GraphQuota {
            total: Some(1000),
            used: Some(300),
            remaining: Some(650),
        });
        assert_eq!(q, Quota { total: 1000, used: 300, free: 700 });

        // total recovered from used + remaining when absent
        let q = quota_from_graph(&GraphQuota {
            total: None,
            used: Some(100),
            remaining: Some(400),
        });
        assert_eq!(q, Quota { total: 500, used: 100, free: 400 });
    }

    #[tokio::test]
    async fn disconnected_adapter_is_inert() {
        let mut a = OneDriveAdapter::new(
            Some(OneDriveConfig {
                client_id: "cid".to_string(),
                client_secret: None,
                redirect_uri: None,
            }),
            Arc::new(MemoryCredentialStore::new()),
        );
        a.init().await.unwrap();
        assert!(a.list_files(10).await.unwrap().is_empty());
        assert!(a.search_files("report").await.unwrap().is_empty());
        let err = a
            .download_file("f1", Path::new("/tmp/unused"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ProviderNotConnected(_)));
    }
}
