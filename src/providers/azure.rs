//! Azure Blob Storage adapter
//!
//! Implements `StorageAdapter` for Azure Blob Storage using the REST API
//! with Shared Key authentication derived from a connection string.
//!
//! ## Limitations (documented)
//! - Azure Blob has no native quota endpoint; a virtual 100 GiB allocation
//!   is reported and `used` is computed by summing blob sizes.
//! - Azure Blob has no native search; queries filter the container listing.
//! - Only block blobs are used.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use std::path::Path;
use tracing::{debug, info};

use crate::config::AzureConfig;

use super::types::{
    timestamp_or_epoch, trim_api_error, CloudFile, ConnectOutcome, DownloadOutcome, ProgressFn,
    ProviderId, Quota, StorageError, UploadOutcome, UploadPayload,
};
use super::StorageAdapter;

type HmacSha256 = Hmac<Sha256>;

/// Azure Storage REST API version
const API_VERSION: &str = "2024-11-04";

/// Virtual allocation reported for quota purposes; Azure Blob containers
/// have no capacity limit of their own.
const VIRTUAL_QUOTA_TOTAL: u64 = 100 * 1024 * 1024 * 1024;

/// Upper bound on blobs pulled when computing `used` space.
const QUOTA_SCAN_LIMIT: usize = 5000;

/// Account identity parsed out of a connection string
#[derive(Clone, Debug)]
struct AzureAccount {
    account_name: String,
    account_key: SecretString,
    /// Blob service endpoint, no trailing slash
    endpoint: String,
}

/// Parse an Azure storage connection string
/// (`DefaultEndpointsProtocol=…;AccountName=…;AccountKey=…;EndpointSuffix=…`).
fn parse_connection_string(raw: &str) -> Result<AzureAccount, StorageError> {
    let mut account_name = None;
    let mut account_key = None;
    let mut endpoint_suffix = "core.windows.net".to_string();
    let mut blob_endpoint = None;

    for part in raw.split(';') {
        // AccountKey is base64 and may itself contain '='; split once only
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        match key.trim() {
            "AccountName" => account_name = Some(value.trim().to_string()),
            "AccountKey" => account_key = Some(value.trim().to_string()),
            "EndpointSuffix" => endpoint_suffix = value.trim().to_string(),
            "BlobEndpoint" => blob_endpoint = Some(value.trim().trim_end_matches('/').to_string()),
            _ => {}
        }
    }

    let account_name = account_name.filter(|s| !s.is_empty()).ok_or_else(|| {
        StorageError::ConfigurationMissing(
            "azure connection string is missing AccountName".to_string(),
        )
    })?;
    let account_key = account_key.filter(|s| !s.is_empty()).ok_or_else(|| {
        StorageError::ConfigurationMissing(
            "azure connection string is missing AccountKey".to_string(),
        )
    })?;

    let endpoint = blob_endpoint
        .unwrap_or_else(|| format!("https://{}.blob.{}", account_name, endpoint_suffix));

    Ok(AzureAccount {
        account_name,
        account_key: SecretString::from(account_key),
        endpoint,
    })
}

/// Case-insensitive substring match used for client-side search.
fn name_matches(name: &str, query: &str) -> bool {
    name.to_lowercase().contains(&query.to_lowercase())
}

/// Blob entry parsed from the List Blobs XML response
#[derive(Debug)]
struct BlobItem {
    name: String,
    size: u64,
    last_modified: Option<String>,
    content_type: Option<String>,
}

/// Azure Blob Storage adapter
pub struct AzureBlobAdapter {
    config: Option<AzureConfig>,
    account: Option<AzureAccount>,
    client: reqwest::Client,
    initialized: bool,
    connected: bool,
    quota: Quota,
}

impl AzureBlobAdapter {
    pub fn new(config: Option<AzureConfig>) -> Self {
        Self {
            config,
            account: None,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            initialized: false,
            connected: false,
            quota: Quota::zero(),
        }
    }

    fn require_config(&self) -> Result<&AzureConfig, StorageError> {
        self.config.as_ref().ok_or_else(|| {
            StorageError::ConfigurationMissing(
                "azure: section missing from configuration".to_string(),
            )
        })
    }

    fn require_account(&self) -> Result<&AzureAccount, StorageError> {
        self.account
            .as_ref()
            .ok_or_else(|| StorageError::ProviderNotConnected(self.display_name()))
    }

    fn container(&self) -> Result<&str, StorageError> {
        Ok(&self.require_config()?.container_name)
    }

    /// Build the full URL for a blob (or the container itself for "").
    fn blob_url(&self, blob_name: &str) -> Result<String, StorageError> {
        let account = self.require_account()?;
        let container = self.container()?;
        if blob_name.is_empty() {
            Ok(format!("{}/{}", account.endpoint, container))
        } else {
            Ok(format!(
                "{}/{}/{}",
                account.endpoint,
                container,
                urlencoding::encode(blob_name)
            ))
        }
    }

    /// Build canonicalized headers string: all `x-ms-*` headers, sorted,
    /// formatted as `headername:value\n`.
    fn build_canonical_headers(headers: &HeaderMap) -> String {
        let mut x_ms_headers: Vec<(String, String)> = Vec::new();
        for (name, value) in headers.iter() {
            let name_lower = name.as_str().to_lowercase();
            if name_lower.starts_with("x-ms-") {
                let val = value.to_str().unwrap_or("").trim().to_string();
                x_ms_headers.push((name_lower, val));
            }
        }
        x_ms_headers.sort_by(|a, b| a.0.cmp(&b.0));
        x_ms_headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect()
    }

    /// Compute the Shared Key authorization header for a request.
    fn sign_request(
        &self,
        method: &str,
        url: &str,
        headers: &HeaderMap,
        content_length: u64,
    ) -> Result<String, StorageError> {
        let account = self.require_account()?;

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        let canonical_headers = Self::build_canonical_headers(headers);

        let parsed = url::Url::parse(url)
            .map_err(|e| StorageError::ParseError(format!("invalid URL: {}", e)))?;
        let canonicalized_resource = format!("/{}{}", account.account_name, parsed.path());

        let mut query_parts: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.to_lowercase(), v.to_string()))
            .collect();
        query_parts.sort();
        let query_str: String = query_parts
            .iter()
            .map(|(k, v)| format!("\n{}:{}", k, v))
            .collect();

        let string_to_sign = format!(
            "{}\n\n\n{}\n\n{}\n\n\n\n\n\n\n{}{}{}",
            method,
            if content_length > 0 {
                content_length.to_string()
            } else {
                String::new()
            },
            content_type,
            canonical_headers,
            canonicalized_resource,
            query_str,
        );

        let key_bytes = BASE64
            .decode(account.account_key.expose_secret())
            .map_err(|e| StorageError::ConfigurationMissing(format!("invalid account key: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(&key_bytes)
            .map_err(|e| StorageError::ParseError(format!("HMAC error: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        Ok(format!("SharedKey {}:{}", account.account_name, signature))
    }

    fn date_headers() -> Result<HeaderMap, StorageError> {
        let mut headers = HeaderMap::new();
        let now = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        headers.insert(
            "x-ms-date",
            HeaderValue::from_str(&now)
                .map_err(|e| StorageError::ParseError(format!("invalid header value: {}", e)))?,
        );
        headers.insert("x-ms-version", HeaderValue::from_static(API_VERSION));
        Ok(headers)
    }

    /// Send a signed request to the blob service.
    async fn send_signed(
        &self,
        method: reqwest::Method,
        url: &str,
        mut headers: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, StorageError> {
        let content_length = body.as_ref().map(|b| b.len() as u64).unwrap_or(0);
        let auth = self.sign_request(method.as_str(), url, &headers, content_length)?;
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&auth)
                .map_err(|e| StorageError::ParseError(format!("invalid header value: {}", e)))?,
        );

        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(bytes) = body {
            builder = builder.body(bytes);
        }

        builder
            .send()
            .await
            .map_err(|e| StorageError::RemoteCallFailed(e.to_string()))
    }

    /// Parse a List Blobs XML response with quick-xml events.
    fn parse_blob_list(xml: &str) -> Vec<BlobItem> {
        let mut items = Vec::new();

        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut in_blob = false;
        let mut element = Vec::new();
        let mut name = String::new();
        let mut size: u64 = 0;
        let mut modified: Option<String> = None;
        let mut content_type: Option<String> = None;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    element = e.name().as_ref().to_vec();
                    if element == b"Blob" {
                        in_blob = true;
                        name.clear();
                        size = 0;
                        modified = None;
                        content_type = None;
                    }
                }
                Ok(Event::Text(ref t)) if in_blob => {
                    let decoded = t.decode().unwrap_or_default();
                    let text = quick_xml::escape::unescape(&decoded)
                        .map(|c| c.into_owned())
                        .unwrap_or_else(|_| decoded.into_owned());
                    match element.as_slice() {
                        b"Name" => name = text,
                        b"Content-Length" => size = text.parse().unwrap_or(0),
                        b"Last-Modified" => modified = Some(text),
                        b"Content-Type" => content_type = Some(text),
                        _ => {}
                    }
                }
                Ok(Event::End(ref e)) => {
                    if e.name().as_ref() == b"Blob" && in_blob {
                        if !name.is_empty() {
                            items.push(BlobItem {
                                name: std::mem::take(&mut name),
                                size,
                                last_modified: modified.take(),
                                content_type: content_type.take(),
                            });
                        }
                        in_blob = false;
                    }
                    element.clear();
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    debug!("Azure XML parse error: {}", e);
                    break;
                }
                _ => {}
            }
            buf.clear();
        }

        items
    }

    fn to_cloud_file(&self, blob: &BlobItem) -> CloudFile {
        CloudFile {
            // Blob names are the only stable identifier Azure offers
            id: blob.name.clone(),
            name: blob.name.clone(),
            size: blob.size,
            modified: timestamp_or_epoch(blob.last_modified.as_deref()),
            provider: ProviderId::Azure,
            provider_name: ProviderId::Azure.label().to_string(),
            mime_type: blob
                .content_type
                .clone()
                .or_else(|| mime_guess::from_path(&blob.name).first().map(|m| m.to_string())),
            web_link: None,
        }
    }

    /// List blobs in the container, bounded by `max_results`.
    async fn list_blobs(&self, max_results: usize) -> Result<Vec<BlobItem>, StorageError> {
        let url = format!(
            "{}?restype=container&comp=list&maxresults={}",
            self.blob_url("")?,
            max_results
        );

        let response = self
            .send_signed(reqwest::Method::GET, &url, Self::date_headers()?, None)
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::RemoteCallFailed(format!(
                "list blobs failed {}: {}",
                status,
                trim_api_error(&body)
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| StorageError::ParseError(e.to_string()))?;

        Ok(Self::parse_blob_list(&body))
    }

    /// Recompute the quota snapshot: virtual total, used from blob sizes.
    async fn fetch_quota(&self) -> Result<Quota, StorageError> {
        let used = self
            .list_blobs(QUOTA_SCAN_LIMIT)
            .await?
            .iter()
            .map(|b| b.size)
            .sum();
        Ok(Quota::reconciled(VIRTUAL_QUOTA_TOTAL, used))
    }
}

#[async_trait]
impl StorageAdapter for AzureBlobAdapter {
    fn provider_id(&self) -> ProviderId {
        ProviderId::Azure
    }

    fn display_name(&self) -> String {
        ProviderId::Azure.label().to_string()
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn init(&mut self) -> Result<(), StorageError> {
        if self.initialized {
            return Ok(());
        }

        let cfg = self.require_config()?;
        if cfg.connection_string.trim().is_empty() {
            return Err(StorageError::ConfigurationMissing(
                "azure.connection_string is empty".to_string(),
            ));
        }
        if cfg.container_name.trim().is_empty() {
            return Err(StorageError::ConfigurationMissing(
                "azure.container_name is empty".to_string(),
            ));
        }

        self.initialized = true;
        Ok(())
    }

    async fn connect(&mut self) -> Result<ConnectOutcome, StorageError> {
        if self.connected {
            return Ok(ConnectOutcome {
                provider: ProviderId::Azure,
                message: "Azure Storage already connected".to_string(),
            });
        }

        let cfg = self.require_config()?;
        self.account = Some(parse_connection_string(&cfg.connection_string)?);

        // Validate the credentials with a minimal listing before computing
        // the quota snapshot.
        let url = format!(
            "{}?restype=container&comp=list&maxresults=1",
            self.blob_url("")?
        );
        let response = self
            .send_signed(reqwest::Method::GET, &url, Self::date_headers()?, None)
            .await;
        match response {
            Ok(r) if r.status().is_success() => {}
            Ok(r) => {
                let status = r.status();
                let body = r.text().await.unwrap_or_default();
                self.account = None;
                return Err(StorageError::AuthenticationFailed(format!(
                    "Azure container check failed {}: {}",
                    status,
                    trim_api_error(&body)
                )));
            }
            Err(e) => {
                self.account = None;
                return Err(e);
            }
        }

        self.quota = self.fetch_quota().await.unwrap_or_else(|_| {
            // Listing succeeded a moment ago; fall back to an empty container
            Quota::reconciled(VIRTUAL_QUOTA_TOTAL, 0)
        });
        self.connected = true;

        info!("Connected to Azure Storage");
        Ok(ConnectOutcome {
            provider: ProviderId::Azure,
            message: "Azure Storage connected".to_string(),
        })
    }

    async fn disconnect(&mut self) -> Result<(), StorageError> {
        // Shared Key credentials cannot be revoked remotely; dropping the
        // parsed account material is the disconnect.
        self.connected = false;
        self.account = None;
        self.quota = Quota::zero();

        info!("Disconnected from Azure Storage");
        Ok(())
    }

    async fn list_files(&mut self, max_results: usize) -> Result<Vec<CloudFile>, StorageError> {
        if !self.connected {
            return Ok(Vec::new());
        }

        let blobs = self.list_blobs(max_results).await?;
        Ok(blobs.iter().map(|b| self.to_cloud_file(b)).collect())
    }

    async fn search_files(&mut self, query: &str) -> Result<Vec<CloudFile>, StorageError> {
        if !self.connected || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        // No native search; filter a generous listing client-side
        let blobs = self.list_blobs(1000).await?;
        Ok(blobs
            .iter()
            .filter(|b| name_matches(&b.name, query))
            .map(|b| self.to_cloud_file(b))
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

        if let Some(cb) = on_progress {
            cb(0.0);
        }

        let url = self.blob_url(&payload.name)?;

        let mut headers = Self::date_headers()?;
        headers.insert("x-ms-blob-type", HeaderValue::from_static("BlockBlob"));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(
                payload
                    .mime_type
                    .as_deref()
                    .unwrap_or("application/octet-stream"),
            )
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
        );

        let response = self
            .send_signed(
                reqwest::Method::PUT,
                &url,
                headers,
                Some(payload.bytes.clone()),
            )
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::RemoteCallFailed(format!(
                "upload failed {}: {}",
                status,
                trim_api_error(&body)
            )));
        }

        if let Err(e) = self.update_quota().await {
            tracing::warn!("Azure quota refresh after upload failed: {}", e);
        }

        if let Some(cb) = on_progress {
            cb(100.0);
        }

        info!("Uploaded {} to Azure Storage", payload.name);
        Ok(UploadOutcome {
            provider: ProviderId::Azure,
            // Blob name doubles as the file id
            file_id: payload.name.clone(),
            message: format!("{} uploaded to Azure Storage", payload.name),
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

        let url = self.blob_url(file_id)?;
        let response = self
            .send_signed(reqwest::Method::GET, &url, Self::date_headers()?, None)
            .await?;

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

        info!("Downloaded {} from Azure Storage to {}", file_id, dest.display());
        Ok(DownloadOutcome {
            provider: ProviderId::Azure,
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

    const CONN: &str = "DefaultEndpointsProtocol=https;AccountName=acct;AccountKey=a2V5cGFkZGluZw==;EndpointSuffix=core.windows.net";

    #[test]
    fn connection_string_parses_account_and_endpoint() {
        let account = parse_connection_string(CONN).unwrap();
        assert_eq!(account.account_name, "acct");
        assert_eq!(account.endpoint, "https://acct.blob.core.windows.net");
        // Key with '=' padding survives the split
        assert_eq!(account.account_key.expose_secret(), "a2V5cGFkZGluZw==");
    }

    #[test]
    fn connection_string_honors_custom_blob_endpoint() {
        let conn = format!("{};BlobEndpoint=http://127.0.0.1:10000/acct/", CONN);
        let account = parse_connection_string(&conn).unwrap();
        assert_eq!(account.endpoint, "http://127.0.0.1:10000/acct");
    }

    #[test]
    fn connection_string_requires_name_and_key() {
        let err = parse_connection_string("AccountName=acct").unwrap_err();
        assert!(matches!(err, StorageError::ConfigurationMissing(_)));
        let err = parse_connection_string("AccountKey=abc").unwrap_err();
        assert!(matches!(err, StorageError::ConfigurationMissing(_)));
    }

    #[test]
    fn search_filter_is_case_insensitive() {
        assert!(name_matches("Quarterly-Report.PDF", "report"));
        assert!(!name_matches("notes.txt", "report"));
    }

    #[test]
    fn blob_list_xml_parses_entries() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults>
  <Blobs>
    <Blob>
      <Name>photos/cat.png</Name>
      <Properties>
        <Last-Modified>Fri, 01 Mar 2024 10:00:00 GMT</Last-Modified>
        <Content-Length>2048</Content-Length>
        <Content-Type>image/png</Content-Type>
      </Properties>
    </Blob>
    <Blob>
      <Name>notes.txt</Name>
      <Properties>
        <Content-Length>7</Content-Length>
      </Properties>
    </Blob>
  </Blobs>
</EnumerationResults>"#;

        let items = AzureBlobAdapter::parse_blob_list(xml);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "photos/cat.png");
        assert_eq!(items[0].size, 2048);
        assert_eq!(items[0].content_type.as_deref(), Some("image/png"));
        assert!(items[0].last_modified.is_some());
        assert_eq!(items[1].name, "notes.txt");
        assert_eq!(items[1].size, 7);
    }

    #[tokio::test]
    async fn init_validates_required_fields() {
        let mut a = AzureBlobAdapter::new(None);
        assert!(matches!(
            a.init().await,
            Err(StorageError::ConfigurationMissing(_))
        ));

        let mut a = AzureBlobAdapter::new(Some(AzureConfig {
            connection_string: CONN.to_string(),
            container_name: String::new(),
        }));
        assert!(matches!(
            a.init().await,
            Err(StorageError::ConfigurationMissing(_))
        ));
    }

    #[tokio::test]
    async fn disconnected_adapter_is_inert() {
        let mut a = AzureBlobAdapter::new(Some(AzureConfig {
            connection_string: CONN.to_string(),
            container_name: "files".to_string(),
        }));
        a.init().await.unwrap();
        assert!(a.list_files(10).await.unwrap().is_empty());
        assert!(a.search_files("x").await.unwrap().is_empty());
        assert_eq!(a.get_quota(), Quota::zero());
        a.update_quota().await.unwrap();
        // Disconnect while already disconnected stays clean
        a.disconnect().await.unwrap();
        assert!(!a.is_connected());
    }
}
