//! Shared types for storage providers
//!
//! This module contains the provider-normalized file and quota model,
//! operation outcome payloads, and the error taxonomy shared by the
//! adapters and the coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Supported storage providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// Google Drive (Drive API v3)
    Google,
    /// Microsoft OneDrive (Graph API)
    OneDrive,
    /// Azure Blob Storage
    Azure,
    /// Dropbox (HTTP API v2)
    Dropbox,
}

impl ProviderId {
    /// Registry iteration order. Fixed for the lifetime of the process.
    pub const ALL: [ProviderId; 4] = [
        ProviderId::Google,
        ProviderId::OneDrive,
        ProviderId::Azure,
        ProviderId::Dropbox,
    ];

    /// Wire identifier used in config files and CLI arguments
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Google => "google",
            ProviderId::OneDrive => "onedrive",
            ProviderId::Azure => "azure",
            ProviderId::Dropbox => "dropbox",
        }
    }

    /// Human-readable label for display
    pub fn label(&self) -> &'static str {
        match self {
            ProviderId::Google => "Google Drive",
            ProviderId::OneDrive => "OneDrive",
            ProviderId::Azure => "Azure Storage",
            ProviderId::Dropbox => "Dropbox",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" => Ok(ProviderId::Google),
            "onedrive" => Ok(ProviderId::OneDrive),
            "azure" => Ok(ProviderId::Azure),
            "dropbox" => Ok(ProviderId::Dropbox),
            other => Err(StorageError::ProviderNotFound(other.to_string())),
        }
    }
}

/// A file as reported by one provider, normalized to the common model.
///
/// Instances are only ever built by the owning adapter from a fresh remote
/// response. The coordinator reorders and merges lists of them but never
/// mutates fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudFile {
    /// Provider-scoped opaque identifier. Unique only within (provider, id).
    pub id: String,
    /// Display name as supplied by the provider, unsanitized
    pub name: String,
    /// Size in bytes, 0 when the provider does not report one
    pub size: u64,
    /// Last modification time; sort key for aggregated listings
    pub modified: DateTime<Utc>,
    /// Owning provider
    pub provider: ProviderId,
    /// Cached human-readable provider label
    pub provider_name: String,
    /// Best-effort MIME type
    pub mime_type: Option<String>,
    /// Best-effort web link or display path
    pub web_link: Option<String>,
}

impl CloudFile {
    /// Composite key used for cross-provider deduplication.
    /// Name collisions across providers are legitimate; (provider, id) is not.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.provider, self.id)
    }
}

/// Storage quota snapshot in bytes.
///
/// Invariant: `free == total - used` (saturating). Providers that report a
/// `remaining` figure directly are reconciled to this invariant instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

impl Quota {
    /// Build a quota honoring the free-space invariant.
    pub fn reconciled(total: u64, used: u64) -> Self {
        Self {
            total,
            used,
            free: total.saturating_sub(used),
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }
}

/// Combined quota across all connected providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TotalQuota {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    /// `used / total * 100`, or 0 when nothing is connected
    pub percentage: f64,
}

/// Registry snapshot entry for one provider, independent of connection state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub id: ProviderId,
    pub name: String,
    pub connected: bool,
    pub quota: Quota,
}

/// Successful connection result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOutcome {
    pub provider: ProviderId,
    pub message: String,
}

/// Successful upload result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub provider: ProviderId,
    /// Identifier assigned by the provider to the uploaded file
    pub file_id: String,
    pub message: String,
}

/// Successful download result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOutcome {
    pub provider: ProviderId,
    /// Local path the content was written to
    pub path: PathBuf,
    pub message: String,
}

/// Upload content handed to an adapter.
///
/// Adapters consume the bytes as a single body; the coordinator only reads
/// `size` for its capacity pre-check.
#[derive(Debug, Clone)]
pub struct UploadPayload {
    pub name: String,
    pub size: u64,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadPayload {
    /// Read a local file into an upload payload, guessing the MIME type
    /// from the file name.
    pub async fn from_path(path: &Path) -> Result<Self, StorageError> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| StorageError::ParseError(format!("not a file path: {}", path.display())))?;
        Ok(Self::from_bytes(&name, bytes))
    }

    pub fn from_bytes(name: &str, bytes: Vec<u8>) -> Self {
        let mime_type = mime_guess::from_path(name).first().map(|m| m.to_string());
        Self {
            name: name.to_string(),
            size: bytes.len() as u64,
            mime_type,
            bytes,
        }
    }
}

/// Upload destination: explicit provider or best-free-space heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadTarget {
    Auto,
    Provider(ProviderId),
}

impl UploadTarget {
    /// Parse `"auto"` or a wire provider id.
    pub fn parse(s: &str) -> Result<Self, StorageError> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(UploadTarget::Auto)
        } else {
            s.parse().map(UploadTarget::Provider)
        }
    }
}

/// Progress observer: invoked zero or more times with a monotonically
/// non-decreasing percentage. Optional and fire-and-forget; uploads never
/// depend on it.
pub type ProgressFn = Box<dyn Fn(f64) + Send + Sync>;

/// Error taxonomy shared by adapters and coordinator
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Missing configuration: {0}")]
    ConfigurationMissing(String),

    #[error("Unknown provider: {0}")]
    ProviderNotFound(String),

    #[error("{0} is not connected")]
    ProviderNotConnected(String),

    #[error("No connected provider available")]
    NoProviderAvailable,

    #[error("Not enough space on {provider}: need {needed} bytes, {free} free")]
    InsufficientQuota {
        provider: String,
        needed: u64,
        free: u64,
    },

    #[error("{provider} does not accept uploads of {size} bytes (limit {limit})")]
    UnsupportedFileSize {
        provider: String,
        size: u64,
        limit: u64,
    },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Remote call failed: {0}")]
    RemoteCallFailed(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse a provider timestamp, falling back to the Unix epoch so files
/// without one sort last in newest-first listings.
pub(crate) fn timestamp_or_epoch(value: Option<&str>) -> DateTime<Utc> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            // Azure reports RFC 1123 dates
            value
                .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        })
        .unwrap_or_default()
}

/// Cap provider error bodies before they end up in messages or logs.
pub(crate) fn trim_api_error(body: &str) -> String {
    const MAX: usize = 300;
    let trimmed = body.trim();
    if trimmed.len() <= MAX {
        trimmed.to_string()
    } else {
        let mut end = MAX;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn provider_id_round_trip() {
        for id in ProviderId::ALL {
            assert_eq!(ProviderId::from_str(id.as_str()).unwrap(), id);
        }
        assert!(matches!(
            ProviderId::from_str("icloud"),
            Err(StorageError::ProviderNotFound(_))
        ));
    }

    #[test]
    fn quota_reconciled_holds_invariant() {
        let q = Quota::reconciled(1000, 200);
        assert_eq!(q.free, 800);
        // Used above total must not underflow
        let q = Quota::reconciled(100, 250);
        assert_eq!(q.free, 0);
    }

    #[test]
    fn dedup_key_is_provider_scoped() {
        let make = |provider: ProviderId, id: &str| CloudFile {
            id: id.to_string(),
            name: "report.pdf".to_string(),
            size: 10,
            modified: Utc::now(),
            provider,
            provider_name: provider.label().to_string(),
            mime_type: None,
            web_link: None,
        };
        let a = make(ProviderId::Google, "x1");
        let b = make(ProviderId::Dropbox, "x1");
        assert_ne!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn upload_target_parses_auto_and_ids() {
        assert_eq!(UploadTarget::parse("auto").unwrap(), UploadTarget::Auto);
        assert_eq!(
            UploadTarget::parse("dropbox").unwrap(),
            UploadTarget::Provider(ProviderId::Dropbox)
        );
        assert!(UploadTarget::parse("ftp").is_err());
    }

    #[test]
    fn payload_from_bytes_guesses_mime() {
        let p = UploadPayload::from_bytes("notes.txt", b"hello".to_vec());
        assert_eq!(p.size, 5);
        assert_eq!(p.mime_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn timestamps_parse_both_wire_formats() {
        let rfc3339 = timestamp_or_epoch(Some("2024-03-01T10:00:00Z"));
        assert_eq!(rfc3339.timestamp(), 1_709_287_200);
        let rfc1123 = timestamp_or_epoch(Some("Fri, 01 Mar 2024 10:00:00 GMT"));
        assert_eq!(rfc1123, rfc3339);
        assert_eq!(timestamp_or_epoch(None), DateTime::<Utc>::default());
        assert_eq!(timestamp_or_epoch(Some("garbage")), DateTime::<Utc>::default());
    }

    #[test]
    fn trim_api_error_caps_length() {
        let long = "x".repeat(1000);
        assert!(trim_api_error(&long).len() < 320);
        assert_eq!(trim_api_error("  short  "), "short");
    }
}
