//! Storage provider adapters
//!
//! This module provides a unified abstraction layer over the supported
//! cloud storage backends. All adapters implement the `StorageAdapter`
//! trait, allowing the coordinator to aggregate Google Drive, OneDrive,
//! Azure Blob Storage and Dropbox through a common interface.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            StorageAdapter Trait             │
//! │  connect, list, search, upload, quota, ...  │
//! └─────────────────────────────────────────────┘
//!                       │
//!      ┌────────┬───────┴────────┬──────────┐
//!      ▼        ▼                ▼          ▼
//! ┌────────┐ ┌─────────┐ ┌────────────┐ ┌─────────┐
//! │ GDrive │ │ OneDrive│ │ Azure Blob │ │ Dropbox │
//! └────────┘ └─────────┘ └────────────┘ └─────────┘
//! ```

pub mod types;
pub mod oauth;
pub mod google_drive;
pub mod onedrive;
pub mod azure;
pub mod dropbox;

pub use types::*;
pub use google_drive::GoogleDriveAdapter;
pub use onedrive::OneDriveAdapter;
pub use azure::AzureBlobAdapter;
pub use dropbox::DropboxAdapter;
pub use oauth::{OAuthConfig, StoredTokens, TokenManager};

use async_trait::async_trait;
use std::path::Path;

/// Default page size for listings when the caller does not specify one.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Uniform provider capability contract.
///
/// Each backend implements this trait once; the coordinator never branches
/// on provider identity outside adapter construction. State-changing calls
/// take `&mut self`; the coordinator serializes them through a per-adapter
/// mutex so no adapter ever sees two in-flight transitions.
#[async_trait]
pub trait StorageAdapter: Send {
    /// Stable provider identifier
    fn provider_id(&self) -> ProviderId;

    /// Human-readable label for this adapter
    fn display_name(&self) -> String;

    /// Check if currently connected
    fn is_connected(&self) -> bool;

    /// Prepare the adapter: validate configuration and restore a previously
    /// stored credential when one exists. Idempotent; the absence of a
    /// stored credential is the normal unauthenticated starting state, not
    /// an error. Fails only with `ConfigurationMissing`.
    async fn init(&mut self) -> Result<(), StorageError>;

    /// Establish the connection using restored credentials (token exchange
    /// for OAuth providers, connection-string validation for Azure). On
    /// success the adapter is connected and its quota snapshot populated.
    /// Calling while already connected is a no-op.
    async fn connect(&mut self) -> Result<ConnectOutcome, StorageError>;

    /// Best-effort remote credential revocation. Local connection state,
    /// cached credential and quota are cleared even when the revoke call
    /// fails: disconnection is a local-state guarantee.
    async fn disconnect(&mut self) -> Result<(), StorageError>;

    /// List files, bounded to `max_results` where the API supports paging.
    /// Returns an empty list (not an error) when disconnected.
    async fn list_files(&mut self, max_results: usize) -> Result<Vec<CloudFile>, StorageError>;

    /// Provider-native search. Empty list for empty query or disconnected
    /// state. Backends without native search filter their own listing.
    async fn search_files(&mut self, query: &str) -> Result<Vec<CloudFile>, StorageError>;

    /// Upload a file. Adapter-specific hard size ceilings are checked
    /// before any network call; on success the quota snapshot is refreshed.
    async fn upload_file(
        &mut self,
        payload: &UploadPayload,
        on_progress: Option<&ProgressFn>,
    ) -> Result<UploadOutcome, StorageError>;

    /// Resolve an opaque file id and write its content to `dest`.
    async fn download_file(
        &mut self,
        file_id: &str,
        dest: &Path,
    ) -> Result<DownloadOutcome, StorageError>;

    /// Pure read of the last-fetched quota snapshot; no network call.
    fn get_quota(&self) -> Quota;

    /// Refresh the quota snapshot from the remote API. Safe no-op when
    /// disconnected.
    async fn update_quota(&mut self) -> Result<(), StorageError>;
}
