//! unicloud — unified multi-provider cloud storage
//!
//! Aggregates Google Drive, OneDrive, Azure Blob Storage and Dropbox
//! behind one interface: combined quota, cross-provider listing and
//! search with deduplication, and automatic upload-target selection.
//!
//! The [`coordinator::StorageManager`] owns one adapter per backend, each
//! implementing the [`providers::StorageAdapter`] contract. Construct
//! everything through [`context::AppContext`]; there are no globals.

pub mod config;
pub mod context;
pub mod coordinator;
pub mod credentials;
pub mod providers;

pub use config::AppConfig;
pub use context::AppContext;
pub use coordinator::StorageManager;
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use providers::{
    CloudFile, ConnectOutcome, DownloadOutcome, ProgressFn, ProviderId, ProviderStatus, Quota,
    StorageAdapter, StorageError, TotalQuota, UploadOutcome, UploadPayload, UploadTarget,
};
