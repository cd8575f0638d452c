//! Application context
//!
//! One explicitly constructed object wiring configuration, credential
//! storage and the storage manager together. Consumers (CLI entry point,
//! service handler, test harness) receive it by value or reference; there
//! is no ambient global state.

use std::sync::Arc;

use crate::config::{self, AppConfig};
use crate::coordinator::StorageManager;
use crate::credentials::{CredentialStore, FileCredentialStore};
use crate::providers::{
    AzureBlobAdapter, DropboxAdapter, GoogleDriveAdapter, OneDriveAdapter, StorageAdapter,
    StorageError,
};

/// Everything a consumer needs to drive the aggregated storage surface.
pub struct AppContext {
    pub config: AppConfig,
    pub manager: StorageManager,
}

impl AppContext {
    /// Build a context from explicit configuration and credential storage.
    ///
    /// The adapter registry is created here, once, in the fixed iteration
    /// order; nothing is added or removed afterwards.
    pub fn new(config: AppConfig, store: Arc<dyn CredentialStore>) -> Self {
        let adapters: Vec<Box<dyn StorageAdapter>> = vec![
            Box::new(GoogleDriveAdapter::new(
                config.google.clone(),
                Arc::clone(&store),
            )),
            Box::new(OneDriveAdapter::new(
                config.onedrive.clone(),
                Arc::clone(&store),
            )),
            Box::new(AzureBlobAdapter::new(config.azure.clone())),
            Box::new(DropboxAdapter::new(config.dropbox.clone(), store)),
        ];

        Self {
            manager: StorageManager::new(adapters),
            config,
        }
    }

    /// Build a context from the default config file and file-backed
    /// credential store.
    pub fn bootstrap() -> Result<Self, StorageError> {
        let config = config::load_config();
        let store = Arc::new(FileCredentialStore::open_default()?);
        Ok(Self::new(config, store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::providers::ProviderId;

    #[tokio::test]
    async fn context_registers_all_providers_in_order() {
        let ctx = AppContext::new(AppConfig::default(), Arc::new(MemoryCredentialStore::new()));
        let status = ctx.manager.get_providers_status().await;
        let ids: Vec<ProviderId> = status.iter().map(|s| s.id).collect();
        assert_eq!(ids, ProviderId::ALL.to_vec());
        assert!(status.iter().all(|s| !s.connected));
    }

    #[tokio::test]
    async fn empty_config_fails_every_init_without_aborting() {
        let ctx = AppContext::new(AppConfig::default(), Arc::new(MemoryCredentialStore::new()));
        let results = ctx.manager.init().await;
        assert_eq!(results.len(), 4);
        assert!(results.values().all(|ok| !ok));
    }
}
