//! Storage coordinator
//!
//! `StorageManager` composes the provider adapters into one logical storage
//! surface: aggregated listings, cross-provider search with deduplication,
//! combined quota, and upload-target selection. Fan-out operations gather
//! every adapter's outcome and isolate per-provider failures; one failing
//! backend never aborts its siblings.

use futures_util::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::providers::types::{
    CloudFile, ConnectOutcome, DownloadOutcome, ProgressFn, ProviderId, ProviderStatus, Quota,
    StorageError, TotalQuota, UploadOutcome, UploadPayload, UploadTarget,
};
use crate::providers::{StorageAdapter, DEFAULT_LIST_LIMIT};

/// One registry entry. The mutex serializes state-changing calls per
/// adapter; fan-out stays concurrent across adapters.
struct AdapterSlot {
    id: ProviderId,
    adapter: Arc<Mutex<Box<dyn StorageAdapter>>>,
}

/// Aggregates all provider adapters behind one interface.
///
/// The registry is fixed at construction: adapters are never added or
/// removed at runtime, only connected and disconnected. Iteration order is
/// the construction order and is the tie-break order for upload-target
/// selection.
pub struct StorageManager {
    slots: Vec<AdapterSlot>,
    /// Last full listing; local-search fallback and the empty-query result.
    /// Opportunistic snapshot, replaced on every `get_all_files`.
    snapshot: RwLock<Vec<CloudFile>>,
}

impl StorageManager {
    pub fn new(adapters: Vec<Box<dyn StorageAdapter>>) -> Self {
        let slots = adapters
            .into_iter()
            .map(|adapter| AdapterSlot {
                id: adapter.provider_id(),
                adapter: Arc::new(Mutex::new(adapter)),
            })
            .collect();
        Self {
            slots,
            snapshot: RwLock::new(Vec::new()),
        }
    }

    fn find_slot(&self, id: ProviderId) -> Option<&AdapterSlot> {
        self.slots.iter().find(|slot| slot.id == id)
    }

    fn resolve(&self, id: &str) -> Result<&AdapterSlot, StorageError> {
        let provider = ProviderId::from_str(id)?;
        self.find_slot(provider)
            .ok_or_else(|| StorageError::ProviderNotFound(id.to_string()))
    }

    /// Initialize every adapter independently; one failure never prevents
    /// the others from initializing. Returns per-provider success flags for
    /// diagnostic display.
    pub async fn init(&self) -> BTreeMap<ProviderId, bool> {
        let futures = self.slots.iter().map(|slot| async move {
            let mut adapter = slot.adapter.lock().await;
            match adapter.init().await {
                Ok(()) => (slot.id, true),
                Err(e) => {
                    warn!("{} init failed: {}", slot.id.label(), e);
                    (slot.id, false)
                }
            }
        });
        join_all(futures).await.into_iter().collect()
    }

    pub async fn connect_provider(&self, id: &str) -> Result<ConnectOutcome, StorageError> {
        let slot = self.resolve(id)?;
        let mut adapter = slot.adapter.lock().await;
        adapter.connect().await
    }

    pub async fn disconnect_provider(&self, id: &str) -> Result<(), StorageError> {
        let slot = self.resolve(id)?;
        let mut adapter = slot.adapter.lock().await;
        adapter.disconnect().await
    }

    pub async fn is_provider_connected(&self, id: &str) -> bool {
        match ProviderId::from_str(id).ok().and_then(|p| self.find_slot(p)) {
            Some(slot) => slot.adapter.lock().await.is_connected(),
            None => false,
        }
    }

    /// Fetch every connected adapter's listing concurrently, newest first.
    ///
    /// Disconnected adapters are skipped; a failing listing contributes an
    /// empty list. The result replaces the local-search snapshot.
    pub async fn get_all_files(&self) -> Vec<CloudFile> {
        let futures = self.slots.iter().map(|slot| async move {
            let mut adapter = slot.adapter.lock().await;
            if !adapter.is_connected() {
                return Vec::new();
            }
            match adapter.list_files(DEFAULT_LIST_LIMIT).await {
                Ok(files) => files,
                Err(e) => {
                    warn!("listing {} failed: {}", slot.id.label(), e);
                    Vec::new()
                }
            }
        });

        let mut all: Vec<CloudFile> = join_all(futures).await.into_iter().flatten().collect();
        // Stable sort: equal timestamps keep registry insertion order
        all.sort_by(|a, b| b.modified.cmp(&a.modified));

        *self.snapshot.write().await = all.clone();
        all
    }

    /// Search across all connected providers and the cached snapshot.
    ///
    /// An empty or whitespace query returns the snapshot unchanged (this is
    /// "show everything", distinct from a search with no results). Results
    /// are deduplicated by `(provider, id)`; the same file surfacing from
    /// both a native search and the snapshot appears once. No ordering
    /// guarantee beyond that.
    pub async fn search_files(&self, query: &str) -> Vec<CloudFile> {
        if query.trim().is_empty() {
            return self.snapshot.read().await.clone();
        }

        let native = join_all(self.slots.iter().map(|slot| async move {
            let mut adapter = slot.adapter.lock().await;
            if !adapter.is_connected() {
                return Vec::new();
            }
            match adapter.search_files(query).await {
                Ok(files) => files,
                Err(e) => {
                    warn!("search on {} failed: {}", slot.id.label(), e);
                    Vec::new()
                }
            }
        }))
        .await;

        let needle = query.to_lowercase();
        let local: Vec<CloudFile> = self
            .snapshot
            .read()
            .await
            .iter()
            .filter(|f| f.name.to_lowercase().contains(&needle))
            .cloned()
            .collect();

        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for file in native.into_iter().flatten().chain(local) {
            if seen.insert(file.dedup_key()) {
                unique.push(file);
            }
        }
        unique
    }

    /// Pick the connected provider with the most free space.
    ///
    /// Strictly-greater comparison: ties keep the first provider in
    /// registry order, and a provider with zero free space is never picked.
    pub async fn get_best_provider_for_upload(&self) -> Option<ProviderId> {
        let mut best = None;
        let mut max_free: u64 = 0;

        for slot in &self.slots {
            let adapter = slot.adapter.lock().await;
            if !adapter.is_connected() {
                continue;
            }
            let free = adapter.get_quota().free;
            if free > max_free {
                max_free = free;
                best = Some(slot.id);
            }
        }

        best
    }

    /// Upload to an explicit provider or the auto-selected best target.
    ///
    /// The capacity pre-check against the resolved adapter's quota happens
    /// before any network call; the adapter's own hard size ceiling is
    /// enforced independently inside the adapter.
    pub async fn upload_file(
        &self,
        payload: &UploadPayload,
        target: UploadTarget,
        on_progress: Option<&ProgressFn>,
    ) -> Result<UploadOutcome, StorageError> {
        let provider = match target {
            UploadTarget::Auto => self
                .get_best_provider_for_upload()
                .await
                .ok_or(StorageError::NoProviderAvailable)?,
            UploadTarget::Provider(id) => id,
        };

        let slot = self
            .find_slot(provider)
            .ok_or_else(|| StorageError::ProviderNotFound(provider.to_string()))?;

        let mut adapter = slot.adapter.lock().await;
        if !adapter.is_connected() {
            return Err(StorageError::ProviderNotConnected(adapter.display_name()));
        }

        let quota = adapter.get_quota();
        if payload.size > quota.free {
            return Err(StorageError::InsufficientQuota {
                provider: adapter.display_name(),
                needed: payload.size,
                free: quota.free,
            });
        }

        info!("uploading {} ({} bytes) to {}", payload.name, payload.size, provider);
        adapter.upload_file(payload, on_progress).await
    }

    /// Routing-only download delegate.
    pub async fn download_file(
        &self,
        id: &str,
        file_id: &str,
        dest: &Path,
    ) -> Result<DownloadOutcome, StorageError> {
        let slot = self.resolve(id)?;
        let mut adapter = slot.adapter.lock().await;
        if !adapter.is_connected() {
            return Err(StorageError::ProviderNotConnected(adapter.display_name()));
        }
        adapter.download_file(file_id, dest).await
    }

    /// Sum quota over connected adapters only.
    pub async fn get_total_quota(&self) -> TotalQuota {
        let mut total: u64 = 0;
        let mut used: u64 = 0;
        let mut free: u64 = 0;

        for slot in &self.slots {
            let adapter = slot.adapter.lock().await;
            if !adapter.is_connected() {
                continue;
            }
            let quota = adapter.get_quota();
            total += quota.total;
            used += quota.used;
            free += quota.free;
        }

        TotalQuota {
            total,
            used,
            free,
            percentage: if total > 0 {
                used as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    /// Quota for one provider; zeroed for unknown or disconnected
    /// providers so displays never fail on a not-yet-connected account.
    pub async fn get_provider_quota(&self, id: &str) -> Quota {
        match ProviderId::from_str(id).ok().and_then(|p| self.find_slot(p)) {
            Some(slot) => {
                let adapter = slot.adapter.lock().await;
                if adapter.is_connected() {
                    adapter.get_quota()
                } else {
                    Quota::zero()
                }
            }
            None => Quota::zero(),
        }
    }

    /// Full registry snapshot for display, independent of connection state.
    pub async fn get_providers_status(&self) -> Vec<ProviderStatus> {
        let mut status = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let adapter = slot.adapter.lock().await;
            status.push(ProviderStatus {
                id: slot.id,
                name: adapter.display_name(),
                connected: adapter.is_connected(),
                quota: adapter.get_quota(),
            });
        }
        status
    }

    /// Refresh every connected adapter's quota concurrently; individual
    /// failures are logged and never cancel the sibling refreshes.
    pub async fn refresh_all_quotas(&self) {
        let futures = self.slots.iter().map(|slot| async move {
            let mut adapter = slot.adapter.lock().await;
            if !adapter.is_connected() {
                return;
            }
            if let Err(e) = adapter.update_quota().await {
                warn!("quota refresh for {} failed: {}", slot.id.label(), e);
            }
        });
        join_all(futures).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn file(provider: ProviderId, id: &str, name: &str, modified: i64) -> CloudFile {
        CloudFile {
            id: id.to_string(),
            name: name.to_string(),
            size: 1,
            modified: ts(modified),
            provider,
            provider_name: provider.label().to_string(),
            mime_type: None,
            web_link: None,
        }
    }

    /// Scriptable in-memory adapter for coordinator tests.
    struct MockAdapter {
        id: ProviderId,
        connected: bool,
        quota: Quota,
        files: Vec<CloudFile>,
        search_results: Vec<CloudFile>,
        fail_init: bool,
        fail_list: bool,
        fail_search: bool,
        fail_revoke: bool,
        fail_update: bool,
        refreshed_quota: Option<Quota>,
        uploads: Arc<AtomicUsize>,
    }

    impl MockAdapter {
        fn new(id: ProviderId) -> Self {
            Self {
                id,
                connected: false,
                quota: Quota::zero(),
                files: Vec::new(),
                search_results: Vec::new(),
                fail_init: false,
                fail_list: false,
                fail_search: false,
                fail_revoke: false,
                fail_update: false,
                refreshed_quota: None,
                uploads: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn connected(mut self, quota: Quota) -> Self {
            self.connected = true;
            self.quota = quota;
            self
        }

        fn with_files(mut self, files: Vec<CloudFile>) -> Self {
            self.files = files;
            self
        }

        fn with_search_results(mut self, files: Vec<CloudFile>) -> Self {
            self.search_results = files;
            self
        }

        fn upload_counter(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.uploads)
        }
    }

    #[async_trait]
    impl StorageAdapter for MockAdapter {
        fn provider_id(&self) -> ProviderId {
            self.id
        }

        fn display_name(&self) -> String {
            self.id.label().to_string()
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn init(&mut self) -> Result<(), StorageError> {
            if self.fail_init {
                return Err(StorageError::ConfigurationMissing(format!(
                    "{}: section missing",
                    self.id
                )));
            }
            Ok(())
        }

        async fn connect(&mut self) -> Result<ConnectOutcome, StorageError> {
            self.connected = true;
            Ok(ConnectOutcome {
                provider: self.id,
                message: "connected".to_string(),
            })
        }

        async fn disconnect(&mut self) -> Result<(), StorageError> {
            if self.fail_revoke {
                // Remote revocation failed; local state is cleared anyway
                warn!("{}: simulated revoke transport error", self.id);
            }
            self.connected = false;
            self.quota = Quota::zero();
            Ok(())
        }

        async fn list_files(&mut self, max_results: usize) -> Result<Vec<CloudFile>, StorageError> {
            if !self.connected {
                return Ok(Vec::new());
            }
            if self.fail_list {
                return Err(StorageError::RemoteCallFailed("listing exploded".to_string()));
            }
            Ok(self.files.iter().take(max_results).cloned().collect())
        }

        async fn search_files(&mut self, query: &str) -> Result<Vec<CloudFile>, StorageError> {
            if !self.connected || query.trim().is_empty() {
                return Ok(Vec::new());
            }
            if self.fail_search {
                return Err(StorageError::RemoteCallFailed("search exploded".to_string()));
            }
            Ok(self.search_results.clone())
        }

        async fn upload_file(
            &mut self,
            payload: &UploadPayload,
            on_progress: Option<&ProgressFn>,
        ) -> Result<UploadOutcome, StorageError> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            if let Some(cb) = on_progress {
                cb(0.0);
                cb(100.0);
            }
            Ok(UploadOutcome {
                provider: self.id,
                file_id: format!("up-{}", payload.name),
                message: "uploaded".to_string(),
            })
        }

        async fn download_file(
            &mut self,
            _file_id: &str,
            dest: &Path,
        ) -> Result<DownloadOutcome, StorageError> {
            Ok(DownloadOutcome {
                provider: self.id,
                path: dest.to_path_buf(),
                message: "saved".to_string(),
            })
        }

        fn get_quota(&self) -> Quota {
            self.quota
        }

        async fn update_quota(&mut self) -> Result<(), StorageError> {
            if !self.connected {
                return Ok(());
            }
            if self.fail_update {
                return Err(StorageError::RemoteCallFailed("quota exploded".to_string()));
            }
            if let Some(q) = self.refreshed_quota {
                self.quota = q;
            }
            Ok(())
        }
    }

    fn manager(adapters: Vec<MockAdapter>) -> StorageManager {
        StorageManager::new(
            adapters
                .into_iter()
                .map(|a| Box::new(a) as Box<dyn StorageAdapter>)
                .collect(),
        )
    }

    #[tokio::test]
    async fn all_files_is_union_of_connected_sorted_newest_first() {
        let m = manager(vec![
            MockAdapter::new(ProviderId::Google)
                .connected(Quota::reconciled(100, 0))
                .with_files(vec![
                    file(ProviderId::Google, "g1", "old.txt", 100),
                    file(ProviderId::Google, "g2", "new.txt", 300),
                ]),
            MockAdapter::new(ProviderId::OneDrive)
                .connected(Quota::reconciled(100, 0))
                .with_files(vec![file(ProviderId::OneDrive, "o1", "mid.txt", 200)]),
            // Disconnected: its files must not appear and cause no error
            MockAdapter::new(ProviderId::Dropbox)
                .with_files(vec![file(ProviderId::Dropbox, "d1", "hidden.txt", 999)]),
        ]);

        let files = m.get_all_files().await;
        let ids: Vec<&str> = files.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["g2", "o1", "g1"]);
    }

    #[tokio::test]
    async fn all_files_equal_timestamps_keep_registry_order() {
        let m = manager(vec![
            MockAdapter::new(ProviderId::Google)
                .connected(Quota::reconciled(100, 0))
                .with_files(vec![file(ProviderId::Google, "g1", "a.txt", 500)]),
            MockAdapter::new(ProviderId::Azure)
                .connected(Quota::reconciled(100, 0))
                .with_files(vec![file(ProviderId::Azure, "z1", "b.txt", 500)]),
        ]);

        let files = m.get_all_files().await;
        assert_eq!(files[0].provider, ProviderId::Google);
        assert_eq!(files[1].provider, ProviderId::Azure);
    }

    #[tokio::test]
    async fn all_files_isolates_one_failing_listing() {
        let mut failing = MockAdapter::new(ProviderId::Google)
            .connected(Quota::reconciled(100, 0))
            .with_files(vec![file(ProviderId::Google, "g1", "a.txt", 100)]);
        failing.fail_list = true;

        let m = manager(vec![
            failing,
            MockAdapter::new(ProviderId::Dropbox)
                .connected(Quota::reconciled(100, 0))
                .with_files(vec![file(ProviderId::Dropbox, "d1", "b.txt", 100)]),
        ]);

        let files = m.get_all_files().await;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].provider, ProviderId::Dropbox);
    }

    #[tokio::test]
    async fn blank_query_returns_snapshot_unchanged() {
        let m = manager(vec![MockAdapter::new(ProviderId::Google)
            .connected(Quota::reconciled(100, 0))
            .with_files(vec![
                file(ProviderId::Google, "g1", "report.pdf", 200),
                file(ProviderId::Google, "g2", "holiday.png", 100),
            ])]);

        let snapshot = m.get_all_files().await;
        for query in ["", "   ", "\t"] {
            let result = m.search_files(query).await;
            let ids: Vec<_> = result.iter().map(|f| f.id.clone()).collect();
            let expected: Vec<_> = snapshot.iter().map(|f| f.id.clone()).collect();
            assert_eq!(ids, expected, "query {:?}", query);
        }
    }

    #[tokio::test]
    async fn search_dedups_native_and_cache_overlap() {
        // Native search returns the same file that the snapshot matches
        let shared = file(ProviderId::Google, "g1", "report.pdf", 100);
        let m = manager(vec![MockAdapter::new(ProviderId::Google)
            .connected(Quota::reconciled(100, 0))
            .with_files(vec![shared.clone()])
            .with_search_results(vec![shared.clone()])]);

        m.get_all_files().await;
        let results = m.search_files("report").await;
        assert_eq!(results.len(), 1);

        let mut keys = HashSet::new();
        assert!(results.iter().all(|f| keys.insert(f.dedup_key())));
    }

    #[tokio::test]
    async fn search_keeps_same_named_files_from_different_providers() {
        let m = manager(vec![
            MockAdapter::new(ProviderId::Google)
                .connected(Quota::reconciled(100, 0))
                .with_search_results(vec![file(ProviderId::Google, "x", "report.pdf", 100)]),
            MockAdapter::new(ProviderId::Dropbox)
                .connected(Quota::reconciled(100, 0))
                .with_search_results(vec![file(ProviderId::Dropbox, "x", "report.pdf", 100)]),
        ]);

        let results = m.search_files("report").await;
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn search_survives_native_failure_via_cache() {
        let mut a = MockAdapter::new(ProviderId::Google)
            .connected(Quota::reconciled(100, 0))
            .with_files(vec![file(ProviderId::Google, "g1", "Quarterly-Report.pdf", 100)]);
        a.fail_search = true;

        let m = manager(vec![a]);
        m.get_all_files().await;

        // Native search fails; the case-insensitive cache filter still hits
        let results = m.search_files("report").await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "g1");
    }

    #[tokio::test]
    async fn best_provider_none_when_nothing_connected() {
        let m = manager(vec![
            MockAdapter::new(ProviderId::Google),
            MockAdapter::new(ProviderId::Dropbox),
        ]);
        assert_eq!(m.get_best_provider_for_upload().await, None);
    }

    #[tokio::test]
    async fn best_provider_picks_strictly_largest_free() {
        let m = manager(vec![
            MockAdapter::new(ProviderId::Google).connected(Quota::reconciled(1000, 200)),
            MockAdapter::new(ProviderId::OneDrive).connected(Quota::reconciled(500, 100)),
        ]);
        assert_eq!(
            m.get_best_provider_for_upload().await,
            Some(ProviderId::Google)
        );
    }

    #[tokio::test]
    async fn best_provider_tie_keeps_registry_order() {
        let m = manager(vec![
            MockAdapter::new(ProviderId::OneDrive).connected(Quota::reconciled(500, 100)),
            MockAdapter::new(ProviderId::Dropbox).connected(Quota::reconciled(600, 200)),
        ]);
        // Both have free == 400; first in registry order wins
        assert_eq!(
            m.get_best_provider_for_upload().await,
            Some(ProviderId::OneDrive)
        );
    }

    #[tokio::test]
    async fn best_provider_ignores_zero_free_space() {
        let m = manager(vec![
            MockAdapter::new(ProviderId::Google).connected(Quota::reconciled(100, 100))
        ]);
        assert_eq!(m.get_best_provider_for_upload().await, None);
    }

    #[tokio::test]
    async fn auto_upload_without_providers_is_rejected_before_any_call() {
        let a = MockAdapter::new(ProviderId::Google);
        let uploads = a.upload_counter();
        let m = manager(vec![a]);

        let err = m
            .upload_file(
                &UploadPayload::from_bytes("a.txt", vec![0; 10]),
                UploadTarget::Auto,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NoProviderAvailable));
        assert_eq!(uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auto_upload_rejects_when_even_best_provider_is_too_small() {
        // A free=800, B free=400, file of 900 bytes: auto selects A,
        // and the capacity pre-check still rejects it.
        let a = MockAdapter::new(ProviderId::Google).connected(Quota::reconciled(1000, 200));
        let b = MockAdapter::new(ProviderId::OneDrive).connected(Quota::reconciled(500, 100));
        let a_uploads = a.upload_counter();
        let b_uploads = b.upload_counter();
        let m = manager(vec![a, b]);

        let err = m
            .upload_file(
                &UploadPayload::from_bytes("big.bin", vec![0; 900]),
                UploadTarget::Auto,
                None,
            )
            .await
            .unwrap_err();

        match err {
            StorageError::InsufficientQuota { needed, free, .. } => {
                assert_eq!(needed, 900);
                assert_eq!(free, 800);
            }
            other => panic!("expected InsufficientQuota, got {:?}", other),
        }
        assert_eq!(a_uploads.load(Ordering::SeqCst), 0);
        assert_eq!(b_uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn explicit_upload_target_errors_are_routed() {
        let a = MockAdapter::new(ProviderId::Google);
        let uploads = a.upload_counter();
        let m = manager(vec![a]);
        let payload = UploadPayload::from_bytes("a.txt", vec![1, 2, 3]);

        assert!(matches!(
            UploadTarget::parse("box").unwrap_err(),
            StorageError::ProviderNotFound(_)
        ));

        let err = m
            .upload_file(
                &payload,
                UploadTarget::Provider(ProviderId::Google),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ProviderNotConnected(_)));
        assert_eq!(uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_upload_delegates_and_reports_progress() {
        let a = MockAdapter::new(ProviderId::Dropbox).connected(Quota::reconciled(1000, 0));
        let uploads = a.upload_counter();
        let m = manager(vec![a]);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_in_cb = Arc::clone(&seen);
        let progress: ProgressFn = Box::new(move |pct| {
            seen_in_cb.lock().unwrap().push(pct);
        });

        let outcome = m
            .upload_file(
                &UploadPayload::from_bytes("a.txt", vec![0; 10]),
                UploadTarget::Provider(ProviderId::Dropbox),
                Some(&progress),
            )
            .await
            .unwrap();

        assert_eq!(outcome.provider, ProviderId::Dropbox);
        assert_eq!(uploads.load(Ordering::SeqCst), 1);

        let pcts = seen.lock().unwrap().clone();
        assert!(!pcts.is_empty());
        assert!(pcts.windows(2).all(|w| w[0] <= w[1]), "progress not monotonic");
    }

    #[tokio::test]
    async fn download_routing_checks_registry_and_connection() {
        let m = manager(vec![MockAdapter::new(ProviderId::Google)]);
        let dest = std::env::temp_dir().join("unicloud-test-download");

        let err = m.download_file("box", "f1", &dest).await.unwrap_err();
        assert!(matches!(err, StorageError::ProviderNotFound(_)));

        let err = m.download_file("google", "f1", &dest).await.unwrap_err();
        assert!(matches!(err, StorageError::ProviderNotConnected(_)));
    }

    #[tokio::test]
    async fn total_quota_sums_connected_only() {
        let m = manager(vec![
            MockAdapter::new(ProviderId::Google).connected(Quota::reconciled(1000, 200)),
            MockAdapter::new(ProviderId::OneDrive).connected(Quota::reconciled(500, 100)),
            // Disconnected adapter contributes nothing
            MockAdapter::new(ProviderId::Dropbox),
        ]);

        let total = m.get_total_quota().await;
        assert_eq!(total.total, 1500);
        assert_eq!(total.used, 300);
        assert_eq!(total.free, 1200);
        assert!((total.percentage - 20.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn total_quota_with_nothing_connected_is_zeroed() {
        let m = manager(vec![
            MockAdapter::new(ProviderId::Google),
            MockAdapter::new(ProviderId::Azure),
        ]);

        let total = m.get_total_quota().await;
        assert_eq!(total.total, 0);
        assert_eq!(total.used, 0);
        assert_eq!(total.free, 0);
        assert_eq!(total.percentage, 0.0);
    }

    #[tokio::test]
    async fn provider_quota_is_zeroed_for_unknown_and_disconnected() {
        let m = manager(vec![
            MockAdapter::new(ProviderId::Google),
            MockAdapter::new(ProviderId::OneDrive).connected(Quota::reconciled(500, 100)),
        ]);

        assert_eq!(m.get_provider_quota("mega").await, Quota::zero());
        assert_eq!(m.get_provider_quota("google").await, Quota::zero());
        assert_eq!(
            m.get_provider_quota("onedrive").await,
            Quota::reconciled(500, 100)
        );
    }

    #[tokio::test]
    async fn providers_status_covers_full_registry() {
        let m = manager(vec![
            MockAdapter::new(ProviderId::Google).connected(Quota::reconciled(10, 5)),
            MockAdapter::new(ProviderId::OneDrive),
            MockAdapter::new(ProviderId::Azure),
            MockAdapter::new(ProviderId::Dropbox),
        ]);

        let status = m.get_providers_status().await;
        assert_eq!(status.len(), 4);
        assert!(status[0].connected);
        assert_eq!(status[0].name, "Google Drive");
        assert!(!status[1].connected);
        assert_eq!(status[1].quota, Quota::zero());
    }

    #[tokio::test]
    async fn disconnect_clears_state_even_when_revoke_fails() {
        let mut a = MockAdapter::new(ProviderId::Dropbox).connected(Quota::reconciled(100, 10));
        a.fail_revoke = true;
        let m = manager(vec![a]);

        m.disconnect_provider("dropbox").await.unwrap();
        assert!(!m.is_provider_connected("dropbox").await);
        assert_eq!(m.get_provider_quota("dropbox").await, Quota::zero());
    }

    #[tokio::test]
    async fn init_isolates_per_provider_failures() {
        let mut bad = MockAdapter::new(ProviderId::Azure);
        bad.fail_init = true;
        let m = manager(vec![
            MockAdapter::new(ProviderId::Google),
            bad,
            MockAdapter::new(ProviderId::Dropbox),
        ]);

        let results = m.init().await;
        assert_eq!(results[&ProviderId::Google], true);
        assert_eq!(results[&ProviderId::Azure], false);
        assert_eq!(results[&ProviderId::Dropbox], true);
    }

    #[tokio::test]
    async fn connect_and_disconnect_route_by_id() {
        let m = manager(vec![MockAdapter::new(ProviderId::Google)]);

        assert!(matches!(
            m.connect_provider("nope").await.unwrap_err(),
            StorageError::ProviderNotFound(_)
        ));

        let outcome = m.connect_provider("google").await.unwrap();
        assert_eq!(outcome.provider, ProviderId::Google);
        assert!(m.is_provider_connected("google").await);

        m.disconnect_provider("google").await.unwrap();
        assert!(!m.is_provider_connected("google").await);
    }

    #[tokio::test]
    async fn quota_refresh_failure_does_not_block_siblings() {
        let mut failing = MockAdapter::new(ProviderId::Google).connected(Quota::reconciled(100, 0));
        failing.fail_update = true;

        let mut fine = MockAdapter::new(ProviderId::Dropbox).connected(Quota::reconciled(100, 0));
        fine.refreshed_quota = Some(Quota::reconciled(2000, 500));

        let m = manager(vec![failing, fine]);
        m.refresh_all_quotas().await;

        assert_eq!(
            m.get_provider_quota("dropbox").await,
            Quota::reconciled(2000, 500)
        );
        // The failing provider keeps its stale snapshot rather than crashing
        assert_eq!(
            m.get_provider_quota("google").await,
            Quota::reconciled(100, 0)
        );
    }
}
