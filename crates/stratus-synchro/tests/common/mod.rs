// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stratus-synchro integration tests.
//!
//! Provides in-memory fakes of every external contract: the upstream
//! connector (discovery, list/watch, health probe), the storage factory,
//! and the status updater. Tests script the fakes and observe the
//! engine's behavior through them.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use stratus_api::{
    ClusterStatus, GroupVersionResource, RawObject, WatchEvent, Watermark,
};
use stratus_storage::{
    ClusterResourceVersions, CollectionResource, CollectionResourceStorage, QueryOptions,
    ResourceStorage, ResourceStorageConfig, StorageError, StorageFactory, WatermarkMap,
};
use stratus_synchro::config::{ClusterSyncConfig, SyncIntervals};
use stratus_synchro::error::{BoxError, SynchroError};
use stratus_synchro::upstream::{
    ApiResource, ClusterConnector, DiscoveryClient, HealthProbe, HealthProbeOptions, ListOptions,
    ListerWatcher, ListerWatcherFactory, ObjectList, UpstreamError, WatchOptions,
};
use stratus_synchro::ClusterStatusUpdater;

// ============================================================================
// Builders
// ============================================================================

/// A discoverable resource with list+watch verbs.
pub fn api_resource(group: &str, version: &str, resource: &str, kind: &str) -> ApiResource {
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        resource: resource.to_string(),
        kind: kind.to_string(),
        namespaced: true,
        custom: false,
        verbs: BTreeSet::from(["get", "list", "watch"].map(String::from)),
    }
}

/// An upstream object with the given identity and revision.
pub fn raw_object(api_version: &str, kind: &str, uid: &str, name: &str, rv: &str) -> RawObject {
    RawObject {
        uid: uid.to_string(),
        name: name.to_string(),
        namespace: Some("default".to_string()),
        resource_version: rv.to_string(),
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        payload: json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": {"uid": uid, "name": name, "resourceVersion": rv},
        }),
    }
}

/// Intervals short enough for tests.
pub fn test_config() -> ClusterSyncConfig {
    ClusterSyncConfig {
        intervals: SyncIntervals {
            discovery_poll: Duration::from_millis(50),
            health_probe: Duration::from_millis(25),
            health_probe_timeout: Duration::from_millis(500),
        },
        ..ClusterSyncConfig::default()
    }
}

/// Poll until `condition` holds or the timeout elapses.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Upstream fakes
// ============================================================================

/// Scripted discovery client.
#[derive(Default)]
pub struct FakeDiscoveryClient {
    resources: RwLock<Vec<ApiResource>>,
    version: RwLock<String>,
    fail: AtomicBool,
}

impl FakeDiscoveryClient {
    pub fn new(version: &str, resources: Vec<ApiResource>) -> Self {
        Self {
            resources: RwLock::new(resources),
            version: RwLock::new(version.to_string()),
            fail: AtomicBool::new(false),
        }
    }

    /// Replace the discovered surface; the manager picks it up on the
    /// next poll.
    pub fn set_resources(&self, resources: Vec<ApiResource>) {
        *self
            .resources
            .write()
            .unwrap_or_else(PoisonError::into_inner) = resources;
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DiscoveryClient for FakeDiscoveryClient {
    async fn fetch_server_version(&self) -> Result<String, UpstreamError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(UpstreamError::Connect("discovery unavailable".to_string()));
        }
        Ok(self
            .version
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn fetch_api_resources(&self) -> Result<Vec<ApiResource>, UpstreamError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(UpstreamError::Connect("discovery unavailable".to_string()));
        }
        Ok(self
            .resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Scripted lister/watcher over an in-memory object set.
pub struct FakeListerWatcher {
    objects: Mutex<Vec<RawObject>>,
    revision: AtomicU64,
    list_calls: AtomicUsize,
    watch_calls: AtomicUsize,
    live_watches: Arc<AtomicUsize>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<Result<WatchEvent, UpstreamError>>>>,
}

impl Default for FakeListerWatcher {
    fn default() -> Self {
        Self {
            objects: Mutex::new(Vec::new()),
            revision: AtomicU64::new(1),
            list_calls: AtomicUsize::new(0),
            watch_calls: AtomicUsize::new(0),
            live_watches: Arc::new(AtomicUsize::new(0)),
            watchers: Mutex::new(Vec::new()),
        }
    }
}

impl FakeListerWatcher {
    pub fn with_objects(objects: Vec<RawObject>) -> Self {
        let lw = Self::default();
        *lw.objects.lock().unwrap_or_else(PoisonError::into_inner) = objects;
        lw
    }

    pub fn set_objects(&self, objects: Vec<RawObject>) {
        *self.objects.lock().unwrap_or_else(PoisonError::into_inner) = objects;
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    /// Push a watch event to every open stream.
    pub fn send_event(&self, event: WatchEvent) {
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        watchers.retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    /// Watch streams currently being consumed.
    pub fn live_watches(&self) -> usize {
        self.live_watches.load(Ordering::SeqCst)
    }
}

struct WatchGuard(Arc<AtomicUsize>);

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ListerWatcher for FakeListerWatcher {
    async fn list(&self, opts: ListOptions) -> Result<ObjectList, UpstreamError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let objects = self
            .objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let revision = self.revision.load(Ordering::SeqCst).to_string();

        // Honor paging so the page-size hint is exercised.
        let offset: usize = opts
            .continue_token
            .as_deref()
            .and_then(|token| token.parse().ok())
            .unwrap_or(0);
        let limit = if opts.limit > 0 {
            opts.limit as usize
        } else {
            objects.len().max(1)
        };
        let page: Vec<RawObject> = objects.iter().skip(offset).take(limit).cloned().collect();
        let next = offset + page.len();
        let continue_token = (next < objects.len()).then(|| next.to_string());

        Ok(ObjectList {
            items: page,
            resource_version: revision,
            continue_token,
        })
    }

    async fn watch(
        &self,
        _opts: WatchOptions,
    ) -> Result<BoxStream<'static, Result<WatchEvent, UpstreamError>>, UpstreamError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        self.live_watches.fetch_add(1, Ordering::SeqCst);
        let guard = WatchGuard(self.live_watches.clone());
        let stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|event| (event, (rx, guard)))
        });
        Ok(stream.boxed())
    }
}

/// Hands out one [`FakeListerWatcher`] per resource, created on demand.
#[derive(Default)]
pub struct FakeListerWatcherFactory {
    watchers: Mutex<HashMap<GroupVersionResource, Arc<FakeListerWatcher>>>,
}

impl FakeListerWatcherFactory {
    /// The lister/watcher the engine got (or will get) for a resource.
    pub fn get(&self, gvr: &GroupVersionResource) -> Arc<FakeListerWatcher> {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(gvr.clone())
            .or_default()
            .clone()
    }
}

impl ListerWatcherFactory for FakeListerWatcherFactory {
    fn for_resource(&self, gvr: &GroupVersionResource) -> Arc<dyn ListerWatcher> {
        self.get(gvr)
    }
}

/// Probe whose verdict tests flip at will.
#[derive(Default)]
pub struct FakeHealthProbe {
    healthy: AtomicBool,
}

impl FakeHealthProbe {
    pub fn healthy() -> Arc<Self> {
        let probe = Self::default();
        probe.healthy.store(true, Ordering::SeqCst);
        Arc::new(probe)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthProbe for FakeHealthProbe {
    async fn check(&self) -> Result<(), UpstreamError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(UpstreamError::Connect("cluster unreachable".to_string()))
        }
    }
}

/// Bundles the upstream fakes behind the connector contract.
pub struct FakeConnector {
    pub discovery: Arc<FakeDiscoveryClient>,
    pub lister_watchers: Arc<FakeListerWatcherFactory>,
    pub events: Arc<FakeListerWatcher>,
    pub probe: Arc<FakeHealthProbe>,
}

impl FakeConnector {
    pub fn new(discovery: FakeDiscoveryClient) -> Arc<Self> {
        Arc::new(Self {
            discovery: Arc::new(discovery),
            lister_watchers: Arc::new(FakeListerWatcherFactory::default()),
            events: Arc::new(FakeListerWatcher::default()),
            probe: FakeHealthProbe::healthy(),
        })
    }
}

impl ClusterConnector for FakeConnector {
    fn discovery_client(&self) -> Result<Arc<dyn DiscoveryClient>, SynchroError> {
        Ok(self.discovery.clone())
    }

    fn lister_watcher_factory(&self) -> Result<Arc<dyn ListerWatcherFactory>, SynchroError> {
        Ok(self.lister_watchers.clone())
    }

    fn events_lister_watcher(&self) -> Result<Arc<dyn ListerWatcher>, SynchroError> {
        Ok(self.events.clone())
    }

    fn health_probe(
        &self,
        _options: &HealthProbeOptions,
    ) -> Result<Arc<dyn HealthProbe>, SynchroError> {
        Ok(self.probe.clone())
    }
}

// ============================================================================
// Storage fakes
// ============================================================================

/// One recorded storage operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    Create(String),
    Update(String),
    Delete(String),
    Event(String),
}

/// In-memory resource storage recording every operation.
pub struct MemoryResourceStorage {
    config: ResourceStorageConfig,
    pub objects: Mutex<HashMap<String, RawObject>>,
    pub ops: Mutex<Vec<StorageOp>>,
    fail_writes: AtomicBool,
    fail_recoverable: AtomicBool,
}

impl MemoryResourceStorage {
    fn new(config: ResourceStorageConfig) -> Self {
        Self {
            config,
            objects: Mutex::new(HashMap::new()),
            ops: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            fail_recoverable: AtomicBool::new(false),
        }
    }

    /// Make writes fail; recoverable or not.
    pub fn set_fail_writes(&self, fail: bool, recoverable: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
        self.fail_recoverable.store(recoverable, Ordering::SeqCst);
    }

    pub fn recorded_ops(&self) -> Vec<StorageOp> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn object_count(&self) -> usize {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn write_gate(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            let err = std::io::Error::other("scripted write failure");
            if self.fail_recoverable.load(Ordering::SeqCst) {
                return Err(StorageError::recoverable(err));
            }
            return Err(StorageError::internal(err));
        }
        Ok(())
    }

    fn record(&self, op: StorageOp) {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(op);
    }
}

#[async_trait]
impl ResourceStorage for MemoryResourceStorage {
    fn storage_config(&self) -> ResourceStorageConfig {
        self.config.clone()
    }

    async fn get(
        &self,
        _cluster: &str,
        _namespace: Option<&str>,
        name: &str,
    ) -> Result<RawObject, StorageError> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|obj| obj.name == name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn list(&self, _opts: &QueryOptions) -> Result<Vec<RawObject>, StorageError> {
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    async fn watch(
        &self,
        _opts: &QueryOptions,
    ) -> Result<BoxStream<'static, WatchEvent>, StorageError> {
        Ok(futures::stream::empty().boxed())
    }

    async fn create(&self, _cluster: &str, obj: &RawObject) -> Result<(), StorageError> {
        self.write_gate()?;
        self.record(StorageOp::Create(obj.uid.clone()));
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(obj.uid.clone(), obj.clone());
        Ok(())
    }

    async fn update(&self, _cluster: &str, obj: &RawObject) -> Result<(), StorageError> {
        self.write_gate()?;
        self.record(StorageOp::Update(obj.uid.clone()));
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(obj.uid.clone(), obj.clone());
        Ok(())
    }

    fn convert_deleted_object(&self, obj: RawObject) -> Result<RawObject, StorageError> {
        Ok(obj)
    }

    async fn delete(&self, _cluster: &str, obj: &RawObject) -> Result<(), StorageError> {
        self.write_gate()?;
        self.record(StorageOp::Delete(obj.uid.clone()));
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&obj.uid);
        Ok(())
    }

    async fn record_event(&self, _cluster: &str, event: &RawObject) -> Result<(), StorageError> {
        self.write_gate()?;
        self.record(StorageOp::Event(event.uid.clone()));
        Ok(())
    }
}

/// In-memory storage factory recording clusters, storages and cleans.
#[derive(Default)]
pub struct MemoryStorageFactory {
    pub prepared: Mutex<Vec<String>>,
    pub storages: Mutex<HashMap<GroupVersionResource, Arc<MemoryResourceStorage>>>,
    pub cleaned: Mutex<Vec<GroupVersionResource>>,
    seeded_versions: Mutex<HashMap<GroupVersionResource, HashMap<String, Watermark>>>,
    fail_cleans: Mutex<HashSet<GroupVersionResource>>,
    fail_new_storage: Mutex<HashSet<GroupVersionResource>>,
    fail_resource_versions: AtomicBool,
}

impl MemoryStorageFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed watermarks returned by `resource_versions` (warm restart).
    pub fn seed_versions(&self, gvr: GroupVersionResource, versions: HashMap<String, Watermark>) {
        self.seeded_versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(gvr, versions);
    }

    /// Make `clean_cluster_resource` fail for a resource.
    pub fn fail_clean(&self, gvr: GroupVersionResource) {
        self.fail_cleans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(gvr);
    }

    /// Make `new_resource_storage` fail for a resource.
    pub fn fail_new_storage(&self, gvr: GroupVersionResource) {
        self.fail_new_storage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(gvr);
    }

    pub fn set_fail_resource_versions(&self, fail: bool) {
        self.fail_resource_versions.store(fail, Ordering::SeqCst);
    }

    /// The storage created for a resource, if any.
    pub fn storage(&self, gvr: &GroupVersionResource) -> Option<Arc<MemoryResourceStorage>> {
        self.storages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(gvr)
            .cloned()
    }

    pub fn clean_calls(&self, gvr: &GroupVersionResource) -> usize {
        self.cleaned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|cleaned| *cleaned == gvr)
            .count()
    }
}

#[async_trait]
impl StorageFactory for MemoryStorageFactory {
    fn supported_request_verbs(&self) -> Vec<String> {
        vec!["get".to_string(), "list".to_string(), "watch".to_string()]
    }

    async fn prepare_cluster(&self, cluster: &str) -> Result<(), StorageError> {
        let mut prepared = self.prepared.lock().unwrap_or_else(PoisonError::into_inner);
        if !prepared.iter().any(|name| name == cluster) {
            prepared.push(cluster.to_string());
        }
        Ok(())
    }

    async fn resource_versions(
        &self,
        _cluster: &str,
    ) -> Result<HashMap<GroupVersionResource, ClusterResourceVersions>, StorageError> {
        if self.fail_resource_versions.load(Ordering::SeqCst) {
            return Err(StorageError::recoverable(std::io::Error::other(
                "storage warming up",
            )));
        }
        Ok(self
            .seeded_versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(gvr, versions)| {
                (
                    gvr.clone(),
                    ClusterResourceVersions {
                        resources: WatermarkMap::from_map(versions.clone()),
                        events: WatermarkMap::new(),
                    },
                )
            })
            .collect())
    }

    async fn collection_resources(&self) -> Result<Vec<CollectionResource>, StorageError> {
        Ok(Vec::new())
    }

    async fn new_resource_storage(
        &self,
        config: ResourceStorageConfig,
    ) -> Result<Arc<dyn ResourceStorage>, StorageError> {
        let gvr = config.group_version_resource.clone();
        if self
            .fail_new_storage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&gvr)
        {
            return Err(StorageError::Configuration(format!(
                "no table for {gvr}"
            )));
        }
        let storage = Arc::new(MemoryResourceStorage::new(config));
        self.storages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(gvr, storage.clone());
        Ok(storage)
    }

    async fn new_collection_resource_storage(
        &self,
        _cr: &CollectionResource,
    ) -> Result<Arc<dyn CollectionResourceStorage>, StorageError> {
        Err(StorageError::Configuration(
            "collection resources not supported in tests".to_string(),
        ))
    }

    async fn clean_cluster(&self, _cluster: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn clean_cluster_resource(
        &self,
        _cluster: &str,
        gvr: &GroupVersionResource,
    ) -> Result<(), StorageError> {
        self.cleaned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(gvr.clone());
        if self
            .fail_cleans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(gvr)
        {
            return Err(StorageError::internal(std::io::Error::other(
                "scripted clean failure",
            )));
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

// ============================================================================
// Status updater fake
// ============================================================================

/// Collects every published status document.
#[derive(Default)]
pub struct RecordingStatusUpdater {
    pub statuses: Mutex<Vec<ClusterStatus>>,
    fail: AtomicBool,
}

impl RecordingStatusUpdater {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<ClusterStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn published_count(&self) -> usize {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn latest(&self) -> Option<ClusterStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

#[async_trait]
impl ClusterStatusUpdater for RecordingStatusUpdater {
    async fn update_cluster_status(
        &self,
        _name: &str,
        status: &ClusterStatus,
    ) -> Result<(), BoxError> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(status.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(Box::new(std::io::Error::other("scripted updater failure")));
        }
        Ok(())
    }
}

// ============================================================================
// Status document helpers
// ============================================================================

/// The sync condition for a (group, resource, version) triple in a
/// published status document.
pub fn find_condition<'a>(
    status: &'a ClusterStatus,
    group: &str,
    resource: &str,
    version: &str,
) -> Option<&'a stratus_api::ClusterResourceSyncCondition> {
    status
        .sync_resources
        .iter()
        .find(|g| g.group == group)?
        .resources
        .iter()
        .find(|r| r.name == resource)?
        .sync_conditions
        .iter()
        .find(|c| c.version == version)
}
