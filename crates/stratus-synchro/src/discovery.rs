// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dynamic discovery of the upstream API surface.
//!
//! The manager periodically polls the upstream for its API groups and
//! resource lists, publishes an immutable snapshot, and wakes the plan
//! refresher whenever the surface changes. A transient poll failure
//! keeps the last snapshot; the failure is visible through the health
//! checker, not here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stratus_api::{GroupResource, GroupVersionResource};

use crate::upstream::{ApiResource, DiscoveryClient, UpstreamError};

/// Handler invoked (cheaply) whenever the discovered surface mutates.
pub type ResourceMutationHandler = Arc<dyn Fn() + Send + Sync>;

/// Hook fired once, after the first successful snapshot.
pub type AfterStartHook = Box<dyn FnOnce() + Send>;

/// Handlers wired in before the manager starts.
pub struct PrepareConfig {
    /// Invoked on every surface mutation; must be cheap.
    pub resource_mutation_handler: ResourceMutationHandler,
    /// Invoked once after the first successful snapshot.
    pub after_start: AfterStartHook,
}

/// One resource in the discovered surface, across its versions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiscoveredResource {
    /// Object kind.
    pub kind: String,
    /// Whether objects live in namespaces.
    pub namespaced: bool,
    /// Whether this is a custom (operator-registered) resource.
    pub custom: bool,
    /// version → verbs served for that version.
    pub versions: BTreeMap<String, BTreeSet<String>>,
}

/// An immutable snapshot of the upstream API surface.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiscoverySnapshot {
    resources: BTreeMap<GroupResource, DiscoveredResource>,
}

impl DiscoverySnapshot {
    /// Build a snapshot from a flat discovery response.
    pub fn from_api_resources(resources: &[ApiResource]) -> Self {
        let mut map: BTreeMap<GroupResource, DiscoveredResource> = BTreeMap::new();
        for res in resources {
            let entry = map
                .entry(GroupResource::new(&*res.group, &*res.resource))
                .or_default();
            entry.kind = res.kind.clone();
            entry.namespaced = res.namespaced;
            entry.custom = res.custom;
            entry
                .versions
                .insert(res.version.clone(), res.verbs.clone());
        }
        Self { resources: map }
    }

    /// Look up one resource.
    pub fn get(&self, gr: &GroupResource) -> Option<&DiscoveredResource> {
        self.resources.get(gr)
    }

    /// Every resource of one group, in stable order.
    pub fn resources_in_group<'a>(
        &'a self,
        group: &'a str,
    ) -> impl Iterator<Item = (&'a GroupResource, &'a DiscoveredResource)> {
        self.resources.iter().filter(move |(gr, _)| gr.group == group)
    }

    /// Every custom resource, in stable order.
    pub fn custom_resources(
        &self,
    ) -> impl Iterator<Item = (&GroupResource, &DiscoveredResource)> {
        self.resources.iter().filter(|(_, info)| info.custom)
    }

    /// Whether a resource version serves both `list` and `watch`.
    pub fn supports_list_watch(&self, gvr: &GroupVersionResource) -> bool {
        self.get(&gvr.group_resource())
            .and_then(|info| info.versions.get(&gvr.version))
            .map(|verbs| verbs.contains("list") && verbs.contains("watch"))
            .unwrap_or(false)
    }

    /// Number of discovered (group, resource) pairs.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether nothing has been discovered.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Tracks the upstream API surface for one cluster.
pub struct DynamicDiscoveryManager {
    cluster: String,
    client: Arc<dyn DiscoveryClient>,
    poll_interval: Duration,

    prepared: AtomicBool,
    mutation_handler: RwLock<Option<ResourceMutationHandler>>,
    after_start: Mutex<Option<AfterStartHook>>,

    snapshot: RwLock<Arc<DiscoverySnapshot>>,
    server_version: RwLock<String>,
}

impl DynamicDiscoveryManager {
    /// Create a manager; nothing is polled until [`start`](Self::start).
    pub fn new(cluster: &str, client: Arc<dyn DiscoveryClient>, poll_interval: Duration) -> Self {
        Self {
            cluster: cluster.to_string(),
            client,
            poll_interval,
            prepared: AtomicBool::new(false),
            mutation_handler: RwLock::new(None),
            after_start: Mutex::new(None),
            snapshot: RwLock::new(Arc::new(DiscoverySnapshot::default())),
            server_version: RwLock::new(String::new()),
        }
    }

    /// Wire in the mutation handler and the after-start hook.
    ///
    /// Only the first call per lifetime takes effect.
    pub fn prepare(&self, config: PrepareConfig) {
        if self.prepared.swap(true, Ordering::SeqCst) {
            warn!(cluster = %self.cluster, "discovery manager already prepared, ignoring");
            return;
        }
        *self
            .mutation_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(config.resource_mutation_handler);
        *self
            .after_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(config.after_start);
    }

    /// The last-seen upstream server version.
    pub fn server_version(&self) -> String {
        self.server_version
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The current surface snapshot.
    pub fn snapshot(&self) -> Arc<DiscoverySnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Poll the upstream until the token fires.
    ///
    /// The first successful poll fires the after-start hook; later
    /// invocations (the runner restarts discovery on every healthy
    /// transition) reuse the already-consumed hook slot and skip it.
    pub async fn start(&self, stop: CancellationToken) {
        debug!(cluster = %self.cluster, "dynamic discovery manager started");
        loop {
            match self.refresh().await {
                Ok(changed) => {
                    if changed {
                        if let Some(handler) = self
                            .mutation_handler
                            .read()
                            .unwrap_or_else(PoisonError::into_inner)
                            .clone()
                        {
                            handler();
                        }
                    }
                    let hook = self
                        .after_start
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    if let Some(hook) = hook {
                        hook();
                    }
                }
                Err(err) => {
                    // Keep the last snapshot; reachability is the health
                    // checker's verdict to make.
                    warn!(cluster = %self.cluster, error = %err, "discovery poll failed");
                }
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        debug!(cluster = %self.cluster, "dynamic discovery manager stopped");
    }

    /// Poll once; returns whether the surface changed.
    async fn refresh(&self) -> Result<bool, UpstreamError> {
        let version = self.client.fetch_server_version().await?;
        let resources = self.client.fetch_api_resources().await?;
        let fresh = Arc::new(DiscoverySnapshot::from_api_resources(&resources));

        *self
            .server_version
            .write()
            .unwrap_or_else(PoisonError::into_inner) = version;

        let changed = {
            let mut current = self
                .snapshot
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if **current == *fresh {
                false
            } else {
                *current = fresh.clone();
                true
            }
        };
        if changed {
            info!(
                cluster = %self.cluster,
                resources = fresh.len(),
                "discovered resource surface changed"
            );
        }
        Ok(changed)
    }
}
