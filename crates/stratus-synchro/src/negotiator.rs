// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource negotiation.
//!
//! The negotiator intersects the operator's desired resource set with
//! the discovered API surface and the resource-config factory, producing
//! a fresh [`GroupResourceStatus`] and the plan: one
//! [`ResourceSyncConfig`] per storage GVR. Given identical inputs the
//! output is identical (stable ordering throughout); the refresh loop
//! relies on this to diff plans cheaply.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use stratus_api::{
    ClusterGroupResources, ClusterResourceSyncCondition, GroupResource, GroupVersionResource,
    InitialListPhase, RawObject, ResourceSyncStatus, SYNCHRO_PENDING_REASON, WILDCARD_RESOURCE,
};
use stratus_storage::ResourceStorageConfig;

use crate::discovery::DynamicDiscoveryManager;
use crate::status::GroupResourceStatus;
use crate::upstream::{ObjectConvertor, UpstreamError};

/// Condition reason: the resource version cannot be list/watched.
pub const UNSUPPORTED_REASON: &str = "Unsupported";
/// Condition reason: the resource-config factory rejected the triple.
pub const INVALID_RESOURCE_CONFIG_REASON: &str = "InvalidResourceConfig";

/// Plan entry: everything needed to run one resource synchro.
#[derive(Clone)]
pub struct ResourceSyncConfig {
    /// The GVR consumed upstream.
    pub sync_resource: GroupVersionResource,
    /// The GVR persisted; differs from `sync_resource` under remapping.
    pub storage_resource: GroupVersionResource,
    /// Object kind.
    pub kind: String,
    /// Conversion applied between sync and storage versions.
    pub convertor: Option<Arc<dyn ObjectConvertor>>,
    /// Configuration handed to the storage factory.
    pub storage_config: ResourceStorageConfig,
    /// Also mirror upstream events for this resource.
    pub sync_events: bool,
}

impl std::fmt::Debug for ResourceSyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSyncConfig")
            .field("sync_resource", &self.sync_resource)
            .field("storage_resource", &self.storage_resource)
            .field("kind", &self.kind)
            .field("convertor", &self.convertor.as_ref().map(|_| "..."))
            .field("sync_events", &self.sync_events)
            .finish()
    }
}

/// Maps a discovered sync triple to its storage configuration.
pub trait ResourceConfigFactory: Send + Sync {
    /// The sync configuration for one discovered resource version.
    fn sync_config(
        &self,
        sync_resource: &GroupVersionResource,
        kind: &str,
        namespaced: bool,
        sync_events: bool,
    ) -> Result<ResourceSyncConfig, UpstreamError>;
}

/// Storage-version remaps for group versions the upstream still serves
/// but the backend persists under their successor.
const LEGACY_STORAGE_VERSIONS: &[((&str, &str, &str), &str)] = &[
    (("batch", "cronjobs", "v1beta1"), "v1"),
    (("policy", "poddisruptionbudgets", "v1beta1"), "v1"),
    (("autoscaling", "horizontalpodautoscalers", "v2beta1"), "v2"),
    (("autoscaling", "horizontalpodautoscalers", "v2beta2"), "v2"),
];

/// Default config factory: identity mapping plus the legacy-version
/// remap table.
#[derive(Debug, Default)]
pub struct DefaultResourceConfigFactory;

impl ResourceConfigFactory for DefaultResourceConfigFactory {
    fn sync_config(
        &self,
        sync_resource: &GroupVersionResource,
        kind: &str,
        namespaced: bool,
        sync_events: bool,
    ) -> Result<ResourceSyncConfig, UpstreamError> {
        let storage_version = LEGACY_STORAGE_VERSIONS
            .iter()
            .find(|((group, resource, version), _)| {
                *group == sync_resource.group
                    && *resource == sync_resource.resource
                    && *version == sync_resource.version
            })
            .map(|(_, storage_version)| *storage_version);

        let (storage_resource, convertor): (_, Option<Arc<dyn ObjectConvertor>>) =
            match storage_version {
                Some(version) => (
                    sync_resource.with_version(version),
                    Some(Arc::new(VersionRewriteConvertor)),
                ),
                None => (sync_resource.clone(), None),
            };

        Ok(ResourceSyncConfig {
            sync_resource: sync_resource.clone(),
            storage_config: ResourceStorageConfig {
                group_version_resource: storage_resource.clone(),
                kind: kind.to_string(),
                namespaced,
            },
            storage_resource,
            kind: kind.to_string(),
            convertor,
            sync_events,
        })
    }
}

/// Rewrites an object's apiVersion to the storage group/version.
///
/// Sufficient for the legacy remaps above, whose schemas are
/// field-compatible; richer conversions come from custom factories.
#[derive(Debug)]
pub struct VersionRewriteConvertor;

impl ObjectConvertor for VersionRewriteConvertor {
    fn convert(
        &self,
        mut obj: RawObject,
        target: &stratus_api::GroupVersion,
    ) -> Result<RawObject, UpstreamError> {
        obj.api_version = target.to_string();
        if let Some(api_version) = obj.payload.get_mut("apiVersion") {
            *api_version = serde_json::Value::String(target.to_string());
        }
        Ok(obj)
    }
}

#[derive(Clone)]
enum DesiredVersions {
    All,
    Named(BTreeSet<String>),
}

impl DesiredVersions {
    fn union(&mut self, other: &DesiredVersions) {
        if matches!(self, DesiredVersions::All) {
            return;
        }
        match other {
            DesiredVersions::All => *self = DesiredVersions::All,
            DesiredVersions::Named(theirs) => {
                if let DesiredVersions::Named(mine) = self {
                    mine.extend(theirs.iter().cloned());
                }
            }
        }
    }
}

struct DesiredEntry {
    versions: DesiredVersions,
    sync_events: bool,
}

/// Produces the sync plan from desired resources and the discovered
/// surface.
pub struct ResourceNegotiator {
    name: String,
    discovery: Arc<DynamicDiscoveryManager>,
    resource_config_factory: Arc<dyn ResourceConfigFactory>,
    sync_all_custom_resources: AtomicBool,
}

impl ResourceNegotiator {
    /// Create a negotiator over one cluster's discovery manager.
    pub fn new(
        name: &str,
        discovery: Arc<DynamicDiscoveryManager>,
        resource_config_factory: Arc<dyn ResourceConfigFactory>,
    ) -> Self {
        Self {
            name: name.to_string(),
            discovery,
            resource_config_factory,
            sync_all_custom_resources: AtomicBool::new(false),
        }
    }

    /// Whether every discovered custom resource is implicitly desired.
    pub fn set_sync_all_custom_resources(&self, sync_all: bool) {
        self.sync_all_custom_resources
            .store(sync_all, Ordering::SeqCst);
    }

    /// Intersect desired resources with the discovered surface.
    pub fn negotiate_sync_resources(
        &self,
        desired: &[ClusterGroupResources],
    ) -> (
        GroupResourceStatus,
        HashMap<GroupVersionResource, ResourceSyncConfig>,
    ) {
        let snapshot = self.discovery.snapshot();
        let status = GroupResourceStatus::new();
        let mut plan: HashMap<GroupVersionResource, ResourceSyncConfig> = HashMap::new();

        // Resolve wildcards and the all-custom-resources flag into a
        // sorted (group, resource) → versions map.
        let mut wanted: BTreeMap<GroupResource, DesiredEntry> = BTreeMap::new();
        let mut want = |gr: GroupResource, versions: DesiredVersions, sync_events: bool| {
            match wanted.entry(gr) {
                std::collections::btree_map::Entry::Occupied(mut entry) => {
                    entry.get_mut().versions.union(&versions);
                    entry.get_mut().sync_events |= sync_events;
                }
                std::collections::btree_map::Entry::Vacant(entry) => {
                    entry.insert(DesiredEntry {
                        versions,
                        sync_events,
                    });
                }
            }
        };

        for group_resources in desired {
            let versions = if group_resources.versions.is_empty() {
                DesiredVersions::All
            } else {
                DesiredVersions::Named(group_resources.versions.iter().cloned().collect())
            };
            for resource in &group_resources.resources {
                if resource == WILDCARD_RESOURCE {
                    for (gr, _) in snapshot.resources_in_group(&group_resources.group) {
                        want(gr.clone(), versions.clone(), group_resources.sync_events);
                    }
                } else {
                    want(
                        GroupResource::new(&*group_resources.group, &**resource),
                        versions.clone(),
                        group_resources.sync_events,
                    );
                }
            }
        }
        if self.sync_all_custom_resources.load(Ordering::SeqCst) {
            for (gr, _) in snapshot.custom_resources() {
                want(gr.clone(), DesiredVersions::All, false);
            }
        }

        for (gr, entry) in &wanted {
            let Some(info) = snapshot.get(gr) else {
                // Not discovered (yet): nothing became syncable, so the
                // triple stays out of both the plan and the status.
                debug!(cluster = %self.name, resource = %gr, "desired resource not discovered");
                continue;
            };
            status.add_resource(gr, &info.kind, info.namespaced);

            for (version, verbs) in &info.versions {
                if let DesiredVersions::Named(named) = &entry.versions {
                    if !named.contains(version) {
                        continue;
                    }
                }
                let sync_gvr = gr.with_version(version);

                if !(verbs.contains("list") && verbs.contains("watch")) {
                    status.add_sync_condition(
                        gr,
                        initial_condition(
                            version,
                            version,
                            None,
                            ResourceSyncStatus::Pending,
                            UNSUPPORTED_REASON,
                            "resource does not support both list and watch",
                        ),
                    );
                    continue;
                }

                let config = match self.resource_config_factory.sync_config(
                    &sync_gvr,
                    &info.kind,
                    info.namespaced,
                    entry.sync_events,
                ) {
                    Ok(config) => config,
                    Err(err) => {
                        status.add_sync_condition(
                            gr,
                            initial_condition(
                                version,
                                version,
                                None,
                                ResourceSyncStatus::Pending,
                                INVALID_RESOURCE_CONFIG_REASON,
                                &err.to_string(),
                            ),
                        );
                        continue;
                    }
                };

                let storage_gr = config.storage_resource.group_resource();
                status.add_sync_condition(
                    gr,
                    initial_condition(
                        version,
                        &config.storage_resource.version,
                        (storage_gr != *gr).then_some(storage_gr),
                        ResourceSyncStatus::Pending,
                        SYNCHRO_PENDING_REASON,
                        "waiting for resource synchro to be created",
                    ),
                );

                // Multiple sync GVRs may collapse onto one storage GVR;
                // the first (stable order) wins the plan slot.
                plan.entry(config.storage_resource.clone()).or_insert(config);
            }
        }

        (status, plan)
    }
}

fn initial_condition(
    version: &str,
    storage_version: &str,
    storage_resource: Option<GroupResource>,
    sync_status: ResourceSyncStatus,
    reason: &str,
    message: &str,
) -> ClusterResourceSyncCondition {
    ClusterResourceSyncCondition {
        version: version.to_string(),
        storage_version: storage_version.to_string(),
        storage_resource,
        sync_resource: None,
        sync_version: None,
        status: sync_status,
        reason: reason.to_string(),
        message: message.to_string(),
        initial_list_phase: InitialListPhase::Unknown,
        last_transition_time: Utc::now(),
    }
}
