// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Merged per-(group, resource, version) sync state.
//!
//! A fresh `GroupResourceStatus` is produced by every negotiation; it is
//! then merged with the previous one (preserving history for unchanged
//! triples), switched into concurrent mode and published for the
//! duration of the refresh. Ordering is stable: groups, resources and
//! versions appear in the order the negotiator inserted them (sorted).

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::Utc;

use stratus_api::{
    ClusterGroupResourcesStatus, ClusterResourceStatus, ClusterResourceSyncCondition,
    GroupResource, GroupVersionResource, ResourceSyncStatus,
};

#[derive(Default)]
struct Inner {
    statuses: Vec<ClusterGroupResourcesStatus>,
    group_index: HashMap<String, usize>,
    resource_index: HashMap<GroupResource, (usize, usize)>,
    /// sync GVR → (group, resource, condition) indices.
    version_index: HashMap<GroupVersionResource, (usize, usize, usize)>,
}

impl Inner {
    fn reindex(&mut self) {
        self.group_index.clear();
        self.resource_index.clear();
        self.version_index.clear();
        for (gi, group) in self.statuses.iter().enumerate() {
            self.group_index.insert(group.group.clone(), gi);
            for (ri, resource) in group.resources.iter().enumerate() {
                let gr = GroupResource::new(&*group.group, &*resource.name);
                self.resource_index.insert(gr.clone(), (gi, ri));
                for (vi, cond) in resource.sync_conditions.iter().enumerate() {
                    self.version_index
                        .insert(gr.with_version(&cond.version), (gi, ri, vi));
                }
            }
        }
    }
}

/// Ordered sync conditions for every negotiated triple.
#[derive(Default)]
pub struct GroupResourceStatus {
    concurrent: AtomicBool,
    inner: RwLock<Inner>,
}

impl GroupResourceStatus {
    /// An empty status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a (group, resource) slot exists.
    pub fn add_resource(&self, gr: &GroupResource, kind: &str, namespaced: bool) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.resource_index.contains_key(gr) {
            return;
        }
        let gi = match inner.group_index.get(&gr.group) {
            Some(&gi) => gi,
            None => {
                inner.statuses.push(ClusterGroupResourcesStatus {
                    group: gr.group.clone(),
                    resources: Vec::new(),
                });
                let gi = inner.statuses.len() - 1;
                inner.group_index.insert(gr.group.clone(), gi);
                gi
            }
        };
        inner.statuses[gi].resources.push(ClusterResourceStatus {
            name: gr.resource.clone(),
            kind: kind.to_string(),
            namespaced,
            sync_conditions: Vec::new(),
        });
        let ri = inner.statuses[gi].resources.len() - 1;
        inner.resource_index.insert(gr.clone(), (gi, ri));
    }

    /// Attach a per-version condition under an existing resource slot.
    pub fn add_sync_condition(&self, gr: &GroupResource, condition: ClusterResourceSyncCondition) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(&(gi, ri)) = inner.resource_index.get(gr) else {
            return;
        };
        let gvr = gr.with_version(&condition.version);
        if inner.version_index.contains_key(&gvr) {
            return;
        }
        inner.statuses[gi].resources[ri]
            .sync_conditions
            .push(condition);
        let vi = inner.statuses[gi].resources[ri].sync_conditions.len() - 1;
        inner.version_index.insert(gvr, (gi, ri, vi));
    }

    /// Merge history from the previous status into this one.
    ///
    /// For every triple present in both, the previous runtime state
    /// (status, reason, message, list phase, transition time) replaces
    /// the freshly-initialised one; the storage mapping stays fresh.
    /// Triples only the previous status knows are carried over whole
    /// and returned as the deleted set; they stay visible until cleanup
    /// succeeds and [`delete_version`](Self::delete_version) removes
    /// them.
    pub fn merge(&self, previous: Option<&GroupResourceStatus>) -> HashSet<GroupVersionResource> {
        let mut deleted = HashSet::new();
        let Some(previous) = previous else {
            return deleted;
        };

        let carried: Vec<(GroupResource, ClusterResourceStatus, ClusterResourceSyncCondition)> = {
            let prev = previous
                .inner
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let mut carried = Vec::new();
            for (gvr, &(pgi, pri, pvi)) in &prev.version_index {
                let old = prev.statuses[pgi].resources[pri].sync_conditions[pvi].clone();
                match inner.version_index.get(gvr).copied() {
                    Some((gi, ri, vi)) => {
                        let cond = &mut inner.statuses[gi].resources[ri].sync_conditions[vi];
                        cond.status = old.status;
                        cond.reason = old.reason;
                        cond.message = old.message;
                        cond.initial_list_phase = old.initial_list_phase;
                        cond.last_transition_time = old.last_transition_time;
                    }
                    None => {
                        let resource = prev.statuses[pgi].resources[pri].clone();
                        carried.push((gvr.group_resource(), resource, old));
                        deleted.insert(gvr.clone());
                    }
                }
            }
            carried
        };

        for (gr, resource, cond) in carried {
            self.add_resource(&gr, &resource.kind, resource.namespaced);
            self.add_sync_condition(&gr, cond);
        }
        deleted
    }

    /// Enter the shared phase: updates may now arrive concurrently with
    /// readers for the rest of the refresh.
    pub fn enable_concurrent(&self) {
        self.concurrent.store(true, Ordering::SeqCst);
    }

    /// Leave the shared phase.
    pub fn disable_concurrent(&self) {
        self.concurrent.store(false, Ordering::SeqCst);
    }

    /// Update the condition of one sync triple. The transition time only
    /// moves when something actually changed.
    pub fn update_sync_condition(
        &self,
        gvr: &GroupVersionResource,
        status: ResourceSyncStatus,
        reason: &str,
        message: &str,
    ) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(&(gi, ri, vi)) = inner.version_index.get(gvr) else {
            return;
        };
        let cond = &mut inner.statuses[gi].resources[ri].sync_conditions[vi];
        if cond.status == status && cond.reason == reason && cond.message == message {
            return;
        }
        cond.status = status;
        cond.reason = reason.to_string();
        cond.message = message.to_string();
        cond.last_transition_time = Utc::now();
    }

    /// Drop the condition of one sync triple, pruning emptied resource
    /// and group slots.
    pub fn delete_version(&self, gvr: &GroupVersionResource) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(&(gi, ri, vi)) = inner.version_index.get(gvr) else {
            return;
        };
        inner.statuses[gi].resources[ri].sync_conditions.remove(vi);
        if inner.statuses[gi].resources[ri].sync_conditions.is_empty() {
            inner.statuses[gi].resources.remove(ri);
        }
        if inner.statuses[gi].resources.is_empty() {
            inner.statuses.remove(gi);
        }
        inner.reindex();
    }

    /// A deep-copied snapshot safe to mutate by the caller.
    pub fn load_group_resources_statuses(&self) -> Vec<ClusterGroupResourcesStatus> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .statuses
            .clone()
    }

    /// storage GVR → every sync GVR whose condition writes through it.
    pub fn storage_gvr_to_sync_gvrs(
        &self,
    ) -> HashMap<GroupVersionResource, BTreeSet<GroupVersionResource>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut map: HashMap<GroupVersionResource, BTreeSet<GroupVersionResource>> = HashMap::new();
        for group in &inner.statuses {
            for resource in &group.resources {
                let gr = GroupResource::new(&*group.group, &*resource.name);
                for cond in &resource.sync_conditions {
                    map.entry(cond.storage_gvr(&gr))
                        .or_default()
                        .insert(gr.with_version(&cond.version));
                }
            }
        }
        map
    }

    /// The condition of one sync triple, if present.
    pub fn condition(&self, gvr: &GroupVersionResource) -> Option<ClusterResourceSyncCondition> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .version_index
            .get(gvr)
            .map(|&(gi, ri, vi)| inner.statuses[gi].resources[ri].sync_conditions[vi].clone())
    }

    /// Every tracked sync triple.
    pub fn sync_gvrs(&self) -> Vec<GroupVersionResource> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .version_index
            .keys()
            .cloned()
            .collect()
    }
}
