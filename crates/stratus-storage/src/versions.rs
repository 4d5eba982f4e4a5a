// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Watermark tracking shared between the coordinator and reconcilers.
//!
//! Per storage resource the engine keeps two maps keyed by object UID:
//! one for the objects themselves and one for their events. The maps are
//! shared by reference: the reconciler writes as objects persist, the
//! coordinator reads them when constructing reconcilers and serving warm
//! restarts. Locks protect single-entry bookkeeping only.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use stratus_api::Watermark;

/// A concurrent UID → watermark map.
#[derive(Debug, Clone, Default)]
pub struct WatermarkMap {
    inner: Arc<RwLock<HashMap<String, Watermark>>>,
}

impl WatermarkMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a map loaded from storage.
    pub fn from_map(map: HashMap<String, Watermark>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    /// The watermark recorded for a UID, if any.
    pub fn get(&self, uid: &str) -> Option<Watermark> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uid)
            .cloned()
    }

    /// Record a watermark for a UID.
    pub fn insert(&self, uid: impl Into<String>, watermark: Watermark) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uid.into(), watermark);
    }

    /// Forget a UID.
    pub fn remove(&self, uid: &str) -> Option<Watermark> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uid)
    }

    /// Whether a UID is tracked.
    pub fn contains(&self, uid: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(uid)
    }

    /// Number of tracked UIDs.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no UIDs are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The tracked UIDs at this instant.
    pub fn uids(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// A point-in-time copy of the whole map.
    pub fn snapshot(&self) -> HashMap<String, Watermark> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Watermarks for one storage resource: objects and their events.
#[derive(Debug, Clone, Default)]
pub struct ClusterResourceVersions {
    /// Last-seen object watermarks, keyed by UID.
    pub resources: WatermarkMap,
    /// Last-seen event watermarks, keyed by event UID.
    pub events: WatermarkMap,
}

impl ClusterResourceVersions {
    /// Fresh, empty watermark maps.
    pub fn new() -> Self {
        Self::default()
    }
}
