// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage backend contracts for the Stratus synchronizer engine.
//!
//! The engine persists mirrored objects through these traits and never
//! assumes anything about the backing store beyond them. Backends are
//! pluggable products of their own (SQL, columnar, ...); they implement
//! [`StorageFactory`] and hand out [`ResourceStorage`] instances per
//! storage resource.
//!
//! Error classification matters more than error detail here: transient
//! failures must be wrapped with [`StorageError::recoverable`] so
//! reconcilers know to retry instead of parking themselves.

pub mod error;
pub mod versions;

pub use error::{BoxError, Result, StorageError};
pub use versions::{ClusterResourceVersions, WatermarkMap};

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

use stratus_api::{GroupResource, GroupVersionResource, RawObject, WatchEvent};

/// Configuration for one resource storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStorageConfig {
    /// The GVR objects are persisted under.
    pub group_version_resource: GroupVersionResource,
    /// Object kind.
    pub kind: String,
    /// Whether the resource is namespaced.
    pub namespaced: bool,
}

/// Metadata describing a multi-resource view served by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionResource {
    /// View name.
    pub name: String,
    /// The resource types aggregated by this view.
    pub resource_types: Vec<GroupResource>,
}

/// Read options for storage queries.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Restrict to these clusters; empty means all.
    pub clusters: Vec<String>,
    /// Restrict to these namespaces; empty means all.
    pub namespaces: Vec<String>,
    /// Page size limit.
    pub limit: Option<i64>,
    /// Continuation token from a previous page.
    pub continue_token: Option<String>,
}

/// Entry point to a storage backend.
#[async_trait]
pub trait StorageFactory: Send + Sync {
    /// The request verbs the backend can serve to readers.
    ///
    /// Currently a single union across all resources; per-resource verb
    /// sets may come later.
    fn supported_request_verbs(&self) -> Vec<String>;

    /// Idempotent bootstrap of per-cluster persistent state.
    async fn prepare_cluster(&self, cluster: &str) -> Result<()>;

    /// Watermarks persisted for a cluster, for warm restart.
    async fn resource_versions(
        &self,
        cluster: &str,
    ) -> Result<HashMap<GroupVersionResource, ClusterResourceVersions>>;

    /// Metadata for the backend's multi-resource views.
    async fn collection_resources(&self) -> Result<Vec<CollectionResource>>;

    /// Create a storage for one resource.
    async fn new_resource_storage(
        &self,
        config: ResourceStorageConfig,
    ) -> Result<Arc<dyn ResourceStorage>>;

    /// Create a read-only aggregator over a multi-resource view.
    async fn new_collection_resource_storage(
        &self,
        cr: &CollectionResource,
    ) -> Result<Arc<dyn CollectionResourceStorage>>;

    /// Durably delete everything persisted for a cluster.
    ///
    /// Deletion may be partial on error: the caller must not assume a
    /// failure means nothing was removed.
    async fn clean_cluster(&self, cluster: &str) -> Result<()>;

    /// Durably delete one resource of one cluster. Same partial-failure
    /// caveat as [`clean_cluster`](Self::clean_cluster).
    async fn clean_cluster_resource(
        &self,
        cluster: &str,
        gvr: &GroupVersionResource,
    ) -> Result<()>;

    /// Release pooled connections.
    async fn shutdown(&self) -> Result<()>;
}

/// Persistence operations for one storage resource.
#[async_trait]
pub trait ResourceStorage: Send + Sync {
    /// The configuration this storage was created with.
    fn storage_config(&self) -> ResourceStorageConfig;

    /// Fetch one object.
    async fn get(&self, cluster: &str, namespace: Option<&str>, name: &str) -> Result<RawObject>;

    /// Enumerate objects.
    async fn list(&self, opts: &QueryOptions) -> Result<Vec<RawObject>>;

    /// Stream changes.
    async fn watch(&self, opts: &QueryOptions) -> Result<BoxStream<'static, WatchEvent>>;

    /// Persist a newly-seen object.
    async fn create(&self, cluster: &str, obj: &RawObject) -> Result<()>;

    /// Persist a changed object.
    async fn update(&self, cluster: &str, obj: &RawObject) -> Result<()>;

    /// Resolve a possibly-partial deletion tombstone into a deletable
    /// object reference.
    fn convert_deleted_object(&self, obj: RawObject) -> Result<RawObject>;

    /// Remove a deleted object.
    async fn delete(&self, cluster: &str, obj: &RawObject) -> Result<()>;

    /// Persist an upstream event referencing a mirrored object.
    async fn record_event(&self, cluster: &str, event: &RawObject) -> Result<()>;
}

/// Read-only access to a multi-resource view.
#[async_trait]
pub trait CollectionResourceStorage: Send + Sync {
    /// Materialize the view.
    async fn get(&self, opts: &QueryOptions) -> Result<CollectionResource>;
}
