// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-resource reconcilers.
//!
//! One resource synchro owns the list/watch → convert → persist pipeline
//! for a single storage resource. The cluster synchro constructs them
//! through a [`SynchroFactory`] (storage backends may supply their own),
//! launches `run` under the cluster lifetime and gates `start` on
//! cluster health.

mod synchro;

pub use synchro::DefaultResourceSynchro;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use stratus_api::{GroupVersionResource, InitialListPhase, ResourceSyncStatus};
use stratus_storage::{ResourceStorage, WatermarkMap};

use crate::error::{Result, SynchroError};
use crate::metrics::{self, MetricsStore, MetricsWriter};
use crate::upstream::{ListerWatcher, ObjectConvertor};

/// Condition reason: storage rejected writes unrecoverably.
pub const STORAGE_ERROR_REASON: &str = "StorageError";
/// Condition reason: the informer is paused (cluster unhealthy).
pub const PAUSED_REASON: &str = "Paused";
/// Condition reason: the upstream list/watch is failing.
pub const UPSTREAM_ERROR_REASON: &str = "UpstreamError";

/// Event mirroring configuration for one resource synchro.
#[derive(Clone)]
pub struct EventConfig {
    /// List/watch access to the upstream events resource.
    pub lister_watcher: Arc<dyn ListerWatcher>,
    /// Event watermarks, shared with the coordinator.
    pub resource_versions: WatermarkMap,
}

/// Everything needed to construct one resource synchro.
#[derive(Clone)]
pub struct SynchroConfig {
    /// The GVR consumed upstream.
    pub group_version_resource: GroupVersionResource,
    /// Object kind.
    pub kind: String,
    /// List/watch access to the sync resource.
    pub lister_watcher: Arc<dyn ListerWatcher>,
    /// Conversion between sync and storage versions.
    pub convertor: Option<Arc<dyn ObjectConvertor>>,
    /// Per-resource metrics sink.
    pub metrics_store: Option<MetricsStore>,
    /// Object watermarks, shared with the coordinator.
    pub resource_versions: WatermarkMap,
    /// Page size hint for the initial list; 0 disables paging.
    pub page_size: i64,
    /// The storage objects are persisted into.
    pub resource_storage: Arc<dyn ResourceStorage>,
    /// Event mirroring; `None` disables it.
    pub event: Option<EventConfig>,
}

/// Point-in-time view of a synchro's condition.
#[derive(Debug, Clone, PartialEq)]
pub struct SynchroStatus {
    /// Current sync status.
    pub status: ResourceSyncStatus,
    /// Machine-readable reason.
    pub reason: String,
    /// Human-readable detail.
    pub message: String,
    /// Progress of the first upstream enumeration.
    pub initial_list_phase: InitialListPhase,
    /// When the status last changed.
    pub last_transition_time: DateTime<Utc>,
}

/// Coarse lifecycle stage, for shutdown diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynchroStage {
    /// Created; no informer epoch yet.
    Pending,
    /// Enumerating the upstream.
    List,
    /// Steady-state watching.
    Watch,
    /// Informer stopped, synchro alive.
    Paused,
    /// Fully shut down.
    Closed,
}

impl std::fmt::Display for SynchroStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::List => "List",
            Self::Watch => "Watch",
            Self::Paused => "Paused",
            Self::Closed => "Closed",
        };
        f.write_str(s)
    }
}

/// A per-resource reconciler.
#[async_trait]
pub trait ResourceSynchro: Send + Sync {
    /// The long-lived persistence worker. Exits when the lifetime token
    /// fires or [`close`](Self::close) is called, after draining
    /// in-flight work.
    async fn run(&self, lifetime: CancellationToken);

    /// Begin consuming the upstream under a handler token. At most one
    /// informer epoch is live at a time; a call while one is live is a
    /// no-op.
    fn start(&self, handler: CancellationToken);

    /// Request shutdown; the returned token fires when every worker of
    /// this synchro has exited.
    fn close(&self) -> CancellationToken;

    /// Condition snapshot.
    fn status(&self) -> SynchroStatus;

    /// Lifecycle stage.
    fn stage(&self) -> SynchroStage;

    /// The GVR consumed upstream.
    fn group_version_resource(&self) -> GroupVersionResource;

    /// Scrape handle for this synchro's metrics store, if any.
    fn metrics_writer(&self) -> Option<MetricsWriter> {
        None
    }
}

/// Constructs resource synchros.
///
/// Storage factories that want custom reconcilers implement this and
/// register through `ClusterSyncConfig::synchro_factory`; otherwise the
/// default factory is used.
#[async_trait]
pub trait SynchroFactory: Send + Sync {
    /// Build a reconciler for one resource of one cluster.
    async fn new_resource_synchro(
        &self,
        cluster: &str,
        config: SynchroConfig,
    ) -> Result<Arc<dyn ResourceSynchro>>;
}

/// The built-in factory.
#[derive(Debug, Default)]
pub struct DefaultResourceSynchroFactory;

#[async_trait]
impl SynchroFactory for DefaultResourceSynchroFactory {
    async fn new_resource_synchro(
        &self,
        cluster: &str,
        config: SynchroConfig,
    ) -> Result<Arc<dyn ResourceSynchro>> {
        if config.group_version_resource.resource.is_empty() {
            return Err(SynchroError::SynchroCreate {
                resource: config.group_version_resource.to_string(),
                reason: "empty resource name".to_string(),
            });
        }
        Ok(DefaultResourceSynchro::new(cluster, config))
    }
}

/// Register the default synchro metrics; init-once.
pub fn register_resource_synchro_metrics() {
    metrics::register_resource_synchro_metrics();
}
