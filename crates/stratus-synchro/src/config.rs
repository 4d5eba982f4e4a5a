// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-cluster sync configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::metrics::MetricsStoreBuilder;
use crate::resource_synchro::SynchroFactory;

/// Configuration for one cluster synchro.
#[derive(Clone, Default)]
pub struct ClusterSyncConfig {
    /// Page size hint for the initial list phase; 0 disables paging.
    pub page_size_for_resource_sync: i64,
    /// Builder yielding a per-(cluster, resource) metrics sink.
    pub metrics_store_builder: Option<Arc<dyn MetricsStoreBuilder>>,
    /// Build the health probe with its own TCP dialer
    /// (30s connect timeout, 30s keep-alive) instead of the connector's
    /// shared transport.
    pub health_checker_with_standalone_tcp: bool,
    /// Synchro factory override. Storage factories that also implement
    /// [`SynchroFactory`] register themselves here; left empty, the
    /// default factory is used.
    pub synchro_factory: Option<Arc<dyn SynchroFactory>>,
    /// Interval overrides; `None` picks the defaults.
    pub intervals: SyncIntervals,
}

impl std::fmt::Debug for ClusterSyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSyncConfig")
            .field("page_size_for_resource_sync", &self.page_size_for_resource_sync)
            .field(
                "metrics_store_builder",
                &self.metrics_store_builder.as_ref().map(|_| "..."),
            )
            .field(
                "health_checker_with_standalone_tcp",
                &self.health_checker_with_standalone_tcp,
            )
            .field("synchro_factory", &self.synchro_factory.as_ref().map(|_| "..."))
            .field("intervals", &self.intervals)
            .finish()
    }
}

/// Worker cadence knobs. Production leaves the defaults; tests shrink
/// them to keep scenarios fast.
#[derive(Debug, Clone)]
pub struct SyncIntervals {
    /// How often discovery polls the upstream API surface.
    pub discovery_poll: Duration,
    /// How often the cluster health probe runs.
    pub health_probe: Duration,
    /// Per-probe timeout.
    pub health_probe_timeout: Duration,
}

impl Default for SyncIntervals {
    fn default() -> Self {
        Self {
            discovery_poll: Duration::from_secs(30),
            health_probe: Duration::from_secs(30),
            health_probe_timeout: Duration::from_secs(30),
        }
    }
}
