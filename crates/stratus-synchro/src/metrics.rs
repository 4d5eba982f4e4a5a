// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Metrics plumbing for resource synchros.
//!
//! Two layers exist side by side: pluggable per-(cluster, resource)
//! metrics stores (the aggregation service scrapes their writers), and
//! the engine's own counters registered once through the `metrics`
//! facade when the default synchro factory is selected.

use std::io;
use std::sync::Arc;

use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;

use stratus_api::{GroupVersionResource, RawObject};

/// Receives every object applied by one resource synchro and renders
/// metrics text on demand.
pub trait ResourceMetricsSink: Send + Sync {
    /// An object was created or updated in storage.
    fn record(&self, obj: &RawObject);

    /// An object left storage.
    fn forget(&self, uid: &str);

    /// Render the current metrics for scraping.
    fn write_to(&self, out: &mut dyn io::Write) -> io::Result<()>;
}

/// Per-(cluster, resource) metrics sink handed to a resource synchro.
#[derive(Clone)]
pub struct MetricsStore {
    sink: Arc<dyn ResourceMetricsSink>,
}

impl MetricsStore {
    /// Wrap a sink.
    pub fn new(sink: Arc<dyn ResourceMetricsSink>) -> Self {
        Self { sink }
    }

    /// An object was created or updated in storage.
    pub fn record(&self, obj: &RawObject) {
        self.sink.record(obj);
    }

    /// An object left storage.
    pub fn forget(&self, uid: &str) {
        self.sink.forget(uid);
    }

    /// The scrapable writer for this store.
    pub fn writer(&self) -> MetricsWriter {
        MetricsWriter {
            sink: self.sink.clone(),
        }
    }
}

/// Scrape handle over one metrics store.
#[derive(Clone)]
pub struct MetricsWriter {
    sink: Arc<dyn ResourceMetricsSink>,
}

impl MetricsWriter {
    /// Render the current metrics for scraping.
    pub fn write_to(&self, out: &mut dyn io::Write) -> io::Result<()> {
        self.sink.write_to(out)
    }
}

/// Union of writers across a synchro's reconcilers.
pub type MetricsWriterList = Vec<MetricsWriter>;

/// Yields a metrics store per (cluster, resource); `None` disables
/// collection for that resource.
pub trait MetricsStoreBuilder: Send + Sync {
    /// The store for one (cluster, resource) pair.
    fn metrics_store(&self, cluster: &str, resource: &GroupVersionResource)
        -> Option<MetricsStore>;
}

static SYNCHRO_METRICS: OnceCell<()> = OnceCell::new();

/// Register the default synchro counters. Idempotent; only the first
/// call describes the series.
pub(crate) fn register_resource_synchro_metrics() {
    SYNCHRO_METRICS.get_or_init(|| {
        describe_counter!(
            "stratus_resource_synchro_applied_total",
            "Objects persisted into storage by resource synchros"
        );
        describe_counter!(
            "stratus_resource_synchro_deleted_total",
            "Objects removed from storage by resource synchros"
        );
        describe_counter!(
            "stratus_resource_synchro_storage_failures_total",
            "Storage operations that failed, by recoverability"
        );
    });
}

pub(crate) fn count_applied(cluster: &str, resource: &GroupVersionResource) {
    counter!(
        "stratus_resource_synchro_applied_total",
        "cluster" => cluster.to_string(),
        "resource" => resource.to_string(),
    )
    .increment(1);
}

pub(crate) fn count_deleted(cluster: &str, resource: &GroupVersionResource) {
    counter!(
        "stratus_resource_synchro_deleted_total",
        "cluster" => cluster.to_string(),
        "resource" => resource.to_string(),
    )
    .increment(1);
}

pub(crate) fn count_storage_failure(
    cluster: &str,
    resource: &GroupVersionResource,
    recoverable: bool,
) {
    counter!(
        "stratus_resource_synchro_storage_failures_total",
        "cluster" => cluster.to_string(),
        "resource" => resource.to_string(),
        "recoverable" => if recoverable { "true" } else { "false" },
    )
    .increment(1);
}
