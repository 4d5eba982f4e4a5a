// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Upstream collaborator contracts.
//!
//! The engine never speaks the upstream wire protocol itself; it
//! consumes these traits. A [`ClusterConnector`] is built from the
//! cluster's connection credentials (out of scope here) and hands out
//! the discovery client, the per-resource lister/watchers, the events
//! lister/watcher and the health probe.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use stratus_api::{GroupVersion, GroupVersionResource, RawObject, WatchEvent};

use crate::error::SynchroError;

/// Errors surfaced by upstream collaborators.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UpstreamError {
    /// The upstream endpoint could not be reached.
    #[error("upstream unreachable: {0}")]
    Connect(String),

    /// The upstream rejected the request.
    #[error("upstream api error (code {code}): {message}")]
    Api {
        /// Upstream status code.
        code: u16,
        /// Upstream error message.
        message: String,
    },

    /// The requested watch revision is no longer available; the caller
    /// must relist.
    #[error("watch revision expired")]
    Expired,

    /// The watch stream broke mid-flight.
    #[error("watch stream error: {0}")]
    Stream(String),

    /// An object could not be converted to the storage version.
    #[error("conversion error: {0}")]
    Conversion(String),
}

impl UpstreamError {
    /// Whether the error demands a fresh enumeration.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired)
    }
}

/// One discovered API resource version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResource {
    /// API group; empty for the core group.
    pub group: String,
    /// API version within the group.
    pub version: String,
    /// Plural resource name.
    pub resource: String,
    /// Object kind.
    pub kind: String,
    /// Whether objects live in namespaces.
    pub namespaced: bool,
    /// Whether this is a custom (operator-registered) resource.
    pub custom: bool,
    /// Verbs the upstream serves for this resource version.
    pub verbs: BTreeSet<String>,
}

impl ApiResource {
    /// The GVR of this resource version.
    pub fn group_version_resource(&self) -> GroupVersionResource {
        GroupVersionResource::new(&*self.group, &*self.version, &*self.resource)
    }
}

/// Raw access to the upstream discovery endpoints.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// The upstream server version string.
    async fn fetch_server_version(&self) -> Result<String, UpstreamError>;

    /// Every resource version the upstream currently serves.
    async fn fetch_api_resources(&self) -> Result<Vec<ApiResource>, UpstreamError>;
}

/// Options for one enumeration page.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Page size; 0 requests everything at once.
    pub limit: i64,
    /// Continuation token from the previous page.
    pub continue_token: Option<String>,
}

/// One enumeration page.
#[derive(Debug, Clone)]
pub struct ObjectList {
    /// Objects in this page.
    pub items: Vec<RawObject>,
    /// Collection revision the enumeration observed.
    pub resource_version: String,
    /// Token for the next page; `None` when enumeration is complete.
    pub continue_token: Option<String>,
}

/// Options for opening a watch stream.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Revision to resume from.
    pub resource_version: String,
}

/// List/watch access to one upstream resource, across all namespaces.
#[async_trait]
pub trait ListerWatcher: Send + Sync {
    /// Fetch one enumeration page.
    async fn list(&self, opts: ListOptions) -> Result<ObjectList, UpstreamError>;

    /// Open a watch stream from a revision.
    async fn watch(
        &self,
        opts: WatchOptions,
    ) -> Result<BoxStream<'static, Result<WatchEvent, UpstreamError>>, UpstreamError>;
}

/// Produces a [`ListerWatcher`] per resource.
pub trait ListerWatcherFactory: Send + Sync {
    /// A lister/watcher for the given resource.
    fn for_resource(&self, gvr: &GroupVersionResource) -> Arc<dyn ListerWatcher>;
}

/// Converts objects between the sync version and the storage version.
pub trait ObjectConvertor: Send + Sync {
    /// Re-express an object in the target group/version.
    fn convert(&self, obj: RawObject, target: &GroupVersion) -> Result<RawObject, UpstreamError>;
}

/// Options for building the cluster health probe.
#[derive(Debug, Clone)]
pub struct HealthProbeOptions {
    /// Use a dedicated TCP dialer instead of the connector's shared
    /// transport.
    pub standalone_tcp: bool,
    /// Dial timeout for the standalone dialer.
    pub connect_timeout: Duration,
    /// TCP keep-alive for the standalone dialer.
    pub keep_alive: Duration,
}

impl Default for HealthProbeOptions {
    fn default() -> Self {
        Self {
            standalone_tcp: false,
            connect_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// A single reachability check against the cluster.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe once; `Ok` means reachable.
    async fn check(&self) -> Result<(), UpstreamError>;
}

/// Bundle of upstream collaborators for one cluster.
///
/// Built from the cluster's connection config by credential management
/// (out of scope); everything the engine reads from the cluster flows
/// through the collaborators returned here.
pub trait ClusterConnector: Send + Sync {
    /// Raw discovery access.
    fn discovery_client(&self) -> Result<Arc<dyn DiscoveryClient>, SynchroError>;

    /// Per-resource list/watch access.
    fn lister_watcher_factory(&self) -> Result<Arc<dyn ListerWatcherFactory>, SynchroError>;

    /// List/watch access to the upstream core events resource.
    fn events_lister_watcher(&self) -> Result<Arc<dyn ListerWatcher>, SynchroError>;

    /// A reachability probe honoring the given options.
    fn health_probe(&self, options: &HealthProbeOptions) -> Result<Arc<dyn HealthProbe>, SynchroError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_classification() {
        assert!(UpstreamError::Expired.is_expired());
        assert!(!UpstreamError::Connect("refused".to_string()).is_expired());
    }

    #[test]
    fn test_api_resource_gvr() {
        let res = ApiResource {
            group: "apps".to_string(),
            version: "v1".to_string(),
            resource: "deployments".to_string(),
            kind: "Deployment".to_string(),
            namespaced: true,
            custom: false,
            verbs: BTreeSet::from(["list".to_string(), "watch".to_string()]),
        };
        assert_eq!(
            res.group_version_resource(),
            GroupVersionResource::new("apps", "v1", "deployments")
        );
    }
}
