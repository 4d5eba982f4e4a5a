// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus API Types - Single Source of Truth
//!
//! This crate defines the shared types used throughout the Stratus
//! synchronizer engine and its collaborators:
//! - Resource identifiers ([`GroupVersionResource`], [`GroupResource`])
//! - The dynamic object model ([`RawObject`], [`WatchEvent`])
//! - Desired-resource declarations ([`ClusterGroupResources`])
//! - The published cluster status document ([`ClusterStatus`]) and its
//!   condition types
//!
//! No I/O happens here; every consumer (the synchro engine, storage
//! backends, the query API server) depends on this crate so the wire
//! shapes stay in one place.

pub mod cluster;
pub mod gvr;
pub mod object;

pub use cluster::{
    ClusterCondition, ClusterGroupResources, ClusterGroupResourcesStatus, ClusterResourceStatus,
    ClusterResourceSyncCondition, ClusterStatus, ConditionStatus, InitialListPhase,
    ResourceSyncStatus, CLUSTER_HEALTHY_CONDITION, CLUSTER_HEALTHY_REASON,
    CLUSTER_MONITOR_STOP_REASON, CLUSTER_UNHEALTHY_REASON, SYNCHRO_PENDING_REASON,
    SYNCHRO_RUNNING_CONDITION, SYNCHRO_RUNNING_REASON, SYNCHRO_SHUTDOWN_REASON, WILDCARD_RESOURCE,
};
pub use gvr::{GroupResource, GroupVersion, GroupVersionResource};
pub use object::{RawObject, WatchEvent, Watermark};
