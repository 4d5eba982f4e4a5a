// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster-facing declarations and the published status document.
//!
//! [`ClusterGroupResources`] is what an operator asks to be mirrored;
//! [`ClusterStatus`] is what the engine continuously publishes back:
//! the upstream server version, the engine-level conditions and one sync
//! condition per (group, resource, version) triple under negotiation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gvr::{GroupResource, GroupVersionResource};

/// Condition type for the engine's run state.
pub const SYNCHRO_RUNNING_CONDITION: &str = "SynchroRunning";
/// Condition type for upstream reachability.
pub const CLUSTER_HEALTHY_CONDITION: &str = "ClusterHealthy";

/// Reason: the synchro exists but has not started running.
pub const SYNCHRO_PENDING_REASON: &str = "SynchroPending";
/// Reason: the synchro is running.
pub const SYNCHRO_RUNNING_REASON: &str = "SynchroRunning";
/// Reason: the synchro has shut down.
pub const SYNCHRO_SHUTDOWN_REASON: &str = "SynchroShutdown";
/// Reason: the last health probe succeeded.
pub const CLUSTER_HEALTHY_REASON: &str = "ClusterHealthy";
/// Reason: the last health probe failed.
pub const CLUSTER_UNHEALTHY_REASON: &str = "ClusterUnhealthy";
/// Reason: the health monitor is not running yet (or anymore).
pub const CLUSTER_MONITOR_STOP_REASON: &str = "ClusterMonitorStop";

/// Wildcard resource name selecting every resource of a group.
pub const WILDCARD_RESOURCE: &str = "*";

/// A desired set of resources to mirror from one API group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterGroupResources {
    /// API group; empty for the core group.
    pub group: String,
    /// Versions to consider; empty means every discovered version.
    #[serde(default)]
    pub versions: Vec<String>,
    /// Plural resource names; `"*"` selects the whole group.
    pub resources: Vec<String>,
    /// Also mirror the upstream events referencing these resources.
    #[serde(default)]
    pub sync_events: bool,
}

/// Tri-state condition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
    /// The condition cannot be determined.
    Unknown,
}

/// An engine-level condition (running, healthy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterCondition {
    /// Condition type, one of the `*_CONDITION` constants.
    #[serde(rename = "type")]
    pub condition_type: String,
    /// Current status.
    pub status: ConditionStatus,
    /// Machine-readable reason for the last transition.
    pub reason: String,
    /// Human-readable detail.
    pub message: String,
    /// When the status last changed.
    pub last_transition_time: DateTime<Utc>,
}

impl ClusterCondition {
    /// Build a condition stamped with the current time.
    pub fn new(
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Per-version sync progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceSyncStatus {
    /// Waiting on a precondition (creation, storage recovery).
    Pending,
    /// State not yet determined.
    Unknown,
    /// Actively consuming the upstream.
    Syncing,
    /// Not consuming: paused, removed or shut down.
    Stop,
}

impl fmt::Display for ResourceSyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Unknown => "Unknown",
            Self::Syncing => "Syncing",
            Self::Stop => "Stop",
        };
        f.write_str(s)
    }
}

/// Progress of a reconciler's first full upstream enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitialListPhase {
    /// No reconciler has reported yet.
    Unknown,
    /// The reconciler exists but has not begun listing.
    NotStarted,
    /// The first enumeration is underway.
    InProgress,
    /// The first enumeration finished.
    Completed,
}

impl fmt::Display for InitialListPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "Unknown",
            Self::NotStarted => "NotStarted",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
        };
        f.write_str(s)
    }
}

/// Sync condition for one version of one resource.
///
/// The condition lives under a (group, resource) pair in the status
/// document; `storage_resource`/`sync_resource` are only set when they
/// deviate from that pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterResourceSyncCondition {
    /// The version this condition tracks.
    pub version: String,
    /// Version the objects are persisted under.
    pub storage_version: String,
    /// Storage (group, resource) when it differs from the condition's own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_resource: Option<GroupResource>,
    /// Actually-synced (group, resource) when it differs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_resource: Option<GroupResource>,
    /// Actually-synced version when it differs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_version: Option<String>,
    /// Current sync status.
    pub status: ResourceSyncStatus,
    /// Machine-readable reason.
    #[serde(default)]
    pub reason: String,
    /// Human-readable detail.
    #[serde(default)]
    pub message: String,
    /// Progress of the first upstream enumeration.
    pub initial_list_phase: InitialListPhase,
    /// When the status last changed.
    pub last_transition_time: DateTime<Utc>,
}

impl ClusterResourceSyncCondition {
    /// The storage GVR this condition writes through, given the
    /// (group, resource) it is filed under.
    pub fn storage_gvr(&self, gr: &GroupResource) -> GroupVersionResource {
        let base = self.storage_resource.as_ref().unwrap_or(gr);
        base.with_version(&self.storage_version)
    }
}

/// Status of one resource: its identity plus per-version conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterResourceStatus {
    /// Plural resource name.
    pub name: String,
    /// Object kind.
    pub kind: String,
    /// Whether the resource is namespaced.
    pub namespaced: bool,
    /// One condition per negotiated version.
    pub sync_conditions: Vec<ClusterResourceSyncCondition>,
}

/// Status of every resource under one API group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterGroupResourcesStatus {
    /// API group; empty for the core group.
    pub group: String,
    /// Resources under negotiation in this group.
    pub resources: Vec<ClusterResourceStatus>,
}

/// The continuously-published per-cluster status document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    /// Upstream server version string.
    pub version: String,
    /// Engine-level conditions (running, healthy).
    pub conditions: Vec<ClusterCondition>,
    /// Per-resource sync progress.
    #[serde(default)]
    pub sync_resources: Vec<ClusterGroupResourcesStatus>,
}
