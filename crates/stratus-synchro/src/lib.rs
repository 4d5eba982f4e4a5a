// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus Synchro - Per-cluster Synchronizer Engine
//!
//! This crate implements the synchronizer for one managed cluster: it
//! discovers the cluster's API surface, negotiates which resources to
//! mirror into storage, runs one long-lived resource synchro per
//! mirrored resource, and continuously publishes a cluster status
//! document.
//!
//! The entry point is [`ClusterSynchro`]; everything it touches on the
//! cluster side goes through the collaborator traits in [`upstream`],
//! and everything on the persistence side through the `stratus-storage`
//! contracts.
//!
//! ```rust,ignore
//! let synchro = ClusterSynchro::new(
//!     "cluster-1",
//!     connector,       // Arc<dyn ClusterConnector>
//!     storage,         // Arc<dyn StorageFactory>
//!     status_updater,  // Arc<dyn ClusterStatusUpdater>
//!     ClusterSyncConfig::default(),
//! )
//! .await?;
//!
//! synchro.set_resources(desired, false);
//! synchro.run(shutdown_token).await;
//! ```

pub mod cluster_synchro;
pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod metrics;
pub mod negotiator;
pub mod resource_synchro;
pub mod status;
pub mod upstream;

pub use cluster_synchro::{ClusterStatusUpdater, ClusterSynchro, RunnerState};
pub use config::{ClusterSyncConfig, SyncIntervals};
pub use error::{Result, SynchroError};
