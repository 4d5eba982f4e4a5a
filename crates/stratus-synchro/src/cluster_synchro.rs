// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The per-cluster coordinator.
//!
//! A [`ClusterSynchro`] owns everything for one managed cluster: the
//! discovery manager, the health checker, the plan refresh loop, the
//! registry of resource synchros and the status publication channel.
//! The runner gates upstream consumption on cluster health; the refresh
//! loop reconciles the registry against each negotiated plan.
//!
//! Locking: one `RwLock` guards the registry (synchros, watermark maps,
//! handler token). It is held for bookkeeping only, never across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use stratus_api::{
    ClusterCondition, ClusterGroupResources, ClusterStatus, ConditionStatus, GroupResource,
    GroupVersionResource, ResourceSyncStatus, CLUSTER_HEALTHY_CONDITION, CLUSTER_HEALTHY_REASON,
    CLUSTER_MONITOR_STOP_REASON, CLUSTER_UNHEALTHY_REASON, SYNCHRO_PENDING_REASON,
    SYNCHRO_RUNNING_CONDITION, SYNCHRO_RUNNING_REASON, SYNCHRO_SHUTDOWN_REASON,
};
use stratus_storage::{ClusterResourceVersions, StorageFactory};

use crate::config::ClusterSyncConfig;
use crate::discovery::{DynamicDiscoveryManager, PrepareConfig};
use crate::error::{BoxError, Result, SynchroError};
use crate::health::{HealthChecker, HealthState};
use crate::metrics::MetricsWriterList;
use crate::negotiator::{DefaultResourceConfigFactory, ResourceNegotiator};
use crate::resource_synchro::{
    register_resource_synchro_metrics, DefaultResourceSynchroFactory, EventConfig, ResourceSynchro,
    SynchroConfig, SynchroFactory, STORAGE_ERROR_REASON,
};
use crate::status::GroupResourceStatus;
use crate::upstream::{ClusterConnector, HealthProbeOptions, ListerWatcher, ListerWatcherFactory};

/// Condition reason: per-resource setup failed; retried on next refresh.
pub const SYNCHRO_CREATE_FAILED_REASON: &str = "SynchroCreateFailed";
/// Condition reason: the resource left the plan and its synchro closed.
pub const SYNCHRO_REMOVED_REASON: &str = "SynchroRemoved";
/// Condition reason: storage cleanup of a removed resource failed.
pub const CLEAN_RESOURCE_FAILED_REASON: &str = "CleanResourceFailed";
/// Condition reason: a condition references no live synchro.
pub const RESOURCE_SYNCHRO_NOT_FOUND_REASON: &str = "ResourceSynchroNotFound";

const SHUTDOWN_WATCHDOG_INTERVAL: Duration = Duration::from_secs(15);

/// Receives the continuously-published cluster status document.
#[async_trait]
pub trait ClusterStatusUpdater: Send + Sync {
    /// Persist the status; idempotent. Errors are logged, never fatal.
    async fn update_cluster_status(
        &self,
        name: &str,
        status: &ClusterStatus,
    ) -> std::result::Result<(), BoxError>;
}

/// Runner lifecycle, driven by cluster health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Not consuming the upstream.
    Idle,
    /// Spinning up discovery and synchros.
    Starting,
    /// Discovery and synchros consume under one handler token.
    Running,
    /// Tearing the handler token down.
    Stopping,
}

#[derive(Default)]
struct Registry {
    synchros: HashMap<GroupVersionResource, Arc<dyn ResourceSynchro>>,
    resource_versions: HashMap<GroupVersionResource, ClusterResourceVersions>,
    handler: Option<CancellationToken>,
}

impl std::fmt::Debug for ClusterSynchro {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSynchro")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Synchronizes one managed cluster into storage.
pub struct ClusterSynchro {
    name: String,
    status_updater: Arc<dyn ClusterStatusUpdater>,
    storage: Arc<dyn StorageFactory>,
    synchro_factory: Arc<dyn SynchroFactory>,
    sync_config: ClusterSyncConfig,

    discovery: Arc<DynamicDiscoveryManager>,
    health_checker: Arc<HealthChecker>,
    lister_watcher_factory: Arc<dyn ListerWatcherFactory>,
    events_lister_watcher: Arc<dyn ListerWatcher>,
    negotiator: ResourceNegotiator,

    closer: CancellationToken,
    closed: CancellationToken,
    shutdown_started: AtomicBool,

    update_status_tx: Mutex<Option<mpsc::Sender<()>>>,
    update_status_rx: Mutex<Option<mpsc::Receiver<()>>>,
    refresh_tx: mpsc::Sender<()>,
    refresh_rx: Mutex<Option<mpsc::Receiver<()>>>,
    refresher_started: AtomicBool,

    desired_running: watch::Sender<bool>,
    runner_state: Mutex<RunnerState>,

    registry: RwLock<Registry>,

    sync_resources: RwLock<Option<Vec<ClusterGroupResources>>>,
    group_resource_status: RwLock<Option<Arc<GroupResourceStatus>>>,

    running_condition: RwLock<ClusterCondition>,
    healthy_condition: RwLock<ClusterCondition>,

    task_tracker: TaskTracker,
    self_ref: Weak<ClusterSynchro>,
}

impl ClusterSynchro {
    /// Build a synchro for one cluster.
    ///
    /// Failures to reach storage for the initial watermark load or to
    /// build the discovery client are retryable (test with
    /// [`SynchroError::is_retryable`]); every other failure is final.
    pub async fn new(
        name: &str,
        connector: Arc<dyn ClusterConnector>,
        storage: Arc<dyn StorageFactory>,
        status_updater: Arc<dyn ClusterStatusUpdater>,
        sync_config: ClusterSyncConfig,
    ) -> Result<Arc<Self>> {
        let discovery_client = connector
            .discovery_client()
            .map_err(SynchroError::retryable)?;

        storage
            .prepare_cluster(name)
            .await
            .map_err(|err| SynchroError::retryable(SynchroError::Storage(err)))?;
        let resource_versions = storage
            .resource_versions(name)
            .await
            .map_err(|err| SynchroError::retryable(SynchroError::Storage(err)))?;

        let lister_watcher_factory = connector.lister_watcher_factory()?;
        let events_lister_watcher = connector.events_lister_watcher()?;

        let probe_options = HealthProbeOptions {
            standalone_tcp: sync_config.health_checker_with_standalone_tcp,
            ..HealthProbeOptions::default()
        };
        let health_probe = connector.health_probe(&probe_options)?;
        let health_checker = Arc::new(HealthChecker::new(
            name,
            health_probe,
            sync_config.intervals.health_probe,
            sync_config.intervals.health_probe_timeout,
        ));

        let discovery = Arc::new(DynamicDiscoveryManager::new(
            name,
            discovery_client,
            sync_config.intervals.discovery_poll,
        ));

        let synchro_factory = match &sync_config.synchro_factory {
            Some(factory) => factory.clone(),
            None => {
                register_resource_synchro_metrics();
                Arc::new(DefaultResourceSynchroFactory) as Arc<dyn SynchroFactory>
            }
        };

        let negotiator = ResourceNegotiator::new(
            name,
            discovery.clone(),
            Arc::new(DefaultResourceConfigFactory),
        );

        let (refresh_tx, refresh_rx) = mpsc::channel(1);
        let (update_status_tx, update_status_rx) = mpsc::channel(1);
        let (desired_running, _) = watch::channel(false);

        let synchro = Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            name: name.to_string(),
            status_updater,
            storage,
            synchro_factory,
            sync_config,
            discovery,
            health_checker,
            lister_watcher_factory,
            events_lister_watcher,
            negotiator,
            closer: CancellationToken::new(),
            closed: CancellationToken::new(),
            shutdown_started: AtomicBool::new(false),
            update_status_tx: Mutex::new(Some(update_status_tx)),
            update_status_rx: Mutex::new(Some(update_status_rx)),
            refresh_tx,
            refresh_rx: Mutex::new(Some(refresh_rx)),
            refresher_started: AtomicBool::new(false),
            desired_running,
            runner_state: Mutex::new(RunnerState::Idle),
            registry: RwLock::new(Registry::default()),
            sync_resources: RwLock::new(None),
            group_resource_status: RwLock::new(None),
            running_condition: RwLock::new(ClusterCondition::new(
                SYNCHRO_RUNNING_CONDITION,
                ConditionStatus::False,
                SYNCHRO_PENDING_REASON,
                "cluster synchro is created, waiting to run",
            )),
            healthy_condition: RwLock::new(ClusterCondition::new(
                CLUSTER_HEALTHY_CONDITION,
                ConditionStatus::Unknown,
                CLUSTER_MONITOR_STOP_REASON,
                "waiting for the healthy monitor to run",
            )),
            task_tracker: TaskTracker::new(),
        });

        synchro.init_with_resource_versions(resource_versions);

        let on_mutation = Arc::downgrade(&synchro);
        let on_first_snapshot = Arc::downgrade(&synchro);
        synchro.discovery.prepare(PrepareConfig {
            resource_mutation_handler: Arc::new(move || {
                if let Some(synchro) = on_mutation.upgrade() {
                    synchro.reset_sync_resources();
                }
            }),
            after_start: Box::new(move || {
                if let Some(synchro) = on_first_snapshot.upgrade() {
                    synchro.spawn_refresher();
                }
            }),
        });

        Ok(synchro)
    }

    /// Cluster name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The runner's current state.
    pub fn runner_state(&self) -> RunnerState {
        *self
            .runner_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Union of metrics writers across live resource synchros.
    pub fn metrics_writer_list(&self) -> MetricsWriterList {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .synchros
            .values()
            .filter_map(|synchro| synchro.metrics_writer())
            .collect()
    }

    fn init_with_resource_versions(
        &self,
        resource_versions: HashMap<GroupVersionResource, ClusterResourceVersions>,
    ) {
        if resource_versions.is_empty() {
            return;
        }
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry.resource_versions = resource_versions;
    }

    /// Replace the desired resource set and wake the refresher.
    pub fn set_resources(
        &self,
        sync_resources: Vec<ClusterGroupResources>,
        sync_all_custom_resources: bool,
    ) {
        *self
            .sync_resources
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(sync_resources);
        self.negotiator
            .set_sync_all_custom_resources(sync_all_custom_resources);
        self.reset_sync_resources();
    }

    fn reset_sync_resources(&self) {
        // Single-slot: a wakeup during refresh merges into one more pass.
        let _ = self.refresh_tx.try_send(());
    }

    fn update_status(&self) {
        // Single-slot: overflow drops, latest snapshot wins.
        if let Some(tx) = self
            .update_status_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = tx.try_send(());
        }
    }

    fn set_runner_state(&self, state: RunnerState) {
        *self
            .runner_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn set_running_condition(&self, status: ConditionStatus, reason: &str, message: &str) {
        *self
            .running_condition
            .write()
            .unwrap_or_else(PoisonError::into_inner) =
            ClusterCondition::new(SYNCHRO_RUNNING_CONDITION, status, reason, message);
    }

    fn set_healthy_condition(&self, status: ConditionStatus, reason: &str, message: &str) {
        *self
            .healthy_condition
            .write()
            .unwrap_or_else(PoisonError::into_inner) =
            ClusterCondition::new(CLUSTER_HEALTHY_CONDITION, status, reason, message);
    }

    // ------------------------------------------------------------------
    // Engine lifecycle
    // ------------------------------------------------------------------

    /// Drive the engine until `shutdown` fires or [`shutdown`] is called.
    ///
    /// [`shutdown`]: Self::shutdown
    pub async fn run(&self, shutdown: CancellationToken) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        self.set_running_condition(
            ConditionStatus::True,
            SYNCHRO_RUNNING_REASON,
            "cluster synchro is running",
        );

        // The publisher is deliberately untracked: it outlives the
        // tracked workers and drains the final status before `closed`.
        if let Some(receiver) = self
            .update_status_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            tokio::spawn(this.clone().status_publisher(receiver));
        }

        self.task_tracker.spawn(this.clone().monitor());
        self.task_tracker.spawn(this.clone().runner());
        let checker = self.health_checker.clone();
        let checker_stop = self.closer.clone();
        self.task_tracker.spawn(async move { checker.run(checker_stop).await });

        tokio::select! {
            _ = self.closer.cancelled() => {
                self.closed.cancelled().await;
            }
            _ = shutdown.cancelled() => {
                self.shutdown(true).await;
            }
        }
    }

    /// Idempotent shutdown: stops every worker, writes the terminal
    /// running condition, optionally publishes once more, and closes the
    /// status channel. Concurrent callers return after the first
    /// completes.
    pub async fn shutdown(&self, update_status: bool) {
        if !self.shutdown_started.swap(true, Ordering::SeqCst) {
            info!(cluster = %self.name, "cluster synchro is shutting down...");
            self.closer.cancel();

            if let Some(watchdog) = self.self_ref.upgrade() {
                tokio::spawn(watchdog.shutdown_watchdog());
            }

            self.task_tracker.close();
            self.task_tracker.wait().await;

            self.set_running_condition(
                ConditionStatus::False,
                SYNCHRO_SHUTDOWN_REASON,
                "cluster synchro is shutdown",
            );
            if update_status {
                self.update_status();
            }
            // Dropping the sender lets the publisher drain and exit.
            let publisher_running = {
                let mut tx = self
                    .update_status_tx
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                tx.take();
                self.update_status_rx
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_none()
            };
            if !publisher_running {
                // `run` was never invoked; nobody else will latch this.
                self.closed.cancel();
            }
        }
        self.closed.cancelled().await;
    }

    async fn status_publisher(self: Arc<Self>, mut receiver: mpsc::Receiver<()>) {
        while receiver.recv().await.is_some() {
            let status = self.gen_cluster_status();
            if let Err(err) = self
                .status_updater
                .update_cluster_status(&self.name, &status)
                .await
            {
                error!(
                    cluster = %self.name,
                    error = %err,
                    "failed to update cluster conditions and sync resources status"
                );
            }
        }
        info!(cluster = %self.name, "cluster synchro is shutdown");
        self.closed.cancel();
    }

    async fn shutdown_watchdog(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => return,
                _ = tokio::time::sleep(SHUTDOWN_WATCHDOG_INTERVAL) => {}
            }

            let mut shutdown_count = 0;
            let mut blocked: HashMap<String, Vec<String>> = HashMap::new();
            {
                let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
                for (gvr, synchro) in &registry.synchros {
                    let status = synchro.status();
                    if status.status == ResourceSyncStatus::Stop && status.reason.is_empty() {
                        shutdown_count += 1;
                        continue;
                    }
                    blocked
                        .entry(format!(
                            "{},{},{}",
                            status.status,
                            status.reason,
                            synchro.stage()
                        ))
                        .or_default()
                        .push(gvr.to_string());
                }
            }
            if self.closed.is_cancelled() {
                return;
            }
            warn!(
                cluster = %self.name,
                shutdown_synchros = shutdown_count,
                blocked_synchros = ?blocked,
                "cluster shutdown blocked"
            );
        }
    }

    // ------------------------------------------------------------------
    // Health monitor
    // ------------------------------------------------------------------

    async fn monitor(self: Arc<Self>) {
        let mut subscription = self.health_checker.subscribe();
        // A verdict published before this subscription was created would
        // otherwise go unseen.
        let current = subscription.borrow_and_update().clone();
        if current.healthy {
            self.on_health_transition(current);
        }
        loop {
            tokio::select! {
                biased;
                _ = self.closer.cancelled() => break,
                changed = subscription.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = subscription.borrow_and_update().clone();
                    self.on_health_transition(state);
                }
                // Resync the published document so per-resource condition
                // changes surface without a dedicated wakeup.
                _ = tokio::time::sleep(self.sync_config.intervals.health_probe) => {
                    self.update_status();
                }
            }
        }
    }

    fn on_health_transition(&self, state: HealthState) {
        if state.healthy {
            info!(cluster = %self.name, "cluster is healthy");
            self.set_healthy_condition(
                ConditionStatus::True,
                CLUSTER_HEALTHY_REASON,
                "cluster is reachable",
            );
            self.start_runner();
        } else {
            warn!(cluster = %self.name, message = %state.message, "cluster is unhealthy");
            self.set_healthy_condition(
                ConditionStatus::False,
                CLUSTER_UNHEALTHY_REASON,
                &state.message,
            );
            self.stop_runner();
        }
        self.update_status();
    }

    fn start_runner(&self) {
        self.desired_running.send_replace(true);
    }

    fn stop_runner(&self) {
        self.desired_running.send_replace(false);
    }

    // ------------------------------------------------------------------
    // Runner
    // ------------------------------------------------------------------

    /// Starts and stops upstream consumption as health flips. Exactly
    /// one handler token is live at any time; it is a child of the
    /// lifetime token, so shutdown stops everything through it too.
    async fn runner(self: Arc<Self>) {
        info!(cluster = %self.name, "cluster synchro runner is running...");
        let mut desired = self.desired_running.subscribe();

        'runner: loop {
            loop {
                if *desired.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = self.closer.cancelled() => break 'runner,
                    changed = desired.changed() => {
                        if changed.is_err() {
                            break 'runner;
                        }
                    }
                }
            }

            self.set_runner_state(RunnerState::Starting);
            let handler = self.closer.child_token();
            {
                let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
                registry.handler = Some(handler.clone());
                for synchro in registry.synchros.values() {
                    synchro.start(handler.clone());
                }
            }
            let discovery = self.discovery.clone();
            let discovery_stop = handler.clone();
            self.task_tracker
                .spawn(async move { discovery.start(discovery_stop).await });
            self.set_runner_state(RunnerState::Running);
            self.update_status();
            info!(cluster = %self.name, "dynamic discovery manager and resource synchros are started");

            loop {
                tokio::select! {
                    biased;
                    _ = self.closer.cancelled() => {
                        handler.cancel();
                        break 'runner;
                    }
                    changed = desired.changed() => {
                        if changed.is_err() {
                            handler.cancel();
                            break 'runner;
                        }
                        if !*desired.borrow_and_update() {
                            break;
                        }
                    }
                }
            }

            self.set_runner_state(RunnerState::Stopping);
            handler.cancel();
            {
                let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
                registry.handler = None;
            }
            self.set_runner_state(RunnerState::Idle);
            self.update_status();
            info!(cluster = %self.name, "dynamic discovery manager and resource synchros are stopped");
        }

        self.set_runner_state(RunnerState::Idle);
        info!(cluster = %self.name, "cluster synchro runner is stopped");
    }

    // ------------------------------------------------------------------
    // Plan refresh
    // ------------------------------------------------------------------

    fn spawn_refresher(self: Arc<Self>) {
        if self.refresher_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let refresher = self.clone();
        self.task_tracker.spawn(refresher.sync_resources_refresher());
    }

    async fn sync_resources_refresher(self: Arc<Self>) {
        info!(cluster = %self.name, "sync resources refresher is running");
        let receiver = self
            .refresh_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut receiver) = receiver else {
            return;
        };

        loop {
            tokio::select! {
                biased;
                _ = self.closer.cancelled() => return,
                wakeup = receiver.recv() => {
                    if wakeup.is_none() {
                        return;
                    }
                }
            }
            if self.closer.is_cancelled() {
                return;
            }
            self.refresh_sync_resources().await;
        }
    }

    /// One refresh pass: negotiate, merge status, reconcile the synchro
    /// registry against the plan, clean up watermarks of unplanned
    /// resources.
    ///
    /// A storage GVR already in the registry is never recreated, even if
    /// its config changed; the change takes effect only after the GVR
    /// leaves and re-enters the plan. Known limitation, kept on purpose.
    async fn refresh_sync_resources(&self) {
        let desired = self
            .sync_resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(desired) = desired else {
            return;
        };

        let (status, plan) = self.negotiator.negotiate_sync_resources(&desired);
        let previous = self
            .group_resource_status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut deleted = status.merge(previous.as_deref());

        status.enable_concurrent();
        let status = Arc::new(status);
        *self
            .group_resource_status
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(status.clone());

        // Multiple sync GVRs may map to the same storage resource; every
        // storage-level transition fans out to all of them.
        let storage_to_sync = status.storage_gvr_to_sync_gvrs();
        let update_sync_conditions =
            |storage_gvr: &GroupVersionResource,
             sync_status: ResourceSyncStatus,
             reason: &str,
             message: &str| {
                if let Some(sync_gvrs) = storage_to_sync.get(storage_gvr) {
                    for gvr in sync_gvrs {
                        status.update_sync_condition(gvr, sync_status, reason, message);
                    }
                }
            };

        let plan_keys: std::collections::HashSet<GroupVersionResource> =
            plan.keys().cloned().collect();
        let mut planned: Vec<_> = plan.into_iter().collect();
        planned.sort_by(|a, b| a.0.cmp(&b.0));

        for (storage_gvr, config) in planned {
            let existing = self
                .registry
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .synchros
                .get(&storage_gvr)
                .cloned();
            if let Some(synchro) = existing {
                // Config changes are ignored for live synchros. A synchro
                // parked on an unrecoverable storage error is re-armed
                // under the live handler token.
                let current = synchro.status();
                if current.status == ResourceSyncStatus::Pending
                    && current.reason == STORAGE_ERROR_REASON
                {
                    let handler = self
                        .registry
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .handler
                        .clone();
                    if let Some(handler) = handler {
                        if !handler.is_cancelled() {
                            synchro.start(handler);
                        }
                    }
                }
                continue;
            }

            let resource_storage = match self
                .storage
                .new_resource_storage(config.storage_config.clone())
                .await
            {
                Ok(resource_storage) => resource_storage,
                Err(err) => {
                    error!(
                        cluster = %self.name,
                        storage_resource = %storage_gvr,
                        error = %err,
                        "failed to create resource storage"
                    );
                    update_sync_conditions(
                        &storage_gvr,
                        ResourceSyncStatus::Pending,
                        SYNCHRO_CREATE_FAILED_REASON,
                        &format!("new resource storage failed: {err}"),
                    );
                    continue;
                }
            };

            let resource_versions = {
                let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
                registry
                    .resource_versions
                    .entry(storage_gvr.clone())
                    .or_default()
                    .clone()
            };

            let metrics_store = self
                .sync_config
                .metrics_store_builder
                .as_ref()
                .and_then(|builder| builder.metrics_store(&self.name, &config.sync_resource));
            let event = config.sync_events.then(|| EventConfig {
                lister_watcher: self.events_lister_watcher.clone(),
                resource_versions: resource_versions.events.clone(),
            });

            let synchro_config = SynchroConfig {
                group_version_resource: config.sync_resource.clone(),
                kind: config.kind.clone(),
                lister_watcher: self.lister_watcher_factory.for_resource(&config.sync_resource),
                convertor: config.convertor.clone(),
                metrics_store,
                resource_versions: resource_versions.resources.clone(),
                page_size: self.sync_config.page_size_for_resource_sync,
                resource_storage,
                event,
            };
            let synchro = match self
                .synchro_factory
                .new_resource_synchro(&self.name, synchro_config)
                .await
            {
                Ok(synchro) => synchro,
                Err(err) => {
                    error!(
                        cluster = %self.name,
                        storage_resource = %storage_gvr,
                        error = %err,
                        "failed to create resource synchro"
                    );
                    update_sync_conditions(
                        &storage_gvr,
                        ResourceSyncStatus::Pending,
                        SYNCHRO_CREATE_FAILED_REASON,
                        &format!("new resource synchro failed: {err}"),
                    );
                    continue;
                }
            };

            let lifetime = self.closer.clone();
            let worker = synchro.clone();
            self.task_tracker
                .spawn(async move { worker.run(lifetime).await });

            let handler = {
                let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
                registry.synchros.insert(storage_gvr.clone(), synchro.clone());
                registry.handler.clone()
            };

            // The creation-time reasons are done with; the synchro
            // reports its own condition from here on.
            update_sync_conditions(&storage_gvr, ResourceSyncStatus::Unknown, "", "");

            if let Some(handler) = handler {
                if !handler.is_cancelled() {
                    synchro.start(handler);
                }
            }
        }

        // Close synchros whose storage GVR left the plan.
        let removed: Vec<GroupVersionResource> = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            let mut removed: Vec<_> = registry
                .synchros
                .keys()
                .filter(|gvr| !plan_keys.contains(gvr))
                .cloned()
                .collect();
            removed.sort();
            removed
        };
        for storage_gvr in removed {
            let synchro = self
                .registry
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .synchros
                .get(&storage_gvr)
                .cloned();
            if let Some(synchro) = synchro {
                let completion = synchro.close();
                tokio::select! {
                    _ = completion.cancelled() => {}
                    _ = self.closer.cancelled() => return,
                }
                update_sync_conditions(
                    &storage_gvr,
                    ResourceSyncStatus::Stop,
                    SYNCHRO_REMOVED_REASON,
                    "the resource synchro is removed",
                );
                self.registry
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .synchros
                    .remove(&storage_gvr);
            }
        }

        // Clean storage for watermark-tracked resources no longer
        // planned. The in-memory entry goes away regardless: even a
        // failed clean may have removed rows.
        let stale: Vec<GroupVersionResource> = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            let mut stale: Vec<_> = registry
                .resource_versions
                .keys()
                .filter(|gvr| !plan_keys.contains(gvr))
                .cloned()
                .collect();
            stale.sort();
            stale
        };
        for storage_gvr in stale {
            self.registry
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .resource_versions
                .remove(&storage_gvr);

            match self
                .storage
                .clean_cluster_resource(&self.name, &storage_gvr)
                .await
            {
                Ok(()) => {}
                Err(err) => {
                    error!(
                        cluster = %self.name,
                        storage_resource = %storage_gvr,
                        error = %err,
                        "failed to clean cluster resource"
                    );
                    update_sync_conditions(
                        &storage_gvr,
                        ResourceSyncStatus::Stop,
                        CLEAN_RESOURCE_FAILED_REASON,
                        &err.to_string(),
                    );
                    if let Some(sync_gvrs) = storage_to_sync.get(&storage_gvr) {
                        for gvr in sync_gvrs {
                            // Keep the failed triple visible.
                            deleted.remove(gvr);
                        }
                    }
                }
            }
        }

        for gvr in &deleted {
            status.delete_version(gvr);
        }
        status.disable_concurrent();
        self.update_status();
    }

    // ------------------------------------------------------------------
    // Status assembly
    // ------------------------------------------------------------------

    fn gen_cluster_status(&self) -> ClusterStatus {
        let mut cluster_status = ClusterStatus {
            version: self.discovery.server_version(),
            conditions: vec![
                self.running_condition
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone(),
                self.healthy_condition
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone(),
            ],
            sync_resources: Vec::new(),
        };

        let group_status = self
            .group_resource_status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(group_status) = group_status else {
            // Sync resources have not been negotiated yet.
            return cluster_status;
        };

        let mut statuses = group_status.load_group_resources_statuses();
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        for group in &mut statuses {
            for resource in &mut group.resources {
                let gr = GroupResource::new(&*group.group, &*resource.name);
                for cond in &mut resource.sync_conditions {
                    let storage_gvr = cond.storage_gvr(&gr);
                    match registry.synchros.get(&storage_gvr) {
                        Some(synchro) => {
                            let synced = synchro.group_version_resource();
                            if synced.group_resource() != gr {
                                cond.sync_resource = Some(synced.group_resource());
                            }
                            if synced.version != cond.version {
                                cond.sync_version = Some(synced.version.clone());
                            }
                            let snapshot = synchro.status();
                            cond.status = snapshot.status;
                            cond.reason = snapshot.reason;
                            cond.message = snapshot.message;
                            cond.initial_list_phase = snapshot.initial_list_phase;
                            cond.last_transition_time = snapshot.last_transition_time;
                        }
                        None => {
                            if cond.reason.is_empty() {
                                cond.reason = RESOURCE_SYNCHRO_NOT_FOUND_REASON.to_string();
                            }
                            if cond.message.is_empty() {
                                cond.message = "not found resource synchro".to_string();
                            }
                        }
                    }
                }
            }
        }
        drop(registry);
        cluster_status.sync_resources = statuses;
        cluster_status
    }
}
