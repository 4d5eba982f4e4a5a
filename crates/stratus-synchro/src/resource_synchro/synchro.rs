// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The built-in resource synchro.
//!
//! Two halves cooperate through a bounded queue: informer epochs
//! (list + watch against the upstream, one epoch per handler token) feed
//! deltas in; the persistence worker started by `run` applies them to
//! storage and maintains the shared watermark maps. Upstream events are
//! applied to storage in the order observed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stratus_api::{
    GroupVersion, GroupVersionResource, InitialListPhase, RawObject, ResourceSyncStatus,
    WatchEvent,
};
use stratus_storage::{ResourceStorage, StorageError, WatermarkMap};

use crate::metrics::{self, MetricsStore, MetricsWriter};
use crate::upstream::{ListOptions, ListerWatcher, ObjectConvertor, WatchOptions};

use super::{
    EventConfig, ResourceSynchro, SynchroConfig, SynchroStage, SynchroStatus, PAUSED_REASON,
    STORAGE_ERROR_REASON, UPSTREAM_ERROR_REASON,
};

const QUEUE_CAPACITY: usize = 256;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

enum Delta {
    Apply(RawObject),
    Delete(RawObject),
    Event(RawObject),
    EventGone(String),
}

#[derive(Default)]
struct Epoch {
    token: Option<CancellationToken>,
    live: Option<Arc<AtomicBool>>,
    handle: Option<JoinHandle<()>>,
}

enum WatchEnd {
    Cancelled,
    Expired,
    Failed(String),
}

/// The built-in list/watch → convert → persist reconciler.
pub struct DefaultResourceSynchro {
    cluster: String,
    gvr: GroupVersionResource,
    storage_group_version: GroupVersion,
    lister_watcher: Arc<dyn ListerWatcher>,
    convertor: Option<Arc<dyn ObjectConvertor>>,
    storage: Arc<dyn ResourceStorage>,
    resource_versions: WatermarkMap,
    event: Option<EventConfig>,
    page_size: i64,
    metrics_store: Option<MetricsStore>,

    queue_tx: mpsc::Sender<Delta>,
    queue_rx: Mutex<Option<mpsc::Receiver<Delta>>>,

    status: Mutex<SynchroStatus>,
    stage: Mutex<SynchroStage>,
    storage_paused: AtomicBool,

    epoch: Mutex<Epoch>,
    close_token: CancellationToken,
    completed: CancellationToken,

    self_ref: Weak<DefaultResourceSynchro>,
}

impl DefaultResourceSynchro {
    /// Build a synchro; `run` must be launched for it to make progress.
    pub fn new(cluster: &str, config: SynchroConfig) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let storage_group_version = config
            .resource_storage
            .storage_config()
            .group_version_resource
            .group_version();
        Arc::new_cyclic(|self_ref| Self {
            cluster: cluster.to_string(),
            gvr: config.group_version_resource,
            storage_group_version,
            lister_watcher: config.lister_watcher,
            convertor: config.convertor,
            storage: config.resource_storage,
            resource_versions: config.resource_versions,
            event: config.event,
            page_size: config.page_size,
            metrics_store: config.metrics_store,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            status: Mutex::new(SynchroStatus {
                status: ResourceSyncStatus::Unknown,
                reason: String::new(),
                message: String::new(),
                initial_list_phase: InitialListPhase::NotStarted,
                last_transition_time: Utc::now(),
            }),
            stage: Mutex::new(SynchroStage::Pending),
            storage_paused: AtomicBool::new(false),
            epoch: Mutex::new(Epoch::default()),
            close_token: CancellationToken::new(),
            completed: CancellationToken::new(),
            self_ref: self_ref.clone(),
        })
    }

    fn set_status(&self, status: ResourceSyncStatus, reason: &str, message: &str) {
        let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if current.status == status && current.reason == reason && current.message == message {
            return;
        }
        current.status = status;
        current.reason = reason.to_string();
        current.message = message.to_string();
        current.last_transition_time = Utc::now();
    }

    fn set_phase(&self, phase: InitialListPhase) {
        let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        current.initial_list_phase = phase;
    }

    fn set_stage(&self, stage: SynchroStage) {
        *self.stage.lock().unwrap_or_else(PoisonError::into_inner) = stage;
    }

    fn stopped(&self, token: &CancellationToken) -> bool {
        token.is_cancelled() || self.close_token.is_cancelled()
    }

    async fn enqueue(&self, delta: Delta, token: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = token.cancelled() => false,
            _ = self.close_token.cancelled() => false,
            sent = self.queue_tx.send(delta) => sent.is_ok(),
        }
    }

    async fn sleep_unless_stopped(&self, duration: Duration, token: &CancellationToken) {
        tokio::select! {
            biased;
            _ = token.cancelled() => {}
            _ = self.close_token.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    // ------------------------------------------------------------------
    // Persistence worker
    // ------------------------------------------------------------------

    /// Apply one delta, retrying recoverable storage failures locally.
    async fn apply_delta(&self, delta: Delta, lifetime: &CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let err = match self.apply_once(&delta).await {
                Ok(()) => return,
                Err(err) => err,
            };

            metrics::count_storage_failure(&self.cluster, &self.gvr, err.is_recoverable());
            if err.is_recoverable() {
                self.set_status(ResourceSyncStatus::Syncing, "", &err.to_string());
                tokio::select! {
                    biased;
                    _ = lifetime.cancelled() => return,
                    _ = self.close_token.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }

            warn!(
                cluster = %self.cluster,
                resource = %self.gvr,
                error = %err,
                "unrecoverable storage error, pausing resource synchro"
            );
            self.set_status(ResourceSyncStatus::Pending, STORAGE_ERROR_REASON, &err.to_string());
            self.storage_paused.store(true, Ordering::SeqCst);
            let token = self
                .epoch
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .token
                .clone();
            if let Some(token) = token {
                token.cancel();
            }
            return;
        }
    }

    async fn apply_once(&self, delta: &Delta) -> Result<(), StorageError> {
        match delta {
            Delta::Apply(obj) => {
                let obj = match &self.convertor {
                    Some(convertor) => {
                        match convertor.convert(obj.clone(), &self.storage_group_version) {
                            Ok(converted) => converted,
                            Err(err) => {
                                warn!(
                                    cluster = %self.cluster,
                                    resource = %self.gvr,
                                    uid = %obj.uid,
                                    error = %err,
                                    "failed to convert object, skipping"
                                );
                                return Ok(());
                            }
                        }
                    }
                    None => obj.clone(),
                };
                let watermark = obj.watermark();
                match self.resource_versions.get(&obj.uid) {
                    Some(known) if known == watermark => return Ok(()),
                    Some(_) => self.storage.update(&self.cluster, &obj).await?,
                    None => self.storage.create(&self.cluster, &obj).await?,
                }
                self.resource_versions.insert(&*obj.uid, watermark);
                metrics::count_applied(&self.cluster, &self.gvr);
                if let Some(store) = &self.metrics_store {
                    store.record(&obj);
                }
            }
            Delta::Delete(obj) => {
                let obj = self.storage.convert_deleted_object(obj.clone())?;
                self.storage.delete(&self.cluster, &obj).await?;
                self.resource_versions.remove(&obj.uid);
                metrics::count_deleted(&self.cluster, &self.gvr);
                if let Some(store) = &self.metrics_store {
                    store.forget(&obj.uid);
                }
            }
            Delta::Event(event) => {
                let Some(config) = &self.event else {
                    return Ok(());
                };
                let watermark = event.watermark();
                if config.resource_versions.get(&event.uid) == Some(watermark.clone()) {
                    return Ok(());
                }
                self.storage.record_event(&self.cluster, event).await?;
                config.resource_versions.insert(&*event.uid, watermark);
            }
            Delta::EventGone(uid) => {
                if let Some(config) = &self.event {
                    config.resource_versions.remove(uid);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Informer epochs
    // ------------------------------------------------------------------

    async fn informer_epoch(
        self: Arc<Self>,
        token: CancellationToken,
        live: Arc<AtomicBool>,
    ) {
        match &self.event {
            Some(config) => {
                let events = config.clone();
                futures::join!(
                    self.resource_pipeline(&token),
                    self.event_pipeline(&events, &token)
                );
            }
            None => self.resource_pipeline(&token).await,
        }

        live.store(false, Ordering::SeqCst);
        // A pause keeps the synchro alive; shutdown status is written by
        // the persistence worker when it exits.
        if !self.close_token.is_cancelled() && !self.storage_paused.load(Ordering::SeqCst) {
            self.set_stage(SynchroStage::Paused);
            self.set_status(ResourceSyncStatus::Stop, PAUSED_REASON, "");
        }
    }

    async fn resource_pipeline(&self, token: &CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if self.stopped(token) {
                return;
            }
            self.set_stage(SynchroStage::List);
            self.set_phase(InitialListPhase::InProgress);
            self.set_status(ResourceSyncStatus::Syncing, "", "");

            let revision = match self.list_all(token).await {
                Ok(Some(revision)) => {
                    self.set_phase(InitialListPhase::Completed);
                    backoff = INITIAL_BACKOFF;
                    revision
                }
                Ok(None) => return,
                Err(err) => {
                    self.set_status(
                        ResourceSyncStatus::Syncing,
                        UPSTREAM_ERROR_REASON,
                        &err.to_string(),
                    );
                    self.sleep_unless_stopped(backoff, token).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            self.set_stage(SynchroStage::Watch);
            self.set_status(ResourceSyncStatus::Syncing, "", "");
            match self.watch_from(&revision, token).await {
                WatchEnd::Cancelled => return,
                WatchEnd::Expired => continue,
                WatchEnd::Failed(message) => {
                    self.set_status(ResourceSyncStatus::Syncing, UPSTREAM_ERROR_REASON, &message);
                    self.sleep_unless_stopped(INITIAL_BACKOFF, token).await;
                }
            }
        }
    }

    /// Enumerate every page; returns the collection revision, or `None`
    /// when cancelled mid-enumeration.
    async fn list_all(
        &self,
        token: &CancellationToken,
    ) -> Result<Option<String>, crate::upstream::UpstreamError> {
        let mut continue_token = None;
        let mut seen: HashSet<String> = HashSet::new();
        let mut revision = String::new();

        loop {
            if self.stopped(token) {
                return Ok(None);
            }
            let page = self
                .lister_watcher
                .list(ListOptions {
                    limit: self.page_size,
                    continue_token: continue_token.take(),
                })
                .await?;
            revision = page.resource_version;
            for obj in page.items {
                seen.insert(obj.uid.clone());
                if !self.enqueue(Delta::Apply(obj), token).await {
                    return Ok(None);
                }
            }
            match page.continue_token {
                Some(next) => continue_token = Some(next),
                None => break,
            }
        }

        // UIDs tracked in storage but absent from the enumeration were
        // deleted while nobody watched.
        for uid in self.resource_versions.uids() {
            if !seen.contains(&uid) {
                if !self
                    .enqueue(Delta::Delete(RawObject::tombstone(uid)), token)
                    .await
                {
                    return Ok(None);
                }
            }
        }
        Ok(Some(revision))
    }

    async fn watch_from(&self, revision: &str, token: &CancellationToken) -> WatchEnd {
        let mut stream = match self
            .lister_watcher
            .watch(WatchOptions {
                resource_version: revision.to_string(),
            })
            .await
        {
            Ok(stream) => stream,
            Err(err) if err.is_expired() => return WatchEnd::Expired,
            Err(err) => return WatchEnd::Failed(err.to_string()),
        };

        loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => return WatchEnd::Cancelled,
                _ = self.close_token.cancelled() => return WatchEnd::Cancelled,
                item = stream.next() => item,
            };
            let event = match item {
                None => return WatchEnd::Failed("watch stream ended".to_string()),
                Some(Err(err)) if err.is_expired() => return WatchEnd::Expired,
                Some(Err(err)) => return WatchEnd::Failed(err.to_string()),
                Some(Ok(event)) => event,
            };
            let delta = match event {
                WatchEvent::Added(obj) | WatchEvent::Modified(obj) => Delta::Apply(obj),
                WatchEvent::Deleted(obj) => Delta::Delete(obj),
                WatchEvent::Bookmark(_) => continue,
            };
            if !self.enqueue(delta, token).await {
                return WatchEnd::Cancelled;
            }
        }
    }

    /// Mirror upstream events through `record_event`; watermarks live in
    /// the events submap. Event deletions only prune watermarks.
    async fn event_pipeline(&self, config: &EventConfig, token: &CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if self.stopped(token) {
                return;
            }

            let revision = match self.list_events(config, token).await {
                Ok(Some(revision)) => {
                    backoff = INITIAL_BACKOFF;
                    revision
                }
                Ok(None) => return,
                Err(err) => {
                    debug!(
                        cluster = %self.cluster,
                        resource = %self.gvr,
                        error = %err,
                        "event list failed"
                    );
                    self.sleep_unless_stopped(backoff, token).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            match self.watch_events_from(config, &revision, token).await {
                WatchEnd::Cancelled => return,
                WatchEnd::Expired => continue,
                WatchEnd::Failed(_) => {
                    self.sleep_unless_stopped(INITIAL_BACKOFF, token).await;
                }
            }
        }
    }

    async fn list_events(
        &self,
        config: &EventConfig,
        token: &CancellationToken,
    ) -> Result<Option<String>, crate::upstream::UpstreamError> {
        let mut continue_token = None;
        let mut seen: HashSet<String> = HashSet::new();
        let mut revision = String::new();

        loop {
            if self.stopped(token) {
                return Ok(None);
            }
            let page = config
                .lister_watcher
                .list(ListOptions {
                    limit: self.page_size,
                    continue_token: continue_token.take(),
                })
                .await?;
            revision = page.resource_version;
            for event in page.items {
                seen.insert(event.uid.clone());
                if !self.enqueue(Delta::Event(event), token).await {
                    return Ok(None);
                }
            }
            match page.continue_token {
                Some(next) => continue_token = Some(next),
                None => break,
            }
        }

        for uid in config.resource_versions.uids() {
            if !seen.contains(&uid) {
                if !self.enqueue(Delta::EventGone(uid), token).await {
                    return Ok(None);
                }
            }
        }
        Ok(Some(revision))
    }

    async fn watch_events_from(
        &self,
        config: &EventConfig,
        revision: &str,
        token: &CancellationToken,
    ) -> WatchEnd {
        let mut stream = match config
            .lister_watcher
            .watch(WatchOptions {
                resource_version: revision.to_string(),
            })
            .await
        {
            Ok(stream) => stream,
            Err(err) if err.is_expired() => return WatchEnd::Expired,
            Err(err) => return WatchEnd::Failed(err.to_string()),
        };

        loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => return WatchEnd::Cancelled,
                _ = self.close_token.cancelled() => return WatchEnd::Cancelled,
                item = stream.next() => item,
            };
            let delta = match item {
                None => return WatchEnd::Failed("event watch stream ended".to_string()),
                Some(Err(err)) if err.is_expired() => return WatchEnd::Expired,
                Some(Err(err)) => return WatchEnd::Failed(err.to_string()),
                Some(Ok(WatchEvent::Added(event))) | Some(Ok(WatchEvent::Modified(event))) => {
                    Delta::Event(event)
                }
                Some(Ok(WatchEvent::Deleted(event))) => Delta::EventGone(event.uid),
                Some(Ok(WatchEvent::Bookmark(_))) => continue,
            };
            if !self.enqueue(delta, token).await {
                return WatchEnd::Cancelled;
            }
        }
    }
}

#[async_trait]
impl ResourceSynchro for DefaultResourceSynchro {
    async fn run(&self, lifetime: CancellationToken) {
        let receiver = self
            .queue_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut receiver) = receiver else {
            warn!(cluster = %self.cluster, resource = %self.gvr, "resource synchro run invoked twice");
            return;
        };
        debug!(cluster = %self.cluster, resource = %self.gvr, "resource synchro is running");

        loop {
            let delta = tokio::select! {
                biased;
                _ = lifetime.cancelled() => break,
                _ = self.close_token.cancelled() => break,
                delta = receiver.recv() => delta,
            };
            match delta {
                Some(delta) => self.apply_delta(delta, &lifetime).await,
                None => break,
            }
        }

        // Stop the informer epoch (it normally stops with its handler
        // token; `close` alone must stop it too) and drain what it
        // already queued.
        let token = {
            let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
            epoch.token.take()
        };
        if let Some(token) = token {
            token.cancel();
        }
        while let Ok(delta) = receiver.try_recv() {
            if let Err(err) = self.apply_once(&delta).await {
                warn!(
                    cluster = %self.cluster,
                    resource = %self.gvr,
                    error = %err,
                    "failed to drain delta during shutdown"
                );
            }
        }
        let handle = {
            let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
            epoch.handle.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.set_stage(SynchroStage::Closed);
        self.set_status(ResourceSyncStatus::Stop, "", "");
        debug!(cluster = %self.cluster, resource = %self.gvr, "resource synchro is stopped");
        self.completed.cancel();
    }

    fn start(&self, handler: CancellationToken) {
        if self.close_token.is_cancelled() || handler.is_cancelled() {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(live) = &epoch.live {
            if live.load(Ordering::SeqCst) {
                // One live informer epoch at a time, whatever the token.
                return;
            }
        }
        self.storage_paused.store(false, Ordering::SeqCst);
        let token = handler.child_token();
        let live = Arc::new(AtomicBool::new(true));
        epoch.token = Some(token.clone());
        epoch.live = Some(live.clone());
        epoch.handle = Some(tokio::spawn(this.informer_epoch(token, live)));
    }

    fn close(&self) -> CancellationToken {
        self.close_token.cancel();
        self.completed.clone()
    }

    fn status(&self) -> SynchroStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn stage(&self) -> SynchroStage {
        *self.stage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn group_version_resource(&self) -> GroupVersionResource {
        self.gvr.clone()
    }

    fn metrics_writer(&self) -> Option<MetricsWriter> {
        self.metrics_store.as_ref().map(MetricsStore::writer)
    }
}
