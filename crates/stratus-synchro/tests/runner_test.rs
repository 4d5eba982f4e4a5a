// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner/monitor tests: health-gated start/stop, flap handling and
//! deferred starts for reconcilers created while unhealthy.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use stratus_api::{
    ClusterGroupResources, ConditionStatus, GroupVersionResource, CLUSTER_HEALTHY_CONDITION,
};
use stratus_synchro::{ClusterSynchro, RunnerState};

use common::{
    api_resource, raw_object, test_config, wait_until, FakeConnector, FakeDiscoveryClient,
    MemoryStorageFactory, RecordingStatusUpdater,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn pods_gvr() -> GroupVersionResource {
    GroupVersionResource::new("", "v1", "pods")
}

fn deployments_gvr() -> GroupVersionResource {
    GroupVersionResource::new("apps", "v1", "deployments")
}

fn desired(group: &str, resources: &[&str]) -> ClusterGroupResources {
    ClusterGroupResources {
        group: group.to_string(),
        versions: Vec::new(),
        resources: resources.iter().map(|r| r.to_string()).collect(),
        sync_events: false,
    }
}

async fn start_engine() -> (
    Arc<ClusterSynchro>,
    Arc<FakeConnector>,
    Arc<MemoryStorageFactory>,
    Arc<RecordingStatusUpdater>,
    CancellationToken,
    tokio::task::JoinHandle<()>,
) {
    let surface = vec![
        api_resource("", "v1", "pods", "Pod"),
        api_resource("apps", "v1", "deployments", "Deployment"),
    ];
    let connector = FakeConnector::new(FakeDiscoveryClient::new("v1.29.0", surface));
    let storage = MemoryStorageFactory::new();
    let updater = RecordingStatusUpdater::new();
    let synchro = ClusterSynchro::new(
        "c1",
        connector.clone(),
        storage.clone(),
        updater.clone(),
        test_config(),
    )
    .await
    .expect("cluster synchro construction");

    let shutdown = CancellationToken::new();
    let handle = {
        let synchro = synchro.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { synchro.run(shutdown).await })
    };
    (synchro, connector, storage, updater, shutdown, handle)
}

#[tokio::test]
async fn test_unhealthy_cluster_stops_consumption_and_restores() {
    let (synchro, connector, _storage, updater, shutdown, handle) = start_engine().await;

    let pods = connector.lister_watchers.get(&pods_gvr());
    pods.set_objects(vec![raw_object("v1", "Pod", "p1", "api-0", "5")]);
    synchro.set_resources(vec![desired("", &["pods"])], false);

    assert!(
        wait_until(TIMEOUT, || pods.live_watches() == 1).await,
        "pods watch never opened"
    );
    assert_eq!(synchro.runner_state(), RunnerState::Running);
    let watches_before = pods.watch_calls();

    // Health goes down: the handler token closes and every stream drops.
    connector.probe.set_healthy(false);
    assert!(
        wait_until(TIMEOUT, || pods.live_watches() == 0).await,
        "watch stream survived unhealthy transition"
    );
    assert!(
        wait_until(TIMEOUT, || synchro.runner_state() == RunnerState::Idle).await,
        "runner never went idle"
    );
    assert!(
        wait_until(TIMEOUT, || {
            updater
                .latest()
                .and_then(|status| {
                    status
                        .conditions
                        .iter()
                        .find(|c| c.condition_type == CLUSTER_HEALTHY_CONDITION)
                        .cloned()
                })
                .map(|c| c.status == ConditionStatus::False)
                .unwrap_or(false)
        })
        .await,
        "unhealthy condition never published"
    );

    // Health restores: exactly one fresh informer epoch per reconciler.
    connector.probe.set_healthy(true);
    assert!(
        wait_until(TIMEOUT, || pods.live_watches() == 1).await,
        "watch never reopened after healthy restore"
    );
    assert_eq!(synchro.runner_state(), RunnerState::Running);
    assert_eq!(
        pods.watch_calls(),
        watches_before + 1,
        "expected exactly one new watch after restore"
    );

    shutdown.cancel();
    tokio::time::timeout(TIMEOUT, handle)
        .await
        .expect("run did not return")
        .expect("run task");
    assert!(pods.live_watches() == 0, "watch survived shutdown");
}

#[tokio::test]
async fn test_rapid_health_flap_leaves_single_live_epoch() {
    let (synchro, connector, _storage, _updater, shutdown, handle) = start_engine().await;

    let pods = connector.lister_watchers.get(&pods_gvr());
    synchro.set_resources(vec![desired("", &["pods"])], false);
    assert!(
        wait_until(TIMEOUT, || pods.live_watches() == 1).await,
        "pods watch never opened"
    );

    // Flap several times faster than anything downstream can react.
    for _ in 0..5 {
        connector.probe.set_healthy(false);
        tokio::time::sleep(Duration::from_millis(5)).await;
        connector.probe.set_healthy(true);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The runner converges to Running with exactly one live epoch.
    assert!(
        wait_until(TIMEOUT, || {
            synchro.runner_state() == RunnerState::Running && pods.live_watches() == 1
        })
        .await,
        "runner did not converge after flapping"
    );
    assert!(pods.live_watches() <= 1);

    shutdown.cancel();
    tokio::time::timeout(TIMEOUT, handle)
        .await
        .expect("run did not return")
        .expect("run task");
}

#[tokio::test]
async fn test_reconciler_created_while_unhealthy_starts_later() {
    let (synchro, connector, storage, _updater, shutdown, handle) = start_engine().await;

    synchro.set_resources(vec![desired("", &["pods"])], false);
    let pods = connector.lister_watchers.get(&pods_gvr());
    assert!(
        wait_until(TIMEOUT, || pods.live_watches() == 1).await,
        "pods watch never opened"
    );

    // Cluster goes unhealthy; a refresh then adds deployments. The
    // reconciler is constructed but consumption is deferred.
    connector.probe.set_healthy(false);
    assert!(wait_until(TIMEOUT, || synchro.runner_state() == RunnerState::Idle).await);

    synchro.set_resources(
        vec![desired("", &["pods"]), desired("apps", &["deployments"])],
        false,
    );
    assert!(
        wait_until(TIMEOUT, || storage.storage(&deployments_gvr()).is_some()).await,
        "deployments reconciler never constructed"
    );
    let deployments = connector.lister_watchers.get(&deployments_gvr());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        deployments.watch_calls(),
        0,
        "consumption must be deferred while unhealthy"
    );

    // Healthy again: the deferred reconciler starts exactly once.
    connector.probe.set_healthy(true);
    assert!(
        wait_until(TIMEOUT, || deployments.live_watches() == 1).await,
        "deferred reconciler never started"
    );
    assert_eq!(deployments.watch_calls(), 1);

    shutdown.cancel();
    tokio::time::timeout(TIMEOUT, handle)
        .await
        .expect("run did not return")
        .expect("run task");
}
