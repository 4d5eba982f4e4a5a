// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster reachability checking.
//!
//! The checker probes on a fixed cadence and publishes the latest
//! verdict through a watch channel; the monitor task of the cluster
//! synchro subscribes and gates the runner on transitions. Subscribers
//! are only woken when the verdict flips, not on every probe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::upstream::{HealthProbe, UpstreamError};

/// Latest reachability verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthState {
    /// Whether the last probe succeeded.
    pub healthy: bool,
    /// Failure detail when unhealthy.
    pub message: String,
}

impl HealthState {
    fn unknown() -> Self {
        Self {
            healthy: false,
            message: "health monitor has not probed yet".to_string(),
        }
    }
}

/// Periodically probes cluster reachability.
pub struct HealthChecker {
    cluster: String,
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    timeout: Duration,
    state_tx: watch::Sender<HealthState>,
}

impl HealthChecker {
    /// Create a checker; nothing is probed until [`run`](Self::run).
    pub fn new(
        cluster: &str,
        probe: Arc<dyn HealthProbe>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(HealthState::unknown());
        Self {
            cluster: cluster.to_string(),
            probe,
            interval,
            timeout,
            state_tx,
        }
    }

    /// Subscribe to verdict transitions.
    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.state_tx.subscribe()
    }

    /// The current verdict.
    pub fn state(&self) -> HealthState {
        self.state_tx.borrow().clone()
    }

    /// Probe until the token fires. The first probe runs immediately.
    pub async fn run(&self, stop: CancellationToken) {
        debug!(cluster = %self.cluster, interval_secs = self.interval.as_secs(), "health checker started");
        loop {
            let fresh = self.probe_once().await;
            self.state_tx.send_if_modified(|state| {
                let flipped = state.healthy != fresh.healthy;
                *state = fresh.clone();
                // Only verdict flips wake subscribers.
                flipped
            });

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        debug!(cluster = %self.cluster, "health checker stopped");
    }

    async fn probe_once(&self) -> HealthState {
        let result = tokio::time::timeout(self.timeout, self.probe.check()).await;
        match result {
            Ok(Ok(())) => HealthState {
                healthy: true,
                message: String::new(),
            },
            Ok(Err(err)) => {
                warn!(cluster = %self.cluster, error = %err, "cluster health probe failed");
                HealthState {
                    healthy: false,
                    message: err.to_string(),
                }
            }
            Err(_) => {
                warn!(cluster = %self.cluster, timeout_secs = self.timeout.as_secs(), "cluster health probe timed out");
                HealthState {
                    healthy: false,
                    message: format!("health probe timed out after {:?}", self.timeout),
                }
            }
        }
    }
}

/// Reachability probe that dials the cluster endpoint directly.
///
/// Used when the standalone-TCP flag is set: the probe gets its own
/// dialer with an explicit connect timeout and keep-alive instead of
/// sharing the connector's transport.
pub struct TcpHealthProbe {
    address: String,
    connect_timeout: Duration,
    keep_alive: Option<Duration>,
}

impl TcpHealthProbe {
    /// Probe `host:port` with the given dial timeout and keep-alive.
    pub fn new(address: &str, connect_timeout: Duration, keep_alive: Option<Duration>) -> Self {
        Self {
            address: address.to_string(),
            connect_timeout,
            keep_alive,
        }
    }
}

#[async_trait]
impl HealthProbe for TcpHealthProbe {
    async fn check(&self) -> Result<(), UpstreamError> {
        let connect = TcpStream::connect(&self.address);
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                UpstreamError::Connect(format!(
                    "dial {} timed out after {:?}",
                    self.address, self.connect_timeout
                ))
            })?
            .map_err(|err| UpstreamError::Connect(format!("dial {}: {}", self.address, err)))?;

        if let Some(keep_alive) = self.keep_alive {
            let keepalive = TcpKeepalive::new().with_time(keep_alive);
            SockRef::from(&stream)
                .set_tcp_keepalive(&keepalive)
                .map_err(|err| UpstreamError::Connect(format!("set keep-alive: {}", err)))?;
        }
        Ok(())
    }
}
