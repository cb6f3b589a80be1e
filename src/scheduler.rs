//! Scheduler / Runtime Core (C8): the three periodic activities that drive
//! the engine forward between driver events (spec §4.8).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::driver::Driver;
use crate::mac::Mac;
use crate::orchestrator::Orchestrator;
use crate::registry::{PeerRegistry, PeerState};
use crate::scoring::{self, SelectionParams};

/// Owns the discovery loop, cleanup sweep, and the bounded shutdown drain.
/// Holds no state of its own beyond the shared registry/orchestrator/driver
/// handles; every periodic task is plain `tokio::spawn` + `tokio::time::
/// interval`, matching the driver-discovery loop idiom this crate's BLE
/// scan/connection-manager/cleanup tasks are grounded on.
pub struct Scheduler {
    registry: PeerRegistry,
    orchestrator: Arc<Orchestrator>,
    driver: Arc<dyn Driver>,
    config: EngineConfig,
}

impl Scheduler {
    pub fn new(
        registry: PeerRegistry,
        orchestrator: Arc<Orchestrator>,
        driver: Arc<dyn Driver>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            driver,
            config,
        }
    }

    /// Spawn the discovery loop and cleanup sweep as background tasks.
    /// Both stop once `shutdown` is signalled.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().discovery_loop(shutdown.clone())),
            tokio::spawn(self.cleanup_loop(shutdown)),
        ]
    }

    /// Every `scan_interval`: skip if the scan gate is closed (a peer is
    /// Dialing/HandshakePending), else run selection over the registry and
    /// enqueue dial attempts for whatever it picks (spec §4.8).
    async fn discovery_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.scan_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    debug!("discovery loop stopping");
                    return;
                }
            }

            if self.orchestrator.has_pending_connections().await {
                debug!("scan gate closed, skipping this cycle");
                continue;
            }

            if let Err(e) = self.driver.start_scanning().await {
                warn!(error = %e, "start_scanning failed");
                continue;
            }

            self.run_selection().await;
        }
    }

    async fn run_selection(&self) {
        let active_count = self
            .registry
            .iter_candidates(|_, peer| peer.state == PeerState::Active)
            .await
            .len();

        let identities = self
            .registry
            .iter_candidates(|_, peer| {
                matches!(peer.state, PeerState::Discovered) && peer.identity.is_some()
            })
            .await;

        let mut snapshots = Vec::with_capacity(identities.len());
        for identity in identities {
            if let Some(snap) = self.registry.snapshot(&identity).await {
                snapshots.push((identity, snap));
            }
        }

        let params = SelectionParams {
            min_rssi: self.config.min_rssi,
            connect_rate_limit: self.config.connect_rate_limit,
            max_peers: self.config.max_peers,
            active_count,
        };
        let local_mac = self.orchestrator.local_mac();
        let candidates = scoring::select(
            snapshots.iter().map(|(id, snap)| (*id, snap)),
            params,
            std::time::Instant::now(),
            |remote_mac: Mac| crate::arbiter::arbitrate(local_mac, remote_mac) == crate::arbiter::Direction::Initiate,
        );

        for candidate in candidates {
            if let Err(e) = self.orchestrator.dial(candidate.identity, candidate.mac).await {
                debug!(peer = %candidate.identity, error = %e, "dial skipped");
            }
        }
    }

    /// Every `cleanup_interval` (default 30s): expire reassembly buffers,
    /// clear expired blacklists, release stale `Discovered` peers (spec
    /// §4.8).
    async fn cleanup_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.cleanup_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    debug!("cleanup loop stopping");
                    return;
                }
            }

            let stats = self
                .registry
                .sweep(self.config.connection_timeout, self.config.stale_discovered_ttl)
                .await;
            if stats.reassembly_buffers_expired > 0
                || stats.blacklists_cleared > 0
                || stats.stale_discovered_released > 0
            {
                debug!(?stats, "cleanup sweep");
            }
        }
    }

    /// Bounded shutdown drain (spec §4.8, §5): disconnect every Active peer,
    /// stop scanning/advertising, release all buffers. Runs within
    /// `shutdown_timeout`; anything left over is abandoned rather than
    /// blocking shutdown indefinitely.
    pub async fn shutdown(&self) {
        let drain = async {
            let active = self
                .registry
                .iter_candidates(|_, peer| peer.state == PeerState::Active)
                .await;
            for identity in active {
                self.orchestrator.on_disconnected(identity).await;
            }
            let _ = self.driver.stop_scanning().await;
            let _ = self.driver.stop_advertising().await;
            let _ = self.driver.stop().await;
        };

        match tokio::time::timeout(self.config.shutdown_timeout, drain).await {
            Ok(()) => info!("shutdown drained cleanly"),
            Err(_) => warn!(
                timeout = ?self.config.shutdown_timeout,
                "shutdown timed out, abandoning remaining drain"
            ),
        }
    }
}
