//! The engine (spec §9 re-architecture note): the single value an
//! application constructs, wiring the peer registry, orchestrator,
//! scheduler, a concrete [`Driver`], and the upper-stack [`Host`] together,
//! and dispatching driver events to the right collaborator.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::driver::{Driver, DriverEvent};
use crate::error::{Error, Result};
use crate::host::{Host, PeerHandle};
use crate::identity::Identity;
use crate::orchestrator::Orchestrator;
use crate::registry::PeerRegistry;
use crate::scheduler::Scheduler;
use crate::wire;

/// Owns every long-lived task. Cloning is cheap (everything behind `Arc`),
/// but there is normally exactly one `Engine` per process.
pub struct Engine {
    registry: PeerRegistry,
    orchestrator: Arc<Orchestrator>,
    scheduler: Arc<Scheduler>,
    driver: Arc<dyn Driver>,
    host: Arc<dyn Host>,
    config: EngineConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    generations: Arc<Mutex<HashMap<Identity, u64>>>,
    appeared: Arc<Mutex<HashSet<Identity>>>,
    is_running: Arc<RwLock<bool>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    /// Wire the engine together. Does no I/O; call [`Self::start`] to bring
    /// the radio and background tasks up.
    ///
    /// `local_identity`/`local_mac` are required synchronously here (the
    /// orchestrator and direction arbiter need them at construction time),
    /// even though [`Host::local_identity`] and [`Host::local_mac`] exist as
    /// the async contract an upper stack implements; callers typically read
    /// the same values and pass them to both.
    pub fn new(
        config: EngineConfig,
        driver: Arc<dyn Driver>,
        host: Arc<dyn Host>,
        local_identity: [u8; 16],
        local_mac: crate::mac::Mac,
    ) -> Result<Self> {
        config.validate()?;
        let registry = PeerRegistry::new(config.max_discovered_peers);
        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            driver.clone(),
            local_identity,
            local_mac,
            config.connect_rate_limit,
            config.connection_timeout,
            config.max_failures_before_blacklist,
        ));
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            orchestrator.clone(),
            driver.clone(),
            config.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            registry,
            orchestrator,
            scheduler,
            driver,
            host,
            config,
            shutdown_tx,
            shutdown_rx,
            generations: Arc::new(Mutex::new(HashMap::new())),
            appeared: Arc::new(Mutex::new(HashSet::new())),
            is_running: Arc::new(RwLock::new(false)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Power the driver up, start advertising/scanning per the configured
    /// roles, and spawn the event-dispatch loop and scheduler tasks.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let local_identity = self.host.local_identity().await;
        let (events_tx, events_rx) = mpsc::channel(256);

        self.driver
            .start(
                wire::SERVICE_UUID,
                wire::RX_CHARACTERISTIC_UUID,
                wire::TX_CHARACTERISTIC_UUID,
                wire::IDENTITY_CHARACTERISTIC_UUID,
                events_tx,
            )
            .await?;
        self.driver.set_identity(local_identity).await?;

        if self.config.enable_peripheral {
            self.driver
                .start_advertising(self.config.device_name.as_deref())
                .await?;
        }

        *self.is_running.write().await = true;

        let mut tasks = self.scheduler.clone().spawn(self.shutdown_rx.clone());
        tasks.push(tokio::spawn(self.clone().dispatch_loop(events_rx)));
        *self.tasks.lock().await = tasks;

        info!("engine started");
        Ok(())
    }

    /// Signal shutdown, drain active peers within `shutdown_timeout`, and
    /// await every spawned task.
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        *self.is_running.write().await = false;
        let _ = self.shutdown_tx.send(true);
        self.scheduler.shutdown().await;

        let handles = std::mem::take(&mut *self.tasks.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
        info!("engine stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    async fn dispatch_loop(self: Arc<Self>, mut events: mpsc::Receiver<DriverEvent>) {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            warn!("driver event channel closed");
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("dispatch loop stopping");
                    return;
                }
            }
        }
    }

    async fn handle_event(&self, event: DriverEvent) {
        match event {
            DriverEvent::DeviceDiscovered { mac, rssi, name } => {
                self.registry
                    .upsert_from_advert(crate::registry::DiscoveredAdvert { mac, rssi, name })
                    .await;
            }
            DriverEvent::DeviceConnected { mac, mtu } => {
                if let Some(identity) = self.registry.identity_for_mac(mac).await {
                    self.orchestrator.on_connected(identity, mac, mtu).await;
                } else {
                    warn!(%mac, "DeviceConnected for unknown peer, ignoring");
                }
            }
            DriverEvent::DeviceDisconnected { mac } => {
                if let Some(identity) = self.registry.identity_for_mac(mac).await {
                    self.orchestrator.on_disconnected(identity).await;
                    self.notify_gone(identity).await;
                }
            }
            DriverEvent::DataReceived { mac, bytes } => {
                let identity = self.registry.identity_for_mac(mac).await;
                match self.orchestrator.on_inbound_write(mac, identity, bytes).await {
                    Ok(Some((identity, packet))) => {
                        self.notify_appeared_if_new(identity).await;
                        let handle = self.peer_handle(identity).await;
                        self.host.inbound(handle, packet).await;
                    }
                    Ok(None) => {
                        if let Some(identity) = self.registry.identity_for_mac(mac).await {
                            self.notify_appeared_if_new(identity).await;
                        }
                    }
                    Err(e) => warn!(%mac, error = %e, "inbound write rejected"),
                }
            }
            DriverEvent::ConnectionFailed { mac, error } => {
                if let Some(identity) = self.registry.identity_for_mac(mac).await {
                    self.orchestrator.on_connection_failed(identity, mac, error).await;
                }
            }
        }
    }

    async fn notify_appeared_if_new(&self, identity: Identity) {
        let mut appeared = self.appeared.lock().await;
        if appeared.insert(identity) {
            let handle = self.peer_handle(identity).await;
            self.host.peer_appeared(identity, handle).await;
        }
    }

    async fn notify_gone(&self, identity: Identity) {
        let mut appeared = self.appeared.lock().await;
        if appeared.remove(&identity) {
            let mut generations = self.generations.lock().await;
            if let Some(gen) = generations.get_mut(&identity) {
                *gen += 1;
            }
            drop(generations);
            self.host.peer_gone(identity).await;
        }
    }

    async fn peer_handle(&self, identity: Identity) -> PeerHandle {
        let generations = self.generations.lock().await;
        let generation = generations.get(&identity).copied().unwrap_or(0);
        PeerHandle::new(identity, generation)
    }

    /// Send a packet to an active peer (spec §6.2). `handle` must be the
    /// generation currently live for its identity; a handle captured before
    /// the peer's last teardown is rejected rather than silently addressing
    /// whatever peer later reappears under the same identity.
    pub async fn send(&self, handle: PeerHandle, packet: &[u8]) -> Result<()> {
        let identity = handle.identity();
        let current = self.peer_handle(identity).await;
        if handle.generation() != current.generation() {
            return Err(Error::LinkDropped(identity.to_hex(), "stale peer handle".into()));
        }
        self.orchestrator.send(identity, packet).await
    }
}
