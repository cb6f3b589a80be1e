//! Connection Orchestrator (C7): drives each peer through the state
//! machine in spec §4.7, owning the process-wide connecting-set and the
//! blacklist/backoff policy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::codec::{self, Fragment};
use crate::driver::{ConnectErrorKind, Driver};
use crate::error::{Error, Result};
use crate::handshake::{self, InboundWrite};
use crate::identity::Identity;
use crate::mac::Mac;
use crate::reassembly::ReassemblyBuffer;
use crate::registry::{PeerRegistry, PeerState};

/// Backoff parameters for the blacklist formula in spec §4.7.
const BLACKLIST_BASE_SECS: u64 = 60;
const BLACKLIST_MAX_MULTIPLE: u64 = 8;

/// `blacklisted_until = now + 60 * min(failures - threshold + 1, 8)` seconds.
fn blacklist_duration(consecutive_failures: u32, threshold: u32) -> Duration {
    let over = consecutive_failures.saturating_sub(threshold) + 1;
    let multiple = (over as u64).min(BLACKLIST_MAX_MULTIPLE);
    Duration::from_secs(BLACKLIST_BASE_SECS * multiple)
}

/// Backoff schedule for a transient-link retry within a single connect
/// attempt (spec §7).
const CONNECT_RETRY_BACKOFFS: [Duration; 3] = [
    Duration::from_millis(200),
    Duration::from_millis(500),
    Duration::from_secs(1),
];

/// Call `driver.connect(mac)`, retrying in place on a `TransientLink`-class
/// failure with the `{0.2, 0.5, 1.0}s` backoff schedule (spec §7). Any other
/// error category, or exhausting the schedule, returns the last error; the
/// attempt is counted as failed only after this returns.
async fn connect_with_retry(driver: &dyn Driver, mac: Mac) -> Result<()> {
    match driver.connect(mac).await {
        Ok(()) => return Ok(()),
        Err(e) if !e.is_retryable() => return Err(e),
        Err(mut last_err) => {
            for backoff in CONNECT_RETRY_BACKOFFS {
                tokio::time::sleep(backoff).await;
                match driver.connect(mac).await {
                    Ok(()) => return Ok(()),
                    Err(e) if !e.is_retryable() => return Err(e),
                    Err(e) => last_err = e,
                }
            }
            Err(last_err)
        }
    }
}

/// Drives peers through Discovered → Dialing → HandshakePending → Active
/// → Disconnecting → {Discovered, Blacklisted}, and owns the connecting-set
/// that the discovery loop's scan gate (C8) consults.
///
/// Holds the registry's own lock only via [`PeerRegistry`]'s methods; the
/// connecting-set mutex is always acquired after any registry access, never
/// held across a call into the driver (spec §5).
pub struct Orchestrator {
    registry: PeerRegistry,
    driver: Arc<dyn Driver>,
    connecting: Arc<Mutex<HashSet<Identity>>>,
    /// Per-peer send serialization (spec §5): held across an entire
    /// `send()` call so the next packet for a peer cannot begin until the
    /// previous one's last fragment has been accepted by the driver.
    send_locks: Arc<Mutex<HashMap<Identity, Arc<Mutex<()>>>>>,
    local_identity: [u8; 16],
    local_mac: Mac,
    connect_rate_limit: Duration,
    connection_timeout: Duration,
    max_failures_before_blacklist: u32,
}

impl Orchestrator {
    pub fn new(
        registry: PeerRegistry,
        driver: Arc<dyn Driver>,
        local_identity: [u8; 16],
        local_mac: Mac,
        connect_rate_limit: Duration,
        connection_timeout: Duration,
        max_failures_before_blacklist: u32,
    ) -> Self {
        Self {
            registry,
            driver,
            connecting: Arc::new(Mutex::new(HashSet::new())),
            send_locks: Arc::new(Mutex::new(HashMap::new())),
            local_identity,
            local_mac,
            connect_rate_limit,
            connection_timeout,
            max_failures_before_blacklist,
        }
    }

    /// Fetch (creating if absent) the send-serialization lock for `identity`.
    async fn send_lock_for(&self, identity: Identity) -> Arc<Mutex<()>> {
        self.send_locks
            .lock()
            .await
            .entry(identity)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Whether any peer is currently in Dialing or HandshakePending
    /// (the scheduler's scan gate, spec §4.8).
    pub async fn has_pending_connections(&self) -> bool {
        !self.connecting.lock().await.is_empty()
    }

    /// `Discovered → Dialing`. No-op if `identity` is not currently
    /// `Discovered` (already dialing, active, or otherwise mid-lifecycle);
    /// rejected outright if blacklisted or rate-limited (spec §4.7).
    pub async fn dial(&self, identity: Identity, mac: Mac) -> Result<()> {
        let Some(snap) = self.registry.snapshot(&identity).await else {
            return Ok(());
        };
        if snap.state == PeerState::Blacklisted {
            return Err(Error::Blacklisted(identity.to_hex()));
        }
        if let Some(last) = snap.last_attempt_at {
            if last.elapsed() < self.connect_rate_limit {
                return Err(Error::RateLimited(identity.to_hex()));
            }
        }
        // The transition is the real guard against two concurrent dials for
        // the same peer; only one caller can win Discovered -> Dialing.
        if !self
            .registry
            .transition(identity, PeerState::Discovered, PeerState::Dialing)
            .await
        {
            return Ok(());
        }
        self.connecting.lock().await.insert(identity);

        self.registry.begin_attempt(identity).await;
        debug!(peer = %identity, "dialing");

        if let Err(e) = connect_with_retry(self.driver.as_ref(), mac).await {
            warn!(peer = %identity, error = %e, "connect() rejected by driver");
            self.on_connection_failed(identity, mac, ConnectErrorKind::Other(e.to_string()))
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// `Dialing → HandshakePending`: the driver reports a link up. Installs
    /// the negotiated MTU so the fragmenter can start once Active.
    pub async fn on_connected(&self, identity: Identity, mac: Mac, mtu: usize) {
        let transitioned = self
            .registry
            .transition(identity, PeerState::Dialing, PeerState::HandshakePending)
            .await;
        if !transitioned {
            return;
        }
        self.registry
            .with_peer_mut(&identity, |peer| {
                peer.mtu = Some(mtu);
            })
            .await;
        debug!(peer = %identity, mtu, "link up, awaiting handshake");

        if let Err(e) =
            handshake::send_local_identity(self.driver.as_ref(), mac, self.local_identity).await
        {
            // Per spec §4.6, a failed identity write is logged and the
            // attempt continues in degraded mode; it is not an abort.
            warn!(peer = %identity, error = %e, "local identity write failed");
        }
    }

    /// Central-side `HandshakePending → Active`: we learned the remote's
    /// identity (matches spec §4.6's `confirm_remote_identity`).
    pub async fn on_identity_learned(&self, identity: Identity) {
        let transitioned = self
            .registry
            .transition(identity, PeerState::HandshakePending, PeerState::Active)
            .await;
        if !transitioned {
            return;
        }
        self.connecting.lock().await.remove(&identity);
        self.registry.record_outcome(identity, true).await;
        info!(peer = %identity, "peer active (central)");
    }

    /// Peripheral-side `HandshakePending → Active`: classify one inbound
    /// RX write and act on it (spec §4.6). Returns reassembled data, if any
    /// non-handshake write completed a packet.
    pub async fn on_inbound_write(
        &self,
        mac: Mac,
        identity: Option<Identity>,
        payload: Vec<u8>,
    ) -> Result<Option<(Identity, Vec<u8>)>> {
        match handshake::classify_inbound_write(identity.is_some(), &payload) {
            InboundWrite::Handshake(remote_identity) => {
                self.registry.bind_identity(mac, remote_identity).await;
                self.activate_peripheral(remote_identity).await;
                Ok(None)
            }
            InboundWrite::Data => {
                let Some(identity) = identity else {
                    // Data before a handshake: nothing to attribute it to
                    // (spec §9 open question 4). Drop it.
                    return Ok(None);
                };
                self.feed_fragment(identity, payload).await
            }
        }
    }

    /// Feed raw inbound bytes (already known to be a fragment, not a
    /// handshake write) into the peer's reassembler.
    pub async fn feed_fragment(
        &self,
        identity: Identity,
        bytes: Vec<u8>,
    ) -> Result<Option<(Identity, Vec<u8>)>> {
        let fragment = Fragment::from_bytes(&bytes)
            .ok_or_else(|| Error::FragmentInconsistent("fragment shorter than header".into()))?;
        let outcome = self
            .registry
            .with_peer_mut(&identity, |peer| -> Result<Option<Vec<u8>>> {
                let reassembler = peer
                    .reassembler
                    .get_or_insert_with(ReassemblyBuffer::with_defaults);
                reassembler.feed(fragment)
            })
            .await;
        match outcome {
            Some(Ok(Some(bytes))) => Ok(Some((identity, bytes))),
            Some(Ok(None)) => Ok(None),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Peripheral's first sight of `identity` going straight to Active: the
    /// peripheral never enters Dialing/HandshakePending in this model,
    /// since the remote central initiated the link (spec §4.6). No attempt
    /// was ever counted for this peer, so `attempts_total`/`attempts_success`
    /// are left untouched (Invariant 4).
    async fn activate_peripheral(&self, identity: Identity) {
        let already_active = self
            .registry
            .snapshot(&identity)
            .await
            .map(|s| s.state == PeerState::Active)
            .unwrap_or(false);
        if already_active {
            return;
        }
        self.registry.set_active(identity).await;
        info!(peer = %identity, "peer active (peripheral)");
    }

    /// Encode and send a packet to `identity`, splitting it to that peer's
    /// negotiated MTU (spec §3). Serialized per peer (spec §5): the next
    /// call for the same identity does not begin writing fragments until
    /// this one's last fragment has been accepted by the driver.
    pub async fn send(&self, identity: Identity, packet: &[u8]) -> Result<()> {
        let lock = self.send_lock_for(identity).await;
        let _guard = lock.lock().await;

        let (mac, mtu) = self
            .registry
            .with_peer_mut(&identity, |peer| (peer.mac, peer.mtu))
            .await
            .ok_or_else(|| Error::LinkDropped(identity.to_hex(), "peer unknown".into()))?;
        let Some(mtu) = mtu else {
            return Err(Error::LinkDropped(identity.to_hex(), "peer not active".into()));
        };
        let fragments = codec::encode(packet, mtu)?;
        for fragment in fragments {
            self.driver
                .send(mac, &fragment.to_bytes())
                .await
                .map_err(|e| Error::DriverFailure(e.to_string()))?;
        }
        Ok(())
    }

    /// Any state `→ Disconnecting → cleanup → {Discovered, Blacklisted}`
    /// (spec §4.7, §7 partial-failure rule). Always safe to call more than
    /// once; cleanup is idempotent.
    pub async fn on_disconnected(&self, identity: Identity) {
        self.teardown(identity, None).await;
    }

    /// A `connect()` attempt failed outright (driver `ConnectionFailed`).
    pub async fn on_connection_failed(&self, identity: Identity, _mac: Mac, kind: ConnectErrorKind) {
        debug!(peer = %identity, ?kind, "connection failed");
        self.teardown(identity, Some(kind)).await;
    }

    async fn teardown(&self, identity: Identity, failure: Option<ConnectErrorKind>) {
        if let Some(kind) = &failure {
            debug!(peer = %identity, ?kind, "tearing down after connection failure");
        }
        self.connecting.lock().await.remove(&identity);
        self.send_locks.lock().await.remove(&identity);

        let was_active = self
            .registry
            .snapshot(&identity)
            .await
            .map(|s| s.state == PeerState::Active)
            .unwrap_or(false);

        if let Some(mac) = self.peer_mac(&identity).await {
            let _ = self.driver.disconnect(mac).await;
            let _ = self.driver.remove_device(mac).await;
        }

        self.registry
            .with_peer_mut(&identity, |peer| {
                peer.mtu = None;
                peer.reassembler = None;
            })
            .await;

        if !was_active {
            let consecutive_failures = self.registry.record_outcome(identity, false).await;
            if let Some(failures) = consecutive_failures {
                if failures >= self.max_failures_before_blacklist {
                    let until = Instant::now()
                        + blacklist_duration(failures, self.max_failures_before_blacklist);
                    self.registry.blacklist(identity, until).await;
                    warn!(peer = %identity, failures, "peer blacklisted");
                    return;
                }
            }
        }

        self.registry
            .transition(identity, PeerState::Dialing, PeerState::Discovered)
            .await;
        self.registry
            .transition(identity, PeerState::HandshakePending, PeerState::Discovered)
            .await;
        self.registry
            .transition(identity, PeerState::Active, PeerState::Discovered)
            .await;
        self.registry
            .transition(identity, PeerState::Disconnecting, PeerState::Discovered)
            .await;
    }

    async fn peer_mac(&self, identity: &Identity) -> Option<Mac> {
        self.registry.with_peer_mut(identity, |peer| peer.mac).await
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    pub fn local_mac(&self) -> Mac {
        self.local_mac
    }
}
