//! Peer registry (C3): the authoritative map of known peers, keyed by
//! identity, with a secondary MAC index kept in sync (spec §4.3).
//!
//! All mutations take a single lock held only for the mutation itself;
//! callbacks and driver I/O never run while it is held (spec §5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::debug;

use crate::identity::Identity;
use crate::mac::Mac;
use crate::reassembly::ReassemblyBuffer;

/// Lifecycle state of a peer (spec §3, §4.7 state diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Discovered,
    Dialing,
    HandshakePending,
    Active,
    Disconnecting,
    Blacklisted,
}

/// One known remote device (spec §3).
pub struct Peer {
    pub identity: Option<Identity>,
    pub mac: Mac,
    pub name: Option<String>,
    pub rssi_last: i16,
    pub seen_at: Instant,
    pub attempts_total: u32,
    pub attempts_success: u32,
    /// Non-successful attempts since the last success; drives the
    /// blacklist threshold (spec §4.7). Resets to 0 on every success.
    pub consecutive_failures: u32,
    pub last_attempt_at: Option<Instant>,
    pub blacklisted_until: Option<Instant>,
    pub state: PeerState,
    /// Present only while `state == Active` (Invariant 3).
    pub mtu: Option<usize>,
    pub reassembler: Option<ReassemblyBuffer>,
}

impl Peer {
    fn new_discovered(mac: Mac, identity: Option<Identity>, rssi: i16, name: Option<String>) -> Self {
        Self {
            identity,
            mac,
            name,
            rssi_last: rssi,
            seen_at: Instant::now(),
            attempts_total: 0,
            attempts_success: 0,
            consecutive_failures: 0,
            last_attempt_at: None,
            blacklisted_until: None,
            state: PeerState::Discovered,
            mtu: None,
            reassembler: None,
        }
    }

    /// Invariant 4: `attempts_success <= attempts_total`.
    pub fn invariant_holds(&self) -> bool {
        self.attempts_success <= self.attempts_total
    }
}

/// An advertisement observed by the driver (spec §3 DiscoveredAdvert).
#[derive(Debug, Clone)]
pub struct DiscoveredAdvert {
    pub mac: Mac,
    pub rssi: i16,
    pub name: Option<String>,
}

/// Thread-safe peer registry. Cheaply `Clone`d (wraps `Arc`s); every clone
/// shares the same underlying maps.
#[derive(Clone)]
pub struct PeerRegistry {
    by_identity: Arc<RwLock<HashMap<Identity, Peer>>>,
    mac_to_identity: Arc<RwLock<HashMap<Mac, Identity>>>,
    /// Peers known only by MAC (not yet handshaken), keyed by MAC directly,
    /// since `Identity` is unknown until the handshake completes.
    by_mac_only: Arc<RwLock<HashMap<Mac, Peer>>>,
    /// LRU cap across both maps combined (spec §6.4 `max_discovered_peers`).
    max_discovered_peers: usize,
}

impl PeerRegistry {
    pub fn new(max_discovered_peers: usize) -> Self {
        Self {
            by_identity: Arc::new(RwLock::new(HashMap::new())),
            mac_to_identity: Arc::new(RwLock::new(HashMap::new())),
            by_mac_only: Arc::new(RwLock::new(HashMap::new())),
            max_discovered_peers,
        }
    }

    /// Ingest a driver advertisement. Returns `true` if this is a newly
    /// created record. RSSI sentinel -127 is discarded outright (spec §8).
    pub async fn upsert_from_advert(&self, advert: DiscoveredAdvert) -> bool {
        if advert.rssi == -127 {
            return false;
        }

        let mac_map = self.mac_to_identity.read().await;
        if let Some(identity) = mac_map.get(&advert.mac).copied() {
            drop(mac_map);
            let mut by_id = self.by_identity.write().await;
            if let Some(peer) = by_id.get_mut(&identity) {
                peer.rssi_last = advert.rssi;
                peer.seen_at = Instant::now();
                if advert.name.is_some() {
                    peer.name = advert.name;
                }
            }
            return false;
        }
        drop(mac_map);

        let mut by_mac = self.by_mac_only.write().await;
        if let Some(entry) = by_mac.get_mut(&advert.mac) {
            entry.rssi_last = advert.rssi;
            entry.seen_at = Instant::now();
            if advert.name.is_some() {
                entry.name = advert.name;
            }
            return false;
        }

        let total = by_mac.len() + self.by_identity.read().await.len();
        if total >= self.max_discovered_peers && !self.evict_stalest(&mut by_mac).await {
            debug!(mac = %advert.mac, "registry at capacity, dropping new discovery");
            return false;
        }

        by_mac.insert(
            advert.mac,
            Peer::new_discovered(advert.mac, None, advert.rssi, advert.name.clone()),
        );
        true
    }

    /// Evict the least-recently-seen evictable (`Discovered`-state) peer
    /// across both maps to make room for a new discovery at capacity (spec
    /// §6.4 LRU cap). Never evicts a peer mid-connection. Returns `false` if
    /// nothing is evictable.
    async fn evict_stalest(&self, by_mac: &mut HashMap<Mac, Peer>) -> bool {
        let mac_oldest = by_mac
            .iter()
            .min_by_key(|(_, p)| p.seen_at)
            .map(|(mac, p)| (*mac, p.seen_at));

        let mut by_id = self.by_identity.write().await;
        let id_oldest = by_id
            .iter()
            .filter(|(_, p)| p.state == PeerState::Discovered)
            .min_by_key(|(_, p)| p.seen_at)
            .map(|(id, p)| (*id, p.seen_at));

        let evict_identity = match (mac_oldest, id_oldest) {
            (Some((_, mac_seen)), Some((_, id_seen))) => id_seen < mac_seen,
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (None, None) => return false,
        };

        if evict_identity {
            let (id, _) = id_oldest.expect("evict_identity only true when id_oldest is Some");
            if let Some(peer) = by_id.remove(&id) {
                drop(by_id);
                self.mac_to_identity.write().await.remove(&peer.mac);
            }
        } else {
            let (mac, _) = mac_oldest.expect("evict_identity only false when mac_oldest is Some");
            by_mac.remove(&mac);
        }
        true
    }

    /// Bind a newly learned identity to a MAC (handshake completion, spec
    /// §4.6). If a peer already exists under `identity` (MAC rotation),
    /// the old MAC-only record for `mac` is discarded in favor of it, per
    /// Invariant 2 (at most one record per identity).
    pub async fn bind_identity(&self, mac: Mac, identity: Identity) {
        let mut by_mac = self.by_mac_only.write().await;
        let mut by_id = self.by_identity.write().await;
        let mut mac_map = self.mac_to_identity.write().await;

        if let Some(existing) = by_id.get_mut(&identity) {
            existing.mac = mac;
            existing.seen_at = Instant::now();
        } else {
            let peer = by_mac
                .remove(&mac)
                .unwrap_or_else(|| Peer::new_discovered(mac, Some(identity), -100, None));
            let mut peer = peer;
            peer.identity = Some(identity);
            by_id.insert(identity, peer);
        }
        by_mac.remove(&mac);
        mac_map.insert(mac, identity);
    }

    /// Apply a state transition, returning `false` if `from` did not match
    /// the peer's current state (a stale caller lost a race).
    pub async fn transition(&self, identity: Identity, from: PeerState, to: PeerState) -> bool {
        let mut by_id = self.by_identity.write().await;
        if let Some(peer) = by_id.get_mut(&identity) {
            if peer.state == from {
                peer.state = to;
                return true;
            }
        }
        false
    }

    /// `Discovered → Dialing`: record `last_attempt_at = now` and
    /// `attempts_total += 1` (spec §4.7). Called exactly once per dial.
    pub async fn begin_attempt(&self, identity: Identity) {
        let mut by_id = self.by_identity.write().await;
        if let Some(peer) = by_id.get_mut(&identity) {
            peer.attempts_total += 1;
            peer.last_attempt_at = Some(Instant::now());
            debug_assert!(peer.invariant_holds());
        }
    }

    /// Record the outcome of an attempt already counted by
    /// [`Self::begin_attempt`]. Returns the peer's `consecutive_failures`
    /// count after recording, so the caller can decide whether to
    /// blacklist without a second lock round-trip.
    pub async fn record_outcome(&self, identity: Identity, success: bool) -> Option<u32> {
        let mut by_id = self.by_identity.write().await;
        if let Some(peer) = by_id.get_mut(&identity) {
            if success {
                peer.attempts_success += 1;
                peer.consecutive_failures = 0;
            } else {
                peer.consecutive_failures += 1;
            }
            debug_assert!(peer.invariant_holds());
            Some(peer.consecutive_failures)
        } else {
            None
        }
    }

    /// Force a peer directly to `Active` regardless of its prior state.
    /// Used on the peripheral path, which has no `Dialing`/`HandshakePending`
    /// phase of its own (spec §4.6: the handshake detector fires and the
    /// peer is Active).
    pub async fn set_active(&self, identity: Identity) {
        let mut by_id = self.by_identity.write().await;
        if let Some(peer) = by_id.get_mut(&identity) {
            peer.state = PeerState::Active;
        }
    }

    /// Blacklist a peer until `until`.
    pub async fn blacklist(&self, identity: Identity, until: Instant) {
        let mut by_id = self.by_identity.write().await;
        if let Some(peer) = by_id.get_mut(&identity) {
            peer.state = PeerState::Blacklisted;
            peer.blacklisted_until = Some(until);
        }
    }

    /// Clear an expired blacklist, returning the peer to `Discovered`.
    pub async fn clear_expired_blacklist(&self, identity: Identity) {
        let mut by_id = self.by_identity.write().await;
        if let Some(peer) = by_id.get_mut(&identity) {
            if peer.state == PeerState::Blacklisted {
                if let Some(until) = peer.blacklisted_until {
                    if until <= Instant::now() {
                        peer.state = PeerState::Discovered;
                        peer.blacklisted_until = None;
                    }
                }
            }
        }
    }

    /// Run `f` over every identity-keyed peer, collecting matches. Holds
    /// the lock only for the duration of the scan; `f` must not block.
    pub async fn iter_candidates<F>(&self, mut f: F) -> Vec<Identity>
    where
        F: FnMut(&Identity, &Peer) -> bool,
    {
        let by_id = self.by_identity.read().await;
        by_id
            .iter()
            .filter(|(id, peer)| f(id, peer))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Snapshot a single peer's RSSI/state/attempt fields for scoring and
    /// tests, without holding the lock across the call site.
    pub async fn snapshot(&self, identity: &Identity) -> Option<PeerSnapshot> {
        let by_id = self.by_identity.read().await;
        by_id.get(identity).map(PeerSnapshot::from)
    }

    /// Resolve a MAC to its bound identity, if the handshake has completed.
    pub async fn identity_for_mac(&self, mac: Mac) -> Option<Identity> {
        self.mac_to_identity.read().await.get(&mac).copied()
    }

    pub async fn remove(&self, identity: &Identity) {
        let mut by_id = self.by_identity.write().await;
        if let Some(peer) = by_id.remove(identity) {
            let mut mac_map = self.mac_to_identity.write().await;
            mac_map.remove(&peer.mac);
        }
    }

    pub async fn with_peer_mut<R>(&self, identity: &Identity, f: impl FnOnce(&mut Peer) -> R) -> Option<R> {
        let mut by_id = self.by_identity.write().await;
        by_id.get_mut(identity).map(f)
    }

    pub async fn len(&self) -> usize {
        self.by_identity.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// One cleanup sweep pass (spec §4.8): drop expired reassembly buffers,
    /// expire blacklists, and release `Discovered` peers idle past
    /// `stale_discovered_ttl`. A single write-lock pass, matching the
    /// short-critical-section rule (spec §5).
    pub async fn sweep(
        &self,
        reassembly_timeout: std::time::Duration,
        stale_discovered_ttl: std::time::Duration,
    ) -> SweepStats {
        let mut stats = SweepStats::default();
        let now = Instant::now();
        let mut to_remove = Vec::new();

        let mut by_id = self.by_identity.write().await;
        for (identity, peer) in by_id.iter_mut() {
            if let Some(reassembler) = peer.reassembler.as_mut() {
                if reassembler.is_expired(reassembly_timeout) {
                    reassembler.clear();
                    stats.reassembly_buffers_expired += 1;
                }
            }

            if peer.state == PeerState::Blacklisted {
                if let Some(until) = peer.blacklisted_until {
                    if until <= now {
                        peer.state = PeerState::Discovered;
                        peer.blacklisted_until = None;
                        stats.blacklists_cleared += 1;
                    }
                }
            }

            if peer.state == PeerState::Discovered
                && now.saturating_duration_since(peer.seen_at) >= stale_discovered_ttl
            {
                to_remove.push(*identity);
            }
        }

        for identity in &to_remove {
            by_id.remove(identity);
            stats.stale_discovered_released += 1;
        }
        drop(by_id);

        if !to_remove.is_empty() {
            let mut mac_map = self.mac_to_identity.write().await;
            mac_map.retain(|_, id| !to_remove.contains(id));
        }

        stats
    }
}

/// Outcome of one cleanup sweep pass (spec §4.8).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub reassembly_buffers_expired: usize,
    pub blacklists_cleared: usize,
    pub stale_discovered_released: usize,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new(crate::config::EngineConfig::default().max_discovered_peers)
    }
}

/// Cheap, `Copy`-able read of the fields scoring/selection need, so callers
/// never hold the registry lock while computing or comparing scores.
#[derive(Debug, Clone, Copy)]
pub struct PeerSnapshot {
    pub mac: Mac,
    pub rssi_last: i16,
    pub seen_at: Instant,
    pub attempts_total: u32,
    pub attempts_success: u32,
    pub consecutive_failures: u32,
    pub last_attempt_at: Option<Instant>,
    pub state: PeerState,
    pub blacklisted_until: Option<Instant>,
}

impl From<&Peer> for PeerSnapshot {
    fn from(p: &Peer) -> Self {
        Self {
            mac: p.mac,
            rssi_last: p.rssi_last,
            seen_at: p.seen_at,
            attempts_total: p.attempts_total,
            attempts_success: p.attempts_success,
            consecutive_failures: p.consecutive_failures,
            last_attempt_at: p.last_attempt_at,
            state: p.state,
            blacklisted_until: p.blacklisted_until,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rssi_sentinel_is_discarded() {
        let reg = PeerRegistry::new(100);
        let mac = Mac::parse("AA:BB:CC:DD:EE:FF").unwrap();
        let created = reg
            .upsert_from_advert(DiscoveredAdvert {
                mac,
                rssi: -127,
                name: None,
            })
            .await;
        assert!(!created);
        assert_eq!(reg.len().await, 0);
    }

    #[tokio::test]
    async fn bind_identity_then_transition() {
        let reg = PeerRegistry::new(100);
        let mac = Mac::parse("AA:BB:CC:DD:EE:FF").unwrap();
        reg.upsert_from_advert(DiscoveredAdvert {
            mac,
            rssi: -50,
            name: None,
        })
        .await;
        let identity = Identity::from_bytes([7u8; 16]);
        reg.bind_identity(mac, identity).await;
        assert_eq!(reg.len().await, 1);

        let ok = reg
            .transition(identity, PeerState::Discovered, PeerState::Dialing)
            .await;
        assert!(ok);
        let snap = reg.snapshot(&identity).await.unwrap();
        assert_eq!(snap.state, PeerState::Dialing);
    }

    #[tokio::test]
    async fn attempt_invariant_never_violated() {
        let reg = PeerRegistry::new(100);
        let mac = Mac::parse("AA:BB:CC:DD:EE:FF").unwrap();
        let identity = Identity::from_bytes([1u8; 16]);
        reg.bind_identity(mac, identity).await;
        reg.begin_attempt(identity).await;
        reg.record_outcome(identity, true).await;
        reg.begin_attempt(identity).await;
        reg.record_outcome(identity, false).await;
        let snap = reg.snapshot(&identity).await.unwrap();
        assert!(snap.attempts_success <= snap.attempts_total);
        assert_eq!(snap.attempts_total, 2);
        assert_eq!(snap.attempts_success, 1);
    }

    #[tokio::test]
    async fn sweep_clears_expired_blacklist_and_stale_discovered() {
        use std::time::Duration;

        let reg = PeerRegistry::new(100);
        let mac = Mac::parse("AA:BB:CC:DD:EE:FF").unwrap();
        let identity = Identity::from_bytes([2u8; 16]);
        reg.bind_identity(mac, identity).await;
        reg.blacklist(identity, Instant::now() - Duration::from_secs(1))
            .await;

        let stale_mac = Mac::parse("11:22:33:44:55:66").unwrap();
        reg.upsert_from_advert(DiscoveredAdvert {
            mac: stale_mac,
            rssi: -50,
            name: None,
        })
        .await;
        let stale_identity = Identity::from_bytes([3u8; 16]);
        reg.bind_identity(stale_mac, stale_identity).await;
        reg.with_peer_mut(&stale_identity, |peer| {
            peer.seen_at = Instant::now() - Duration::from_secs(3600);
        })
        .await;

        let stats = reg
            .sweep(Duration::from_secs(30), Duration::from_secs(300))
            .await;
        assert_eq!(stats.blacklists_cleared, 1);
        assert_eq!(stats.stale_discovered_released, 1);
        assert_eq!(
            reg.snapshot(&identity).await.unwrap().state,
            PeerState::Discovered
        );
        assert!(reg.snapshot(&stale_identity).await.is_none());
    }

    #[tokio::test]
    async fn upsert_evicts_stalest_discovered_peer_at_capacity() {
        use std::time::Duration;

        let reg = PeerRegistry::new(2);
        let first = Mac::parse("AA:BB:CC:DD:EE:01").unwrap();
        reg.upsert_from_advert(DiscoveredAdvert {
            mac: first,
            rssi: -50,
            name: None,
        })
        .await;
        // Age the first entry so it is unambiguously the stalest one.
        reg.by_mac_only.write().await.get_mut(&first).unwrap().seen_at =
            Instant::now() - Duration::from_secs(60);

        let second = Mac::parse("AA:BB:CC:DD:EE:02").unwrap();
        reg.upsert_from_advert(DiscoveredAdvert {
            mac: second,
            rssi: -50,
            name: None,
        })
        .await;

        // Registry is now at capacity (2); a third discovery must evict the
        // stalest entry (`first`) rather than grow unbounded.
        let third = Mac::parse("AA:BB:CC:DD:EE:03").unwrap();
        let created = reg
            .upsert_from_advert(DiscoveredAdvert {
                mac: third,
                rssi: -50,
                name: None,
            })
            .await;
        assert!(created);

        let identities = reg.by_mac_only.read().await;
        assert_eq!(identities.len(), 2);
        assert!(!identities.contains_key(&first));
        assert!(identities.contains_key(&second));
        assert!(identities.contains_key(&third));
    }
}
