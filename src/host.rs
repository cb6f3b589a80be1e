//! Upper-stack contract (C9, spec §6.2): what the mesh engine consumes
//! from, and exposes to, the generic mesh layer above it.

use async_trait::async_trait;

use crate::identity::Identity;
use crate::mac::Mac;

/// An opaque token tied to a peer's identity. Send/receive through this
/// handle routes automatically to that peer.
///
/// Carries a generation counter so a handle captured before a peer's last
/// teardown cannot be used to address the peer that later reappears under
/// the same identity after reconnecting (an ambient robustness property,
/// not a semantic addition over spec §6.2's "opaque token tied to the
/// identity").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    identity: Identity,
    generation: u64,
}

impl PeerHandle {
    pub fn new(identity: Identity, generation: u64) -> Self {
        Self {
            identity,
            generation,
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// What the engine consumes from the upper stack (spec §6.2).
#[async_trait]
pub trait Host: Send + Sync {
    /// The upper stack's own stable identity, written during the handshake.
    async fn local_identity(&self) -> [u8; 16];

    /// Deliver a fully reassembled packet from `peer`. Must return
    /// promptly; this runs on the executor thread (spec §5).
    async fn inbound(&self, peer: PeerHandle, packet: Vec<u8>);

    /// The local BLE MAC, used by the direction arbiter (spec §4.5).
    async fn local_mac(&self) -> Mac;

    /// A new peer interface now exists and can be sent to (spec §6.2).
    async fn peer_appeared(&self, identity: Identity, peer: PeerHandle);

    /// The peer interface is gone; any held handle is now stale.
    async fn peer_gone(&self, identity: Identity);
}
