//! Handshake engine (C6): the first-message identity exchange that lets
//! two peers learn each other's stable identity (spec §4.6).

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::mac::Mac;

/// Central-side handshake: after GATT service discovery, subscribing to
/// notifications, and reading the remote identity characteristic.
///
/// `expected` is the identity inferred at discovery, if any. `read_identity`
/// is the bytes read off the remote's identity characteristic. Returns the
/// confirmed identity, or [`Error::IdentityMismatch`] if it disagrees with
/// `expected`.
pub fn confirm_remote_identity(
    expected: Option<Identity>,
    read_identity: &[u8],
) -> Result<Identity> {
    let remote = Identity::from_slice(read_identity)
        .ok_or_else(|| Error::IdentityMismatch)?;
    if let Some(expected) = expected {
        if expected != remote {
            return Err(Error::IdentityMismatch);
        }
    }
    Ok(remote)
}

/// Central-side: write our local identity to the remote's RX
/// characteristic (write-with-response). On failure, spec §4.6 says to log
/// a warning and continue in degraded mode rather than abort — so this
/// function returns the error for the caller to log, but the caller must
/// not treat it as attempt failure.
pub async fn send_local_identity(
    driver: &dyn Driver,
    mac: Mac,
    local_identity: [u8; 16],
) -> Result<()> {
    driver
        .send(mac, &local_identity)
        .await
        .map_err(|e| Error::HandshakeNotSent(e.to_string()))
}

/// Outcome of inspecting one inbound peripheral-side write.
#[derive(Debug, PartialEq, Eq)]
pub enum InboundWrite {
    /// This write is a handshake: the sender's identity.
    Handshake(Identity),
    /// This write is protocol data to be handed to the fragment codec.
    Data,
}

/// Peripheral-side: classify an inbound RX write (spec §4.6).
///
/// A write is a handshake iff the sender's identity is not yet known *and*
/// the payload is exactly 16 bytes. `already_known` tells this function
/// whether the MAC already has a bound identity.
pub fn classify_inbound_write(already_known: bool, payload: &[u8]) -> InboundWrite {
    if !already_known && payload.len() == Identity::LEN {
        let mut bytes = [0u8; Identity::LEN];
        bytes.copy_from_slice(payload);
        InboundWrite::Handshake(Identity::from_bytes(bytes))
    } else {
        InboundWrite::Data
    }
}
