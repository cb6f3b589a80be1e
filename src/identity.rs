//! Stable peer identity, owned by the upper stack.
//!
//! An [`Identity`] is an opaque 16-byte value that survives MAC-address
//! randomization (spec §3). The core never interprets its bytes; it only
//! compares, hashes, and renders them as the canonical 32-character
//! lowercase hex key used throughout logging and the registry.

use std::fmt;

/// Opaque 16-byte peer identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(pub [u8; 16]);

impl Identity {
    /// Length in bytes of an identity on the wire (spec §6.3 handshake).
    pub const LEN: usize = 16;

    /// Build an identity from exactly 16 bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Build an identity from a byte slice, failing if the length is wrong.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::LEN {
            return None;
        }
        let mut buf = [0u8; Self::LEN];
        buf.copy_from_slice(bytes);
        Some(Self(buf))
    }

    /// Raw bytes, e.g. for the handshake write.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Canonical 32-character lowercase hex key (spec §3, §9 open question 3:
    /// the full-width key is normative, a truncated key is rejected).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the canonical hex form back into an identity.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.to_hex())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = Identity::from_bytes([0xAB; 16]);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(Identity::from_hex(&hex), Some(id));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Identity::from_slice(&[0u8; 15]).is_none());
        assert!(Identity::from_slice(&[0u8; 17]).is_none());
    }

    #[test]
    fn literal_handshake_identity() {
        // Scenario 3 from spec §8: H = 0x68 00 69 B6 1F A5 1C DE 5A 75 1E D2 39 6C E4 6D
        let h: [u8; 16] = [
            0x68, 0x00, 0x69, 0xB6, 0x1F, 0xA5, 0x1C, 0xDE, 0x5A, 0x75, 0x1E, 0xD2, 0x39, 0x6C,
            0xE4, 0x6D,
        ];
        let id = Identity::from_bytes(h);
        assert_eq!(id.to_hex(), "680069b61fa51cde5a751ed2396ce46d");
    }
}
