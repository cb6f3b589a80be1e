//! Error taxonomy for the mesh engine.
//!
//! Mirrors the five policy buckets in spec §7 (Transient link, Protocol,
//! Codec, Resource, Fatal) so callers can dispatch on [`Error::category`]
//! instead of matching every variant.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Policy bucket an error falls into (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connect timeout, notify-subscribe EOF: retry within one attempt.
    TransientLink,
    /// Handshake not sent, identity mismatch: abort the attempt.
    Protocol,
    /// Fragment/reassembly failures: drop buffer, let upper stack retransmit.
    Codec,
    /// Registry/worker saturation: refuse new work, never block.
    Resource,
    /// Startup-time failures: surface upward, interface fails to come online.
    Fatal,
}

impl ErrorCategory {
    /// Whether an error in this category is worth retrying automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientLink)
    }
}

/// Engine error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("MTU {0} is below the BLE minimum of 23")]
    MtuTooSmall(usize),

    #[error("packet of {len} bytes needs more than 65535 fragments at mtu {mtu}")]
    PacketTooLarge { len: usize, mtu: usize },

    #[error("fragment inconsistent with buffered packet: {0}")]
    FragmentInconsistent(String),

    #[error("reassembly incomplete: END received without all fragments")]
    ReassemblyGap,

    #[error("reassembly buffer for peer exceeded max_inflight_bytes")]
    ReassemblyOverflow,

    #[error("identity read from peer does not match the identity inferred at discovery")]
    IdentityMismatch,

    #[error("handshake write to peer's RX characteristic failed: {0}")]
    HandshakeNotSent(String),

    #[error("connect attempt to {0} timed out")]
    ConnectTimeout(String),

    #[error("link to {0} dropped: {1}")]
    LinkDropped(String, String),

    #[error("peer {0} is blacklisted")]
    Blacklisted(String),

    #[error("peer {0} was dialed within connect_rate_limit")]
    RateLimited(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("driver call failed: {0}")]
    DriverFailure(String),

    #[error("fatal startup failure: {0}")]
    FatalStartup(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The policy bucket this error belongs to (spec §7 table).
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConnectTimeout(_) | Self::LinkDropped(_, _) => ErrorCategory::TransientLink,
            Self::IdentityMismatch | Self::HandshakeNotSent(_) => ErrorCategory::Protocol,
            Self::MtuTooSmall(_)
            | Self::PacketTooLarge { .. }
            | Self::FragmentInconsistent(_)
            | Self::ReassemblyGap
            | Self::ReassemblyOverflow => ErrorCategory::Codec,
            Self::Blacklisted(_) | Self::RateLimited(_) | Self::ResourceExhausted(_) => {
                ErrorCategory::Resource
            }
            Self::DriverFailure(_) | Self::FatalStartup(_) | Self::Config(_) | Self::Io(_) => {
                ErrorCategory::Fatal
            }
        }
    }

    /// Whether the caller should retry this specific failure automatically.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_errors_are_not_retryable() {
        assert!(!Error::ReassemblyGap.is_retryable());
        assert_eq!(Error::ReassemblyGap.category(), ErrorCategory::Codec);
    }

    #[test]
    fn transient_link_errors_are_retryable() {
        let err = Error::ConnectTimeout("aa:bb:cc:dd:ee:ff".into());
        assert!(err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::TransientLink);
    }

    #[test]
    fn fatal_errors_are_not_retryable() {
        let err = Error::FatalStartup("no adapter".into());
        assert_eq!(err.category(), ErrorCategory::Fatal);
        assert!(!err.is_retryable());
    }
}
