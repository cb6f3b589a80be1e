//! Driver contract (C9, spec §6.1): the typed boundary to the concrete BLE
//! stack (scanning, GATT client/server, advertising, MTU query). The core
//! depends only on this trait; a platform driver (e.g. the optional
//! `btleplug`-backed reference implementation) supplies it.

#[cfg(feature = "btleplug-driver")]
pub mod linux_btleplug;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::mac::Mac;

/// Error surfaced by a failed connection attempt (spec §6.1
/// `on_connection_failed`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectErrorKind {
    Timeout,
    Rejected,
    AdapterBusy,
    Other(String),
}

/// Events the driver emits into the core (spec §6.1).
#[derive(Debug, Clone)]
pub enum DriverEvent {
    DeviceDiscovered {
        mac: Mac,
        rssi: i16,
        name: Option<String>,
    },
    DeviceConnected {
        mac: Mac,
        mtu: usize,
    },
    DeviceDisconnected {
        mac: Mac,
    },
    DataReceived {
        mac: Mac,
        bytes: Vec<u8>,
    },
    ConnectionFailed {
        mac: Mac,
        error: ConnectErrorKind,
    },
}

/// The typed boundary to a concrete BLE driver (spec §6.1).
///
/// Every method is async and fallible; the core never assumes a call
/// completes synchronously, and never holds a lock across a call into this
/// trait (spec §5).
#[async_trait]
pub trait Driver: Send + Sync {
    /// Initialize the stack, power the radio, and prepare the GATT server
    /// with these UUIDs. Events begin flowing on `events` only after this
    /// returns successfully.
    async fn start(
        &self,
        service_uuid: &str,
        rx_char: &str,
        tx_char: &str,
        identity_char: &str,
        events: mpsc::Sender<DriverEvent>,
    ) -> Result<()>;

    /// Release everything. Idempotent.
    async fn stop(&self) -> Result<()>;

    /// Populate the read-only identity characteristic.
    async fn set_identity(&self, identity: [u8; 16]) -> Result<()>;

    async fn start_scanning(&self) -> Result<()>;
    async fn stop_scanning(&self) -> Result<()>;

    /// Advertise `service_uuid`; `name` must be `<= 8` bytes if set.
    async fn start_advertising(&self, name: Option<&str>) -> Result<()>;
    async fn stop_advertising(&self) -> Result<()>;

    /// Initiate a link. Idempotent; concurrent calls for the same `mac`
    /// must coalesce.
    async fn connect(&self, mac: Mac) -> Result<()>;
    /// Terminate a link. Idempotent.
    async fn disconnect(&self, mac: Mac) -> Result<()>;

    /// Write to the remote's RX characteristic (central) or notify on TX
    /// (peripheral).
    async fn send(&self, mac: Mac, bytes: &[u8]) -> Result<()>;

    /// Queried at `connected` time; defaults to 23 when unknown.
    async fn peer_mtu(&self, mac: Mac) -> usize;

    /// Optional cleanup hook to evict stale platform state after failures.
    async fn remove_device(&self, _mac: Mac) -> Result<()> {
        Ok(())
    }
}

/// Test-only in-memory driver, shared by this module's and other modules'
/// unit tests (orchestrator, scheduler, engine).
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Clone, Default)]
    pub struct NullDriver {
        pub started: Arc<AtomicBool>,
        pub sent: Arc<Mutex<Vec<(Mac, Vec<u8>)>>>,
        pub connected: Arc<Mutex<Vec<Mac>>>,
        pub mtu: usize,
    }

    impl NullDriver {
        pub fn with_mtu(mtu: usize) -> Self {
            Self {
                mtu,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Driver for NullDriver {
        async fn start(
            &self,
            _service_uuid: &str,
            _rx_char: &str,
            _tx_char: &str,
            _identity_char: &str,
            _events: mpsc::Sender<DriverEvent>,
        ) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn set_identity(&self, _identity: [u8; 16]) -> Result<()> {
            Ok(())
        }
        async fn start_scanning(&self) -> Result<()> {
            Ok(())
        }
        async fn stop_scanning(&self) -> Result<()> {
            Ok(())
        }
        async fn start_advertising(&self, _name: Option<&str>) -> Result<()> {
            Ok(())
        }
        async fn stop_advertising(&self) -> Result<()> {
            Ok(())
        }
        async fn connect(&self, mac: Mac) -> Result<()> {
            self.connected.lock().await.push(mac);
            Ok(())
        }
        async fn disconnect(&self, _mac: Mac) -> Result<()> {
            Ok(())
        }
        async fn send(&self, mac: Mac, bytes: &[u8]) -> Result<()> {
            self.sent.lock().await.push((mac, bytes.to_vec()));
            Ok(())
        }
        async fn peer_mtu(&self, _mac: Mac) -> usize {
            if self.mtu == 0 {
                23
            } else {
                self.mtu
            }
        }
    }
}
