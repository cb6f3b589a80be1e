//! Reference [`Driver`] backed by the cross-platform `btleplug` crate
//! (spec §6.1). `btleplug` only speaks the BLE central role, so
//! [`start_advertising`]/[`stop_advertising`] are no-ops here; a peripheral
//! role needs a platform-specific GATT server (e.g. BlueZ over D-Bus) that
//! this reference implementation does not provide.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::driver::{Driver, DriverEvent};
use crate::error::{Error, Result};
use crate::mac::Mac;
use crate::wire;

fn mac_of(peripheral: &Peripheral) -> Mac {
    let id = peripheral.id().to_string();
    let octets: Vec<u8> = id
        .split(|c: char| !c.is_ascii_hexdigit())
        .filter(|s| !s.is_empty())
        .flat_map(|s| s.as_bytes().chunks(2).map(|c| c.to_vec()).collect::<Vec<_>>())
        .filter_map(|pair| u8::from_str_radix(std::str::from_utf8(&pair).ok()?, 16).ok())
        .take(6)
        .collect();
    let mut buf = [0u8; 6];
    buf[..octets.len().min(6)].copy_from_slice(&octets[..octets.len().min(6)]);
    Mac::from_octets(buf)
}

pub struct BtleplugDriver {
    adapter: Arc<RwLock<Option<Adapter>>>,
    peripherals: Arc<RwLock<HashMap<Mac, Peripheral>>>,
}

impl BtleplugDriver {
    pub fn new() -> Self {
        Self {
            adapter: Arc::new(RwLock::new(None)),
            peripherals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn find_peripheral(&self, mac: Mac) -> Option<Peripheral> {
        self.peripherals.read().await.get(&mac).cloned()
    }
}

impl Default for BtleplugDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for BtleplugDriver {
    async fn start(
        &self,
        _service_uuid: &str,
        _rx_char: &str,
        _tx_char: &str,
        _identity_char: &str,
        events: mpsc::Sender<DriverEvent>,
    ) -> Result<()> {
        let manager = Manager::new()
            .await
            .map_err(|e| Error::FatalStartup(format!("btleplug manager init failed: {e}")))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| Error::FatalStartup(format!("no BLE adapters: {e}")))?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| Error::FatalStartup("no BLE adapter present".into()))?;

        let mut adapter_events = adapter
            .events()
            .await
            .map_err(|e| Error::FatalStartup(format!("failed to subscribe to adapter events: {e}")))?;

        let peripherals_for_task = self.peripherals.clone();
        let adapter_for_task = adapter.clone();
        tokio::spawn(async move {
            while let Some(event) = adapter_events.next().await {
                use btleplug::api::CentralEvent;
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        let Ok(peripheral) = adapter_for_task.peripheral(&id).await else {
                            continue;
                        };
                        let Ok(Some(props)) = peripheral.properties().await else {
                            continue;
                        };
                        let mac = mac_of(&peripheral);
                        peripherals_for_task.write().await.insert(mac, peripheral);
                        let rssi = props.rssi.unwrap_or(-127) as i16;
                        let _ = events
                            .send(DriverEvent::DeviceDiscovered {
                                mac,
                                rssi,
                                name: props.local_name,
                            })
                            .await;
                    }
                    CentralEvent::DeviceConnected(id) => {
                        let Ok(peripheral) = adapter_for_task.peripheral(&id).await else {
                            continue;
                        };
                        let mac = mac_of(&peripheral);
                        let mtu = wire::MIN_MTU;
                        let _ = events.send(DriverEvent::DeviceConnected { mac, mtu }).await;
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let Ok(peripheral) = adapter_for_task.peripheral(&id).await else {
                            continue;
                        };
                        let mac = mac_of(&peripheral);
                        let _ = events.send(DriverEvent::DeviceDisconnected { mac }).await;
                    }
                    _ => {}
                }
            }
        });

        *self.adapter.write().await = Some(adapter);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(adapter) = self.adapter.read().await.as_ref() {
            let _ = adapter.stop_scan().await;
        }
        Ok(())
    }

    async fn set_identity(&self, _identity: [u8; 16]) -> Result<()> {
        // btleplug has no GATT-server support; a peripheral-side identity
        // characteristic cannot be populated from the central role.
        Ok(())
    }

    async fn start_scanning(&self) -> Result<()> {
        let guard = self.adapter.read().await;
        let adapter = guard
            .as_ref()
            .ok_or_else(|| Error::FatalStartup("driver not started".into()))?;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| Error::DriverFailure(e.to_string()))
    }

    async fn stop_scanning(&self) -> Result<()> {
        let guard = self.adapter.read().await;
        let Some(adapter) = guard.as_ref() else {
            return Ok(());
        };
        adapter
            .stop_scan()
            .await
            .map_err(|e| Error::DriverFailure(e.to_string()))
    }

    async fn start_advertising(&self, _name: Option<&str>) -> Result<()> {
        debug!("btleplug driver has no peripheral role; start_advertising is a no-op");
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self, mac: Mac) -> Result<()> {
        let Some(peripheral) = self.find_peripheral(mac).await else {
            return Err(Error::DriverFailure(format!("{mac} not discovered")));
        };
        peripheral
            .connect()
            .await
            .map_err(|e| Error::DriverFailure(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| Error::DriverFailure(e.to_string()))
    }

    async fn disconnect(&self, mac: Mac) -> Result<()> {
        let Some(peripheral) = self.find_peripheral(mac).await else {
            return Ok(());
        };
        peripheral
            .disconnect()
            .await
            .map_err(|e| Error::DriverFailure(e.to_string()))
    }

    async fn send(&self, mac: Mac, bytes: &[u8]) -> Result<()> {
        let Some(peripheral) = self.find_peripheral(mac).await else {
            return Err(Error::DriverFailure(format!("{mac} not connected")));
        };
        let characteristics = peripheral.characteristics();
        let rx = characteristics
            .iter()
            .find(|c| c.uuid.to_string().eq_ignore_ascii_case(wire::RX_CHARACTERISTIC_UUID))
            .ok_or_else(|| Error::DriverFailure("RX characteristic not found".into()))?;
        peripheral
            .write(rx, bytes, btleplug::api::WriteType::WithResponse)
            .await
            .map_err(|e| {
                warn!(%mac, error = %e, "write failed");
                Error::DriverFailure(e.to_string())
            })
    }

    async fn peer_mtu(&self, _mac: Mac) -> usize {
        wire::MIN_MTU
    }

    async fn remove_device(&self, mac: Mac) -> Result<()> {
        self.peripherals.write().await.remove(&mac);
        Ok(())
    }
}
