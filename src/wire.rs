//! Wire-level constants shared by the driver and the codec (spec §6.3).

/// GATT service advertised by every mesh node.
pub const SERVICE_UUID: &str = "37145b00-442d-4a94-917f-8f42c5da28e3";
/// Write / write-without-response characteristic a central writes to.
pub const RX_CHARACTERISTIC_UUID: &str = "37145b00-442d-4a94-917f-8f42c5da28e5";
/// Read / notify characteristic a peripheral sends on.
pub const TX_CHARACTERISTIC_UUID: &str = "37145b00-442d-4a94-917f-8f42c5da28e4";
/// Read-only 16-byte identity characteristic.
pub const IDENTITY_CHARACTERISTIC_UUID: &str = "37145b00-442d-4a94-917f-8f42c5da28e6";

/// Minimum negotiable BLE ATT MTU.
pub const MIN_MTU: usize = 23;
/// Advertisement payload budget; a device name must fit alongside the
/// service UUID within this many bytes.
pub const MAX_ADVERTISEMENT_BYTES: usize = 31;
/// Maximum advertised device name length (spec §6.3).
pub const MAX_DEVICE_NAME_BYTES: usize = 8;
