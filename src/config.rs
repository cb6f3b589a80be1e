//! Configuration surface (spec §6.4): every knob the engine recognizes,
//! loadable from TOML with sensible defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Adjusts `scan_interval` and scan duty (spec §6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerMode {
    Aggressive,
    Balanced,
    Saver,
}

impl Default for PowerMode {
    fn default() -> Self {
        Self::Balanced
    }
}

/// All recognized engine configuration (spec §6.4). `Duration` fields
/// serialize as human-readable strings (`"5s"`, `"1.5s"`) via
/// `humantime_serde`, rather than std's unserializable raw form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on simultaneous Active peers (1-10).
    pub max_peers: usize,
    /// LRU cap on the Peer Registry (10-500).
    pub max_discovered_peers: usize,
    /// Discovery cadence (1-60s).
    #[serde(with = "humantime_serde")]
    pub scan_interval: Duration,
    /// Advertisement filter (-100..-30).
    pub min_rssi: i16,
    /// Delay after link-up before GATT discovery (platform quirk hook).
    #[serde(with = "humantime_serde")]
    pub service_discovery_delay: Duration,
    /// Bound for a single connection attempt and for reassembly (10-120s).
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,
    /// Minimum interval between dials to one peer.
    #[serde(with = "humantime_serde")]
    pub connect_rate_limit: Duration,
    /// Threshold before blacklist backoff kicks in.
    pub max_failures_before_blacklist: u32,
    pub power_mode: PowerMode,
    pub enable_central: bool,
    pub enable_peripheral: bool,
    /// Advertised name, default empty. Must be <= 8 bytes (spec §6.3).
    pub device_name: Option<String>,
    /// Cleanup sweep cadence (spec §4.8); not in the spec's table of
    /// *tunable* options but exposed here since the sweep interval is
    /// otherwise a silent magic number.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// How long a `Discovered` peer may sit with no activity before the
    /// cleanup sweep releases it (spec §4.8).
    #[serde(with = "humantime_serde")]
    pub stale_discovered_ttl: Duration,
    /// Bound on shutdown drain (spec §4.8, §5).
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_peers: 7,
            max_discovered_peers: 100,
            scan_interval: Duration::from_secs(5),
            min_rssi: -85,
            service_discovery_delay: Duration::from_millis(1500),
            connection_timeout: Duration::from_secs(30),
            connect_rate_limit: Duration::from_secs(5),
            max_failures_before_blacklist: 3,
            power_mode: PowerMode::Balanced,
            enable_central: true,
            enable_peripheral: true,
            device_name: None,
            cleanup_interval: Duration::from_secs(30),
            stale_discovered_ttl: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every bound in spec §6.4's table.
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.max_peers) {
            return Err(Error::Config("max_peers must be in 1..=10".into()));
        }
        if !(10..=500).contains(&self.max_discovered_peers) {
            return Err(Error::Config(
                "max_discovered_peers must be in 10..=500".into(),
            ));
        }
        if !(Duration::from_secs(1)..=Duration::from_secs(60)).contains(&self.scan_interval) {
            return Err(Error::Config("scan_interval must be in 1s..=60s".into()));
        }
        if !(-100..=-30).contains(&self.min_rssi) {
            return Err(Error::Config("min_rssi must be in -100..=-30".into()));
        }
        if !(Duration::from_millis(500)..=Duration::from_secs(5))
            .contains(&self.service_discovery_delay)
        {
            return Err(Error::Config(
                "service_discovery_delay must be in 0.5s..=5s".into(),
            ));
        }
        if !(Duration::from_secs(10)..=Duration::from_secs(120)).contains(&self.connection_timeout)
        {
            return Err(Error::Config(
                "connection_timeout must be in 10s..=120s".into(),
            ));
        }
        if self.max_failures_before_blacklist == 0 {
            return Err(Error::Config(
                "max_failures_before_blacklist must be > 0".into(),
            ));
        }
        if let Some(name) = &self.device_name {
            if name.len() > crate::wire::MAX_DEVICE_NAME_BYTES {
                return Err(Error::Config(format!(
                    "device_name must be <= {} bytes",
                    crate::wire::MAX_DEVICE_NAME_BYTES
                )));
            }
        }
        if !self.enable_central && !self.enable_peripheral {
            return Err(Error::Config(
                "at least one of enable_central/enable_peripheral must be true".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_device_name_over_8_bytes() {
        let mut config = EngineConfig {
            device_name: Some("way too long".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.device_name = Some("short".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_max_peers_out_of_range() {
        let config = EngineConfig {
            max_peers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_toml() {
        let toml_str = r#"
            max_peers = 5
            scan_interval = "10s"
            min_rssi = -90
        "#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_peers, 5);
        assert_eq!(config.scan_interval, Duration::from_secs(10));
        assert_eq!(config.min_rssi, -90);
        // Unspecified fields keep their defaults via `#[serde(default)]`.
        assert_eq!(config.connect_rate_limit, Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn requires_at_least_one_role_enabled() {
        let config = EngineConfig {
            enable_central: false,
            enable_peripheral: false,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
