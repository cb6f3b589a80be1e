//! meshcore CLI: loads configuration, brings the engine up against a
//! concrete driver, and runs until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use rand::{Rng, RngCore};

use meshcore::config::EngineConfig;
use meshcore::driver::Driver;
use meshcore::host::{Host, PeerHandle};
use meshcore::identity::Identity;
use meshcore::mac::Mac;
use meshcore::{Engine, Result};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Set the verbosity level (passed to `RUST_LOG` if unset)
    #[arg(short, long, default_value = "info")]
    verbosity: String,

    /// Path to a TOML configuration file; defaults are used if omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Minimal upper-stack stand-in for running the engine standalone: logs
/// every delivered packet instead of routing it into a real mesh layer.
struct LoggingHost {
    local_identity: [u8; 16],
    local_mac: Mac,
}

#[async_trait]
impl Host for LoggingHost {
    async fn local_identity(&self) -> [u8; 16] {
        self.local_identity
    }

    async fn inbound(&self, peer: PeerHandle, packet: Vec<u8>) {
        tracing::info!(peer = %peer.identity(), bytes = packet.len(), "inbound packet");
    }

    async fn local_mac(&self) -> Mac {
        self.local_mac
    }

    async fn peer_appeared(&self, identity: Identity, _peer: PeerHandle) {
        tracing::info!(%identity, "peer appeared");
    }

    async fn peer_gone(&self, identity: Identity) {
        tracing::info!(%identity, "peer gone");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    meshcore::logging::init(&args.verbosity);

    let config = match &args.config {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::default(),
    };
    tracing::info!(?config, "configuration loaded");

    let driver: Arc<dyn Driver> = build_driver()?;

    let mut rng = rand::thread_rng();
    let mut identity_bytes = [0u8; 16];
    rng.fill_bytes(&mut identity_bytes);
    let local_mac = Mac::new(rng.gen_range(0..=0xFFFF_FFFF_FFFFu64));
    let host: Arc<dyn Host> = Arc::new(LoggingHost {
        local_identity: identity_bytes,
        local_mac,
    });

    let engine = Arc::new(Engine::new(config, driver, host, identity_bytes, local_mac)?);
    engine.start().await?;

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown requested");
    engine.stop().await?;

    Ok(())
}

#[cfg(feature = "btleplug-driver")]
fn build_driver() -> Result<Arc<dyn Driver>> {
    Ok(Arc::new(meshcore::driver::linux_btleplug::BtleplugDriver::new()))
}

#[cfg(not(feature = "btleplug-driver"))]
fn build_driver() -> Result<Arc<dyn Driver>> {
    Err(meshcore::Error::FatalStartup(
        "no BLE driver compiled in; rebuild with --features btleplug-driver or supply a custom Driver".into(),
    ))
}
