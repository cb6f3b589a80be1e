//! Core BLE mesh protocol engine.
//!
//! Bridges a generic mesh networking layer (the *upper stack*) to Bluetooth
//! Low Energy transport on a local host: discovers nearby peers, decides
//! connection direction, exchanges stable identities across MAC rotation,
//! and fragments/reassembles upper-stack packets across the negotiated MTU.
//!
//! The concrete BLE driver and the upper mesh stack are external
//! collaborators, contracted through [`driver`] and [`host`].

pub mod arbiter;
pub mod codec;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod host;
pub mod identity;
pub mod logging;
pub mod mac;
pub mod orchestrator;
pub mod reassembly;
pub mod registry;
pub mod scheduler;
pub mod scoring;
pub mod wire;

pub use engine::Engine;
pub use error::{Error, Result};
pub use identity::Identity;
pub use mac::Mac;
