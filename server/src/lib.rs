//! pmrelay Server Library
//!
//! Relays the metrics protocol between monitoring clients and upstream
//! collectors. Each accepted client is paired with one upstream connection;
//! both legs are secured independently and frames are then forwarded
//! verbatim.
//!
//! # Example
//!
//! ```no_run
//! use pmrelay_common::{SecurityConfig, SecurityProvider};
//! use pmrelay_server::{RelayConfig, RelayEngine};
//!
//! fn main() -> anyhow::Result<()> {
//!     let provider = SecurityProvider::new(SecurityConfig::default());
//!     let mut relay = RelayEngine::bind(RelayConfig::default(), provider)?;
//!     relay.run()
//! }
//! ```

/// Live pairings and their lifecycle
pub mod registry;

/// Accept loop and frame forwarding
pub mod relay;

pub use registry::{ClientPairing, ConnectionRegistry, Leg, PairingState};
pub use relay::{ClientPeer, RelayConfig, RelayEngine};
