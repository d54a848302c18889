//! pmrelay Client Library
//!
//! Connects to a metrics collector through a pmrelay relay. The client
//! names the collector in the plaintext preamble, answers the collector's
//! feature advertisement, and then runs the same security handshake it
//! would run against the collector directly.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use pmrelay_client::{ClientConfig, RelayClient};
//! use pmrelay_common::pdu::{Pdu, PmId, TextReq};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = ClientConfig::new()
//!     .with_relay("relay.example", 44322)
//!     .with_upstream("collector.example", 44321)
//!     .with_credentials("alice", "wonderland")
//!     .with_timeout(Some(Duration::from_secs(10)));
//!
//! let mut client = RelayClient::connect(config)?;
//! client.send(&Pdu::TextReq(TextReq {
//!     ident:     PmId::new(60, 2, 0).raw() as i32,
//!     text_type: 1,
//! }))?;
//! println!("{:?}", client.recv()?);
//!
//! client.disconnect();
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::*;
// Re-export important types from pmrelay-common for convenience
pub use pmrelay_common::{ClientCertPath, IpcFlags, Pdu};
