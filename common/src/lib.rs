//! pmrelay Common Library
//!
//! This crate provides the protocol layers shared by the relay and its
//! clients. It includes:
//!
//! - The PDU codec: framing, type codes and typed payloads
//! - Platform socket wrappers and readiness polling
//! - A transport that routes through an attached TLS channel
//! - The secure channel negotiator and credential-exchange mechanisms
//! - Configuration defaults and environment overrides
//!
//! # Features
//!
//! - **Fixed wire format**: big-endian frames with a trailing length check,
//!   identical on 32-bit and 64-bit hosts
//! - **Transparent TLS upgrade**: optional mutual TLS negotiated in-band
//! - **Credential exchange**: PLAIN and HMAC-SHA256 carried inside PDUs
//! - **Local trust**: local-domain peers are identified by the kernel

/// Metric-source plugin interface
pub mod agent;

/// Credential-exchange mechanisms and connection attributes
pub mod auth;

/// Configuration defaults and environment overrides
pub mod config;

/// Shared error space
pub mod error;

/// Per-leg security handshake
pub mod negotiate;

/// PDU framing and payloads
pub mod pdu;

/// Plaintext version and target lines sent before framing starts
pub mod preamble;

/// Platform-specific socket implementations
pub mod platform_socket;

/// Process-wide TLS and credential state
pub mod security;

/// TLS session over a borrowed socket
pub mod tls_stream;

/// Connections with an optional security context
pub mod transport;

// Re-export commonly used types for convenience
pub use agent::{AgentInterface, AgentV2, AgentV4};
pub use auth::{Attributes, Mechanism, UserDatabase};
pub use config::{ClientCertPath, ServerCertPath};
pub use error::PmError;
pub use negotiate::{LegState, Negotiator};
pub use pdu::{IpcFlags, Pdu, PduFrame, PduType, SizeLimit};
pub use platform_socket::{ClientCredentials, PlatformListener, PlatformSocket};
pub use security::{SecurityConfig, SecurityProvider};
pub use transport::Transport;
