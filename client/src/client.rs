use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, Context, Result};
use pmrelay_common::{
    auth::Attributes,
    config::{self, ClientCertPath},
    error::PmError,
    negotiate::Negotiator,
    pdu::{CredsPdu, Credential, ErrorPdu, IpcFlags, Pdu, PduFrame, PduInfo, SizeLimit},
    platform_socket::{connect_tcp, connect_unix},
    preamble::{self, UpstreamTarget},
    security::{SecurityConfig, SecurityProvider},
    transport::Transport,
};

/// Where the relay listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAddress {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl RelayAddress {
    fn server_name(&self) -> &str {
        match self {
            RelayAddress::Tcp { host, .. } => host,
            RelayAddress::Unix(_) => "localhost",
        }
    }
}

impl Default for RelayAddress {
    fn default() -> Self {
        RelayAddress::Tcp {
            host: "localhost".to_string(),
            port: config::relay_port(),
        }
    }
}

/// Configuration for a relayed connection
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay to connect through
    pub relay:           RelayAddress,
    /// Collector the relay should connect to
    pub upstream:        UpstreamTarget,
    /// Connection features to request
    pub flags:           IpcFlags,
    /// Identity to authenticate with
    pub attrs:           Attributes,
    /// Trust roots and optional client certificate for encryption
    pub cert_path:       Option<ClientCertPath>,
    /// Name the relay certificate must match; defaults to the relay host
    pub server_name:     Option<String>,
    pub connect_timeout: Option<Duration>,
    /// Bound on each receive; `None` waits forever
    pub timeout:         Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay:           RelayAddress::default(),
            upstream:        UpstreamTarget {
                host: "localhost".to_string(),
                port: config::upstream_port(),
            },
            flags:           IpcFlags::NONE,
            attrs:           Attributes::default(),
            cert_path:       None,
            server_name:     None,
            connect_timeout: config::connect_timeout(),
            timeout:         config::request_timeout(),
        }
    }
}

impl ClientConfig {
    /// Creates a client configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to the relay over TCP
    pub fn with_relay<S: Into<String>>(mut self, host: S, port: u16) -> Self {
        self.relay = RelayAddress::Tcp {
            host: host.into(),
            port,
        };
        self
    }

    /// Connect to the relay's local-domain socket
    pub fn with_relay_socket<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.relay = RelayAddress::Unix(path.into());
        self
    }

    /// Set the collector to reach through the relay
    pub fn with_upstream<S: Into<String>>(mut self, host: S, port: u16) -> Self {
        self.upstream = UpstreamTarget {
            host: host.into(),
            port,
        };
        self
    }

    pub fn with_flags(mut self, flags: IpcFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Authenticate as `username`. Implies `AUTH`.
    pub fn with_credentials<U: Into<String>, S: Into<String>>(mut self, username: U, secret: S) -> Self {
        self.attrs = self.attrs.with_credentials(username, secret);
        self.flags.insert(IpcFlags::AUTH);
        self
    }

    /// Prefer this mechanism when the server offers it
    pub fn with_method<S: Into<String>>(mut self, method: S) -> Self {
        self.attrs = self.attrs.with_method(method);
        self
    }

    /// Set the certificate path
    pub fn with_cert_path(mut self, cert_path: ClientCertPath) -> Self {
        self.cert_path = Some(cert_path);
        self
    }

    pub fn with_server_name<S: Into<String>>(mut self, name: S) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Set the receive timeout
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Flags to send in reply to the collector's advertised features.
pub fn negotiated_flags(requested: IpcFlags, features: IpcFlags) -> IpcFlags {
    let mut flags = requested;
    for demanded in [IpcFlags::CERT_REQD, IpcFlags::CREDS_REQD] {
        if features.contains(demanded) {
            flags.insert(demanded);
        }
    }
    if requested.contains(IpcFlags::SECURE) && features.contains(IpcFlags::SECURE_ACK) {
        flags.insert(IpcFlags::SECURE_ACK);
    }
    flags
}

/// A connection to a collector, made through the relay.
pub struct RelayClient {
    transport: Transport,
    origin:    i32,
    timeout:   Option<Duration>,
    features:  IpcFlags,
    flags:     IpcFlags,
}

impl RelayClient {
    /// Connect, name the collector, and complete the security handshake.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let socket = match &config.relay {
            RelayAddress::Tcp { host, port } => connect_tcp(host, *port, config.connect_timeout)
                .with_context(|| format!("Failed to connect to relay {}:{}", host, port))?,
            RelayAddress::Unix(path) => connect_unix(path)
                .with_context(|| format!("Failed to connect to relay socket {:?}", path))?,
        };
        let mut transport = Transport::new(socket);

        preamble::offer(&mut transport, &config.upstream, config.timeout)
            .context("Relay rejected the connection preamble")?;

        let frame = transport
            .recv_pdu(SizeLimit::default(), config.timeout)
            .context("No greeting from collector")?;
        let features = match Pdu::decode(&frame)? {
            Pdu::Error(ErrorPdu {
                code: 0,
                datum: Some(datum),
            }) => IpcFlags::from_bits(PduInfo::from_raw(datum as u32).features() as u32),
            Pdu::Error(ErrorPdu { code, .. }) if code < 0 => {
                return Err(PmError::from_code(code)).context("Connection refused before negotiation");
            }
            other => return Err(anyhow!("Unexpected {} greeting from collector", other.kind())),
        };
        tracing::debug!("collector {}:{} offers {:?}", config.upstream.host, config.upstream.port, features);

        let flags = negotiated_flags(config.flags, features);
        let origin = std::process::id() as i32;
        let hello = Pdu::Creds(CredsPdu {
            creds:   vec![Credential::version(flags)],
            payload: Default::default(),
        });
        transport
            .send_pdu(&hello.encode(origin))
            .context("Failed to send connection flags")?;

        let provider = SecurityProvider::new(SecurityConfig {
            client: config.cert_path.clone(),
            ..Default::default()
        });
        let server_name = config
            .server_name
            .as_deref()
            .unwrap_or_else(|| config.relay.server_name());
        let mut negotiator = Negotiator::new(provider).with_timeout(config.timeout);
        negotiator
            .client_handshake(&mut transport, flags, server_name, &config.attrs)
            .with_context(|| format!("Handshake with {} failed", transport.peer()))?;

        tracing::info!("✓ Connected to {}:{} via relay", config.upstream.host, config.upstream.port);
        Ok(Self {
            transport,
            origin,
            timeout: config.timeout,
            features,
            flags,
        })
    }

    /// Features the collector advertised.
    pub fn features(&self) -> IpcFlags {
        self.features
    }

    /// Flags this connection was negotiated with.
    pub fn flags(&self) -> IpcFlags {
        self.flags
    }

    pub fn is_encrypted(&self) -> bool {
        self.transport.security().is_encrypted()
    }

    pub fn authenticated_as(&self) -> Option<&str> {
        self.transport.security().auth().map(|session| session.username())
    }

    pub fn send(&mut self, pdu: &Pdu) -> Result<()> {
        self.send_frame(&pdu.encode(self.origin))
    }

    /// Receive and decode one reply.
    pub fn recv(&mut self) -> Result<Pdu> {
        let frame = self.recv_frame()?;
        Ok(Pdu::decode(&frame)?)
    }

    pub fn send_frame(&mut self, frame: &PduFrame) -> Result<()> {
        self.transport
            .send_pdu(frame)
            .context("Failed to send PDU")
    }

    /// Send several frames in one write, so requests can be pipelined.
    pub fn send_batch(&mut self, frames: &[PduFrame]) -> Result<()> {
        let batch = frames
            .iter()
            .map(PduFrame::as_bytes)
            .collect::<Vec<_>>()
            .concat();
        self.transport
            .write_all(&batch)
            .context("Failed to send PDU batch")
    }

    pub fn recv_frame(&mut self) -> Result<PduFrame> {
        self.transport
            .recv_pdu(SizeLimit::Any, self.timeout)
            .context("Failed to receive PDU")
    }

    /// Close the connection. Safe to call more than once.
    pub fn disconnect(&mut self) {
        if !self.transport.is_closed() {
            tracing::debug!("disconnecting from {}", self.transport.peer());
            self.transport.close();
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
