//! Single-threaded relay between monitoring clients and collectors.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    os::fd::{AsFd, BorrowedFd},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use pmrelay_common::{
    config,
    error::PmError,
    negotiate::{LegState, Negotiator},
    pdu::{ErrorPdu, IpcFlags, Pdu, PduFrame, PduInfo, PduType, SizeLimit},
    platform_socket::{poll_readable, PlatformListener},
    preamble::{self, UpstreamTarget},
    security::SecurityProvider,
    transport::Transport,
};

use crate::registry::{ConnectionRegistry, Leg};

/// Longest single wait, so a shutdown request is noticed promptly.
const POLL_TICK: Duration = Duration::from_secs(1);

/// Relay settings, usually from the command line and environment.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Addresses to listen on; empty means every interface
    pub interfaces:      Vec<IpAddr>,
    pub ports:           Vec<u16>,
    /// Local-domain socket to listen on as well
    pub socket_path:     Option<PathBuf>,
    pub max_pending:     i32,
    /// Demand client certificates from remote clients
    pub require_cert:    bool,
    /// Refuse remote clients that do not authenticate
    pub require_auth:    bool,
    /// Ceiling for PDUs read from clients
    pub pdu_limit:       SizeLimit,
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interfaces:      Vec::new(),
            ports:           vec![config::relay_port()],
            socket_path:     None,
            max_pending:     config::max_pending(),
            require_cert:    false,
            require_auth:    false,
            pdu_limit:       SizeLimit::default(),
            connect_timeout: config::connect_timeout(),
            request_timeout: config::request_timeout(),
        }
    }
}

impl RelayConfig {
    /// Every TCP address the relay should bind.
    pub fn bind_addresses(&self) -> Vec<SocketAddr> {
        let interfaces = if !self.interfaces.is_empty() {
            self.interfaces.clone()
        } else if config::local_only() {
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
        } else {
            vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)]
        };
        interfaces
            .iter()
            .flat_map(|ip| self.ports.iter().map(move |port| SocketAddr::new(*ip, *port)))
            .collect()
    }

    /// Flags both legs are negotiated with: the client's request plus what
    /// the upstream's features and relay policy demand of this peer.
    /// Local-domain and loopback clients are exempt from certificate
    /// demands.
    pub fn leg_flags(
        &self,
        requested: IpcFlags,
        server_features: IpcFlags,
        peer: ClientPeer,
    ) -> Result<IpcFlags, PmError> {
        let mut flags = requested;
        if (server_features.contains(IpcFlags::CERT_REQD) || self.require_cert)
            && !peer.local
            && !peer.loopback
        {
            if !flags.contains(IpcFlags::SECURE) {
                return Err(PmError::NeedClientCert);
            }
            flags.insert(IpcFlags::CERT_REQD);
        }
        if self.require_auth
            && !peer.local
            && !flags.intersects(IpcFlags::AUTH | IpcFlags::CREDS_REQD)
        {
            return Err(PmError::Permission);
        }
        Ok(flags)
    }
}

/// Where a client connected from, as far as relay policy cares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientPeer {
    /// Local-domain socket
    pub local:    bool,
    /// TCP from a loopback address
    pub loopback: bool,
}

/// Accepts clients, pairs each with an upstream collector, runs both
/// handshakes and then forwards frames verbatim.
///
/// Everything happens on the calling thread. A handshake in progress holds
/// up every other connection until it completes or times out.
pub struct RelayEngine {
    listeners: Vec<PlatformListener>,
    registry:  ConnectionRegistry,
    provider:  SecurityProvider,
    config:    RelayConfig,
    shutdown:  Arc<AtomicBool>,
    closed:    bool,
}

impl RelayEngine {
    /// Bind every configured listener and bring up the security provider.
    pub fn bind(config: RelayConfig, provider: SecurityProvider) -> Result<Self> {
        let mut listeners = Vec::new();
        for addr in config.bind_addresses() {
            let listener = PlatformListener::bind_tcp(addr, config.max_pending)
                .with_context(|| format!("Failed to bind relay port {}", addr))?;
            listeners.push(listener);
        }
        if let Some(path) = &config.socket_path {
            let listener = PlatformListener::bind_unix(path)
                .with_context(|| format!("Failed to bind relay socket {}", path.display()))?;
            listeners.push(listener);
        }
        Self::with_listeners(listeners, config, provider)
    }

    /// Build an engine over listeners that are already bound.
    pub fn with_listeners(
        listeners: Vec<PlatformListener>,
        config: RelayConfig,
        provider: SecurityProvider,
    ) -> Result<Self> {
        provider
            .initialize()
            .context("Failed to initialize security provider")?;
        for listener in &listeners {
            listener
                .set_nonblocking(true)
                .with_context(|| format!("Failed to configure {}", listener.describe()))?;
        }
        Ok(Self {
            listeners,
            registry: ConnectionRegistry::new(),
            provider,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            closed: false,
        })
    }

    /// Flag that stops [`RelayEngine::run`] once set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(PlatformListener::local_addr)
            .collect()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Serve until the shutdown flag is set, then close everything.
    pub fn run(&mut self) -> Result<()> {
        for listener in &self.listeners {
            tracing::info!("Relay listening on {}", listener.describe());
        }
        while !self.shutdown.load(Ordering::SeqCst) {
            self.run_once(Some(POLL_TICK))?;
        }
        tracing::info!("Shutdown signal received, stopping relay");
        self.shutdown();
        Ok(())
    }

    /// Wait up to `timeout` for activity and handle it. Returns how many
    /// ready descriptors were serviced.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<usize> {
        if self.closed {
            return Ok(0);
        }

        let buffered = self.registry.buffered_descriptors();
        let wait = if buffered.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        let listeners = self.listeners.len();
        let pairing_fds = self.registry.descriptors();
        let ready = {
            let mut fds: Vec<BorrowedFd<'_>> = self.listeners.iter().map(AsFd::as_fd).collect();
            fds.extend(self.registry.sockets().map(AsFd::as_fd));
            poll_readable(&fds, wait).context("Failed waiting for relay activity")?
        };

        let mut serviced = 0;
        for index in 0..listeners {
            if ready[index] {
                self.accept_client(index);
                serviced += 1;
            }
        }

        for (offset, fd) in pairing_fds.iter().enumerate() {
            if !ready[listeners + offset] && !buffered.contains(fd) {
                continue;
            }
            // an earlier teardown in this pass may have taken the pairing
            let Some((slot, leg)) = self.registry.find_by_descriptor(*fd) else {
                continue;
            };
            let outcome = match leg {
                Leg::Client => self.from_client(slot),
                Leg::Upstream => self.from_upstream(slot),
            };
            if let Err(e) = outcome {
                self.teardown(slot, leg, e);
            }
            serviced += 1;
        }
        Ok(serviced)
    }

    /// Close every pairing and listener. Later calls do nothing.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let released = self.registry.release_all();
        let listeners = self.listeners.len();
        self.listeners.clear();
        tracing::info!(
            "✓ Relay stopped: closed {} active pairings and {} listeners",
            released,
            listeners
        );
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed
    }

    fn accept_client(&mut self, index: usize) {
        let socket = match self.listeners[index].accept() {
            Ok(socket) => socket,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                tracing::error!("Connection error on {}: {}", self.listeners[index].describe(), e);
                return;
            }
        };
        let client = Transport::new(socket);
        let peer = client.peer().to_string();
        tracing::info!("New connection from {}", peer);

        let slot = self.registry.allocate(client);
        if let Err(e) = self.open_pairing(slot) {
            tracing::warn!("Dropping client {}: {}", peer, e);
            self.registry.release(slot);
        }
    }

    fn open_pairing(&mut self, slot: usize) -> Result<(), PmError> {
        let request_timeout = self.config.request_timeout;
        let connect_timeout = self.config.connect_timeout;
        let pairing = self.registry.get_mut(slot).ok_or(PmError::Eof)?;

        let target = preamble::accept(&mut pairing.client, request_timeout)?;
        // a local-domain upstream trusts its peer's uid, which is ours
        if target.is_local_path() && !pairing.client.is_trust_anchored() {
            tracing::warn!(
                "Refusing local-domain upstream {} for remote client {}",
                target.host,
                pairing.client.peer()
            );
            let reply = Pdu::error(PmError::Permission.code()).encode(std::process::id() as i32);
            if let Err(e) = pairing.client.send_pdu(&reply) {
                tracing::debug!("refusal not delivered: {}", e);
            }
            return Err(PmError::Permission);
        }
        pairing.upstream_host = Some(target.host.clone());
        pairing.upstream_port = target.port;

        let upstream = target.connect(connect_timeout)?;
        pairing.begin_negotiation(upstream)?;
        tracing::info!(
            "✓ Paired {} with upstream {}:{}",
            pairing.client.peer(),
            target.host,
            target.port
        );
        Ok(())
    }

    fn from_client(&mut self, slot: usize) -> Result<(), PmError> {
        let limit = self.config.pdu_limit;
        let timeout = self.config.request_timeout;
        let pairing = self.registry.get_mut(slot).ok_or(PmError::Eof)?;
        let frame = pairing.client.recv_pdu(limit, timeout)?;

        if !pairing.is_relaying() {
            return self.verify_client(slot, frame);
        }
        pairing.upstream()?.send_pdu(&frame)
    }

    fn from_upstream(&mut self, slot: usize) -> Result<(), PmError> {
        let timeout = self.config.request_timeout;
        let pairing = self.registry.get_mut(slot).ok_or(PmError::Eof)?;
        let frame = pairing.upstream()?.recv_pdu(SizeLimit::Any, timeout)?;

        if !pairing.is_relaying() && frame.pdu_type() == PduType::Error {
            if let Ok(Pdu::Error(ErrorPdu {
                datum: Some(datum), ..
            })) = Pdu::decode(&frame)
            {
                let info = PduInfo::from_raw(datum as u32);
                pairing.server_features = IpcFlags::from_bits(info.features() as u32);
                tracing::debug!(
                    "upstream {} advertises {:?}",
                    pairing.upstream_host.as_deref().unwrap_or("?"),
                    pairing.server_features
                );
            }
        }
        pairing.client.send_pdu(&frame)
    }

    /// The first client PDU must be CREDS. Secure the client leg, pass the
    /// PDU on, then secure the upstream leg with the same flags, including
    /// any the relay's own policy added.
    fn verify_client(&mut self, slot: usize, frame: PduFrame) -> Result<(), PmError> {
        if frame.pdu_type() != PduType::Creds {
            return Err(PmError::Ipc(format!(
                "first client PDU was {}, expected CREDS",
                frame.pdu_type()
            )));
        }
        let Pdu::Creds(creds) = Pdu::decode(&frame)? else {
            return Err(PmError::Ipc("CREDS frame decoded as another kind".into()));
        };
        let requested = creds
            .creds
            .iter()
            .find_map(|c| c.flags())
            .unwrap_or(IpcFlags::NONE);

        let timeout = self.config.request_timeout;
        let provider = self.provider.clone();
        let pairing = self.registry.get_mut(slot).ok_or(PmError::Eof)?;
        let peer = ClientPeer {
            local:    pairing.client.is_trust_anchored(),
            loopback: pairing.client.is_loopback(),
        };
        let flags = self.config.leg_flags(requested, pairing.server_features, peer)?;

        if flags.is_empty() {
            pairing.client_leg = LegState::Ready;
        } else {
            let mut negotiator = Negotiator::new(provider.clone()).with_timeout(timeout);
            let outcome = negotiator.server_handshake(&mut pairing.client, flags, &mut pairing.attrs);
            pairing.client_leg = negotiator.state();
            outcome?;
        }

        let upstream = pairing.upstream.as_mut().ok_or(PmError::Eof)?;
        upstream.send_pdu(&frame)?;

        if flags.is_empty() {
            pairing.upstream_leg = LegState::Ready;
        } else {
            if pairing.attrs.secret.is_none() {
                if let Some(user) = pairing.attrs.username.as_deref() {
                    pairing.attrs.secret = provider.users().secret(user).map(str::to_string);
                }
            }
            let target = UpstreamTarget {
                host: pairing.upstream_host.clone().unwrap_or_default(),
                port: pairing.upstream_port,
            };
            let mut negotiator = Negotiator::new(provider).with_timeout(timeout);
            let outcome = negotiator.client_handshake(
                upstream,
                flags | IpcFlags::NO_NSS_INIT,
                target.server_name(),
                &pairing.attrs,
            );
            pairing.upstream_leg = negotiator.state();
            outcome?;
        }

        pairing.start_relaying()?;
        tracing::info!(
            "✓ Relaying {} <-> {}:{} (flags {:?})",
            pairing.client.peer(),
            pairing.upstream_host.as_deref().unwrap_or("?"),
            pairing.upstream_port,
            flags
        );
        Ok(())
    }

    fn teardown(&mut self, slot: usize, leg: Leg, err: PmError) {
        let side = match leg {
            Leg::Client => "client",
            Leg::Upstream => "upstream",
        };
        if err.is_disconnect() {
            tracing::debug!("Pairing {} closed by {}", slot, side);
        } else {
            tracing::warn!("Closing pairing {} after {} error: {}", slot, side, err);
            if let Some(pairing) = self.registry.get_mut(slot) {
                if !pairing.is_relaying() {
                    // best effort; the client may already be gone
                    let reply = Pdu::error(err.code()).encode(std::process::id() as i32);
                    let _ = pairing.client.send_pdu(&reply);
                }
            }
        }
        self.registry.release(slot);
    }
}

impl Drop for RelayEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
