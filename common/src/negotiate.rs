//! Per-leg security handshake: an optional encryption upgrade followed by
//! an optional credential exchange carried in CREDS PDUs.

use std::{fmt, time::Duration};

use bytes::Bytes;
use rustls::pki_types::ServerName;

use crate::{
    auth::{encode_mechanisms, Attributes, ClientExchange, ServerExchange, Step},
    config,
    error::{PmError, PM_ERR_PERMISSION},
    pdu::{AuthStep, Credential, CredsPdu, IpcFlags, Pdu, SizeLimit},
    security::SecurityProvider,
    transport::Transport,
};

/// Where one leg of a connection is in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegState {
    Plain,
    EncryptUpgrading,
    EncryptReady,
    AuthExchanging,
    Ready,
    /// Terminal; carries the error code that ended the handshake
    Failed(i32),
}

impl LegState {
    pub fn is_ready(self) -> bool {
        self == LegState::Ready
    }
}

impl fmt::Display for LegState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegState::Plain => f.write_str("plain"),
            LegState::EncryptUpgrading => f.write_str("encrypt-upgrading"),
            LegState::EncryptReady => f.write_str("encrypt-ready"),
            LegState::AuthExchanging => f.write_str("auth-exchanging"),
            LegState::Ready => f.write_str("ready"),
            LegState::Failed(code) => write!(f, "failed({code})"),
        }
    }
}

/// Runs the handshake for one leg. A negotiator is single-use: once it
/// reaches `Ready` or `Failed` it stays there.
pub struct Negotiator {
    provider:       SecurityProvider,
    timeout:        Option<Duration>,
    origin:         i32,
    state:          LegState,
    exchange_steps: usize,
}

impl Negotiator {
    pub fn new(provider: SecurityProvider) -> Self {
        Self {
            provider,
            timeout: config::request_timeout(),
            origin: std::process::id() as i32,
            state: LegState::Plain,
            exchange_steps: 0,
        }
    }

    /// Bound on each receive. `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn state(&self) -> LegState {
        self.state
    }

    /// Credential-exchange PDUs sent or received so far.
    pub fn exchange_steps(&self) -> usize {
        self.exchange_steps
    }

    fn enter(&mut self, next: LegState) {
        tracing::trace!("leg state {} -> {}", self.state, next);
        self.state = next;
    }

    fn conclude<T>(&mut self, result: Result<T, PmError>) -> Result<T, PmError> {
        match &result {
            Ok(_) => self.enter(LegState::Ready),
            Err(e) => self.enter(LegState::Failed(e.code())),
        }
        result
    }

    /// Accepting side. Returns the effective flags, which may have gained
    /// `AUTH` when the peer demanded credentials.
    pub fn server_handshake(
        &mut self,
        transport: &mut Transport,
        flags: IpcFlags,
        attrs: &mut Attributes,
    ) -> Result<IpcFlags, PmError> {
        let result = self.run_server(transport, flags, attrs);
        self.conclude(result)
    }

    /// Connecting side. `server_name` is checked against the peer's
    /// certificate when encrypting.
    pub fn client_handshake(
        &mut self,
        transport: &mut Transport,
        flags: IpcFlags,
        server_name: &str,
        attrs: &Attributes,
    ) -> Result<(), PmError> {
        let result = self.run_client(transport, flags, server_name, attrs);
        self.conclude(result)
    }

    fn run_server(
        &mut self,
        transport: &mut Transport,
        mut flags: IpcFlags,
        attrs: &mut Attributes,
    ) -> Result<IpcFlags, PmError> {
        let unknown = flags.outside(IpcFlags::SERVER_ACCEPTED);
        if !unknown.is_empty() {
            return Err(PmError::Ipc(format!(
                "unsupported connection flags {:#x}",
                unknown.bits()
            )));
        }
        if flags.contains(IpcFlags::COMPRESS) {
            return Err(PmError::Unsupported("compression"));
        }

        let anchored = transport.is_trust_anchored();
        if anchored {
            if let Some(socket) = transport.socket() {
                match socket.get_peer_credentials() {
                    Ok(creds) => attrs.set_peer(&creds),
                    Err(e) => tracing::debug!("no peer credentials for {}: {}", transport.peer(), e),
                }
            }
        }

        if flags.contains(IpcFlags::CREDS_REQD) {
            if anchored {
                tracing::debug!("{} is trust-anchored, credentials waived", transport.peer());
                return Ok(flags);
            }
            flags.insert(IpcFlags::AUTH);
        }

        let mut cert_required = flags.contains(IpcFlags::CERT_REQD);
        if cert_required && anchored {
            cert_required = false;
        }
        if cert_required && !flags.contains(IpcFlags::SECURE) {
            return Err(PmError::NeedClientCert);
        }

        if flags.contains(IpcFlags::SECURE) {
            let config = self.prepare(flags).and_then(|_| self.provider.server_config(cert_required));
            if flags.contains(IpcFlags::SECURE_ACK) {
                let status = config.as_ref().map_or_else(PmError::code, |_| 0);
                transport.send_pdu(&Pdu::error(status).encode(self.origin))?;
            }
            self.enter(LegState::EncryptUpgrading);
            let strength = transport.upgrade_server(config?, self.timeout)?;
            if cert_required && !transport.security().has_peer_certificate() {
                return Err(PmError::NeedClientCert);
            }
            if let Some(fingerprint) = transport.security().peer_fingerprint() {
                tracing::info!("Peer certificate {} on {}", fingerprint, transport.peer());
            }
            tracing::debug!("✓ Encrypted {} ({} bits)", transport.peer(), strength);
            self.enter(LegState::EncryptReady);
        }

        if flags.contains(IpcFlags::AUTH) {
            self.enter(LegState::AuthExchanging);
            self.server_exchange(transport, attrs)?;
        }
        Ok(flags)
    }

    fn server_exchange(
        &mut self,
        transport: &mut Transport,
        attrs: &mut Attributes,
    ) -> Result<(), PmError> {
        let offered = self.provider.mechanisms();
        self.send_exchange(transport, AuthStep::Mechanisms, encode_mechanisms(&offered))?;
        let start = self.recv_exchange(transport, AuthStep::Start)?;

        let provider = self.provider.clone();
        let verdict = ServerExchange::start(provider.users(), &offered, &start).and_then(
            |(mut exchange, mut step)| {
                while let Step::Continue(challenge) = step {
                    self.send_exchange(transport, AuthStep::Step, challenge)?;
                    let response = self.recv_exchange(transport, AuthStep::Step)?;
                    step = exchange.step(&response)?;
                }
                exchange
                    .finish()
                    .ok_or_else(|| PmError::AuthExchange("exchange ended unverified".into()))
            },
        );

        match verdict {
            Ok(session) => {
                transport.send_pdu(&Pdu::error(0).encode(self.origin))?;
                tracing::info!(
                    "✓ {} authenticated as {} via {}",
                    transport.peer(),
                    session.username(),
                    session.mechanism()
                );
                attrs.username = Some(session.username().to_string());
                attrs.method = Some(session.mechanism().name().to_string());
                transport.attach_auth(session);
                Ok(())
            }
            Err(PmError::AuthExchange(reason)) => {
                tracing::warn!("Credential exchange with {} failed: {}", transport.peer(), reason);
                let status = Pdu::error(PM_ERR_PERMISSION).encode(self.origin);
                if let Err(e) = transport.send_pdu(&status) {
                    tracing::debug!("failure status not delivered: {}", e);
                }
                Err(PmError::Permission)
            }
            Err(e) => Err(e),
        }
    }

    fn run_client(
        &mut self,
        transport: &mut Transport,
        mut flags: IpcFlags,
        server_name: &str,
        attrs: &Attributes,
    ) -> Result<(), PmError> {
        if flags.contains(IpcFlags::COMPRESS) {
            return Err(PmError::Unsupported("compression"));
        }

        // mirror the accepting side's view of a trust-anchored transport
        let anchored = transport.is_trust_anchored();
        if flags.contains(IpcFlags::CREDS_REQD) {
            if anchored {
                return Ok(());
            }
            flags.insert(IpcFlags::AUTH);
        }

        if flags.contains(IpcFlags::SECURE) {
            self.prepare(flags)?;
            let cert_required = flags.contains(IpcFlags::CERT_REQD) && !anchored;
            let config = self.provider.client_config(cert_required)?;
            if flags.contains(IpcFlags::SECURE_ACK) {
                match self.recv(transport)? {
                    Pdu::Error(status) if status.code == 0 => {}
                    Pdu::Error(status) => return Err(PmError::from_code(status.code)),
                    other => {
                        return Err(PmError::Ipc(format!(
                            "expected secure-ack status, got {}",
                            other.kind()
                        )))
                    }
                }
            }
            self.enter(LegState::EncryptUpgrading);
            let name = ServerName::try_from(server_name.to_string())
                .map_err(|e| PmError::SecureChannel(format!("bad server name {server_name:?}: {e}")))?;
            let strength = transport.upgrade_client(config, name, self.timeout)?;
            tracing::debug!("✓ Encrypted {} ({} bits)", transport.peer(), strength);
            self.enter(LegState::EncryptReady);
        }

        if flags.contains(IpcFlags::AUTH) {
            self.enter(LegState::AuthExchanging);
            self.client_exchange(transport, attrs)?;
        }
        Ok(())
    }

    fn client_exchange(&mut self, transport: &mut Transport, attrs: &Attributes) -> Result<(), PmError> {
        let offer = self.recv_exchange(transport, AuthStep::Mechanisms)?;
        let exchange = ClientExchange::choose(&offer, attrs)?;
        tracing::debug!("authenticating to {} via {}", transport.peer(), exchange.mechanism());
        self.send_exchange(transport, AuthStep::Start, exchange.initial())?;

        loop {
            match self.recv(transport)? {
                Pdu::Error(status) if status.code == 0 => break,
                Pdu::Error(status) => return Err(PmError::from_code(status.code)),
                Pdu::Creds(creds) if has_step(&creds, AuthStep::Step) => {
                    self.exchange_steps += 1;
                    let response = exchange.respond(&creds.payload)?;
                    self.send_exchange(transport, AuthStep::Step, response)?;
                }
                other => {
                    return Err(PmError::Ipc(format!(
                        "unexpected {} during credential exchange",
                        other.kind()
                    )))
                }
            }
        }
        transport.attach_auth(exchange.session());
        Ok(())
    }

    /// Bring the provider up unless the caller already has.
    fn prepare(&self, flags: IpcFlags) -> Result<(), PmError> {
        if !flags.contains(IpcFlags::NO_NSS_INIT) {
            self.provider.initialize()?;
        }
        Ok(())
    }

    fn recv(&mut self, transport: &mut Transport) -> Result<Pdu, PmError> {
        let frame = transport.recv_pdu(SizeLimit::default(), self.timeout)?;
        Ok(Pdu::decode(&frame)?)
    }

    fn recv_exchange(&mut self, transport: &mut Transport, expected: AuthStep) -> Result<Bytes, PmError> {
        match self.recv(transport)? {
            Pdu::Creds(creds) if has_step(&creds, expected) => {
                self.exchange_steps += 1;
                Ok(creds.payload)
            }
            Pdu::Error(status) if status.code < 0 => Err(PmError::from_code(status.code)),
            other => Err(PmError::Ipc(format!(
                "expected {:?} credentials, got {}",
                expected,
                other.kind()
            ))),
        }
    }

    fn send_exchange(
        &mut self,
        transport: &mut Transport,
        step: AuthStep,
        payload: Vec<u8>,
    ) -> Result<(), PmError> {
        let pdu = Pdu::Creds(CredsPdu {
            creds:   vec![Credential::auth(step)],
            payload: Bytes::from(payload),
        });
        transport.send_pdu(&pdu.encode(self.origin))?;
        self.exchange_steps += 1;
        Ok(())
    }
}

fn has_step(creds: &CredsPdu, step: AuthStep) -> bool {
    creds.creds.iter().any(|c| c.auth_step() == Some(step))
}
