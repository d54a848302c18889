//! Live client connections and their paired upstream connections.

use std::os::fd::{AsRawFd, RawFd};

use pmrelay_common::{
    auth::Attributes, error::PmError, negotiate::LegState, pdu::IpcFlags,
    platform_socket::PlatformSocket, transport::Transport,
};

/// Smallest table the registry allocates.
const MIN_SLOTS: usize = 8;

/// Which side of a pairing a descriptor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Client,
    Upstream,
}

/// Lifecycle of a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    /// Accepted; preamble not yet complete
    Created,
    /// Upstream connected; waiting for the client's first PDU
    Negotiating,
    /// Both legs verified; frames are forwarded verbatim
    Relaying,
    /// Both legs released
    Closed,
}

/// One client connection and the upstream connection opened for it.
pub struct ClientPairing {
    pub(crate) client:   Transport,
    pub(crate) upstream: Option<Transport>,
    state:               PairingState,
    pub client_leg:      LegState,
    pub upstream_leg:    LegState,
    pub upstream_host:   Option<String>,
    pub upstream_port:   u16,
    /// Features advertised by the upstream in its first ERROR PDU
    pub server_features: IpcFlags,
    pub attrs:           Attributes,
}

impl ClientPairing {
    fn new(client: Transport) -> Self {
        Self {
            client,
            upstream: None,
            state: PairingState::Created,
            client_leg: LegState::Plain,
            upstream_leg: LegState::Plain,
            upstream_host: None,
            upstream_port: 0,
            server_features: IpcFlags::NONE,
            attrs: Attributes::default(),
        }
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    pub fn client(&mut self) -> &mut Transport {
        &mut self.client
    }

    pub fn upstream(&mut self) -> Result<&mut Transport, PmError> {
        self.upstream.as_mut().ok_or(PmError::Eof)
    }

    pub fn client_fd(&self) -> Option<RawFd> {
        self.client.raw_fd()
    }

    pub fn upstream_fd(&self) -> Option<RawFd> {
        self.upstream.as_ref().and_then(Transport::raw_fd)
    }

    /// Created -> Negotiating, once the upstream leg exists.
    pub fn begin_negotiation(&mut self, upstream: Transport) -> Result<(), PmError> {
        if self.state != PairingState::Created {
            return Err(self.bad_transition(PairingState::Negotiating));
        }
        self.upstream = Some(upstream);
        self.state = PairingState::Negotiating;
        Ok(())
    }

    /// Negotiating -> Relaying, once both handshakes succeeded.
    pub fn start_relaying(&mut self) -> Result<(), PmError> {
        if self.state != PairingState::Negotiating {
            return Err(self.bad_transition(PairingState::Relaying));
        }
        self.state = PairingState::Relaying;
        Ok(())
    }

    pub fn is_relaying(&self) -> bool {
        self.state == PairingState::Relaying
    }

    /// Any -> Closed. Both legs go together.
    fn close(&mut self) {
        if let Some(mut upstream) = self.upstream.take() {
            upstream.close();
        }
        self.client.close();
        self.state = PairingState::Closed;
    }

    fn bad_transition(&self, to: PairingState) -> PmError {
        PmError::Ipc(format!("pairing cannot move from {:?} to {:?}", self.state, to))
    }
}

/// Growable table of pairings.
///
/// Slot numbers are only meaningful until the next mutation; callers look
/// pairings up again by descriptor instead of holding on to a slot.
#[derive(Default)]
pub struct ConnectionRegistry {
    slots: Vec<Option<ClientPairing>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a new pairing in the first free slot, doubling the table when
    /// none is free.
    pub fn allocate(&mut self, client: Transport) -> usize {
        let slot = match self.slots.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                let used = self.slots.len();
                let grown = (used * 2).max(MIN_SLOTS);
                self.slots.resize_with(grown, || None);
                tracing::debug!("registry grown to {} slots", grown);
                used
            }
        };
        self.slots[slot] = Some(ClientPairing::new(client));
        slot
    }

    /// Close both legs of the pairing in `slot` and empty the slot.
    pub fn release(&mut self, slot: usize) {
        if let Some(mut pairing) = self.slots.get_mut(slot).and_then(Option::take) {
            let peer = pairing.client.peer().to_string();
            pairing.close();
            tracing::debug!("released slot {} ({})", slot, peer);
        }
    }

    pub fn get(&self, slot: usize) -> Option<&ClientPairing> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut ClientPairing> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn find_by_descriptor(&self, fd: RawFd) -> Option<(usize, Leg)> {
        self.iter().find_map(|(slot, pairing)| {
            if pairing.client_fd() == Some(fd) {
                Some((slot, Leg::Client))
            } else if pairing.upstream_fd() == Some(fd) {
                Some((slot, Leg::Upstream))
            } else {
                None
            }
        })
    }

    /// Every open socket of every active pairing, client leg first.
    pub fn sockets(&self) -> impl Iterator<Item = &PlatformSocket> {
        self.iter().flat_map(|(_, pairing)| {
            let upstream = pairing.upstream.as_ref().and_then(Transport::socket);
            pairing.client.socket().into_iter().chain(upstream)
        })
    }

    /// Descriptors of [`ConnectionRegistry::sockets`], in the same order.
    pub fn descriptors(&self) -> Vec<RawFd> {
        self.sockets().map(AsRawFd::as_raw_fd).collect()
    }

    /// Descriptors whose TLS layer already holds decrypted input, which the
    /// socket itself will not report as readable.
    pub fn buffered_descriptors(&mut self) -> Vec<RawFd> {
        let mut fds = Vec::new();
        for pairing in self.slots.iter_mut().flatten() {
            if pairing.client.has_buffered_input() {
                fds.extend(pairing.client.raw_fd());
            }
            if let Some(upstream) = pairing.upstream.as_mut() {
                if upstream.has_buffered_input() {
                    fds.extend(upstream.raw_fd());
                }
            }
        }
        fds
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ClientPairing)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, pairing)| pairing.as_ref().map(|p| (slot, p)))
    }

    pub fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Release every pairing. Returns how many were open.
    pub fn release_all(&mut self) -> usize {
        let mut released = 0;
        for slot in 0..self.slots.len() {
            if self.slots[slot].is_some() {
                self.release(slot);
                released += 1;
            }
        }
        released
    }
}
