use std::{
    io::{self, Read, Write},
    sync::Arc,
    time::{Duration, Instant},
};

use rustls::{pki_types::ServerName, ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use sha2::{Digest, Sha256};

use crate::{
    error::PmError,
    platform_socket::{poll_readable, PlatformSocket},
};

/// Strength reported when the negotiated suite does not reveal its key size.
pub const DEFAULT_SECURITY_STRENGTH: u32 = 0;

/// Synchronous TLS session layered over a socket owned by someone else.
///
/// Would-block conditions from the socket are retried here and never
/// reach the caller.
pub struct TlsChannel {
    tls: Connection,
}

impl TlsChannel {
    /// Run the server side of the handshake on `socket`. Each wait for the
    /// peer is bounded by `timeout`.
    pub fn accept(
        socket: &mut PlatformSocket,
        config: Arc<ServerConfig>,
        timeout: Option<Duration>,
    ) -> Result<Self, PmError> {
        let conn = ServerConnection::new(config)?;
        let mut channel = Self {
            tls: Connection::Server(conn),
        };
        channel.complete_handshake(socket, timeout)?;
        Ok(channel)
    }

    /// Run the client side of the handshake on `socket`.
    pub fn connect(
        socket: &mut PlatformSocket,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
        timeout: Option<Duration>,
    ) -> Result<Self, PmError> {
        let conn = ClientConnection::new(config, server_name)?;
        let mut channel = Self {
            tls: Connection::Client(conn),
        };
        channel.complete_handshake(socket, timeout)?;
        Ok(channel)
    }

    /// Complete the TLS handshake
    fn complete_handshake(
        &mut self,
        socket: &mut PlatformSocket,
        timeout: Option<Duration>,
    ) -> Result<(), PmError> {
        while self.tls.is_handshaking() {
            if self.tls.wants_write() {
                self.write_pending(socket)?;
            }
            if self.tls.wants_read() {
                wait_readable(socket, timeout)?;
                if self.read_socket(socket)? == 0 {
                    return Err(PmError::SecureChannel(
                        "peer closed connection during TLS handshake".to_string(),
                    ));
                }
                if let Err(e) = self.tls.process_new_packets() {
                    // let the peer see our alert before we give up
                    let _ = self.write_pending(socket);
                    return Err(e.into());
                }
            }
        }
        // a client may still hold its final flight
        self.write_pending(socket)?;
        Ok(())
    }

    fn read_socket(&mut self, socket: &mut PlatformSocket) -> Result<usize, PmError> {
        loop {
            match self.tls.read_tls(socket) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => wait_readable(socket, None)?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write_pending(&mut self, socket: &mut PlatformSocket) -> Result<(), PmError> {
        while self.tls.wants_write() {
            match self.tls.write_tls(socket) {
                Ok(_) => {}
                Err(e) if is_retry(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Read decrypted bytes. Returns 0 once the peer has closed.
    pub fn read(&mut self, socket: &mut PlatformSocket, buf: &mut [u8]) -> Result<usize, PmError> {
        loop {
            match self.tls.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(e.into()),
            }

            if self.read_socket(socket)? == 0 {
                return Ok(0);
            }
            if let Err(e) = self.tls.process_new_packets() {
                let _ = self.write_pending(socket);
                return Err(e.into());
            }
        }
    }

    /// Encrypt and send all of `buf`. rustls caps how much plaintext it
    /// queues, so large buffers go out in several flushes.
    pub fn write(&mut self, socket: &mut PlatformSocket, buf: &[u8]) -> Result<usize, PmError> {
        let mut sent = 0;
        while sent < buf.len() {
            let n = self.tls.writer().write(&buf[sent..])?;
            self.write_pending(socket)?;
            if n == 0 && !self.tls.wants_write() {
                return Err(PmError::SecureChannel("TLS session refused more data".to_string()));
            }
            sent += n;
        }
        Ok(sent)
    }

    /// True when decrypted bytes are already waiting, so the socket itself
    /// may never become readable for them.
    pub fn has_buffered_plaintext(&mut self) -> bool {
        match self.tls.process_new_packets() {
            Ok(state) => state.plaintext_bytes_to_read() > 0,
            Err(_) => true, // surface the error on the next read
        }
    }

    /// Send close_notify, best effort.
    pub fn close(&mut self, socket: &mut PlatformSocket) {
        self.tls.send_close_notify();
        if let Err(e) = self.write_pending(socket) {
            tracing::debug!("close_notify not delivered: {}", e);
        }
    }

    /// Symmetric key size of the negotiated suite, in bits.
    pub fn strength(&self) -> u32 {
        match self.cipher_name() {
            Some(name) if name.contains("256") || name.contains("CHACHA20") => 256,
            Some(name) if name.contains("128") => 128,
            _ => DEFAULT_SECURITY_STRENGTH,
        }
    }

    pub fn cipher_name(&self) -> Option<String> {
        self.tls
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite()))
    }

    pub fn has_peer_certificate(&self) -> bool {
        self.tls
            .peer_certificates()
            .is_some_and(|certs| !certs.is_empty())
    }

    /// SHA-256 of the peer's leaf certificate, hex encoded.
    pub fn peer_fingerprint(&self) -> Option<String> {
        let certs = self.tls.peer_certificates()?;
        let leaf = certs.first()?;
        Some(hex::encode(Sha256::digest(leaf.as_ref())))
    }
}

fn wait_readable(socket: &PlatformSocket, timeout: Option<Duration>) -> Result<(), PmError> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let left = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        if left == Some(Duration::ZERO) {
            return Err(PmError::Timeout);
        }
        if poll_readable(&[socket], left)?[0] {
            return Ok(());
        }
    }
}

fn is_retry(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
