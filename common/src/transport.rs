//! Byte-stream connection that transparently routes through an attached
//! security context.

use std::{
    os::fd::{AsRawFd, RawFd},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use rustls::pki_types::ServerName;

use crate::{
    auth::AuthSession,
    error::PmError,
    pdu::{PduFrame, PduHeader, SizeLimit, HEADER_LEN},
    platform_socket::{poll_readable, PlatformSocket},
    tls_stream::TlsChannel,
};

/// Security state of one connection. Never shared between connections.
#[derive(Default)]
pub struct SecurityContext {
    tls:      Option<TlsChannel>,
    auth:     Option<AuthSession>,
    strength: Option<u32>,
}

impl SecurityContext {
    pub fn is_encrypted(&self) -> bool {
        self.tls.is_some()
    }

    pub fn auth(&self) -> Option<&AuthSession> {
        self.auth.as_ref()
    }

    /// Negotiated key strength in bits, once encrypted.
    pub fn strength(&self) -> Option<u32> {
        self.strength
    }

    pub fn cipher_name(&self) -> Option<String> {
        self.tls.as_ref().and_then(TlsChannel::cipher_name)
    }

    pub fn has_peer_certificate(&self) -> bool {
        self.tls.as_ref().is_some_and(TlsChannel::has_peer_certificate)
    }

    pub fn peer_fingerprint(&self) -> Option<String> {
        self.tls.as_ref().and_then(TlsChannel::peer_fingerprint)
    }
}

/// A connected socket plus its optional security context.
pub struct Transport {
    socket:   Option<PlatformSocket>,
    security: SecurityContext,
    peer:     String,
}

impl Transport {
    pub fn new(socket: PlatformSocket) -> Self {
        let peer = socket.peer_description();
        Self {
            socket: Some(socket),
            security: SecurityContext::default(),
            peer,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    pub fn socket(&self) -> Option<&PlatformSocket> {
        self.socket.as_ref()
    }

    /// Kernel-vouched peer identity (local-domain socket).
    pub fn is_trust_anchored(&self) -> bool {
        self.socket.as_ref().is_some_and(PlatformSocket::is_local_domain)
    }

    pub fn is_loopback(&self) -> bool {
        self.socket.as_ref().is_some_and(PlatformSocket::is_loopback)
    }

    pub fn security(&self) -> &SecurityContext {
        &self.security
    }

    fn socket_mut(&mut self) -> Result<&mut PlatformSocket, PmError> {
        self.socket.as_mut().ok_or(PmError::Eof)
    }

    /// Run the server side of a TLS upgrade and attach the result.
    pub fn upgrade_server(
        &mut self,
        config: Arc<rustls::ServerConfig>,
        timeout: Option<Duration>,
    ) -> Result<u32, PmError> {
        let socket = self.socket.as_mut().ok_or(PmError::Eof)?;
        let channel = TlsChannel::accept(socket, config, timeout)?;
        Ok(self.attach_tls(channel))
    }

    /// Run the client side of a TLS upgrade and attach the result.
    pub fn upgrade_client(
        &mut self,
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
        timeout: Option<Duration>,
    ) -> Result<u32, PmError> {
        let socket = self.socket.as_mut().ok_or(PmError::Eof)?;
        let channel = TlsChannel::connect(socket, config, server_name, timeout)?;
        Ok(self.attach_tls(channel))
    }

    fn attach_tls(&mut self, channel: TlsChannel) -> u32 {
        let strength = channel.strength();
        tracing::debug!(
            "secure channel to {} using {} ({} bits)",
            self.peer,
            channel.cipher_name().unwrap_or_else(|| "unknown suite".to_string()),
            strength
        );
        self.security.tls = Some(channel);
        self.security.strength = Some(strength);
        strength
    }

    /// Record a completed credential exchange.
    pub fn attach_auth(&mut self, session: AuthSession) {
        self.security.auth = Some(session);
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, PmError> {
        let socket = self.socket.as_mut().ok_or(PmError::Eof)?;
        match self.security.tls.as_mut() {
            Some(tls) => tls.read(socket, buf),
            None => loop {
                match std::io::Read::read(socket, buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            },
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, PmError> {
        let socket = self.socket.as_mut().ok_or(PmError::Eof)?;
        match self.security.tls.as_mut() {
            Some(tls) => tls.write(socket, buf),
            None => loop {
                match std::io::Write::write(socket, buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            },
        }
    }

    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<(), PmError> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(PmError::Eof);
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// True when decrypted input is already buffered above the socket.
    pub fn has_buffered_input(&mut self) -> bool {
        self.security
            .tls
            .as_mut()
            .is_some_and(TlsChannel::has_buffered_plaintext)
    }

    /// Whether a read would make progress within `timeout`. `None` waits
    /// indefinitely.
    pub fn ready(&mut self, timeout: Option<Duration>) -> Result<bool, PmError> {
        if self.has_buffered_input() {
            return Ok(true);
        }
        let socket = self.socket_mut()?;
        Ok(poll_readable(&[&*socket], timeout)?[0])
    }

    fn wait(&mut self, deadline: Option<Instant>) -> Result<(), PmError> {
        loop {
            let left = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if left == Some(Duration::ZERO) && !self.has_buffered_input() {
                return Err(PmError::Timeout);
            }
            if self.ready(left)? {
                return Ok(());
            }
        }
    }

    fn read_full(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> Result<(), PmError> {
        let mut filled = 0;
        while filled < buf.len() {
            self.wait(deadline)?;
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(PmError::Eof);
            }
            filled += n;
        }
        Ok(())
    }

    /// Receive one frame. Header problems are reported before the body is
    /// read; an oversized announcement is refused without reading it.
    pub fn recv_pdu(
        &mut self,
        limit: SizeLimit,
        timeout: Option<Duration>,
    ) -> Result<PduFrame, PmError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut header = [0u8; HEADER_LEN];
        self.read_full(&mut header, deadline)?;
        let parsed = PduHeader::parse(&header)?;
        let len = parsed.length as usize;
        if !limit.permits(len) {
            let max = match limit {
                SizeLimit::Limit(max) => max,
                SizeLimit::Any => usize::MAX,
            };
            return Err(PmError::TooBig { len, limit: max });
        }

        let mut buf = BytesMut::zeroed(len);
        buf[..HEADER_LEN].copy_from_slice(&header);
        self.read_full(&mut buf[HEADER_LEN..], deadline)?;
        let frame = PduFrame::parse(buf.freeze())?;
        tracing::trace!("recv {} ({} bytes) from {}", frame.pdu_type(), len, self.peer);
        Ok(frame)
    }

    pub fn send_pdu(&mut self, frame: &PduFrame) -> Result<(), PmError> {
        tracing::trace!(
            "send {} ({} bytes) to {}",
            frame.pdu_type(),
            frame.length(),
            self.peer
        );
        self.write_all(frame.as_bytes())
    }

    /// Read one plaintext line, a byte at a time so nothing past the
    /// newline is consumed. A trailing carriage return is dropped.
    pub fn read_line(&mut self, max: usize, timeout: Option<Duration>) -> Result<String, PmError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut line = Vec::with_capacity(32);
        loop {
            let mut byte = [0u8; 1];
            self.read_full(&mut byte, deadline)?;
            if byte[0] == b'\n' {
                break;
            }
            if line.len() + 1 >= max {
                return Err(PmError::Ipc(format!("preamble line exceeds {max} bytes")));
            }
            line.push(byte[0]);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line).map_err(|_| PmError::Ipc("preamble line is not UTF-8".to_string()))
    }

    /// Release security resources, then the descriptor. Safe to call more
    /// than once.
    pub fn close(&mut self) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        if let Some(mut tls) = self.security.tls.take() {
            tls.close(&mut socket);
            tracing::debug!("detached secure channel from {}", self.peer);
        }
        if let Some(auth) = self.security.auth.take() {
            tracing::debug!("released {} session for {}", auth.mechanism(), self.peer);
        }
        self.security.strength = None;
        drop(socket);
        tracing::debug!("closed connection to {}", self.peer);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::pdu::{Pdu, PduType, Text};

    fn pair() -> (Transport, Transport) {
        let (a, b) = UnixStream::pair().unwrap();
        (
            Transport::new(PlatformSocket::Unix(a)),
            Transport::new(PlatformSocket::Unix(b)),
        )
    }

    #[test]
    fn frames_cross_a_plain_connection() {
        let (mut a, mut b) = pair();
        let frame = Pdu::Text(Text {
            ident:  7,
            buffer: "help text".to_string(),
        })
        .encode(99);
        a.send_pdu(&frame).unwrap();
        let got = b.recv_pdu(SizeLimit::Any, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(got, frame);
        assert_eq!(got.origin(), 99);
    }

    #[test]
    fn idle_peer_times_out() {
        let (_a, mut b) = pair();
        let err = b
            .recv_pdu(SizeLimit::Any, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, PmError::Timeout));
    }

    #[test]
    fn oversized_frame_is_refused_from_header() {
        let (mut a, mut b) = pair();
        let frame = PduFrame::new(PduType::Text, 0, &vec![0u8; 128]);
        a.send_pdu(&frame).unwrap();
        let err = b
            .recv_pdu(SizeLimit::Limit(64), Some(Duration::from_secs(2)))
            .unwrap_err();
        assert!(matches!(err, PmError::TooBig { limit: 64, .. }));
    }

    #[test]
    fn unknown_type_is_a_decode_error() {
        let (mut a, mut b) = pair();
        let mut raw = PduFrame::new(PduType::Text, 0, &[]).into_bytes().to_vec();
        raw[7] = 0x0b;
        a.write_all(&raw).unwrap();
        let err = b.recv_pdu(SizeLimit::Any, Some(Duration::from_secs(2))).unwrap_err();
        assert_eq!(err.code(), crate::error::PM_ERR_IPC);
    }

    #[test]
    fn peer_close_is_eof() {
        let (a, mut b) = pair();
        drop(a);
        let err = b.recv_pdu(SizeLimit::Any, None).unwrap_err();
        assert!(matches!(err, PmError::Eof));
    }

    #[test]
    fn read_line_stops_at_newline() {
        let (mut a, mut b) = pair();
        a.write_all(b"pmproxy-client 1\r\nrest").unwrap();
        let line = b.read_line(64, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(line, "pmproxy-client 1");
        let mut rest = [0u8; 4];
        b.read_full(&mut rest, None).unwrap();
        assert_eq!(&rest, b"rest");
    }

    #[test]
    fn overlong_line_is_rejected() {
        let (mut a, mut b) = pair();
        a.write_all(&[b'x'; 32]).unwrap();
        assert!(matches!(
            b.read_line(16, Some(Duration::from_secs(1))),
            Err(PmError::Ipc(_))
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let (mut a, _b) = pair();
        assert!(a.raw_fd().is_some());
        a.close();
        a.close();
        assert!(a.is_closed());
        assert!(matches!(a.write(b"x"), Err(PmError::Eof)));
        assert!(matches!(
            a.send_pdu(&PduFrame::new(PduType::Error, 0, &[0; 4])),
            Err(PmError::Eof)
        ));
    }

    #[test]
    fn ready_reports_pending_input() {
        let (mut a, mut b) = pair();
        assert!(!b.ready(Some(Duration::from_millis(5))).unwrap());
        a.write_all(b"x").unwrap();
        assert!(b.ready(Some(Duration::from_secs(1))).unwrap());
        assert!(a.is_trust_anchored());
    }
}
