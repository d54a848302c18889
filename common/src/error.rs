use std::io;

use crate::pdu::DecodeError;

/// Base of the shared protocol error space. Every code is the negation of a
/// value at or above this base.
pub const PM_ERR_BASE: i32 = 12345;

pub const PM_ERR_GENERIC: i32 = -PM_ERR_BASE;
pub const PM_ERR_TIMEOUT: i32 = -PM_ERR_BASE - 8;
pub const PM_ERR_IPC: i32 = -PM_ERR_BASE - 21;
pub const PM_ERR_EOF: i32 = -PM_ERR_BASE - 23;
pub const PM_ERR_PERMISSION: i32 = -PM_ERR_BASE - 42;
pub const PM_ERR_NEEDCLIENTCERT: i32 = -PM_ERR_BASE - 66;
pub const PM_ERR_TOOBIG: i32 = -PM_ERR_BASE - 99;
pub const PM_ERR_NYI: i32 = -PM_ERR_BASE - 8999;

/// Encrypted-channel and credential-exchange library failures sit below the
/// not-yet-implemented sentinel so they never collide with protocol codes.
pub const PM_ERR_SECURE_CHANNEL: i32 = PM_ERR_NYI - 1;
pub const PM_ERR_AUTH_EXCHANGE: i32 = PM_ERR_NYI - 2;

/// Errors surfaced by the codec, transport and negotiation layers.
///
/// Each variant maps onto a single negative code via [`PmError::code`], which
/// is also what travels inside ERROR PDUs.
#[derive(Debug, thiserror::Error)]
pub enum PmError {
    #[error("generic protocol failure")]
    Generic,

    #[error("IPC protocol failure: {0}")]
    Ipc(String),

    #[error("timeout waiting for a response from peer")]
    Timeout,

    #[error("IPC channel closed")]
    Eof,

    #[error("no permission to perform requested operation")]
    Permission,

    #[error("PDU too big ({len} bytes, limit {limit})")]
    TooBig { len: usize, limit: usize },

    #[error("client certificate required")]
    NeedClientCert,

    #[error("functionality not yet implemented")]
    NotImplemented,

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("malformed PDU: {0}")]
    Decode(#[from] DecodeError),

    #[error("secure channel failure: {0}")]
    SecureChannel(String),

    #[error("credential exchange failed: {0}")]
    AuthExchange(String),

    #[error("OS error {errno}: {message}")]
    Os { errno: i32, message: String },

    #[error("peer reported error code {0}")]
    Remote(i32),
}

impl PmError {
    /// Returns the negative code for this error in the shared error space.
    pub fn code(&self) -> i32 {
        match self {
            PmError::Generic => PM_ERR_GENERIC,
            PmError::Ipc(_) | PmError::Decode(_) => PM_ERR_IPC,
            PmError::Timeout => PM_ERR_TIMEOUT,
            PmError::Eof => PM_ERR_EOF,
            PmError::Permission => PM_ERR_PERMISSION,
            PmError::TooBig { .. } => PM_ERR_TOOBIG,
            PmError::NeedClientCert => PM_ERR_NEEDCLIENTCERT,
            PmError::NotImplemented => PM_ERR_NYI,
            PmError::Unsupported(_) => -libc::EOPNOTSUPP,
            PmError::SecureChannel(_) => PM_ERR_SECURE_CHANNEL,
            PmError::AuthExchange(_) => PM_ERR_AUTH_EXCHANGE,
            PmError::Os { errno, .. } => -errno,
            PmError::Remote(code) => *code,
        }
    }

    /// Rebuilds an error from a code received from a peer.
    pub fn from_code(code: i32) -> Self {
        match code {
            PM_ERR_GENERIC => PmError::Generic,
            PM_ERR_IPC => PmError::Ipc("reported by peer".to_string()),
            PM_ERR_TIMEOUT => PmError::Timeout,
            PM_ERR_EOF => PmError::Eof,
            PM_ERR_PERMISSION => PmError::Permission,
            PM_ERR_NEEDCLIENTCERT => PmError::NeedClientCert,
            PM_ERR_NYI => PmError::NotImplemented,
            other => PmError::Remote(other),
        }
    }

    /// True for errors that simply mean the peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            PmError::Eof => true,
            PmError::Os { errno, .. } => {
                *errno == libc::ECONNRESET || *errno == libc::EPIPE || *errno == libc::ENOTCONN
            }
            _ => false,
        }
    }
}

impl From<io::Error> for PmError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => PmError::Eof,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => PmError::Timeout,
            _ => {
                let errno = err.raw_os_error().unwrap_or(libc::EIO);
                PmError::Os {
                    errno,
                    message: err.to_string(),
                }
            }
        }
    }
}

impl From<rustls::Error> for PmError {
    fn from(err: rustls::Error) -> Self {
        match err {
            rustls::Error::NoCertificatesPresented
            | rustls::Error::AlertReceived(rustls::AlertDescription::CertificateRequired) => {
                PmError::NeedClientCert
            }
            other => PmError::SecureChannel(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_stable() {
        assert_eq!(PmError::Ipc(String::new()).code(), -12366);
        assert_eq!(PmError::Timeout.code(), -12353);
        assert_eq!(PmError::Eof.code(), -12368);
        assert_eq!(PmError::Permission.code(), -12387);
        assert_eq!(PmError::TooBig { len: 1, limit: 0 }.code(), -12444);
        assert_eq!(PmError::NotImplemented.code(), -21344);
        assert!(PmError::SecureChannel("x".into()).code() < PM_ERR_NYI);
    }

    #[test]
    fn from_code_round_trips_known_kinds() {
        for err in [
            PmError::Timeout,
            PmError::Eof,
            PmError::Permission,
            PmError::NeedClientCert,
            PmError::Generic,
        ] {
            assert_eq!(PmError::from_code(err.code()).code(), err.code());
        }
        assert!(matches!(PmError::from_code(-4242), PmError::Remote(-4242)));
    }

    #[test]
    fn os_errors_map_into_shared_space() {
        let reset = io::Error::from_raw_os_error(libc::ECONNRESET);
        let err = PmError::from(reset);
        assert_eq!(err.code(), -libc::ECONNRESET);
        assert!(err.is_disconnect());

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(matches!(PmError::from(timed_out), PmError::Timeout));
    }
}
