use std::{
    env,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// First line a client sends to the relay.
pub const CLIENT_VERSION_LINE: &str = "pmproxy-client 1";
/// The relay's answer to a good client version line.
pub const SERVER_VERSION_LINE: &str = "pmproxy-server 1\n";
/// Longest preamble line accepted, terminator included.
pub const PREAMBLE_LINE_MAX: usize = 256 + 10;

pub const PMCD_PORT_ENV: &str = "PMCD_PORT";
pub const PMPROXY_PORT_ENV: &str = "PMPROXY_PORT";
pub const CONNECT_TIMEOUT_ENV: &str = "PMCD_CONNECT_TIMEOUT";
pub const REQUEST_TIMEOUT_ENV: &str = "PMCD_REQUEST_TIMEOUT";
pub const MAX_PENDING_ENV: &str = "PMPROXY_MAXPENDING";
pub const LOCAL_ONLY_ENV: &str = "PMPROXY_LOCAL";

pub const DEFAULT_PMCD_PORT: u16 = 44321;
pub const DEFAULT_PMPROXY_PORT: u16 = 44322;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: f64 = 5.0;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: f64 = 10.0;
pub const DEFAULT_MAX_PENDING: i32 = 5;

const CERTS_DIR_ENV: &str = "PMRELAY_CERTS_DIR";
const DEFAULT_CERTS_DIR: &str = "certs";

const SERVER_CERTS_SUBDIR: &str = "relay";
const CLIENT_CERTS_SUBDIR: &str = "client";

fn get_certs_dir() -> PathBuf {
    let dir = env::var(CERTS_DIR_ENV).unwrap_or(DEFAULT_CERTS_DIR.to_string());
    PathBuf::from(dir)
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("Ignoring unparsable {}={:?}", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

/// Seconds to a wait bound. Zero, negative, or too large to represent
/// means wait forever.
pub fn timeout_from_secs(secs: f64) -> Option<Duration> {
    if secs <= 0.0 || secs.is_nan() {
        return None;
    }
    match Duration::try_from_secs_f64(secs) {
        Ok(timeout) => Some(timeout),
        Err(e) => {
            tracing::warn!("Timeout of {} seconds is out of range ({}); waiting indefinitely", secs, e);
            None
        }
    }
}

/// Default port of the upstream collector.
pub fn upstream_port() -> u16 {
    env_or(PMCD_PORT_ENV, DEFAULT_PMCD_PORT)
}

/// Default port the relay listens on.
pub fn relay_port() -> u16 {
    env_or(PMPROXY_PORT_ENV, DEFAULT_PMPROXY_PORT)
}

/// Bound on establishing the upstream connection.
pub fn connect_timeout() -> Option<Duration> {
    timeout_from_secs(env_or(CONNECT_TIMEOUT_ENV, DEFAULT_CONNECT_TIMEOUT_SECS))
}

/// Bound on each PDU receive while negotiating.
pub fn request_timeout() -> Option<Duration> {
    timeout_from_secs(env_or(REQUEST_TIMEOUT_ENV, DEFAULT_REQUEST_TIMEOUT_SECS))
}

/// Listen backlog for relay sockets.
pub fn max_pending() -> i32 {
    env_or(MAX_PENDING_ENV, DEFAULT_MAX_PENDING)
}

/// Whether the relay should only bind loopback addresses.
pub fn local_only() -> bool {
    env::var_os(LOCAL_ONLY_ENV).is_some()
}

/// Relay certificate paths for TLS
#[derive(Debug, Clone)]
pub struct ServerCertPath {
    /// Path to the relay certificate file
    pub cert_path: PathBuf,
    /// Path to the relay private key file
    pub key_path:  PathBuf,
    /// Path to the certificate authority used to verify clients
    pub ca_path:   PathBuf,
}

impl ServerCertPath {
    /// Creates ServerCertPath with default certificate locations
    /// Certificates are expected in a 'relay' subdirectory within the base
    /// certs directory.
    pub fn new() -> Self {
        Self::in_dir(&get_certs_dir())
    }

    pub fn in_dir(dir: &Path) -> Self {
        let base = dir.join(SERVER_CERTS_SUBDIR);
        Self {
            cert_path: base.join("server.pem"),
            key_path:  base.join("server.key.pem"),
            ca_path:   dir.join("root-ca.pem"), // CA remains in the base certs dir
        }
    }

    /// True when both the certificate and key are present.
    pub fn is_present(&self) -> bool {
        self.cert_path.is_file() && self.key_path.is_file()
    }
}

impl Default for ServerCertPath {
    fn default() -> Self {
        Self::new()
    }
}

/// Certificate paths for the connecting side
#[derive(Debug, Clone)]
pub struct ClientCertPath {
    /// Path to the client certificate file
    pub cert_path: PathBuf,
    /// Path to the client private key file
    pub key_path:  PathBuf,
    /// Path to the certificate authority used to verify servers
    pub ca_path:   PathBuf,
}

impl ClientCertPath {
    /// Creates ClientCertPath with default certificate locations
    /// Certificates are expected in a 'client' subdirectory within the base
    /// certs directory.
    pub fn new() -> Self {
        Self::in_dir(&get_certs_dir())
    }

    pub fn in_dir(dir: &Path) -> Self {
        let base = dir.join(CLIENT_CERTS_SUBDIR);
        Self {
            cert_path: base.join("client.pem"),
            key_path:  base.join("client.key.pem"),
            ca_path:   dir.join("root-ca.pem"),
        }
    }

    /// True when a client certificate and key are available to present.
    pub fn has_identity(&self) -> bool {
        self.cert_path.is_file() && self.key_path.is_file()
    }
}

impl Default for ClientCertPath {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_timeouts_block_forever() {
        assert_eq!(timeout_from_secs(0.0), None);
        assert_eq!(timeout_from_secs(-3.5), None);
        assert_eq!(timeout_from_secs(f64::NAN), None);
        assert_eq!(timeout_from_secs(1.5), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn oversized_timeouts_block_forever() {
        assert_eq!(timeout_from_secs(1e30), None);
        assert_eq!(timeout_from_secs(f64::INFINITY), None);
        assert_eq!(timeout_from_secs(f64::MAX), None);
    }

    #[test]
    fn cert_layout() {
        let paths = ServerCertPath::in_dir(Path::new("/etc/pmrelay"));
        assert_eq!(paths.cert_path, Path::new("/etc/pmrelay/relay/server.pem"));
        assert_eq!(paths.ca_path, Path::new("/etc/pmrelay/root-ca.pem"));
        assert!(!paths.is_present());

        let client = ClientCertPath::in_dir(Path::new("/tmp/none"));
        assert!(!client.has_identity());
    }
}
