//! Plaintext lines exchanged before any PDU framing.

use std::{path::Path, time::Duration};

use crate::{
    config::{self, CLIENT_VERSION_LINE, PREAMBLE_LINE_MAX, SERVER_VERSION_LINE},
    error::PmError,
    platform_socket::{connect_tcp, connect_unix},
    transport::Transport,
};

/// Collector the client asked to be connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
}

impl UpstreamTarget {
    /// Parse `host [port]`. A missing port means the default collector port.
    pub fn parse(line: &str) -> Result<Self, PmError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (host, port) = match line.split_once(' ') {
            Some((host, port)) => (host, Some(port)),
            None => (line, None),
        };
        if host.is_empty() {
            return Err(PmError::Ipc("no upstream host in preamble".into()));
        }
        let port = match port {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| PmError::Ipc(format!("bad upstream port {raw:?}")))?,
            None => config::upstream_port(),
        };
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// A host starting with `/` is a local-domain socket path.
    pub fn is_local_path(&self) -> bool {
        self.host.starts_with('/')
    }

    /// Name to verify the upstream certificate against.
    pub fn server_name(&self) -> &str {
        if self.is_local_path() {
            "localhost"
        } else {
            &self.host
        }
    }

    pub fn connect(&self, timeout: Option<Duration>) -> Result<Transport, PmError> {
        let socket = if self.is_local_path() {
            connect_unix(Path::new(&self.host))?
        } else {
            connect_tcp(&self.host, self.port, timeout)?
        };
        Ok(Transport::new(socket))
    }
}

/// Relay side of the preamble: check the version line, answer, and read the
/// upstream target.
pub fn accept(client: &mut Transport, timeout: Option<Duration>) -> Result<UpstreamTarget, PmError> {
    let version = client.read_line(PREAMBLE_LINE_MAX, timeout)?;
    if version.trim_end_matches('\r') != CLIENT_VERSION_LINE {
        return Err(PmError::Ipc(format!("bad version string {version:?}")));
    }
    client.write_all(SERVER_VERSION_LINE.as_bytes())?;
    let target = client.read_line(PREAMBLE_LINE_MAX, timeout)?;
    UpstreamTarget::parse(&target)
}

/// Client side of the preamble.
pub fn offer(
    relay: &mut Transport,
    target: &UpstreamTarget,
    timeout: Option<Duration>,
) -> Result<(), PmError> {
    relay.write_all(format!("{CLIENT_VERSION_LINE}\n").as_bytes())?;
    let reply = relay.read_line(PREAMBLE_LINE_MAX, timeout)?;
    if format!("{reply}\n") != SERVER_VERSION_LINE {
        return Err(PmError::Ipc(format!("unexpected relay version {reply:?}")));
    }
    relay.write_all(format!("{} {}\n", target.host, target.port).as_bytes())
}

#[cfg(test)]
mod tests {
    use std::{os::unix::net::UnixStream, thread};

    use super::*;
    use crate::platform_socket::PlatformSocket;

    fn pair() -> (Transport, Transport) {
        let (a, b) = UnixStream::pair().unwrap();
        (
            Transport::new(PlatformSocket::Unix(a)),
            Transport::new(PlatformSocket::Unix(b)),
        )
    }

    #[test]
    fn parses_host_and_port() {
        let target = UpstreamTarget::parse("collector.example 4330").unwrap();
        assert_eq!(target.host, "collector.example");
        assert_eq!(target.port, 4330);
        assert!(!target.is_local_path());
        assert_eq!(target.server_name(), "collector.example");
    }

    #[test]
    fn missing_port_uses_default() {
        let target = UpstreamTarget::parse("/run/pmcd.socket").unwrap();
        assert_eq!(target.port, config::upstream_port());
        assert!(target.is_local_path());
        assert_eq!(target.server_name(), "localhost");
    }

    #[test]
    fn rejects_bad_port_and_empty_host() {
        assert!(UpstreamTarget::parse("host 44321x").is_err());
        assert!(UpstreamTarget::parse("host 70000").is_err());
        assert!(UpstreamTarget::parse(" 44321").is_err());
    }

    #[test]
    fn both_sides_agree() {
        let (mut relay, mut client) = pair();
        let handle = thread::spawn(move || {
            let target = UpstreamTarget {
                host: "collector.example".into(),
                port: 44321,
            };
            offer(&mut client, &target, Some(Duration::from_secs(2)))
        });
        let target = accept(&mut relay, Some(Duration::from_secs(2))).unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(target.host, "collector.example");
        assert_eq!(target.port, 44321);
    }

    #[test]
    fn wrong_version_is_refused() {
        let (mut relay, mut client) = pair();
        client.write_all(b"pmproxy-client 2\n").unwrap();
        assert!(matches!(
            accept(&mut relay, Some(Duration::from_secs(1))),
            Err(PmError::Ipc(_))
        ));
    }
}
