//! Shared fixtures: a scripted collector and a relay running on a thread.

#![allow(dead_code)]

use std::{
    fs,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use pmrelay_common::{
    agent::{AgentInterface, AgentV2},
    auth::{Attributes, Mechanism, UserDatabase},
    config::{ClientCertPath, ServerCertPath},
    error::PmError,
    negotiate::Negotiator,
    pdu::{
        Desc, ErrorPdu, InDom, InstanceReq, InstanceResult, IpcFlags, Pdu, PduInfo, PmId,
        PmResult, Profile, SizeLimit, Timeval,
    },
    platform_socket::PlatformListener,
    security::{SecurityConfig, SecurityProvider},
    transport::Transport,
};
use pmrelay_server::{RelayConfig, RelayEngine};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// What the collector saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Negotiated { flags: IpcFlags, steps: usize, user: Option<String> },
    Rejected(i32),
    Received(Vec<u8>),
    Sent(Vec<u8>),
    Closed,
}

/// Minimal agent answering text requests.
pub struct Echo;

impl AgentV2 for Echo {
    fn profile(&mut self, _profile: &Profile) -> Result<(), PmError> {
        Ok(())
    }

    fn fetch(&mut self, _pmids: &[PmId]) -> Result<PmResult, PmError> {
        Ok(PmResult {
            timestamp: Timeval { sec: 7, usec: 0 },
            sets:      Vec::new(),
        })
    }

    fn desc(&mut self, pmid: PmId) -> Result<Desc, PmError> {
        Ok(Desc {
            pmid,
            vtype: 0,
            indom: InDom::NULL,
            sem: 1,
            units: 0,
        })
    }

    fn instance(&mut self, req: &InstanceReq) -> Result<InstanceResult, PmError> {
        Ok(InstanceResult {
            indom:     req.indom,
            instances: Vec::new(),
        })
    }

    fn text(&mut self, ident: i32, _text_type: i32) -> Result<String, PmError> {
        Ok(format!("help for {ident}"))
    }
}

pub fn users() -> UserDatabase {
    UserDatabase::new().with_user("alice", "wonderland")
}

pub fn provider(mechanisms: Vec<Mechanism>) -> SecurityProvider {
    SecurityProvider::new(SecurityConfig {
        users: users(),
        mechanisms,
        ..Default::default()
    })
}

/// A collector that accepts `connections` clients one after another.
pub struct Collector {
    pub events: Receiver<Event>,
    handle:     JoinHandle<PlatformListener>,
}

impl Collector {
    pub fn spawn(
        listener: PlatformListener,
        features: IpcFlags,
        provider: SecurityProvider,
        connections: usize,
    ) -> Self {
        let (tx, events) = mpsc::channel();
        let handle = thread::spawn(move || {
            for _ in 0..connections {
                let Ok(socket) = listener.accept() else { break };
                let mut transport = Transport::new(socket);
                serve(&mut transport, features, &provider, &tx);
                drop(transport);
                let _ = tx.send(Event::Closed);
            }
            listener
        });
        Self { events, handle }
    }

    pub fn tcp(features: IpcFlags, provider: SecurityProvider, connections: usize) -> (Self, u16) {
        let listener = PlatformListener::bind_tcp("127.0.0.1:0".parse().unwrap(), 5).unwrap();
        let port = listener.local_addr().unwrap().port();
        (Self::spawn(listener, features, provider, connections), port)
    }

    pub fn unix(
        path: &Path,
        features: IpcFlags,
        provider: SecurityProvider,
        connections: usize,
    ) -> Self {
        let listener = PlatformListener::bind_unix(path).unwrap();
        Self::spawn(listener, features, provider, connections)
    }

    pub fn next(&self) -> Event {
        self.events.recv_timeout(TIMEOUT).expect("collector went quiet")
    }

    /// Wait for the collector to finish, handing back its listener.
    pub fn join(self) -> PlatformListener {
        self.handle.join().expect("collector panicked")
    }
}

fn serve(transport: &mut Transport, features: IpcFlags, provider: &SecurityProvider, tx: &Sender<Event>) {
    let origin = std::process::id() as i32;
    let greeting = Pdu::Error(ErrorPdu {
        code:  0,
        datum: Some(PduInfo::new(2, 1, features.bits() as u16).raw() as i32),
    });
    if transport.send_pdu(&greeting.encode(origin)).is_err() {
        return;
    }

    let flags = match transport.recv_pdu(SizeLimit::default(), Some(TIMEOUT)) {
        Ok(frame) => match Pdu::decode(&frame) {
            Ok(Pdu::Creds(creds)) => creds
                .creds
                .iter()
                .find_map(|c| c.flags())
                .unwrap_or(IpcFlags::NONE),
            _ => return,
        },
        Err(_) => return,
    };

    let mut attrs = Attributes::default();
    let mut negotiator = Negotiator::new(provider.clone()).with_timeout(Some(TIMEOUT));
    if let Err(e) = negotiator.server_handshake(transport, flags, &mut attrs) {
        let _ = transport.send_pdu(&Pdu::error(e.code()).encode(origin));
        let _ = tx.send(Event::Rejected(e.code()));
        return;
    }
    let _ = tx.send(Event::Negotiated {
        flags,
        steps: negotiator.exchange_steps(),
        user: attrs.username.clone(),
    });

    let mut agent = AgentInterface::V2(Box::new(Echo));
    loop {
        let frame = match transport.recv_pdu(SizeLimit::Any, Some(TIMEOUT)) {
            Ok(frame) => frame,
            Err(_) => return,
        };
        let _ = tx.send(Event::Received(frame.as_bytes().to_vec()));
        let reply = match Pdu::decode(&frame) {
            Ok(request) => agent.dispatch(&request),
            Err(e) => Some(Pdu::error(PmError::from(e).code())),
        };
        if let Some(reply) = reply {
            let reply = reply.encode(origin);
            if transport.send_pdu(&reply).is_err() {
                return;
            }
            let _ = tx.send(Event::Sent(reply.as_bytes().to_vec()));
        }
    }
}

/// A relay serviced on its own thread until stopped.
pub struct RelayHarness {
    pub addr:   SocketAddr,
    pub socket: Option<PathBuf>,
    stop:       Arc<AtomicBool>,
    handle:     JoinHandle<RelayEngine>,
}

impl RelayHarness {
    pub fn start(config: RelayConfig, provider: SecurityProvider) -> Self {
        Self::start_on(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0), config, provider)
    }

    /// Like [`RelayHarness::start`], listening for TCP on `bind`.
    pub fn start_on(bind: SocketAddr, config: RelayConfig, provider: SecurityProvider) -> Self {
        let mut listeners = vec![PlatformListener::bind_tcp(bind, 5).unwrap()];
        if let Some(path) = &config.socket_path {
            listeners.push(PlatformListener::bind_unix(path).unwrap());
        }
        let socket = config.socket_path.clone();
        let mut engine = RelayEngine::with_listeners(listeners, config, provider).unwrap();
        let addr = engine.local_addrs()[0];
        let stop = engine.shutdown_handle();
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                engine.run_once(Some(Duration::from_millis(50))).unwrap();
            }
            engine
        });
        Self {
            addr,
            socket,
            stop,
            handle,
        }
    }

    /// Stop servicing and hand the engine back for inspection.
    pub fn stop(self) -> RelayEngine {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.join().expect("relay panicked")
    }
}

pub fn relay_config() -> RelayConfig {
    RelayConfig {
        request_timeout: Some(TIMEOUT),
        connect_timeout: Some(TIMEOUT),
        ..Default::default()
    }
}

/// Certificates for `localhost` under one authority, laid out the way the
/// relay expects a certificate directory.
pub struct TestPki {
    pub dir: tempfile::TempDir,
}

impl TestPki {
    pub fn generate() -> Self {
        use rcgen::{
            BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
            KeyUsagePurpose,
        };

        let dir = tempfile::tempdir().unwrap();
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "pmrelay test authority");
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca = ca_params.self_signed(&ca_key).unwrap();
        fs::write(dir.path().join("root-ca.pem"), ca.pem()).unwrap();

        let leaf = |purpose: ExtendedKeyUsagePurpose, name: &str| {
            let key = KeyPair::generate().unwrap();
            let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
            params.distinguished_name.push(DnType::CommonName, name);
            params.extended_key_usages = vec![purpose];
            let cert = params.signed_by(&key, &ca, &ca_key).unwrap();
            (cert.pem(), key.serialize_pem())
        };

        let server = ServerCertPath::in_dir(dir.path());
        fs::create_dir_all(server.cert_path.parent().unwrap()).unwrap();
        let (cert, key) = leaf(ExtendedKeyUsagePurpose::ServerAuth, "pmrelay test server");
        fs::write(&server.cert_path, cert).unwrap();
        fs::write(&server.key_path, key).unwrap();

        let client = ClientCertPath::in_dir(dir.path());
        fs::create_dir_all(client.cert_path.parent().unwrap()).unwrap();
        let (cert, key) = leaf(ExtendedKeyUsagePurpose::ClientAuth, "pmrelay test client");
        fs::write(&client.cert_path, cert).unwrap();
        fs::write(&client.key_path, key).unwrap();

        Self { dir }
    }

    pub fn server_paths(&self) -> ServerCertPath {
        ServerCertPath::in_dir(self.dir.path())
    }

    pub fn client_paths(&self) -> ClientCertPath {
        ClientCertPath::in_dir(self.dir.path())
    }

    /// Trust roots only, without a client identity.
    pub fn anonymous_client_paths(&self) -> ClientCertPath {
        let mut paths = ClientCertPath::in_dir(&self.dir.path().join("anonymous"));
        paths.ca_path = self.dir.path().join("root-ca.pem");
        paths
    }

    /// Provider that can both accept and make encrypted connections.
    pub fn provider(&self) -> SecurityProvider {
        SecurityProvider::new(SecurityConfig {
            server: Some(self.server_paths()),
            client: Some(self.client_paths()),
            users: users(),
            ..Default::default()
        })
    }
}

/// An address of this host that is not loopback, so connections from it
/// count as remote. Hosts with only a loopback interface have none.
pub fn external_address() -> Option<IpAddr> {
    // connecting a datagram socket only picks a route; nothing is sent
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}

/// Open descriptors in this process.
pub fn open_descriptors() -> usize {
    fs::read_dir("/proc/self/fd").map(|d| d.count()).unwrap_or(0)
}
