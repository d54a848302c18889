mod common;

use std::net::SocketAddr;

use common::{
    external_address, provider, relay_config, users, Collector, Event, RelayHarness, TestPki,
    TIMEOUT,
};
use pmrelay_client::{ClientConfig, RelayClient};
use pmrelay_common::{
    error::{PmError, PM_ERR_NEEDCLIENTCERT, PM_ERR_SECURE_CHANNEL},
    pdu::{IpcFlags, Pdu, TextReq},
    security::{SecurityConfig, SecurityProvider},
};

fn client_config(relay: &RelayHarness, upstream_port: u16) -> ClientConfig {
    ClientConfig::new()
        .with_relay("127.0.0.1", relay.addr.port())
        .with_server_name("localhost")
        .with_upstream("localhost", upstream_port)
        .with_flags(IpcFlags::SECURE)
        .with_timeout(Some(TIMEOUT))
}

fn error_code(err: &anyhow::Error) -> Option<i32> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PmError>().map(PmError::code))
}

#[test]
fn mutual_tls_on_both_legs() {
    let pki = TestPki::generate();
    let features = IpcFlags::SECURE | IpcFlags::SECURE_ACK | IpcFlags::CERT_REQD;
    let (collector, port) = Collector::tcp(features, pki.provider(), 1);
    let relay = RelayHarness::start(relay_config(), pki.provider());

    let mut client =
        RelayClient::connect(client_config(&relay, port).with_cert_path(pki.client_paths()))
            .unwrap();
    assert!(client.is_encrypted());
    assert_eq!(
        client.flags(),
        IpcFlags::SECURE | IpcFlags::SECURE_ACK | IpcFlags::CERT_REQD
    );

    match collector.next() {
        Event::Negotiated { flags, .. } => assert!(flags.contains(IpcFlags::SECURE)),
        other => panic!("unexpected collector event {other:?}"),
    }

    let request = Pdu::TextReq(TextReq {
        ident:     99,
        text_type: 1,
    })
    .encode(7);
    client.send_frame(&request).unwrap();
    let reply = client.recv_frame().unwrap();
    assert_eq!(collector.next(), Event::Received(request.as_bytes().to_vec()));
    assert_eq!(collector.next(), Event::Sent(reply.as_bytes().to_vec()));

    client.disconnect();
    assert_eq!(collector.next(), Event::Closed);
    relay.stop();
}

#[test]
fn encryption_with_authentication() {
    let pki = TestPki::generate();
    let (collector, port) = Collector::tcp(IpcFlags::SECURE_ACK, pki.provider(), 1);
    let relay = RelayHarness::start(relay_config(), pki.provider());

    let client = RelayClient::connect(
        client_config(&relay, port)
            .with_cert_path(pki.anonymous_client_paths())
            .with_credentials("alice", "wonderland"),
    )
    .unwrap();
    assert!(client.is_encrypted());
    assert_eq!(client.authenticated_as(), Some("alice"));
    match collector.next() {
        Event::Negotiated { flags, user, .. } => {
            assert!(flags.contains(IpcFlags::SECURE | IpcFlags::AUTH));
            assert_eq!(user.as_deref(), Some("alice"));
        }
        other => panic!("unexpected collector event {other:?}"),
    }
    drop(client);
    relay.stop();
}

#[test]
fn missing_client_certificate_is_reported() {
    let pki = TestPki::generate();
    let features = IpcFlags::SECURE | IpcFlags::SECURE_ACK | IpcFlags::CERT_REQD;
    let (collector, port) = Collector::tcp(features, pki.provider(), 1);
    let relay = RelayHarness::start(relay_config(), pki.provider());

    let err = RelayClient::connect(
        client_config(&relay, port).with_cert_path(pki.anonymous_client_paths()),
    )
    .err()
    .expect("connect should fail");
    assert_eq!(error_code(&err), Some(PM_ERR_NEEDCLIENTCERT), "{err:#}");
    assert_eq!(collector.next(), Event::Closed);
    relay.stop();
}

#[test]
fn relay_without_certificate_refuses_encryption() {
    let pki = TestPki::generate();
    let (collector, port) = Collector::tcp(IpcFlags::SECURE_ACK, pki.provider(), 1);
    let relay = RelayHarness::start(relay_config(), provider(Vec::new()));

    let err = RelayClient::connect(
        client_config(&relay, port).with_cert_path(pki.anonymous_client_paths()),
    )
    .err()
    .expect("connect should fail");
    assert_eq!(error_code(&err), Some(PM_ERR_SECURE_CHANNEL), "{err:#}");
    assert_eq!(collector.next(), Event::Closed);
    relay.stop();
}

#[test]
fn pipelined_requests_are_served_from_decrypted_input() {
    let pki = TestPki::generate();
    let (collector, port) = Collector::tcp(IpcFlags::SECURE_ACK, pki.provider(), 1);
    let relay = RelayHarness::start(relay_config(), pki.provider());

    let mut client = RelayClient::connect(
        client_config(&relay, port).with_cert_path(pki.anonymous_client_paths()),
    )
    .unwrap();
    assert!(client.is_encrypted());
    assert!(matches!(collector.next(), Event::Negotiated { .. }));

    // one write, so the relay decrypts both requests from a single read
    let requests: Vec<_> = (1..=2)
        .map(|ident| Pdu::TextReq(TextReq { ident, text_type: 1 }).encode(7))
        .collect();
    client.send_batch(&requests).unwrap();
    for ident in 1..=2 {
        match client.recv().unwrap() {
            Pdu::Text(text) => assert_eq!(text.buffer, format!("help for {ident}")),
            other => panic!("unexpected reply {other:?}"),
        }
    }
    for request in &requests {
        assert_eq!(collector.next(), Event::Received(request.as_bytes().to_vec()));
        assert!(matches!(collector.next(), Event::Sent(_)));
    }
    drop(client);
    relay.stop();
}

#[test]
fn relay_certificate_policy_applies_to_the_upstream_leg() {
    let Some(ip) = external_address() else {
        eprintln!("no non-loopback address on this host, skipping");
        return;
    };
    let pki = TestPki::generate();
    let (collector, port) = Collector::tcp(IpcFlags::SECURE_ACK, pki.provider(), 1);

    // the relay verifies client certificates but has none of its own
    let relay_provider = SecurityProvider::new(SecurityConfig {
        server: Some(pki.server_paths()),
        client: Some(pki.anonymous_client_paths()),
        users: users(),
        ..Default::default()
    });
    let mut config = relay_config();
    config.require_cert = true;
    let relay = RelayHarness::start_on(SocketAddr::new(ip, 0), config, relay_provider);

    let mut client = RelayClient::connect(
        ClientConfig::new()
            .with_relay(ip.to_string(), relay.addr.port())
            .with_server_name("localhost")
            .with_upstream("localhost", port)
            .with_flags(IpcFlags::SECURE)
            .with_cert_path(pki.client_paths())
            .with_timeout(Some(TIMEOUT)),
    )
    .unwrap();
    assert!(!client.flags().contains(IpcFlags::CERT_REQD));

    // the upstream leg is asked for a certificate the relay cannot present
    assert_eq!(client.recv().unwrap(), Pdu::error(PM_ERR_NEEDCLIENTCERT));
    assert!(client.recv_frame().is_err());
    loop {
        match collector.next() {
            Event::Closed => break,
            Event::Negotiated { .. } => panic!("upstream leg should not complete"),
            _ => {}
        }
    }
    let engine = relay.stop();
    assert_eq!(engine.registry().active(), 0);
}
