//! Descriptor accounting. Kept in its own binary so no other test opens
//! sockets while descriptors are being counted.

mod common;

use std::{
    thread,
    time::{Duration, Instant},
};

use common::{open_descriptors, provider, relay_config, Collector, Event, TIMEOUT};
use pmrelay_client::{ClientConfig, RelayClient};
use pmrelay_common::{
    pdu::{IpcFlags, Pdu, TextReq},
    platform_socket::PlatformListener,
};
use pmrelay_server::{PairingState, RelayEngine};

/// Service the relay until `done` holds or the deadline passes.
fn drive(engine: &mut RelayEngine, done: impl Fn(&RelayEngine) -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !done(engine) {
        assert!(Instant::now() < deadline, "relay did not settle");
        engine.run_once(Some(Duration::from_millis(20))).unwrap();
    }
}

fn relaying(engine: &RelayEngine) -> bool {
    engine
        .registry()
        .iter()
        .any(|(_, pairing)| pairing.state() == PairingState::Relaying)
}

fn idle(engine: &RelayEngine) -> bool {
    engine.registry().active() == 0
}

#[test]
fn failing_leg_closes_both_descriptors() {
    let (collector, port) = Collector::tcp(IpcFlags::NONE, provider(Vec::new()), 2);
    let listener = PlatformListener::bind_tcp("127.0.0.1:0".parse().unwrap(), 5).unwrap();
    let mut engine =
        RelayEngine::with_listeners(vec![listener], relay_config(), provider(Vec::new())).unwrap();
    let relay_port = engine.local_addrs()[0].port();
    let config = move || {
        ClientConfig::new()
            .with_relay("127.0.0.1", relay_port)
            .with_upstream("127.0.0.1", port)
            .with_timeout(Some(TIMEOUT))
    };
    let baseline = open_descriptors();

    // the client leg fails: the client vanishes mid-session
    let client = thread::spawn(move || {
        let mut client = RelayClient::connect(config()).unwrap();
        client
            .send(&Pdu::TextReq(TextReq {
                ident:     1,
                text_type: 1,
            }))
            .unwrap();
        client.recv().unwrap();
        client
    });
    drive(&mut engine, |e| relaying(e) && client.is_finished());
    // relay holds two descriptors; the client and collector one each
    assert_eq!(engine.registry().active(), 1);
    assert_eq!(open_descriptors(), baseline + 4);

    drop(client.join().unwrap());
    drive(&mut engine, idle);
    assert!(matches!(collector.next(), Event::Negotiated { .. }));
    assert!(matches!(collector.next(), Event::Received(_)));
    assert!(matches!(collector.next(), Event::Sent(_)));
    assert_eq!(collector.next(), Event::Closed);
    assert_eq!(open_descriptors(), baseline);

    // the upstream leg fails: the collector drops the session
    let client = thread::spawn(move || RelayClient::connect(config()).unwrap());
    drive(&mut engine, |e| relaying(e) && client.is_finished());
    let mut client = client.join().unwrap();
    assert!(matches!(collector.next(), Event::Negotiated { .. }));

    // the collector serves two sessions, then exits and closes its end
    let listener = collector.join();
    drive(&mut engine, idle);
    assert!(client.recv_frame().is_err());
    drop(client);
    drop(listener);
    assert_eq!(open_descriptors(), baseline - 1);

    engine.shutdown();
    let after_first = open_descriptors();
    engine.shutdown();
    assert_eq!(open_descriptors(), after_first);
    assert!(engine.is_shut_down());
}
