//! Handshake, abort and teardown over loopback.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serial_test::serial;
use shobu_rollback::__internal::PeerSocket;
use shobu_rollback::network::udp_socket::Received;
use shobu_rollback::telemetry::CollectingSink;
use shobu_rollback::{NetplayError, NetplaySession, NetworkConfig, SessionConfig};

use crate::common::stubs::GameStub;
use crate::common::{connect_pair, loopback_config, PortAllocator};

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Host picks delay 3; the client adopts it.
#[test]
#[serial]
fn host_delay_is_negotiated() {
    let sink = Arc::new(CollectingSink::new());
    let port = PortAllocator::next_port();
    let (host, client) = connect_pair(port, 3, loopback_config(&sink), loopback_config(&sink));

    assert!(host.is_connected());
    assert!(client.is_connected());
    assert_eq!(host.input_delay(), 3);
    assert_eq!(client.input_delay(), 3);
    assert!(host.is_host());
    assert!(!client.is_host());
    assert_eq!(
        host.peer_addr().unwrap().port(),
        client.local_addr().unwrap().port()
    );
    assert!(sink.contains("Input delay set to 3"));
}

#[test]
#[serial]
fn client_times_out_against_silent_port() {
    let silent = PeerSocket::bind(0).unwrap();
    let port = silent.local_addr().unwrap().port();
    let config = SessionConfig::default()
        .with_log_sink(Arc::new(CollectingSink::new()))
        .with_network(NetworkConfig::lan().with_handshake_timeout(Duration::from_millis(150)));

    let mut client =
        NetplaySession::client(&format!("127.0.0.1:{port}"), GameStub::client(), config).unwrap();
    let err = client.connect_to_host().unwrap_err();
    assert!(matches!(err, NetplayError::HandshakeTimeout { .. }));
    assert!(!client.is_connected());
}

#[test]
#[serial]
fn host_wait_can_be_aborted_from_another_thread() {
    let sink = Arc::new(CollectingSink::new());
    let mut host =
        NetplaySession::host(PortAllocator::next_port(), GameStub::host(), loopback_config(&sink))
            .unwrap();
    let abort = host.abort_handle();
    let aborter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        abort.abort();
    });

    let started = Instant::now();
    assert_eq!(host.wait_for_client(), Err(NetplayError::HandshakeAborted));
    assert!(started.elapsed() < Duration::from_secs(2));
    aborter.join().unwrap();
}

#[test]
#[serial]
fn second_host_on_same_port_fails_to_bind() {
    let sink = Arc::new(CollectingSink::new());
    let port = PortAllocator::next_port();
    let _first = NetplaySession::host(port, GameStub::host(), loopback_config(&sink)).unwrap();
    let second = NetplaySession::host(port, GameStub::host(), loopback_config(&sink));
    assert!(matches!(second, Err(NetplayError::Bind { .. })));
}

#[test]
#[serial]
fn disconnect_reaches_the_peer() {
    let sink = Arc::new(CollectingSink::new());
    let port = PortAllocator::next_port();
    let (mut host, client) = connect_pair(port, 2, loopback_config(&sink), loopback_config(&sink));

    host.disconnect();
    assert!(!host.is_connected());
    assert!(wait_until(Duration::from_secs(3), || !client.is_connected()));
    assert!(sink.contains("Peer disconnected"));
}

#[test]
#[serial]
fn silent_peer_is_dropped_after_idle_timeout() {
    let sink = Arc::new(CollectingSink::new());
    let fast = NetworkConfig::lan().with_receive_timeout(Duration::from_millis(100));
    let config = || loopback_config(&sink).with_network(fast);
    let port = PortAllocator::next_port();
    let (mut host, mut client) = connect_pair(port, 2, config(), config());

    // One exchange starts the silence clock on both sides.
    host.update(0);
    client.update(0);
    client.disconnect_without_message();

    assert!(wait_until(Duration::from_secs(3), || !host.is_connected()));
    assert!(sink.contains("No packets for"));
}

#[test]
#[serial]
fn matchmaker_sees_the_host_socket() {
    let relay = PeerSocket::bind(0).unwrap();
    relay.set_read_timeout(Duration::from_secs(1)).unwrap();
    let relay_port = relay.local_addr().unwrap().port();
    let sink = Arc::new(CollectingSink::new());
    let host =
        NetplaySession::host(PortAllocator::next_port(), GameStub::host(), loopback_config(&sink))
            .unwrap();

    host.connect_to_matchmaker(&format!("127.0.0.1:{relay_port}"), "lobby-7")
        .unwrap();

    let mut buf = [0u8; 32];
    match relay.recv_from(&mut buf).unwrap() {
        Received::Datagram { len, from } => {
            assert_eq!(&buf[..len], b"lobby-7");
            assert_eq!(from.port(), host.local_addr().unwrap().port());
        },
        Received::TimedOut => panic!("relay heard nothing"),
    }
}
