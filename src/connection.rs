//! The peer link and the connection handshake.
//!
//! [`PeerLink`] owns the socket and the peer address, and is the single
//! place packets are encoded and written: simulated traffic is routed
//! through the [`LinkSimulator`], redundant packets are repeated.
//!
//! The handshake is one round trip:
//!
//! ```text
//! client                      host
//!   | -- 'c' connect -------->  |   host records the sender as its peer
//!   | <-- 'a' ack, delay ----   |   sent `send_repeats` times
//!   | (settle sleep)            |
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use web_time::Instant;

use crate::config::{LinkSimulationConfig, NetworkConfig};
use crate::error::NetplayError;
use crate::network::codec::{self, MAX_PACKET_SIZE};
use crate::network::link_sim::{LinkSimulator, Route};
use crate::network::messages::{Packet, TAG_CONNECT, TAG_HANDSHAKE_ACK, TAG_HOLE_PUNCH};
use crate::network::udp_socket::{PeerSocket, Received};
use crate::telemetry::{Component, LogLevel, LogSink};
use crate::{netlog, MATCHMAKER_PORT};

/// The socket, the peer address and the outbound path to the peer.
pub struct PeerLink {
    socket: PeerSocket,
    peer: Mutex<Option<SocketAddr>>,
    simulator: Mutex<LinkSimulator>,
    send_repeats: usize,
    sent: AtomicU64,
    log: Arc<dyn LogSink>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("socket", &self.socket)
            .field("peer", &*self.peer.lock())
            .field("send_repeats", &self.send_repeats)
            .finish_non_exhaustive()
    }
}

impl PeerLink {
    /// Wraps a bound socket. No peer is known yet.
    pub fn new(
        socket: PeerSocket,
        simulation: &LinkSimulationConfig,
        send_repeats: usize,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            socket,
            peer: Mutex::new(None),
            simulator: Mutex::new(LinkSimulator::new(simulation)),
            send_repeats,
            sent: AtomicU64::new(0),
            log,
        }
    }

    /// The underlying socket.
    #[must_use]
    pub const fn socket(&self) -> &PeerSocket {
        &self.socket
    }

    /// The peer address, once known.
    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }

    /// Records the peer address.
    pub fn set_peer(&self, addr: SocketAddr) {
        *self.peer.lock() = Some(addr);
    }

    /// The loss and latency simulator.
    pub fn simulator(&self) -> MutexGuard<'_, LinkSimulator> {
        self.simulator.lock()
    }

    /// Datagrams written to the socket so far, repeats included.
    #[must_use]
    pub fn packets_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Encodes and sends `packet` to the peer.
    ///
    /// Frames and ping responses pass through the simulator. Frames, ping
    /// responses and handshake acks go out `send_repeats` times; everything
    /// else once. Failures are logged, never returned: delivery is best
    /// effort either way.
    pub fn send(&self, packet: &Packet) {
        let Some(peer) = self.peer() else {
            netlog!(
                self.log,
                LogLevel::Debug,
                Component::Connection,
                "No peer yet, dropping {} packet",
                packet.kind()
            );
            return;
        };
        let mut buffer = [0u8; MAX_PACKET_SIZE];
        let len = match codec::encode_into(packet, &mut buffer) {
            Ok(len) => len,
            Err(err) => {
                netlog!(
                    self.log,
                    LogLevel::Error,
                    Component::Codec,
                    "Failed to encode {} packet: {}",
                    packet.kind(),
                    err
                );
                return;
            },
        };
        let bytes = &buffer[..len];

        if packet.is_simulated() {
            match self.simulator.lock().route(bytes) {
                Route::Send => {},
                Route::Queued => return,
                Route::Dropped => {
                    netlog!(
                        self.log,
                        LogLevel::Debug,
                        Component::Simulator,
                        "Simulated loss of {} packet",
                        packet.kind()
                    );
                    return;
                },
            }
        }

        let repeats = if packet.is_redundant() {
            self.send_repeats
        } else {
            1
        };
        self.send_bytes(bytes, peer, repeats);
    }

    /// Sends every delayed datagram whose countdown has run out.
    pub fn flush_delayed(&self) {
        let due = self.simulator.lock().flush_due();
        if due.is_empty() {
            return;
        }
        let Some(peer) = self.peer() else {
            return;
        };
        for bytes in &due {
            self.send_bytes(bytes, peer, self.send_repeats);
        }
    }

    fn send_bytes(&self, bytes: &[u8], peer: SocketAddr, repeats: usize) {
        for _ in 0..repeats {
            match self.socket.send_to(bytes, peer) {
                Ok(()) => {
                    self.sent.fetch_add(1, Ordering::Relaxed);
                },
                Err(err) => {
                    netlog!(self.log, LogLevel::Warning, Component::Connection, "{}", err);
                },
            }
        }
    }
}

/// Cancels a pending [`wait_for_client`](crate::NetplaySession::wait_for_client)
/// or [`connect_to_host`](crate::NetplaySession::connect_to_host) from
/// another thread.
///
/// ```no_run
/// # use shobu_rollback::{NetplaySession, SessionConfig, Checksum, GameCallbacks, Input};
/// # struct Game;
/// # impl GameCallbacks for Game {
/// #     fn update(&mut self, _: Input, _: Input) {}
/// #     fn store(&mut self) {}
/// #     fn restore(&mut self) {}
/// #     fn checksum(&mut self) -> Checksum { 0 }
/// # }
/// let mut host = NetplaySession::host(7000, Game, SessionConfig::default())?;
/// let abort = host.abort_handle();
/// std::thread::spawn(move || {
///     std::thread::sleep(std::time::Duration::from_secs(30));
///     abort.abort();
/// });
/// let result = host.wait_for_client();
/// # Ok::<(), shobu_rollback::NetplayError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct HandshakeAbort {
    flag: Arc<AtomicBool>,
}

impl HandshakeAbort {
    /// A handle that has not fired.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the handshake in progress, or the next one to start.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns `true` if an abort is pending.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Consumes a pending abort, so that the next handshake can run.
    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

/// Resolves `address` to an IPv4 socket address, matching the
/// `0.0.0.0` socket every session binds.
pub fn resolve(address: impl ToSocketAddrs + std::fmt::Display) -> Result<SocketAddr, NetplayError> {
    let resolved = address.to_socket_addrs().map_err(|err| NetplayError::Resolve {
        address: address.to_string(),
        context: err.to_string(),
    })?;
    resolved
        .into_iter()
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| NetplayError::Resolve {
            address: address.to_string(),
            context: "no IPv4 address found".to_owned(),
        })
}

/// Blocks until a connect request arrives, then answers it with the
/// input delay.
///
/// Hole-punch datagrams from a matchmaking relay are logged and ignored,
/// as is anything else that is not a connect request.
pub fn wait_for_client(
    link: &PeerLink,
    config: &NetworkConfig,
    delay: u8,
    abort: &HandshakeAbort,
) -> Result<SocketAddr, NetplayError> {
    let log = &link.log;
    link.socket.set_read_timeout(config.handshake_poll)?;
    let started = Instant::now();
    let mut buffer = [0u8; MAX_PACKET_SIZE];
    netlog!(
        log,
        LogLevel::Message,
        Component::Connection,
        "Waiting for client on {}",
        link.socket.local_addr()?
    );

    loop {
        if abort.take() {
            netlog!(log, LogLevel::Message, Component::Connection, "Host wait aborted");
            return Err(NetplayError::HandshakeAborted);
        }
        if let Some(limit) = config.host_wait_timeout {
            if started.elapsed() >= limit {
                let waited_ms = started.elapsed().as_millis() as u64;
                netlog!(
                    log,
                    LogLevel::Warning,
                    Component::Connection,
                    "No client after {} ms",
                    waited_ms
                );
                return Err(NetplayError::HandshakeTimeout { waited_ms });
            }
        }

        let (len, from) = match link.socket.recv_from(&mut buffer)? {
            Received::Datagram { len, from } => (len, from),
            Received::TimedOut => continue,
        };
        match buffer[..len].first().copied() {
            Some(TAG_CONNECT) => {
                link.set_peer(from);
                link.send(&Packet::HandshakeAck { delay });
                netlog!(
                    log,
                    LogLevel::Message,
                    Component::Connection,
                    "Client {} connected, input delay {}",
                    from,
                    delay
                );
                return Ok(from);
            },
            Some(TAG_HOLE_PUNCH) => {
                netlog!(
                    log,
                    LogLevel::Debug,
                    Component::Connection,
                    "Hole punch from {}",
                    from
                );
            },
            Some(tag) => {
                netlog!(
                    log,
                    LogLevel::Warning,
                    Component::Connection,
                    "Got unknown handshake datagram {:#04x} from {}",
                    tag,
                    from
                );
            },
            None => {},
        }
    }
}

/// Sends one connect request and waits for the host's acknowledgment.
///
/// Returns the input delay the host chose.
pub fn connect_to_host(
    link: &PeerLink,
    config: &NetworkConfig,
    abort: &HandshakeAbort,
) -> Result<u8, NetplayError> {
    let log = &link.log;
    let Some(host) = link.peer() else {
        return Err(NetplayError::InvalidRequest {
            info: "no host address to connect to".to_owned(),
        });
    };
    link.socket.set_read_timeout(config.handshake_poll)?;
    link.send(&Packet::Connect);
    netlog!(log, LogLevel::Message, Component::Connection, "Connecting to {}", host);

    let started = Instant::now();
    let mut buffer = [0u8; MAX_PACKET_SIZE];
    let len = loop {
        if abort.take() {
            return Err(NetplayError::HandshakeAborted);
        }
        if started.elapsed() >= config.handshake_timeout {
            let waited_ms = started.elapsed().as_millis() as u64;
            netlog!(
                log,
                LogLevel::Warning,
                Component::Connection,
                "Handshake with {} timed out after {} ms",
                host,
                waited_ms
            );
            return Err(NetplayError::HandshakeTimeout { waited_ms });
        }
        match link.socket.recv_from(&mut buffer)? {
            Received::Datagram { len, .. } => break len,
            Received::TimedOut => {},
        }
    };

    let reply = &buffer[..len];
    if reply.len() < codec::HANDSHAKE_ACK_SIZE || reply[0] != TAG_HANDSHAKE_ACK {
        let context = format!(
            "expected a {}-byte acknowledgment, got {} bytes starting with {:?}",
            codec::HANDSHAKE_ACK_SIZE,
            reply.len(),
            reply.first()
        );
        netlog!(log, LogLevel::Warning, Component::Connection, "Handshake rejected: {}", context);
        return Err(NetplayError::HandshakeRejected { context });
    }
    match codec::decode(reply, 0)? {
        Packet::HandshakeAck { delay } => {
            netlog!(
                log,
                LogLevel::Message,
                Component::Connection,
                "Connected to {}, input delay {}",
                host,
                delay
            );
            Ok(delay)
        },
        other => Err(NetplayError::HandshakeRejected {
            context: format!("unexpected {} packet", other.kind()),
        }),
    }
}

/// Sends the key to a matchmaking relay, from the session's own socket so
/// that the relay learns its public port.
pub fn connect_to_matchmaker(link: &PeerLink, server: &str, key: &str) -> Result<(), NetplayError> {
    let relay = if server.contains(':') {
        resolve(server)?
    } else {
        resolve(format!("{server}:{MATCHMAKER_PORT}"))?
    };
    link.socket.send_to(key.as_bytes(), relay)?;
    netlog!(
        link.log,
        LogLevel::Message,
        Component::Connection,
        "Registered with matchmaker {}",
        relay
    );
    Ok(())
}

/// The loopback address on `port`, for tests and same-machine play.
#[must_use]
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::messages::{FramePacket, Role};
    use crate::telemetry::CollectingSink;
    use crate::Tick;
    use web_time::Duration;

    fn link_with(simulation: LinkSimulationConfig) -> (PeerLink, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        let link = PeerLink::new(PeerSocket::bind(0).unwrap(), &simulation, 2, sink.clone());
        (link, sink)
    }

    fn receiver() -> PeerSocket {
        let socket = PeerSocket::bind(0).unwrap();
        socket.set_read_timeout(Duration::from_millis(200)).unwrap();
        socket
    }

    fn port_of(socket: &PeerSocket) -> u16 {
        socket.local_addr().unwrap().port()
    }

    fn drain(socket: &PeerSocket) -> Vec<Vec<u8>> {
        let mut got = Vec::new();
        let mut buf = [0u8; MAX_PACKET_SIZE];
        while let Received::Datagram { len, .. } = socket.recv_from(&mut buf).unwrap() {
            got.push(buf[..len].to_vec());
        }
        got
    }

    fn frame() -> Packet {
        Packet::Frame(FramePacket {
            role: Role::Host,
            tick: Tick::new(1),
            inputs: std::iter::repeat(0).take(9).collect(),
            checksum: 0,
            packet_id: 1,
            timestamp: 0,
            tick_delta: 0,
        })
    }

    #[test]
    fn frames_are_sent_twice_and_control_once() {
        let (link, _) = link_with(LinkSimulationConfig::passthrough());
        let rx = receiver();
        link.set_peer(loopback(port_of(&rx)));
        link.send(&frame());
        link.send(&Packet::Wait {
            role: Role::Host,
            tick: Tick::new(0),
        });
        let got = drain(&rx);
        assert_eq!(got.len(), 3);
        assert_eq!(got.iter().filter(|d| d[0] == b'f').count(), 2);
        assert_eq!(got.iter().filter(|d| d[0] == b'w').count(), 1);
        assert_eq!(link.packets_sent(), 3);
    }

    #[test]
    fn send_without_peer_is_dropped_quietly() {
        let (link, sink) = link_with(LinkSimulationConfig::passthrough());
        link.send(&Packet::Disconnect);
        assert_eq!(link.packets_sent(), 0);
        assert!(sink.contains("No peer yet"));
    }

    #[test]
    fn full_loss_never_touches_control_packets() {
        let (link, _) =
            link_with(LinkSimulationConfig::passthrough().with_loss_frequency(1).with_seed(1));
        let rx = receiver();
        link.set_peer(loopback(port_of(&rx)));
        link.send(&frame());
        link.send(&Packet::RetransmitRequest {
            role: Role::Host,
            tick: Tick::new(4),
        });
        let got = drain(&rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0][0], b'r');
        assert_eq!(link.simulator().stats().dropped, 1);
    }

    #[test]
    fn delayed_frames_leave_on_flush() {
        let (link, _) = link_with(LinkSimulationConfig::passthrough().with_packet_delay(1));
        let rx = receiver();
        link.set_peer(loopback(port_of(&rx)));
        link.send(&frame());
        link.flush_delayed();
        assert!(drain(&rx).is_empty());
        link.flush_delayed();
        assert_eq!(drain(&rx).len(), 2);
    }

    #[test]
    fn handshake_over_loopback() {
        let (host, _) = link_with(LinkSimulationConfig::passthrough());
        let (client, _) = link_with(LinkSimulationConfig::passthrough());
        let host_port = host.socket().local_addr().unwrap().port();
        client.set_peer(loopback(host_port));
        let config = NetworkConfig::lan();

        let host_thread = std::thread::spawn(move || {
            let result = wait_for_client(&host, &config, 3, &HandshakeAbort::new());
            (result, host)
        });
        // The host polls every 20ms; its socket is already bound.
        let delay = connect_to_host(&client, &config, &HandshakeAbort::new()).unwrap();
        assert_eq!(delay, 3);
        let (result, host) = host_thread.join().unwrap();
        let peer = result.unwrap();
        assert_eq!(peer.port(), client.socket().local_addr().unwrap().port());
        assert_eq!(host.peer(), Some(peer));
    }

    #[test]
    fn host_ignores_hole_punch_and_unknown_datagrams() {
        let (host, sink) = link_with(LinkSimulationConfig::passthrough());
        let host_port = host.socket().local_addr().unwrap().port();
        let poker = PeerSocket::bind(0).unwrap();
        poker.send_to(b"p", loopback(host_port)).unwrap();
        poker.send_to(b"zz", loopback(host_port)).unwrap();
        poker.send_to(b"c", loopback(host_port)).unwrap();

        let peer = wait_for_client(&host, &NetworkConfig::lan(), 2, &HandshakeAbort::new()).unwrap();
        assert_eq!(peer.port(), port_of(&poker));
        assert!(sink.contains("Hole punch"));
        assert!(sink.contains("unknown handshake datagram"));
    }

    #[test]
    fn abort_cancels_host_wait() {
        let (host, _) = link_with(LinkSimulationConfig::passthrough());
        let abort = HandshakeAbort::new();
        abort.abort();
        let err = wait_for_client(&host, &NetworkConfig::lan(), 2, &abort).unwrap_err();
        assert_eq!(err, NetplayError::HandshakeAborted);
        assert!(!abort.is_aborted());
    }

    #[test]
    fn host_wait_timeout_is_reported() {
        let (host, _) = link_with(LinkSimulationConfig::passthrough());
        let config = NetworkConfig::lan().with_host_wait_timeout(Some(Duration::from_millis(60)));
        let err = wait_for_client(&host, &config, 2, &HandshakeAbort::new()).unwrap_err();
        assert!(matches!(err, NetplayError::HandshakeTimeout { waited_ms } if waited_ms >= 60));
    }

    #[test]
    fn client_times_out_without_host() {
        let (client, _) = link_with(LinkSimulationConfig::passthrough());
        let silent = PeerSocket::bind(0).unwrap();
        client.set_peer(loopback(port_of(&silent)));
        let config = NetworkConfig::lan().with_handshake_timeout(Duration::from_millis(80));
        let err = connect_to_host(&client, &config, &HandshakeAbort::new()).unwrap_err();
        assert!(matches!(err, NetplayError::HandshakeTimeout { .. }));
    }

    #[test]
    fn client_rejects_short_reply() {
        let (client, _) = link_with(LinkSimulationConfig::passthrough());
        let fake_host = receiver();
        client.set_peer(loopback(port_of(&fake_host)));
        let client_port = port_of(client.socket());
        let responder = std::thread::spawn(move || {
            let mut buf = [0u8; 8];
            if let Received::Datagram { .. } = fake_host.recv_from(&mut buf).unwrap() {
                fake_host.send_to(b"a", loopback(client_port)).unwrap();
            }
        });
        let err = connect_to_host(&client, &NetworkConfig::lan(), &HandshakeAbort::new()).unwrap_err();
        responder.join().unwrap();
        assert!(matches!(err, NetplayError::HandshakeRejected { .. }));
    }

    #[test]
    fn resolve_prefers_ipv4() {
        let addr = resolve("127.0.0.1:4000").unwrap();
        assert_eq!(addr, loopback(4000));
        assert!(matches!(
            resolve("not a host name"),
            Err(NetplayError::Resolve { .. })
        ));
    }

    #[test]
    fn matchmaker_receives_key() {
        let (link, _) = link_with(LinkSimulationConfig::passthrough());
        let relay = receiver();
        let server = format!("127.0.0.1:{}", port_of(&relay));
        connect_to_matchmaker(&link, &server, "room-42").unwrap();
        assert_eq!(drain(&relay), vec![b"room-42".to_vec()]);
    }
}
