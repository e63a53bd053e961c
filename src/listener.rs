//! Background threads of a connected session.
//!
//! The listener blocks on the socket, decodes every datagram against the
//! engine's current window and hands it to
//! [`EngineState::handle_packet`]. The flusher releases datagrams held by
//! the latency simulator. Both stop once [`Shared::connected`] is cleared,
//! observing it within one receive timeout or one flush interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::config::NetworkConfig;
use crate::connection::PeerLink;
use crate::engine::{Dispatch, EngineState};
use crate::error::NetplayError;
use crate::netlog;
use crate::network::codec::{self, MAX_PACKET_SIZE};
use crate::network::udp_socket::Received;
use crate::ping::wire_millis;
use crate::telemetry::{Component, LogLevel, LogSink};

/// State shared between the session and its background threads.
pub struct Shared {
    /// The rollback state machine. Held for the whole of one update or one
    /// packet dispatch.
    pub engine: Mutex<EngineState>,
    /// Socket and outbound path.
    pub link: PeerLink,
    /// Cleared on disconnect from either side; the background threads exit
    /// once they see it.
    pub connected: AtomicBool,
    /// Where records go.
    pub log: Arc<dyn LogSink>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("link", &self.link)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Shared {
    /// Bundles an engine and a link. Starts disconnected.
    pub fn new(engine: EngineState, link: PeerLink, log: Arc<dyn LogSink>) -> Self {
        Self {
            engine: Mutex::new(engine),
            link,
            connected: AtomicBool::new(false),
            log,
        }
    }

    /// Whether the session is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Marks the session connected, before the background threads start.
    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::Release);
    }

    /// Marks the session disconnected. Returns whether it was connected.
    pub fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }

    /// Decodes one datagram and feeds it to the engine, then sends whatever
    /// the engine queued in response.
    pub fn dispatch(&self, bytes: &[u8]) -> Dispatch {
        let now_ms = wire_millis();
        let (dispatch, outbox) = {
            let mut engine = self.engine.lock();
            let inputs = engine.window().buffer_size();
            match codec::decode(bytes, inputs) {
                Ok(packet) => {
                    let dispatch = engine.handle_packet(packet, now_ms);
                    (dispatch, engine.take_outbox())
                },
                Err(err) => {
                    netlog!(
                        self.log,
                        LogLevel::Warning,
                        Component::Listener,
                        "Dropping undecodable datagram: {}",
                        err
                    );
                    (Dispatch::Continue, Vec::new())
                },
            }
        };
        for packet in &outbox {
            self.link.send(packet);
        }
        dispatch
    }
}

/// Join handles of the listener and flusher threads.
///
/// The flusher only runs once latency simulation is switched on.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
    shared: Option<Arc<Shared>>,
    config: NetworkConfig,
    flushing: bool,
}

impl BackgroundTasks {
    fn attached(shared: &Arc<Shared>, config: NetworkConfig) -> Self {
        Self {
            handles: Vec::new(),
            shared: Some(Arc::clone(shared)),
            config,
            flushing: false,
        }
    }

    /// Starts the listener, and the flusher if packets are being delayed.
    /// `shared` must already be marked connected.
    pub fn spawn(shared: &Arc<Shared>, config: NetworkConfig) -> Result<Self, NetplayError> {
        let mut tasks = Self::attached(shared, config);
        tasks.start("shobu-listener", listen)?;
        if shared.link.simulator().packet_delay() > 0 {
            tasks.start_flusher()?;
        }
        Ok(tasks)
    }

    /// Starts the flusher unless it is already running. Does nothing before
    /// [`spawn`](Self::spawn).
    pub fn start_flusher(&mut self) -> Result<(), NetplayError> {
        if self.flushing || self.shared.is_none() {
            return Ok(());
        }
        self.start("shobu-flusher", flush)?;
        self.flushing = true;
        Ok(())
    }

    fn start(&mut self, name: &str, body: fn(&Shared, &NetworkConfig)) -> Result<(), NetplayError> {
        let Some(shared) = self.shared.clone() else {
            return Ok(());
        };
        let config = self.config;
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let _guard = PanicGuard { shared: &shared };
                body(&shared, &config);
            })
            .map_err(|err| NetplayError::Socket {
                context: format!("spawn {name}: {err}"),
            })?;
        self.handles.push(handle);
        Ok(())
    }

    /// Waits for every thread to exit. A thread that panicked leaves the
    /// session disconnected.
    pub fn join(&mut self) {
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("background thread").to_owned();
            if handle.join().is_err() {
                if let Some(shared) = &self.shared {
                    netlog!(
                        shared.log,
                        LogLevel::Error,
                        Component::Listener,
                        "{} exited with a panic",
                        name
                    );
                    shared.mark_disconnected();
                }
            }
        }
        self.flushing = false;
    }

    /// Whether any thread is still attached.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Whether the flusher has been started.
    #[must_use]
    pub const fn is_flushing(&self) -> bool {
        self.flushing
    }
}

/// Clears `connected` when a background thread unwinds, so the session
/// stops sending into a link nobody reads.
struct PanicGuard<'a> {
    shared: &'a Shared,
}

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            netlog!(
                self.shared.log,
                LogLevel::Error,
                Component::Listener,
                "{} panicked, disconnecting",
                thread::current().name().unwrap_or("background thread")
            );
            self.shared.mark_disconnected();
        }
    }
}

/// The listener loop.
///
/// Silence before the first datagram is not counted against the peer;
/// after it, `max_idle_timeouts` consecutive receive timeouts end the
/// session.
pub fn listen(shared: &Shared, config: &NetworkConfig) {
    if let Err(err) = shared.link.socket().set_read_timeout(config.receive_timeout) {
        netlog!(shared.log, LogLevel::Error, Component::Listener, "{}", err);
        shared.mark_disconnected();
        return;
    }

    let mut buffer = [0u8; MAX_PACKET_SIZE];
    let mut heard_peer = false;
    let mut idle_timeouts = 0u32;

    while shared.is_connected() {
        match shared.link.socket().recv_from(&mut buffer) {
            Ok(Received::Datagram { len, .. }) => {
                heard_peer = true;
                idle_timeouts = 0;
                if shared.dispatch(&buffer[..len]) == Dispatch::Disconnect {
                    netlog!(
                        shared.log,
                        LogLevel::Message,
                        Component::Listener,
                        "Closing link after peer disconnect"
                    );
                    shared.mark_disconnected();
                }
            },
            Ok(Received::TimedOut) => {
                if !heard_peer {
                    continue;
                }
                idle_timeouts += 1;
                if idle_timeouts >= config.max_idle_timeouts {
                    netlog!(
                        shared.log,
                        LogLevel::Warning,
                        Component::Listener,
                        "No packets for {} ms, disconnecting",
                        config.receive_timeout.as_millis() * u128::from(idle_timeouts)
                    );
                    shared.mark_disconnected();
                }
            },
            Err(err) => {
                netlog!(shared.log, LogLevel::Error, Component::Listener, "{}", err);
                shared.mark_disconnected();
            },
        }
    }
}

/// The flusher loop. Runs until disconnect, idling while nothing is queued.
pub fn flush(shared: &Shared, config: &NetworkConfig) {
    while shared.is_connected() {
        thread::sleep(config.flush_interval);
        shared.link.flush_delayed();
    }
    shared.link.simulator().clear();
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
    use crate::config::LinkSimulationConfig;
    use crate::connection::loopback;
    use crate::network::messages::{Packet, Role};
    use crate::network::udp_socket::PeerSocket;
    use crate::telemetry::CollectingSink;
    use crate::Tick;
    use web_time::{Duration, Instant};

    fn shared(role: Role) -> (Arc<Shared>, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        let engine = EngineState::new(role, 2, true, sink.clone());
        let link = PeerLink::new(
            PeerSocket::bind(0).unwrap(),
            &LinkSimulationConfig::passthrough(),
            2,
            sink.clone(),
        );
        (Arc::new(Shared::new(engine, link, sink.clone())), sink)
    }

    fn fast_config() -> NetworkConfig {
        NetworkConfig::lan()
            .with_receive_timeout(Duration::from_millis(30))
            .with_flush_interval(Duration::from_millis(5))
    }

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn undecodable_datagram_is_logged_and_ignored() {
        let (shared, sink) = shared(Role::Host);
        assert_eq!(shared.dispatch(b"zzz"), Dispatch::Continue);
        assert!(sink.contains("undecodable"));
    }

    #[test]
    fn retransmit_request_is_answered_with_a_frame() {
        let (shared, _) = shared(Role::Host);
        let peer = PeerSocket::bind(0).unwrap();
        peer.set_read_timeout(Duration::from_millis(200)).unwrap();
        shared
            .link
            .set_peer(loopback(peer.local_addr().unwrap().port()));
        let bytes = codec::encode(&Packet::RetransmitRequest {
            role: Role::Client,
            tick: Tick::new(12),
        })
        .unwrap();
        shared.dispatch(&bytes);

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let Received::Datagram { len, .. } = peer.recv_from(&mut buf).unwrap() else {
            panic!("expected a frame");
        };
        match codec::decode(&buf[..len], 9).unwrap() {
            // Capped at our own tick, which has not started yet.
            Packet::Frame(frame) => assert_eq!(frame.tick, Tick::NULL),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn disconnect_packet_stops_listener() {
        let (shared, sink) = shared(Role::Host);
        shared.mark_connected();
        let mut tasks = BackgroundTasks::spawn(&shared, fast_config()).unwrap();

        let peer = PeerSocket::bind(0).unwrap();
        let port = shared.link.socket().local_addr().unwrap().port();
        peer.send_to(&codec::encode(&Packet::Disconnect).unwrap(), loopback(port))
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || !shared.is_connected()));
        tasks.join();
        assert!(!tasks.is_running());
        assert!(sink.contains("Peer disconnected"));
    }

    #[test]
    fn silence_after_first_datagram_disconnects() {
        let (shared, sink) = shared(Role::Client);
        shared.mark_connected();
        let config = fast_config().with_max_idle_timeouts(2);
        let mut tasks = BackgroundTasks::spawn(&shared, config).unwrap();

        // Nothing arrives: the idle count has not started.
        thread::sleep(Duration::from_millis(120));
        assert!(shared.is_connected());

        let peer = PeerSocket::bind(0).unwrap();
        let port = shared.link.socket().local_addr().unwrap().port();
        let wait = Packet::Wait {
            role: Role::Host,
            tick: Tick::new(0),
        };
        peer.send_to(&codec::encode(&wait).unwrap(), loopback(port))
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || !shared.is_connected()));
        tasks.join();
        assert!(sink.contains("No packets for"));
    }

    #[test]
    fn frames_from_peer_are_answered_with_ping_responses() {
        let (shared, _) = shared(Role::Host);
        let peer = PeerSocket::bind(0).unwrap();
        peer.set_read_timeout(Duration::from_millis(200)).unwrap();
        shared
            .link
            .set_peer(loopback(peer.local_addr().unwrap().port()));

        let frame = {
            let mut client = EngineState::new(Role::Client, 2, true, Arc::new(CollectingSink::new()));
            client.build_frame(Tick::new(1), 1234)
        };
        shared.dispatch(&codec::encode(&Packet::Frame(frame)).unwrap());

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut responses = 0;
        while let Received::Datagram { len, .. } = peer.recv_from(&mut buf).unwrap() {
            if let Ok(Packet::PingResponse { timestamp, .. }) = codec::decode(&buf[..len], 0) {
                assert_eq!(timestamp, 1234);
                responses += 1;
            }
        }
        assert_eq!(responses, 2);
        assert_eq!(shared.engine.lock().remote_tick(), Tick::new(1));
    }

    fn explode(_: &Shared, _: &NetworkConfig) {
        panic!("listener failure");
    }

    #[test]
    fn panicking_task_disconnects_session() {
        let (shared, sink) = shared(Role::Host);
        shared.mark_connected();
        let mut tasks = BackgroundTasks::attached(&shared, fast_config());
        tasks.start("shobu-test", explode).unwrap();

        assert!(wait_until(Duration::from_secs(2), || !shared.is_connected()));
        tasks.join();
        assert!(!tasks.is_running());
        assert!(sink.contains("shobu-test panicked"));
        assert!(sink.contains("shobu-test exited with a panic"));
    }

    #[test]
    fn flusher_starts_only_with_latency() {
        let (shared, _) = shared(Role::Host);
        shared.mark_connected();
        let mut tasks = BackgroundTasks::spawn(&shared, fast_config()).unwrap();
        assert!(!tasks.is_flushing());
        assert_eq!(tasks.handles.len(), 1);

        shared.link.simulator().set_packet_delay(2);
        tasks.start_flusher().unwrap();
        tasks.start_flusher().unwrap();
        assert!(tasks.is_flushing());
        assert_eq!(tasks.handles.len(), 2);

        shared.mark_disconnected();
        tasks.join();
        assert!(!tasks.is_flushing());
    }

    #[test]
    fn detached_tasks_never_start_a_flusher() {
        let mut tasks = BackgroundTasks::default();
        tasks.start_flusher().unwrap();
        assert!(!tasks.is_flushing());
        assert!(!tasks.is_running());
    }

    #[test]
    fn flusher_clears_queue_on_exit() {
        let (shared, _) = shared(Role::Host);
        shared.link.simulator().set_packet_delay(1_000);
        shared.link.set_peer(loopback(9));
        let frame = EngineState::new(Role::Host, 2, true, shared.log.clone())
            .build_frame(Tick::new(0), 0);
        shared.link.send(&Packet::Frame(frame));
        assert_eq!(shared.link.simulator().pending(), 1);

        flush(&shared, &fast_config());
        assert_eq!(shared.link.simulator().pending(), 0);
    }
}
