//! The public session type.

use std::net::SocketAddr;
use std::sync::Arc;

use web_time::Instant;

use crate::config::{NetworkConfig, SessionConfig};
use crate::connection::{self, HandshakeAbort, PeerLink};
use crate::engine::{self, EngineState, TickOutcome};
use crate::error::NetplayError;
use crate::listener::{BackgroundTasks, Shared};
use crate::network::messages::{Packet, Role};
use crate::network::network_stats::NetworkStats;
use crate::network::udp_socket::PeerSocket;
use crate::ping::wire_millis;
use crate::telemetry::{Component, LogLevel, LogSink};
use crate::{netlog, GameCallbacks, Input, Tick};

/// Weight of the previous value in the update-interval average.
const INTERVAL_SMOOTHING: f64 = 0.9;

/// One side of a two-player rollback match.
///
/// A session owns the game, a UDP socket and, once connected, a listener
/// and a flusher thread. The game is only ever called from the thread that
/// calls [`update`](Self::update), so `G` need not be `Send`.
///
/// Sessions are single-use: after [`disconnect`](Self::disconnect) build a
/// new one.
///
/// ```no_run
/// # use shobu_rollback::{Checksum, GameCallbacks, Input, NetplaySession, SessionConfig};
/// # #[derive(Default)] struct Game;
/// # impl GameCallbacks for Game {
/// #     fn update(&mut self, _: Input, _: Input) {}
/// #     fn store(&mut self) {}
/// #     fn restore(&mut self) {}
/// #     fn checksum(&mut self) -> Checksum { 0 }
/// # }
/// let mut client = NetplaySession::client("192.168.1.20:7000", Game, SessionConfig::default())?;
/// client.connect_to_host()?;
/// while client.is_connected() {
///     client.update(0);
///     # break;
/// }
/// # Ok::<(), shobu_rollback::NetplayError>(())
/// ```
pub struct NetplaySession<G: GameCallbacks> {
    game: G,
    shared: Arc<Shared>,
    role: Role,
    network: NetworkConfig,
    abort: HandshakeAbort,
    tasks: BackgroundTasks,
    finished: bool,
    last_update: Option<Instant>,
    update_interval_us: f64,
    log: Arc<dyn LogSink>,
}

impl<G: GameCallbacks> std::fmt::Debug for NetplaySession<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetplaySession")
            .field("role", &self.role)
            .field("shared", &self.shared)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<G: GameCallbacks> NetplaySession<G> {
    /// Binds `0.0.0.0:port` as the host. Call
    /// [`wait_for_client`](Self::wait_for_client) next.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] for an invalid config,
    /// [`NetplayError::Bind`] if the port is taken.
    pub fn host(port: u16, game: G, config: SessionConfig) -> Result<Self, NetplayError> {
        config.validate()?;
        let socket = PeerSocket::bind(port)?;
        Ok(Self::with_socket(Role::Host, socket, game, config))
    }

    /// Binds an ephemeral port as the client of `host_address`
    /// (`"host:port"`). Call [`connect_to_host`](Self::connect_to_host)
    /// next.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] for an invalid config,
    /// [`NetplayError::Resolve`] if the address does not resolve to IPv4,
    /// [`NetplayError::Bind`] if no port can be bound.
    pub fn client(host_address: &str, game: G, config: SessionConfig) -> Result<Self, NetplayError> {
        config.validate()?;
        let host = connection::resolve(host_address)?;
        let socket = PeerSocket::bind(0)?;
        let session = Self::with_socket(Role::Client, socket, game, config);
        session.shared.link.set_peer(host);
        Ok(session)
    }

    fn with_socket(role: Role, socket: PeerSocket, game: G, config: SessionConfig) -> Self {
        let log = Arc::clone(&config.log_sink);
        let engine = EngineState::new(role, config.input_delay, config.rollbacks, Arc::clone(&log));
        let link = PeerLink::new(
            socket,
            &config.simulation,
            config.network.send_repeats,
            Arc::clone(&log),
        );
        Self {
            game,
            shared: Arc::new(Shared::new(engine, link, Arc::clone(&log))),
            role,
            network: config.network,
            abort: HandshakeAbort::new(),
            tasks: BackgroundTasks::default(),
            finished: false,
            last_update: None,
            update_interval_us: 0.0,
            log,
        }
    }

    /// A handle that cancels a pending handshake from another thread.
    #[must_use]
    pub fn abort_handle(&self) -> HandshakeAbort {
        self.abort.clone()
    }

    /// Blocks until a client connects, answering it with the current input
    /// delay, then starts the background threads.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] on a client or an already connected
    /// or finished session, [`NetplayError::HandshakeAborted`],
    /// [`NetplayError::HandshakeTimeout`] if a host wait timeout is set, or a
    /// socket error.
    pub fn wait_for_client(&mut self) -> Result<(), NetplayError> {
        self.check_can_connect(Role::Host, "wait_for_client")?;
        let delay = self.input_delay();
        connection::wait_for_client(&self.shared.link, &self.network, delay, &self.abort)?;
        self.start()
    }

    /// Performs the handshake with the host, adopts its input delay, waits
    /// out the settle time and starts the background threads.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] on a host or an already connected or
    /// finished session, [`NetplayError::HandshakeTimeout`],
    /// [`NetplayError::HandshakeRejected`],
    /// [`NetplayError::HandshakeAborted`], or a socket error.
    pub fn connect_to_host(&mut self) -> Result<(), NetplayError> {
        self.check_can_connect(Role::Client, "connect_to_host")?;
        let delay = connection::connect_to_host(&self.shared.link, &self.network, &self.abort)?;
        self.shared.engine.lock().set_input_delay(delay);
        std::thread::sleep(self.network.handshake_settle);
        self.start()
    }

    fn check_can_connect(&self, role: Role, operation: &str) -> Result<(), NetplayError> {
        let problem = if self.role != role {
            Some(format!("{operation} called on the {:?} side", self.role))
        } else if self.finished {
            Some(format!("{operation} called on a finished session"))
        } else if self.is_connected() {
            Some(format!("{operation} called on a connected session"))
        } else {
            None
        };
        match problem {
            Some(info) => Err(NetplayError::InvalidRequest { info }),
            None => Ok(()),
        }
    }

    fn start(&mut self) -> Result<(), NetplayError> {
        self.shared.mark_connected();
        match BackgroundTasks::spawn(&self.shared, self.network) {
            Ok(tasks) => {
                self.tasks = tasks;
                Ok(())
            },
            Err(err) => {
                self.shared.mark_disconnected();
                Err(err)
            },
        }
    }

    /// Runs one tick with `local_input`, sending whatever the tick produced.
    ///
    /// Call at the game's fixed rate. Works before connecting too; packets
    /// simply have nowhere to go yet.
    pub fn update(&mut self, local_input: Input) -> TickOutcome {
        let now = Instant::now();
        if let Some(last) = self.last_update.replace(now) {
            let elapsed = now.duration_since(last).as_micros() as f64;
            self.update_interval_us =
                INTERVAL_SMOOTHING * self.update_interval_us + (1.0 - INTERVAL_SMOOTHING) * elapsed;
        }

        let (outcome, outbox) = {
            let mut engine = self.shared.engine.lock();
            let outcome = engine.update(&mut self.game, local_input, wire_millis());
            (outcome, engine.take_outbox())
        };
        for packet in &outbox {
            self.shared.link.send(packet);
        }
        outcome
    }

    /// Changes the input delay, clamped to
    /// [`MAX_INPUT_DELAY`](crate::MAX_INPUT_DELAY). Both peers must agree;
    /// the host's value is sent during the handshake.
    pub fn set_input_delay(&mut self, delay: u8) {
        self.shared.engine.lock().set_input_delay(delay);
    }

    /// The current input delay.
    #[must_use]
    pub fn input_delay(&self) -> u8 {
        self.shared.engine.lock().window().delay()
    }

    /// Enables or disables rollback. Without it, the session stalls until
    /// remote input is known.
    pub fn set_rollbacks(&mut self, enabled: bool) {
        self.shared.engine.lock().set_rollbacks(enabled);
    }

    /// Requests a resync: both peers hold until each has asked, then
    /// restart from tick 0.
    pub fn wait(&mut self) {
        self.shared.engine.lock().wait();
    }

    /// Restarts the timeline and steps the game with neutral input until
    /// [`force_synced`](Self::force_synced).
    pub fn stop_sync(&mut self) {
        self.shared.engine.lock().stop_sync();
    }

    /// Leaves stop-sync mode and clears the desync flag.
    pub fn force_synced(&mut self) {
        self.shared.engine.lock().force_synced();
    }

    /// `false` once a checksum mismatch with the peer has been seen.
    #[must_use]
    pub fn state_is_synced(&self) -> bool {
        self.shared.engine.lock().state_is_synced()
    }

    /// Smoothed round-trip time in milliseconds.
    #[must_use]
    pub fn ping(&self) -> u32 {
        self.shared.engine.lock().ping().ping_ms()
    }

    /// Sends a best-effort disconnect notice, stops the background threads
    /// and ends the session. Idempotent.
    pub fn disconnect(&mut self) {
        if self.shared.mark_disconnected() {
            self.shared.link.send(&Packet::Disconnect);
            netlog!(self.log, LogLevel::Message, Component::Session, "Disconnected");
        }
        self.finish();
    }

    /// Stops the background threads and ends the session without telling
    /// the peer.
    pub fn disconnect_without_message(&mut self) {
        if self.shared.mark_disconnected() {
            netlog!(
                self.log,
                LogLevel::Message,
                Component::Session,
                "Disconnected without notice"
            );
        }
        self.finish();
    }

    fn finish(&mut self) {
        self.tasks.join();
        self.shared.link.simulator().clear();
        self.finished = true;
    }

    /// Whether the session is connected. Turns `false` when the peer
    /// disconnects or goes silent.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Whether this is the host side.
    #[must_use]
    pub fn is_host(&self) -> bool {
        self.role.is_host()
    }

    /// This side's role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Last simulated tick.
    #[must_use]
    pub fn local_tick(&self) -> Tick {
        self.shared.engine.lock().local_tick()
    }

    /// Newest tick accepted from the peer.
    #[must_use]
    pub fn remote_tick(&self) -> Tick {
        self.shared.engine.lock().remote_tick()
    }

    /// Last tick both sides are known to agree on.
    #[must_use]
    pub fn rollback_tick(&self) -> Tick {
        self.shared.engine.lock().rollback_tick()
    }

    /// Whether this side is within tolerance of the peer's pace.
    #[must_use]
    pub fn is_remote_synced(&self) -> bool {
        self.shared.engine.lock().is_remote_synced()
    }

    /// Simulates loss of one in `frequency` outbound frames and ping
    /// responses. 0 disables it; negative values are ignored.
    pub fn set_packet_loss(&mut self, frequency: i32) {
        self.shared.link.simulator().set_loss_frequency(frequency);
    }

    /// Holds outbound frames and ping responses for `delay` flush
    /// intervals. Non-positive values disable it.
    pub fn set_packet_delay(&mut self, delay: i32) {
        self.shared.link.simulator().set_packet_delay(delay);
        if delay > 0 {
            if let Err(err) = self.tasks.start_flusher() {
                netlog!(self.log, LogLevel::Error, Component::Session, "{}", err);
            }
        }
    }

    /// Checks the game's determinism by stepping it with `(p1, p2)`,
    /// restoring, and stepping again. Returns `true` if the checksums
    /// differ. The game ends one tick ahead.
    pub fn test_rollback(&mut self, p1: Input, p2: Input) -> bool {
        engine::test_rollback(&mut self.game, p1, p2)
    }

    /// A snapshot of tick, rollback and link counters.
    pub fn network_stats(&self) -> NetworkStats {
        let mut stats = self.shared.engine.lock().stats();
        let link = &self.shared.link;
        let simulated = link.simulator().stats();
        stats.packets_sent = link.packets_sent();
        stats.packets_dropped = simulated.dropped;
        stats.packets_delayed = simulated.delayed;
        stats.update_interval_us = self.update_interval_us as u64;
        stats
    }

    /// The game.
    #[must_use]
    pub fn game(&self) -> &G {
        &self.game
    }

    /// The game, mutably. Changing state outside [`update`](Self::update)
    /// desyncs the peers unless both do it at the same tick.
    pub fn game_mut(&mut self) -> &mut G {
        &mut self.game
    }

    /// The bound socket address; reports the real port for a client.
    ///
    /// # Errors
    ///
    /// [`NetplayError::Socket`] if the OS cannot report it.
    pub fn local_addr(&self) -> Result<SocketAddr, NetplayError> {
        self.shared.link.socket().local_addr()
    }

    /// The peer's address, once known.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.link.peer()
    }

    /// Registers `key` with a matchmaking relay at `server`, from this
    /// session's socket. Without a port, the relay's default
    /// [`MATCHMAKER_PORT`](crate::MATCHMAKER_PORT) is used.
    ///
    /// # Errors
    ///
    /// [`NetplayError::Resolve`] or [`NetplayError::Socket`].
    pub fn connect_to_matchmaker(&self, server: &str, key: &str) -> Result<(), NetplayError> {
        connection::connect_to_matchmaker(&self.shared.link, server, key)
    }
}

impl<G: GameCallbacks> Drop for NetplaySession<G> {
    fn drop(&mut self) {
        self.disconnect();
    }
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
    use crate::hash::checksum_of;
    use crate::telemetry::CollectingSink;
    use crate::Checksum;

    #[derive(Default)]
    struct Sum {
        value: i64,
        saved: i64,
    }

    impl GameCallbacks for Sum {
        fn update(&mut self, local: Input, remote: Input) {
            self.value = self.value * 3 + i64::from(local) - i64::from(remote);
        }
        fn store(&mut self) {
            self.saved = self.value;
        }
        fn restore(&mut self) {
            self.value = self.saved;
        }
        fn checksum(&mut self) -> Checksum {
            checksum_of(&self.value)
        }
    }

    fn config() -> SessionConfig {
        SessionConfig::default().with_log_sink(Arc::new(CollectingSink::new()))
    }

    #[test]
    fn host_rejects_client_operations() {
        let mut host = NetplaySession::host(0, Sum::default(), config()).unwrap();
        assert!(host.is_host());
        let err = host.connect_to_host().unwrap_err();
        assert!(matches!(err, NetplayError::InvalidRequest { .. }));
    }

    #[test]
    fn client_rejects_host_operations() {
        let mut client = NetplaySession::client("127.0.0.1:9", Sum::default(), config()).unwrap();
        assert_eq!(client.role(), Role::Client);
        assert!(matches!(
            client.wait_for_client(),
            Err(NetplayError::InvalidRequest { .. })
        ));
        assert_eq!(client.peer_addr().unwrap().port(), 9);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let bad = config().with_input_delay(12);
        assert!(matches!(
            NetplaySession::host(0, Sum::default(), bad),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn disconnected_session_is_finished() {
        let mut host = NetplaySession::host(0, Sum::default(), config()).unwrap();
        host.disconnect();
        host.disconnect();
        assert!(!host.is_connected());
        let err = host.wait_for_client().unwrap_err();
        assert!(matches!(err, NetplayError::InvalidRequest { info } if info.contains("finished")));
    }

    #[test]
    fn update_runs_offline() {
        let mut host = NetplaySession::host(0, Sum::default(), config()).unwrap();
        for _ in 0..3 {
            assert!(matches!(host.update(1), TickOutcome::Advanced { .. }));
        }
        assert_eq!(host.local_tick(), Tick::new(2));
        // Remote input below the delay is known to be zero.
        assert_eq!(host.rollback_tick(), Tick::new(1));
        let stats = host.network_stats();
        assert_eq!(stats.local_tick, Tick::new(2));
        assert_eq!(stats.packets_sent, 0);
    }

    #[test]
    fn settings_reach_the_engine() {
        let mut host = NetplaySession::host(0, Sum::default(), config()).unwrap();
        host.set_input_delay(9);
        assert_eq!(host.input_delay(), 7);
        host.set_packet_loss(3);
        host.set_packet_loss(-1);
        host.set_packet_delay(2);
        assert_eq!(host.shared.link.simulator().loss_frequency(), 3);
        assert_eq!(host.shared.link.simulator().packet_delay(), 2);
        host.stop_sync();
        assert_eq!(host.update(5), TickOutcome::Paused);
        host.force_synced();
        assert!(host.state_is_synced());
    }

    #[test]
    fn deterministic_game_passes_rollback_test() {
        let mut host = NetplaySession::host(0, Sum::default(), config()).unwrap();
        assert!(!host.test_rollback(4, 1));
        assert_eq!(host.game().value, 3);
        host.game_mut().value = 0;
        assert_eq!(host.game().value, 0);
    }

    #[test]
    fn abort_handle_cancels_wait() {
        let mut host = NetplaySession::host(0, Sum::default(), config()).unwrap();
        host.abort_handle().abort();
        assert_eq!(host.wait_for_client(), Err(NetplayError::HandshakeAborted));
        assert!(!host.is_connected());
    }
}
