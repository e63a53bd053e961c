//! The rollback state machine.
//!
//! [`EngineState`] is plain data: tick counters, sync flags, the three input
//! rings and an outbox of packets to send. It never touches a socket. The
//! session drives [`update`](EngineState::update) once per tick and the
//! listener feeds it received packets through
//! [`handle_packet`](EngineState::handle_packet); both drain the outbox after
//! releasing the shared lock.
//!
//! # Per-tick policy
//!
//! 1. While a resync wait is active, announce it and return until the peer
//!    announces one too, then restart the timeline from zero.
//! 2. If remote input for `rollback_tick + 1` has arrived, restore the last
//!    common state and replay up to the newest tick both sides agree on,
//!    then predict the rest.
//! 3. In stop-sync mode, step the game with neutral input and stop.
//! 4. Advance when the peer is keeping pace and the prediction window is
//!    not exhausted; confirm the tick if its remote input is already known.
//! 5. Otherwise stall one tick and ask the peer to retransmit.
//! 6. Send this tick's frame packet.

use std::sync::Arc;

use crate::input_store::{InputStore, InputWindow, TickRing};
use crate::network::messages::{FrameInputs, FramePacket, Packet, Role};
use crate::network::network_stats::NetworkStats;
use crate::ping::PingEstimator;
use crate::telemetry::{Component, LogLevel, LogSink};
use crate::{netlog, Checksum, GameCallbacks, Input, Tick, INPUT_CAPACITY, MAX_ROLLBACK};

/// How far behind our local tick a retransmit request may reach. Older
/// requests would read ring slots that have been reused.
const RETRANSMIT_HORIZON: i32 = INPUT_CAPACITY as i32 / 2;

/// What one call to [`EngineState::update`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A resync wait is pending; nothing was simulated.
    Waiting,
    /// Stop-sync mode; the game stepped with neutral input.
    Paused,
    /// The local tick advanced.
    Advanced {
        /// A rollback ran before the advance.
        rolled_back: bool,
    },
    /// The local tick held still waiting for the peer.
    Stalled {
        /// A rollback ran before the stall.
        rolled_back: bool,
    },
}

impl TickOutcome {
    /// Returns `true` if a rollback ran during this update.
    #[must_use]
    pub const fn rolled_back(&self) -> bool {
        matches!(
            self,
            Self::Advanced { rolled_back: true } | Self::Stalled { rolled_back: true }
        )
    }
}

/// What the listener should do after a packet was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Keep listening.
    Continue,
    /// The peer said goodbye.
    Disconnect,
}

/// Counters the engine keeps for [`NetworkStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounters {
    /// Updates that stalled.
    pub waits: u64,
    /// Rollbacks performed.
    pub rollbacks: u64,
    /// Frame packets accepted.
    pub frames_accepted: u64,
    /// Frame packets discarded.
    pub frames_rejected: u64,
}

/// Tick state, sync flags, input rings and pending outbound packets of one peer.
pub struct EngineState {
    role: Role,
    store: InputStore,
    window: InputWindow,
    local_tick: Tick,
    remote_tick: Tick,
    /// Last tick up to which remote input is written without gaps.
    remote_known: Tick,
    rollback_tick: Tick,
    remote_synced: bool,
    state_synced: bool,
    wait: bool,
    remote_wait: bool,
    paused: bool,
    rollbacks: bool,
    packet_id: u32,
    last_packet_id: u32,
    tick_delta: i32,
    ping: PingEstimator,
    counters: EngineCounters,
    outbox: Vec<Packet>,
    log: Arc<dyn LogSink>,
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("role", &self.role)
            .field("window", &self.window)
            .field("local_tick", &self.local_tick)
            .field("remote_tick", &self.remote_tick)
            .field("remote_known", &self.remote_known)
            .field("rollback_tick", &self.rollback_tick)
            .field("remote_synced", &self.remote_synced)
            .field("state_synced", &self.state_synced)
            .field("paused", &self.paused)
            .field("outbox", &self.outbox.len())
            .finish_non_exhaustive()
    }
}

impl EngineState {
    /// A fresh engine: `local_tick = -1`, `rollback_tick = -1`,
    /// `remote_tick = 0`, both sync flags set, empty rings.
    pub fn new(role: Role, input_delay: u8, rollbacks: bool, log: Arc<dyn LogSink>) -> Self {
        let window = InputWindow::new(input_delay);
        Self {
            role,
            store: InputStore::new(),
            window,
            local_tick: Tick::NULL,
            remote_tick: Tick::new(0),
            remote_known: initial_known(window),
            rollback_tick: Tick::NULL,
            remote_synced: true,
            state_synced: true,
            wait: false,
            remote_wait: false,
            paused: false,
            rollbacks,
            packet_id: 1,
            last_packet_id: 0,
            tick_delta: 0,
            ping: PingEstimator::new(),
            counters: EngineCounters::default(),
            outbox: Vec::new(),
            log,
        }
    }

    /// Runs one tick of the policy described in the module docs.
    ///
    /// `now_ms` stamps the frame packet sent at the end, see
    /// [`wire_millis`](crate::ping::wire_millis).
    pub fn update<G: GameCallbacks + ?Sized>(
        &mut self,
        game: &mut G,
        local_input: Input,
        now_ms: u32,
    ) -> TickOutcome {
        if self.wait {
            self.outbox.push(Packet::Wait {
                role: self.role,
                tick: self.local_tick,
            });
            if !self.remote_wait {
                return TickOutcome::Waiting;
            }
            self.wait = false;
            self.remote_wait = false;
            self.restart_timeline();
            netlog!(
                self.log,
                LogLevel::Message,
                Component::Engine,
                "Resync complete, restarting at tick 0"
            );
        }

        let rolled_back = if !self.paused
            && self.rollbacks
            && self.local_tick > self.rollback_tick
            && self.has_input(self.rollback_tick + 1)
        {
            self.rollback(game);
            true
        } else {
            false
        };

        if self.paused {
            game.update(0, 0);
            return TickOutcome::Paused;
        }

        let outcome = if self.can_advance() {
            self.advance(game, local_input);
            TickOutcome::Advanced { rolled_back }
        } else {
            self.remote_synced = true;
            self.outbox.push(Packet::RetransmitRequest {
                role: self.role,
                tick: self.resend_from(),
            });
            self.counters.waits += 1;
            netlog!(
                self.log,
                LogLevel::Debug,
                Component::Engine,
                "Stalled at tick {} (rollback {}, remote {})",
                self.local_tick,
                self.rollback_tick,
                self.remote_tick
            );
            TickOutcome::Stalled { rolled_back }
        };

        self.queue_frame(self.local_tick, now_ms);
        outcome
    }

    fn can_advance(&self) -> bool {
        if !self.remote_synced {
            return false;
        }
        if self.rollbacks {
            self.local_tick < self.rollback_tick + MAX_ROLLBACK
        } else {
            self.has_input(self.local_tick + 1)
        }
    }

    fn advance<G: GameCallbacks + ?Sized>(&mut self, game: &mut G, local_input: Input) {
        self.local_tick += 1;
        let input_tick = self.local_tick + self.window.delay_ticks();
        if let Err(err) = self.store.local_mut().insert(input_tick, local_input) {
            netlog!(self.log, LogLevel::Error, Component::Engine, "Local input lost: {}", err);
        }

        let local = self.read_local(self.local_tick);
        let remote = if self.has_input(self.local_tick) {
            self.read_remote(self.local_tick)
        } else {
            self.read_remote(self.remote_tick + self.window.delay_ticks())
        };
        game.update(local, remote);

        if self.local_tick == self.rollback_tick + 1 && self.has_input(self.local_tick) {
            self.rollback_tick = self.local_tick;
            game.store();
            let checksum = game.checksum();
            self.record_checksum(self.rollback_tick, checksum);
        }
    }

    /// Restores the last common state, replays confirmed ticks recording
    /// their checksums, stores the new common state and replays the rest
    /// with the newest confirmed remote input as prediction.
    fn rollback<G: GameCallbacks + ?Sized>(&mut self, game: &mut G) {
        game.restore();

        let ceiling = std::cmp::min(self.local_tick, self.remote_known);
        let mut tick = self.rollback_tick + 1;
        while tick <= ceiling {
            game.update(self.read_local(tick), self.read_remote(tick));
            let checksum = game.checksum();
            self.record_checksum(tick, checksum);
            tick += 1;
        }

        self.rollback_tick = ceiling;
        game.store();

        let predicted = self.read_remote(self.rollback_tick);
        while tick <= self.local_tick {
            game.update(self.read_local(tick), predicted);
            tick += 1;
        }

        self.counters.rollbacks += 1;
    }

    /// Whether remote input for `tick` has arrived.
    #[must_use]
    pub fn has_input(&self, tick: Tick) -> bool {
        self.remote_tick + (self.window.delay_ticks() - 1) >= tick
    }

    /// Frame tick whose carried window starts right after the last known
    /// remote input.
    fn resend_from(&self) -> Tick {
        self.remote_known + 1 + self.window.sync_offset()
    }

    fn read_local(&self, tick: Tick) -> Input {
        read_ring(&*self.log, self.store.local(), tick, "local input")
    }

    fn read_remote(&self, tick: Tick) -> Input {
        read_ring(&*self.log, self.store.remote(), tick, "remote input")
    }

    fn record_checksum(&mut self, tick: Tick, checksum: Checksum) {
        if let Err(err) = self.store.checksums_mut().insert(tick, checksum) {
            netlog!(self.log, LogLevel::Error, Component::Engine, "Checksum lost: {}", err);
        }
    }

    /// Queues the frame packet for `tick`, unless in stop-sync mode.
    fn queue_frame(&mut self, tick: Tick, now_ms: u32) {
        if self.paused {
            return;
        }
        let frame = self.build_frame(tick, now_ms);
        self.outbox.push(Packet::Frame(frame));
    }

    /// Builds the frame packet for `tick` and consumes one packet id.
    ///
    /// The frame carries local inputs for
    /// `tick + delay - buffer_size + 1 ..= tick + delay` and the checksum
    /// of `tick - MAX_ROLLBACK`.
    pub fn build_frame(&mut self, tick: Tick, now_ms: u32) -> FramePacket {
        let first = tick + self.window.delay_ticks() - (self.window.buffer_size() as i32 - 1);
        let inputs: FrameInputs = (0..self.window.buffer_size() as i32)
            .map(|i| self.read_local(first + i))
            .collect();
        let checksum = read_ring(
            &*self.log,
            self.store.checksums(),
            tick - MAX_ROLLBACK,
            "checksum",
        );
        let packet_id = self.packet_id;
        self.packet_id = self.packet_id.wrapping_add(1);
        FramePacket {
            role: self.role,
            tick,
            inputs,
            checksum,
            packet_id,
            timestamp: now_ms,
            tick_delta: self.tick_delta,
        }
    }

    /// Applies one packet from the peer.
    pub fn handle_packet(&mut self, packet: Packet, now_ms: u32) -> Dispatch {
        match packet {
            Packet::Frame(frame) => {
                let timestamp = frame.timestamp;
                if frame.role != self.role && !self.paused {
                    self.on_frame(&frame);
                }
                self.outbox.push(Packet::PingResponse {
                    role: self.role,
                    timestamp,
                });
            },
            Packet::RetransmitRequest { tick, .. } => {
                netlog!(
                    self.log,
                    LogLevel::Debug,
                    Component::Engine,
                    "Peer requested tick {}",
                    tick
                );
                if tick < self.local_tick - RETRANSMIT_HORIZON {
                    netlog!(
                        self.log,
                        LogLevel::Debug,
                        Component::Engine,
                        "Ignoring retransmit request for tick {}, local tick is {}",
                        tick,
                        self.local_tick
                    );
                } else {
                    let tick = std::cmp::min(tick, self.local_tick);
                    self.queue_frame(tick, now_ms);
                }
            },
            Packet::Wait { tick, .. } => {
                netlog!(
                    self.log,
                    LogLevel::Debug,
                    Component::Engine,
                    "Peer waiting at tick {}",
                    tick
                );
                self.remote_wait = self.wait;
            },
            Packet::PingResponse { timestamp, .. } => {
                self.ping.on_response(timestamp, now_ms);
            },
            Packet::Disconnect => {
                netlog!(self.log, LogLevel::Message, Component::Engine, "Peer disconnected");
                return Dispatch::Disconnect;
            },
            Packet::Connect | Packet::HandshakeAck { .. } => {
                netlog!(
                    self.log,
                    LogLevel::Debug,
                    Component::Engine,
                    "Ignoring late {} packet",
                    packet.kind()
                );
            },
        }
        Dispatch::Continue
    }

    fn on_frame(&mut self, frame: &FramePacket) {
        let ceiling = self.rollback_tick + self.window.buffer_size() as i32;
        if frame.packet_id <= self.last_packet_id
            || frame.tick <= self.remote_tick
            || frame.tick > ceiling
        {
            self.counters.frames_rejected += 1;
            if frame.tick > self.remote_tick + self.window.buffer_size() as i32 {
                netlog!(
                    self.log,
                    LogLevel::Debug,
                    Component::Engine,
                    "Got future tick {}, remote tick is {}",
                    frame.tick,
                    self.remote_tick
                );
            } else if frame.tick != self.remote_tick {
                netlog!(
                    self.log,
                    LogLevel::Debug,
                    Component::Engine,
                    "Got old tick {}, remote tick is {}",
                    frame.tick,
                    self.remote_tick
                );
            }
            return;
        }

        let first = self.window.first_carried_tick(frame.tick);
        if first > self.remote_known + 1 {
            self.counters.frames_rejected += 1;
            netlog!(
                self.log,
                LogLevel::Debug,
                Component::Engine,
                "Tick {} skips remote input after tick {}, requesting a resend",
                frame.tick,
                self.remote_known
            );
            self.outbox.push(Packet::RetransmitRequest {
                role: self.role,
                tick: self.resend_from(),
            });
            return;
        }

        self.counters.frames_accepted += 1;
        self.last_packet_id = frame.packet_id;
        self.remote_tick = frame.tick;
        self.remote_known = frame.tick + self.window.delay_ticks();
        self.tick_delta = self.local_tick - self.remote_tick;

        for (i, input) in frame.inputs.iter().enumerate() {
            let tick = first + i as i32;
            if !tick.is_valid() {
                continue;
            }
            if let Err(err) = self.store.remote_mut().insert(tick, *input) {
                netlog!(self.log, LogLevel::Error, Component::Engine, "Remote input lost: {}", err);
            }
        }

        self.check_state(frame.checksum);
        self.remote_synced = frame.tick_delta.saturating_add(1) >= self.tick_delta;
    }

    /// Compares the peer's checksum for `remote_tick - MAX_ROLLBACK` with
    /// ours, if we confirmed that tick.
    fn check_state(&mut self, remote_checksum: Checksum) {
        let tick = self.remote_tick - MAX_ROLLBACK;
        if !self.store.checksums().holds(tick) {
            return;
        }
        let local = read_ring(&*self.log, self.store.checksums(), tick, "checksum");
        if local != remote_checksum {
            self.state_synced = false;
            netlog!(
                self.log,
                LogLevel::Message,
                Component::Engine,
                "Desync at tick {}: local checksum {} remote checksum {}",
                tick,
                local,
                remote_checksum
            );
        }
    }

    fn restart_timeline(&mut self) {
        self.remote_tick = Tick::new(0);
        self.remote_known = initial_known(self.window);
        self.local_tick = Tick::NULL;
        self.rollback_tick = Tick::NULL;
        self.remote_synced = true;
        self.state_synced = true;
        self.store.reset();
    }

    /// Restarts the timeline and withholds gameplay until
    /// [`force_synced`](Self::force_synced).
    pub fn stop_sync(&mut self) {
        netlog!(self.log, LogLevel::Debug, Component::Engine, "Stopping sync");
        self.restart_timeline();
        self.paused = true;
    }

    /// Leaves stop-sync mode and clears the desync flag.
    pub fn force_synced(&mut self) {
        netlog!(self.log, LogLevel::Debug, Component::Engine, "Forcing sync");
        self.paused = false;
        self.state_synced = true;
    }

    /// Sets the input delay, clamped to [`MAX_INPUT_DELAY`](crate::MAX_INPUT_DELAY).
    pub fn set_input_delay(&mut self, delay: u8) {
        self.window = InputWindow::new(delay);
        if self.remote_tick == Tick::new(0) {
            self.remote_known = initial_known(self.window);
        }
        netlog!(
            self.log,
            LogLevel::Message,
            Component::Engine,
            "Input delay set to {} ({} inputs per frame)",
            self.window.delay(),
            self.window.buffer_size()
        );
    }

    /// Enables or disables rollback.
    pub fn set_rollbacks(&mut self, enabled: bool) {
        if enabled {
            netlog!(self.log, LogLevel::Message, Component::Engine, "Network rollbacks enabled");
        } else {
            netlog!(self.log, LogLevel::Message, Component::Engine, "Network rollbacks disabled");
        }
        self.rollbacks = enabled;
    }

    /// Requests a resync: updates hold until the peer waits too.
    pub fn wait(&mut self) {
        self.wait = true;
    }

    /// Removes and returns every queued packet, oldest first.
    pub fn take_outbox(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.outbox)
    }

    /// Packets queued and not yet taken.
    #[must_use]
    pub fn outbox(&self) -> &[Packet] {
        &self.outbox
    }

    /// This peer's role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// The input layout in use.
    #[must_use]
    pub const fn window(&self) -> InputWindow {
        self.window
    }

    /// The input rings.
    #[must_use]
    pub const fn store(&self) -> &InputStore {
        &self.store
    }

    /// Last simulated tick.
    #[must_use]
    pub const fn local_tick(&self) -> Tick {
        self.local_tick
    }

    /// Newest tick accepted from the peer.
    #[must_use]
    pub const fn remote_tick(&self) -> Tick {
        self.remote_tick
    }

    /// Last tick with a stored common state.
    #[must_use]
    pub const fn rollback_tick(&self) -> Tick {
        self.rollback_tick
    }

    /// `local_tick - remote_tick` at the last accepted frame.
    #[must_use]
    pub const fn tick_delta(&self) -> i32 {
        self.tick_delta
    }

    /// Whether we are within one tick of tolerance of the peer's pace.
    #[must_use]
    pub const fn is_remote_synced(&self) -> bool {
        self.remote_synced
    }

    /// `false` once a checksum mismatch has been seen.
    #[must_use]
    pub const fn state_is_synced(&self) -> bool {
        self.state_synced
    }

    /// Whether stop-sync mode is active.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether a resync wait is pending.
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        self.wait
    }

    /// Whether rollback is enabled.
    #[must_use]
    pub const fn rollbacks_enabled(&self) -> bool {
        self.rollbacks
    }

    /// The id the next frame packet will carry.
    #[must_use]
    pub const fn next_packet_id(&self) -> u32 {
        self.packet_id
    }

    /// The newest accepted frame packet id.
    #[must_use]
    pub const fn last_packet_id(&self) -> u32 {
        self.last_packet_id
    }

    /// Round-trip estimate.
    #[must_use]
    pub const fn ping(&self) -> &PingEstimator {
        &self.ping
    }

    /// Rollback and frame counters.
    #[must_use]
    pub const fn counters(&self) -> EngineCounters {
        self.counters
    }

    /// Fills the engine's share of a stats snapshot.
    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            ping_ms: self.ping.ping_ms(),
            local_tick: self.local_tick,
            remote_tick: self.remote_tick,
            rollback_tick: self.rollback_tick,
            tick_delta: self.tick_delta,
            remote_synced: self.remote_synced,
            state_synced: self.state_synced,
            waits: self.counters.waits,
            rollbacks: self.counters.rollbacks,
            frames_accepted: self.counters.frames_accepted,
            frames_rejected: self.counters.frames_rejected,
            ..NetworkStats::default()
        }
    }
}

/// Remote input below the delay is never sent and reads as zero.
fn initial_known(window: InputWindow) -> Tick {
    Tick::new(window.delay_ticks() - 1)
}

/// Reads `tick` from `ring`, reporting a window breach and falling back to zero.
fn read_ring<T: Copy + Default>(
    log: &dyn LogSink,
    ring: &TickRing<T>,
    tick: Tick,
    what: &str,
) -> T {
    match ring.get(tick) {
        Ok(value) => value,
        Err(err) => {
            netlog!(log, LogLevel::Error, Component::Engine, "Reading {}: {}", what, err);
            T::default()
        },
    }
}

/// Checks that `game` replays deterministically.
///
/// Stores, steps with `(p1, p2)`, fingerprints, restores and steps again.
/// Returns `true` if the second fingerprint differs, which means a
/// rollback would diverge. No network traffic is involved.
pub fn test_rollback<G: GameCallbacks + ?Sized>(game: &mut G, p1: Input, p2: Input) -> bool {
    game.store();
    game.update(p1, p2);
    let first = game.checksum();
    game.restore();
    game.update(p1, p2);
    first != game.checksum()
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

    #[derive(Debug, Default)]
    struct Tally {
        sum: i64,
        steps: u32,
        saved: (i64, u32),
        updates: Vec<(Input, Input)>,
        stores: u32,
        restores: u32,
    }

    impl GameCallbacks for Tally {
        fn update(&mut self, local: Input, remote: Input) {
            self.sum = self
                .sum
                .wrapping_mul(31)
                .wrapping_add(i64::from(local) * 7 + i64::from(remote));
            self.steps += 1;
            self.updates.push((local, remote));
        }

        fn store(&mut self) {
            self.saved = (self.sum, self.steps);
            self.stores += 1;
        }

        fn restore(&mut self) {
            (self.sum, self.steps) = self.saved;
            self.restores += 1;
        }

        fn checksum(&mut self) -> Checksum {
            checksum_of(&(self.sum, self.steps))
        }
    }

    fn engine(role: Role) -> (EngineState, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        (EngineState::new(role, 2, true, sink.clone()), sink)
    }

    fn frame_packet(role: Role, tick: i32, packet_id: u32, input: Input) -> FramePacket {
        FramePacket {
            role,
            tick: Tick::new(tick),
            inputs: std::iter::repeat(input).take(9).collect(),
            checksum: 0,
            packet_id,
            timestamp: 1_000,
            tick_delta: 0,
        }
    }

    fn frame_from(role: Role, tick: i32, packet_id: u32, input: Input) -> Packet {
        Packet::Frame(frame_packet(role, tick, packet_id, input))
    }

    fn frames(outbox: &[Packet]) -> Vec<&FramePacket> {
        outbox
            .iter()
            .filter_map(|p| match p {
                Packet::Frame(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn fresh_engine_initial_values() {
        let (engine, _) = engine(Role::Host);
        assert_eq!(engine.local_tick(), Tick::NULL);
        assert_eq!(engine.rollback_tick(), Tick::NULL);
        assert_eq!(engine.remote_tick(), Tick::new(0));
        assert_eq!(engine.next_packet_id(), 1);
        assert_eq!(engine.last_packet_id(), 0);
        assert!(engine.is_remote_synced());
        assert!(engine.state_is_synced());
        assert_eq!(engine.window().buffer_size(), 9);
    }

    #[test]
    fn first_update_advances_confirms_and_sends_frame() {
        let (mut engine, _) = engine(Role::Host);
        let mut game = Tally::default();
        let outcome = engine.update(&mut game, 5, 100);
        assert_eq!(outcome, TickOutcome::Advanced { rolled_back: false });
        assert_eq!(engine.local_tick(), Tick::new(0));
        // Remote input for tick 0 is known to be zero, so the tick is confirmed.
        assert_eq!(engine.rollback_tick(), Tick::new(0));
        assert_eq!(game.updates, vec![(0, 0)]);
        assert!(engine.store().checksums().holds(Tick::new(0)));

        let outbox = engine.take_outbox();
        let sent = frames(&outbox);
        assert_eq!(sent.len(), 1);
        let frame = sent[0];
        assert_eq!(frame.tick, Tick::new(0));
        assert_eq!(frame.packet_id, 1);
        assert_eq!(frame.timestamp, 100);
        assert_eq!(frame.inputs.as_slice(), &[0, 0, 0, 0, 0, 0, 0, 0, 5]);
        assert!(engine.outbox().is_empty());
    }

    #[test]
    fn local_input_is_applied_after_the_delay() {
        let (mut engine, _) = engine(Role::Host);
        let mut game = Tally::default();
        for input in [1, 2, 3] {
            engine.update(&mut game, input, 0);
        }
        let locals: Vec<Input> = game.updates.iter().map(|(l, _)| *l).collect();
        assert_eq!(locals, vec![0, 0, 1]);
    }

    #[test]
    fn local_tick_never_exceeds_rollback_window() {
        let (mut engine, _) = engine(Role::Host);
        let mut game = Tally::default();
        for _ in 0..40 {
            engine.update(&mut game, 1, 0);
            assert!(engine.local_tick() - engine.rollback_tick() <= MAX_ROLLBACK);
        }
        assert_eq!(engine.local_tick() - engine.rollback_tick(), MAX_ROLLBACK);
        assert!(engine.counters().waits > 0);
    }

    #[test]
    fn stall_requests_frame_after_known_remote_input() {
        let (mut engine, _) = engine(Role::Client);
        let mut game = Tally::default();
        let mut last = TickOutcome::Waiting;
        for _ in 0..18 {
            last = engine.update(&mut game, 1, 0);
        }
        assert_eq!(last, TickOutcome::Stalled { rolled_back: false });
        let outbox = engine.take_outbox();
        let request = outbox
            .iter()
            .rev()
            .find(|p| matches!(p, Packet::RetransmitRequest { .. }))
            .unwrap();
        // Remote input is known up to tick 1; a frame at tick 8 carries 2..=10.
        assert_eq!(
            request,
            &Packet::RetransmitRequest {
                role: Role::Client,
                tick: Tick::new(8),
            }
        );
        assert!(engine.is_remote_synced());
    }

    #[test]
    fn accepted_frame_fills_remote_ring_and_triggers_rollback() {
        let (mut engine, _) = engine(Role::Host);
        let mut game = Tally::default();
        for _ in 0..6 {
            engine.update(&mut game, 1, 0);
        }
        assert_eq!(engine.rollback_tick(), Tick::new(1));

        engine.handle_packet(frame_from(Role::Client, 4, 1, 7), 0);
        assert_eq!(engine.remote_tick(), Tick::new(4));
        assert_eq!(engine.last_packet_id(), 1);
        // Frame at tick 4 carries ticks -2..=6.
        assert_eq!(engine.store().remote().get(Tick::new(0)).unwrap(), 7);
        assert_eq!(engine.store().remote().get(Tick::new(6)).unwrap(), 7);
        assert_eq!(engine.tick_delta(), 1);

        let outcome = engine.update(&mut game, 1, 0);
        assert_eq!(outcome, TickOutcome::Advanced { rolled_back: true });
        // Ceiling is min(local 5, known 6) = 5; tick 6 is still a prediction.
        assert_eq!(engine.rollback_tick(), Tick::new(5));
        assert_eq!(engine.local_tick(), Tick::new(6));
        assert_eq!(game.restores, 1);
        assert_eq!(engine.counters().rollbacks, 1);
    }

    #[test]
    fn every_frame_gets_a_ping_response() {
        let (mut engine, _) = engine(Role::Host);
        engine.handle_packet(frame_from(Role::Host, 3, 5, 0), 0);
        engine.handle_packet(frame_from(Role::Client, 50, 6, 0), 0);
        let outbox = engine.take_outbox();
        assert_eq!(outbox.len(), 2);
        assert!(outbox.iter().all(|p| matches!(
            p,
            Packet::PingResponse {
                role: Role::Host,
                timestamp: 1_000
            }
        )));
        // Own-role frame ignored; future frame rejected.
        assert_eq!(engine.remote_tick(), Tick::new(0));
        assert_eq!(engine.counters().frames_rejected, 1);
    }

    #[test]
    fn stale_packet_id_is_rejected() {
        let (mut engine, sink) = engine(Role::Host);
        engine.handle_packet(frame_from(Role::Client, 2, 10, 4), 0);
        assert_eq!(engine.remote_tick(), Tick::new(2));
        engine.handle_packet(frame_from(Role::Client, 3, 10, 9), 0);
        assert_eq!(engine.remote_tick(), Tick::new(2));
        assert_eq!(engine.store().remote().get(Tick::new(3)).unwrap(), 4);
        engine.handle_packet(frame_from(Role::Client, 1, 11, 9), 0);
        assert_eq!(engine.remote_tick(), Tick::new(2));
        assert!(sink.contains("old tick 1"));
    }

    #[test]
    fn remote_synced_follows_tick_deltas() {
        let (mut engine, _) = engine(Role::Host);
        let mut game = Tally::default();
        for _ in 0..8 {
            engine.update(&mut game, 0, 0);
        }
        // local 7, remote 2: we are 5 ahead, the peer reports 0.
        engine.handle_packet(frame_from(Role::Client, 2, 1, 0), 0);
        assert_eq!(engine.tick_delta(), 5);
        assert!(!engine.is_remote_synced());
        assert!(matches!(
            engine.update(&mut game, 0, 0),
            TickOutcome::Stalled { .. }
        ));
        assert!(engine.is_remote_synced());
    }

    #[test]
    fn unconfirmed_checksum_never_flips_desync() {
        let (mut engine, _) = engine(Role::Host);
        // Remote tick 8 compares tick -7, which nobody confirms.
        let mut frame = frame_packet(Role::Client, 8, 1, 0);
        frame.checksum = 12345;
        engine.handle_packet(Packet::Frame(frame), 0);
        assert!(engine.state_is_synced());
    }

    #[test]
    fn checksum_mismatch_on_confirmed_tick_flags_desync() {
        let (mut engine, sink) = engine(Role::Host);
        let mut game = Tally::default();
        // Feed frames carrying our own checksums so that every tick confirms.
        for tick in 1..=20 {
            let mut frame = frame_packet(Role::Client, tick, tick as u32, 0);
            let compared = Tick::new(tick) - MAX_ROLLBACK;
            if engine.store().checksums().holds(compared) {
                frame.checksum = engine.store().checksums().get(compared).unwrap();
            }
            engine.handle_packet(Packet::Frame(frame), 0);
            engine.update(&mut game, 0, 0);
        }
        assert!(engine.state_is_synced());
        assert!(engine.store().checksums().holds(Tick::new(6)));
        let mut frame = frame_packet(Role::Client, 21, 21, 0);
        frame.checksum = engine.store().checksums().get(Tick::new(6)).unwrap() ^ 1;
        engine.handle_packet(Packet::Frame(frame), 0);
        assert!(!engine.state_is_synced());
        assert!(sink.contains("Desync at tick 6"));

        engine.force_synced();
        assert!(engine.state_is_synced());
    }

    #[test]
    fn retransmit_request_is_capped_at_local_tick() {
        let (mut engine, _) = engine(Role::Host);
        let mut game = Tally::default();
        for _ in 0..4 {
            engine.update(&mut game, 0, 0);
        }
        engine.take_outbox();
        engine.handle_packet(
            Packet::RetransmitRequest {
                role: Role::Client,
                tick: Tick::new(100),
            },
            77,
        );
        let outbox = engine.take_outbox();
        let sent = frames(&outbox);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].tick, Tick::new(3));
        assert_eq!(sent[0].timestamp, 77);
    }

    #[test]
    fn out_of_range_retransmit_request_is_ignored() {
        let (mut engine, sink) = engine(Role::Host);
        let mut game = Tally::default();
        for _ in 0..4 {
            engine.update(&mut game, 0, 0);
        }
        engine.take_outbox();
        engine.handle_packet(
            Packet::RetransmitRequest {
                role: Role::Client,
                tick: Tick::new(i32::MIN),
            },
            0,
        );
        assert!(engine.take_outbox().is_empty());
        assert!(sink.contains("Ignoring retransmit request"));

        engine.handle_packet(
            Packet::RetransmitRequest {
                role: Role::Client,
                tick: Tick::new(i32::MAX),
            },
            0,
        );
        let outbox = engine.take_outbox();
        assert_eq!(frames(&outbox)[0].tick, Tick::new(3));
    }

    #[test]
    fn extreme_tick_delta_does_not_overflow() {
        let (mut engine, _) = engine(Role::Host);
        let mut frame = frame_packet(Role::Client, 1, 1, 0);
        frame.tick_delta = i32::MAX;
        engine.handle_packet(Packet::Frame(frame), 0);
        assert_eq!(engine.remote_tick(), Tick::new(1));
        assert!(engine.is_remote_synced());

        let mut frame = frame_packet(Role::Client, 2, 2, 0);
        frame.tick_delta = i32::MIN;
        engine.handle_packet(Packet::Frame(frame), 0);
        assert_eq!(engine.remote_tick(), Tick::new(2));
    }

    #[test]
    fn frame_skipping_known_input_is_rejected_and_resent() {
        let (mut engine, sink) = engine(Role::Host);
        let mut game = Tally::default();
        for _ in 0..10 {
            engine.update(&mut game, 0, 0);
        }
        engine.handle_packet(frame_from(Role::Client, 1, 1, 3), 0);
        // Known up to tick 3. A frame at tick 11 starts at tick 5 and
        // would leave tick 4 unwritten.
        engine.update(&mut game, 0, 0);
        assert_eq!(engine.rollback_tick(), Tick::new(3));
        engine.take_outbox();

        engine.handle_packet(frame_from(Role::Client, 11, 2, 5), 0);
        assert_eq!(engine.remote_tick(), Tick::new(1));
        assert_eq!(engine.last_packet_id(), 1);
        assert!(!engine.has_input(Tick::new(4)));
        assert!(sink.contains("skips remote input after tick 3"));
        let outbox = engine.take_outbox();
        assert!(outbox.contains(&Packet::RetransmitRequest {
            role: Role::Host,
            tick: Tick::new(10),
        }));

        // The resent frame at tick 10 starts exactly at tick 4.
        engine.handle_packet(frame_from(Role::Client, 10, 3, 5), 0);
        assert_eq!(engine.remote_tick(), Tick::new(10));
        assert!(engine.has_input(Tick::new(11)));
        assert_eq!(engine.store().remote().get(Tick::new(3)).unwrap(), 3);
        assert_eq!(engine.store().remote().get(Tick::new(4)).unwrap(), 5);
    }

    #[test]
    fn packet_ids_strictly_increase() {
        let (mut engine, _) = engine(Role::Host);
        let mut game = Tally::default();
        let mut ids = Vec::new();
        for _ in 0..30 {
            engine.update(&mut game, 0, 0);
            ids.extend(frames(&engine.take_outbox()).iter().map(|f| f.packet_id));
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ids[0], 1);
    }

    #[test]
    fn resync_wait_holds_until_peer_waits() {
        let (mut engine, _) = engine(Role::Host);
        let mut game = Tally::default();
        for _ in 0..5 {
            engine.update(&mut game, 3, 0);
        }
        engine.wait();
        assert_eq!(engine.update(&mut game, 3, 0), TickOutcome::Waiting);
        assert!(engine
            .take_outbox()
            .iter()
            .any(|p| matches!(p, Packet::Wait { .. })));
        let steps = game.steps;

        engine.handle_packet(
            Packet::Wait {
                role: Role::Client,
                tick: Tick::new(9),
            },
            0,
        );
        let outcome = engine.update(&mut game, 3, 0);
        assert_eq!(outcome, TickOutcome::Advanced { rolled_back: false });
        assert_eq!(engine.local_tick(), Tick::new(0));
        assert_eq!(engine.rollback_tick(), Tick::new(0));
        assert!(!engine.is_waiting());
        assert_eq!(game.steps, steps + 1);
    }

    #[test]
    fn peer_wait_without_our_wait_is_ignored() {
        let (mut engine, _) = engine(Role::Host);
        engine.handle_packet(
            Packet::Wait {
                role: Role::Client,
                tick: Tick::new(0),
            },
            0,
        );
        engine.wait();
        let mut game = Tally::default();
        assert_eq!(engine.update(&mut game, 0, 0), TickOutcome::Waiting);
    }

    #[test]
    fn stop_sync_pauses_and_force_synced_resumes() {
        let (mut engine, _) = engine(Role::Host);
        let mut game = Tally::default();
        for _ in 0..3 {
            engine.update(&mut game, 9, 0);
        }
        engine.take_outbox();
        engine.stop_sync();
        assert_eq!(engine.local_tick(), Tick::NULL);
        assert!(engine.is_paused());

        assert_eq!(engine.update(&mut game, 9, 0), TickOutcome::Paused);
        assert_eq!(game.updates.last(), Some(&(0, 0)));
        assert!(engine.take_outbox().is_empty());

        // Frames are ignored while paused but still answered.
        engine.handle_packet(frame_from(Role::Client, 2, 1, 4), 0);
        assert_eq!(engine.remote_tick(), Tick::new(0));
        assert_eq!(engine.take_outbox().len(), 1);

        engine.force_synced();
        assert!(matches!(
            engine.update(&mut game, 9, 0),
            TickOutcome::Advanced { .. }
        ));
        assert_eq!(engine.local_tick(), Tick::new(0));
    }

    #[test]
    fn no_rollback_mode_waits_for_input() {
        let sink = Arc::new(CollectingSink::new());
        let mut engine = EngineState::new(Role::Host, 2, false, sink);
        let mut game = Tally::default();
        for _ in 0..5 {
            engine.update(&mut game, 0, 0);
        }
        // Remote input is known up to tick delay - 1 = 1.
        assert_eq!(engine.local_tick(), Tick::new(1));
        assert_eq!(game.restores, 0);
    }

    #[test]
    fn set_input_delay_reshapes_window_and_logs() {
        let (mut engine, sink) = engine(Role::Host);
        engine.set_input_delay(3);
        assert_eq!(engine.window().buffer_size(), 11);
        assert!(sink.contains("Input delay set to 3"));
        engine.set_input_delay(40);
        assert_eq!(engine.window().delay(), 7);
    }

    #[test]
    fn ping_response_updates_estimate() {
        let (mut engine, _) = engine(Role::Host);
        engine.handle_packet(
            Packet::PingResponse {
                role: Role::Client,
                timestamp: 1_000,
            },
            1_200,
        );
        assert_eq!(engine.ping().last_rtt_ms(), 200);
        assert!((19..=20).contains(&engine.ping().ping_ms()));
    }

    #[test]
    fn disconnect_packet_ends_dispatch() {
        let (mut engine, _) = engine(Role::Client);
        assert_eq!(engine.handle_packet(Packet::Disconnect, 0), Dispatch::Disconnect);
        assert_eq!(engine.handle_packet(Packet::Connect, 0), Dispatch::Continue);
    }

    #[test]
    fn test_rollback_detects_broken_restore() {
        let mut good = Tally::default();
        assert!(!test_rollback(&mut good, 3, 4));

        struct Forgetful(i64);
        impl GameCallbacks for Forgetful {
            fn update(&mut self, local: Input, remote: Input) {
                self.0 += i64::from(local + remote);
            }
            fn store(&mut self) {}
            fn restore(&mut self) {}
            fn checksum(&mut self) -> Checksum {
                self.0 as Checksum
            }
        }
        assert!(test_rollback(&mut Forgetful(0), 3, 4));
    }

    #[test]
    fn out_of_window_read_is_logged_not_fatal() {
        let (mut engine, sink) = engine(Role::Host);
        let mut game = Tally::default();
        for id in 1..=200u32 {
            let tick = engine.local_tick().as_i32() + 1;
            engine.handle_packet(frame_from(Role::Client, tick, id, 0), 0);
            engine.update(&mut game, 1, 0);
        }
        assert!(engine.local_tick() > Tick::new(100));
        engine.take_outbox();
        assert!(sink.records_at(LogLevel::Error).is_empty());

        // Tick 10's inputs were overwritten laps ago. The peer cannot ask
        // for it, but a direct build still has to degrade to zeros.
        engine.handle_packet(
            Packet::RetransmitRequest {
                role: Role::Client,
                tick: Tick::new(10),
            },
            0,
        );
        assert!(engine.take_outbox().is_empty());
        let frame = engine.build_frame(Tick::new(10), 0);
        assert!(frame.inputs.iter().all(|&input| input == 0));
        assert!(!sink.records_at(LogLevel::Error).is_empty());
    }
}
