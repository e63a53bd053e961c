//! Two engines in lockstep over an in-memory link.
//!
//! Every packet goes through the real codec. Loss follows a proptest
//! pattern, capped so that a frame gap never outruns the redundancy a
//! frame packet carries.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::Arc;

use proptest::prelude::*;
use shobu_rollback::__internal::{decode, encode, EngineState, TickOutcome};
use shobu_rollback::telemetry::{CollectingSink, LogLevel, NullSink};
use shobu_rollback::{Input, Role, Tick, MAX_ROLLBACK};

use crate::common::stubs::GameStub;

/// Consecutive simulated packets the link may drop before it must deliver.
const MAX_DROP_RUN: usize = 3;

/// Decides the fate of each simulated packet from a fixed pattern.
struct LossPattern {
    pattern: Vec<bool>,
    next: usize,
    run: usize,
}

impl LossPattern {
    fn new(pattern: Vec<bool>) -> Self {
        Self {
            pattern,
            next: 0,
            run: 0,
        }
    }

    fn lossless() -> Self {
        Self::new(Vec::new())
    }

    fn drops(&mut self) -> bool {
        let wanted = self.pattern.get(self.next).copied().unwrap_or(false);
        self.next += 1;
        if wanted && self.run < MAX_DROP_RUN {
            self.run += 1;
            true
        } else {
            self.run = 0;
            false
        }
    }
}

struct Side {
    engine: EngineState,
    game: GameStub,
}

impl Side {
    fn new(role: Role, delay: u8, rollbacks: bool) -> Self {
        let game = if role.is_host() {
            GameStub::host()
        } else {
            GameStub::client()
        };
        Self {
            engine: EngineState::new(role, delay, rollbacks, Arc::new(NullSink)),
            game,
        }
    }

    fn tick(&mut self, input: Input, now_ms: u32) -> TickOutcome {
        self.engine.update(&mut self.game, input, now_ms)
    }
}

fn deliver(from: &mut Side, to: &mut Side, loss: &mut LossPattern, now_ms: u32) {
    for packet in from.engine.take_outbox() {
        if packet.is_simulated() && loss.drops() {
            continue;
        }
        let bytes = encode(&packet).unwrap();
        let decoded = decode(&bytes, to.engine.window().buffer_size()).unwrap();
        to.engine.handle_packet(decoded, now_ms);
    }
}

/// Runs `ticks` rounds and returns both sides.
fn play(ticks: u32, delay: u8, rollbacks: bool, loss: &mut LossPattern) -> (Side, Side) {
    let mut host = Side::new(Role::Host, delay, rollbacks);
    let mut client = Side::new(Role::Client, delay, rollbacks);
    for round in 0..ticks {
        let now = round * 16;
        host.tick((round % 5) as Input, now);
        deliver(&mut host, &mut client, loss, now);
        client.tick((round % 3) as Input + 10, now);
        deliver(&mut client, &mut host, loss, now);
    }
    (host, client)
}

/// Confirmed checksums agree for every tick both sides still hold.
fn assert_confirmed_agree(host: &Side, client: &Side) {
    let last = host.engine.rollback_tick().min(client.engine.rollback_tick());
    let host_sums = host.engine.store().checksums();
    let client_sums = client.engine.store().checksums();
    let mut compared = 0;
    for t in 0..=last.as_i32() {
        let tick = Tick::new(t);
        if host_sums.holds(tick) && client_sums.holds(tick) {
            assert_eq!(
                host_sums.get(tick).unwrap(),
                client_sums.get(tick).unwrap(),
                "checksums differ at tick {t}"
            );
            compared += 1;
        }
    }
    assert!(compared > 0, "no confirmed tick in common");
}

#[test]
fn lossless_lockstep_confirms_every_tick() {
    let (host, client) = play(200, 2, true, &mut LossPattern::lossless());
    assert!(host.engine.state_is_synced());
    assert!(client.engine.state_is_synced());
    assert!(host.engine.local_tick() >= Tick::new(100));
    assert!(host.engine.local_tick() - host.engine.rollback_tick() <= MAX_ROLLBACK);
    assert_confirmed_agree(&host, &client);
    assert!(host.engine.ping().samples() > 0);
}

#[test]
fn stall_mode_lockstep_never_rolls_back() {
    let (host, client) = play(120, 3, false, &mut LossPattern::lossless());
    assert_eq!(host.engine.counters().rollbacks, 0);
    assert_eq!(client.engine.counters().rollbacks, 0);
    assert_eq!(host.game.restores, 0);
    assert!(host.engine.state_is_synced());
    assert_confirmed_agree(&host, &client);
}

#[test]
fn desync_is_reported_when_one_side_cheats() {
    let sink = Arc::new(CollectingSink::new());
    let mut host = Side::new(Role::Host, 2, true);
    let mut client = Side {
        engine: EngineState::new(Role::Client, 2, true, sink.clone()),
        game: GameStub::client(),
    };
    let mut loss = LossPattern::lossless();
    for round in 0..80u32 {
        host.tick(1, round);
        deliver(&mut host, &mut client, &mut loss, round);
        if round == 30 {
            client.game.gs.value += 1;
            client.game.saved.value += 1;
        }
        client.tick(2, round);
        deliver(&mut client, &mut host, &mut loss, round);
    }
    assert!(!client.engine.state_is_synced());
    assert!(!host.engine.state_is_synced());
    assert!(!sink.records_at(LogLevel::Message).is_empty());
}

#[test]
fn bursty_loss_with_short_delay_confirms_true_inputs() {
    let pattern: Vec<bool> = (0..2_000).map(|i| i % 5 != 4).collect();
    let (host, client) = play(150, 1, true, &mut LossPattern::new(pattern));
    assert!(host.engine.state_is_synced());
    assert!(client.engine.state_is_synced());
    assert_confirmed_agree(&host, &client);
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

    #[test]
    fn lossy_lockstep_stays_synced(
        pattern in prop::collection::vec(any::<bool>(), 0..2_000),
        delay in 0u8..=7,
    ) {
        let mut loss = LossPattern::new(pattern);
        let (host, client) = play(150, delay, true, &mut loss);
        prop_assert!(host.engine.state_is_synced());
        prop_assert!(client.engine.state_is_synced());
        prop_assert!(host.engine.local_tick() - host.engine.rollback_tick() <= MAX_ROLLBACK);
        prop_assert!(client.engine.local_tick() - client.engine.rollback_tick() <= MAX_ROLLBACK);
        assert_confirmed_agree(&host, &client);
    }
}
