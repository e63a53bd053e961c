//! Game stub implementations for integration tests.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::use_self
)]

use std::hash::Hash;

use shobu_rollback::hash::checksum_of;
use shobu_rollback::{Checksum, GameCallbacks, Input};

/// Game state: a tick counter and an accumulator that depends on every
/// input pair and on their order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StateStub {
    pub frame: i32,
    pub value: i64,
}

impl StateStub {
    fn advance(&mut self, p1: Input, p2: Input) {
        self.value = self
            .value
            .wrapping_mul(31)
            .wrapping_add(i64::from(p1) * 7 + i64::from(p2) * 13);
        self.frame += 1;
    }
}

/// A deterministic game: every callback is a pure function of the stored
/// state and the inputs.
///
/// The host plays player one, so both peers feed the same `(p1, p2)` pair
/// into the state and agree on its checksum.
#[derive(Debug, Default)]
pub struct GameStub {
    pub gs: StateStub,
    pub saved: StateStub,
    pub is_client: bool,
    pub updates: u64,
    pub restores: u64,
}

impl GameStub {
    #[allow(dead_code)]
    #[must_use]
    pub fn host() -> GameStub {
        GameStub::default()
    }

    #[allow(dead_code)]
    #[must_use]
    pub fn client() -> GameStub {
        GameStub {
            is_client: true,
            ..GameStub::default()
        }
    }
}

impl GameCallbacks for GameStub {
    fn update(&mut self, local: Input, remote: Input) {
        if self.is_client {
            self.gs.advance(remote, local);
        } else {
            self.gs.advance(local, remote);
        }
        self.updates += 1;
    }

    fn store(&mut self) {
        self.saved = self.gs;
    }

    fn restore(&mut self) {
        self.gs = self.saved;
        self.restores += 1;
    }

    fn checksum(&mut self) -> Checksum {
        checksum_of(&self.gs)
    }
}

/// A game whose `restore` does nothing, so a replay runs on top of the
/// already-advanced state.
#[derive(Debug, Default)]
pub struct BrokenRestoreStub {
    pub gs: StateStub,
}

impl GameCallbacks for BrokenRestoreStub {
    fn update(&mut self, local: Input, remote: Input) {
        self.gs.advance(local, remote);
    }

    fn store(&mut self) {}

    fn restore(&mut self) {}

    fn checksum(&mut self) -> Checksum {
        checksum_of(&self.gs)
    }
}

/// A game that only sees its own player, so two peers with different local
/// inputs end up with different checksums.
#[derive(Debug, Default)]
#[allow(dead_code)]
pub struct LocalOnlyStub {
    pub value: i64,
    pub saved: i64,
}

impl GameCallbacks for LocalOnlyStub {
    fn update(&mut self, local: Input, _remote: Input) {
        self.value = self.value.wrapping_mul(17).wrapping_add(i64::from(local));
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
