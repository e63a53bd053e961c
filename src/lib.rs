//! # Shobu Rollback
//!
//! A two-player, peer-to-peer rollback netcode engine over UDP.
//!
//! Each side runs its own copy of the game simulation. Local input is held
//! back by a small input delay, shipped to the peer in redundant frame
//! packets, and when remote input arrives late the engine restores the last
//! state both sides agree on and replays the buffered inputs. Checksums of
//! confirmed ticks are exchanged so that a silent divergence between the two
//! simulations is detected and surfaced instead of going unnoticed.
//!
//! The game plugs in through [`GameCallbacks`]: four deterministic methods to
//! step, snapshot, restore and fingerprint its state. Everything else
//! (handshake, input buffering, retransmission, ping estimation, rollback)
//! lives in [`NetplaySession`].
//!
//! ```no_run
//! use shobu_rollback::{Checksum, GameCallbacks, Input, NetplaySession, SessionConfig};
//!
//! #[derive(Default)]
//! struct Counter { value: i64, saved: i64 }
//!
//! impl GameCallbacks for Counter {
//!     fn update(&mut self, local: Input, remote: Input) {
//!         self.value += i64::from(local) - i64::from(remote);
//!     }
//!     fn store(&mut self) { self.saved = self.value; }
//!     fn restore(&mut self) { self.value = self.saved; }
//!     fn checksum(&mut self) -> Checksum { self.value as Checksum }
//! }
//!
//! # fn main() -> Result<(), shobu_rollback::NetplayError> {
//! let mut host = NetplaySession::host(8888, Counter::default(), SessionConfig::default())?;
//! host.set_input_delay(3);
//! host.wait_for_client()?;
//! for _ in 0..600 {
//!     host.update(1);
//!     std::thread::sleep(std::time::Duration::from_millis(16));
//! }
//! host.disconnect();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use config::{LinkSimulationConfig, NetworkConfig, SessionConfig};
pub use connection::HandshakeAbort;
pub use error::NetplayError;
pub use input_store::{InputStore, InputWindow, TickRing};
pub use network::codec::CodecError;
pub use network::messages::{FramePacket, Packet, Role};
pub use network::network_stats::NetworkStats;
pub use ping::PingEstimator;
pub use session::NetplaySession;

#[doc(hidden)]
pub mod config;
#[doc(hidden)]
pub mod connection;
#[doc(hidden)]
pub mod engine;
#[doc(hidden)]
pub mod error;
pub mod hash;
#[doc(hidden)]
pub mod input_store;
#[doc(hidden)]
pub mod listener;
#[doc(hidden)]
pub mod ping;
/// Internal random number generator based on PCG32.
///
/// Drives the packet-loss simulator; seedable for reproducible tests.
pub mod rng;
#[doc(hidden)]
pub mod session;
pub mod telemetry;
#[doc(hidden)]
pub mod network {
    /// Fixed-offset binary layout of every wire packet.
    pub mod codec;
    /// Loss and latency simulation for outbound packets.
    pub mod link_sim;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod network_stats;
    #[doc(hidden)]
    pub mod udp_socket;
}

/// Internal module exposing implementation details for testing.
///
/// **This module is NOT part of the public API.** It exists so that the
/// integration tests can drive the rollback state machine and the peer link
/// directly, without going through sockets and background threads.
#[doc(hidden)]
pub mod __internal {
    pub use crate::engine::{EngineState, TickOutcome};
    pub use crate::network::codec::{decode, encode, FrameLayout};
    pub use crate::network::link_sim::{LinkSimulator, Route};
    pub use crate::network::udp_socket::PeerSocket;
}

// #############
// # CONSTANTS #
// #############

/// Number of slots in each input ring. Ticks older than this are lost.
pub const INPUT_CAPACITY: usize = 60;

/// Largest input delay a session accepts; larger requests are clamped.
pub const MAX_INPUT_DELAY: u8 = 7;

/// Delay used until the application or the handshake sets one.
pub const DEFAULT_INPUT_DELAY: u8 = 2;

/// Extra past ticks carried in every frame packet on top of `2 * delay`.
pub const OLD_FRAMES: usize = 5;

/// How far the local tick may run ahead of the last confirmed tick.
///
/// Also the distance behind the sender's tick of the checksum carried in a
/// frame packet, which guarantees both sides confirmed that tick.
pub const MAX_ROLLBACK: i32 = 15;

/// Copies sent of every frame, ping response and handshake ack.
pub const SEND_REPEATS: usize = 2;

/// Largest number of inputs a frame packet can carry.
pub const MAX_BUFFER_SIZE: usize = OLD_FRAMES + 2 * MAX_INPUT_DELAY as usize;

/// Default UDP port of the matchmaking server.
pub const MATCHMAKER_PORT: u16 = 60417;

/// An opaque per-tick input value. Its meaning belongs to the game.
pub type Input = i32;

/// A cheap fingerprint of game state, compared between peers.
pub type Checksum = i32;

/// Internally, -1 represents "no tick yet".
pub const NULL_TICK: i32 = -1;

/// One discrete simulation step.
///
/// Each peer counts its own ticks. A fresh engine sits at [`Tick::NULL`]
/// (-1) and advances to tick 0 on its first update.
///
/// # Examples
///
/// ```
/// use shobu_rollback::Tick;
///
/// let tick = Tick::new(3);
/// assert_eq!((tick + 2).as_i32(), 5);
/// assert_eq!(Tick::new(10) - Tick::new(4), 6);
/// assert!(Tick::NULL.is_null());
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Tick(i32);

impl Tick {
    /// The "no tick yet" value.
    pub const NULL: Tick = Tick(NULL_TICK);

    /// Wraps a raw tick number.
    #[inline]
    #[must_use]
    pub const fn new(tick: i32) -> Self {
        Tick(tick)
    }

    /// Returns the raw tick number.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` for [`Tick::NULL`].
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_TICK
    }

    /// Returns `true` for ticks at or after zero.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Index of this tick's slot in a ring of `capacity` slots.
    ///
    /// Negative ticks wrap from the end, so tick -1 lands in the last slot.
    #[inline]
    #[must_use]
    pub const fn slot(self, capacity: usize) -> usize {
        self.0.rem_euclid(capacity as i32) as usize
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_TICK")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// Ticks arrive from the wire, so arithmetic saturates instead of overflowing.
impl std::ops::Add<i32> for Tick {
    type Output = Tick;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Tick(self.0.saturating_add(rhs))
    }
}

impl std::ops::AddAssign<i32> for Tick {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 = self.0.saturating_add(rhs);
    }
}

impl std::ops::Sub<i32> for Tick {
    type Output = Tick;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Tick(self.0.saturating_sub(rhs))
    }
}

impl std::ops::Sub<Tick> for Tick {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Tick) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

impl From<i32> for Tick {
    #[inline]
    fn from(value: i32) -> Self {
        Tick(value)
    }
}

impl From<Tick> for i32 {
    #[inline]
    fn from(tick: Tick) -> Self {
        tick.0
    }
}

impl PartialEq<i32> for Tick {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i32> for Tick {
    #[inline]
    fn partial_cmp(&self, other: &i32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// The game side of the engine.
///
/// The engine calls these from the thread that drives
/// [`NetplaySession::update`]. All four must be deterministic: given the same
/// stored state and the same input pairs, `update` must always produce the
/// same state and `checksum` the same value. Otherwise rollback replays
/// diverge and every peer reports a desync.
///
/// `local` and `remote` are always from the caller's point of view; the host
/// and the client each see their own player as `local`.
pub trait GameCallbacks {
    /// Advances the simulation by one tick.
    fn update(&mut self, local: Input, remote: Input);

    /// Snapshots the current state, replacing the previous snapshot.
    fn store(&mut self);

    /// Reverts to the last snapshot taken by [`store`](Self::store).
    fn restore(&mut self);

    /// Returns a fingerprint of the current state.
    fn checksum(&mut self) -> Checksum;
}

impl<G: GameCallbacks + ?Sized> GameCallbacks for Box<G> {
    fn update(&mut self, local: Input, remote: Input) {
        (**self).update(local, remote);
    }

    fn store(&mut self) {
        (**self).store();
    }

    fn restore(&mut self) {
        (**self).restore();
    }

    fn checksum(&mut self) -> Checksum {
        (**self).checksum()
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

    #[test]
    fn tick_arithmetic() {
        let t = Tick::new(7);
        assert_eq!(t + 3, Tick::new(10));
        assert_eq!(t - 8, Tick::NULL);
        assert_eq!(Tick::new(20) - t, 13);
        let mut m = Tick::NULL;
        m += 1;
        assert_eq!(m, 0);
    }

    #[test]
    fn tick_arithmetic_saturates_at_bounds() {
        assert_eq!(Tick::new(i32::MIN) - MAX_ROLLBACK, Tick::new(i32::MIN));
        assert_eq!(Tick::new(i32::MAX) + 1, Tick::new(i32::MAX));
        assert_eq!(Tick::new(i32::MAX) - Tick::new(-5), i32::MAX);
        let mut m = Tick::new(i32::MAX - 1);
        m += 10;
        assert_eq!(m, Tick::new(i32::MAX));
    }

    #[test]
    fn tick_slot_wraps_negative_ticks() {
        assert_eq!(Tick::new(0).slot(60), 0);
        assert_eq!(Tick::new(61).slot(60), 1);
        assert_eq!(Tick::new(-1).slot(60), 59);
        assert_eq!(Tick::new(-60).slot(60), 0);
    }

    #[test]
    fn tick_display() {
        assert_eq!(Tick::NULL.to_string(), "NULL_TICK");
        assert_eq!(Tick::new(42).to_string(), "42");
    }

    #[test]
    fn max_buffer_size_matches_largest_delay() {
        assert_eq!(MAX_BUFFER_SIZE, 19);
    }
}
