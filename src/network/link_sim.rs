//! [`LinkSimulator`] decides the fate of every simulated outbound datagram:
//! send it now, hold it for a number of flush cycles, or drop it.
//!
//! Only [`Packet::is_simulated`](crate::Packet::is_simulated) traffic (frames
//! and ping responses) is routed through here. The simulator owns no socket;
//! the peer link sends whatever [`route`](LinkSimulator::route) clears and
//! whatever [`flush_due`](LinkSimulator::flush_due) releases.
//!
//! ```
//! use shobu_rollback::__internal::{LinkSimulator, Route};
//! use shobu_rollback::LinkSimulationConfig;
//!
//! let mut sim = LinkSimulator::new(&LinkSimulationConfig::laggy().with_seed(7));
//! assert_eq!(sim.route(b"f..."), Route::Queued);
//! for _ in 0..4 {
//!     assert!(sim.flush_due().is_empty());
//! }
//! assert_eq!(sim.flush_due().len(), 1);
//! ```

use std::collections::VecDeque;

use serde::Serialize;

use crate::config::LinkSimulationConfig;
use crate::rng::{Pcg32, Rng, SeedableRng};

/// What happened to a datagram handed to [`LinkSimulator::route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Send it now.
    Send,
    /// Held in the delay queue; [`LinkSimulator::flush_due`] releases it later.
    Queued,
    /// Lost.
    Dropped,
}

/// An owned outbound datagram and the flush cycles it still has to wait.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DelayedPacket {
    bytes: Vec<u8>,
    timer: u32,
}

/// Counters for simulator decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkSimStats {
    /// Datagrams handed to `route`.
    pub routed: u64,
    /// Datagrams dropped.
    pub dropped: u64,
    /// Datagrams queued for later delivery.
    pub delayed: u64,
    /// Queued datagrams released by `flush_due`.
    pub released: u64,
}

/// Packet-loss and latency simulation for one link.
#[derive(Debug, Clone)]
pub struct LinkSimulator {
    loss_frequency: u32,
    packet_delay: u32,
    rng: Pcg32,
    queue: VecDeque<DelayedPacket>,
    stats: LinkSimStats,
}

impl LinkSimulator {
    /// Creates a simulator from `config`, seeding its RNG from
    /// `config.seed` or from entropy.
    pub fn new(config: &LinkSimulationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => Pcg32::seed_from_u64(seed),
            None => Pcg32::from_entropy(),
        };
        Self {
            loss_frequency: config.loss_frequency,
            packet_delay: config.packet_delay,
            rng,
            queue: VecDeque::new(),
            stats: LinkSimStats::default(),
        }
    }

    /// Drop one in every `frequency` sends on average. 0 disables loss;
    /// negative values leave the setting unchanged.
    pub fn set_loss_frequency(&mut self, frequency: i32) {
        if let Ok(frequency) = u32::try_from(frequency) {
            self.loss_frequency = frequency;
        }
    }

    /// Hold each send for `delay` flush cycles. Anything but a positive
    /// value disables the delay.
    pub fn set_packet_delay(&mut self, delay: i32) {
        self.packet_delay = u32::try_from(delay).unwrap_or(0);
    }

    /// Current loss frequency; 0 means off.
    #[must_use]
    pub const fn loss_frequency(&self) -> u32 {
        self.loss_frequency
    }

    /// Current delay in flush cycles; 0 means off.
    #[must_use]
    pub const fn packet_delay(&self) -> u32 {
        self.packet_delay
    }

    /// Returns `true` if any simulation is active.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.loss_frequency > 0 || self.packet_delay > 0
    }

    /// Decides the fate of `bytes`. Loss is rolled first; a survivor is
    /// queued when a delay is set.
    pub fn route(&mut self, bytes: &[u8]) -> Route {
        self.stats.routed += 1;
        if self.rng.one_in(self.loss_frequency) {
            self.stats.dropped += 1;
            return Route::Dropped;
        }
        if self.packet_delay > 0 {
            self.stats.delayed += 1;
            self.queue.push_back(DelayedPacket {
                bytes: bytes.to_vec(),
                timer: self.packet_delay,
            });
            return Route::Queued;
        }
        Route::Send
    }

    /// One flush cycle: entries still counting down tick once, entries
    /// already at zero are removed and returned in queue order.
    pub fn flush_due(&mut self) -> Vec<Vec<u8>> {
        let mut due = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.queue.len());
        for mut packet in self.queue.drain(..) {
            if packet.timer > 0 {
                packet.timer -= 1;
                waiting.push_back(packet);
            } else {
                due.push(packet.bytes);
            }
        }
        self.queue = waiting;
        self.stats.released += due.len() as u64;
        due
    }

    /// Datagrams still held.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Forgets every held datagram.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Counters since creation.
    #[must_use]
    pub const fn stats(&self) -> LinkSimStats {
        self.stats
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

    fn seeded(loss: u32, delay: u32) -> LinkSimulator {
        LinkSimulator::new(&LinkSimulationConfig {
            loss_frequency: loss,
            packet_delay: delay,
            seed: Some(42),
        })
    }

    #[test]
    fn passthrough_sends_everything() {
        let mut sim = seeded(0, 0);
        assert!(!sim.is_active());
        for _ in 0..100 {
            assert_eq!(sim.route(&[1, 2, 3]), Route::Send);
        }
        assert_eq!(sim.stats().dropped, 0);
    }

    #[test]
    fn loss_frequency_one_drops_everything() {
        let mut sim = seeded(1, 0);
        for _ in 0..10 {
            assert_eq!(sim.route(&[0]), Route::Dropped);
        }
        assert_eq!(sim.stats().dropped, 10);
    }

    #[test]
    fn loss_frequency_two_drops_about_half() {
        let mut sim = seeded(2, 0);
        let dropped = (0..2_000)
            .filter(|_| sim.route(&[0]) == Route::Dropped)
            .count();
        assert!((800..1_200).contains(&dropped), "dropped = {dropped}");
    }

    #[test]
    fn negative_loss_is_ignored() {
        let mut sim = seeded(3, 0);
        sim.set_loss_frequency(-1);
        assert_eq!(sim.loss_frequency(), 3);
        sim.set_loss_frequency(0);
        assert_eq!(sim.loss_frequency(), 0);
    }

    #[test]
    fn non_positive_delay_disables() {
        let mut sim = seeded(0, 4);
        sim.set_packet_delay(-2);
        assert_eq!(sim.packet_delay(), 0);
        sim.set_packet_delay(3);
        assert_eq!(sim.packet_delay(), 3);
    }

    #[test]
    fn delayed_packet_waits_its_cycles_then_releases_once() {
        let mut sim = seeded(0, 2);
        assert_eq!(sim.route(b"one"), Route::Queued);
        assert!(sim.flush_due().is_empty());
        assert!(sim.flush_due().is_empty());
        assert_eq!(sim.flush_due(), vec![b"one".to_vec()]);
        assert!(sim.flush_due().is_empty());
        assert_eq!(sim.pending(), 0);
        assert_eq!(sim.stats().released, 1);
    }

    #[test]
    fn release_preserves_queue_order() {
        let mut sim = seeded(0, 1);
        sim.route(b"a");
        sim.route(b"b");
        sim.flush_due();
        assert_eq!(sim.flush_due(), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn dropped_packets_are_never_queued() {
        let mut sim = seeded(1, 5);
        sim.route(b"x");
        assert_eq!(sim.pending(), 0);
        assert_eq!(sim.stats().delayed, 0);
    }

    #[test]
    fn clear_discards_queue() {
        let mut sim = seeded(0, 9);
        sim.route(b"x");
        sim.route(b"y");
        sim.clear();
        assert_eq!(sim.pending(), 0);
    }

    #[test]
    fn same_seed_same_losses() {
        let mut a = seeded(3, 0);
        let mut b = seeded(3, 0);
        for _ in 0..200 {
            assert_eq!(a.route(&[0]), b.route(&[0]));
        }
    }
}
