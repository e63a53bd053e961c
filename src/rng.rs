//! A small PCG32 generator for the link simulator.
//!
//! Loss simulation needs a uniform draw per outbound packet and nothing else,
//! so this keeps the PCG-XSH-RR core and a thin [`Rng`] trait on top.
//! Seeding with [`SeedableRng::seed_from_u64`] makes a lossy run repeatable.
//!
//! ```rust
//! use shobu_rollback::rng::{Pcg32, Rng, SeedableRng};
//!
//! let mut rng = Pcg32::seed_from_u64(12345);
//! let roll = rng.gen_range(0..4);
//! assert!(roll < 4);
//! ```
//!
//! Reference: <https://www.pcg-random.org/>

/// PCG32 random number generator.
///
/// The PCG-XSH-RR variant with 64-bit state. Not cryptographically secure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

const PCG_DEFAULT_STREAM: u64 = 1442695040888963407;

const PCG_MULTIPLIER: u64 = 6364136223846793005;

impl Pcg32 {
    /// Creates a generator from an initial state and a stream selector.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        let inc = (stream << 1) | 1;
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    /// Next 32-bit output.
    #[inline]
    #[must_use]
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }
}

/// Construction from a seed.
pub trait SeedableRng: Sized {
    /// Same seed, same sequence.
    #[must_use]
    fn seed_from_u64(seed: u64) -> Self;

    /// Seeds from wall-clock timing and the current thread's identity.
    #[must_use]
    fn from_entropy() -> Self;
}

impl SeedableRng for Pcg32 {
    fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_STREAM)
    }

    fn from_entropy() -> Self {
        Self::seed_from_u64(timing_entropy_seed())
    }
}

/// Uniform draws on top of a 32-bit source.
pub trait Rng {
    /// Next 32-bit value.
    fn next_u32(&mut self) -> u32;

    /// A value in `[range.start, range.end)`, without modulo bias.
    ///
    /// An empty range yields `range.start`.
    fn gen_range(&mut self, range: std::ops::Range<u32>) -> u32 {
        let span = range.end.wrapping_sub(range.start);
        if range.is_empty() || span == 0 {
            return range.start;
        }
        let threshold = span.wrapping_neg() % span;
        loop {
            let value = self.next_u32();
            if value >= threshold {
                return range.start.wrapping_add(value % span);
            }
        }
    }

    /// `true` once in every `frequency` draws on average.
    ///
    /// A frequency of 0 never fires; 1 always does.
    fn one_in(&mut self, frequency: u32) -> bool {
        frequency > 0 && self.gen_range(0..frequency) == 0
    }
}

impl Rng for Pcg32 {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        Self::next_u32(self)
    }
}

fn timing_entropy_seed() -> u64 {
    use crate::hash::DeterministicHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DeterministicHasher::new();
    std::thread::current().id().hash(&mut hasher);
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos())
        .hash(&mut hasher);
    hasher.finish()
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
    fn same_seed_same_sequence() {
        let mut a = Pcg32::seed_from_u64(7);
        let mut b = Pcg32::seed_from_u64(7);
        for _ in 0..64 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = Pcg32::seed_from_u64(1);
        let mut b = Pcg32::seed_from_u64(2);
        let same = (0..32).filter(|_| a.next_u32() == b.next_u32()).count();
        assert!(same < 4);
    }

    #[test]
    fn gen_range_stays_in_bounds() {
        let mut rng = Pcg32::seed_from_u64(99);
        for _ in 0..1_000 {
            let value = rng.gen_range(10..13);
            assert!((10..13).contains(&value));
        }
    }

    #[test]
    fn empty_range_returns_start() {
        let mut rng = Pcg32::seed_from_u64(3);
        assert_eq!(rng.gen_range(5..5), 5);
    }

    #[test]
    fn one_in_edges() {
        let mut rng = Pcg32::seed_from_u64(11);
        assert!((0..100).all(|_| !rng.one_in(0)));
        assert!((0..100).all(|_| rng.one_in(1)));
    }

    #[test]
    fn one_in_two_is_roughly_half() {
        let mut rng = Pcg32::seed_from_u64(2024);
        let hits = (0..10_000).filter(|_| rng.one_in(2)).count();
        assert!((4_000..6_000).contains(&hits), "hits = {hits}");
    }
}
