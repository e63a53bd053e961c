//! Deterministic hashing for game-state checksums.
//!
//! Both peers compare [`Checksum`]s of the same confirmed tick, so the hash
//! must not depend on a per-process seed the way
//! `std::collections::hash_map::DefaultHasher` does. [`checksum_of`] gives
//! games an easy way to implement [`GameCallbacks::checksum`] from any
//! `Hash` state.
//!
//! ```
//! use shobu_rollback::hash::{checksum_of, fnv1a_hash};
//!
//! #[derive(Hash)]
//! struct World { x: i32, y: i32 }
//!
//! let world = World { x: 3, y: 4 };
//! assert_eq!(checksum_of(&world), checksum_of(&World { x: 3, y: 4 }));
//! assert_eq!(fnv1a_hash(&1u8), fnv1a_hash(&1u8));
//! ```
//!
//! FNV-1a is not cryptographically secure. It only has to notice divergence.
//!
//! [`GameCallbacks::checksum`]: crate::GameCallbacks::checksum

use std::hash::{Hash, Hasher};

use crate::Checksum;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// An FNV-1a 64-bit hasher with no random seed.
///
/// ```
/// use shobu_rollback::hash::DeterministicHasher;
/// use std::hash::{Hash, Hasher};
///
/// let mut a = DeterministicHasher::new();
/// 42u32.hash(&mut a);
/// let mut b = DeterministicHasher::new();
/// 42u32.hash(&mut b);
/// assert_eq!(a.finish(), b.finish());
/// ```
#[derive(Debug, Clone)]
pub struct DeterministicHasher {
    state: u64,
}

impl DeterministicHasher {
    /// Starts from the FNV-1a offset basis.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: FNV_OFFSET_BASIS,
        }
    }
}

impl Default for DeterministicHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for DeterministicHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.state
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }
}

/// FNV-1a hash of `value`.
#[inline]
pub fn fnv1a_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DeterministicHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Folds [`fnv1a_hash`] down to a wire-sized [`Checksum`].
///
/// The two halves are XORed so that no bits of the 64-bit hash are thrown away.
#[inline]
pub fn checksum_of<T: Hash + ?Sized>(value: &T) -> Checksum {
    let hash = fnv1a_hash(value);
    ((hash >> 32) ^ (hash & 0xFFFF_FFFF)) as u32 as Checksum
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
    fn known_fnv1a_vectors() {
        // Reference values for FNV-1a 64.
        let mut empty = DeterministicHasher::new();
        empty.write(&[]);
        assert_eq!(empty.finish(), 0xcbf2_9ce4_8422_2325);

        let mut a = DeterministicHasher::new();
        a.write(b"a");
        assert_eq!(a.finish(), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn checksum_is_stable_and_sensitive() {
        let state = (12i32, -4i64, [1u8, 2, 3]);
        assert_eq!(checksum_of(&state), checksum_of(&(12i32, -4i64, [1u8, 2, 3])));
        assert_ne!(checksum_of(&state), checksum_of(&(13i32, -4i64, [1u8, 2, 3])));
    }

    #[test]
    fn checksum_folds_both_halves() {
        let hash = fnv1a_hash(&"shobu");
        let folded = checksum_of(&"shobu") as u32;
        assert_eq!(folded, ((hash >> 32) as u32) ^ (hash as u32));
    }
}
