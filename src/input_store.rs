//! Tick-indexed ring buffers for local inputs, remote inputs and checksums.
//!
//! Every slot remembers which tick it holds. That turns the classic silent
//! wrap-around of a `tick % capacity` array into an explicit contract: a read
//! either returns the value written for exactly that tick, or reports that
//! the tick fell out of the window.

use crate::error::NetplayError;
use crate::{
    Checksum, Input, Tick, DEFAULT_INPUT_DELAY, INPUT_CAPACITY, MAX_INPUT_DELAY, OLD_FRAMES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot<T> {
    tick: Tick,
    value: T,
}

/// A ring of [`INPUT_CAPACITY`] values indexed by tick.
///
/// - `get` of a tick never written since the last [`clear`](Self::clear)
///   (including any negative tick) yields `T::default()`.
/// - `get` of a tick whose slot now holds a different tick is an error.
/// - `insert` refuses negative ticks and refuses to overwrite a newer tick.
#[derive(Debug, Clone)]
pub struct TickRing<T> {
    slots: [Slot<T>; INPUT_CAPACITY],
}

impl<T: Copy + Default> Default for TickRing<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Default> TickRing<T> {
    /// Creates a ring with every slot empty.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot {
                tick: Tick::NULL,
                value: T::default(),
            }),
        }
    }

    /// Number of slots.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        INPUT_CAPACITY
    }

    /// Stores `value` for `tick`.
    ///
    /// Rewriting the same tick replaces its value.
    ///
    /// # Errors
    ///
    /// [`NetplayError::TickOutOfWindow`] if `tick` is negative or its slot
    /// already holds a later tick.
    pub fn insert(&mut self, tick: Tick, value: T) -> Result<(), NetplayError> {
        if !tick.is_valid() {
            return Err(NetplayError::TickOutOfWindow {
                tick,
                held: Tick::NULL,
            });
        }
        let slot = &mut self.slots[tick.slot(INPUT_CAPACITY)];
        if slot.tick > tick {
            return Err(NetplayError::TickOutOfWindow {
                tick,
                held: slot.tick,
            });
        }
        *slot = Slot { tick, value };
        Ok(())
    }

    /// Reads the value for `tick`.
    ///
    /// # Errors
    ///
    /// [`NetplayError::TickOutOfWindow`] if the slot holds another tick,
    /// either because `tick` was overwritten or because it is not written
    /// yet while the slot still holds a value from a lap ago.
    pub fn get(&self, tick: Tick) -> Result<T, NetplayError> {
        if !tick.is_valid() {
            return Ok(T::default());
        }
        let slot = &self.slots[tick.slot(INPUT_CAPACITY)];
        if slot.tick == tick {
            Ok(slot.value)
        } else if slot.tick.is_null() {
            Ok(T::default())
        } else {
            Err(NetplayError::TickOutOfWindow {
                tick,
                held: slot.tick,
            })
        }
    }

    /// Returns `true` if `tick`'s slot currently holds exactly `tick`.
    #[must_use]
    pub fn holds(&self, tick: Tick) -> bool {
        tick.is_valid() && self.slots[tick.slot(INPUT_CAPACITY)].tick == tick
    }

    /// Empties every slot.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = Slot {
                tick: Tick::NULL,
                value: T::default(),
            };
        }
    }
}

/// The delay-derived shape of the frame-packet input window.
///
/// A frame sent at tick `T` carries `buffer_size` local inputs for ticks
/// `T + delay - buffer_size + 1 ..= T + delay`; the receiver writes input `i`
/// to tick `T - sync_offset + i`. Both expressions name the same ticks
/// because `sync_offset = buffer_size - delay - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputWindow {
    delay: u8,
    buffer_size: usize,
    sync_offset: i32,
}

impl Default for InputWindow {
    fn default() -> Self {
        Self::new(DEFAULT_INPUT_DELAY)
    }
}

impl InputWindow {
    /// Window for `delay`, clamped to [`MAX_INPUT_DELAY`].
    #[must_use]
    pub fn new(delay: u8) -> Self {
        let delay = delay.min(MAX_INPUT_DELAY);
        let buffer_size = OLD_FRAMES + 2 * delay as usize;
        Self {
            delay,
            buffer_size,
            sync_offset: buffer_size as i32 - delay as i32 - 1,
        }
    }

    /// Input delay in ticks.
    #[must_use]
    pub const fn delay(&self) -> u8 {
        self.delay
    }

    /// Inputs carried per frame packet.
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Distance from a frame's tick back to its first carried input.
    #[must_use]
    pub const fn sync_offset(&self) -> i32 {
        self.sync_offset
    }

    /// Delay as a tick offset.
    #[must_use]
    pub const fn delay_ticks(&self) -> i32 {
        self.delay as i32
    }

    /// First tick whose input a frame sent at `tick` carries.
    #[must_use]
    pub fn first_carried_tick(&self, tick: Tick) -> Tick {
        tick - self.sync_offset
    }
}

/// Local inputs, remote inputs and confirmed-tick checksums.
#[derive(Debug, Clone, Default)]
pub struct InputStore {
    local: TickRing<Input>,
    remote: TickRing<Input>,
    checksums: TickRing<Checksum>,
}

impl InputStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Local inputs, written at `tick + delay`.
    #[must_use]
    pub fn local(&self) -> &TickRing<Input> {
        &self.local
    }

    /// Mutable local inputs.
    pub fn local_mut(&mut self) -> &mut TickRing<Input> {
        &mut self.local
    }

    /// Remote inputs, written by the listener.
    #[must_use]
    pub fn remote(&self) -> &TickRing<Input> {
        &self.remote
    }

    /// Mutable remote inputs.
    pub fn remote_mut(&mut self) -> &mut TickRing<Input> {
        &mut self.remote
    }

    /// Checksums of confirmed ticks.
    #[must_use]
    pub fn checksums(&self) -> &TickRing<Checksum> {
        &self.checksums
    }

    /// Mutable checksums.
    pub fn checksums_mut(&mut self) -> &mut TickRing<Checksum> {
        &mut self.checksums
    }

    /// Zeroes all three rings.
    pub fn reset(&mut self) {
        self.local.clear();
        self.remote.clear();
        self.checksums.clear();
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
    use proptest::prelude::*;

    const CAP: i32 = INPUT_CAPACITY as i32;

    #[test]
    fn unwritten_ticks_read_as_zero() {
        let ring: TickRing<Input> = TickRing::new();
        assert_eq!(ring.get(Tick::new(0)).unwrap(), 0);
        assert_eq!(ring.get(Tick::new(59)).unwrap(), 0);
        assert_eq!(ring.get(Tick::new(-4)).unwrap(), 0);
        assert!(!ring.holds(Tick::new(0)));
    }

    #[test]
    fn overwritten_tick_is_an_error() {
        let mut ring = TickRing::new();
        ring.insert(Tick::new(3), 7).unwrap();
        ring.insert(Tick::new(3 + CAP), 8).unwrap();
        assert_eq!(
            ring.get(Tick::new(3)),
            Err(NetplayError::TickOutOfWindow {
                tick: Tick::new(3),
                held: Tick::new(3 + CAP),
            })
        );
        assert_eq!(ring.get(Tick::new(3 + CAP)).unwrap(), 8);
    }

    #[test]
    fn tick_from_a_lap_ahead_is_not_yet_written() {
        let mut ring = TickRing::new();
        ring.insert(Tick::new(10), 1).unwrap();
        assert!(ring.get(Tick::new(10 + CAP)).is_err());
    }

    #[test]
    fn insert_rejects_older_tick_and_negative_ticks() {
        let mut ring = TickRing::new();
        ring.insert(Tick::new(70), 1).unwrap();
        assert!(ring.insert(Tick::new(10), 2).is_err());
        assert_eq!(ring.get(Tick::new(70)).unwrap(), 1);
        assert!(ring.insert(Tick::new(-1), 5).is_err());
    }

    #[test]
    fn rewriting_same_tick_replaces_value() {
        let mut ring = TickRing::new();
        ring.insert(Tick::new(4), 1).unwrap();
        ring.insert(Tick::new(4), 2).unwrap();
        assert_eq!(ring.get(Tick::new(4)).unwrap(), 2);
    }

    #[test]
    fn clear_forgets_everything() {
        let mut ring = TickRing::new();
        ring.insert(Tick::new(100), 9).unwrap();
        ring.clear();
        assert_eq!(ring.get(Tick::new(100)).unwrap(), 0);
        ring.insert(Tick::new(40), 3).unwrap();
        assert_eq!(ring.get(Tick::new(40)).unwrap(), 3);
    }

    #[test]
    fn default_window() {
        let window = InputWindow::default();
        assert_eq!(window.delay(), 2);
        assert_eq!(window.buffer_size(), 9);
        assert_eq!(window.sync_offset(), 6);
    }

    #[test]
    fn window_clamps_delay() {
        let window = InputWindow::new(12);
        assert_eq!(window.delay(), MAX_INPUT_DELAY);
        assert_eq!(window.buffer_size(), 19);
        assert_eq!(window.sync_offset(), 11);
    }

    #[test]
    fn carried_ticks_match_on_both_sides() {
        let window = InputWindow::new(3);
        let sent_at = Tick::new(40);
        let first = window.first_carried_tick(sent_at);
        let last = first + window.buffer_size() as i32 - 1;
        assert_eq!(last, sent_at + window.delay_ticks());
    }

    #[test]
    fn store_reset_clears_all_rings() {
        let mut store = InputStore::new();
        store.local_mut().insert(Tick::new(1), 1).unwrap();
        store.remote_mut().insert(Tick::new(1), 2).unwrap();
        store.checksums_mut().insert(Tick::new(1), 3).unwrap();
        store.reset();
        assert!(!store.local().holds(Tick::new(1)));
        assert!(!store.remote().holds(Tick::new(1)));
        assert!(!store.checksums().holds(Tick::new(1)));
    }

    proptest! {
        #[test]
        fn last_write_wins_across_laps(
            writes in proptest::collection::vec((0i32..600, any::<i32>()), 1..200)
        ) {
            let mut ring = TickRing::new();
            let mut newest = std::collections::BTreeMap::new();
            for (tick, value) in writes {
                let tick = Tick::new(tick);
                if ring.insert(tick, value).is_ok() {
                    newest.insert(tick.slot(INPUT_CAPACITY), (tick, value));
                }
            }
            for (tick, value) in newest.values() {
                prop_assert_eq!(ring.get(*tick).unwrap(), *value);
                prop_assert!(ring.get(*tick + CAP).is_err());
                if tick.as_i32() >= CAP {
                    prop_assert!(ring.get(*tick - CAP).is_err());
                }
            }
        }

        #[test]
        fn window_layout_invariant(delay in 0u8..=255) {
            let window = InputWindow::new(delay);
            let d = delay.min(MAX_INPUT_DELAY) as usize;
            prop_assert_eq!(window.delay() as usize, d);
            prop_assert_eq!(window.buffer_size(), 5 + 2 * d);
            prop_assert_eq!(window.sync_offset(), window.buffer_size() as i32 - d as i32 - 1);
        }
    }
}
