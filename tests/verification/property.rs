//! Property-based tests for the input rings and the frame handler.
//!
//! # Properties Tested
//!
//! - A ring read returns the last value written for exactly that tick, and
//!   a tick one lap behind is reported as overwritten
//! - Every input delay yields `buffer_size = 5 + 2 * delay` and
//!   `sync_offset = buffer_size - delay - 1`, with delays above 7 clamped
//! - Frame packet ids strictly increase
//! - Frames at or below the last accepted id never touch remote state
//! - Checksums of ticks we never confirmed never flag a desync

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::Arc;

use proptest::prelude::*;
use shobu_rollback::__internal::EngineState;
use shobu_rollback::telemetry::NullSink;
use shobu_rollback::{
    FramePacket, InputWindow, Packet, Role, Tick, TickRing, INPUT_CAPACITY, MAX_INPUT_DELAY,
    OLD_FRAMES,
};

fn engine(role: Role) -> EngineState {
    EngineState::new(role, 2, true, Arc::new(NullSink))
}

fn client_frame(tick: i32, packet_id: u32, fill: i32, checksum: i32) -> Packet {
    let mut sender = engine(Role::Client);
    let mut frame: FramePacket = sender.build_frame(Tick::new(tick), 0);
    frame.packet_id = packet_id;
    frame.checksum = checksum;
    frame.inputs.iter_mut().for_each(|input| *input = fill);
    Packet::Frame(frame)
}

proptest! {
    #[test]
    fn ring_read_returns_last_write_for_tick(
        tick in 0i32..100_000,
        first in any::<i32>(),
        second in any::<i32>(),
    ) {
        let mut ring = TickRing::<i32>::new();
        let lap = INPUT_CAPACITY as i32;
        ring.insert(Tick::new(tick), first).unwrap();
        prop_assert_eq!(ring.get(Tick::new(tick)).unwrap(), first);

        ring.insert(Tick::new(tick + lap), second).unwrap();
        prop_assert_eq!(ring.get(Tick::new(tick + lap)).unwrap(), second);
        prop_assert!(ring.get(Tick::new(tick)).is_err());
        prop_assert!(!ring.holds(Tick::new(tick)));
        prop_assert!(ring.insert(Tick::new(tick), first).is_err());
    }

    #[test]
    fn window_layout_follows_delay(delay in any::<u8>()) {
        let window = InputWindow::new(delay);
        let effective = delay.min(MAX_INPUT_DELAY);
        prop_assert_eq!(window.delay(), effective);
        prop_assert_eq!(window.buffer_size(), OLD_FRAMES + 2 * effective as usize);
        prop_assert_eq!(
            window.sync_offset(),
            window.buffer_size() as i32 - i32::from(effective) - 1
        );
    }

    #[test]
    fn packet_ids_strictly_increase(ticks in prop::collection::vec(-1i32..200, 1..64)) {
        let mut sender = engine(Role::Host);
        let mut last = 0u32;
        for tick in ticks {
            let id = sender.build_frame(Tick::new(tick), 0).packet_id;
            prop_assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn stale_ids_never_touch_remote_state(
        accepted_id in 1u32..1_000,
        stale in prop::collection::vec((0u32..1_000, -5i32..40, any::<i32>()), 1..32),
    ) {
        let mut receiver = engine(Role::Host);
        receiver.handle_packet(client_frame(3, accepted_id, 7, 0), 0);
        prop_assert_eq!(receiver.remote_tick(), Tick::new(3));
        let before: Vec<i32> = (0..12)
            .map(|t| receiver.store().remote().get(Tick::new(t)).unwrap())
            .collect();

        for (id, tick, fill) in stale {
            let id = id % (accepted_id + 1);
            receiver.handle_packet(client_frame(tick, id, fill, 0), 0);
        }

        prop_assert_eq!(receiver.remote_tick(), Tick::new(3));
        prop_assert_eq!(receiver.last_packet_id(), accepted_id);
        let after: Vec<i32> = (0..12)
            .map(|t| receiver.store().remote().get(Tick::new(t)).unwrap())
            .collect();
        prop_assert_eq!(before, after);
    }

    #[test]
    fn unconfirmed_checksums_never_flag_desync(
        checksums in prop::collection::vec(any::<i32>(), 1..8),
    ) {
        let mut receiver = engine(Role::Host);
        for (i, checksum) in checksums.into_iter().enumerate() {
            let tick = i as i32 + 1;
            receiver.handle_packet(client_frame(tick, tick as u32, 0, checksum), 0);
        }
        prop_assert!(receiver.state_is_synced());
    }
}
