use serde::Serialize;

use crate::Tick;

/// A snapshot of a session's link and rollback counters.
///
/// Returned by [`NetplaySession::network_stats`](crate::NetplaySession::network_stats).
/// Counters are cumulative since the session was created; tick fields
/// reflect the moment of the call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[must_use = "NetworkStats should be inspected or used after being queried"]
pub struct NetworkStats {
    /// Smoothed round-trip time in milliseconds.
    pub ping_ms: u32,
    /// Last simulated tick.
    pub local_tick: Tick,
    /// Newest tick accepted from the peer.
    pub remote_tick: Tick,
    /// Last tick both peers are known to agree on.
    pub rollback_tick: Tick,
    /// `local_tick - remote_tick` at the last accepted frame.
    pub tick_delta: i32,
    /// Whether we are within tolerance of the peer's pace.
    pub remote_synced: bool,
    /// `false` once a checksum mismatch has been seen.
    pub state_synced: bool,
    /// Updates that stalled waiting for the peer.
    pub waits: u64,
    /// Rollbacks performed.
    pub rollbacks: u64,
    /// Frame packets accepted.
    pub frames_accepted: u64,
    /// Frame packets discarded as stale, duplicate or too far ahead.
    pub frames_rejected: u64,
    /// Datagrams written to the socket, repeats included.
    pub packets_sent: u64,
    /// Datagrams dropped by the loss simulator.
    pub packets_dropped: u64,
    /// Datagrams held by the latency simulator.
    pub packets_delayed: u64,
    /// Smoothed wall time between `update` calls, in microseconds.
    pub update_interval_us: u64,
}

impl NetworkStats {
    /// Creates an all-zero snapshot.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            ping_ms,
            local_tick,
            remote_tick,
            rollback_tick,
            tick_delta,
            remote_synced,
            state_synced,
            waits,
            rollbacks,
            frames_accepted,
            frames_rejected,
            packets_sent,
            packets_dropped,
            packets_delayed,
            update_interval_us,
        } = self;

        write!(
            f,
            "NetworkStats {{ ping: {}ms, local: {}, remote: {}, rollback: {}, delta: {}",
            ping_ms, local_tick, remote_tick, rollback_tick, tick_delta
        )?;
        write!(
            f,
            ", remote_synced: {}, state_synced: {}, waits: {}, rollbacks: {}",
            remote_synced, state_synced, waits, rollbacks
        )?;
        write!(
            f,
            ", frames: {}/{} accepted/rejected, packets: {} sent, {} dropped, {} delayed",
            frames_accepted, frames_rejected, packets_sent, packets_dropped, packets_delayed
        )?;
        write!(f, ", update_interval: {}us }}", update_interval_us)
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
    fn display_mentions_every_counter_group() {
        let stats = NetworkStats {
            ping_ms: 33,
            local_tick: Tick::new(120),
            remote_tick: Tick::new(118),
            rollback_tick: Tick::new(117),
            tick_delta: 2,
            remote_synced: true,
            state_synced: true,
            waits: 4,
            rollbacks: 90,
            frames_accepted: 110,
            frames_rejected: 12,
            packets_sent: 250,
            packets_dropped: 0,
            packets_delayed: 0,
            update_interval_us: 16_666,
        };
        let text = stats.to_string();
        assert!(text.contains("ping: 33ms"));
        assert!(text.contains("rollback: 117"));
        assert!(text.contains("110/12"));
        assert!(text.contains("16666us"));
    }

    #[test]
    fn default_ticks_are_zero() {
        let stats = NetworkStats::new();
        assert_eq!(stats.local_tick, Tick::new(0));
        assert!(!stats.state_synced);
    }
}
