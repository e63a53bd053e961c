//! Smoothed round-trip time from echoed frame timestamps.

use web_time::{SystemTime, UNIX_EPOCH};

/// Weight kept from the previous estimate on every sample.
pub const PING_SMOOTHING: f64 = 0.9;

/// Weight given to each new sample.
const SAMPLE_WEIGHT: f64 = 0.1;

/// Current wall-clock time in milliseconds, truncated to 32 bits.
///
/// Frame timestamps only ever travel to the peer and back, so the wrap
/// every ~49 days is harmless as long as differences use wrapping math.
#[must_use]
pub fn wire_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u32)
}

/// Exponential moving average of round-trip time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PingEstimator {
    average_ms: f64,
    samples: u64,
    last_rtt_ms: u32,
}

impl PingEstimator {
    /// Starts at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in the response to a probe sent at `sent_ms`, received at `now_ms`.
    ///
    /// Returns the sample's round-trip time.
    pub fn on_response(&mut self, sent_ms: u32, now_ms: u32) -> u32 {
        let rtt = now_ms.wrapping_sub(sent_ms);
        self.average_ms = self.average_ms * PING_SMOOTHING + SAMPLE_WEIGHT * f64::from(rtt);
        self.samples += 1;
        self.last_rtt_ms = rtt;
        rtt
    }

    /// Smoothed round-trip time, whole milliseconds.
    #[must_use]
    pub fn ping_ms(&self) -> u32 {
        self.average_ms as u32
    }

    /// Most recent raw sample.
    #[must_use]
    pub const fn last_rtt_ms(&self) -> u32 {
        self.last_rtt_ms
    }

    /// Number of responses folded in.
    #[must_use]
    pub const fn samples(&self) -> u64 {
        self.samples
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
    fn first_sample_moves_ten_percent() {
        let mut ping = PingEstimator::new();
        assert_eq!(ping.on_response(1_000, 1_100), 100);
        assert!((9..=10).contains(&ping.ping_ms()));
        assert_eq!(ping.samples(), 1);
    }

    #[test]
    fn converges_towards_steady_rtt() {
        let mut ping = PingEstimator::new();
        for i in 0..200u32 {
            ping.on_response(i * 16, i * 16 + 40);
        }
        assert!((39..=40).contains(&ping.ping_ms()));
        assert_eq!(ping.last_rtt_ms(), 40);
    }

    #[test]
    fn timestamp_wrap_uses_wrapping_difference() {
        let mut ping = PingEstimator::new();
        assert_eq!(ping.on_response(u32::MAX - 9, 20), 30);
    }

    #[test]
    fn wire_clock_is_nonzero() {
        assert_ne!(wire_millis(), 0);
    }
}
