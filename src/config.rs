//! Configuration types for netplay sessions.
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | [`SessionConfig`] | Delay, rollback mode, logging | `Default` |
//! | [`NetworkConfig`] | Handshake and listener timing | `lan()`, `tolerant()` |
//! | [`LinkSimulationConfig`] | Test-only loss and latency | `passthrough()`, `lossy()`, `laggy()` |
//!
//! # Example
//!
//! ```
//! use shobu_rollback::{LinkSimulationConfig, NetworkConfig, SessionConfig};
//!
//! let config = SessionConfig::default()
//!     .with_input_delay(3)
//!     .with_network(NetworkConfig::lan())
//!     .with_simulation(LinkSimulationConfig::lossy().with_seed(9));
//! assert!(config.validate().is_ok());
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use web_time::Duration;

use crate::telemetry::{LogSink, TracingSink};
use crate::{NetplayError, DEFAULT_INPUT_DELAY, MAX_INPUT_DELAY};

/// Timing of the handshake, the listener and the delayed-packet flush.
///
/// # Forward Compatibility
///
/// New fields may be added in future versions. Construct instances with
/// `..NetworkConfig::default()` so that code keeps compiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[must_use = "NetworkConfig has no effect unless passed to SessionConfig::with_network()"]
pub struct NetworkConfig {
    /// How long a client waits for the host's handshake reply.
    ///
    /// Default: 4s
    pub handshake_timeout: Duration,

    /// How long a client sleeps after the handshake before it starts
    /// listening, so that stale inputs from the host drain.
    ///
    /// Default: 1000ms
    pub handshake_settle: Duration,

    /// Listener receive timeout.
    ///
    /// Default: 1s
    pub receive_timeout: Duration,

    /// Consecutive silent receive timeouts, after the peer was first heard,
    /// before the listener declares the link dead.
    ///
    /// Default: 1
    pub max_idle_timeouts: u32,

    /// Period of the delayed-packet flush task.
    ///
    /// Default: 16ms
    pub flush_interval: Duration,

    /// Copies sent of every frame, ping response and handshake ack.
    ///
    /// Default: 2
    pub send_repeats: usize,

    /// Upper bound on a host's wait for a client. `None` waits until
    /// aborted.
    ///
    /// Default: `None`
    pub host_wait_timeout: Option<Duration>,

    /// Socket timeout used while polling during handshakes, bounding how
    /// quickly an abort is noticed.
    ///
    /// Default: 100ms
    pub handshake_poll: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(4),
            handshake_settle: Duration::from_millis(1000),
            receive_timeout: Duration::from_secs(1),
            max_idle_timeouts: 1,
            flush_interval: Duration::from_millis(16),
            send_repeats: crate::SEND_REPEATS,
            host_wait_timeout: None,
            handshake_poll: Duration::from_millis(100),
        }
    }
}

impl NetworkConfig {
    /// Creates a `NetworkConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for local play and tests: a short settle and a bounded host wait.
    pub fn lan() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(2),
            handshake_settle: Duration::from_millis(100),
            host_wait_timeout: Some(Duration::from_secs(10)),
            handshake_poll: Duration::from_millis(20),
            ..Self::default()
        }
    }

    /// Preset for unreliable links: longer handshakes and more patience
    /// before a silent peer is dropped.
    pub fn tolerant() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(8),
            receive_timeout: Duration::from_secs(1),
            max_idle_timeouts: 5,
            ..Self::default()
        }
    }

    /// Sets the client handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the post-handshake settle sleep.
    pub fn with_handshake_settle(mut self, settle: Duration) -> Self {
        self.handshake_settle = settle;
        self
    }

    /// Sets the listener receive timeout.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Sets how many silent receive timeouts are tolerated.
    pub fn with_max_idle_timeouts(mut self, count: u32) -> Self {
        self.max_idle_timeouts = count;
        self
    }

    /// Sets the delayed-packet flush period.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the redundancy of frames, ping responses and handshake acks.
    pub fn with_send_repeats(mut self, repeats: usize) -> Self {
        self.send_repeats = repeats;
        self
    }

    /// Bounds the host's wait for a client.
    pub fn with_host_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.host_wait_timeout = timeout;
        self
    }

    /// Sets the handshake polling interval.
    pub fn with_handshake_poll(mut self, poll: Duration) -> Self {
        self.handshake_poll = poll;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] for a zero duration (other
    /// than the settle sleep), zero idle timeouts or zero send repeats.
    pub fn validate(&self) -> Result<(), NetplayError> {
        let durations = [
            ("handshake_timeout", self.handshake_timeout),
            ("receive_timeout", self.receive_timeout),
            ("flush_interval", self.flush_interval),
            ("handshake_poll", self.handshake_poll),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(NetplayError::InvalidRequest {
                    info: format!("{field} must be greater than zero"),
                });
            }
        }
        if matches!(self.host_wait_timeout, Some(timeout) if timeout.is_zero()) {
            return Err(NetplayError::InvalidRequest {
                info: "host_wait_timeout must be greater than zero when set".to_owned(),
            });
        }
        if self.max_idle_timeouts == 0 {
            return Err(NetplayError::InvalidRequest {
                info: "max_idle_timeouts must be at least 1".to_owned(),
            });
        }
        if self.send_repeats == 0 {
            return Err(NetplayError::InvalidRequest {
                info: "send_repeats must be at least 1".to_owned(),
            });
        }
        Ok(())
    }
}

/// Packet loss and latency simulation, for testing under bad links.
///
/// Both knobs can also be changed on a live session with
/// [`set_packet_loss`](crate::NetplaySession::set_packet_loss) and
/// [`set_packet_delay`](crate::NetplaySession::set_packet_delay).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[must_use = "LinkSimulationConfig has no effect unless passed to SessionConfig::with_simulation()"]
pub struct LinkSimulationConfig {
    /// Drop one in every `loss_frequency` simulated sends. 0 is off.
    pub loss_frequency: u32,
    /// Hold each simulated send for this many flush cycles. 0 is off.
    pub packet_delay: u32,
    /// Seed for the loss RNG. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl LinkSimulationConfig {
    /// No simulation.
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Drops every other simulated send on average.
    pub fn lossy() -> Self {
        Self {
            loss_frequency: 2,
            ..Self::default()
        }
    }

    /// Holds every simulated send for four flush cycles.
    pub fn laggy() -> Self {
        Self {
            packet_delay: 4,
            ..Self::default()
        }
    }

    /// Sets the loss frequency.
    pub fn with_loss_frequency(mut self, frequency: u32) -> Self {
        self.loss_frequency = frequency;
        self
    }

    /// Sets the delay in flush cycles.
    pub fn with_packet_delay(mut self, delay: u32) -> Self {
        self.packet_delay = delay;
        self
    }

    /// Fixes the loss RNG seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Everything a [`NetplaySession`](crate::NetplaySession) is created with.
#[derive(Clone)]
#[must_use = "SessionConfig has no effect unless passed to a session constructor"]
pub struct SessionConfig {
    /// Input delay used until a handshake negotiates one. Clamped to
    /// [`MAX_INPUT_DELAY`].
    ///
    /// Default: 2
    pub input_delay: u8,
    /// Whether late remote input triggers rollback. Without it the session
    /// stalls until input is known.
    ///
    /// Default: `true`
    pub rollbacks: bool,
    /// Handshake and listener timing.
    pub network: NetworkConfig,
    /// Test-only link simulation.
    pub simulation: LinkSimulationConfig,
    /// Where the session's log records go.
    ///
    /// Default: [`TracingSink`]
    pub log_sink: Arc<dyn LogSink>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_delay: DEFAULT_INPUT_DELAY,
            rollbacks: true,
            network: NetworkConfig::default(),
            simulation: LinkSimulationConfig::default(),
            log_sink: Arc::new(TracingSink),
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("input_delay", &self.input_delay)
            .field("rollbacks", &self.rollbacks)
            .field("network", &self.network)
            .field("simulation", &self.simulation)
            .finish_non_exhaustive()
    }
}

impl SessionConfig {
    /// Creates a `SessionConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial input delay.
    pub fn with_input_delay(mut self, delay: u8) -> Self {
        self.input_delay = delay;
        self
    }

    /// Enables or disables rollback.
    pub fn with_rollbacks(mut self, enabled: bool) -> Self {
        self.rollbacks = enabled;
        self
    }

    /// Sets the network timing.
    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    /// Sets the link simulation.
    pub fn with_simulation(mut self, simulation: LinkSimulationConfig) -> Self {
        self.simulation = simulation;
        self
    }

    /// Sets the log sink.
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] if the input delay exceeds
    /// [`MAX_INPUT_DELAY`] or the network config is invalid.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if self.input_delay > MAX_INPUT_DELAY {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "input_delay {} exceeds the maximum of {}",
                    self.input_delay, MAX_INPUT_DELAY
                ),
            });
        }
        self.network.validate()
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
    use crate::telemetry::NullSink;

    #[test]
    fn defaults_match_documented_values() {
        let network = NetworkConfig::default();
        assert_eq!(network.handshake_timeout, Duration::from_secs(4));
        assert_eq!(network.handshake_settle, Duration::from_millis(1000));
        assert_eq!(network.receive_timeout, Duration::from_secs(1));
        assert_eq!(network.max_idle_timeouts, 1);
        assert_eq!(network.flush_interval, Duration::from_millis(16));
        assert_eq!(network.send_repeats, 2);
        assert_eq!(network.host_wait_timeout, None);

        let session = SessionConfig::default();
        assert_eq!(session.input_delay, 2);
        assert!(session.rollbacks);
        assert_eq!(session.simulation, LinkSimulationConfig::passthrough());
    }

    #[test]
    fn presets_validate() {
        assert!(NetworkConfig::lan().validate().is_ok());
        assert!(NetworkConfig::tolerant().validate().is_ok());
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_durations_are_rejected() {
        let config = NetworkConfig::default().with_receive_timeout(Duration::ZERO);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("receive_timeout"));

        let config = NetworkConfig::default().with_host_wait_timeout(Some(Duration::ZERO));
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_settle_is_allowed() {
        let config = NetworkConfig::default().with_handshake_settle(Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_repeats_and_idle_timeouts_are_rejected() {
        assert!(NetworkConfig::default()
            .with_send_repeats(0)
            .validate()
            .is_err());
        assert!(NetworkConfig::default()
            .with_max_idle_timeouts(0)
            .validate()
            .is_err());
    }

    #[test]
    fn oversized_delay_is_rejected() {
        let config = SessionConfig::default().with_input_delay(MAX_INPUT_DELAY + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn simulation_presets() {
        assert_eq!(LinkSimulationConfig::lossy().loss_frequency, 2);
        assert_eq!(LinkSimulationConfig::laggy().packet_delay, 4);
        assert_eq!(LinkSimulationConfig::lossy().with_seed(3).seed, Some(3));
    }

    #[test]
    fn debug_omits_sink() {
        let config = SessionConfig::default().with_log_sink(Arc::new(NullSink));
        let text = format!("{config:?}");
        assert!(text.contains("input_delay: 2"));
        assert!(!text.contains("log_sink"));
    }

    #[test]
    fn network_config_serde_roundtrip() {
        let config = NetworkConfig::tolerant();
        let json = serde_json::to_string(&config).unwrap();
        let back: NetworkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
