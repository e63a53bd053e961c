//! Shared test utilities for integration tests.
//!
//! # Port Allocation
//!
//! Tests that bind real sockets take their ports from `PortAllocator`, so
//! that test binaries running in parallel do not collide:
//!
//! ```ignore
//! use common::test_utils::PortAllocator;
//!
//! let port = PortAllocator::next_port();
//! ```

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shobu_rollback::telemetry::{CollectingSink, CompositeSink, LogSink, TracingSink};
use shobu_rollback::{GameCallbacks, Input, NetplaySession, NetworkConfig, SessionConfig};

use super::stubs::GameStub;

// ============================================================================
// Port Allocation System
// ============================================================================

/// Starting port for the atomic port allocator.
///
/// Above the registered ports commonly used by services and below the
/// ephemeral range the OS hands out for port 0.
#[allow(dead_code)] // Some integration crates only use subsets of the allocator API.
const PORT_ALLOCATOR_START: u16 = 30000;

/// Ports reserved per test process.
#[allow(dead_code)]
const PORTS_PER_PROCESS: u16 = 20;

/// Global atomic counter for thread-safe port allocation.
///
/// The counter is per-binary, so the starting port is offset by the process
/// ID to keep test binaries that run in parallel apart.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(0);

/// Whether the counter has been given this process's offset.
static PORT_COUNTER_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Thread-safe port allocator for integration tests.
pub struct PortAllocator;

impl PortAllocator {
    #[allow(dead_code)]
    fn initialize_counter() {
        if PORT_COUNTER_INITIALIZED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let pid = std::process::id();
            let max_offsets = (60000 - PORT_ALLOCATOR_START) / PORTS_PER_PROCESS;
            let offset_index = (pid % u32::from(max_offsets)) as u16;
            let start_port = PORT_ALLOCATOR_START + (offset_index * PORTS_PER_PROCESS);
            PORT_COUNTER.store(start_port, Ordering::SeqCst);
        }
    }

    /// Allocates the next available port.
    ///
    /// # Panics
    ///
    /// Panics if the allocator runs past port 60000.
    #[allow(dead_code)]
    #[must_use]
    pub fn next_port() -> u16 {
        Self::initialize_counter();
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        assert!(
            port < 60000,
            "Port allocator exhausted. This indicates a test suite issue."
        );
        port
    }
}

// ============================================================================
// Session helpers
// ============================================================================

/// Pause between two rounds of updates, so that packets cross the loopback
/// and the listeners get to run.
pub const TICK_INTERVAL: Duration = Duration::from_millis(5);

/// Installs a test-writer tracing subscriber, once per test binary.
///
/// Output shows up with `--nocapture`.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Session config for loopback tests: short handshake timings, logs kept
/// in `sink` and forwarded to `tracing`.
#[allow(dead_code)]
#[must_use]
pub fn loopback_config(sink: &Arc<CollectingSink>) -> SessionConfig {
    init_tracing();
    let collecting: Arc<dyn LogSink> = sink.clone();
    let log: Arc<dyn LogSink> = Arc::new(CompositeSink::from_sinks(vec![
        collecting,
        Arc::new(TracingSink),
    ]));
    SessionConfig::default()
        .with_network(NetworkConfig::lan())
        .with_log_sink(log)
}

/// Hosts `host_game` on `port` with `host_delay` and connects a client
/// playing `client_game` to it.
///
/// Returns both sessions connected.
#[allow(dead_code)]
pub fn connect_games<H, C>(
    port: u16,
    host_delay: u8,
    (host_game, client_game): (H, C),
    host_config: SessionConfig,
    client_config: SessionConfig,
) -> (NetplaySession<H>, NetplaySession<C>)
where
    H: GameCallbacks + Send + 'static,
    C: GameCallbacks,
{
    let mut host = NetplaySession::host(port, host_game, host_config).unwrap();
    host.set_input_delay(host_delay);
    let host_thread = thread::spawn(move || {
        host.wait_for_client().unwrap();
        host
    });

    let address = format!("127.0.0.1:{port}");
    let mut client = NetplaySession::client(&address, client_game, client_config).unwrap();
    client.connect_to_host().unwrap();
    let host = host_thread.join().unwrap();
    (host, client)
}

/// [`connect_games`] with a pair of [`GameStub`]s.
#[allow(dead_code)]
pub fn connect_pair(
    port: u16,
    host_delay: u8,
    host_config: SessionConfig,
    client_config: SessionConfig,
) -> (NetplaySession<GameStub>, NetplaySession<GameStub>) {
    connect_games(
        port,
        host_delay,
        (GameStub::host(), GameStub::client()),
        host_config,
        client_config,
    )
}

/// Runs `ticks` rounds of one host update and one client update, calling
/// `inspect` after each round.
#[allow(dead_code)]
pub fn run_ticks<H, C>(
    host: &mut NetplaySession<H>,
    client: &mut NetplaySession<C>,
    ticks: usize,
    mut inspect: impl FnMut(usize, &NetplaySession<H>, &NetplaySession<C>),
) where
    H: GameCallbacks,
    C: GameCallbacks,
{
    for round in 0..ticks {
        let input = (round % 7) as Input;
        host.update(input);
        client.update(input + 1);
        thread::sleep(TICK_INTERVAL);
        inspect(round, host, client);
    }
}
