//! Headless network test peer for multi-process testing.
//!
//! Runs one side of a match over real UDP sockets with a deterministic
//! stub game, then prints a JSON summary on the last line of stdout.
//!
//! # Usage
//!
//! ```bash
//! # Host on port 9000 with input delay 3
//! cargo run -p network-test-peer -- host --port 9000 --delay 3 --ticks 300
//!
//! # Join it
//! cargo run -p network-test-peer -- join --host 127.0.0.1:9000 --ticks 300
//! ```
//!
//! # Link simulation
//!
//! ```bash
//! --loss 2      # drop one in two outbound frames
//! --lag 4       # hold outbound frames for four flush intervals
//! --seed 42     # reproducible loss
//! ```
//!
//! # Output
//!
//! ```json
//! {"success": true, "role": "host", "final_tick": 300, "state_synced": true, ...}
//! ```

use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use shobu_rollback::hash::{checksum_of, fnv1a_hash};
use shobu_rollback::telemetry::{LogSink, NullSink, TracingSink};
use shobu_rollback::{
    Checksum, GameCallbacks, Input, LinkSimulationConfig, NetplayError, NetplaySession,
    NetworkConfig, SessionConfig,
};

#[derive(Parser, Debug)]
#[command(name = "network_test_peer", about = "Headless shobu-rollback peer")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Wait for a client on PORT.
    Host {
        #[arg(long, default_value_t = 9000)]
        port: u16,
        /// Input delay sent to the client.
        #[arg(long, default_value_t = 2)]
        delay: u8,
    },
    /// Connect to a host at HOST:PORT.
    Join {
        #[arg(long)]
        host: String,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Ticks to simulate before disconnecting.
    #[arg(long, global = true, default_value_t = 300)]
    ticks: i32,
    /// Wall time per tick in milliseconds.
    #[arg(long, global = true, default_value_t = 16)]
    tick_ms: u64,
    /// Keep ticking this long after reaching the target, so the peer can
    /// reach it too.
    #[arg(long, global = true, default_value_t = 500)]
    linger_ms: u64,
    /// Drop one in LOSS outbound frames (0 disables).
    #[arg(long, global = true, default_value_t = 0)]
    loss: u32,
    /// Hold outbound frames for LAG flush intervals (0 disables).
    #[arg(long, global = true, default_value_t = 0)]
    lag: u32,
    #[arg(long, global = true)]
    seed: Option<u64>,
    /// Give up after this many seconds.
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,
    /// Disable rollback and stall for input instead.
    #[arg(long, global = true)]
    no_rollback: bool,
    /// Print engine logs to stderr.
    #[arg(long, global = true)]
    verbose: bool,
}

/// Deterministic game state; the host plays player one.
#[derive(Clone, Copy, Default, Hash)]
struct TestState {
    frame: i32,
    value: i64,
}

#[derive(Default)]
struct TestGame {
    state: TestState,
    saved: TestState,
    is_client: bool,
}

impl GameCallbacks for TestGame {
    fn update(&mut self, local: Input, remote: Input) {
        let (p1, p2) = if self.is_client {
            (remote, local)
        } else {
            (local, remote)
        };
        self.state.value = self
            .state
            .value
            .wrapping_mul(31)
            .wrapping_add(i64::from(p1) * 3 + i64::from(p2) * 5);
        self.state.frame += 1;
    }

    fn store(&mut self) {
        self.saved = self.state;
    }

    fn restore(&mut self) {
        self.state = self.saved;
    }

    fn checksum(&mut self) -> Checksum {
        checksum_of(&self.state)
    }
}

#[derive(Serialize, Default)]
struct TestResult {
    success: bool,
    role: &'static str,
    final_tick: i32,
    rollback_tick: i32,
    /// FNV-1a of the last state both peers confirmed.
    confirmed_checksum: u64,
    state_synced: bool,
    rollbacks: u64,
    waits: u64,
    frames_accepted: u64,
    packets_dropped: u64,
    ping_ms: u32,
    error: Option<String>,
}

fn input_for(tick: i32, is_client: bool) -> Input {
    let salt = if is_client { 7 } else { 3 };
    (tick.wrapping_mul(salt) % 11) as Input
}

fn run(cli: &Cli) -> Result<TestResult, NetplayError> {
    let run = &cli.run;
    let log: Arc<dyn LogSink> = if run.verbose {
        Arc::new(TracingSink)
    } else {
        Arc::new(NullSink)
    };
    let mut simulation = LinkSimulationConfig::passthrough()
        .with_loss_frequency(run.loss)
        .with_packet_delay(run.lag);
    if let Some(seed) = run.seed {
        simulation = simulation.with_seed(seed);
    }
    let config = SessionConfig::default()
        .with_network(
            NetworkConfig::lan().with_host_wait_timeout(Some(Duration::from_secs(run.timeout))),
        )
        .with_simulation(simulation)
        .with_rollbacks(!run.no_rollback)
        .with_log_sink(log);

    let (mut session, role) = match &cli.mode {
        Mode::Host { port, delay } => {
            let mut session = NetplaySession::host(*port, TestGame::default(), config)?;
            session.set_input_delay(*delay);
            session.wait_for_client()?;
            (session, "host")
        },
        Mode::Join { host } => {
            let game = TestGame {
                is_client: true,
                ..TestGame::default()
            };
            let mut session = NetplaySession::client(host, game, config)?;
            session.connect_to_host()?;
            (session, "client")
        },
    };

    let is_client = !session.is_host();
    let tick_interval = Duration::from_millis(run.tick_ms);
    let deadline = Instant::now() + Duration::from_secs(run.timeout);
    let mut error = None;
    let mut reached_at: Option<Instant> = None;

    loop {
        let started = Instant::now();
        if !session.is_connected() {
            if reached_at.is_none() {
                error = Some(format!("peer left at tick {}", session.local_tick()));
            }
            break;
        }
        if started > deadline {
            error = Some(format!("timed out at tick {}", session.local_tick()));
            break;
        }
        let tick = session.local_tick().as_i32() + 1;
        session.update(input_for(tick, is_client));

        if reached_at.is_none() && session.local_tick().as_i32() >= run.ticks {
            reached_at = Some(Instant::now());
        }
        if reached_at.is_some_and(|at| at.elapsed() >= Duration::from_millis(run.linger_ms)) {
            break;
        }
        thread::sleep(tick_interval.saturating_sub(started.elapsed()));
    }

    let stats = session.network_stats();
    let state_synced = session.state_is_synced();
    let confirmed_checksum = fnv1a_hash(&session.game().saved);
    session.disconnect();

    Ok(TestResult {
        success: error.is_none() && state_synced,
        role,
        final_tick: stats.local_tick.as_i32(),
        rollback_tick: stats.rollback_tick.as_i32(),
        confirmed_checksum,
        state_synced,
        rollbacks: stats.rollbacks,
        waits: stats.waits,
        frames_accepted: stats.frames_accepted,
        packets_dropped: stats.packets_dropped,
        ping_ms: stats.ping_ms,
        error,
    })
}

fn main() {
    let cli = Cli::parse();
    if cli.run.verbose {
        tracing_subscriber::fmt()
            .with_writer(io::stderr)
            .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
            .init();
    }

    let result = run(&cli).unwrap_or_else(|err| TestResult {
        error: Some(err.to_string()),
        ..TestResult::default()
    });
    let success = result.success;

    let mut stdout = io::stdout().lock();
    match serde_json::to_string(&result) {
        Ok(json) => {
            let _ = writeln!(stdout, "{json}");
        },
        Err(err) => eprintln!("failed to serialize result: {err}"),
    }
    let _ = stdout.flush();
    std::process::exit(if success { 0 } else { 1 });
}
