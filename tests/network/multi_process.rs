//! Multi-process network testing.
//!
//! These tests spawn two instances of `network_test_peer`, one hosting and
//! one joining, and compare their JSON summaries.
//!
//! # Requirements
//!
//! The `network_test_peer` binary must be built before running these tests:
//! ```bash
//! cargo build -p network-test-peer
//! ```
//! Without it the tests print a notice and pass.

// Allow print macros for test debugging output
#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used
)]

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serial_test::serial;

use crate::common::PortAllocator;

/// Result printed by a peer process.
#[derive(Debug, Deserialize)]
struct TestResult {
    success: bool,
    role: String,
    final_tick: i32,
    rollback_tick: i32,
    confirmed_checksum: u64,
    state_synced: bool,
    rollbacks: u64,
    packets_dropped: u64,
    error: Option<String>,
}

/// Link conditions for one peer.
#[derive(Debug, Clone, Copy, Default)]
struct PeerLink {
    loss: u32,
    lag: u32,
}

/// The binary name for the network test peer (platform-specific).
const PEER_BINARY_NAME: &str = if cfg!(windows) {
    "network_test_peer.exe"
} else {
    "network_test_peer"
};

/// Maximum time to wait for a peer process before considering it hung.
const PEER_PROCESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Finds the peer binary next to the test executable's target directory.
fn find_peer_binary() -> Option<PathBuf> {
    // Test executables are in target/debug/deps/, binaries in target/debug/
    let test_exe = std::env::current_exe().ok()?;
    let target_dir = test_exe.parent().and_then(|p| p.parent())?;
    let peer_binary = target_dir.join(PEER_BINARY_NAME);
    peer_binary.exists().then_some(peer_binary)
}

macro_rules! skip_if_no_peer_binary {
    () => {
        if find_peer_binary().is_none() {
            eprintln!(
                "SKIP: {} not found; build it with: cargo build -p network-test-peer",
                PEER_BINARY_NAME
            );
            return;
        }
    };
}

fn spawn_peer(args: &[String], link: PeerLink, ticks: i32) -> std::io::Result<Child> {
    let binary = find_peer_binary()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, PEER_BINARY_NAME))?;
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .arg("--ticks")
        .arg(ticks.to_string())
        .arg("--tick-ms")
        .arg("8")
        .arg("--seed")
        .arg("42");
    if link.loss > 0 {
        cmd.arg("--loss").arg(link.loss.to_string());
    }
    if link.lag > 0 {
        cmd.arg("--lag").arg(link.lag.to_string());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).spawn()
}

fn wait_for_peer(mut child: Child, name: &str) -> TestResult {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if start.elapsed() > PEER_PROCESS_TIMEOUT => {
                let _ = child.kill();
                let _ = child.wait();
                panic!("{name} timed out after {:?}", PEER_PROCESS_TIMEOUT);
            },
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Err(e) => panic!("{name} error checking process status: {e}"),
        }
    }

    let mut stdout = String::new();
    let mut stderr = String::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_string(&mut stdout);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_string(&mut stderr);
    }
    let last_line = stdout.lines().last().unwrap_or("");
    serde_json::from_str(last_line).unwrap_or_else(|e| {
        panic!("{name} printed no result ({e})\nstdout: {stdout}\nstderr: {stderr}")
    })
}

fn run_two_peers(
    delay: u8,
    ticks: i32,
    host_link: PeerLink,
    client_link: PeerLink,
) -> (TestResult, TestResult) {
    let port = PortAllocator::next_port();
    let host_args = vec![
        "host".to_owned(),
        "--port".to_owned(),
        port.to_string(),
        "--delay".to_owned(),
        delay.to_string(),
    ];
    let join_args = vec![
        "join".to_owned(),
        "--host".to_owned(),
        format!("127.0.0.1:{port}"),
    ];

    let host = spawn_peer(&host_args, host_link, ticks).expect("Failed to spawn host");
    // Give the host time to bind before the client sends its connect request
    thread::sleep(Duration::from_millis(200));
    let client = spawn_peer(&join_args, client_link, ticks).expect("Failed to spawn client");

    let host = wait_for_peer(host, "host");
    let client = wait_for_peer(client, "client");
    println!("host: {host:?}\nclient: {client:?}");
    (host, client)
}

#[test]
#[serial]
fn two_processes_finish_in_sync() {
    skip_if_no_peer_binary!();
    let (host, client) = run_two_peers(2, 200, PeerLink::default(), PeerLink::default());

    assert!(host.success, "host failed: {:?}", host.error);
    assert!(client.success, "client failed: {:?}", client.error);
    assert_eq!(host.role, "host");
    assert_eq!(client.role, "client");
    assert!(host.final_tick >= 200);
    assert!(client.final_tick >= 200);
    assert!(host.state_synced && client.state_synced);
    if host.rollback_tick == client.rollback_tick {
        assert_eq!(host.confirmed_checksum, client.confirmed_checksum);
    }
}

#[test]
#[serial]
fn two_processes_survive_loss_and_lag() {
    skip_if_no_peer_binary!();
    let link = PeerLink { loss: 3, lag: 2 };
    let (host, client) = run_two_peers(3, 150, link, link);

    assert!(host.success, "host failed: {:?}", host.error);
    assert!(client.success, "client failed: {:?}", client.error);
    assert!(host.packets_dropped > 0 || client.packets_dropped > 0);
    assert!(host.rollbacks > 0 || client.rollbacks > 0);
}
