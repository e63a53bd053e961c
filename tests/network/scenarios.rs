//! Gameplay over loopback: clean links, lossy links, laggy links, resync
//! and desync detection.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::Arc;

use serial_test::serial;
use shobu_rollback::telemetry::CollectingSink;
use shobu_rollback::{LinkSimulationConfig, Tick, MAX_ROLLBACK};

use crate::common::stubs::LocalOnlyStub;
use crate::common::{connect_games, connect_pair, loopback_config, run_ticks, PortAllocator};

/// Twenty clean ticks: the confirmed tick trails by at most
/// `MAX_ROLLBACK` and both sides stay in sync throughout.
#[test]
#[serial]
fn clean_link_stays_synced() {
    let sink = Arc::new(CollectingSink::new());
    let port = PortAllocator::next_port();
    let (mut host, mut client) =
        connect_pair(port, 2, loopback_config(&sink), loopback_config(&sink));

    run_ticks(&mut host, &mut client, 20, |_, host, client| {
        for (local, rollback) in [
            (host.local_tick(), host.rollback_tick()),
            (client.local_tick(), client.rollback_tick()),
        ] {
            assert!(local - rollback <= MAX_ROLLBACK, "local {local} rollback {rollback}");
        }
        assert!(host.state_is_synced());
        assert!(client.state_is_synced());
        assert!(host.is_connected() && client.is_connected());
    });

    assert!(host.local_tick() >= Tick::new(10));
    assert!(client.local_tick() >= Tick::new(10));
    let stats = host.network_stats();
    assert!(stats.frames_accepted > 0);
    assert!(stats.packets_sent >= 2 * 20);
    assert_eq!(stats.packets_dropped, 0);
    assert!(stats.update_interval_us > 0);
    assert_eq!(
        host.game().gs.frame,
        host.local_tick().as_i32() + 1,
        "replays leave exactly one game step per tick"
    );
}

/// Loss of every other frame with two copies per frame: no false
/// disconnect, and pace sync recovers within thirty ticks.
#[test]
#[serial]
fn lossy_link_recovers() {
    let sink = Arc::new(CollectingSink::new());
    let port = PortAllocator::next_port();
    let lossy = |seed| {
        loopback_config(&sink).with_simulation(LinkSimulationConfig::lossy().with_seed(seed))
    };
    let (mut host, mut client) = connect_pair(port, 2, lossy(1), lossy(2));

    run_ticks(&mut host, &mut client, 20, |_, host, client| {
        assert!(host.is_connected());
        assert!(client.is_connected());
    });

    let mut recovered = false;
    run_ticks(&mut host, &mut client, 30, |_, host, client| {
        recovered |= host.is_remote_synced() && client.is_remote_synced();
    });
    assert!(recovered);
    assert!(host.state_is_synced());
    assert!(client.state_is_synced());
    assert!(host.network_stats().packets_dropped > 0);
}

#[test]
#[serial]
fn laggy_link_delivers_late_frames() {
    let sink = Arc::new(CollectingSink::new());
    let port = PortAllocator::next_port();
    let laggy = || loopback_config(&sink).with_simulation(LinkSimulationConfig::laggy());
    let (mut host, mut client) = connect_pair(port, 2, laggy(), laggy());

    run_ticks(&mut host, &mut client, 60, |_, _, _| {});

    assert!(host.is_connected() && client.is_connected());
    assert!(host.state_is_synced() && client.state_is_synced());
    let stats = host.network_stats();
    assert!(stats.packets_delayed > 0);
    assert!(stats.frames_accepted > 0);
}

#[test]
#[serial]
fn stall_mode_never_rolls_back() {
    let sink = Arc::new(CollectingSink::new());
    let port = PortAllocator::next_port();
    let (mut host, mut client) =
        connect_pair(port, 2, loopback_config(&sink), loopback_config(&sink));
    host.set_rollbacks(false);
    client.set_rollbacks(false);

    run_ticks(&mut host, &mut client, 30, |_, host, client| {
        assert!(host.local_tick() - host.rollback_tick() <= 1);
        assert!(client.local_tick() - client.rollback_tick() <= 1);
    });

    assert_eq!(host.network_stats().rollbacks, 0);
    assert_eq!(client.network_stats().rollbacks, 0);
    assert_eq!(host.game().restores, 0);
    assert!(host.local_tick() >= Tick::new(5));
    assert!(host.state_is_synced() && client.state_is_synced());
}

#[test]
#[serial]
fn mutual_wait_restarts_both_timelines() {
    let sink = Arc::new(CollectingSink::new());
    let port = PortAllocator::next_port();
    let (mut host, mut client) =
        connect_pair(port, 2, loopback_config(&sink), loopback_config(&sink));

    run_ticks(&mut host, &mut client, 25, |_, _, _| {});
    assert!(host.local_tick() >= Tick::new(12));

    host.wait();
    client.wait();
    run_ticks(&mut host, &mut client, 8, |_, _, _| {});

    assert!(host.local_tick() < Tick::new(10));
    assert!(client.local_tick() < Tick::new(10));
    assert!(sink.contains("Resync complete"));
}

/// Games that ignore the other player diverge as soon as the inputs
/// differ; both sides notice once the diverged tick is confirmed.
#[test]
#[serial]
fn diverging_games_report_desync() {
    let sink = Arc::new(CollectingSink::new());
    let port = PortAllocator::next_port();
    let (mut host, mut client) = connect_games(
        port,
        2,
        (LocalOnlyStub::default(), LocalOnlyStub::default()),
        loopback_config(&sink),
        loopback_config(&sink),
    );

    let mut detected = false;
    run_ticks(&mut host, &mut client, 120, |_, host, client| {
        detected |= !host.state_is_synced() && !client.state_is_synced();
    });
    assert!(detected);
    assert!(sink.contains("Desync at tick"));

    host.force_synced();
    assert!(host.state_is_synced());
}
