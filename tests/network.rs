//! Network integration tests.
//!
//! Two sessions talk over real UDP sockets on loopback:
//! - Handshake, abort and teardown
//! - Gameplay scenarios with and without simulated loss and latency
//! - Multi-process testing with the headless peer binary

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Network test modules
mod network {
    pub mod handshake;
    pub mod multi_process;
    pub mod scenarios;
}
