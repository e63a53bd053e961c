//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `stubs`: deterministic game stubs implementing `GameCallbacks`
//! - `test_utils`: port allocation, session pairing and tick pumping
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! #[path = "common/mod.rs"]
//! mod common;
//! use common::stubs::GameStub;
//! use common::test_utils::{connect_pair, PortAllocator};
//! ```

pub mod stubs;
pub mod test_utils;

// These are public utilities for integration tests - allow unused until tests adopt them.
#[allow(unused_imports)]
pub use test_utils::{
    connect_games, connect_pair, loopback_config, run_ticks, PortAllocator, TICK_INTERVAL,
};
