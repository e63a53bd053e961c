//! Verification integration tests.
//!
//! Drives the rollback state machine directly through the `__internal`
//! module, without sockets or threads:
//! - Property tests with proptest for the input rings and frame handling
//! - Lockstep tests pairing two engines over an in-memory lossy link

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Verification test modules
mod verification {
    pub mod lockstep;
    pub mod property;
}
