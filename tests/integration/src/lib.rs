//! Multi-node integration tests for the FieldLink mesh
//!
//! This test suite validates:
//! - Two-node discovery over loopback with seed peers
//! - State synchronization: targeted pushes and stale-version rejection
//! - Reliable delivery: retry exhaustion and loss accounting
//! - Audio relay into per-channel buffers
//!
//! Each test runs its engines on a distinct base-port block so the suite
//! can run in parallel on one host.

pub mod test_utils;

#[cfg(test)]
mod discovery_tests;

#[cfg(test)]
mod state_sync_tests;

#[cfg(test)]
mod reliability_tests;

#[cfg(test)]
mod relay_tests;
