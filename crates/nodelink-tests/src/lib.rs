//! nodelink Test & Validation
//!
//! Harness for running a master and its workers in one process, plus
//! end-to-end tests across the transport, client/server managers and batcher,
//! and property-based tests of the wire codec.

pub mod harness;
pub mod proptest_transport;

#[cfg(test)]
mod batcher_integration;
#[cfg(test)]
mod node_integration;

pub use harness::{init_test_tracing, wait_connected, TestCluster, TestEnv};
