//! # flowtest-harness
//!
//! Conformance-test harness core for devices speaking a software-defined
//! switch control protocol. A test drives the device-under-test through two
//! independent channels — a control-plane session and a data-plane
//! injector/capture point — and this crate composes them into reusable
//! fixtures, then verifies that control-plane actions produce the expected
//! data-plane and counter effects under real hardware timing.
//!
//! ## Crate structure
//!
//! - [`fixture`] — fixture lifecycle state machine, capability-set builder,
//!   setup delegation (`inherit_setup`), teardown contract
//! - [`verifier`] — packet round-trip check and the bounded-retry
//!   statistics-verification protocol
//! - [`ops`] — transaction and assertion helpers shared by tests
//! - [`scenario`] — the canonical flow-install-and-count scenario
//! - [`config`] — TOML configuration and the per-suite [`TestContext`]
//! - [`error`] — failure taxonomy
//!
//! The wire format, raw transport, and packet-capture format are
//! collaborator concerns; see `flowtest-session` for the contracts.

pub mod config;
pub mod error;
pub mod fixture;
pub mod ops;
pub mod scenario;
pub mod verifier;

pub use config::{HarnessConfig, HarnessConfigInput, TestContext};
pub use error::HarnessError;
pub use fixture::{run_test, Capability, Fixture, FixtureBuilder, FixtureState};
pub use verifier::FlowVerifier;

/// Install the process-wide log subscriber for binaries and test runs.
/// Safe to call repeatedly; only the first call wins.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
