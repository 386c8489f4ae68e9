//! Fake device-under-test for integration testing.
//!
//! [`FakeSwitch`] implements the harness's transport collaborator contracts
//! entirely in memory: a serde_json control "wire" it owns, a flow table,
//! per-port counters with an optional settle delay (to exercise the
//! bounded-retry statistics protocol), and exact-match forwarding between
//! ports. Behavior knobs let tests provoke every setup-failure path the
//! fixture state machine has to handle.

pub mod switch;

pub use switch::FakeSwitch;
