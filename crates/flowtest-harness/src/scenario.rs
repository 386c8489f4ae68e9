//! # Canonical scenario: flow install + count verification
//!
//! Installs an exact-match forwarding rule for a synthetic TCP packet,
//! fences it with a barrier, confirms zero counters, injects the packet a
//! random number of times, and confirms the counters caught up — rx on the
//! ingress port, tx on the egress port.

use rand::RngExt;
use tracing::info;

use flowtest_proto::{FlowAction, FlowSpec, TcpPacket};

use crate::config::TestContext;
use crate::error::HarnessError;
use crate::fixture::Fixture;
use crate::ops::{check, delete_all_flows, do_barrier, fail, install_flow, random_cookie};
use crate::verifier::FlowVerifier;

/// Counter-verification retry budget, in polling rounds.
pub const STATS_RETRY_BUDGET: u32 = 60;

/// Run the single-flow statistics scenario against a ready fixture with
/// control and data sessions. Uses the two lowest-numbered ports from the
/// configured port map.
pub fn single_flow_stats(fixture: &Fixture, ctx: &TestContext) -> Result<(), HarnessError> {
    let ports = ctx.config.sorted_ports();
    check(ports.len() > 1, "not enough ports for test")?;
    let (ingress, egress) = (ports[0], ports[1]);
    info!(ingress, egress, "single flow stats scenario");

    let control = fixture
        .control()
        .ok_or_else(|| fail("fixture has no control session"))?;
    let verifier = FlowVerifier::new(fixture, ctx)?;

    // Known-clean rule table before installing anything.
    delete_all_flows(control)?;

    let pkt = TcpPacket::default();
    let frame = pkt.build();
    let matching = pkt.flow_match().with_in_port(ingress);
    let spec = FlowSpec::new(matching, random_cookie())
        .with_action(FlowAction::Output { port: egress });

    info!(cookie = spec.cookie, "installing flow");
    install_flow(control, &spec)?;
    // Fence: the rule must be applied before any traffic or stats request
    // is interpreted.
    do_barrier(control, ctx.config.default_timeout)?;

    // No packets sent yet, so both ports must report zero.
    verifier.verify_counts(ingress, STATS_RETRY_BUDGET, 0, 0)?;
    verifier.verify_counts(egress, STATS_RETRY_BUDGET, 0, 0)?;

    let repeats: u64 = rand::rng().random_range(10..=20);
    info!(repeats, "sending test packets");
    for _ in 0..repeats {
        verifier.send_and_verify(&frame, ingress, egress, ctx.config.default_timeout)?;
    }

    verifier.verify_counts(ingress, STATS_RETRY_BUDGET, 0, repeats)?;
    verifier.verify_counts(egress, STATS_RETRY_BUDGET, repeats, 0)?;
    Ok(())
}
