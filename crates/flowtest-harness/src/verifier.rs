//! # FlowVerifier
//!
//! Verification protocols run against a ready fixture: the packet
//! round-trip check and the bounded-retry statistics poll that confirms
//! eventually-consistent counters after data-plane traffic.

use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{never, Receiver, RecvTimeoutError};
use tracing::{debug, info};

use flowtest_proto::stats::StatsSnapshot;
use flowtest_proto::MessageBody;
use flowtest_session::{ControlSession, DataSession};

use crate::config::TestContext;
use crate::error::HarnessError;
use crate::fixture::Fixture;
use crate::ops::{check, check_eq, fail};

/// Verification protocols over a fixture's control and data sessions.
pub struct FlowVerifier<'a> {
    control: &'a ControlSession,
    data: &'a DataSession,
    relaxed: bool,
    transact_timeout: Duration,
    retry_interval: Duration,
    cancel: Receiver<()>,
}

impl<'a> FlowVerifier<'a> {
    /// Requires a fixture with both control and data sessions established.
    pub fn new(fixture: &'a Fixture, ctx: &TestContext) -> Result<Self, HarnessError> {
        let control = fixture
            .control()
            .ok_or_else(|| fail("fixture has no control session"))?;
        let data = fixture
            .data()
            .ok_or_else(|| fail("fixture has no data session"))?;
        Ok(FlowVerifier {
            control,
            data,
            relaxed: ctx.config.relaxed_matching,
            transact_timeout: ctx.config.default_timeout,
            retry_interval: ctx.config.retry_interval,
            cancel: never(),
        })
    }

    /// Attach a cancellation channel: any message (or disconnect) aborts a
    /// verification in progress at its next pacing wait.
    pub fn with_cancel(mut self, cancel: Receiver<()>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Inject `pkt` on `ingress` and require it back on `egress`,
    /// byte-for-byte, within `timeout`.
    ///
    /// With relaxed matching the poll is constrained to the expected port
    /// and payload; with strict matching the poll accepts any packet and
    /// port/payload are verified explicitly here.
    pub fn send_and_verify(
        &self,
        pkt: &Bytes,
        ingress: u16,
        egress: u16,
        timeout: Duration,
    ) -> Result<(), HarnessError> {
        info!(ingress, egress, "sending packet");
        self.data
            .send(ingress, pkt.clone())
            .map_err(|e| fail(format!("failed to inject packet on port {ingress}: {e}")))?;

        let (want_port, want_pkt) = if self.relaxed {
            (Some(egress), Some(pkt))
        } else {
            (None, None)
        };
        let received = self.data.poll(want_port, want_pkt, timeout);
        let captured = match received {
            Some(captured) => captured,
            None => return Err(fail(format!("packet not received on port {egress}"))),
        };
        debug!(len = captured.data.len(), port = captured.port, "packet received");

        check_eq(captured.port, egress, "packet egress port")?;
        check(
            captured.data == *pkt,
            "response packet does not match sent packet",
        )
    }

    /// Poll `port`'s counters until `tx_packets == expected_tx` and
    /// `rx_packets == expected_rx` have each been observed, for at most
    /// `budget` rounds spaced one retry interval apart.
    ///
    /// The tx and rx conditions latch independently across rounds; they
    /// need not hold on the same round (see DESIGN.md). A reply with other
    /// than exactly one stats record is a hard failure, not a retry
    /// condition.
    pub fn verify_counts(
        &self,
        port: u16,
        budget: u32,
        expected_tx: u64,
        expected_rx: u64,
    ) -> Result<(), HarnessError> {
        let mut tx_satisfied = false;
        let mut rx_satisfied = false;
        let mut last: Option<StatsSnapshot> = None;

        for round in 0..budget {
            debug!(port, round, "sending stats request");
            let reply = self
                .control
                .transact(MessageBody::PortStatsRequest { port }, self.transact_timeout);
            let (msg, _raw) = match reply {
                Some(pair) => pair,
                None => return Err(fail(format!("no response to stats request for port {port}"))),
            };
            let stats = match msg.body {
                MessageBody::PortStatsReply { stats } => stats,
                other => {
                    return Err(fail(format!("unexpected reply to stats request: {other:?}")))
                }
            };
            check_eq(stats.len(), 1, "port stats record count")?;

            let snapshot = StatsSnapshot::from_stats(&stats[0], round);
            debug!(
                port,
                tx = snapshot.tx_packets,
                rx = snapshot.rx_packets,
                "observed counters"
            );
            if snapshot.tx_packets == expected_tx {
                tx_satisfied = true;
            }
            if snapshot.rx_packets == expected_rx {
                rx_satisfied = true;
            }
            last = Some(snapshot);

            if tx_satisfied && rx_satisfied {
                break;
            }
            if round + 1 < budget {
                self.pace()?;
            }
        }

        let last_seen = last
            .map(|s| format!("last saw tx={} rx={} (round {})", s.tx_packets, s.rx_packets, s.round))
            .unwrap_or_else(|| "no polling rounds ran".into());
        check(
            tx_satisfied,
            format!("port {port}: tx counter never reached {expected_tx}; {last_seen}"),
        )?;
        check(
            rx_satisfied,
            format!("port {port}: rx counter never reached {expected_rx}; {last_seen}"),
        )
    }

    /// Wait one retry interval, or abort if cancelled. The wait is a
    /// cancellable channel receive, not an unconditional sleep.
    fn pace(&self) -> Result<(), HarnessError> {
        match self.cancel.recv_timeout(self.retry_interval) {
            Err(RecvTimeoutError::Timeout) => Ok(()),
            _ => Err(fail("statistics verification cancelled")),
        }
    }
}
