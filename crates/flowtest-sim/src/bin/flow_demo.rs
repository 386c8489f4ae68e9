//! Smoke binary: drives a full flow-install/inject/count cycle against the
//! in-memory switch and prints the resulting counters.
//!
//! Usage: `flow_demo [--packets N] [--settle-ms M]`

use std::time::Duration;

use anyhow::{bail, Context, Result};
use flowtest_proto::{FlowAction, FlowSpec, MessageBody, TcpPacket};
use flowtest_session::{ControlSession, DataSession, SessionFactory};
use flowtest_sim::FakeSwitch;

const INGRESS: u16 = 1;
const EGRESS: u16 = 2;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let mut packets = 15u64;
    let mut settle_ms = 0u64;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--packets" => {
                packets = args.next().context("missing --packets value")?.parse()?;
            }
            "--settle-ms" => {
                settle_ms = args.next().context("missing --settle-ms value")?.parse()?;
            }
            other => bail!("unknown argument: {other}"),
        }
    }

    let timeout = Duration::from_millis(500);
    let switch = FakeSwitch::new(&[INGRESS, EGRESS]);
    switch.set_settle_delay(Duration::from_millis(settle_ms));

    let control = ControlSession::new(switch.control_transport()?);
    control.start();
    control.connect(timeout)?;
    control.set_keep_alive(true);

    let (features, _raw) = control
        .transact(MessageBody::FeaturesRequest, timeout)
        .context("no features reply")?;
    match features.body {
        MessageBody::FeaturesReply(reply) => {
            eprintln!(
                "handshake complete: version {} actions {:#x} ports {:?}",
                reply.version, reply.actions, reply.ports
            );
        }
        other => bail!("unexpected handshake reply: {other:?}"),
    }

    let data = DataSession::new(switch.data_link()?);
    data.start();

    let pkt = TcpPacket::default();
    let frame = pkt.build();
    control.send(MessageBody::FlowDeleteAll)?;
    let spec = FlowSpec::new(pkt.flow_match().with_in_port(INGRESS), 0x1234)
        .with_action(FlowAction::Output { port: EGRESS });
    control.send(MessageBody::FlowInstall(spec))?;
    control
        .transact(MessageBody::BarrierRequest, timeout)
        .context("no barrier reply")?;

    for i in 0..packets {
        data.send(INGRESS, frame.clone())?;
        if data.poll(Some(EGRESS), Some(&frame), timeout).is_none() {
            bail!("packet {i} was not forwarded to port {EGRESS}");
        }
    }
    eprintln!("{packets} packets forwarded {INGRESS} -> {EGRESS}");

    // Give delayed counters time to settle before the final readout.
    std::thread::sleep(Duration::from_millis(settle_ms));
    for port in [INGRESS, EGRESS] {
        let (reply, _raw) = control
            .transact(MessageBody::PortStatsRequest { port }, timeout)
            .with_context(|| format!("no stats reply for port {port}"))?;
        match reply.body {
            MessageBody::PortStatsReply { stats } => {
                for record in stats {
                    eprintln!(
                        "port {}: tx {} rx {}",
                        record.port_no, record.tx_packets, record.rx_packets
                    );
                }
            }
            other => bail!("unexpected stats reply: {other:?}"),
        }
    }

    data.shutdown();
    data.join();
    control.shutdown();
    control.join();
    Ok(())
}
