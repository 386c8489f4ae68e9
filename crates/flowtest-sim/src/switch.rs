//! The in-memory switch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use flowtest_proto::flow::FlowAction;
use flowtest_proto::message::FeaturesReply;
use flowtest_proto::packet::{ETHERTYPE_IPV4, IPPROTO_TCP};
use flowtest_proto::{ControlMessage, FlowMatch, FlowSpec, MessageBody, PortStats};
use flowtest_session::{
    ControlTransport, DataLink, SessionError, SessionFactory, TlsMaterial,
};

/// Datapath id every fake switch reports.
const DATAPATH_ID: u64 = 0x00fa_ceb0_0c00_0001;

/// Action bitmask reported in the features reply.
const SUPPORTED_ACTIONS: u32 = 0x0fff;

#[derive(Debug, Default, Clone, Copy)]
struct PortCounters {
    tx: u64,
    rx: u64,
}

/// A counter increment that becomes visible once its settle time passes.
struct PendingCount {
    due: Instant,
    port: u16,
    tx: bool,
}

struct SwitchState {
    flows: Vec<FlowSpec>,
    counters: HashMap<u16, PortCounters>,
    pending: Vec<PendingCount>,
    /// Delay before a counter increment shows up in stats replies.
    settle: Duration,
    data_taps: Vec<Sender<(u16, Bytes)>>,

    hellos_seen: u64,
    features_requests: u64,
    echo_replies_seen: u64,
    secure_connects: u64,

    // Failure-injection knobs.
    refuse_connect: bool,
    mute_features: bool,
    mute_stats: bool,
    withhold_peer_addr: bool,
    stats_records: usize,
    emit_echo_probe: bool,
}

struct SwitchInner {
    state: Mutex<SwitchState>,
    ports: Vec<u16>,
    probe_xid: AtomicU32,
}

fn lock<'a>(m: &'a Mutex<SwitchState>) -> MutexGuard<'a, SwitchState> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory DUT. Clone freely; clones share the same switch.
#[derive(Clone)]
pub struct FakeSwitch {
    inner: Arc<SwitchInner>,
}

impl FakeSwitch {
    pub fn new(ports: &[u16]) -> Self {
        FakeSwitch {
            inner: Arc::new(SwitchInner {
                state: Mutex::new(SwitchState {
                    flows: Vec::new(),
                    counters: ports.iter().map(|p| (*p, PortCounters::default())).collect(),
                    pending: Vec::new(),
                    settle: Duration::ZERO,
                    data_taps: Vec::new(),
                    hellos_seen: 0,
                    features_requests: 0,
                    echo_replies_seen: 0,
                    secure_connects: 0,
                    refuse_connect: false,
                    mute_features: false,
                    mute_stats: false,
                    withhold_peer_addr: false,
                    stats_records: 1,
                    emit_echo_probe: true,
                }),
                ports: ports.to_vec(),
                probe_xid: AtomicU32::new(0xec00),
            }),
        }
    }

    // ─── Behavior knobs ─────────────────────────────────────────────────

    /// Counter increments only become visible in stats replies after this
    /// delay, mimicking hardware whose counters update asynchronously.
    pub fn set_settle_delay(&self, settle: Duration) {
        lock(&self.inner.state).settle = settle;
    }

    /// Make `connect` fail.
    pub fn set_refuse_connect(&self, refuse: bool) {
        lock(&self.inner.state).refuse_connect = refuse;
    }

    /// Never answer features requests (handshake timeout path).
    pub fn set_mute_features(&self, mute: bool) {
        lock(&self.inner.state).mute_features = mute;
    }

    /// Never answer stats requests (transact timeout path).
    pub fn set_mute_stats(&self, mute: bool) {
        lock(&self.inner.state).mute_stats = mute;
    }

    /// Report no peer address even when connected.
    pub fn set_withhold_peer_addr(&self, withhold: bool) {
        lock(&self.inner.state).withhold_peer_addr = withhold;
    }

    /// Number of records per stats reply. Anything other than 1 must be a
    /// hard harness failure.
    pub fn set_stats_records(&self, records: usize) {
        lock(&self.inner.state).stats_records = records;
    }

    /// Whether a keep-alive probe is emitted alongside the features reply.
    pub fn set_emit_echo_probe(&self, emit: bool) {
        lock(&self.inner.state).emit_echo_probe = emit;
    }

    // ─── Observation ────────────────────────────────────────────────────

    pub fn hellos_seen(&self) -> u64 {
        lock(&self.inner.state).hellos_seen
    }

    pub fn features_requests(&self) -> u64 {
        lock(&self.inner.state).features_requests
    }

    pub fn echo_replies_seen(&self) -> u64 {
        lock(&self.inner.state).echo_replies_seen
    }

    pub fn secure_connects(&self) -> u64 {
        lock(&self.inner.state).secure_connects
    }

    pub fn flow_count(&self) -> usize {
        lock(&self.inner.state).flows.len()
    }

    /// Settled (visible) counters for a port.
    pub fn counters(&self, port: u16) -> (u64, u64) {
        let mut state = lock(&self.inner.state);
        materialize(&mut state);
        let c = state.counters.get(&port).copied().unwrap_or_default();
        (c.tx, c.rx)
    }
}

impl SessionFactory for FakeSwitch {
    fn control_transport(&self) -> Result<Arc<dyn ControlTransport>, SessionError> {
        let (to_harness_tx, to_harness_rx) = unbounded();
        Ok(Arc::new(FakeControlPort {
            inner: Arc::clone(&self.inner),
            to_harness_tx,
            to_harness_rx,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    fn data_link(&self) -> Result<Arc<dyn DataLink>, SessionError> {
        let (tap_tx, tap_rx) = unbounded();
        lock(&self.inner.state).data_taps.push(tap_tx);
        Ok(Arc::new(FakeDataPort {
            inner: Arc::clone(&self.inner),
            tap_rx,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Move settle-expired pending increments into the visible counters.
fn materialize(state: &mut SwitchState) {
    let now = Instant::now();
    let mut remaining = Vec::new();
    for p in state.pending.drain(..) {
        if p.due <= now {
            let c = state.counters.entry(p.port).or_default();
            if p.tx {
                c.tx += 1;
            } else {
                c.rx += 1;
            }
        } else {
            remaining.push(p);
        }
    }
    state.pending = remaining;
}

// ─── Control port ───────────────────────────────────────────────────────────

struct FakeControlPort {
    inner: Arc<SwitchInner>,
    to_harness_tx: Sender<Bytes>,
    to_harness_rx: Receiver<Bytes>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl FakeControlPort {
    fn reply(&self, msg: &ControlMessage) {
        let _ = self.to_harness_tx.send(encode(msg));
    }

    fn handle(&self, msg: ControlMessage) {
        let mut state = lock(&self.inner.state);
        match msg.body {
            MessageBody::Hello { .. } => {
                state.hellos_seen += 1;
            }
            MessageBody::EchoReply { .. } => {
                state.echo_replies_seen += 1;
            }
            MessageBody::EchoRequest { payload } => {
                drop(state);
                self.reply(&ControlMessage::new(msg.xid, MessageBody::EchoReply { payload }));
            }
            MessageBody::FeaturesRequest => {
                state.features_requests += 1;
                let mute = state.mute_features;
                let probe = state.emit_echo_probe;
                drop(state);
                if probe {
                    let xid = self.inner.probe_xid.fetch_add(1, Ordering::Relaxed);
                    self.reply(&ControlMessage::new(
                        xid,
                        MessageBody::EchoRequest { payload: vec![0xab] },
                    ));
                }
                if !mute {
                    self.reply(&ControlMessage::new(
                        msg.xid,
                        MessageBody::FeaturesReply(FeaturesReply {
                            version: 1,
                            datapath_id: DATAPATH_ID,
                            actions: SUPPORTED_ACTIONS,
                            ports: self.inner.ports.clone(),
                        }),
                    ));
                }
            }
            MessageBody::PortStatsRequest { port } => {
                if state.mute_stats {
                    return;
                }
                materialize(&mut state);
                let c = state.counters.get(&port).copied().unwrap_or_default();
                let record = PortStats {
                    port_no: port,
                    tx_packets: c.tx,
                    rx_packets: c.rx,
                };
                let stats = vec![record; state.stats_records];
                drop(state);
                self.reply(&ControlMessage::new(
                    msg.xid,
                    MessageBody::PortStatsReply { stats },
                ));
            }
            MessageBody::FlowInstall(spec) => {
                debug!(cookie = spec.cookie, "flow installed");
                state.flows.push(spec);
            }
            MessageBody::FlowDeleteAll => {
                state.flows.clear();
            }
            MessageBody::BarrierRequest => {
                // Commands are applied synchronously, so the fence holds by
                // the time the reply is sent.
                drop(state);
                self.reply(&ControlMessage::new(msg.xid, MessageBody::BarrierReply));
            }
            MessageBody::FeaturesReply(_)
            | MessageBody::PortStatsReply { .. }
            | MessageBody::BarrierReply
            | MessageBody::Error { .. } => {
                debug!(xid = msg.xid, "ignoring unexpected message from harness");
            }
        }
    }
}

fn encode(msg: &ControlMessage) -> Bytes {
    // The sim owns its wire format; serde_json keeps failures readable.
    Bytes::from(serde_json::to_vec(msg).expect("control message serializes"))
}

impl ControlTransport for FakeControlPort {
    fn connect(&self, _timeout: Duration) -> Result<(), SessionError> {
        if lock(&self.inner.state).refuse_connect {
            return Err(SessionError::Connect("switch unreachable".into()));
        }
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn secure_connect(&self, tls: &TlsMaterial, timeout: Duration) -> Result<(), SessionError> {
        if tls.key.as_os_str().is_empty()
            || tls.cert.as_os_str().is_empty()
            || tls.trust_anchors.as_os_str().is_empty()
        {
            return Err(SessionError::Connect("incomplete TLS material".into()));
        }
        lock(&self.inner.state).secure_connects += 1;
        self.connect(timeout)
    }

    fn send_frame(&self, frame: Bytes) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(SessionError::Closed);
        }
        let msg = self.decode(&frame)?;
        self.handle(msg);
        Ok(())
    }

    fn recv_frame(&self, timeout: Duration) -> Result<Option<Bytes>, SessionError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(SessionError::Closed);
        }
        match self.to_harness_rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::Closed),
        }
    }

    fn encode(&self, msg: &ControlMessage) -> Result<Bytes, SessionError> {
        Ok(encode(msg))
    }

    fn decode(&self, frame: &Bytes) -> Result<ControlMessage, SessionError> {
        serde_json::from_slice(frame).map_err(|e| SessionError::Codec(e.to_string()))
    }

    fn peer_addr(&self) -> Option<String> {
        if !self.connected.load(Ordering::Relaxed) {
            return None;
        }
        if lock(&self.inner.state).withhold_peer_addr {
            return None;
        }
        Some("fake-dut:6653".into())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
    }
}

// ─── Data port ──────────────────────────────────────────────────────────────

struct FakeDataPort {
    inner: Arc<SwitchInner>,
    tap_rx: Receiver<(u16, Bytes)>,
    closed: AtomicBool,
}

impl DataLink for FakeDataPort {
    fn send_frame(&self, port: u16, data: Bytes) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(SessionError::Closed);
        }
        let mut state = lock(&self.inner.state);
        let due = Instant::now() + state.settle;
        state.pending.push(PendingCount {
            due,
            port,
            tx: false,
        });

        let fields = parse_fields(&data);
        let action = state
            .flows
            .iter()
            .find(|flow| flow.matching.matches(port, &fields))
            .and_then(|flow| flow.actions.first().copied());

        match action {
            Some(FlowAction::Output { port: egress }) => {
                state.pending.push(PendingCount {
                    due,
                    port: egress,
                    tx: true,
                });
                let taps = state.data_taps.clone();
                drop(state);
                for tap in &taps {
                    let _ = tap.send((egress, data.clone()));
                }
            }
            Some(FlowAction::Drop) | None => {
                debug!(port, "packet dropped (no matching flow)");
            }
        }
        Ok(())
    }

    fn recv_frame(&self, timeout: Duration) -> Result<Option<(u16, Bytes)>, SessionError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(SessionError::Closed);
        }
        match self.tap_rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::Closed),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// Extract the header fields the flow table matches on. Unknown or
/// truncated layers leave fields zeroed, which exact-match rules then
/// reject.
fn parse_fields(data: &Bytes) -> FlowMatch {
    let mut fields = FlowMatch {
        wildcards: 0,
        in_port: 0,
        dl_src: [0; 6],
        dl_dst: [0; 6],
        dl_type: 0,
        nw_src: 0,
        nw_dst: 0,
        nw_proto: 0,
        tp_src: 0,
        tp_dst: 0,
    };
    if data.len() < 14 {
        return fields;
    }
    fields.dl_dst.copy_from_slice(&data[0..6]);
    fields.dl_src.copy_from_slice(&data[6..12]);
    fields.dl_type = u16::from_be_bytes([data[12], data[13]]);
    if fields.dl_type != ETHERTYPE_IPV4 || data.len() < 14 + 20 {
        return fields;
    }
    let ip = &data[14..];
    let ihl = (ip[0] & 0x0f) as usize * 4;
    fields.nw_proto = ip[9];
    fields.nw_src = u32::from_be_bytes([ip[12], ip[13], ip[14], ip[15]]);
    fields.nw_dst = u32::from_be_bytes([ip[16], ip[17], ip[18], ip[19]]);
    if fields.nw_proto != IPPROTO_TCP || data.len() < 14 + ihl + 4 {
        return fields;
    }
    let tcp = &data[14 + ihl..];
    fields.tp_src = u16::from_be_bytes([tcp[0], tcp[1]]);
    fields.tp_dst = u16::from_be_bytes([tcp[2], tcp[3]]);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtest_proto::TcpPacket;

    #[test]
    fn parse_fields_recovers_packet_headers() {
        let pkt = TcpPacket::default();
        let fields = parse_fields(&pkt.build());
        let want = pkt.flow_match();
        assert_eq!(fields.dl_src, want.dl_src);
        assert_eq!(fields.dl_dst, want.dl_dst);
        assert_eq!(fields.dl_type, want.dl_type);
        assert_eq!(fields.nw_src, want.nw_src);
        assert_eq!(fields.nw_dst, want.nw_dst);
        assert_eq!(fields.nw_proto, want.nw_proto);
        assert_eq!(fields.tp_src, want.tp_src);
        assert_eq!(fields.tp_dst, want.tp_dst);
    }

    #[test]
    fn parse_fields_tolerates_runts() {
        let fields = parse_fields(&Bytes::from_static(b"short"));
        assert_eq!(fields.dl_type, 0);
        assert_eq!(fields.tp_dst, 0);
    }

    #[test]
    fn forwarding_updates_counters_and_taps() {
        let switch = FakeSwitch::new(&[1, 2]);
        let link = switch.data_link().unwrap();

        // Install a P1 → P2 exact-match rule through a control port.
        let control = switch.control_transport().unwrap();
        control.connect(Duration::from_millis(10)).unwrap();
        let pkt = TcpPacket::default();
        let spec = FlowSpec::new(pkt.flow_match().with_in_port(1), 7)
            .with_action(FlowAction::Output { port: 2 });
        let install = ControlMessage::new(1, MessageBody::FlowInstall(spec));
        control.send_frame(encode(&install)).unwrap();
        assert_eq!(switch.flow_count(), 1);

        let frame = pkt.build();
        link.send_frame(1, frame.clone()).unwrap();

        let (egress, data) = link
            .recv_frame(Duration::from_millis(200))
            .unwrap()
            .expect("forwarded frame");
        assert_eq!(egress, 2);
        assert_eq!(data, frame);
        assert_eq!(switch.counters(1), (0, 1));
        assert_eq!(switch.counters(2), (1, 0));
    }

    #[test]
    fn unmatched_packet_is_dropped_but_counted_on_ingress() {
        let switch = FakeSwitch::new(&[1, 2]);
        let link = switch.data_link().unwrap();
        link.send_frame(1, TcpPacket::default().build()).unwrap();
        assert!(link.recv_frame(Duration::from_millis(50)).unwrap().is_none());
        assert_eq!(switch.counters(1), (0, 1));
        assert_eq!(switch.counters(2), (0, 0));
    }

    #[test]
    fn settle_delay_hides_counters_until_due() {
        let switch = FakeSwitch::new(&[1]);
        switch.set_settle_delay(Duration::from_millis(80));
        let link = switch.data_link().unwrap();
        link.send_frame(1, TcpPacket::default().build()).unwrap();
        assert_eq!(switch.counters(1), (0, 0));
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(switch.counters(1), (0, 1));
    }
}
