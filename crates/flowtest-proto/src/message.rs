//! Control-plane message kinds.
//!
//! Every message carries a transaction id (`xid`). Replies echo the xid of
//! the request that caused them; this is the only correlation mechanism the
//! harness relies on. Unsolicited messages (echo probes from the DUT,
//! asynchronous notifications) carry xids of the DUT's choosing.

use serde::{Deserialize, Serialize};

use crate::flow::FlowSpec;
use crate::stats::PortStats;

/// Negotiated protocol version at which the supported-action bitmask is
/// reported in the features reply.
pub const VERSION_WITH_ACTION_BITMASK: u8 = 1;

/// A control-plane message: transaction id plus typed body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub xid: u32,
    pub body: MessageBody,
}

impl ControlMessage {
    pub fn new(xid: u32, body: MessageBody) -> Self {
        ControlMessage { xid, body }
    }

    /// Whether this message is a request the peer is expected to answer.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self.body,
            MessageBody::FeaturesRequest
                | MessageBody::PortStatsRequest { .. }
                | MessageBody::BarrierRequest
                | MessageBody::EchoRequest { .. }
        )
    }
}

/// The logical message kinds the harness core references. The full protocol
/// catalogue lives with the transport collaborator; these are only the kinds
/// the fixture and verifier traffic in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Initial greeting, sent by each side at session start unless
    /// suppressed for handshake-control tests.
    Hello { version: u8 },
    /// Keep-alive probe. Auto-answered by the session when keep-alive is
    /// enabled.
    EchoRequest { payload: Vec<u8> },
    EchoReply { payload: Vec<u8> },
    /// Capability/version negotiation request (the handshake transaction).
    FeaturesRequest,
    FeaturesReply(FeaturesReply),
    /// Per-port counter query.
    PortStatsRequest { port: u16 },
    PortStatsReply { stats: Vec<PortStats> },
    /// Install one forwarding rule.
    FlowInstall(FlowSpec),
    /// Remove every rule on the DUT.
    FlowDeleteAll,
    /// Fence: all preceding commands are applied before the reply is sent.
    BarrierRequest,
    BarrierReply,
    /// DUT-reported protocol error.
    Error { code: u16, message: String },
}

/// Features reply payload: negotiated version and capability report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturesReply {
    pub version: u8,
    pub datapath_id: u64,
    /// Supported-action bitmask; meaningful when
    /// `version == VERSION_WITH_ACTION_BITMASK`.
    pub actions: u32,
    pub ports: Vec<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_expect_replies() {
        let req = ControlMessage::new(7, MessageBody::FeaturesRequest);
        assert!(req.expects_reply());
        let barrier = ControlMessage::new(8, MessageBody::BarrierRequest);
        assert!(barrier.expects_reply());
    }

    #[test]
    fn notifications_do_not_expect_replies() {
        let hello = ControlMessage::new(0, MessageBody::Hello { version: 1 });
        assert!(!hello.expects_reply());
        let err = ControlMessage::new(
            9,
            MessageBody::Error {
                code: 3,
                message: "bad table".into(),
            },
        );
        assert!(!err.expects_reply());
    }

    #[test]
    fn message_survives_json_round_trip() {
        let msg = ControlMessage::new(
            42,
            MessageBody::PortStatsReply {
                stats: vec![PortStats {
                    port_no: 1,
                    tx_packets: 15,
                    rx_packets: 0,
                }],
            },
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }
}
