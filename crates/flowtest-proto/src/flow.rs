//! Flow match/action model.
//!
//! A flow is a match-predicate-to-action binding installed on the DUT. The
//! match carries a wildcard bitmask: a set bit means the corresponding field
//! is ignored when matching.

use serde::{Deserialize, Serialize};

// ─── Wildcard bits ──────────────────────────────────────────────────────────

pub mod wildcards {
    pub const IN_PORT: u32 = 1 << 0;
    pub const DL_SRC: u32 = 1 << 1;
    pub const DL_DST: u32 = 1 << 2;
    pub const DL_TYPE: u32 = 1 << 3;
    pub const NW_SRC: u32 = 1 << 4;
    pub const NW_DST: u32 = 1 << 5;
    pub const NW_PROTO: u32 = 1 << 6;
    pub const TP_SRC: u32 = 1 << 7;
    pub const TP_DST: u32 = 1 << 8;

    /// Every field wildcarded: matches any packet.
    pub const ALL: u32 = IN_PORT
        | DL_SRC
        | DL_DST
        | DL_TYPE
        | NW_SRC
        | NW_DST
        | NW_PROTO
        | TP_SRC
        | TP_DST;
}

/// Buffer-id sentinel meaning "no buffered packet".
pub const BUFFER_NONE: u32 = 0xffff_ffff;

// ─── Match ──────────────────────────────────────────────────────────────────

/// Match predicate: header fields plus a wildcard mask. A set wildcard bit
/// means the field is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMatch {
    pub wildcards: u32,
    pub in_port: u16,
    pub dl_src: [u8; 6],
    pub dl_dst: [u8; 6],
    pub dl_type: u16,
    pub nw_src: u32,
    pub nw_dst: u32,
    pub nw_proto: u8,
    pub tp_src: u16,
    pub tp_dst: u16,
}

impl FlowMatch {
    /// A match with every field wildcarded.
    pub fn any() -> Self {
        FlowMatch {
            wildcards: wildcards::ALL,
            in_port: 0,
            dl_src: [0; 6],
            dl_dst: [0; 6],
            dl_type: 0,
            nw_src: 0,
            nw_dst: 0,
            nw_proto: 0,
            tp_src: 0,
            tp_dst: 0,
        }
    }

    /// Pin the ingress port: set the field and clear its wildcard bit.
    pub fn with_in_port(mut self, port: u16) -> Self {
        self.in_port = port;
        self.wildcards &= !wildcards::IN_PORT;
        self
    }

    /// Whether a packet's header fields, as seen on `in_port`, satisfy this
    /// predicate.
    pub fn matches(&self, in_port: u16, other: &FlowMatch) -> bool {
        let w = self.wildcards;
        (w & wildcards::IN_PORT != 0 || self.in_port == in_port)
            && (w & wildcards::DL_SRC != 0 || self.dl_src == other.dl_src)
            && (w & wildcards::DL_DST != 0 || self.dl_dst == other.dl_dst)
            && (w & wildcards::DL_TYPE != 0 || self.dl_type == other.dl_type)
            && (w & wildcards::NW_SRC != 0 || self.nw_src == other.nw_src)
            && (w & wildcards::NW_DST != 0 || self.nw_dst == other.nw_dst)
            && (w & wildcards::NW_PROTO != 0 || self.nw_proto == other.nw_proto)
            && (w & wildcards::TP_SRC != 0 || self.tp_src == other.tp_src)
            && (w & wildcards::TP_DST != 0 || self.tp_dst == other.tp_dst)
    }
}

// ─── Actions ────────────────────────────────────────────────────────────────

/// Forwarding actions referenced by the harness core. The full action
/// catalogue is the transport collaborator's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    /// Forward the packet out the given port.
    Output { port: u16 },
    /// Discard the packet.
    Drop,
}

// ─── FlowSpec ───────────────────────────────────────────────────────────────

/// One forwarding rule as installed by a test: match predicate, action list,
/// a cookie unique per installation, timeouts, and the buffered-packet id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSpec {
    pub matching: FlowMatch,
    pub actions: Vec<FlowAction>,
    pub cookie: u64,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub buffer_id: u32,
}

impl FlowSpec {
    /// A rule with the given match and cookie, no actions, no timeouts, and
    /// no buffered packet.
    pub fn new(matching: FlowMatch, cookie: u64) -> Self {
        FlowSpec {
            matching,
            actions: Vec::new(),
            cookie,
            idle_timeout: 0,
            hard_timeout: 0,
            buffer_id: BUFFER_NONE,
        }
    }

    pub fn with_action(mut self, action: FlowAction) -> Self {
        self.actions.push(action);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_match_matches_everything() {
        let rule = FlowMatch::any();
        let pkt = FlowMatch {
            wildcards: 0,
            in_port: 3,
            dl_src: [1; 6],
            dl_dst: [2; 6],
            dl_type: 0x0800,
            nw_src: 0x0a000001,
            nw_dst: 0x0a000002,
            nw_proto: 6,
            tp_src: 1234,
            tp_dst: 80,
        };
        assert!(rule.matches(3, &pkt));
        assert!(rule.matches(99, &pkt));
    }

    #[test]
    fn in_port_pinning_clears_wildcard() {
        let rule = FlowMatch::any().with_in_port(2);
        assert_eq!(rule.wildcards & wildcards::IN_PORT, 0);
        let pkt = FlowMatch::any();
        assert!(rule.matches(2, &pkt));
        assert!(!rule.matches(3, &pkt));
    }

    #[test]
    fn exact_match_rejects_field_mismatch() {
        let mut fields = FlowMatch::any();
        fields.wildcards = 0;
        fields.dl_type = 0x0800;
        fields.tp_dst = 80;
        let rule = fields.with_in_port(1);

        assert!(rule.matches(1, &fields));
        let mut other = fields;
        other.tp_dst = 443;
        assert!(!rule.matches(1, &other));
    }

    #[test]
    fn flow_spec_defaults() {
        let spec = FlowSpec::new(FlowMatch::any(), 0xdead_beef)
            .with_action(FlowAction::Output { port: 2 });
        assert_eq!(spec.buffer_id, BUFFER_NONE);
        assert_eq!(spec.idle_timeout, 0);
        assert_eq!(spec.hard_timeout, 0);
        assert_eq!(spec.actions, vec![FlowAction::Output { port: 2 }]);
    }
}
