//! Synthetic data-plane packet construction.
//!
//! Builds a deterministic Ethernet/IPv4/TCP frame for injection tests, and
//! derives the exact-match predicate for it. Byte-for-byte equality of the
//! injected and captured frame is the harness's round-trip invariant, so the
//! builder must be deterministic for fixed inputs.

use bytes::{BufMut, Bytes, BytesMut};

use crate::flow::FlowMatch;

/// Ethertype for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// IP protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;

/// A synthetic TCP packet with fixed, test-friendly defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpPacket {
    pub dl_dst: [u8; 6],
    pub dl_src: [u8; 6],
    pub ip_src: u32,
    pub ip_dst: u32,
    pub ip_ttl: u8,
    pub tcp_sport: u16,
    pub tcp_dport: u16,
    pub payload_len: usize,
}

impl Default for TcpPacket {
    fn default() -> Self {
        TcpPacket {
            dl_dst: [0x00, 0x01, 0x02, 0x03, 0x04, 0x05],
            dl_src: [0x00, 0x06, 0x07, 0x08, 0x09, 0x0a],
            ip_src: u32::from_be_bytes([192, 168, 0, 1]),
            ip_dst: u32::from_be_bytes([192, 168, 0, 2]),
            ip_ttl: 64,
            tcp_sport: 1234,
            tcp_dport: 80,
            payload_len: 46,
        }
    }
}

impl TcpPacket {
    /// Serialize to raw frame bytes: Ethernet II + IPv4 + TCP + pattern
    /// payload.
    pub fn build(&self) -> Bytes {
        let ip_len = 20 + 20 + self.payload_len;
        let mut buf = BytesMut::with_capacity(14 + ip_len);

        // Ethernet
        buf.put_slice(&self.dl_dst);
        buf.put_slice(&self.dl_src);
        buf.put_u16(ETHERTYPE_IPV4);

        // IPv4, no options
        let ihl_version = 0x45u8;
        buf.put_u8(ihl_version);
        buf.put_u8(0); // TOS
        buf.put_u16(ip_len as u16);
        buf.put_u16(0); // identification
        buf.put_u16(0); // flags/fragment
        buf.put_u8(self.ip_ttl);
        buf.put_u8(IPPROTO_TCP);
        let cksum_at = buf.len();
        buf.put_u16(0); // checksum placeholder
        buf.put_u32(self.ip_src);
        buf.put_u32(self.ip_dst);
        let cksum = ipv4_checksum(&buf[14..14 + 20]);
        buf[cksum_at..cksum_at + 2].copy_from_slice(&cksum.to_be_bytes());

        // TCP, no options; checksum left zero (the harness never routes
        // these frames through a real stack)
        buf.put_u16(self.tcp_sport);
        buf.put_u16(self.tcp_dport);
        buf.put_u32(1); // seq
        buf.put_u32(0); // ack
        buf.put_u8(0x50); // data offset 5
        buf.put_u8(0x02); // SYN
        buf.put_u16(4096); // window
        buf.put_u16(0); // checksum
        buf.put_u16(0); // urgent

        for i in 0..self.payload_len {
            buf.put_u8((i & 0xff) as u8);
        }

        buf.freeze()
    }

    /// Exact-match predicate for this packet's header fields. The ingress
    /// port stays wildcarded; pin it with [`FlowMatch::with_in_port`].
    pub fn flow_match(&self) -> FlowMatch {
        FlowMatch {
            wildcards: crate::flow::wildcards::IN_PORT,
            in_port: 0,
            dl_src: self.dl_src,
            dl_dst: self.dl_dst,
            dl_type: ETHERTYPE_IPV4,
            nw_src: self.ip_src,
            nw_dst: self.ip_dst,
            nw_proto: IPPROTO_TCP,
            tp_src: self.tcp_sport,
            tp_dst: self.tcp_dport,
        }
    }
}

/// RFC 1071 ones'-complement checksum over an IPv4 header.
fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in header.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += word as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
