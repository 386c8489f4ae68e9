//! Per-port counter records reported by the DUT.

use serde::{Deserialize, Serialize};

/// One port's counters as reported in a port-stats reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStats {
    pub port_no: u16,
    pub tx_packets: u64,
    pub rx_packets: u64,
}

/// Counters observed during one polling round, kept for failure reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub port_no: u16,
    pub tx_packets: u64,
    pub rx_packets: u64,
    /// Polling round (0-based) this snapshot was taken in.
    pub round: u32,
}

impl StatsSnapshot {
    pub fn from_stats(stats: &PortStats, round: u32) -> Self {
        StatsSnapshot {
            port_no: stats.port_no,
            tx_packets: stats.tx_packets,
            rx_packets: stats.rx_packets,
            round,
        }
    }
}
