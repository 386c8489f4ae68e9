//! # flowtest-proto
//!
//! Logical protocol model shared by the flowtest harness and its session
//! collaborators. This crate owns *message kinds*, not wire bytes: framing
//! and encoding belong to whichever transport carries a session.
//!
//! ## Crate structure
//!
//! - [`message`] — control-plane message kinds and transaction ids
//! - [`flow`] — flow match/action model, `FlowSpec`
//! - [`stats`] — per-port counter records
//! - [`packet`] — synthetic data-plane packet construction

pub mod flow;
pub mod message;
pub mod packet;
pub mod stats;

pub use flow::{FlowAction, FlowMatch, FlowSpec, BUFFER_NONE};
pub use message::{ControlMessage, MessageBody};
pub use packet::TcpPacket;
pub use stats::PortStats;
