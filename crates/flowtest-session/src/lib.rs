//! # flowtest-session
//!
//! Control-plane and data-plane session runtimes for the flowtest harness.
//!
//! A session wraps a collaborator-supplied transport and runs the background
//! machinery the harness core depends on but never sees: a receive thread
//! that demultiplexes control replies by transaction id, auto-answers
//! keep-alive probes, and fulfils pending `transact` calls; and a capture
//! thread that feeds a bounded, filterable packet queue drained by `poll`.
//!
//! All blocking is cooperative: `transact` and `poll` time out by returning
//! `None`, never by raising.
//!
//! ## Crate structure
//!
//! - [`transport`] — collaborator contracts ([`ControlTransport`],
//!   [`DataLink`], [`SessionFactory`]) and TLS material
//! - [`control`] — [`ControlSession`] runtime
//! - [`data`] — [`DataSession`] runtime

pub mod control;
pub mod data;
pub mod transport;

pub use control::ControlSession;
pub use data::{CapturedPacket, DataSession};
pub use transport::{ControlTransport, DataLink, SessionFactory, TlsMaterial};

use thiserror::Error;

/// Session-layer errors. Timeouts are *not* errors: `transact` and `poll`
/// report them as absent results.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport connect failed: {0}")]
    Connect(String),
    #[error("session is not active")]
    Inactive,
    #[error("codec error: {0}")]
    Codec(String),
    #[error("transport send failed: {0}")]
    Send(String),
    #[error("transport closed")]
    Closed,
    #[error("capture I/O error: {0}")]
    Capture(#[from] std::io::Error),
}
