//! Collaborator contracts for the transports underneath a session.
//!
//! The harness core owns no wire format: a [`ControlTransport`] both frames
//! and encodes/decodes control messages, so raw socket/TLS plumbing and the
//! concrete encoding live entirely with the implementor. The sim crate
//! provides in-memory implementations; production deployments implement
//! these over real connections.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flowtest_proto::ControlMessage;

use crate::SessionError;

/// Key, certificate, and trust-anchor set for an authenticated/encrypted
/// control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub key: PathBuf,
    pub cert: PathBuf,
    pub trust_anchors: PathBuf,
}

/// One control-plane connection to the DUT.
///
/// Methods take `&self`: implementations are shared between the session's
/// receive thread and the test body's thread, and are expected to use
/// interior mutability (channels, atomics) for their send/receive paths.
pub trait ControlTransport: Send + Sync {
    /// Establish the connection, waiting up to `timeout` for the DUT.
    fn connect(&self, timeout: Duration) -> Result<(), SessionError>;

    /// Establish the connection over an authenticated/encrypted channel.
    fn secure_connect(&self, tls: &TlsMaterial, timeout: Duration) -> Result<(), SessionError>;

    /// Send one encoded frame.
    fn send_frame(&self, frame: Bytes) -> Result<(), SessionError>;

    /// Receive one frame, waiting up to `timeout`. `Ok(None)` means the
    /// timeout elapsed with nothing to deliver; `Err(Closed)` means the
    /// connection is gone.
    fn recv_frame(&self, timeout: Duration) -> Result<Option<Bytes>, SessionError>;

    /// Encode a control message into a frame.
    fn encode(&self, msg: &ControlMessage) -> Result<Bytes, SessionError>;

    /// Decode a received frame.
    fn decode(&self, frame: &Bytes) -> Result<ControlMessage, SessionError>;

    /// Negotiated peer address, once known.
    fn peer_addr(&self) -> Option<String>;

    /// Tear the connection down. Must be safe to call more than once.
    fn close(&self);
}

/// Packet injection/capture attachment to the DUT's forwarding ports.
pub trait DataLink: Send + Sync {
    /// Inject `data` on the given port.
    fn send_frame(&self, port: u16, data: Bytes) -> Result<(), SessionError>;

    /// Receive one forwarded frame `(egress_port, data)`, waiting up to
    /// `timeout`. `Ok(None)` means timeout; `Err(Closed)` means the link is
    /// gone.
    fn recv_frame(&self, timeout: Duration) -> Result<Option<(u16, Bytes)>, SessionError>;

    /// Detach from the forwarding ports. Must be safe to call more than
    /// once.
    fn close(&self);
}

/// Factory handed to the harness so fixtures can acquire transports without
/// knowing what backs them.
pub trait SessionFactory: Send + Sync {
    fn control_transport(&self) -> Result<Arc<dyn ControlTransport>, SessionError>;
    fn data_link(&self) -> Result<Arc<dyn DataLink>, SessionError>;
}
