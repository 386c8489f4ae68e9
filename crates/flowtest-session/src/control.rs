//! # Control-plane session runtime
//!
//! Wraps a [`ControlTransport`] with the background receive path the harness
//! relies on:
//!
//! - replies are demultiplexed to pending [`transact`] callers by
//!   transaction id, via a bounded rendezvous channel per call
//! - echo probes from the DUT are auto-answered while keep-alive is enabled
//! - everything else lands in a bounded asynchronous-notification queue
//!
//! [`transact`]: ControlSession::transact
//!
//! The test body's thread only ever blocks inside `transact` (or the
//! notification queue's `poll_notification`), and both report timeout as an
//! absent result rather than an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use flowtest_proto::{ControlMessage, MessageBody};

use crate::transport::{ControlTransport, TlsMaterial};
use crate::SessionError;

/// Receive-loop wakeup granularity. Bounds how long shutdown can lag.
const RX_TICK: Duration = Duration::from_millis(20);

/// Unmatched inbound messages kept for the test body to inspect.
const NOTIFICATION_CAPACITY: usize = 64;

type TaggedMessage = (ControlMessage, Bytes);

/// State shared between the session handle and its receive thread.
struct Shared {
    transport: Arc<dyn ControlTransport>,
    /// Pending `transact` callers keyed by transaction id.
    pending: Mutex<HashMap<u32, Sender<TaggedMessage>>>,
    notifications_tx: Sender<TaggedMessage>,
    active: AtomicBool,
    keep_alive: AtomicBool,
    /// Hard-cancel flag: the receive loop exits at the next tick without
    /// draining.
    stopping: AtomicBool,
}

fn lock<'a, T>(m: &'a Mutex<T>) -> MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to one control-plane connection: handshake, request/response
/// transactions, raw send, asynchronous notifications.
///
/// All methods take `&self`; a session is shared between a parent fixture
/// and fixtures that inherit its setup.
pub struct ControlSession {
    shared: Arc<Shared>,
    notifications_rx: Receiver<TaggedMessage>,
    next_xid: AtomicU32,
    initial_greeting: AtomicBool,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession").finish_non_exhaustive()
    }
}

impl ControlSession {
    pub fn new(transport: Arc<dyn ControlTransport>) -> Self {
        let (notifications_tx, notifications_rx) = bounded(NOTIFICATION_CAPACITY);
        ControlSession {
            shared: Arc::new(Shared {
                transport,
                pending: Mutex::new(HashMap::new()),
                notifications_tx,
                active: AtomicBool::new(false),
                keep_alive: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
            }),
            notifications_rx,
            next_xid: AtomicU32::new(1),
            initial_greeting: AtomicBool::new(true),
            rx_thread: Mutex::new(None),
        }
    }

    /// Spawn the background receive thread. Idempotent.
    pub fn start(&self) {
        let mut slot = lock(&self.rx_thread);
        if slot.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *slot = Some(
            std::thread::Builder::new()
                .name("control-rx".into())
                .spawn(move || rx_loop(shared))
                .expect("failed to spawn control receive thread"),
        );
    }

    /// Establish the connection, waiting up to `timeout` for the DUT. Sends
    /// the initial greeting unless it was suppressed beforehand.
    pub fn connect(&self, timeout: Duration) -> Result<(), SessionError> {
        self.shared.transport.connect(timeout)?;
        self.after_connect()
    }

    /// Establish the connection over an authenticated/encrypted channel,
    /// then proceed exactly as [`connect`](Self::connect).
    pub fn secure_connect(
        &self,
        tls: &TlsMaterial,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        self.shared.transport.secure_connect(tls, timeout)?;
        self.after_connect()
    }

    fn after_connect(&self) -> Result<(), SessionError> {
        self.shared.active.store(true, Ordering::Relaxed);
        if self.initial_greeting.load(Ordering::Relaxed) {
            self.send(MessageBody::Hello { version: 1 })?;
        }
        Ok(())
    }

    /// Send a request and block up to `timeout` for the reply carrying the
    /// same transaction id. Returns the decoded reply and its raw frame, or
    /// `None` on timeout — never an error. Callers must check for absence
    /// and decide whether it is a test failure.
    pub fn transact(&self, body: MessageBody, timeout: Duration) -> Option<TaggedMessage> {
        if !self.active() {
            warn!("transact on inactive session");
            return None;
        }
        let xid = self.alloc_xid();
        let request = ControlMessage::new(xid, body);
        let (reply_tx, reply_rx) = bounded(1);
        lock(&self.shared.pending).insert(xid, reply_tx);

        if let Err(e) = self.send_message(&request) {
            lock(&self.shared.pending).remove(&xid);
            warn!(xid, error = %e, "transact send failed");
            return None;
        }

        match reply_rx.recv_timeout(timeout) {
            Ok(pair) => Some(pair),
            Err(_) => {
                lock(&self.shared.pending).remove(&xid);
                // The reply may have slipped in between the timeout and the
                // removal above.
                reply_rx.try_recv().ok()
            }
        }
    }

    /// Raw send with a freshly allocated transaction id. Returns the id
    /// used.
    pub fn send(&self, body: MessageBody) -> Result<u32, SessionError> {
        let xid = self.alloc_xid();
        self.send_message(&ControlMessage::new(xid, body))?;
        Ok(xid)
    }

    fn send_message(&self, msg: &ControlMessage) -> Result<(), SessionError> {
        let frame = self.shared.transport.encode(msg)?;
        self.shared.transport.send_frame(frame)
    }

    /// Next unmatched inbound message, waiting up to `timeout`.
    pub fn poll_notification(&self, timeout: Duration) -> Option<TaggedMessage> {
        self.notifications_rx.recv_timeout(timeout).ok()
    }

    /// Graceful shutdown: close the transport and let the receive thread
    /// drain whatever was already queued before it exits.
    pub fn shutdown(&self) {
        self.shared.active.store(false, Ordering::Relaxed);
        self.shared.transport.close();
    }

    /// Wait for the receive thread to exit. Idempotent.
    pub fn join(&self) {
        if let Some(handle) = lock(&self.rx_thread).take() {
            let _ = handle.join();
        }
    }

    /// Hard cancel: stop the receive thread at its next tick without
    /// draining, close the transport, and reap the thread.
    pub fn kill(&self) {
        self.shared.stopping.store(true, Ordering::Relaxed);
        self.shared.active.store(false, Ordering::Relaxed);
        self.shared.transport.close();
        self.join();
    }

    pub fn active(&self) -> bool {
        self.shared.active.load(Ordering::Relaxed)
    }

    pub fn peer_addr(&self) -> Option<String> {
        self.shared.transport.peer_addr()
    }

    pub fn keep_alive(&self) -> bool {
        self.shared.keep_alive.load(Ordering::Relaxed)
    }

    /// Enable or disable auto-answering of echo probes.
    pub fn set_keep_alive(&self, enabled: bool) {
        self.shared.keep_alive.store(enabled, Ordering::Relaxed);
    }

    pub fn initial_greeting_enabled(&self) -> bool {
        self.initial_greeting.load(Ordering::Relaxed)
    }

    /// Suppress or restore the greeting sent by `connect`. Only meaningful
    /// before the connection is established.
    pub fn set_initial_greeting(&self, enabled: bool) {
        self.initial_greeting.store(enabled, Ordering::Relaxed);
    }

    fn alloc_xid(&self) -> u32 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }
}

fn rx_loop(shared: Arc<Shared>) {
    loop {
        if shared.stopping.load(Ordering::Relaxed) {
            break;
        }
        let frame = match shared.transport.recv_frame(RX_TICK) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(_) => break,
        };
        let msg = match shared.transport.decode(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                continue;
            }
        };

        // Reply to a pending transact?
        if let Some(waiter) = lock(&shared.pending).remove(&msg.xid) {
            // A dropped receiver just means the caller timed out already.
            let _ = waiter.send((msg, frame));
            continue;
        }

        // Keep-alive probe?
        if let MessageBody::EchoRequest { payload } = &msg.body {
            if shared.keep_alive.load(Ordering::Relaxed) {
                let reply =
                    ControlMessage::new(msg.xid, MessageBody::EchoReply { payload: payload.clone() });
                let sent = shared
                    .transport
                    .encode(&reply)
                    .and_then(|f| shared.transport.send_frame(f));
                match sent {
                    Ok(()) => debug!(xid = msg.xid, "answered keep-alive probe"),
                    Err(e) => warn!(error = %e, "failed to answer keep-alive probe"),
                }
                continue;
            }
        }

        if let Err(TrySendError::Full(_)) = shared.notifications_tx.try_send((msg, frame)) {
            warn!("notification queue full, dropping message");
        }
    }

    shared.active.store(false, Ordering::Relaxed);
    // Wake any transact still parked on a reply that will never come.
    lock(&shared.pending).clear();
}
