//! # Data-plane session runtime
//!
//! Wraps a [`DataLink`] with a background capture thread feeding a bounded
//! queue of received frames. [`poll`](DataSession::poll) drains the queue
//! with an optional port/content filter and its own timeout; non-matching
//! frames are discarded, matching the behavior real capture points exhibit
//! when a test only cares about one egress port.
//!
//! When persistent capture is active, every received frame is also appended
//! to a capture file as a length-prefixed record (`port:u16, len:u32,
//! bytes`). The file is open iff the capture-active flag is set.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use quanta::Instant;
use tracing::{debug, warn};

use crate::transport::DataLink;
use crate::SessionError;

/// Capture-loop wakeup granularity.
const RX_TICK: Duration = Duration::from_millis(20);

/// Frames buffered between the capture thread and `poll`.
const QUEUE_CAPACITY: usize = 512;

/// One frame observed on the data plane.
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub port: u16,
    pub data: Bytes,
    pub at: Instant,
}

struct CaptureFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

struct Shared {
    link: Arc<dyn DataLink>,
    queue_tx: Sender<CapturedPacket>,
    capture: Mutex<Option<CaptureFile>>,
    stopping: AtomicBool,
}

fn lock<'a, T>(m: &'a Mutex<T>) -> MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to packet injection/capture across the DUT's forwarding ports.
pub struct DataSession {
    shared: Arc<Shared>,
    queue_rx: Receiver<CapturedPacket>,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DataSession {
    pub fn new(link: Arc<dyn DataLink>) -> Self {
        let (queue_tx, queue_rx) = bounded(QUEUE_CAPACITY);
        DataSession {
            shared: Arc::new(Shared {
                link,
                queue_tx,
                capture: Mutex::new(None),
                stopping: AtomicBool::new(false),
            }),
            queue_rx,
            rx_thread: Mutex::new(None),
        }
    }

    /// Spawn the background capture thread. Idempotent.
    pub fn start(&self) {
        let mut slot = lock(&self.rx_thread);
        if slot.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *slot = Some(
            std::thread::Builder::new()
                .name("data-capture".into())
                .spawn(move || capture_loop(shared))
                .expect("failed to spawn data capture thread"),
        );
    }

    /// Inject `data` on the given port.
    pub fn send(&self, port: u16, data: Bytes) -> Result<(), SessionError> {
        self.shared.link.send_frame(port, data)
    }

    /// Wait up to `timeout` for a frame passing the given filters. A frame
    /// failing a filter is consumed and discarded. Returns `None` on
    /// timeout — never an error.
    pub fn poll(
        &self,
        port: Option<u16>,
        expected: Option<&Bytes>,
        timeout: Duration,
    ) -> Option<CapturedPacket> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let pkt = match self.queue_rx.recv_timeout(deadline - now) {
                Ok(pkt) => pkt,
                Err(_) => return None,
            };
            if let Some(want) = port {
                if pkt.port != want {
                    debug!(got = pkt.port, want, "discarding frame on unexpected port");
                    continue;
                }
            }
            if let Some(exp) = expected {
                if pkt.data != *exp {
                    debug!(len = pkt.data.len(), "discarding non-matching frame");
                    continue;
                }
            }
            return Some(pkt);
        }
    }

    /// Discard any queued data-plane state.
    pub fn flush(&self) {
        let mut dropped = 0usize;
        while self.queue_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "flushed queued frames");
        }
    }

    /// Begin persisting every received frame to `path`.
    pub fn start_capture(&self, path: &Path) -> Result<(), SessionError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        *lock(&self.shared.capture) = Some(CaptureFile {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        });
        debug!(path = %path.display(), "capture started");
        Ok(())
    }

    /// Stop persisting frames and flush the capture file. Safe to call when
    /// no capture is active.
    pub fn stop_capture(&self) -> Result<(), SessionError> {
        if let Some(mut cap) = lock(&self.shared.capture).take() {
            cap.writer.flush()?;
            debug!(path = %cap.path.display(), "capture stopped");
        }
        Ok(())
    }

    pub fn capture_active(&self) -> bool {
        lock(&self.shared.capture).is_some()
    }

    /// Path of the capture file, present only while capture is active.
    pub fn capture_path(&self) -> Option<PathBuf> {
        lock(&self.shared.capture).as_ref().map(|c| c.path.clone())
    }

    /// Graceful shutdown: detach the link and let the capture thread drain
    /// before exiting.
    pub fn shutdown(&self) {
        self.shared.link.close();
    }

    /// Wait for the capture thread to exit. Idempotent.
    pub fn join(&self) {
        if let Some(handle) = lock(&self.rx_thread).take() {
            let _ = handle.join();
        }
    }

    /// Hard cancel: stop at the next tick without draining.
    pub fn kill(&self) {
        self.shared.stopping.store(true, Ordering::Relaxed);
        self.shared.link.close();
        self.join();
    }
}

fn capture_loop(shared: Arc<Shared>) {
    loop {
        if shared.stopping.load(Ordering::Relaxed) {
            break;
        }
        let (port, data) = match shared.link.recv_frame(RX_TICK) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(_) => break,
        };

        if let Some(cap) = lock(&shared.capture).as_mut() {
            if let Err(e) = write_record(&mut cap.writer, port, &data) {
                warn!(error = %e, path = %cap.path.display(), "capture write failed");
            }
        }

        let pkt = CapturedPacket {
            port,
            data,
            at: Instant::now(),
        };
        if shared.queue_tx.try_send(pkt).is_err() {
            warn!("capture queue full, dropping frame");
        }
    }
}

fn write_record(w: &mut BufWriter<File>, port: u16, data: &Bytes) -> std::io::Result<()> {
    w.write_all(&port.to_be_bytes())?;
    w.write_all(&(data.len() as u32).to_be_bytes())?;
    w.write_all(data)?;
    w.flush()
}
