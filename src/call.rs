//! Call data model and the shared queue between readers and handlers.
//!
//! A `Call` pairs a connection with one decoded request payload. Readers
//! produce Calls, handlers consume them; the `CallQueue` is the only state
//! shared across those threads.

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use mio::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

/// One decoded request, bound to the connection it arrived on.
///
/// Immutable after construction: created by the owning reader, consumed by
/// exactly one handler, which writes the response back on `conn`.
pub struct Call {
    pub conn: Arc<TcpStream>,
    pub payload: Bytes,
}

impl Call {
    pub fn new(conn: Arc<TcpStream>, payload: Bytes) -> Self {
        Self { conn, payload }
    }
}

/// Unbounded, thread-safe FIFO of pending Calls.
///
/// Multiple producers (readers) and multiple consumers (handlers). Push never
/// blocks; pop blocks for at most the given timeout so consumers can re-check
/// their running flag. Submission order is preserved per producer; no ordering
/// is guaranteed across producers.
#[derive(Clone)]
pub struct CallQueue {
    tx: Sender<Call>,
    rx: Receiver<Call>,
}

impl CallQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// Enqueue a call. Cannot fail while at least one queue handle is alive.
    pub fn push(&self, call: Call) {
        // The receiver half lives in self, so send cannot fail here.
        let _ = self.tx.send(call);
    }

    /// Dequeue one call, waiting at most `timeout`.
    pub fn pop(&self, timeout: Duration) -> Option<Call> {
        match self.rx.recv_timeout(timeout) {
            Ok(call) => Some(call),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}
