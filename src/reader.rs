//! Reader pool member.
//!
//! Each reader owns a private poller and a disjoint subset of the live
//! connections, assigned by the acceptor and never reassigned. On read-ready
//! it drains the socket into a per-connection buffer, extracts every complete
//! frame, and pushes one `Call` per frame onto the shared queue.

use crate::call::{Call, CallQueue};
use crate::frame::{self, FrameError};
use crate::server::POLL_INTERVAL;
use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender};
use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Read chunk size per syscall.
const READ_BUF_SIZE: usize = 4096;

/// Registered connection state.
///
/// The reader touches only the read side; the write side belongs to whichever
/// handler currently holds a `Call` for this connection.
struct Conn {
    stream: Arc<TcpStream>,
    fd: RawFd,
    buf: BytesMut,
}

/// Control handle for one reader thread.
#[derive(Clone)]
pub struct ReaderHandle {
    pending: Sender<TcpStream>,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
    assigned: Arc<AtomicUsize>,
}

impl ReaderHandle {
    /// Hand a freshly accepted connection to this reader.
    ///
    /// The poller may be blocked mid-poll and would not observe a bare
    /// registration, so the waker is rung after queueing the stream.
    pub fn assign(&self, stream: TcpStream) {
        if self.pending.send(stream).is_err() {
            warn!("reader is gone, dropping connection");
            return;
        }
        self.assigned.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake reader poller");
        }
    }

    /// Ask the reader loop to stop. Registered connections are not forcibly
    /// closed; in-flight calls keep their stream alive until handled.
    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.waker.wake();
    }

    /// Connections assigned to this reader so far.
    pub(crate) fn assigned_count(&self) -> usize {
        self.assigned.load(Ordering::Relaxed)
    }
}

/// One reader: poller, connection registry, and the shared call queue.
pub struct Reader {
    id: usize,
    poll: Poll,
    conns: Slab<Conn>,
    pending: Receiver<TcpStream>,
    queue: CallQueue,
    running: Arc<AtomicBool>,
}

impl Reader {
    /// Start a reader thread and return its control handle.
    pub fn spawn(id: usize, queue: CallQueue) -> io::Result<ReaderHandle> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, rx) = crossbeam_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let reader = Reader {
            id,
            poll,
            conns: Slab::new(),
            pending: rx,
            queue,
            running: Arc::clone(&running),
        };

        thread::Builder::new()
            .name(format!("reader-{id}"))
            .spawn(move || reader.run())?;

        Ok(ReaderHandle {
            pending: tx,
            waker,
            running,
            assigned: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(256);
        info!(reader = self.id, "reader started");

        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(reader = self.id, error = %e, "reader poll failed");
                continue;
            }

            // Register assignments before dispatching events so a wake and a
            // read-ready for the same connection in one poll both land.
            self.register_pending();

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {} // assignments already drained above
                    Token(conn_id) => {
                        if let Err(e) = self.handle_readable(conn_id) {
                            debug!(reader = self.id, conn = conn_id, error = %e, "connection error");
                            self.close_connection(conn_id);
                        }
                    }
                }
            }
        }

        // Dropping the poller and registry here tears down the multiplexer.
        info!(reader = self.id, "reader stopped");
    }

    /// Register every connection the acceptor has handed over since the last
    /// poll iteration.
    fn register_pending(&mut self) {
        while let Ok(stream) = self.pending.try_recv() {
            let fd = stream.as_raw_fd();
            let entry = self.conns.vacant_entry();
            let token = Token(entry.key());

            if let Err(e) = self
                .poll
                .registry()
                .register(&mut SourceFd(&fd), token, Interest::READABLE)
            {
                warn!(reader = self.id, error = %e, "failed to register connection");
                continue;
            }

            entry.insert(Conn {
                stream: Arc::new(stream),
                fd,
                buf: BytesMut::with_capacity(READ_BUF_SIZE),
            });
            debug!(reader = self.id, conn = token.0, "connection registered");
        }
    }

    /// Drain the socket and enqueue one `Call` per complete frame.
    fn handle_readable(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = match self.conns.get_mut(conn_id) {
            Some(conn) => conn,
            // Stale event for an already-closed connection.
            None => return Ok(()),
        };

        let mut scratch = [0u8; READ_BUF_SIZE];
        let mut peer_closed = false;

        loop {
            match (&*conn.stream).read(&mut scratch) {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => conn.buf.extend_from_slice(&scratch[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        while let Some(payload) = frame::decode(&mut conn.buf)? {
            debug!(
                reader = self.id,
                conn = conn_id,
                len = payload.len(),
                "decoded request frame"
            );
            self.queue
                .push(Call::new(Arc::clone(&conn.stream), payload));
        }

        if peer_closed {
            if !conn.buf.is_empty() {
                // Peer went away with a partial frame on the wire.
                return Err(FrameError::Incomplete {
                    buffered: conn.buf.len(),
                }
                .into());
            }
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "EOF"));
        }

        Ok(())
    }

    fn close_connection(&mut self, conn_id: usize) {
        if self.conns.contains(conn_id) {
            let conn = self.conns.remove(conn_id);
            let _ = self.poll.registry().deregister(&mut SourceFd(&conn.fd));
            debug!(reader = self.id, conn = conn_id, "connection closed");
        }
    }
}
