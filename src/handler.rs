//! Handler pool member.
//!
//! Handlers drain the shared call queue with a bounded wait, apply the
//! transform, and write the response frame straight back on the originating
//! connection. Write failures are logged and the loop continues; nothing is
//! retried or requeued.

use crate::call::{Call, CallQueue};
use crate::frame;
use crate::server::POLL_INTERVAL;
use crate::transform::Transform;
use mio::net::TcpStream;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Longest a handler will wait for a peer to drain its socket before the
/// write is abandoned. Keeps a non-reading peer from pinning a pool thread.
const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(1);

/// Control handle for one handler thread.
pub struct HandlerHandle {
    running: Arc<AtomicBool>,
}

impl HandlerHandle {
    /// Ask the handler loop to stop. The loop observes the flag within one
    /// queue-pop timeout; an in-flight call is finished, not interrupted.
    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// One handler: the shared queue plus the transform to apply.
pub struct Handler {
    id: usize,
    queue: CallQueue,
    transform: Transform,
    running: Arc<AtomicBool>,
}

impl Handler {
    /// Start a handler thread and return its control handle.
    pub fn spawn(id: usize, queue: CallQueue, transform: Transform) -> io::Result<HandlerHandle> {
        let running = Arc::new(AtomicBool::new(true));
        let handler = Handler {
            id,
            queue,
            transform,
            running: Arc::clone(&running),
        };

        thread::Builder::new()
            .name(format!("handler-{id}"))
            .spawn(move || handler.run())?;

        Ok(HandlerHandle { running })
    }

    fn run(self) {
        info!(handler = self.id, "handler started");

        while self.running.load(Ordering::Acquire) {
            let call = match self.queue.pop(POLL_INTERVAL) {
                Some(call) => call,
                None => continue,
            };

            if let Err(e) = self.process(&call) {
                warn!(handler = self.id, error = %e, "failed to write response");
            }
        }

        info!(handler = self.id, "handler stopped");
    }

    fn process(&self, call: &Call) -> io::Result<()> {
        let response = (self.transform)(&call.payload);
        let frame = frame::encode(&response)?;

        debug!(
            handler = self.id,
            request_len = call.payload.len(),
            response_len = response.len(),
            "responding"
        );

        write_frame(&call.conn, &frame, &self.running)
    }
}

/// Write a full frame to a non-blocking stream, waiting out transient
/// kernel-buffer backpressure.
///
/// The wait is bounded: the write is abandoned when `running` clears
/// (shutdown must stay observable) or after `WRITE_STALL_TIMEOUT` with no
/// progress (the peer stopped draining). The caller logs and moves on.
fn write_frame(stream: &TcpStream, mut frame: &[u8], running: &AtomicBool) -> io::Result<()> {
    let mut stalled_since = Instant::now();

    while !frame.is_empty() {
        if !running.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "shutdown requested mid-write",
            ));
        }

        match (&*stream).write(frame) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => {
                frame = &frame[n..];
                stalled_since = Instant::now();
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if stalled_since.elapsed() >= WRITE_STALL_TIMEOUT {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "peer is not draining its socket",
                    ));
                }
                thread::sleep(Duration::from_millis(1));
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::base64_transform;
    use bytes::Bytes;
    use std::io::Read;

    fn stream_pair() -> (Arc<TcpStream>, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        (Arc::new(TcpStream::from_std(accepted)), peer)
    }

    fn read_response(peer: &mut std::net::TcpStream) -> Vec<u8> {
        let mut len_buf = [0u8; 4];
        peer.read_exact(&mut len_buf).unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        peer.read_exact(&mut payload).unwrap();
        payload
    }

    #[test]
    fn test_handler_transforms_and_responds() {
        let queue = CallQueue::new();
        let handle = Handler::spawn(0, queue.clone(), base64_transform()).unwrap();

        let (conn, mut peer) = stream_pair();
        queue.push(Call::new(conn, Bytes::from_static(b"hello")));

        assert_eq!(read_response(&mut peer), b"aGVsbG8=");
        handle.close();
    }

    #[test]
    fn test_handler_survives_dead_connection() {
        let queue = CallQueue::new();
        let handle = Handler::spawn(0, queue.clone(), base64_transform()).unwrap();

        // Peer hangs up before the response is written.
        let (dead_conn, dead_peer) = stream_pair();
        drop(dead_peer);
        std::thread::sleep(Duration::from_millis(50));
        queue.push(Call::new(dead_conn, Bytes::from_static(b"orphaned")));

        // A later call on a healthy connection still gets served.
        let (conn, mut peer) = stream_pair();
        queue.push(Call::new(conn, Bytes::from_static(b"ok")));

        assert_eq!(read_response(&mut peer), b"b2s=");
        handle.close();
    }

    #[test]
    fn test_write_frame_abandoned_on_close() {
        // Peer never reads, so the kernel buffers fill and the write stalls.
        let (conn, peer) = stream_pair();
        let running = Arc::new(AtomicBool::new(true));
        let frame = vec![0u8; 8 * 1024 * 1024];

        let flag = Arc::clone(&running);
        let writer = thread::spawn(move || write_frame(&conn, &frame, &flag));

        thread::sleep(Duration::from_millis(200));
        running.store(false, Ordering::Release);

        // The stalled write observes the cleared flag and gives up.
        let result = writer.join().unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::Interrupted);
        drop(peer);
    }

    #[test]
    fn test_write_frame_times_out_on_stalled_peer() {
        let (conn, peer) = stream_pair();
        let running = Arc::new(AtomicBool::new(true));
        let frame = vec![0u8; 8 * 1024 * 1024];

        let start = std::time::Instant::now();
        let result = write_frame(&conn, &frame, &running);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
        // Bounded: one stall timeout plus slack, not forever.
        assert!(start.elapsed() < WRITE_STALL_TIMEOUT + Duration::from_secs(1));
        drop(peer);
    }
}
