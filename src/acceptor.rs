//! Acceptor: owns the listening socket, distributes connections round-robin
//! across the reader pool.
//!
//! The acceptor starts the full reader pool before entering its own poll
//! loop, so every accepted connection has a reader to land on. The
//! round-robin index is mutated only by the acceptor's own thread and needs
//! no synchronization.

use crate::call::CallQueue;
use crate::reader::{Reader, ReaderHandle};
use crate::server::{POLL_INTERVAL, READER_POOL_SIZE};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Control handle for the acceptor thread.
pub struct AcceptorHandle {
    pub(crate) readers: Vec<ReaderHandle>,
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl AcceptorHandle {
    /// Address the listening socket is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ask every reader to stop, then the acceptor loop itself. The acceptor
    /// thread tears down its poller and listener on its next loop iteration.
    pub fn close(&self) {
        for reader in &self.readers {
            reader.close();
        }
        self.running.store(false, Ordering::Release);
    }
}

/// Acceptor loop state, owned by the acceptor thread.
pub struct Acceptor {
    poll: Poll,
    listener: TcpListener,
    readers: Vec<ReaderHandle>,
    running: Arc<AtomicBool>,
    reader_index: usize,
}

impl Acceptor {
    /// Start the reader pool, bind the listening socket, and launch the
    /// acceptor thread.
    pub fn spawn(addr: SocketAddr, queue: CallQueue) -> io::Result<AcceptorHandle> {
        let readers = (0..READER_POOL_SIZE)
            .map(|id| Reader::spawn(id, queue.clone()))
            .collect::<io::Result<Vec<_>>>()?;

        let std_listener = bind_listener(addr)?;
        let local_addr = std_listener.local_addr()?;
        let mut listener = TcpListener::from_std(std_listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let running = Arc::new(AtomicBool::new(true));
        let acceptor = Acceptor {
            poll,
            listener,
            readers: readers.clone(),
            running: Arc::clone(&running),
            reader_index: 0,
        };

        thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || acceptor.run())?;

        info!(addr = %local_addr, readers = READER_POOL_SIZE, "acceptor started");

        Ok(AcceptorHandle {
            readers,
            running,
            local_addr,
        })
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(64);

        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "acceptor poll failed");
                continue;
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_pending();
                } else {
                    warn!(token = event.token().0, "unexpected token on acceptor poller");
                }
            }
        }

        // Poller and listening socket are torn down here.
        info!("acceptor stopped");
    }

    /// Accept every pending connection and assign each to the next reader.
    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let slot = self.reader_index % self.readers.len();
                    self.reader_index = self.reader_index.wrapping_add(1);

                    debug!(peer = %peer, reader = slot, "accepted connection");
                    self.readers[slot].assign(stream);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
