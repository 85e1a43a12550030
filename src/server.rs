//! Server orchestrator.
//!
//! `start` launches the acceptor (which transitively starts the reader pool)
//! and then the handler pool; `close` signals every handler and the acceptor
//! and returns immediately. Shutdown is fire-and-forget: each loop observes
//! its cancellation flag within one polling interval, but nothing here joins
//! the worker threads.

use crate::acceptor::{Acceptor, AcceptorHandle};
use crate::call::CallQueue;
use crate::config::Config;
use crate::handler::{Handler, HandlerHandle};
use crate::transform::{base64_transform, Transform};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Number of reader threads.
pub(crate) const READER_POOL_SIZE: usize = 2;

/// Number of handler threads.
pub(crate) const HANDLER_POOL_SIZE: usize = 4;

/// Bounded wait used by every poll and queue-pop so loops can re-check
/// their running flag. Cancellation is observable within one interval.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Server {
    config: Config,
    transform: Transform,
    acceptor: Option<AcceptorHandle>,
    handlers: Vec<HandlerHandle>,
}

impl Server {
    /// Create a server with the default base64 transform.
    pub fn new(config: Config) -> Self {
        Self::with_transform(config, base64_transform())
    }

    /// Create a server with a custom request transform.
    pub fn with_transform(config: Config, transform: Transform) -> Self {
        Self {
            config,
            transform,
            acceptor: None,
            handlers: Vec::new(),
        }
    }

    /// Bind the listener and start all pipeline threads: the acceptor (which
    /// starts the readers) first, then the handler pool.
    pub fn start(&mut self) -> io::Result<()> {
        let addr: SocketAddr = self
            .config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let queue = CallQueue::new();
        let acceptor = Acceptor::spawn(addr, queue.clone())?;
        let local_addr = acceptor.local_addr();
        self.acceptor = Some(acceptor);

        for id in 0..HANDLER_POOL_SIZE {
            self.handlers
                .push(Handler::spawn(id, queue.clone(), self.transform.clone())?);
        }

        info!(
            addr = %local_addr,
            readers = READER_POOL_SIZE,
            handlers = HANDLER_POOL_SIZE,
            "server started"
        );
        Ok(())
    }

    /// Address the server is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.as_ref().map(|a| a.local_addr())
    }

    /// Signal every handler and the acceptor to stop, then return without
    /// waiting for the threads to exit.
    pub fn close(&self) {
        info!("closing server");
        for handler in &self.handlers {
            handler.close();
        }
        if let Some(acceptor) = &self.acceptor {
            acceptor.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::thread;

    fn start_server() -> Server {
        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            log_level: "info".to_string(),
        };
        let mut server = Server::new(config);
        server.start().unwrap();
        server
    }

    #[test]
    fn test_round_trip() {
        let server = start_server();
        let mut client = Client::connect(server.local_addr().unwrap()).unwrap();

        let response = client.call(b"hello").unwrap();
        assert_eq!(response, b"aGVsbG8=");

        server.close();
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let server = start_server();
        let mut client = Client::connect(server.local_addr().unwrap()).unwrap();

        let response = client.call(b"").unwrap();
        assert!(response.is_empty());

        server.close();
    }

    #[test]
    fn test_sequential_requests_ordered() {
        let server = start_server();
        let mut client = Client::connect(server.local_addr().unwrap()).unwrap();

        // One outstanding request at a time; responses must come back in
        // submission order.
        for i in 0..20u32 {
            let payload = format!("request-{i}");
            let response = client.call(payload.as_bytes()).unwrap();
            assert_eq!(response, STANDARD.encode(&payload).into_bytes());
        }

        server.close();
    }

    #[test]
    fn test_concurrent_clients_all_served() {
        let server = start_server();
        let addr = server.local_addr().unwrap();

        let workers: Vec<_> = (0..8)
            .map(|w| {
                thread::spawn(move || {
                    let mut client = Client::connect(addr).unwrap();
                    for i in 0..5u32 {
                        let payload = format!("client-{w}-msg-{i}");
                        let response = client.call(payload.as_bytes()).unwrap();
                        assert_eq!(response, STANDARD.encode(&payload).into_bytes());
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        server.close();
    }

    #[test]
    fn test_large_payload_round_trip() {
        let server = start_server();
        let mut client = Client::connect(server.local_addr().unwrap()).unwrap();

        let payload = vec![0x5Au8; 256 * 1024];
        let response = client.call(&payload).unwrap();
        assert_eq!(response, STANDARD.encode(&payload).into_bytes());

        server.close();
    }

    #[test]
    fn test_incomplete_frame_does_not_wedge_server() {
        use std::io::Write;

        let server = start_server();
        let addr = server.local_addr().unwrap();

        // A client that declares 1000 bytes, sends 4, and hangs up.
        let mut liar = std::net::TcpStream::connect(addr).unwrap();
        liar.write_all(&1000u32.to_be_bytes()).unwrap();
        liar.write_all(b"oops").unwrap();
        drop(liar);
        thread::sleep(Duration::from_millis(300));

        // A well-behaved client connected afterwards is still served.
        let mut client = Client::connect(addr).unwrap();
        let response = client.call(b"hello").unwrap();
        assert_eq!(response, b"aGVsbG8=");

        server.close();
    }

    #[test]
    fn test_close_stops_pipeline() {
        let server = start_server();
        let addr = server.local_addr().unwrap();

        server.close();
        // Give every loop one polling interval to observe the flag.
        thread::sleep(Duration::from_millis(400));

        let result = std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(200));
        assert!(result.is_err(), "listener should be gone after close");
    }

    #[test]
    fn test_custom_transform() {
        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            log_level: "info".to_string(),
        };
        let mut server = Server::with_transform(
            config,
            std::sync::Arc::new(|payload: &[u8]| payload.iter().rev().copied().collect()),
        );
        server.start().unwrap();

        let mut client = Client::connect(server.local_addr().unwrap()).unwrap();
        let response = client.call(b"abc").unwrap();
        assert_eq!(response, b"cba");

        server.close();
    }
}
