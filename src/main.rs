//! framewire: a multi-stage reactor TCP server.
//!
//! Pipeline:
//! - one acceptor thread distributes inbound connections round-robin across
//!   a fixed pool of non-blocking readers;
//! - readers decode length-prefixed frames and enqueue calls on a shared
//!   FIFO queue;
//! - a fixed pool of handler threads drains the queue, applies the request
//!   transform (base64 by default), and writes the response frame back on
//!   the originating connection.
//!
//! The binary doubles as an interactive driver: each stdin line is sent
//! through a fresh blocking client and the transformed result printed;
//! `stop` shuts the server down.

mod acceptor;
mod call;
mod client;
mod config;
mod frame;
mod handler;
mod reader;
mod server;
mod transform;

use client::Client;
use config::Config;
use server::Server;
use std::io::BufRead;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(listen = %config.listen, "Starting framewire server");

    let mut server = Server::new(config);
    server.start()?;
    let addr = server
        .local_addr()
        .ok_or("server failed to report its listen address")?;

    // Interactive driver: one blocking round trip per input line.
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line == "stop" {
            server.close();
            break;
        }

        let mut client = Client::connect(addr)?;
        let response = client.call(line.as_bytes())?;
        println!("result : {}", String::from_utf8_lossy(&response));
    }

    Ok(())
}
