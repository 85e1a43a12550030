//! Blocking test client.
//!
//! Opens one TCP connection and performs framed request/response round
//! trips, one outstanding request at a time. Used by the interactive driver
//! and the integration tests; not part of the server pipeline.

use crate::frame::{self, HEADER_LEN, MAX_FRAME_LEN};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};

pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Send one request frame and block for the response frame.
    pub fn call(&mut self, payload: &[u8]) -> io::Result<Vec<u8>> {
        let request = frame::encode(payload)?;
        self.stream.write_all(&request)?;

        let mut len_buf = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("response frame length {len} exceeds maximum {MAX_FRAME_LEN}"),
            ));
        }

        let mut response = vec![0u8; len];
        self.stream.read_exact(&mut response)?;
        Ok(response)
    }
}
