//! TCP socket transport
//!
//! Connects to controllers reachable over the network, e.g. a FluidNC
//! telnet bridge. Uses a short read timeout so the connection poll loop
//! stays responsive.

use super::{ConnectionParams, Transport, TransportKind};
use fluidpanel_core::{Error, Result};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP socket transport
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: String,
}

impl TcpTransport {
    /// Connect to the remote host given in the parameters
    pub fn open(params: &ConnectionParams) -> Result<Self> {
        if params.kind != TransportKind::Tcp {
            return Err(Error::transport("TcpTransport requires the Tcp kind"));
        }

        let peer = format!("{}:{}", params.host, params.tcp_port);
        let addr = peer
            .to_socket_addrs()
            .map_err(|e| Error::transport(format!("Failed to resolve {}: {}", peer, e)))?
            .next()
            .ok_or_else(|| Error::transport(format!("No address for {}", peer)))?;

        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(|e| {
            tracing::warn!("Failed to connect to {}: {}", peer, e);
            Error::transport(format!("Failed to connect to {}: {}", peer, e))
        })?;

        stream
            .set_read_timeout(Some(Duration::from_millis(params.read_timeout_ms.max(1))))
            .map_err(|e| Error::transport(format!("Failed to set read timeout: {}", e)))?;
        stream.set_nodelay(true).ok();

        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }
}

impl Transport for TcpTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream
                .write(data)
                .map_err(|e| Error::transport(format!("TCP write failed: {}", e))),
            None => Err(Error::transport("TCP stream is closed")),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => match stream.read(buf) {
                // Remote closed the connection.
                Ok(0) => Err(Error::transport("TCP connection closed by peer")),
                Ok(n) => Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(Error::transport(format!("TCP read failed: {}", e))),
            },
            None => Err(Error::transport("TCP stream is closed")),
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            tracing::debug!("Closed TCP connection to {}", self.peer);
        }
    }

    fn describe(&self) -> String {
        self.peer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_wrong_kind() {
        let params = ConnectionParams::default();
        assert!(TcpTransport::open(&params).is_err());
    }

    #[test]
    fn test_loopback_roundtrip() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 16];
            let n = sock.read(&mut buf).unwrap();
            sock.write_all(&buf[..n]).unwrap();
        });

        let params = ConnectionParams {
            kind: TransportKind::Tcp,
            host: addr.ip().to_string(),
            tcp_port: addr.port(),
            read_timeout_ms: 200,
            ..Default::default()
        };

        let mut transport = TcpTransport::open(&params).unwrap();
        assert!(transport.is_open());
        transport.write_all(b"$H\n").unwrap();

        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        for _ in 0..50 {
            match transport.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => {
                    got.extend_from_slice(&buf[..n]);
                    if got.len() >= 3 {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        assert_eq!(got, b"$H\n");

        transport.close();
        assert!(!transport.is_open());
        server.join().unwrap();
    }
}
