//! Transport adapters for the device link
//!
//! A transport is a pure byte pipe: it knows nothing about line framing or
//! the command protocol. Concrete adapters exist for serial ports and TCP
//! sockets, selected by [`ConnectionParams::kind`] at connect time.

pub mod serial;
pub mod tcp;

pub use serial::{list_ports, SerialPortInfo, SerialTransport};
pub use tcp::TcpTransport;

use fluidpanel_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Which kind of byte stream to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportKind {
    /// Direct serial/USB connection.
    #[default]
    Serial,
    /// TCP socket (e.g. a FluidNC telnet bridge).
    Tcp,
}

/// Parameters for opening a transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Transport kind to open.
    pub kind: TransportKind,
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM3").
    pub port: String,
    /// Baud rate (serial only).
    pub baud_rate: u32,
    /// Data bits (serial only).
    pub data_bits: u8,
    /// Stop bits (serial only).
    pub stop_bits: u8,
    /// Remote host (TCP only).
    pub host: String,
    /// Remote port (TCP only).
    pub tcp_port: u16,
    /// Read timeout in milliseconds; keeps the poll loop responsive.
    pub read_timeout_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            kind: TransportKind::Serial,
            port: String::new(),
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: 1,
            host: String::new(),
            tcp_port: 23,
            read_timeout_ms: 10,
        }
    }
}

impl ConnectionParams {
    /// Parameters for a serial connection at the given baud rate
    pub fn serial(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            kind: TransportKind::Serial,
            port: port.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Parameters for a TCP connection
    pub fn tcp(host: impl Into<String>, tcp_port: u16) -> Self {
        Self {
            kind: TransportKind::Tcp,
            host: host.into(),
            tcp_port,
            ..Default::default()
        }
    }

    /// Human-readable identifier of the endpoint
    pub fn target(&self) -> String {
        match self.kind {
            TransportKind::Serial => self.port.clone(),
            TransportKind::Tcp => format!("{}:{}", self.host, self.tcp_port),
        }
    }
}

/// Low-level byte stream interface
///
/// `read` returns `Ok(0)` when no data arrived within the read timeout;
/// the caller is expected to poll. `close` and `write` after close are
/// well-defined: writes fail with a transport error.
pub trait Transport: Send {
    /// Write bytes to the device; returns bytes written
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Read available bytes; Ok(0) means nothing arrived in time
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Whether the underlying stream is open
    fn is_open(&self) -> bool;

    /// Close the stream; idempotent
    fn close(&mut self);

    /// Human-readable endpoint identifier
    fn describe(&self) -> String;

    /// Write the whole buffer, retrying partial writes
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            let n = self.write(&data[written..])?;
            if n == 0 {
                return Err(Error::transport("write returned zero bytes"));
            }
            written += n;
        }
        Ok(())
    }
}

/// Open the transport selected by the connection parameters
pub fn open_transport(params: &ConnectionParams) -> Result<Box<dyn Transport>> {
    match params.kind {
        TransportKind::Serial => Ok(Box::new(SerialTransport::open(params)?)),
        TransportKind::Tcp => Ok(Box::new(TcpTransport::open(params)?)),
    }
}
