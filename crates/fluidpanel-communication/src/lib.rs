//! # FluidPanel Communication
//!
//! The device link for FluidPanel: transports (serial and TCP), line
//! framing, command dispatch with response correlation, chunked file
//! transfers, and the connection lifecycle.
//!
//! The public surface is [`DeviceConnection`]: one handle per device,
//! carrying its own event bus. Everything below it (the transport, the
//! framer, the dispatcher, the transfer session) is owned by a single
//! IO task so protocol state never needs cross-task locking.
//!
//! ```no_run
//! use fluidpanel_communication::{ConnectionParams, DeviceConnection};
//!
//! # async fn demo() -> fluidpanel_core::Result<()> {
//! let connection = DeviceConnection::new();
//! connection.connect(&ConnectionParams::serial("/dev/ttyUSB0", 115200)).await?;
//! let reply = connection.send_command("$G").await?;
//! println!("{}", reply);
//! connection.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod dispatcher;
pub mod framer;
pub mod protocol;
pub mod transfer;
pub mod transport;

pub use connection::{ConnectionConfig, ConnectionState, DeviceConnection};
pub use dispatcher::Command;
pub use framer::LineFramer;
pub use protocol::{classify_line, DeviceLine};
pub use transfer::TransferState;
pub use transport::serial::{list_ports, SerialPortInfo};
pub use transport::{ConnectionParams, Transport, TransportKind};
