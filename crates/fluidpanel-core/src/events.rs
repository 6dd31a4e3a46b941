//! Event type definitions for the device link.
//!
//! Every observable fact about a connection (lifecycle changes, command
//! traffic, telemetry broadcasts, and file transfer progress) is published
//! as a [`PanelEvent`]. Events are cloneable and serializable so the UI can
//! log or replay them.

use serde::{Deserialize, Serialize};

/// Root event enum for everything the communication layer publishes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PanelEvent {
    /// Connection lifecycle events
    Connection(ConnectionEvent),
    /// Outgoing command traffic
    Command(CommandEvent),
    /// Device replies and unsolicited messages
    Response(ResponseEvent),
    /// Unsolicited position/status broadcasts
    Telemetry(TelemetryEvent),
    /// File transfer lifecycle and progress
    FileTransfer(FileTransferEvent),
    /// Errors surfaced to the UI
    Error(ErrorEvent),
}

impl PanelEvent {
    /// Get the category of this event
    pub fn category(&self) -> EventCategory {
        match self {
            PanelEvent::Connection(_) => EventCategory::Connection,
            PanelEvent::Command(_) => EventCategory::Command,
            PanelEvent::Response(_) => EventCategory::Response,
            PanelEvent::Telemetry(_) => EventCategory::Telemetry,
            PanelEvent::FileTransfer(_) => EventCategory::FileTransfer,
            PanelEvent::Error(_) => EventCategory::Error,
        }
    }

    /// Get a short description of this event for logging
    pub fn description(&self) -> String {
        match self {
            PanelEvent::Connection(e) => e.description(),
            PanelEvent::Command(e) => e.description(),
            PanelEvent::Response(e) => e.description(),
            PanelEvent::Telemetry(e) => e.description(),
            PanelEvent::FileTransfer(e) => e.description(),
            PanelEvent::Error(e) => e.description(),
        }
    }
}

/// Event category for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// Connection lifecycle events.
    Connection,
    /// Outgoing command events.
    Command,
    /// Device reply events.
    Response,
    /// Telemetry broadcast events.
    Telemetry,
    /// File transfer events.
    FileTransfer,
    /// Error events.
    Error,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCategory::Connection => write!(f, "Connection"),
            EventCategory::Command => write!(f, "Command"),
            EventCategory::Response => write!(f, "Response"),
            EventCategory::Telemetry => write!(f, "Telemetry"),
            EventCategory::FileTransfer => write!(f, "FileTransfer"),
            EventCategory::Error => write!(f, "Error"),
        }
    }
}

/// Reason a connection went away
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// User requested disconnect
    UserRequested,
    /// Connection lost unexpectedly
    ConnectionLost,
    /// A transport-level error forced the teardown
    TransportError(String),
}

/// Connection lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Starting connection attempt.
    Connecting {
        /// Port path or host:port being connected to.
        target: String,
    },
    /// Successfully connected.
    Connected {
        /// Port path or host:port that was connected.
        target: String,
    },
    /// Disconnected from device.
    Disconnected {
        /// Port path or host:port that was disconnected.
        target: String,
        /// Reason for the disconnection.
        reason: DisconnectReason,
    },
    /// Connection attempt failed.
    ConnectionFailed {
        /// Port path or host:port that failed to connect.
        target: String,
        /// Error message describing the failure.
        error: String,
    },
}

impl ConnectionEvent {
    fn description(&self) -> String {
        match self {
            ConnectionEvent::Connecting { target } => format!("Connecting to {}", target),
            ConnectionEvent::Connected { target } => format!("Connected to {}", target),
            ConnectionEvent::Disconnected { target, reason } => {
                format!("Disconnected from {}: {:?}", target, reason)
            }
            ConnectionEvent::ConnectionFailed { target, error } => {
                format!("Connection failed to {}: {}", target, error)
            }
        }
    }
}

/// Outgoing command events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandEvent {
    /// A command was written to the device.
    Sent {
        /// The command text (without trailing newline).
        text: String,
        /// Whether it went through the immediate bypass lane.
        immediate: bool,
    },
}

impl CommandEvent {
    fn description(&self) -> String {
        match self {
            CommandEvent::Sent { text, immediate } => {
                if *immediate {
                    format!("TX (immediate): {}", text)
                } else {
                    format!("TX: {}", text)
                }
            }
        }
    }
}

/// Device reply events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseEvent {
    /// A line resolved the oldest outstanding command.
    Reply {
        /// The command that was resolved.
        command: String,
        /// The reply line.
        line: String,
    },
    /// A line arrived with no outstanding command.
    Unsolicited {
        /// The unsolicited line.
        line: String,
    },
}

impl ResponseEvent {
    fn description(&self) -> String {
        match self {
            ResponseEvent::Reply { command, line } => format!("RX {} -> {}", command, line),
            ResponseEvent::Unsolicited { line } => format!("RX (unsolicited): {}", line),
        }
    }
}

/// Parsed fields of a telemetry broadcast line
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetryReport {
    /// X position.
    pub x: f64,
    /// Y position.
    pub y: f64,
    /// Z position.
    pub z: f64,
    /// Velocity, if the device reported one.
    pub velocity: Option<f64>,
    /// Temperature, if the device reported one.
    pub temperature: Option<f64>,
}

/// Telemetry broadcast events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TelemetryEvent {
    /// Position/velocity/temperature broadcast.
    Position {
        /// The parsed telemetry fields.
        report: TelemetryReport,
    },
}

impl TelemetryEvent {
    fn description(&self) -> String {
        match self {
            TelemetryEvent::Position { report } => {
                format!(
                    "Telemetry: X{:.3} Y{:.3} Z{:.3}",
                    report.x, report.y, report.z
                )
            }
        }
    }
}

/// File transfer lifecycle and progress events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FileTransferEvent {
    /// Handshake accepted, chunk streaming begins.
    Started {
        /// Target file name on the device.
        file_name: String,
        /// Total payload size in bytes.
        bytes_total: u64,
        /// Total number of payload lines.
        total_lines: usize,
    },
    /// Cumulative progress after a chunk acknowledgment.
    Progress {
        /// Target file name on the device.
        file_name: String,
        /// Completion percentage (0-100).
        percent: u8,
        /// Bytes acknowledged so far.
        bytes_transferred: u64,
        /// Total payload size in bytes.
        bytes_total: u64,
        /// Lines written so far.
        current_line: usize,
        /// Total number of payload lines.
        total_lines: usize,
    },
    /// Terminal acknowledgment observed.
    Completed {
        /// Target file name on the device.
        file_name: String,
        /// Total payload size in bytes.
        bytes_total: u64,
    },
    /// Protocol violation, timeout exhaustion, or transport error.
    Failed {
        /// Target file name on the device.
        file_name: String,
        /// Human-readable failure message.
        message: String,
        /// Last known acknowledged byte count.
        bytes_transferred: u64,
        /// Total payload size in bytes.
        bytes_total: u64,
    },
    /// Explicit cancellation (user action, new transfer, or disconnect).
    Cancelled {
        /// Target file name on the device.
        file_name: String,
    },
}

impl FileTransferEvent {
    fn description(&self) -> String {
        match self {
            FileTransferEvent::Started {
                file_name,
                bytes_total,
                total_lines,
            } => format!(
                "Transfer started: {} ({} bytes, {} lines)",
                file_name, bytes_total, total_lines
            ),
            FileTransferEvent::Progress {
                file_name,
                percent,
                bytes_transferred,
                bytes_total,
                ..
            } => format!(
                "Transfer {}: {}% ({}/{})",
                file_name, percent, bytes_transferred, bytes_total
            ),
            FileTransferEvent::Completed { file_name, .. } => {
                format!("Transfer completed: {}", file_name)
            }
            FileTransferEvent::Failed {
                file_name, message, ..
            } => format!("Transfer failed: {}: {}", file_name, message),
            FileTransferEvent::Cancelled { file_name } => {
                format!("Transfer cancelled: {}", file_name)
            }
        }
    }
}

/// Error events surfaced to the UI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ErrorEvent {
    /// A recoverable or terminal error with a human-readable message.
    Error {
        /// The error message.
        message: String,
    },
}

impl ErrorEvent {
    fn description(&self) -> String {
        match self {
            ErrorEvent::Error { message } => format!("Error: {}", message),
        }
    }
}
