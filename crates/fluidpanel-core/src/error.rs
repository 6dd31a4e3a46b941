//! Error handling for FluidPanel
//!
//! A single taxonomy covering every failure the device link can surface:
//! transport faults, response timeouts, protocol violations, aborted
//! transfers, and operations attempted without a connection.
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for the device communication layer
#[derive(Error, Debug)]
pub enum Error {
    /// Adapter-level connect/write/read failure
    #[error("Transport error: {reason}")]
    Transport {
        /// Description of the transport failure.
        reason: String,
    },

    /// No reply arrived within the response window
    #[error("No response within {timeout_ms}ms")]
    ResponseTimeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Unexpected or malformed acknowledgment
    #[error("Protocol violation: {reason}")]
    Protocol {
        /// Description of the violation.
        reason: String,
    },

    /// Retry budget exhausted or transfer explicitly aborted
    #[error("Transfer aborted: {reason}")]
    TransferAborted {
        /// Why the transfer was aborted.
        reason: String,
    },

    /// Operation attempted with no active connection
    #[error("Not connected")]
    Disconnected,

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a transport error from a string message
    pub fn transport(reason: impl Into<String>) -> Self {
        Error::Transport {
            reason: reason.into(),
        }
    }

    /// Create a protocol violation error from a string message
    pub fn protocol(reason: impl Into<String>) -> Self {
        Error::Protocol {
            reason: reason.into(),
        }
    }

    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ResponseTimeout { .. })
    }

    /// Check if this is a transport error
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Io(_))
    }

    /// Check if this error means the connection is gone
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Error::Disconnected)
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::transport("port vanished");
        assert_eq!(err.to_string(), "Transport error: port vanished");

        let err = Error::ResponseTimeout { timeout_ms: 5000 };
        assert_eq!(err.to_string(), "No response within 5000ms");

        let err = Error::Disconnected;
        assert_eq!(err.to_string(), "Not connected");
    }

    #[test]
    fn test_error_predicates() {
        assert!(Error::ResponseTimeout { timeout_ms: 100 }.is_timeout());
        assert!(!Error::Disconnected.is_timeout());
        assert!(Error::Disconnected.is_disconnected());
        assert!(Error::transport("x").is_transport_error());
        assert!(Error::from(std::io::Error::other("x")).is_transport_error());
    }
}
