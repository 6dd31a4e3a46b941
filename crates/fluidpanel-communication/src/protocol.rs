//! Wire protocol constants and line classification
//!
//! Every incoming line is classified into a tagged variant by fixed
//! textual markers, never by position in the stream. The correlator
//! decides routing (telemetry, transfer, pending command) from the tag.

use fluidpanel_core::TelemetryReport;

/// Bracketed tag identifying telemetry broadcast lines
pub const TELEMETRY_TAG: &str = "[TELEMETRY]";

/// Prefix of cumulative transfer progress reports
pub const PROGRESS_PREFIX: &str = "Progress:";

/// Terminal acknowledgment of a completed file transfer
pub const TRANSFER_COMPLETE_MARKER: &str = "Transfer complete";

/// Substring the `@RECEIVE` handshake reply must carry
pub const RECEIVE_READY_ACK: &str = "Ready to receive";

/// Delete-if-exists verb
pub const CMD_DELETE: &str = "@DELETE";

/// Receive handshake verb (`@RECEIVE <name> <size>`)
pub const CMD_RECEIVE: &str = "@RECEIVE";

/// Best-effort transfer cancellation verb
pub const CMD_CANCEL: &str = "@CANCEL";

/// Run-file verb
pub const CMD_RUN: &str = "@RUN";

/// End-of-stream marker written after the last chunk
pub const END_OF_STREAM: &str = "@END";

/// A classified incoming line
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceLine {
    /// Unsolicited position/status broadcast; never consumes the pending slot.
    Telemetry(TelemetryReport),
    /// Cumulative transfer progress report.
    TransferProgress {
        /// Completion percentage as reported.
        percent: u8,
        /// Cumulative bytes the device has received.
        bytes_transferred: u64,
        /// Total bytes the device expects.
        bytes_total: u64,
    },
    /// Terminal transfer acknowledgment.
    TransferComplete,
    /// Transfer error report (`Error:` / `Failed:` prefix).
    TransferError(String),
    /// Anything else: a reply to the oldest outstanding command, or
    /// unsolicited chatter when nothing is outstanding.
    Reply(String),
}

/// Classify a trimmed line by its textual markers
pub fn classify_line(line: &str) -> DeviceLine {
    if let Some(rest) = line.strip_prefix(TELEMETRY_TAG) {
        return DeviceLine::Telemetry(parse_telemetry(rest));
    }

    if line.starts_with(PROGRESS_PREFIX) {
        if let Some((percent, bytes_transferred, bytes_total)) = parse_progress(line) {
            return DeviceLine::TransferProgress {
                percent,
                bytes_transferred,
                bytes_total,
            };
        }
        // Malformed progress falls through as a plain reply.
    }

    if line.starts_with(TRANSFER_COMPLETE_MARKER) {
        return DeviceLine::TransferComplete;
    }

    if line.starts_with("Error:") || line.starts_with("Failed:") {
        return DeviceLine::TransferError(line.to_string());
    }

    DeviceLine::Reply(line.to_string())
}

/// Parse the fields of a telemetry line
///
/// Expected form: `[TELEMETRY] X:1.000 Y:2.000 Z:3.000 V:1500 T:24.8`.
/// Missing or malformed fields default rather than fail; telemetry is
/// advisory and must never break the read path.
fn parse_telemetry(rest: &str) -> TelemetryReport {
    let mut report = TelemetryReport::default();
    for token in rest.split_whitespace() {
        if let Some(v) = token.strip_prefix("X:") {
            report.x = v.parse().unwrap_or(0.0);
        } else if let Some(v) = token.strip_prefix("Y:") {
            report.y = v.parse().unwrap_or(0.0);
        } else if let Some(v) = token.strip_prefix("Z:") {
            report.z = v.parse().unwrap_or(0.0);
        } else if let Some(v) = token.strip_prefix("V:") {
            report.velocity = v.parse().ok();
        } else if let Some(v) = token.strip_prefix("T:") {
            report.temperature = v.parse().ok();
        }
    }
    report
}

/// Parse `Progress: NN% (a/b)` into (percent, bytes done, bytes total)
fn parse_progress(line: &str) -> Option<(u8, u64, u64)> {
    let rest = line.strip_prefix(PROGRESS_PREFIX)?.trim();

    let (pct_str, rest) = rest.split_once('%')?;
    let percent: u8 = pct_str.trim().parse().ok()?;

    let open = rest.find('(')?;
    let close = rest.find(')')?;
    let (done_str, total_str) = rest.get(open + 1..close)?.split_once('/')?;

    let bytes_transferred: u64 = done_str.trim().parse().ok()?;
    let bytes_total: u64 = total_str.trim().parse().ok()?;

    Some((percent, bytes_transferred, bytes_total))
}

/// Frame a command for the wire, appending a newline if absent
pub fn frame_command(text: &str) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    if !text.ends_with('\n') {
        bytes.push(b'\n');
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_telemetry() {
        let line = "[TELEMETRY] X:10.500 Y:-3.250 Z:1.000 V:1500 T:24.8";
        match classify_line(line) {
            DeviceLine::Telemetry(report) => {
                assert_eq!(report.x, 10.5);
                assert_eq!(report.y, -3.25);
                assert_eq!(report.z, 1.0);
                assert_eq!(report.velocity, Some(1500.0));
                assert_eq!(report.temperature, Some(24.8));
            }
            other => panic!("Expected telemetry, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_telemetry_partial_fields() {
        match classify_line("[TELEMETRY] X:1.0 Z:2.0") {
            DeviceLine::Telemetry(report) => {
                assert_eq!(report.x, 1.0);
                assert_eq!(report.y, 0.0);
                assert_eq!(report.velocity, None);
            }
            other => panic!("Expected telemetry, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_progress() {
        assert_eq!(
            classify_line("Progress: 50% (65/130)"),
            DeviceLine::TransferProgress {
                percent: 50,
                bytes_transferred: 65,
                bytes_total: 130,
            }
        );
    }

    #[test]
    fn test_malformed_progress_is_reply() {
        assert_eq!(
            classify_line("Progress: lots"),
            DeviceLine::Reply("Progress: lots".to_string())
        );
    }

    #[test]
    fn test_classify_complete_and_errors() {
        assert_eq!(classify_line("Transfer complete"), DeviceLine::TransferComplete);
        assert_eq!(
            classify_line("Error: disk full"),
            DeviceLine::TransferError("Error: disk full".to_string())
        );
        assert_eq!(
            classify_line("Failed: checksum"),
            DeviceLine::TransferError("Failed: checksum".to_string())
        );
    }

    #[test]
    fn test_classify_reply() {
        assert_eq!(classify_line("ok"), DeviceLine::Reply("ok".to_string()));
        assert_eq!(
            classify_line("Grbl 1.1h ['$' for help]"),
            DeviceLine::Reply("Grbl 1.1h ['$' for help]".to_string())
        );
    }

    #[test]
    fn test_frame_command() {
        assert_eq!(frame_command("G28"), b"G28\n");
        assert_eq!(frame_command("G28\n"), b"G28\n");
    }
}
