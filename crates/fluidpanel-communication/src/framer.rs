//! Line framing for the raw byte stream
//!
//! Controllers speak newline-terminated ASCII, but the transport hands us
//! arbitrary byte chunks. The framer buffers those chunks and emits one
//! trimmed line per `\n`, carrying any partial tail over to the next read.
//! Empty lines are emitted as-is; suppressing them is the correlator's job.

/// Accumulates raw bytes and extracts complete lines
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    /// Create an empty framer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes and return every complete line they finish
    ///
    /// Lines are trimmed of surrounding whitespace (including `\r`).
    /// Bytes after the last `\n` stay buffered for the next call.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(&self.buffer[..pos])
                .trim()
                .to_string();
            self.buffer.drain(..=pos);
            lines.push(line);
        }
        lines
    }

    /// Number of buffered bytes awaiting a terminator
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any buffered partial line
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
