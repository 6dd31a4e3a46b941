//! File transfer sessions
//!
//! A transfer streams a G-code file to the device in line-based chunks,
//! gated by cumulative byte-progress acknowledgments. This module owns
//! the session bookkeeping: payload normalization, chunk boundaries,
//! progress accounting, and the retry budget. Driving the wire protocol
//! (handshake, chunk writes, timeouts) is the connection actor's job.

/// Default number of payload lines per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 64;

/// Default chunk-acknowledgment retry budget
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default per-chunk acknowledgment timeout
pub const DEFAULT_CHUNK_TIMEOUT_MS: u64 = 1_000;

/// Default timeout for the terminal completion acknowledgment
pub const DEFAULT_COMPLETION_TIMEOUT_MS: u64 = 10_000;

/// Lifecycle of a file transfer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    /// No transfer running.
    #[default]
    Idle,
    /// Delete/receive handshake in flight.
    Starting,
    /// Chunks streaming, acknowledgments gating progress.
    Transferring,
    /// End-of-stream marker written, awaiting the terminal ack.
    Completing,
    /// Terminal ack observed.
    Completed,
    /// Protocol violation, timeout exhaustion, or transport error.
    Error,
    /// Explicitly cancelled.
    Cancelled,
}

impl TransferState {
    /// Whether the session currently owns the wire
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TransferState::Starting | TransferState::Transferring | TransferState::Completing
        )
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransferState::Idle => "idle",
            TransferState::Starting => "starting",
            TransferState::Transferring => "transferring",
            TransferState::Completing => "completing",
            TransferState::Completed => "completed",
            TransferState::Error => "error",
            TransferState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A single chunked upload in progress
///
/// At most one session exists per connection at any instant.
#[derive(Debug)]
pub struct FileTransferSession {
    /// Target file name on the device.
    pub file_name: String,
    /// Current lifecycle state.
    pub state: TransferState,
    /// Cumulative bytes acknowledged by the device.
    pub bytes_transferred: u64,
    /// Total normalized payload size in bytes.
    pub bytes_total: u64,
    /// Lines written to the wire so far.
    pub current_line: usize,
    /// Total number of payload lines.
    pub total_lines: usize,
    /// Chunk-acknowledgment retries used for the current chunk.
    pub retry_count: u32,
    /// Retry budget before the session aborts.
    pub max_retries: u32,

    lines: Vec<String>,
    chunk_size: usize,
    current_chunk: usize,
    /// Cumulative byte offset at the end of each chunk.
    chunk_end_offsets: Vec<u64>,
}

impl FileTransferSession {
    /// Create a session from raw file content
    ///
    /// The payload is normalized to LF line endings with a guaranteed
    /// trailing newline; `bytes_total` is the normalized length, which is
    /// what the device's cumulative progress reports count against.
    pub fn new(
        file_name: impl Into<String>,
        content: &str,
        chunk_size: usize,
        max_retries: u32,
    ) -> Self {
        let normalized = normalize_payload(content);
        let lines: Vec<String> = if normalized.is_empty() {
            Vec::new()
        } else {
            // Trailing newline guaranteed; drop the empty tail element.
            normalized[..normalized.len() - 1]
                .split('\n')
                .map(str::to_string)
                .collect()
        };

        let chunk_size = chunk_size.max(1);
        let mut chunk_end_offsets = Vec::new();
        let mut offset = 0u64;
        for chunk in lines.chunks(chunk_size) {
            offset += chunk.iter().map(|l| l.len() as u64 + 1).sum::<u64>();
            chunk_end_offsets.push(offset);
        }

        let total_lines = lines.len();
        Self {
            file_name: file_name.into(),
            state: TransferState::Idle,
            bytes_transferred: 0,
            bytes_total: normalized.len() as u64,
            current_line: 0,
            total_lines,
            retry_count: 0,
            max_retries,
            lines,
            chunk_size,
            current_chunk: 0,
            chunk_end_offsets,
        }
    }

    /// Number of chunks the payload splits into
    pub fn chunk_count(&self) -> usize {
        self.chunk_end_offsets.len()
    }

    /// Index of the chunk currently on the wire
    pub fn current_chunk(&self) -> usize {
        self.current_chunk
    }

    /// Wire payload of the given chunk, each line newline-terminated
    pub fn chunk_payload(&self, index: usize) -> Vec<u8> {
        let start = index * self.chunk_size;
        let end = (start + self.chunk_size).min(self.lines.len());
        let mut payload = Vec::new();
        for line in &self.lines[start..end] {
            payload.extend_from_slice(line.as_bytes());
            payload.push(b'\n');
        }
        payload
    }

    /// Number of lines in the given chunk
    pub fn chunk_len(&self, index: usize) -> usize {
        let start = index * self.chunk_size;
        (self.chunk_size).min(self.lines.len().saturating_sub(start))
    }

    /// Cumulative byte offset at the end of the given chunk
    pub fn chunk_end_offset(&self, index: usize) -> u64 {
        self.chunk_end_offsets[index]
    }

    /// Record that the current chunk's bytes are on the wire
    pub fn mark_chunk_written(&mut self) {
        self.current_line = ((self.current_chunk + 1) * self.chunk_size).min(self.total_lines);
    }

    /// Fold a cumulative progress report into the session
    pub fn record_progress(&mut self, bytes: u64) {
        self.bytes_transferred = bytes.min(self.bytes_total);
    }

    /// Whether the device has acknowledged everything up to the end of
    /// the current chunk
    pub fn current_chunk_acknowledged(&self) -> bool {
        self.chunk_end_offsets
            .get(self.current_chunk)
            .is_some_and(|end| self.bytes_transferred >= *end)
    }

    /// Whether the current chunk is the last one
    pub fn on_last_chunk(&self) -> bool {
        self.current_chunk + 1 >= self.chunk_count()
    }

    /// Move to the next chunk, resetting the retry counter
    pub fn advance_chunk(&mut self) {
        self.current_chunk += 1;
        self.retry_count = 0;
    }

    /// Consume one retry; returns true when the budget is exhausted
    pub fn register_retry(&mut self) -> bool {
        self.retry_count += 1;
        self.retry_count > self.max_retries
    }

    /// Completion percentage from acknowledged bytes
    pub fn percent(&self) -> u8 {
        if self.bytes_total == 0 {
            return 100;
        }
        ((self.bytes_transferred * 100) / self.bytes_total).min(100) as u8
    }
}

/// Normalize CR/CRLF to LF and guarantee a trailing newline
fn normalize_payload(content: &str) -> String {
    let mut normalized = content.replace("\r\n", "\n").replace('\r', "\n");
    if !normalized.is_empty() && !normalized.ends_with('\n') {
        normalized.push('\n');
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered_lines(n: usize) -> String {
        (0..n)
            .map(|i| format!("G1 X{}", i))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_130_lines_split_into_three_chunks() {
        let content = numbered_lines(130);
        let session = FileTransferSession::new("part.nc", &content, 64, 3);

        assert_eq!(session.total_lines, 130);
        assert_eq!(session.chunk_count(), 3);
        assert_eq!(session.chunk_len(0), 64);
        assert_eq!(session.chunk_len(1), 64);
        assert_eq!(session.chunk_len(2), 2);
        assert_eq!(session.chunk_end_offset(2), session.bytes_total);
    }

    #[test]
    fn test_bytes_total_matches_chunk_payloads() {
        let content = numbered_lines(130);
        let session = FileTransferSession::new("part.nc", &content, 64, 3);

        let written: usize = (0..session.chunk_count())
            .map(|i| session.chunk_payload(i).len())
            .sum();
        assert_eq!(written as u64, session.bytes_total);
    }

    #[test]
    fn test_crlf_normalization() {
        let session = FileTransferSession::new("a.nc", "G0 X0\r\nG1 Y1\rG1 Z2", 64, 3);
        assert_eq!(session.total_lines, 3);
        assert_eq!(session.bytes_total, "G0 X0\nG1 Y1\nG1 Z2\n".len() as u64);
        assert_eq!(session.chunk_payload(0), b"G0 X0\nG1 Y1\nG1 Z2\n");
    }

    #[test]
    fn test_empty_payload() {
        let session = FileTransferSession::new("empty.nc", "", 64, 3);
        assert_eq!(session.total_lines, 0);
        assert_eq!(session.bytes_total, 0);
        assert_eq!(session.chunk_count(), 0);
        assert_eq!(session.percent(), 100);
    }

    #[test]
    fn test_progress_and_chunk_acknowledgment() {
        let content = numbered_lines(130);
        let mut session = FileTransferSession::new("part.nc", &content, 64, 3);
        session.state = TransferState::Transferring;
        session.mark_chunk_written();
        assert_eq!(session.current_line, 64);

        session.record_progress(10);
        assert!(!session.current_chunk_acknowledged());

        session.record_progress(session.chunk_end_offset(0));
        assert!(session.current_chunk_acknowledged());
        assert!(!session.on_last_chunk());

        session.advance_chunk();
        session.mark_chunk_written();
        assert_eq!(session.current_line, 128);
        assert_eq!(session.retry_count, 0);
    }

    #[test]
    fn test_retry_budget_exhaustion() {
        let mut session = FileTransferSession::new("part.nc", "G0 X0", 64, 3);
        assert!(!session.register_retry());
        assert!(!session.register_retry());
        assert!(!session.register_retry());
        // Fourth failure exceeds the budget of 3.
        assert!(session.register_retry());
    }

    #[test]
    fn test_percent_clamped() {
        let mut session = FileTransferSession::new("part.nc", "G0 X0\n", 64, 3);
        session.record_progress(1_000_000);
        assert_eq!(session.bytes_transferred, session.bytes_total);
        assert_eq!(session.percent(), 100);
    }

    #[test]
    fn test_active_states() {
        assert!(TransferState::Starting.is_active());
        assert!(TransferState::Transferring.is_active());
        assert!(TransferState::Completing.is_active());
        assert!(!TransferState::Idle.is_active());
        assert!(!TransferState::Completed.is_active());
        assert!(!TransferState::Cancelled.is_active());
    }
}
