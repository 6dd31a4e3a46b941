//! Connection lifecycle and the per-connection IO loop
//!
//! A [`DeviceConnection`] is the public handle: it owns the event bus,
//! the published [`ConnectionState`], and a control channel into the IO
//! loop. The IO loop is a single tokio task that exclusively owns all
//! protocol state (transport, framer, dispatcher, transfer session),
//! so the write path and the read path can never interleave unsafely.
//! No wait outlives the connection that created it: teardown rejects
//! every outstanding responder and cancels any active transfer.

use crate::dispatcher::{
    Command, CommandDispatcher, CommandResponder, QueuedCommand, DEFAULT_INTER_COMMAND_DELAY_MS,
    DEFAULT_RESPONSE_TIMEOUT_MS,
};
use crate::framer::LineFramer;
use crate::protocol::{
    classify_line, frame_command, DeviceLine, CMD_CANCEL, CMD_DELETE, CMD_RECEIVE, CMD_RUN,
    END_OF_STREAM, RECEIVE_READY_ACK,
};
use crate::transfer::{
    FileTransferSession, TransferState, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_TIMEOUT_MS,
    DEFAULT_COMPLETION_TIMEOUT_MS, DEFAULT_MAX_RETRIES,
};
use crate::transport::{open_transport, ConnectionParams, Transport};
use fluidpanel_core::{
    CommandEvent, ConnectionEvent, DisconnectReason, Error, ErrorEvent, EventBus,
    FileTransferEvent, PanelEvent, ResponseEvent, Result, TelemetryEvent,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Timing and sizing knobs for a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// How long a command may await its reply.
    pub response_timeout_ms: u64,
    /// Device turnaround delay between command writes.
    pub inter_command_delay_ms: u64,
    /// Payload lines per transfer chunk.
    pub chunk_size: usize,
    /// Chunk-acknowledgment retry budget.
    pub max_retries: u32,
    /// Per-chunk acknowledgment timeout.
    pub chunk_timeout_ms: u64,
    /// Timeout for the terminal transfer acknowledgment.
    pub completion_timeout_ms: u64,
    /// IO loop poll cadence.
    pub poll_interval_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            inter_command_delay_ms: DEFAULT_INTER_COMMAND_DELAY_MS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            chunk_timeout_ms: DEFAULT_CHUNK_TIMEOUT_MS,
            completion_timeout_ms: DEFAULT_COMPLETION_TIMEOUT_MS,
            poll_interval_ms: 10,
        }
    }
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No transport open.
    #[default]
    Disconnected,
    /// Transport opening in progress.
    Connecting,
    /// Transport open, IO loop running.
    Connected,
    /// Torn down by an unrecoverable transport error.
    Error,
}

/// Messages from the handle into the IO loop
enum ControlMessage {
    Execute(QueuedCommand),
    StartTransfer {
        file_name: String,
        content: String,
        ack: oneshot::Sender<Result<()>>,
    },
    CancelTransfer,
    Disconnect {
        reason: DisconnectReason,
    },
}

/// Handle to one device connection
///
/// Constructed explicitly and passed to collaborators; there is no
/// ambient global instance. Clones share the same underlying
/// connection. The handle survives connect/disconnect cycles and keeps
/// the same event bus across them.
#[derive(Clone)]
pub struct DeviceConnection {
    config: ConnectionConfig,
    bus: Arc<EventBus>,
    state: Arc<RwLock<ConnectionState>>,
    target: Arc<RwLock<String>>,
    control_tx: Arc<RwLock<Option<mpsc::Sender<ControlMessage>>>>,
    io_task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl DeviceConnection {
    /// Create a disconnected handle with default configuration
    pub fn new() -> Self {
        Self::with_config(ConnectionConfig::default())
    }

    /// Create a disconnected handle with custom configuration
    pub fn with_config(config: ConnectionConfig) -> Self {
        Self {
            config,
            bus: Arc::new(EventBus::new()),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            target: Arc::new(RwLock::new(String::new())),
            control_tx: Arc::new(RwLock::new(None)),
            io_task: Arc::new(RwLock::new(None)),
        }
    }

    /// The connection's event bus
    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// A broadcast receiver for async event consumption
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<PanelEvent> {
        self.bus.receiver()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Whether the IO loop is up
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Endpoint identifier of the current (or last) connection
    pub fn target(&self) -> String {
        self.target.read().clone()
    }

    /// Open the transport selected by `params` and start the IO loop
    ///
    /// A no-op when already connected; callers must disconnect first to
    /// change endpoints.
    pub async fn connect(&self, params: &ConnectionParams) -> Result<()> {
        if self.is_connected() {
            tracing::warn!("connect() ignored: already connected to {}", self.target());
            return Ok(());
        }

        let target = params.target();
        *self.state.write() = ConnectionState::Connecting;
        self.bus
            .publish(PanelEvent::Connection(ConnectionEvent::Connecting {
                target: target.clone(),
            }));

        match open_transport(params) {
            Ok(transport) => self.attach(transport).await,
            Err(e) => {
                *self.state.write() = ConnectionState::Disconnected;
                self.bus
                    .publish(PanelEvent::Connection(ConnectionEvent::ConnectionFailed {
                        target,
                        error: e.to_string(),
                    }));
                Err(e)
            }
        }
    }

    /// Start the IO loop over an already-open transport
    ///
    /// This is the seam the transport factory feeds, and what tests use
    /// to drive the protocol over a scripted transport.
    pub async fn connect_with_transport(&self, transport: Box<dyn Transport>) -> Result<()> {
        if self.is_connected() {
            tracing::warn!("connect() ignored: already connected to {}", self.target());
            return Ok(());
        }
        *self.state.write() = ConnectionState::Connecting;
        self.attach(transport).await
    }

    async fn attach(&self, transport: Box<dyn Transport>) -> Result<()> {
        let target = transport.describe();
        *self.target.write() = target.clone();

        let (tx, rx) = mpsc::channel(64);

        // A fresh framer per session: stale partial data from a previous
        // connection must never bleed into a new one.
        let io = IoLoop {
            transport,
            framer: LineFramer::new(),
            dispatcher: CommandDispatcher::new(
                Duration::from_millis(self.config.response_timeout_ms),
                Duration::from_millis(self.config.inter_command_delay_ms),
            ),
            transfer: None,
            transfer_deadline: None,
            bus: self.bus.clone(),
            state: self.state.clone(),
            config: self.config.clone(),
            target: target.clone(),
        };

        if let Some(old) = self.io_task.write().take() {
            old.abort();
        }
        let handle = tokio::spawn(io.run(rx));

        *self.control_tx.write() = Some(tx);
        *self.io_task.write() = Some(handle);
        *self.state.write() = ConnectionState::Connected;
        self.bus
            .publish(PanelEvent::Connection(ConnectionEvent::Connected {
                target,
            }));
        Ok(())
    }

    fn sender(&self) -> Result<mpsc::Sender<ControlMessage>> {
        self.control_tx.read().clone().ok_or(Error::Disconnected)
    }

    /// Submit a command; resolves with its reply line when one is expected
    pub async fn execute(&self, command: Command) -> Result<Option<String>> {
        let tx = self.sender()?;

        if command.expect_response {
            let (reply_tx, reply_rx) = oneshot::channel();
            tx.send(ControlMessage::Execute(QueuedCommand {
                command,
                responder: CommandResponder::Caller(reply_tx),
            }))
            .await
            .map_err(|_| Error::Disconnected)?;

            let line = reply_rx.await.map_err(|_| Error::Disconnected)??;
            Ok(Some(line))
        } else {
            tx.send(ControlMessage::Execute(QueuedCommand {
                command,
                responder: CommandResponder::Discard,
            }))
            .await
            .map_err(|_| Error::Disconnected)?;
            Ok(None)
        }
    }

    /// Queue a command and await its reply line
    pub async fn send_command(&self, text: impl Into<String>) -> Result<String> {
        let reply = self.execute(Command::new(text)).await?;
        Ok(reply.unwrap_or_default())
    }

    /// Send an emergency/control command through the bypass lane
    pub async fn send_immediate(&self, text: impl Into<String>) -> Result<()> {
        self.execute(Command::immediate(text)).await?;
        Ok(())
    }

    /// Start a chunked upload of `content` as `file_name` on the device
    ///
    /// Any active transfer is cancelled first. Progress and the terminal
    /// outcome arrive as `FileTransfer` events.
    pub async fn start_file_transfer(
        &self,
        file_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<()> {
        let tx = self.sender()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(ControlMessage::StartTransfer {
            file_name: file_name.into(),
            content: content.into(),
            ack: ack_tx,
        })
        .await
        .map_err(|_| Error::Disconnected)?;
        ack_rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Cancel the active transfer, if any
    pub async fn cancel_file_transfer(&self) -> Result<()> {
        let tx = self.sender()?;
        tx.send(ControlMessage::CancelTransfer)
            .await
            .map_err(|_| Error::Disconnected)
    }

    /// Ask the device to run a stored file
    pub async fn run_file(&self, name: &str) -> Result<String> {
        self.send_command(format!("{} {}", CMD_RUN, name)).await
    }

    /// Delete a stored file on the device
    pub async fn delete_file(&self, name: &str) -> Result<String> {
        self.send_command(format!("{} {}", CMD_DELETE, name)).await
    }

    /// Tear down the connection; idempotent
    ///
    /// Cancels any active transfer, rejects all queued and pending
    /// commands, and stops the IO loop before returning.
    pub async fn disconnect(&self) -> Result<()> {
        let tx = self.control_tx.write().take();
        let handle = self.io_task.write().take();

        match tx {
            Some(tx) => {
                if tx
                    .send(ControlMessage::Disconnect {
                        reason: DisconnectReason::UserRequested,
                    })
                    .await
                    .is_err()
                {
                    // IO loop already gone; make the state honest.
                    *self.state.write() = ConnectionState::Disconnected;
                }
            }
            None => {
                return Ok(());
            }
        }

        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

impl Default for DeviceConnection {
    fn default() -> Self {
        Self::new()
    }
}

/// What to do after folding a progress report into the session
enum ProgressAction {
    None,
    NextChunk,
    Complete,
}

/// What to do after a transfer deadline expired
enum DeadlineAction {
    None,
    Rewrite,
    Abort(Error),
}

/// The IO loop: sole owner of all per-connection protocol state
struct IoLoop {
    transport: Box<dyn Transport>,
    framer: LineFramer,
    dispatcher: CommandDispatcher,
    transfer: Option<FileTransferSession>,
    transfer_deadline: Option<Instant>,
    bus: Arc<EventBus>,
    state: Arc<RwLock<ConnectionState>>,
    config: ConnectionConfig,
    target: String,
}

impl IoLoop {
    async fn run(mut self, mut control_rx: mpsc::Receiver<ControlMessage>) {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        tracing::debug!("IO loop started for {}", self.target);

        loop {
            // Control phase: drain pending requests.
            loop {
                use mpsc::error::TryRecvError;
                match control_rx.try_recv() {
                    Ok(ControlMessage::Disconnect { reason }) => {
                        self.teardown(reason);
                        return;
                    }
                    Ok(msg) => {
                        if let Err(e) = self.handle_control(msg) {
                            self.teardown(DisconnectReason::TransportError(e.to_string()));
                            return;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.teardown(DisconnectReason::ConnectionLost);
                        return;
                    }
                }
            }

            // Read phase: transport bytes through the framer.
            if let Err(e) = self.pump_reads() {
                self.teardown(DisconnectReason::TransportError(e.to_string()));
                return;
            }

            // Timeout phase: pending slot, then transfer deadlines.
            self.check_timeouts();

            // Write phase: dispatch from the FIFO when the slot is free.
            if let Err(e) = self.dispatch_ready() {
                self.teardown(DisconnectReason::TransportError(e.to_string()));
                return;
            }

            tokio::time::sleep(poll).await;
        }
    }

    fn handle_control(&mut self, msg: ControlMessage) -> Result<()> {
        match msg {
            ControlMessage::Execute(qc) if qc.command.immediate => self.write_immediate(qc),
            ControlMessage::Execute(qc) => {
                self.dispatcher.enqueue(qc);
                Ok(())
            }
            ControlMessage::StartTransfer {
                file_name,
                content,
                ack,
            } => {
                self.begin_transfer(file_name, content);
                let _ = ack.send(Ok(()));
                Ok(())
            }
            ControlMessage::CancelTransfer => {
                self.cancel_session();
                Ok(())
            }
            // Disconnect is intercepted by the run loop.
            ControlMessage::Disconnect { .. } => Ok(()),
        }
    }

    /// Immediate lane: write now, bypassing the FIFO
    fn write_immediate(&mut self, qc: QueuedCommand) -> Result<()> {
        let QueuedCommand { command, responder } = qc;

        if let Err(e) = self.transport.write_all(&frame_command(&command.text)) {
            responder.respond(Err(Error::transport(e.to_string())));
            return Err(e);
        }

        self.bus.publish(PanelEvent::Command(CommandEvent::Sent {
            text: command.text.clone(),
            immediate: true,
        }));
        tracing::debug!("tx (immediate): {}", command.text);

        if command.expect_response {
            if self.dispatcher.has_pending() {
                // The slot is single-occupancy; an immediate command
                // cannot steal it from the command in flight.
                responder.respond(Err(Error::protocol("response slot is busy")));
            } else {
                self.dispatcher
                    .open_slot(command.text, responder, Instant::now());
            }
        }
        Ok(())
    }

    fn pump_reads(&mut self) -> Result<()> {
        let mut buf = [0u8; 1024];
        loop {
            let n = self.transport.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            for line in self.framer.push(&buf[..n]) {
                self.handle_line(line);
            }
            if n < buf.len() {
                return Ok(());
            }
        }
    }

    /// Route one framed line: telemetry first, then transfer traffic
    /// while a session is active, then the pending slot
    fn handle_line(&mut self, line: String) {
        if line.is_empty() {
            return;
        }

        let transfer_active = self.transfer.as_ref().is_some_and(|s| s.state.is_active());

        match classify_line(&line) {
            DeviceLine::Telemetry(report) => {
                // Telemetry never consumes the pending slot.
                self.bus
                    .publish(PanelEvent::Telemetry(TelemetryEvent::Position { report }));
            }
            DeviceLine::TransferProgress {
                bytes_transferred, ..
            } if transfer_active => self.handle_transfer_progress(bytes_transferred),
            DeviceLine::TransferComplete if transfer_active => self.handle_transfer_complete(),
            DeviceLine::TransferError(message) if transfer_active => {
                self.fail_session(Error::protocol(message));
            }
            // Replies, and transfer markers with no session to claim them.
            _ => self.handle_reply(line),
        }
    }

    fn handle_reply(&mut self, line: String) {
        match self.dispatcher.resolve_pending(Instant::now()) {
            Some((command, responder)) => {
                self.bus.publish(PanelEvent::Response(ResponseEvent::Reply {
                    command,
                    line: line.clone(),
                }));
                match responder {
                    CommandResponder::Caller(tx) => {
                        let _ = tx.send(Ok(line));
                    }
                    CommandResponder::Discard => {}
                    CommandResponder::TransferDelete => self.advance_after_delete(),
                    CommandResponder::TransferReceive => self.advance_after_receive(&line),
                }
            }
            None => {
                tracing::debug!("rx (unsolicited): {}", line);
                self.bus
                    .publish(PanelEvent::Response(ResponseEvent::Unsolicited { line }));
            }
        }
    }

    fn begin_transfer(&mut self, file_name: String, content: String) {
        // At most one session: a new request displaces the active one.
        self.cancel_session();

        let mut session = FileTransferSession::new(
            &file_name,
            &content,
            self.config.chunk_size,
            self.config.max_retries,
        );
        session.state = TransferState::Starting;
        tracing::info!(
            "Starting transfer of {} ({} bytes, {} lines)",
            file_name,
            session.bytes_total,
            session.total_lines
        );

        self.dispatcher.enqueue(QueuedCommand {
            command: Command::new(format!("{} {}", CMD_DELETE, file_name)),
            responder: CommandResponder::TransferDelete,
        });
        self.transfer = Some(session);
    }

    /// `@DELETE` resolved (any reply accepted): issue the receive handshake
    fn advance_after_delete(&mut self) {
        let Some(session) = self.transfer.as_ref() else {
            return;
        };
        if session.state != TransferState::Starting {
            return;
        }
        self.dispatcher.enqueue(QueuedCommand {
            command: Command::new(format!(
                "{} {} {}",
                CMD_RECEIVE, session.file_name, session.bytes_total
            )),
            responder: CommandResponder::TransferReceive,
        });
    }

    /// `@RECEIVE` resolved: the reply must carry the ready ack
    fn advance_after_receive(&mut self, line: &str) {
        let started = {
            let Some(session) = self.transfer.as_mut() else {
                return;
            };
            if session.state != TransferState::Starting {
                return;
            }
            if !line.contains(RECEIVE_READY_ACK) {
                None
            } else {
                self.bus
                    .publish(PanelEvent::FileTransfer(FileTransferEvent::Started {
                        file_name: session.file_name.clone(),
                        bytes_total: session.bytes_total,
                        total_lines: session.total_lines,
                    }));
                if session.chunk_count() == 0 {
                    Some(true)
                } else {
                    session.state = TransferState::Transferring;
                    Some(false)
                }
            }
        };

        match started {
            None => {
                self.fail_session(Error::protocol(format!(
                    "Unexpected handshake reply: {}",
                    line
                )));
            }
            Some(true) => self.begin_completion(),
            Some(false) => self.write_current_chunk(),
        }
    }

    /// Write the session's current chunk and arm the per-chunk timeout
    fn write_current_chunk(&mut self) {
        let payload = match self.transfer.as_ref() {
            Some(session) => session.chunk_payload(session.current_chunk()),
            None => return,
        };

        match self.transport.write_all(&payload) {
            Ok(()) => {
                if let Some(session) = self.transfer.as_mut() {
                    session.mark_chunk_written();
                }
                self.transfer_deadline =
                    Some(Instant::now() + Duration::from_millis(self.config.chunk_timeout_ms));
            }
            Err(e) => self.fail_session(Error::transport(format!("chunk write failed: {}", e))),
        }
    }

    /// Write the end-of-stream marker and arm the completion timeout
    fn begin_completion(&mut self) {
        if let Some(session) = self.transfer.as_mut() {
            session.state = TransferState::Completing;
        }
        match self.transport.write_all(&frame_command(END_OF_STREAM)) {
            Ok(()) => {
                self.transfer_deadline =
                    Some(Instant::now() + Duration::from_millis(self.config.completion_timeout_ms));
            }
            Err(e) => {
                self.fail_session(Error::transport(format!("end marker write failed: {}", e)));
            }
        }
    }

    /// Fold a cumulative byte-progress report into the active session
    ///
    /// Chunk acknowledgment is inferred from the report reaching the
    /// current chunk's end offset; there is no explicit per-chunk ack
    /// in the protocol.
    fn handle_transfer_progress(&mut self, bytes: u64) {
        let action = {
            let Some(session) = self.transfer.as_mut() else {
                return;
            };
            session.record_progress(bytes);
            self.bus
                .publish(PanelEvent::FileTransfer(FileTransferEvent::Progress {
                    file_name: session.file_name.clone(),
                    percent: session.percent(),
                    bytes_transferred: session.bytes_transferred,
                    bytes_total: session.bytes_total,
                    current_line: session.current_line,
                    total_lines: session.total_lines,
                }));

            if session.state != TransferState::Transferring
                || !session.current_chunk_acknowledged()
            {
                ProgressAction::None
            } else if session.on_last_chunk() {
                ProgressAction::Complete
            } else {
                session.advance_chunk();
                ProgressAction::NextChunk
            }
        };

        match action {
            ProgressAction::None => {}
            ProgressAction::NextChunk => self.write_current_chunk(),
            ProgressAction::Complete => self.begin_completion(),
        }
    }

    fn handle_transfer_complete(&mut self) {
        // Success only counts after the end-of-stream marker went out; a
        // completion marker with chunks still unsent is a device fault.
        if !self
            .transfer
            .as_ref()
            .is_some_and(|s| s.state == TransferState::Completing)
        {
            self.fail_session(Error::protocol(
                "completion marker arrived before end of stream",
            ));
            return;
        }
        let Some(mut session) = self.transfer.take() else {
            return;
        };
        self.transfer_deadline = None;
        session.state = TransferState::Completed;
        session.record_progress(session.bytes_total);
        session.current_line = session.total_lines;

        tracing::info!("Transfer of {} completed", session.file_name);
        self.bus
            .publish(PanelEvent::FileTransfer(FileTransferEvent::Completed {
                file_name: session.file_name,
                bytes_total: session.bytes_total,
            }));
    }

    /// Terminate the session with exactly one failure event
    fn fail_session(&mut self, error: Error) {
        let Some(mut session) = self.transfer.take() else {
            return;
        };
        self.transfer_deadline = None;
        self.dispatcher.abandon_transfer_commands();
        session.state = TransferState::Error;

        let message = error.to_string();
        tracing::error!("Transfer of {} failed: {}", session.file_name, message);
        self.bus
            .publish(PanelEvent::FileTransfer(FileTransferEvent::Failed {
                file_name: session.file_name,
                message,
                bytes_transferred: session.bytes_transferred,
                bytes_total: session.bytes_total,
            }));
    }

    /// Cancel the active session, if any, with a best-effort `@CANCEL`
    fn cancel_session(&mut self) {
        let Some(mut session) = self.transfer.take() else {
            return;
        };
        self.transfer_deadline = None;
        self.dispatcher.abandon_transfer_commands();

        if session.state.is_active() {
            // Best effort; a dead transport must not block cancellation.
            if let Err(e) = self.transport.write_all(&frame_command(CMD_CANCEL)) {
                tracing::debug!("cancel write failed (ignored): {}", e);
            }
        }
        session.state = TransferState::Cancelled;

        tracing::info!("Transfer of {} cancelled", session.file_name);
        self.bus
            .publish(PanelEvent::FileTransfer(FileTransferEvent::Cancelled {
                file_name: session.file_name,
            }));
    }

    fn check_timeouts(&mut self) {
        let now = Instant::now();

        if let Some((command, responder, timeout_ms)) = self.dispatcher.check_timeout(now) {
            tracing::warn!("Command '{}' timed out after {}ms", command, timeout_ms);
            match responder {
                CommandResponder::Caller(tx) => {
                    let _ = tx.send(Err(Error::ResponseTimeout { timeout_ms }));
                }
                CommandResponder::Discard => {}
                CommandResponder::TransferDelete | CommandResponder::TransferReceive => {
                    self.fail_session(Error::ResponseTimeout { timeout_ms });
                }
            }
        }

        if self.transfer_deadline.is_some_and(|d| now >= d) {
            self.handle_transfer_deadline();
        }
    }

    fn handle_transfer_deadline(&mut self) {
        let action = match self.transfer.as_mut() {
            Some(session) if session.state == TransferState::Transferring => {
                if session.register_retry() {
                    DeadlineAction::Abort(Error::TransferAborted {
                        reason: format!(
                            "chunk {} unacknowledged after {} retries",
                            session.current_chunk(),
                            session.max_retries
                        ),
                    })
                } else {
                    tracing::warn!(
                        "Chunk {} unacknowledged, retrying ({}/{})",
                        session.current_chunk(),
                        session.retry_count,
                        session.max_retries
                    );
                    DeadlineAction::Rewrite
                }
            }
            Some(session) if session.state == TransferState::Completing => {
                DeadlineAction::Abort(Error::TransferAborted {
                    reason: "timed out waiting for completion acknowledgment".to_string(),
                })
            }
            _ => {
                self.transfer_deadline = None;
                DeadlineAction::None
            }
        };

        match action {
            DeadlineAction::None => {}
            DeadlineAction::Rewrite => self.write_current_chunk(),
            DeadlineAction::Abort(error) => self.fail_session(error),
        }
    }

    fn dispatch_ready(&mut self) -> Result<()> {
        let now = Instant::now();
        // The FIFO is held while a transfer owns the wire; only the
        // transfer's own handshake commands go out.
        let transfer_active = self.transfer.as_ref().is_some_and(|s| s.state.is_active());

        while self.dispatcher.ready_to_dispatch(now, transfer_active) {
            let Some(QueuedCommand { command, responder }) = self.dispatcher.dequeue(transfer_active)
            else {
                return Ok(());
            };

            if let Err(e) = self.transport.write_all(&frame_command(&command.text)) {
                responder.respond(Err(Error::transport(e.to_string())));
                return Err(e);
            }

            self.bus.publish(PanelEvent::Command(CommandEvent::Sent {
                text: command.text.clone(),
                immediate: false,
            }));
            tracing::debug!("tx: {}", command.text);

            if command.expect_response {
                self.dispatcher.open_slot(command.text, responder, now);
                // Await resolution before the next dispatch.
                return Ok(());
            }
            self.dispatcher.note_dispatched(now);
        }
        Ok(())
    }

    /// Coordinated teardown: cancel the transfer, reject every wait,
    /// close the transport, publish the terminal events
    fn teardown(&mut self, reason: DisconnectReason) {
        tracing::info!("Tearing down connection to {} ({:?})", self.target, reason);

        self.cancel_session();

        for responder in self.dispatcher.reject_all() {
            responder.respond(Err(Error::Disconnected));
        }

        self.framer.clear();
        self.transport.close();

        let is_error = matches!(reason, DisconnectReason::TransportError(_));
        if let DisconnectReason::TransportError(ref message) = reason {
            self.bus.publish(PanelEvent::Error(ErrorEvent::Error {
                message: message.clone(),
            }));
        }

        *self.state.write() = if is_error {
            ConnectionState::Error
        } else {
            ConnectionState::Disconnected
        };
        self.bus
            .publish(PanelEvent::Connection(ConnectionEvent::Disconnected {
                target: self.target.clone(),
                reason,
            }));
    }
}
