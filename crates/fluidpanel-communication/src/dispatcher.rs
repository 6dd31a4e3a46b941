//! Command dispatching: FIFO queue, immediate lane, single pending slot
//!
//! The protocol is half-duplex for command/response pairs: at most one
//! command is awaiting a reply at any instant. The dispatcher owns that
//! invariant. It holds the FIFO of not-yet-written commands, the single
//! [`PendingSlot`], the response deadline, and the inter-command delay
//! that respects device turnaround. Writing bytes and completing
//! responders is the connection actor's job; the dispatcher only decides
//! who goes next and who timed out.

use fluidpanel_core::Result;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Default response timeout for commands that expect a reply
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 5_000;

/// Default delay between a resolution and the next dispatch
pub const DEFAULT_INTER_COMMAND_DELAY_MS: u64 = 50;

/// An immutable command request
#[derive(Debug, Clone)]
pub struct Command {
    /// Command text; a trailing newline is appended on the wire if absent.
    pub text: String,
    /// Whether a reply line is expected (and awaited).
    pub expect_response: bool,
    /// Whether to bypass the FIFO (emergency/control commands).
    pub immediate: bool,
}

impl Command {
    /// A queued command that expects a reply
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            expect_response: true,
            immediate: false,
        }
    }

    /// A queued command with no reply expected
    pub fn fire_and_forget(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            expect_response: false,
            immediate: false,
        }
    }

    /// An emergency command that bypasses the FIFO
    pub fn immediate(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            expect_response: false,
            immediate: true,
        }
    }
}

/// Where a command's single resolution goes
///
/// Each responder resolves or rejects exactly once; dropping a `Caller`
/// sender rejects the awaiting future implicitly.
pub(crate) enum CommandResponder {
    /// An external caller awaiting the reply line.
    Caller(oneshot::Sender<Result<String>>),
    /// Nobody is waiting (fire-and-forget).
    Discard,
    /// Internal transfer handshake: reply to `@DELETE`.
    TransferDelete,
    /// Internal transfer handshake: reply to `@RECEIVE`.
    TransferReceive,
}

impl CommandResponder {
    /// Whether this responder belongs to the file transfer handshake
    pub fn is_transfer_internal(&self) -> bool {
        matches!(
            self,
            CommandResponder::TransferDelete | CommandResponder::TransferReceive
        )
    }

    /// Deliver the resolution to an external caller, if one is waiting
    pub fn respond(self, result: Result<String>) {
        if let CommandResponder::Caller(tx) = self {
            // The caller may have given up; that is not an error here.
            let _ = tx.send(result);
        }
    }
}

impl std::fmt::Debug for CommandResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandResponder::Caller(_) => write!(f, "Caller"),
            CommandResponder::Discard => write!(f, "Discard"),
            CommandResponder::TransferDelete => write!(f, "TransferDelete"),
            CommandResponder::TransferReceive => write!(f, "TransferReceive"),
        }
    }
}

/// A command paired with its result handle
#[derive(Debug)]
pub(crate) struct QueuedCommand {
    pub command: Command,
    pub responder: CommandResponder,
}

/// The single outstanding command awaiting a reply
#[derive(Debug)]
pub(crate) struct PendingSlot {
    pub text: String,
    pub responder: CommandResponder,
    deadline: Instant,
    timeout: Duration,
}

/// FIFO queue plus pending-slot bookkeeping
pub(crate) struct CommandDispatcher {
    queue: VecDeque<QueuedCommand>,
    pending: Option<PendingSlot>,
    next_dispatch_at: Instant,
    response_timeout: Duration,
    inter_command_delay: Duration,
}

impl CommandDispatcher {
    pub fn new(response_timeout: Duration, inter_command_delay: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            pending: None,
            next_dispatch_at: Instant::now(),
            response_timeout,
            inter_command_delay,
        }
    }

    /// Append a command to the FIFO
    pub fn enqueue(&mut self, command: QueuedCommand) {
        self.queue.push_back(command);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether a queued command may be written now
    ///
    /// `internal_only` holds the FIFO while a file transfer session is
    /// active: only the transfer's own handshake commands dispatch.
    /// Handshake commands count wherever they sit in the queue, so a
    /// transfer started behind ordinary commands can still proceed.
    pub fn ready_to_dispatch(&self, now: Instant, internal_only: bool) -> bool {
        if self.pending.is_some() || now < self.next_dispatch_at {
            return false;
        }
        if internal_only {
            self.queue
                .iter()
                .any(|qc| qc.responder.is_transfer_internal())
        } else {
            !self.queue.is_empty()
        }
    }

    /// Pop the next command for writing
    ///
    /// With `internal_only` set this skips past held ordinary commands
    /// and pulls the first transfer handshake command instead; held
    /// commands keep their relative order for when the session ends.
    pub fn dequeue(&mut self, internal_only: bool) -> Option<QueuedCommand> {
        if internal_only {
            let index = self
                .queue
                .iter()
                .position(|qc| qc.responder.is_transfer_internal())?;
            self.queue.remove(index)
        } else {
            self.queue.pop_front()
        }
    }

    /// Open the pending slot for a just-written command
    ///
    /// Invariant: never more than one slot open at a time.
    pub fn open_slot(&mut self, text: String, responder: CommandResponder, now: Instant) {
        debug_assert!(self.pending.is_none(), "pending slot already open");
        self.pending = Some(PendingSlot {
            text,
            responder,
            deadline: now + self.response_timeout,
            timeout: self.response_timeout,
        });
    }

    /// Record a write so the next dispatch waits out the turnaround delay
    pub fn note_dispatched(&mut self, now: Instant) {
        self.next_dispatch_at = now + self.inter_command_delay;
    }

    /// Resolve the pending slot with an arrived reply
    ///
    /// Returns the command text and responder; the slot is cleared and
    /// the inter-command delay restarts.
    pub fn resolve_pending(&mut self, now: Instant) -> Option<(String, CommandResponder)> {
        let slot = self.pending.take()?;
        self.note_dispatched(now);
        Some((slot.text, slot.responder))
    }

    /// Expire the pending slot if its deadline passed
    ///
    /// Returns the command text, responder, and the timeout that elapsed.
    /// The queue proceeds afterwards; retrying is the caller's decision.
    pub fn check_timeout(&mut self, now: Instant) -> Option<(String, CommandResponder, u64)> {
        if self.pending.as_ref().is_some_and(|s| now >= s.deadline) {
            let slot = self.pending.take().expect("checked above");
            self.note_dispatched(now);
            return Some((slot.text, slot.responder, slot.timeout.as_millis() as u64));
        }
        None
    }

    /// Drop queued transfer handshake commands and orphan an in-flight one
    ///
    /// Called when a session terminates: a handshake command already on
    /// the wire cannot be unsent, so its eventual reply is discarded
    /// instead of steering a session that no longer exists.
    pub fn abandon_transfer_commands(&mut self) {
        if let Some(slot) = self.pending.as_mut() {
            if slot.responder.is_transfer_internal() {
                slot.responder = CommandResponder::Discard;
            }
        }
        self.queue.retain(|qc| !qc.responder.is_transfer_internal());
    }

    /// Clear the queue and slot, returning every responder for rejection
    pub fn reject_all(&mut self) -> Vec<CommandResponder> {
        let mut responders = Vec::with_capacity(self.queue.len() + 1);
        if let Some(slot) = self.pending.take() {
            responders.push(slot.responder);
        }
        responders.extend(self.queue.drain(..).map(|qc| qc.responder));
        responders
    }
}
