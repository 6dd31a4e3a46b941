//! # FluidPanel Core
//!
//! Shared types for the FluidPanel device link: the error taxonomy,
//! the event model, and the per-connection event bus.

pub mod error;
pub mod event_bus;
pub mod events;

pub use error::{Error, Result};
pub use event_bus::{EventBus, EventFilter, SubscriptionId};
pub use events::{
    CommandEvent, ConnectionEvent, DisconnectReason, ErrorEvent, EventCategory, FileTransferEvent,
    PanelEvent, ResponseEvent, TelemetryEvent, TelemetryReport,
};
