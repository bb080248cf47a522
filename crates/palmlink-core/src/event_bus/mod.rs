//! EventBus - typed publish/subscribe hub for daemon events.
//!
//! Session watching, transcript ingestion, pairing and the tunnel supervisor
//! publish here; the connection layer and the session bridge consume.

/// Core event bus implementation (handlers + broadcast channel).
pub mod bus;
/// Event type definitions.
pub mod types;

pub use bus::{EventBus, EventHandler};
pub use types::DaemonEvent;
