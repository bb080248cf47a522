use crate::sessions::SessionDescriptor;
use crate::transcript::StoredLine;
use crate::tunnel::TunnelState;
use serde::Serialize;

/// Events published inside the daemon.
///
/// Each variant has a fixed payload shape. Pairing secrets never travel on
/// the bus; they go to the pairing observer channel instead.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonEvent {
    /// A session descriptor appeared
    SessionStarted {
        /// Descriptor as read from disk
        session: SessionDescriptor,
    },
    /// A session descriptor was rewritten
    SessionUpdated {
        /// Descriptor as read from disk
        session: SessionDescriptor,
    },
    /// A session descriptor was removed
    SessionEnded {
        /// Session identifier
        session_id: String,
    },
    /// Snapshot of all active sessions after any start/update/end
    SessionsChanged {
        /// Every active session
        sessions: Vec<SessionDescriptor>,
    },
    /// New transcript lines were ingested
    MessagesAppended {
        /// Session identifier
        session_id: String,
        /// Parsed lines, in file order
        lines: Vec<StoredLine>,
        /// True when this is the full contents of a newly created file
        initial: bool,
    },
    /// The transcript carried an in-band rename marker
    SessionRenamed {
        /// Session identifier
        session_id: String,
        /// New display name
        name: String,
    },
    /// A device finished pairing
    PairingCompleted {
        /// Device identifier
        device_id: String,
        /// Human-readable device name
        device_name: String,
    },
    /// The tunnel supervisor changed state
    TunnelStatusChanged {
        /// Full supervisor state after the change
        state: TunnelState,
    },
}

impl DaemonEvent {
    /// Stable event name, e.g. `session:start`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session:start",
            Self::SessionUpdated { .. } => "session:update",
            Self::SessionEnded { .. } => "session:end",
            Self::SessionsChanged { .. } => "sessions:change",
            Self::MessagesAppended { .. } => "messages:new",
            Self::SessionRenamed { .. } => "session:rename",
            Self::PairingCompleted { .. } => "pairing:complete",
            Self::TunnelStatusChanged { .. } => "tunnel:status",
        }
    }

    /// Session the event refers to, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionStarted { session } | Self::SessionUpdated { session } => {
                Some(&session.session_id)
            }
            Self::SessionEnded { session_id }
            | Self::MessagesAppended { session_id, .. }
            | Self::SessionRenamed { session_id, .. } => Some(session_id),
            Self::SessionsChanged { .. }
            | Self::PairingCompleted { .. }
            | Self::TunnelStatusChanged { .. } => None,
        }
    }
}
