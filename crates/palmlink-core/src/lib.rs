//! palmlink core - sync and trust engine
//!
//! Everything the palmlink daemon does apart from socket handling:
//! - Pairing: SPAKE2 device pairing with a short display code
//! - Registry: paired devices with hashed auth tokens
//! - Channel: per-connection AES-GCM contexts
//! - Delivery: ack-gated per-connection batch queues
//! - Transcript: incremental JSONL tailing with sync cursors
//! - Sessions: agent session descriptor watching
//! - Tunnel: supervised frpc child process with restart backoff
//! - Daemon: composition root and connection-layer API

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod credentials;
pub mod daemon;
pub mod delivery;
pub mod error;
pub mod event_bus;
pub mod fs_watch;
pub mod instance_lock;
pub mod pairing;
pub mod registry;
pub mod sessions;
pub mod transcript;
pub mod tunnel;

mod fsutil;

pub use channel::{ConnectionId, SecureChannelManager};
pub use credentials::LocalCredentials;
pub use daemon::{Daemon, DaemonSettings, FrameSink};
pub use delivery::{
    BatchTransport, DeliveryOutcome, DeliveryQueue, DeliveryReceipt, MessageBatch, TransportError,
};
pub use error::{Error, Result};
pub use event_bus::{DaemonEvent, EventBus, EventHandler};
pub use instance_lock::{InstanceLock, InstanceLockState};
pub use pairing::{
    PairedClient, PairingCode, PairingConfig, PairingEngine, PairingMessage, WorkstationIdentity,
};
pub use registry::{ClientRecord, ClientRegistry};
pub use sessions::{SessionDescriptor, SessionWatcher};
pub use transcript::{LineKind, StoredLine, TranscriptStore, TranscriptWatcher};
pub use tunnel::{RestartPolicy, TunnelSettings, TunnelState, TunnelStatus, TunnelSupervisor};
