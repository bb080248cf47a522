//! SPAKE2 device pairing.
//!
//! Flow:
//! 1. The operator starts pairing; the workstation shows a short code
//!    (`ABCD-EFGH`) that stays valid for the configured TTL (5 minutes)
//! 2. The device sends `pair_init` with its SPAKE2 message, keyed by the code
//! 3. The workstation answers `pair_challenge` with its own SPAKE2 message
//! 4. The device sends `pair_confirm` with its confirmation MAC
//! 5. The workstation checks the MAC, registers the device, and answers
//!    `pair_complete` with its own MAC
//!
//! Only one pairing session exists at a time. Starting a new one replaces the
//! old one, and the old session's expiry timer becomes a no-op because it
//! carries a stale generation number.
//!
//! A wrong MAC discards the handshake but keeps the session, so the device
//! can re-run init/confirm after the operator re-enters the code. After
//! `max_confirm_attempts` failures the session is dropped.

pub mod protocol;

pub use protocol::{
    ChallengeMessage, CompleteMessage, ConfirmMessage, ErrorMessage, InitMessage, PairingErrorCode,
    PairingMessage,
};

use crate::event_bus::{DaemonEvent, EventBus};
use crate::registry::ClientRegistry;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use palmlink_crypto::PairingKeys;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Code alphabet without look-alikes (no 0/O, 1/I).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 8;

/// Pairing failures, each with a wire code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    /// No active pairing session
    #[error("pairing is not enabled")]
    Disabled,
    /// Undecodable or out-of-order message
    #[error("invalid pairing message: {0}")]
    InvalidFormat(String),
    /// Device MAC did not verify
    #[error("confirmation failed, check the pairing code")]
    MacMismatch,
    /// Storing the device failed
    #[error("internal pairing error: {0}")]
    Internal(String),
}

impl PairingError {
    /// Wire code for this error.
    pub fn code(&self) -> PairingErrorCode {
        match self {
            Self::Disabled => PairingErrorCode::PairingDisabled,
            Self::InvalidFormat(_) => PairingErrorCode::InvalidFormat,
            Self::MacMismatch => PairingErrorCode::MacMismatch,
            Self::Internal(_) => PairingErrorCode::InternalError,
        }
    }

    /// `pair_error` payload for this error.
    pub fn to_message(&self) -> ErrorMessage {
        ErrorMessage {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

/// Pairing settings.
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// How long a pairing code stays valid
    pub ttl: Duration,
    /// Failed confirmations tolerated before the session is dropped
    pub max_confirm_attempts: u32,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_confirm_attempts: 3,
        }
    }
}

/// Who the device is pairing with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkstationIdentity {
    /// Stable workstation identifier
    pub id: String,
    /// Display name (usually the hostname)
    pub name: String,
}

/// Code returned by [`PairingEngine::start_pairing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingCode {
    /// Raw code, e.g. `ABCDEFGH`
    pub code: String,
    /// Display form, e.g. `ABCD-EFGH`
    pub display: String,
}

/// Secrets of a freshly paired device, sent to the completion observer so
/// the connection layer can accept the device right away.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PairedClient {
    /// Device identifier
    pub device_id: String,
    /// Device display name
    pub device_name: String,
    /// Raw auth token (only its hash is persisted)
    pub auth_token: String,
    /// Channel encryption key
    pub encryption_key: [u8; 32],
}

impl std::fmt::Debug for PairedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairedClient")
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .field("auth_token", &"[REDACTED]")
            .field("encryption_key", &"[REDACTED]")
            .finish()
    }
}

struct PendingHandshake {
    device_id: String,
    device_name: String,
    keys: PairingKeys,
}

struct PairingSession {
    code: String,
    generation: u64,
    expires_at: Instant,
    handshake: Option<PendingHandshake>,
    failed_confirms: u32,
}

impl PairingSession {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Runs the workstation side of pairing.
pub struct PairingEngine {
    registry: Arc<ClientRegistry>,
    bus: EventBus,
    identity: WorkstationIdentity,
    config: PairingConfig,
    session: Mutex<Option<PairingSession>>,
    generation: AtomicU64,
    completions: mpsc::UnboundedSender<PairedClient>,
}

impl PairingEngine {
    /// Create an engine. Completed pairings are sent to `completions`.
    pub fn new(
        registry: Arc<ClientRegistry>,
        bus: EventBus,
        identity: WorkstationIdentity,
        config: PairingConfig,
        completions: mpsc::UnboundedSender<PairedClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            bus,
            identity,
            config,
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            completions,
        })
    }

    /// Workstation identity sent in `pair_complete`.
    pub fn identity(&self) -> &WorkstationIdentity {
        &self.identity
    }

    /// Start a new pairing session, replacing any existing one.
    pub async fn start_pairing(self: &Arc<Self>) -> PairingCode {
        let code = generate_code();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let session = PairingSession {
            code: code.clone(),
            generation,
            expires_at: Instant::now() + self.config.ttl,
            handshake: None,
            failed_confirms: 0,
        };

        let replaced = self.session.lock().await.replace(session).is_some();
        if replaced {
            debug!("Replaced previous pairing session");
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let ttl = self.config.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(engine) = weak.upgrade() {
                engine.expire(generation).await;
            }
        });

        info!(ttl_secs = ttl.as_secs(), "Pairing started");
        PairingCode {
            display: display_code(&code),
            code,
        }
    }

    /// Whether a non-expired pairing session exists.
    pub async fn is_active(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.is_expired())
    }

    /// Drop the current pairing session, if any.
    pub async fn cancel(&self) {
        if self.session.lock().await.take().is_some() {
            info!("Pairing cancelled");
        }
    }

    /// Handle `pair_init`: run SPAKE2 and return the challenge.
    pub async fn handle_init(&self, init: &InitMessage) -> Result<ChallengeMessage, PairingError> {
        let mut guard = self.session.lock().await;
        let session = active_session(&mut guard)?;

        let device_msg = BASE64
            .decode(init.spake.trim())
            .map_err(|_| PairingError::InvalidFormat("spake is not valid base64".to_string()))?;

        let requested_id = init.device_id.clone().filter(|id| !id.trim().is_empty());
        let assigned = requested_id.is_none();
        let device_id =
            requested_id.unwrap_or_else(|| hex::encode(&palmlink_crypto::random_key()[..16]));
        let device_name = init
            .device_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "Unknown device".to_string());

        let response = palmlink_crypto::respond(&session.code, &device_id, &device_msg)
            .map_err(|e| PairingError::InvalidFormat(e.to_string()))?;

        debug!(device_id = %device_id, assigned, "Pairing handshake initialised");
        let challenge = ChallengeMessage {
            spake: BASE64.encode(&response.message),
            device_id: assigned.then(|| device_id.clone()),
        };
        session.handshake = Some(PendingHandshake {
            device_id,
            device_name,
            keys: response.keys,
        });

        Ok(challenge)
    }

    /// Handle `pair_confirm`: verify the device, register it, and return
    /// the workstation's confirmation.
    pub async fn handle_confirm(
        &self,
        confirm: &ConfirmMessage,
    ) -> Result<CompleteMessage, PairingError> {
        let mut guard = self.session.lock().await;
        let session = active_session(&mut guard)?;

        let mac = BASE64
            .decode(confirm.mac.trim())
            .map_err(|_| PairingError::InvalidFormat("mac is not valid base64".to_string()))?;

        let Some(handshake) = session.handshake.take() else {
            return Err(PairingError::InvalidFormat(
                "pair_confirm received before pair_init".to_string(),
            ));
        };

        if handshake.keys.verify_device_mac(&mac).is_err() {
            session.failed_confirms += 1;
            let failures = session.failed_confirms;
            warn!(
                device_id = %handshake.device_id,
                failures,
                "Pairing confirmation failed"
            );
            if failures >= self.config.max_confirm_attempts {
                *guard = None;
                warn!("Pairing session dropped after repeated confirmation failures");
            }
            return Err(PairingError::MacMismatch);
        }

        // Single use: the session ends here whatever happens next.
        *guard = None;
        drop(guard);

        let auth_token = handshake.keys.auth_token();
        let encryption_key = handshake.keys.encryption_key();
        self.registry
            .add(
                &handshake.device_id,
                &auth_token,
                &encryption_key,
                &handshake.device_name,
            )
            .await
            .map_err(|e| PairingError::Internal(e.to_string()))?;

        info!(
            device_id = %handshake.device_id,
            device_name = %handshake.device_name,
            "Device paired"
        );

        let paired = PairedClient {
            device_id: handshake.device_id.clone(),
            device_name: handshake.device_name.clone(),
            auth_token,
            encryption_key,
        };
        if self.completions.send(paired).is_err() {
            debug!("No pairing observer attached");
        }
        self.bus.publish(DaemonEvent::PairingCompleted {
            device_id: handshake.device_id.clone(),
            device_name: handshake.device_name.clone(),
        });

        Ok(CompleteMessage {
            mac: BASE64.encode(handshake.keys.workstation_mac()),
            workstation_id: self.identity.id.clone(),
            workstation_name: self.identity.name.clone(),
        })
    }

    /// Dispatch one inbound pairing message and build the reply.
    pub async fn handle_message(&self, message: PairingMessage) -> PairingMessage {
        let result = match message {
            PairingMessage::PairInit(init) => self
                .handle_init(&init)
                .await
                .map(PairingMessage::PairChallenge),
            PairingMessage::PairConfirm(confirm) => self
                .handle_confirm(&confirm)
                .await
                .map(PairingMessage::PairComplete),
            other => Err(PairingError::InvalidFormat(format!(
                "unexpected {} message",
                other.kind()
            ))),
        };
        result.unwrap_or_else(|e| PairingMessage::PairError(e.to_message()))
    }

    /// Parse and handle a raw JSON pairing message.
    pub async fn handle_json(&self, raw: &str) -> PairingMessage {
        match serde_json::from_str::<PairingMessage>(raw) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => PairingMessage::PairError(
                PairingError::InvalidFormat(e.to_string()).to_message(),
            ),
        }
    }

    async fn expire(&self, generation: u64) {
        let mut guard = self.session.lock().await;
        if guard.as_ref().is_some_and(|s| s.generation == generation) {
            *guard = None;
            info!("Pairing code expired");
        }
    }
}

fn active_session(slot: &mut Option<PairingSession>) -> Result<&mut PairingSession, PairingError> {
    if slot.as_ref().is_some_and(PairingSession::is_expired) {
        *slot = None;
    }
    slot.as_mut().ok_or(PairingError::Disabled)
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn display_code(code: &str) -> String {
    let half = code.len() / 2;
    match (code.get(..half), code.get(half..)) {
        (Some(head), Some(tail)) => format!("{}-{}", head, tail),
        _ => code.to_string(),
    }
}
