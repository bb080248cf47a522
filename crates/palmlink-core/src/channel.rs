//! Per-connection encryption contexts.
//!
//! A context is created when a connection authenticates, using the channel
//! key the device received at pairing time, and dropped on disconnect. A
//! failed decrypt is a hard failure for that envelope; callers must not
//! retry it.

use dashmap::DashMap;
use palmlink_crypto::{CryptoError, EncryptedData, SessionCipher};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Transport-assigned identity of a live connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap a transport connection id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Secure channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    /// No context registered for the connection
    #[error("no encryption context for connection {0}")]
    NoContext(ConnectionId),

    /// Decryption failed or the envelope was malformed
    #[error("decryption failed: {0}")]
    DecryptionFailed(CryptoError),

    /// Encryption failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(CryptoError),

    /// Payload is not the expected JSON
    #[error("payload json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for channel operations
pub type Result<T> = std::result::Result<T, ChannelError>;

struct ClientEncryptionContext {
    device_id: String,
    cipher: SessionCipher,
}

/// Live encryption contexts keyed by connection.
#[derive(Default)]
pub struct SecureChannelManager {
    contexts: DashMap<ConnectionId, ClientEncryptionContext>,
}

impl SecureChannelManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the context for an authenticated connection, replacing any
    /// previous one.
    pub fn register(&self, connection: ConnectionId, device_id: &str, key: [u8; 32]) {
        debug!(connection = %connection, device_id = %device_id, "Channel context registered");
        self.contexts.insert(
            connection,
            ClientEncryptionContext {
                device_id: device_id.to_string(),
                cipher: SessionCipher::from_key(key),
            },
        );
    }

    /// Drop the context for a connection. Returns false if there was none.
    pub fn remove(&self, connection: &ConnectionId) -> bool {
        self.contexts.remove(connection).is_some()
    }

    /// Whether a context exists for the connection.
    pub fn has(&self, connection: &ConnectionId) -> bool {
        self.contexts.contains_key(connection)
    }

    /// Device bound to the connection.
    pub fn device_id(&self, connection: &ConnectionId) -> Option<String> {
        self.contexts
            .get(connection)
            .map(|ctx| ctx.device_id.clone())
    }

    /// Connections currently bound to a device.
    pub fn connections_for(&self, device_id: &str) -> Vec<ConnectionId> {
        self.contexts
            .iter()
            .filter(|entry| entry.value().device_id == device_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Every connection with a live context.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.contexts.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Whether no contexts are registered.
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Encrypt a payload for a connection.
    pub fn encrypt(&self, connection: &ConnectionId, payload: &[u8]) -> Result<EncryptedData> {
        let ctx = self
            .contexts
            .get(connection)
            .ok_or_else(|| ChannelError::NoContext(connection.clone()))?;
        ctx.cipher
            .encrypt(payload)
            .map_err(ChannelError::EncryptionFailed)
    }

    /// Decrypt an envelope received on a connection.
    pub fn decrypt(&self, connection: &ConnectionId, envelope: &EncryptedData) -> Result<Vec<u8>> {
        let ctx = self
            .contexts
            .get(connection)
            .ok_or_else(|| ChannelError::NoContext(connection.clone()))?;
        ctx.cipher
            .decrypt(envelope)
            .map_err(ChannelError::DecryptionFailed)
    }

    /// Serialize `value` as JSON and encrypt it into the compact wire form.
    pub fn encrypt_json<T: Serialize>(&self, connection: &ConnectionId, value: &T) -> Result<String> {
        let json = serde_json::to_vec(value)?;
        Ok(self.encrypt(connection, &json)?.to_base64())
    }

    /// Decrypt a compact wire envelope and parse its JSON payload.
    pub fn decrypt_json<T: DeserializeOwned>(
        &self,
        connection: &ConnectionId,
        wire: &str,
    ) -> Result<T> {
        let envelope = EncryptedData::from_base64(wire).map_err(ChannelError::DecryptionFailed)?;
        let plaintext = self.decrypt(connection, &envelope)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

impl fmt::Debug for SecureChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannelManager")
            .field("contexts", &self.contexts.len())
            .finish()
    }
}
