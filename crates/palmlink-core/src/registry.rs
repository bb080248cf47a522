//! Durable client registry.
//!
//! One record per paired device, persisted as JSON with owner-only
//! permissions. Only the SHA-256 of a device's auth token is stored; the raw
//! token exists on the device and, briefly, in the pairing completion
//! notification.
//!
//! Mutations clone the current map, persist the clone, and only then swap it
//! in, all under the write lock. A failed write leaves both the file and the
//! in-memory view unchanged.

use crate::fsutil;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use palmlink_crypto::{constant_time_eq, hash_token};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Compared against when the device id is unknown. Not hex, so no real
/// token hash can ever equal it.
const UNKNOWN_DEVICE_HASH: &str =
    "xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx";

const REGISTRY_VERSION: u32 = 1;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Reading or writing the registry file failed
    #[error("registry io: {0}")]
    Io(#[from] std::io::Error),

    /// The registry file exists but cannot be parsed
    #[error("registry file is corrupt: {0}")]
    Corrupt(String),

    /// Serializing the registry failed
    #[error("registry serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

/// A paired device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    /// Device identifier
    pub device_id: String,
    /// Hex SHA-256 of the device's auth token
    pub token_hash: String,
    /// Base64 channel encryption key
    pub key: String,
    /// Human-readable device name
    pub name: String,
    /// When the device was paired
    pub created_at: DateTime<Utc>,
    /// Last successful authentication
    pub last_seen: DateTime<Utc>,
}

impl ClientRecord {
    /// Decode the stored channel key.
    pub fn key_bytes(&self) -> Option<[u8; 32]> {
        BASE64.decode(&self.key).ok()?.try_into().ok()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    clients: BTreeMap<String, ClientRecord>,
}

/// Paired-device registry backed by a JSON file.
pub struct ClientRegistry {
    path: PathBuf,
    clients: RwLock<HashMap<String, ClientRecord>>,
}

impl ClientRegistry {
    /// Open the registry at `path`. A missing file is an empty registry.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let clients = match fsutil::read_optional(&path).await? {
            Some(bytes) => {
                let file: RegistryFile = serde_json::from_slice(&bytes)
                    .map_err(|e| RegistryError::Corrupt(e.to_string()))?;
                file.clients.into_iter().collect()
            }
            None => HashMap::new(),
        };

        debug!(count = clients.len(), path = %path.display(), "Loaded client registry");

        Ok(Self {
            path,
            clients: RwLock::new(clients),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a device, replacing any previous record with the same id.
    pub async fn add(
        &self,
        device_id: &str,
        raw_token: &str,
        key: &[u8; 32],
        name: &str,
    ) -> Result<ClientRecord> {
        let now = Utc::now();
        let record = ClientRecord {
            device_id: device_id.to_string(),
            token_hash: hash_token(raw_token),
            key: BASE64.encode(key),
            name: name.to_string(),
            created_at: now,
            last_seen: now,
        };

        let mut clients = self.clients.write().await;
        let mut next = clients.clone();
        next.insert(device_id.to_string(), record.clone());
        self.persist(&next).await?;
        *clients = next;

        info!(device_id = %device_id, name = %name, "Client registered");
        Ok(record)
    }

    /// Check a token for a device.
    ///
    /// Unknown ids, wrong-length tokens and wrong tokens all hash the
    /// candidate and run one constant-time comparison against a 64-byte
    /// value, so they cannot be told apart by timing.
    pub async fn validate(&self, device_id: &str, token: &str) -> bool {
        let candidate = hash_token(token);
        let clients = self.clients.read().await;
        let stored = clients
            .get(device_id)
            .map(|r| r.token_hash.as_str())
            .unwrap_or(UNKNOWN_DEVICE_HASH);
        constant_time_eq(stored.as_bytes(), candidate.as_bytes())
    }

    /// Update a device's last-seen time. Returns false for unknown ids.
    pub async fn touch(&self, device_id: &str) -> Result<bool> {
        self.update(device_id, |record| record.last_seen = Utc::now())
            .await
    }

    /// Rename a device. Returns false for unknown ids.
    pub async fn rename(&self, device_id: &str, name: &str) -> Result<bool> {
        let renamed = self
            .update(device_id, |record| record.name = name.to_string())
            .await?;
        if renamed {
            info!(device_id = %device_id, name = %name, "Client renamed");
        }
        Ok(renamed)
    }

    /// Remove a device. Returns false for unknown ids.
    pub async fn revoke(&self, device_id: &str) -> Result<bool> {
        let mut clients = self.clients.write().await;
        if !clients.contains_key(device_id) {
            return Ok(false);
        }
        let mut next = clients.clone();
        next.remove(device_id);
        self.persist(&next).await?;
        *clients = next;

        info!(device_id = %device_id, "Client revoked");
        Ok(true)
    }

    /// All devices, oldest pairing first.
    pub async fn list(&self) -> Vec<ClientRecord> {
        let mut records: Vec<_> = self.clients.read().await.values().cloned().collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });
        records
    }

    /// Look up one device.
    pub async fn get(&self, device_id: &str) -> Option<ClientRecord> {
        self.clients.read().await.get(device_id).cloned()
    }

    /// Channel key for a device, if it is registered and the key decodes.
    pub async fn encryption_key(&self, device_id: &str) -> Option<[u8; 32]> {
        self.clients
            .read()
            .await
            .get(device_id)
            .and_then(ClientRecord::key_bytes)
    }

    async fn update(&self, device_id: &str, apply: impl FnOnce(&mut ClientRecord)) -> Result<bool> {
        let mut clients = self.clients.write().await;
        let mut next = clients.clone();
        let Some(record) = next.get_mut(device_id) else {
            return Ok(false);
        };
        apply(record);
        self.persist(&next).await?;
        *clients = next;
        Ok(true)
    }

    async fn persist(&self, clients: &HashMap<String, ClientRecord>) -> Result<()> {
        let file = RegistryFile {
            version: REGISTRY_VERSION,
            clients: clients
                .iter()
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        fsutil::write_private(&self.path, &json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
