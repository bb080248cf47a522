//! Local daemon credentials
//!
//! `credentials.json` holds a random local secret (from which the stable
//! workstation id is derived) and, once the operator has signed in upstream,
//! the bearer token the tunnel authenticates with. The file is written with
//! owner-only permissions.

use crate::fsutil;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Credentials file errors
#[derive(Debug, Error)]
pub enum CredentialsError {
    /// Reading or writing the file failed
    #[error("credentials io: {0}")]
    Io(#[from] std::io::Error),

    /// The file exists but cannot be parsed
    #[error("credentials file is corrupt: {0}")]
    Corrupt(String),

    /// Serializing the credentials failed
    #[error("credentials serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for credentials operations
pub type Result<T> = std::result::Result<T, CredentialsError>;

/// Contents of `credentials.json`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalCredentials {
    /// 32 random bytes, base64
    pub secret: String,
    /// Upstream bearer token used by the tunnel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    /// When the bearer token stops being valid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_expires_at: Option<DateTime<Utc>>,
}

impl LocalCredentials {
    /// Fresh credentials with a new random secret and no bearer token.
    pub fn generate() -> Self {
        Self {
            secret: BASE64.encode(palmlink_crypto::random_key()),
            bearer_token: None,
            bearer_expires_at: None,
        }
    }

    /// Load credentials; a missing file is `None`.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let Some(bytes) = fsutil::read_optional(path).await? else {
            return Ok(None);
        };
        let credentials =
            serde_json::from_slice(&bytes).map_err(|e| CredentialsError::Corrupt(e.to_string()))?;
        Ok(Some(credentials))
    }

    /// Load credentials, generating and saving new ones if the file is
    /// missing.
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if let Some(credentials) = Self::load(path).await? {
            return Ok(credentials);
        }
        let credentials = Self::generate();
        credentials.save(path).await?;
        info!(path = %path.display(), "Generated local credentials");
        Ok(credentials)
    }

    /// Persist with owner-only permissions.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        fsutil::write_private(path, &json).await?;
        Ok(())
    }

    /// The bearer token, if present, non-empty and not expired at `now`.
    pub fn valid_bearer_token(&self, now: DateTime<Utc>) -> Option<&str> {
        let token = self.bearer_token.as_deref()?.trim();
        if token.is_empty() {
            return None;
        }
        match self.bearer_expires_at {
            Some(expires_at) if expires_at <= now => None,
            _ => Some(token),
        }
    }

    /// Whether a usable bearer token is stored.
    pub fn bearer_token_valid(&self, now: DateTime<Utc>) -> bool {
        self.valid_bearer_token(now).is_some()
    }

    /// Stable workstation id: first 16 hex chars of SHA-256 of the secret.
    pub fn workstation_id(&self) -> String {
        let digest = hex::encode(Sha256::digest(self.secret.as_bytes()));
        digest[..16].to_string()
    }
}

impl std::fmt::Debug for LocalCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCredentials")
            .field("secret", &"[REDACTED]")
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "[REDACTED]"))
            .field("bearer_expires_at", &self.bearer_expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests;
