//! palmlink crypto - pairing and E2E encryption primitives.
//!
//! - [`pake`]: SPAKE2 pairing handshake and the HKDF key schedule that turns
//!   the shared secret into confirmation MACs, an auth token and a channel key
//! - [`token`]: token hashing and constant-time comparison for the registry
//! - [`SessionCipher`]: AES-256-GCM envelope encryption for a paired device
//!
//! Every message gets a fresh random nonce, and key material implements
//! `Zeroize` so it is wiped when dropped.

#![forbid(unsafe_code)]

pub mod pake;
pub mod token;

pub use pake::{normalize_code, respond, HandshakeResponse, PairingClient, PairingKeys};
pub use token::{constant_time_eq, hash_token};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

const NONCE_LEN: usize = 12;

/// Error types for crypto operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Encryption failed
    EncryptionFailed,
    /// Decryption failed (wrong key, tampered data, or invalid nonce)
    DecryptionFailed,
    /// Invalid data format
    InvalidFormat(String),
    /// Handshake message rejected by SPAKE2
    HandshakeFailed,
    /// Confirmation MAC did not verify
    MacMismatch,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EncryptionFailed => write!(f, "encryption failed"),
            Self::DecryptionFailed => write!(f, "decryption failed"),
            Self::InvalidFormat(msg) => write!(f, "invalid format: {}", msg),
            Self::HandshakeFailed => write!(f, "handshake failed"),
            Self::MacMismatch => write!(f, "confirmation mac mismatch"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Result type for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Encrypted data bundle.
///
/// Contains everything needed to decrypt (except the key):
/// version, nonce, and ciphertext with GCM auth tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    /// Format version (currently 1)
    pub version: u8,
    /// 12-byte nonce (GCM standard)
    pub nonce: [u8; 12],
    /// Ciphertext including GCM authentication tag (16 bytes appended)
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Compact wire form: `base64(version || nonce || ciphertext)`.
    pub fn to_base64(&self) -> String {
        let mut raw = Vec::with_capacity(1 + NONCE_LEN + self.ciphertext.len());
        raw.push(self.version);
        raw.extend_from_slice(&self.nonce);
        raw.extend_from_slice(&self.ciphertext);
        BASE64.encode(raw)
    }

    /// Parse the compact wire form produced by [`EncryptedData::to_base64`].
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidFormat(format!("bad base64: {}", e)))?;
        if raw.len() < 1 + NONCE_LEN {
            return Err(CryptoError::InvalidFormat(format!(
                "envelope too short: {} bytes",
                raw.len()
            )));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&raw[1..1 + NONCE_LEN]);
        Ok(Self {
            version: raw[0],
            nonce,
            ciphertext: raw[1 + NONCE_LEN..].to_vec(),
        })
    }
}

/// Per-device cipher using AES-256-GCM.
///
/// The key comes out of the pairing key schedule and is stored in the client
/// registry. Implements `Zeroize` + `ZeroizeOnDrop` for automatic key cleanup.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionCipher {
    key: [u8; 32],
}

impl SessionCipher {
    /// Create a cipher from a raw 256-bit key.
    pub fn from_key(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Create a cipher from a key slice, rejecting anything but 32 bytes.
    pub fn from_slice(key: &[u8]) -> Result<Self> {
        let key: [u8; 32] = key
            .try_into()
            .map_err(|_| CryptoError::InvalidFormat(format!("key must be 32 bytes, got {}", key.len())))?;
        Ok(Self { key })
    }

    /// Encrypt plaintext with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedData> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| CryptoError::EncryptionFailed)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(EncryptedData {
            version: ENVELOPE_VERSION,
            nonce: nonce_bytes,
            ciphertext,
        })
    }

    /// Decrypt an encrypted data bundle.
    pub fn decrypt(&self, data: &EncryptedData) -> Result<Vec<u8>> {
        if data.version != ENVELOPE_VERSION {
            return Err(CryptoError::InvalidFormat(format!(
                "unsupported version: {}",
                data.version
            )));
        }

        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| CryptoError::DecryptionFailed)?;
        let nonce = Nonce::from_slice(&data.nonce);

        cipher
            .decrypt(nonce, data.ciphertext.as_ref())
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Generate 32 random bytes from the thread CSPRNG.
pub fn random_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}
