//! SPAKE2 pairing handshake and key schedule.
//!
//! The device plays side A and the workstation side B. Both use the pairing
//! code shown on the workstation as the SPAKE2 password. Once the exchange
//! completes, both sides run the same HKDF key schedule, salted with the hash
//! of the handshake transcript:
//!
//! ```text
//! transcript = "palmlink-pair-v1" || len(device_id) || device_id
//!              || device_msg || workstation_msg
//! th         = SHA-256(transcript)
//! HKDF-SHA256(salt = th, ikm = spake2_key)
//!   "palmlink/confirm/device"      -> device confirmation key
//!   "palmlink/confirm/workstation" -> workstation confirmation key
//!   "palmlink/auth-token"          -> auth token bytes
//!   "palmlink/encryption-key"      -> channel key
//! ```
//!
//! Confirmation MACs are `HMAC-SHA256(confirm_key, th)`.

use crate::token::constant_time_eq;
use crate::{CryptoError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use spake2::{Ed25519Group, Identity, Password, Spake2};
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

const DEVICE_IDENTITY: &[u8] = b"palmlink-device";
const WORKSTATION_IDENTITY: &[u8] = b"palmlink-workstation";
const TRANSCRIPT_LABEL: &[u8] = b"palmlink-pair-v1";

const INFO_CONFIRM_DEVICE: &[u8] = b"palmlink/confirm/device";
const INFO_CONFIRM_WORKSTATION: &[u8] = b"palmlink/confirm/workstation";
const INFO_AUTH_TOKEN: &[u8] = b"palmlink/auth-token";
const INFO_ENCRYPTION_KEY: &[u8] = b"palmlink/encryption-key";

/// Canonical password form of a pairing code.
///
/// Uppercases and drops everything that is not alphanumeric, so
/// `abcd-efgh`, `ABCD EFGH` and `ABCDEFGH` are the same password.
pub fn normalize_code(code: &str) -> String {
    code.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Workstation side of a completed SPAKE2 exchange.
pub struct HandshakeResponse {
    /// SPAKE2 message to send back to the device
    pub message: Vec<u8>,
    /// Keys derived from the exchange
    pub keys: PairingKeys,
}

/// Run the workstation (side B) half of SPAKE2 against a device message.
///
/// SPAKE2 lets side B finish as soon as it has the peer message, so the
/// shared secret is available before the challenge goes out.
pub fn respond(code: &str, device_id: &str, device_msg: &[u8]) -> Result<HandshakeResponse> {
    let password = normalize_code(code);
    let (state, message) = Spake2::<Ed25519Group>::start_b(
        &Password::new(password.as_bytes()),
        &Identity::new(DEVICE_IDENTITY),
        &Identity::new(WORKSTATION_IDENTITY),
    );
    let mut shared = state
        .finish(device_msg)
        .map_err(|_| CryptoError::HandshakeFailed)?;
    let keys = PairingKeys::derive(&shared, device_id, device_msg, &message);
    shared.zeroize();
    Ok(HandshakeResponse { message, keys })
}

/// Device side (A) of the pairing handshake.
pub struct PairingClient {
    state: Spake2<Ed25519Group>,
    device_id: String,
    message: Vec<u8>,
}

impl PairingClient {
    /// Start a handshake. Returns the client and the message for `pair_init`.
    pub fn start(code: &str, device_id: &str) -> (Self, Vec<u8>) {
        let password = normalize_code(code);
        let (state, message) = Spake2::<Ed25519Group>::start_a(
            &Password::new(password.as_bytes()),
            &Identity::new(DEVICE_IDENTITY),
            &Identity::new(WORKSTATION_IDENTITY),
        );
        let client = Self {
            state,
            device_id: device_id.to_string(),
            message: message.clone(),
        };
        (client, message)
    }

    /// Adopt the identifier the workstation assigned in its challenge.
    pub fn set_device_id(&mut self, device_id: &str) {
        self.device_id = device_id.to_string();
    }

    /// Consume the workstation's challenge and derive the pairing keys.
    pub fn finish(self, workstation_msg: &[u8]) -> Result<PairingKeys> {
        let mut shared = self
            .state
            .finish(workstation_msg)
            .map_err(|_| CryptoError::HandshakeFailed)?;
        let keys = PairingKeys::derive(&shared, &self.device_id, &self.message, workstation_msg);
        shared.zeroize();
        Ok(keys)
    }
}

/// Key material produced by a completed handshake.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PairingKeys {
    transcript_hash: [u8; 32],
    confirm_device: [u8; 32],
    confirm_workstation: [u8; 32],
    auth_token: [u8; 32],
    encryption_key: [u8; 32],
}

impl PairingKeys {
    /// Run the key schedule over a SPAKE2 shared secret and its transcript.
    pub fn derive(shared: &[u8], device_id: &str, device_msg: &[u8], workstation_msg: &[u8]) -> Self {
        let transcript_hash = transcript_hash(device_id, device_msg, workstation_msg);
        let hkdf = Hkdf::<Sha256>::new(Some(&transcript_hash), shared);

        let expand = |info: &[u8]| {
            let mut okm = [0u8; 32];
            hkdf.expand(info, &mut okm)
                .expect("HKDF expand should never fail with 32-byte output");
            okm
        };

        Self {
            transcript_hash,
            confirm_device: expand(INFO_CONFIRM_DEVICE),
            confirm_workstation: expand(INFO_CONFIRM_WORKSTATION),
            auth_token: expand(INFO_AUTH_TOKEN),
            encryption_key: expand(INFO_ENCRYPTION_KEY),
        }
    }

    /// MAC the device sends in `pair_confirm`.
    pub fn device_mac(&self) -> [u8; 32] {
        mac(&self.confirm_device, &self.transcript_hash)
    }

    /// MAC the workstation sends in `pair_complete`.
    pub fn workstation_mac(&self) -> [u8; 32] {
        mac(&self.confirm_workstation, &self.transcript_hash)
    }

    /// Check a device MAC in constant time.
    pub fn verify_device_mac(&self, candidate: &[u8]) -> Result<()> {
        if constant_time_eq(&self.device_mac(), candidate) {
            Ok(())
        } else {
            Err(CryptoError::MacMismatch)
        }
    }

    /// Check a workstation MAC in constant time.
    pub fn verify_workstation_mac(&self, candidate: &[u8]) -> Result<()> {
        if constant_time_eq(&self.workstation_mac(), candidate) {
            Ok(())
        } else {
            Err(CryptoError::MacMismatch)
        }
    }

    /// Bearer token the device presents when it connects.
    pub fn auth_token(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.auth_token)
    }

    /// Symmetric key for the encrypted channel.
    pub fn encryption_key(&self) -> [u8; 32] {
        self.encryption_key
    }
}

impl std::fmt::Debug for PairingKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingKeys").finish_non_exhaustive()
    }
}

fn transcript_hash(device_id: &str, device_msg: &[u8], workstation_msg: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(TRANSCRIPT_LABEL);
    hasher.update((device_id.len() as u32).to_be_bytes());
    hasher.update(device_id.as_bytes());
    hasher.update((device_msg.len() as u32).to_be_bytes());
    hasher.update(device_msg);
    hasher.update((workstation_msg.len() as u32).to_be_bytes());
    hasher.update(workstation_msg);
    hasher.finalize().into()
}

fn mac(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(device_code: &str, workstation_code: &str) -> (PairingKeys, PairingKeys) {
        let (client, init) = PairingClient::start(device_code, "phone-1");
        let response = respond(workstation_code, "phone-1", &init).unwrap();
        let device_keys = client.finish(&response.message).unwrap();
        (device_keys, response.keys)
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code("abcd-efgh"), "ABCDEFGH");
        assert_eq!(normalize_code(" ABCD EFGH "), "ABCDEFGH");
    }

    #[test]
    fn test_matching_codes_agree() {
        let (device, workstation) = pair("ABCD-EFGH", "abcdefgh");

        assert!(workstation.verify_device_mac(&device.device_mac()).is_ok());
        assert!(device
            .verify_workstation_mac(&workstation.workstation_mac())
            .is_ok());
        assert_eq!(device.auth_token(), workstation.auth_token());
        assert_eq!(device.encryption_key(), workstation.encryption_key());
    }

    #[test]
    fn test_wrong_code_mismatches() {
        let (device, workstation) = pair("ABCD-EFGH", "ZZZZ-ZZZZ");

        assert_eq!(
            workstation.verify_device_mac(&device.device_mac()),
            Err(CryptoError::MacMismatch)
        );
        assert_ne!(device.auth_token(), workstation.auth_token());
    }

    #[test]
    fn test_keys_are_domain_separated() {
        let (device, _) = pair("ABCD-EFGH", "ABCD-EFGH");
        assert_ne!(device.device_mac(), device.workstation_mac());
        assert_ne!(device.encryption_key(), device.device_mac());
    }

    #[test]
    fn test_device_id_bound_into_transcript() {
        let (client, init) = PairingClient::start("ABCD-EFGH", "phone-1");
        let response = respond("ABCD-EFGH", "someone-else", &init).unwrap();
        let device = client.finish(&response.message).unwrap();

        assert!(response.keys.verify_device_mac(&device.device_mac()).is_err());
    }

    #[test]
    fn test_garbage_message_rejected() {
        let result = respond("ABCD-EFGH", "phone-1", b"not a spake2 message");
        assert!(matches!(result, Err(CryptoError::HandshakeFailed)));
    }

    #[test]
    fn test_auth_token_is_url_safe() {
        let (device, _) = pair("ABCD-EFGH", "ABCD-EFGH");
        let token = device.auth_token();
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
