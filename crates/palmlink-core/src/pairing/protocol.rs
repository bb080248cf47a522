//! Pairing wire messages.
//!
//! JSON objects tagged by `type`; binary fields are standard base64.

use serde::{Deserialize, Serialize};

/// Any message exchanged during pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PairingMessage {
    /// Device → workstation: first SPAKE2 message
    PairInit(InitMessage),
    /// Workstation → device: SPAKE2 reply
    PairChallenge(ChallengeMessage),
    /// Device → workstation: device confirmation MAC
    PairConfirm(ConfirmMessage),
    /// Workstation → device: workstation confirmation MAC and identity
    PairComplete(CompleteMessage),
    /// Either direction: failure
    PairError(ErrorMessage),
}

impl PairingMessage {
    /// Wire tag of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PairInit(_) => "pair_init",
            Self::PairChallenge(_) => "pair_challenge",
            Self::PairConfirm(_) => "pair_confirm",
            Self::PairComplete(_) => "pair_complete",
            Self::PairError(_) => "pair_error",
        }
    }
}

/// `pair_init` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitMessage {
    /// Device SPAKE2 message (base64)
    pub spake: String,
    /// Device-chosen identifier
    #[serde(default)]
    pub device_id: Option<String>,
    /// Device display name
    #[serde(default)]
    pub device_name: Option<String>,
}

/// `pair_challenge` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeMessage {
    /// Workstation SPAKE2 message (base64)
    pub spake: String,
    /// Identifier assigned by the workstation when `pair_init` carried none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// `pair_confirm` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmMessage {
    /// Device confirmation MAC (base64)
    pub mac: String,
}

/// `pair_complete` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteMessage {
    /// Workstation confirmation MAC (base64)
    pub mac: String,
    /// Stable workstation identifier
    pub workstation_id: String,
    /// Workstation display name
    pub workstation_name: String,
}

/// `pair_error` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Machine-readable code
    pub code: PairingErrorCode,
    /// Human-readable description
    pub message: String,
}

/// Error codes sent to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairingErrorCode {
    /// No pairing session is active, or it expired
    PairingDisabled,
    /// The message could not be decoded or arrived out of order
    InvalidFormat,
    /// The device MAC did not verify (almost always a mistyped code)
    MacMismatch,
    /// The workstation failed to store the new device
    InternalError,
}
