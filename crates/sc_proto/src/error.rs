use thiserror::Error;

use sc_crypto::CryptoError;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Invalid padding: {0}")]
    InvalidPadding(String),

    #[error("Unsupported envelope version {found} (expected {expected})")]
    UnsupportedVersion { found: u8, expected: u8 },

    #[error("Envelope belongs to session {found}, expected {expected}")]
    SessionMismatch { found: String, expected: String },

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl ProtoError {
    /// True when the underlying ratchet can no longer be used.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, ProtoError::Crypto(e) if e.is_fatal_to_session())
    }
}
