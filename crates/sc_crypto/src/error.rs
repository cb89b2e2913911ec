use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("Requested {requested} bytes of key material, maximum is {max}")]
    DerivationLength { requested: usize, max: usize },

    #[error("Ratchet desynchronised: {0}")]
    RatchetDesync(String),

    #[error("Session is broken; a fresh handshake is required")]
    SessionBroken,

    #[error("Session not initialised: {0}")]
    SessionNotInitialised(String),

    #[error("AEAD authentication failed (tag mismatch — possible tampering)")]
    AuthenticationFailure,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Malformed wire data: {0}")]
    Malformed(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CryptoError {
    /// Errors after which the session can never be used again.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, CryptoError::RatchetDesync(_) | CryptoError::SessionBroken)
    }
}
