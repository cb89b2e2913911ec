//! Encrypted message envelope — what a relay sees.
//!
//! Visible fields:
//!   - envelope_id  (random UUID, used for ack/dedup only)
//!   - version
//!   - session_id   (routing to the right ratchet)
//!   - sent_at
//!   - header       (ratchet public key + counters, 40 bytes, base64)
//!   - ciphertext   (nonce || ct+tag over padded plaintext, base64)
//!   - init         (only on the session-opening message)
//!
//! Plaintext length is hidden up to the padding bucket.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sc_crypto::{CipherBoundary, Conversation, Header, HandshakePayload, PublicKey};

use crate::{
    codec::{pad_to_bucket, unpad, PaddingMode},
    error::ProtoError,
};

pub const ENVELOPE_VERSION: u8 = 1;

/// Handshake material carried by the first envelope of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitData {
    /// Initiator's identity key; the responder needs it for DH1/DH3.
    pub sender_identity: PublicKey,
    /// `HandshakePayload::to_bytes`, base64-encoded.
    pub handshake: String,
}

impl InitData {
    pub fn new(sender_identity: PublicKey, payload: &HandshakePayload) -> Self {
        Self {
            sender_identity,
            handshake: B64.encode(payload.to_bytes()),
        }
    }

    pub fn payload(&self) -> Result<HandshakePayload, ProtoError> {
        let bytes = B64.decode(&self.handshake)?;
        Ok(HandshakePayload::from_bytes(&bytes)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub envelope_id: String,
    pub version: u8,
    pub session_id: String,
    pub sent_at: DateTime<Utc>,
    pub header: String,
    pub ciphertext: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<InitData>,
}

impl Envelope {
    /// Pad, encrypt and wrap the next outgoing message of `conversation`.
    pub fn seal<C: CipherBoundary + ?Sized>(
        conversation: &mut Conversation,
        cipher: &C,
        plaintext: &[u8],
        padding: PaddingMode,
        init: Option<InitData>,
    ) -> Result<Self, ProtoError> {
        let session_id = conversation.session_id().to_string();
        let padded = pad_to_bucket(plaintext, padding)?;
        let ad = associated_data(ENVELOPE_VERSION, &session_id);
        let (header, ciphertext) = conversation.seal(cipher, &padded, &ad)?;

        Ok(Self {
            envelope_id: uuid::Uuid::new_v4().to_string(),
            version: ENVELOPE_VERSION,
            session_id,
            sent_at: Utc::now(),
            header: B64.encode(header.to_bytes()),
            ciphertext: B64.encode(ciphertext),
            init,
        })
    }

    /// Decrypt into `conversation` and strip padding.
    ///
    /// Version and session are checked before the ratchet is touched.
    pub fn open<C: CipherBoundary + ?Sized>(
        &self,
        conversation: &mut Conversation,
        cipher: &C,
    ) -> Result<Vec<u8>, ProtoError> {
        self.check_version()?;
        if self.session_id != conversation.session_id() {
            return Err(ProtoError::SessionMismatch {
                found: self.session_id.clone(),
                expected: conversation.session_id().to_string(),
            });
        }
        let header = self.decode_header()?;
        let ciphertext = self.decode_ciphertext()?;
        let ad = associated_data(self.version, &self.session_id);
        let padded = conversation.open(cipher, &header, &ciphertext, &ad)?;
        unpad(&padded)
    }

    pub fn decode_header(&self) -> Result<Header, ProtoError> {
        let bytes = B64.decode(&self.header)?;
        Ok(Header::from_bytes(&bytes)?)
    }

    pub fn decode_ciphertext(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(B64.decode(&self.ciphertext)?)
    }

    pub fn is_session_init(&self) -> bool {
        self.init.is_some()
    }

    pub fn check_version(&self) -> Result<(), ProtoError> {
        if self.version != ENVELOPE_VERSION {
            return Err(ProtoError::UnsupportedVersion {
                found: self.version,
                expected: ENVELOPE_VERSION,
            });
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ProtoError> {
        let envelope: Self = serde_json::from_str(json)?;
        envelope.check_version()?;
        Ok(envelope)
    }
}

fn associated_data(version: u8, session_id: &str) -> Vec<u8> {
    let mut ad = Vec::with_capacity(1 + session_id.len());
    ad.push(version);
    ad.extend_from_slice(session_id.as_bytes());
    ad
}

#[cfg(test)]
mod tests {
    use super::*;
    use sc_crypto::{KeyPair, MemoryPrekeyStore, RatchetConfig, XChaChaCipher};

    fn pair() -> (Conversation, Conversation, InitData) {
        let config = RatchetConfig::default();
        let alice_ik = KeyPair::generate();
        let bob_store = MemoryPrekeyStore::generate(1);
        let (alice, payload) = Conversation::initiate(&alice_ik, &bob_store.publish_bundle(), &config).unwrap();
        let init = InitData::new(alice_ik.public, &payload);
        let bob = Conversation::respond(
            &bob_store,
            &init.sender_identity,
            &init.payload().unwrap(),
            alice.session_id(),
            &config,
        )
        .unwrap();
        (alice, bob, init)
    }

    #[test]
    fn seal_and_open() {
        let (mut alice, mut bob, init) = pair();
        let env = Envelope::seal(&mut alice, &XChaChaCipher, b"hello", PaddingMode::Buckets, Some(init)).unwrap();
        assert!(env.is_session_init());
        assert_eq!(env.decode_header().unwrap().message_number, 0);
        // nonce + 256-byte bucket + tag
        assert_eq!(env.decode_ciphertext().unwrap().len(), 24 + 256 + 16);
        assert_eq!(env.open(&mut bob, &XChaChaCipher).unwrap(), b"hello");
    }

    #[test]
    fn json_roundtrip_omits_absent_init() {
        let (mut alice, mut bob, _) = pair();
        let env = Envelope::seal(&mut alice, &XChaChaCipher, b"json", PaddingMode::None, None).unwrap();
        let json = env.to_json().unwrap();
        assert!(!json.contains("\"init\""));
        let parsed = Envelope::from_json(&json).unwrap();
        assert_eq!(parsed.envelope_id, env.envelope_id);
        assert_eq!(parsed.open(&mut bob, &XChaChaCipher).unwrap(), b"json");
    }

    #[test]
    fn unknown_version_is_rejected_before_decrypt() {
        let (mut alice, mut bob, _) = pair();
        let mut env = Envelope::seal(&mut alice, &XChaChaCipher, b"v", PaddingMode::None, None).unwrap();
        env.version = 9;
        assert!(matches!(
            env.open(&mut bob, &XChaChaCipher),
            Err(ProtoError::UnsupportedVersion { found: 9, .. })
        ));
        assert!(matches!(
            Envelope::from_json(&env.to_json().unwrap()),
            Err(ProtoError::UnsupportedVersion { .. })
        ));
        assert_eq!(bob.session().skipped_key_count(), 0);
    }

    #[test]
    fn wrong_session_is_rejected() {
        let (mut alice, mut bob, _) = pair();
        let mut env = Envelope::seal(&mut alice, &XChaChaCipher, b"s", PaddingMode::None, None).unwrap();
        env.session_id = "elsewhere".into();
        assert!(matches!(
            env.open(&mut bob, &XChaChaCipher),
            Err(ProtoError::SessionMismatch { .. })
        ));
        assert!(!bob.session().is_broken());
    }

    #[test]
    fn malformed_header_is_crypto_error() {
        let (mut alice, mut bob, _) = pair();
        let mut env = Envelope::seal(&mut alice, &XChaChaCipher, b"h", PaddingMode::None, None).unwrap();
        env.header = B64.encode([0u8; 12]);
        let err = env.open(&mut bob, &XChaChaCipher).unwrap_err();
        assert!(matches!(err, ProtoError::Crypto(_)));
        assert!(!err.is_fatal_to_session());
    }
}
