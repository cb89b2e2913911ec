//! Conversation: X3DH establishment + Double Ratchet + cipher boundary.
//!
//! ## Establishment
//! The initiator runs `x3dh::initiate` against the recipient's bundle and
//! seeds a ratchet with SK and the recipient's signed prekey. The
//! `HandshakePayload` travels with the first ciphertext; the responder runs
//! `x3dh::respond_with_provider` (consuming the one-time prekey) and seeds
//! its ratchet with SK and its signed prekey pair.
//!
//! ## Messages
//! `seal`: (mk, header) = ratchet.send(); ct = encrypt(mk, pt, ad || header)
//! `open`: ratchet.receive_with(header, |mk| decrypt(mk, ct, ad || header))
//!
//! The ratchet step is committed only after the cipher authenticates the
//! ciphertext, so a forged message cannot move the session. The one exception
//! is a key served from the skipped cache, which is spent on first use.

use tracing::warn;
use zeroize::Zeroizing;

use crate::{
    cipher::CipherBoundary,
    config::RatchetConfig,
    error::CryptoError,
    keys::{KeyPair, PublicKey},
    prekeys::{KeyBundle, KeyBundleProvider},
    ratchet::{new_session_id, Header, RatchetSession},
    x3dh::{self, HandshakePayload},
};

pub struct Conversation {
    session: RatchetSession,
}

impl Conversation {
    /// Start a conversation with the owner of `bundle`.
    ///
    /// Returns the payload that must accompany the first message.
    pub fn initiate(
        own_identity: &KeyPair,
        bundle: &KeyBundle,
        config: &RatchetConfig,
    ) -> Result<(Self, HandshakePayload), CryptoError> {
        let outcome = x3dh::initiate(own_identity, bundle)?;
        let payload = outcome.payload();
        let session = RatchetSession::initiator(
            new_session_id(),
            outcome.shared_secret,
            &outcome.remote_signed_pre_key,
            config,
        )?;
        Ok((Self { session }, payload))
    }

    /// Accept a conversation opened by `sender_identity`.
    pub fn respond<P: KeyBundleProvider + ?Sized>(
        provider: &P,
        sender_identity: &PublicKey,
        payload: &HandshakePayload,
        session_id: impl Into<String>,
        config: &RatchetConfig,
    ) -> Result<Self, CryptoError> {
        let shared_secret = x3dh::respond_with_provider(provider, sender_identity, payload)?;
        let session = RatchetSession::responder(session_id, shared_secret, provider.signed_pre_key(), config)?;
        Ok(Self { session })
    }

    pub fn session(&self) -> &RatchetSession {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        self.session.session_id()
    }

    /// Encrypt the next outgoing message.
    pub fn seal<C: CipherBoundary + ?Sized>(
        &mut self,
        cipher: &C,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<(Header, Vec<u8>), CryptoError> {
        let (mk, header) = self.session.send()?;
        let aad = bind_header(&header, associated_data);
        let ciphertext = cipher.encrypt(&mk, plaintext, &aad)?;
        Ok((header, ciphertext))
    }

    /// Decrypt an incoming message.
    ///
    /// The ratchet advances only when the ciphertext authenticates.
    pub fn open<C: CipherBoundary + ?Sized>(
        &mut self,
        cipher: &C,
        header: &Header,
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let aad = bind_header(header, associated_data);
        let result = self
            .session
            .receive_with(header, |mk| cipher.decrypt(mk, ciphertext, &aad));
        if let Err(CryptoError::AuthenticationFailure) = &result {
            warn!(
                session_id = %self.session.session_id(),
                n = header.message_number,
                "ciphertext failed authentication; plaintext discarded"
            );
        }
        result
    }
}

/// AEAD associated data: caller context followed by the 40-byte header.
pub fn bind_header(header: &Header, associated_data: &[u8]) -> Vec<u8> {
    let header_bytes = header.to_bytes();
    let mut aad = Vec::with_capacity(associated_data.len() + header_bytes.len());
    aad.extend_from_slice(associated_data);
    aad.extend_from_slice(&header_bytes);
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cipher::XChaChaCipher, prekeys::MemoryPrekeyStore};

    #[test]
    fn establish_and_exchange() {
        let config = RatchetConfig::default();
        let alice_ik = KeyPair::generate();
        let bob_store = MemoryPrekeyStore::generate(2);

        let (mut alice, payload) =
            Conversation::initiate(&alice_ik, &bob_store.publish_bundle(), &config).unwrap();
        let mut bob =
            Conversation::respond(&bob_store, &alice_ik.public, &payload, alice.session_id(), &config)
                .unwrap();
        assert_eq!(alice.session_id(), bob.session_id());

        let (h, ct) = alice.seal(&XChaChaCipher, b"hi bob", b"ctx").unwrap();
        assert_eq!(bob.open(&XChaChaCipher, &h, &ct, b"ctx").unwrap().as_slice(), b"hi bob");

        let (h, ct) = bob.seal(&XChaChaCipher, b"hi alice", b"ctx").unwrap();
        assert_eq!(alice.open(&XChaChaCipher, &h, &ct, b"ctx").unwrap().as_slice(), b"hi alice");
    }

    #[test]
    fn header_is_bound_into_associated_data() {
        let header = Header {
            ratchet_public_key: KeyPair::generate().public,
            previous_chain_length: 1,
            message_number: 2,
        };
        let aad = bind_header(&header, b"ctx");
        assert_eq!(&aad[..3], b"ctx");
        assert_eq!(&aad[3..], &header.to_bytes()[..]);
    }
}
