//! Cipher boundary
//!
//! The ratchet hands out keys; it never encrypts. `CipherBoundary` is the
//! narrow interface callers use to turn a `MessageKey` into ciphertext, and
//! `XChaChaCipher` is the default implementation.
//!
//! XChaCha20-Poly1305 (192-bit nonce). Key: 32 bytes. Nonce: 24 bytes
//! (random). Tag: 16 bytes.
//!
//! Ciphertext wire format:
//!   [ nonce (24 bytes) | ciphertext + tag ]

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroizing;

use crate::{error::CryptoError, kdf::MessageKey};

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

pub trait CipherBoundary {
    fn encrypt(&self, key: &MessageKey, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Fails with `CryptoError::AuthenticationFailure` on any tag mismatch.
    fn decrypt(
        &self,
        key: &MessageKey,
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct XChaChaCipher;

impl CipherBoundary for XChaChaCipher {
    fn encrypt(&self, key: &MessageKey, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|_| CryptoError::AeadEncrypt)?;

        let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);

        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad: associated_data })
            .map_err(|_| CryptoError::AeadEncrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(
        &self,
        key: &MessageKey,
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::AuthenticationFailure);
        }
        let (nonce_bytes, ct) = ciphertext.split_at(NONCE_LEN);
        let nonce = XNonce::from_slice(nonce_bytes);

        let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|_| CryptoError::AuthenticationFailure)?;

        let plaintext = cipher
            .decrypt(nonce, Payload { msg: ct, aad: associated_data })
            .map_err(|_| CryptoError::AuthenticationFailure)?;

        Ok(Zeroizing::new(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> MessageKey {
        MessageKey::from_bytes([b; 32])
    }

    #[test]
    fn roundtrip_with_associated_data() {
        let ct = XChaChaCipher.encrypt(&key(1), b"hello", b"header").unwrap();
        assert_eq!(ct.len(), NONCE_LEN + 5 + TAG_LEN);
        let pt = XChaChaCipher.decrypt(&key(1), &ct, b"header").unwrap();
        assert_eq!(pt.as_slice(), b"hello");
    }

    #[test]
    fn wrong_key_or_ad_is_authentication_failure() {
        let ct = XChaChaCipher.encrypt(&key(1), b"hello", b"ad").unwrap();
        assert!(matches!(
            XChaChaCipher.decrypt(&key(2), &ct, b"ad"),
            Err(CryptoError::AuthenticationFailure)
        ));
        assert!(matches!(
            XChaChaCipher.decrypt(&key(1), &ct, b"other"),
            Err(CryptoError::AuthenticationFailure)
        ));

        let mut tampered = ct.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(matches!(
            XChaChaCipher.decrypt(&key(1), &tampered, b"ad"),
            Err(CryptoError::AuthenticationFailure)
        ));
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert!(matches!(
            XChaChaCipher.decrypt(&key(1), &[0u8; 10], b""),
            Err(CryptoError::AuthenticationFailure)
        ));
    }
}
