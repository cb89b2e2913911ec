//! X25519 key material
//!
//! `PublicKey` — 32-byte Montgomery point, base64url on the wire.
//! `SecretKey` — 32-byte scalar, zeroized on drop, never serialised.
//! `KeyPair`   — used for identity keys, signed prekeys, one-time prekeys,
//!   handshake ephemerals and ratchet keys alike.
//!
//! Every DH result is checked for contributory behaviour: an all-zero output
//! means the peer supplied a low-order point and the exchange is refused.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;

// ── Public key ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    /// Validate and wrap raw bytes. Rejects empty, wrong-length and all-zero
    /// input before the key can reach any DH computation.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.is_empty() {
            return Err(CryptoError::InvalidKey("public key is empty".into()));
        }
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "public key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Self::from_bytes(arr)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Result<Self, CryptoError> {
        if bytes.iter().all(|b| *b == 0) {
            return Err(CryptoError::InvalidKey("public key is all zeros".into()));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD.decode(s)?;
        Self::from_slice(&bytes)
    }

    /// Short BLAKE3 fingerprint (8 bytes, hex) for logs and display.
    /// Safe to print; never use it for verification.
    pub fn short_id(&self) -> String {
        let hash = blake3::hash(&self.0);
        hex::encode(&hash.as_bytes()[..8])
    }

    fn as_x25519(&self) -> X25519Public {
        X25519Public::from(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short_id())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_b64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_b64(&s).map_err(serde::de::Error::custom)
    }
}

// ── Secret key ────────────────────────────────────────────────────────────────

#[derive(Clone, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.is_empty() {
            return Err(CryptoError::InvalidKey("secret key is empty".into()));
        }
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "secret key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn public_key(&self) -> Result<PublicKey, CryptoError> {
        let public = X25519Public::from(&self.as_static());
        PublicKey::from_bytes(public.to_bytes())
    }

    fn as_static(&self) -> StaticSecret {
        StaticSecret::from(self.0)
    }

    /// X25519(self, peer). Fails on a non-contributory (all-zero) result.
    pub fn diffie_hellman(&self, peer: &PublicKey) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let shared = self.as_static().diffie_hellman(&peer.as_x25519());
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey(format!(
                "non-contributory DH with peer key {}",
                peer.short_id()
            )));
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

// ── Key pair ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct KeyPair {
    pub public: PublicKey,
    secret: SecretKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        // Clamped scalars never map to the all-zero encoding; the loop only
        // satisfies PublicKey's check without a panic path.
        loop {
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = X25519Public::from(&secret);
            if let Ok(public) = PublicKey::from_bytes(public.to_bytes()) {
                return Self {
                    public,
                    secret: SecretKey(secret.to_bytes()),
                };
            }
        }
    }

    pub fn from_secret(secret: SecretKey) -> Result<Self, CryptoError> {
        let public = secret.public_key()?;
        Ok(Self { public, secret })
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn diffie_hellman(&self, peer: &PublicKey) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        self.secret.diffie_hellman(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_is_symmetric() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let ab = a.diffie_hellman(&b.public).unwrap();
        let ba = b.diffie_hellman(&a.public).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn rejects_malformed_public_keys() {
        assert!(matches!(PublicKey::from_slice(&[]), Err(CryptoError::InvalidKey(_))));
        assert!(matches!(PublicKey::from_slice(&[1u8; 31]), Err(CryptoError::InvalidKey(_))));
        assert!(matches!(PublicKey::from_slice(&[1u8; 33]), Err(CryptoError::InvalidKey(_))));
        assert!(matches!(PublicKey::from_slice(&[0u8; 32]), Err(CryptoError::InvalidKey(_))));
        assert!(PublicKey::from_slice(&[9u8; 32]).is_ok());
    }

    #[test]
    fn rejects_low_order_peer() {
        // u = 1 is a point of small order on Curve25519.
        let mut low = [0u8; 32];
        low[0] = 1;
        let peer = PublicKey::from_bytes(low).unwrap();
        let ours = KeyPair::generate();
        assert!(matches!(ours.diffie_hellman(&peer), Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn secret_roundtrip_reproduces_public() {
        let kp = KeyPair::generate();
        let again = KeyPair::from_secret(kp.secret().clone()).unwrap();
        assert_eq!(kp.public, again.public);
    }

    #[test]
    fn public_key_b64_and_serde() {
        let kp = KeyPair::generate();
        let b64 = kp.public.to_b64();
        assert_eq!(PublicKey::from_b64(&b64).unwrap(), kp.public);

        let json = serde_json::to_string(&kp.public).unwrap();
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kp.public);

        assert!(serde_json::from_str::<PublicKey>("\"AAAA\"").is_err());
    }

    #[test]
    fn secret_debug_is_redacted() {
        let kp = KeyPair::generate();
        let shown = format!("{kp:?}");
        assert!(shown.contains("<redacted>"));
    }
}
