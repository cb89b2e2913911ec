//! Key derivation functions
//!
//! `hkdf_extract` / `hkdf_expand` / `hkdf` — RFC 5869 via the `hkdf` crate,
//!   over SHA-256 or SHA-512. The 255-block limit surfaces as a typed
//!   `DerivationLength` error.
//!
//! Protocol derivations (all HMAC-SHA256, 32-byte outputs):
//!   SK            = HKDF(salt = 0xFF*32, ikm = DH1 || DH2 || DH3 [|| DH4], info = "sc-x3dh-v1")
//!   KDF_RK(rk,dh) = HKDF(salt = rk, ikm = dh, info = "sc-ratchet-v1") → rk' || ck
//!   KDF_CK(ck)    = (HMAC(ck, 0x02), HMAC(ck, 0x01)) → (ck', mk)
//!
//! Every derivation uses a distinct salt / info / constant so that identical
//! secret input never yields the same key for two purposes.

use std::fmt;

use ::hkdf::Hkdf;
use hmac::{digest::KeyInit, Hmac, Mac};
use sha2::{Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// Fixed X3DH salt. Public, not a secret.
pub const X3DH_SALT: [u8; 32] = [0xFF; 32];
pub const X3DH_INFO: &[u8] = b"sc-x3dh-v1";
pub const RATCHET_INFO: &[u8] = b"sc-ratchet-v1";

const MESSAGE_KEY_CONSTANT: u8 = 0x01;
const CHAIN_KEY_CONSTANT: u8 = 0x02;

// ── Hash selection ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Largest `length` accepted by `hkdf_expand`.
    pub fn max_okm_len(self) -> usize {
        255 * self.output_len()
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            "sha512" | "sha-512" => Ok(HashAlgorithm::Sha512),
            other => Err(CryptoError::Config(format!("unknown hash algorithm '{other}'"))),
        }
    }
}

// ── Key newtypes ──────────────────────────────────────────────────────────────

macro_rules! secret_32 {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Zeroize, ZeroizeOnDrop)]
        pub struct $name([u8; 32]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                constant_time_eq(&self.0, &other.0)
            }
        }

        impl Eq for $name {}

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(concat!(stringify!($name), "(<redacted>)"))
            }
        }
    };
}

secret_32!(
    /// X3DH output. Deliberately not `Clone`: it seeds exactly one ratchet
    /// session and is dropped (zeroized) there.
    SharedSecret
);
secret_32!(
    /// Updated only on a DH ratchet step.
    RootKey
);
secret_32!(
    /// Per-direction chain key; advances once per derived message key.
    ChainKey
);
secret_32!(
    /// Single-use key handed to the cipher boundary.
    MessageKey
);

impl SharedSecret {
    /// Wrap externally agreed key material (tests, vectors, out-of-band setups).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl RootKey {
    pub(crate) fn from_shared_secret(sk: SharedSecret) -> Self {
        Self(sk.0)
    }
}

impl Clone for ChainKey {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl ChainKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl MessageKey {
    pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

// ── HMAC ──────────────────────────────────────────────────────────────────────

fn mac_parts<M: Mac + KeyInit>(key: &[u8], parts: &[&[u8]]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(Zeroizing::new(mac.finalize().into_bytes().as_slice().to_vec()))
}

fn hmac(hash: HashAlgorithm, key: &[u8], parts: &[&[u8]]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    match hash {
        HashAlgorithm::Sha256 => mac_parts::<Hmac<Sha256>>(key, parts),
        HashAlgorithm::Sha512 => mac_parts::<Hmac<Sha512>>(key, parts),
    }
}

fn to_32(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))
}

// ── HKDF (RFC 5869) ───────────────────────────────────────────────────────────

/// PRK = HMAC(salt, ikm). An empty salt is replaced by `HashLen` zero bytes.
pub fn hkdf_extract(
    hash: HashAlgorithm,
    ikm: &[u8],
    salt: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let salt = (!salt.is_empty()).then_some(salt);
    let prk = match hash {
        HashAlgorithm::Sha256 => Hkdf::<Sha256>::extract(salt, ikm).0.to_vec(),
        HashAlgorithm::Sha512 => Hkdf::<Sha512>::extract(salt, ikm).0.to_vec(),
    };
    Ok(Zeroizing::new(prk))
}

/// OKM = T(1) || T(2) || … truncated to `length`.
pub fn hkdf_expand(
    hash: HashAlgorithm,
    prk: &[u8],
    info: &[u8],
    length: usize,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let bad_prk = |_| CryptoError::InvalidKey(format!("PRK must be at least {} bytes", hash.output_len()));
    let mut okm = Zeroizing::new(vec![0u8; length]);
    let expanded = match hash {
        HashAlgorithm::Sha256 => Hkdf::<Sha256>::from_prk(prk).map_err(bad_prk)?.expand(info, okm.as_mut_slice()),
        HashAlgorithm::Sha512 => Hkdf::<Sha512>::from_prk(prk).map_err(bad_prk)?.expand(info, okm.as_mut_slice()),
    };
    expanded.map_err(|_| CryptoError::DerivationLength {
        requested: length,
        max: hash.max_okm_len(),
    })?;
    Ok(okm)
}

/// Extract-then-expand. `None` and `Some(&[])` salts are equivalent.
pub fn hkdf(
    hash: HashAlgorithm,
    ikm: &[u8],
    length: usize,
    info: &[u8],
    salt: Option<&[u8]>,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let prk = hkdf_extract(hash, ikm, salt.unwrap_or(&[]))?;
    hkdf_expand(hash, &prk, info, length)
}

// ── Protocol derivations ──────────────────────────────────────────────────────

/// SK from the ordered DH outputs of an X3DH run. An absent DH4 is passed as
/// an empty slice and contributes nothing to the concatenation.
pub fn derive_x3dh_shared_secret(dh_outputs: &[&[u8]]) -> Result<SharedSecret, CryptoError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(dh_outputs.len() * 32));
    for dh in dh_outputs {
        ikm.extend_from_slice(dh);
    }
    let okm = hkdf(HashAlgorithm::Sha256, &ikm, 32, X3DH_INFO, Some(&X3DH_SALT))?;
    Ok(SharedSecret(to_32(&okm)?))
}

/// KDF_RK: the evolving root key is the salt, the DH output is the IKM.
pub fn derive_root_and_chain_keys(
    root_key: &RootKey,
    dh_output: &[u8],
) -> Result<(RootKey, ChainKey), CryptoError> {
    let okm = hkdf(HashAlgorithm::Sha256, dh_output, 64, RATCHET_INFO, Some(root_key.as_bytes()))?;
    let (rk, ck) = okm.split_at(32);
    Ok((RootKey(to_32(rk)?), ChainKey(to_32(ck)?)))
}

/// KDF_CK: returns (next chain key, message key). One-way in both outputs.
pub fn derive_chain_and_message_keys(
    chain_key: &ChainKey,
) -> Result<(ChainKey, MessageKey), CryptoError> {
    let next = hmac(HashAlgorithm::Sha256, chain_key.as_bytes(), &[&[CHAIN_KEY_CONSTANT][..]])?;
    let mk = hmac(HashAlgorithm::Sha256, chain_key.as_bytes(), &[&[MESSAGE_KEY_CONSTANT][..]])?;
    Ok((ChainKey(to_32(&next)?), MessageKey(to_32(&mk)?)))
}

// ── Comparison ────────────────────────────────────────────────────────────────

/// Compare without an early exit on the first differing byte.
/// Length is not secret: a mismatch returns `false` straight away.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    std::hint::black_box(diff) == 0
}
