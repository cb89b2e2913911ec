//! X3DH-style asynchronous key agreement.
//!
//! References:
//!   - Signal X3DH spec: <https://signal.org/docs/specifications/x3dh/>
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!
//! Protocol:
//!   The initiator fetches the recipient's `KeyBundle`:
//!     IK_B  (identity, X25519)
//!     SPK_B (signed prekey, X25519)
//!     OPK_B (optional one-time prekey, X25519) + its id
//!
//!   The initiator generates ONE ephemeral keypair EK_A.
//!
//!   DH calculations, always in this order:
//!     DH1 = DH(IK_A, SPK_B)
//!     DH2 = DH(EK_A, IK_B)
//!     DH3 = DH(EK_A, SPK_B)
//!     DH4 = DH(EK_A, OPK_B)   [empty when the bundle has no OPK]
//!
//!   SK = kdf::derive_x3dh_shared_secret(DH1 || DH2 || DH3 || DH4)
//!
//! Only (EK_A_pub, opk_id?) is transmitted. SK seeds exactly one ratchet
//! session. If the payload names an OPK the responder can no longer produce,
//! the handshake fails; it never falls back to a DH4-less derivation.

use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    error::CryptoError,
    kdf::{self, SharedSecret},
    keys::{KeyPair, PublicKey, SecretKey, KEY_LEN},
    prekeys::{KeyBundle, KeyBundleProvider, PreKeyId},
};

// ── Wire payload ─────────────────────────────────────────────────────────────

/// Sent alongside the first ciphertext so the responder can derive SK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub ephemeral_public_key: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_one_time_pre_key_id: Option<PreKeyId>,
}

impl HandshakePayload {
    /// `ephemeral(32) || flag(1) [|| opk_id (u32 BE)]`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(KEY_LEN + 5);
        out.extend_from_slice(self.ephemeral_public_key.as_bytes());
        match self.used_one_time_pre_key_id {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(&id.to_be_bytes());
            }
            None => out.push(0),
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < KEY_LEN + 1 {
            return Err(CryptoError::Malformed(format!(
                "handshake payload too short ({} bytes)",
                bytes.len()
            )));
        }
        let ephemeral_public_key = PublicKey::from_slice(&bytes[..KEY_LEN])?;
        let used_one_time_pre_key_id = match (bytes[KEY_LEN], &bytes[KEY_LEN + 1..]) {
            (0, []) => None,
            (1, id) if id.len() == 4 => Some(u32::from_be_bytes([id[0], id[1], id[2], id[3]])),
            (flag, rest) => {
                return Err(CryptoError::Malformed(format!(
                    "handshake payload flag {flag} with {} trailing bytes",
                    rest.len()
                )))
            }
        };
        Ok(Self {
            ephemeral_public_key,
            used_one_time_pre_key_id,
        })
    }
}

// ── Output ───────────────────────────────────────────────────────────────────

/// Initiator's result. `shared_secret` stays in-process; `payload()` is what
/// goes on the wire.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub shared_secret: SharedSecret,
    pub ephemeral_public_key: PublicKey,
    pub used_one_time_pre_key: bool,
    pub one_time_pre_key_id: Option<PreKeyId>,
    /// Recipient's signed prekey; the initiator's first ratchet step runs
    /// against it.
    pub remote_signed_pre_key: PublicKey,
}

impl HandshakeOutcome {
    pub fn payload(&self) -> HandshakePayload {
        HandshakePayload {
            ephemeral_public_key: self.ephemeral_public_key,
            used_one_time_pre_key_id: self.one_time_pre_key_id,
        }
    }
}

fn dh(secret: &SecretKey, peer: &PublicKey, label: &str) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    secret
        .diffie_hellman(peer)
        .map_err(|e| CryptoError::HandshakeFailure(format!("{label}: {e}")))
}

// ── Initiator ────────────────────────────────────────────────────────────────

/// Run X3DH against a recipient's published bundle.
pub fn initiate(own_identity: &KeyPair, bundle: &KeyBundle) -> Result<HandshakeOutcome, CryptoError> {
    initiate_with_ephemeral(own_identity, KeyPair::generate(), bundle)
}

fn initiate_with_ephemeral(
    own_identity: &KeyPair,
    ephemeral: KeyPair,
    bundle: &KeyBundle,
) -> Result<HandshakeOutcome, CryptoError> {
    bundle.validate()?;

    let dh1 = dh(own_identity.secret(), &bundle.signed_pre_key, "DH1")?;
    let dh2 = dh(ephemeral.secret(), &bundle.identity_key, "DH2")?;
    let dh3 = dh(ephemeral.secret(), &bundle.signed_pre_key, "DH3")?;
    let dh4 = match &bundle.one_time_pre_key {
        Some(opk) => Some(dh(ephemeral.secret(), opk, "DH4")?),
        None => None,
    };
    let dh4_bytes: &[u8] = dh4.as_ref().map(|d| d.as_slice()).unwrap_or(&[]);

    let shared_secret = kdf::derive_x3dh_shared_secret(&[&dh1[..], &dh2[..], &dh3[..], dh4_bytes])?;

    debug!(
        recipient = %bundle.identity_key.short_id(),
        ephemeral = %ephemeral.public.short_id(),
        opk_id = ?bundle.one_time_pre_key_id,
        "x3dh initiated"
    );

    Ok(HandshakeOutcome {
        shared_secret,
        ephemeral_public_key: ephemeral.public,
        used_one_time_pre_key: dh4.is_some(),
        one_time_pre_key_id: bundle.one_time_pre_key_id,
        remote_signed_pre_key: bundle.signed_pre_key,
    })
}

// ── Responder ────────────────────────────────────────────────────────────────

/// Recompute SK from the initiator's payload with mirrored operands.
///
/// `one_time_secret` must be present exactly when the payload names a
/// one-time prekey.
pub fn respond(
    own_identity: &KeyPair,
    own_signed_pre_key: &KeyPair,
    sender_identity: &PublicKey,
    payload: &HandshakePayload,
    one_time_secret: Option<&SecretKey>,
) -> Result<SharedSecret, CryptoError> {
    match (payload.used_one_time_pre_key_id, one_time_secret) {
        (Some(id), None) => {
            return Err(CryptoError::HandshakeFailure(format!(
                "one-time prekey {id} required but unavailable"
            )))
        }
        (None, Some(_)) => {
            return Err(CryptoError::HandshakeFailure(
                "one-time prekey supplied but payload used none".into(),
            ))
        }
        _ => {}
    }

    let ek = &payload.ephemeral_public_key;

    // Mirror the initiator's order exactly:
    //   DH1 = IK_A × SPK_B  →  SPK_B × IK_A
    //   DH2 = EK_A × IK_B   →  IK_B × EK_A
    //   DH3 = EK_A × SPK_B  →  SPK_B × EK_A
    //   DH4 = EK_A × OPK_B  →  OPK_B × EK_A
    let dh1 = dh(own_signed_pre_key.secret(), sender_identity, "DH1")?;
    let dh2 = dh(own_identity.secret(), ek, "DH2")?;
    let dh3 = dh(own_signed_pre_key.secret(), ek, "DH3")?;
    let dh4 = match one_time_secret {
        Some(opk) => Some(dh(opk, ek, "DH4")?),
        None => None,
    };
    let dh4_bytes: &[u8] = dh4.as_ref().map(|d| d.as_slice()).unwrap_or(&[]);

    let shared_secret = kdf::derive_x3dh_shared_secret(&[&dh1[..], &dh2[..], &dh3[..], dh4_bytes])?;

    debug!(
        sender = %sender_identity.short_id(),
        ephemeral = %ek.short_id(),
        opk_id = ?payload.used_one_time_pre_key_id,
        "x3dh responded"
    );

    Ok(shared_secret)
}

/// Responder path backed by the key-bundle collaborator.
///
/// Both peer keys must pass the DH checks before the named one-time prekey
/// is consumed, so a malformed handshake cannot burn one.
pub fn respond_with_provider<P: KeyBundleProvider + ?Sized>(
    provider: &P,
    sender_identity: &PublicKey,
    payload: &HandshakePayload,
) -> Result<SharedSecret, CryptoError> {
    let identity = provider.identity_key_pair();
    let signed_pre_key = provider.signed_pre_key();
    dh(signed_pre_key.secret(), sender_identity, "DH1")?;
    dh(signed_pre_key.secret(), &payload.ephemeral_public_key, "DH3")?;

    let one_time_secret = match payload.used_one_time_pre_key_id {
        Some(id) => Some(provider.consume_one_time_pre_key(id).ok_or_else(|| {
            CryptoError::HandshakeFailure(format!(
                "one-time prekey {id} already consumed or unknown"
            ))
        })?),
        None => None,
    };

    respond(
        &identity,
        &signed_pre_key,
        sender_identity,
        payload,
        one_time_secret.as_ref(),
    )
}
