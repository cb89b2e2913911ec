//! Double Ratchet with DH ratchet steps.
//!
//! References:
//!   - Signal Double Ratchet spec: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State separation (non-negotiable):
//!   RK  — root key (updated only when the peer's ratchet key changes)
//!   CKs — sending chain key (updated per message)
//!   CKr — receiving chain key (updated per message)
//!   MK  — message key (derived from CK, used once, then dropped)
//!
//! DH Ratchet:
//!   When a header carries a ratchet key we have not seen, we mix
//!   DH(our ratchet secret, their key) into RK to get a fresh CKr, then
//!   generate a new ratchet keypair and mix DH(new secret, their key) into RK
//!   again to get a fresh CKs. Ratchet keys consumed by a DH step are
//!   remembered (up to `consumed_key_capacity`) and never accepted again.
//!
//! Lifecycle:
//!   A session is `Active` until any `RatchetDesync` error, after which it is
//!   `Broken` for good. A receive is planned against `&self` as a
//!   `ReceiveStep` and applied in one go, so a failed call leaves keys and
//!   counters exactly as they were. `receive_with` applies the step only once
//!   the caller has authenticated the ciphertext.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    config::RatchetConfig,
    error::CryptoError,
    kdf::{self, ChainKey, MessageKey, RootKey, SharedSecret},
    keys::{KeyPair, PublicKey, KEY_LEN},
    skipped::{ConsumedRatchetKeys, SkippedKeyCache},
};

// ── Header (included in every message, unencrypted) ──────────────────────────

pub const HEADER_LEN: usize = KEY_LEN + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Sender's current DH ratchet public key
    pub ratchet_public_key: PublicKey,
    /// Number of messages in the sender's previous sending chain
    pub previous_chain_length: u32,
    /// Message number in the current sending chain
    pub message_number: u32,
}

impl Header {
    /// `ratchet_key(32) || pn (u32 BE) || n (u32 BE)`; also used as AEAD
    /// associated data.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..KEY_LEN].copy_from_slice(self.ratchet_public_key.as_bytes());
        out[KEY_LEN..KEY_LEN + 4].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        out[KEY_LEN + 4..].copy_from_slice(&self.message_number.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != HEADER_LEN {
            return Err(CryptoError::Malformed(format!(
                "ratchet header must be {HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let ratchet_public_key = PublicKey::from_slice(&bytes[..KEY_LEN])?;
        let pn = &bytes[KEY_LEN..KEY_LEN + 4];
        let n = &bytes[KEY_LEN + 4..];
        Ok(Self {
            ratchet_public_key,
            previous_chain_length: u32::from_be_bytes([pn[0], pn[1], pn[2], pn[3]]),
            message_number: u32::from_be_bytes([n[0], n[1], n[2], n[3]]),
        })
    }
}

// ── Session state ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Broken,
}

struct RatchetState {
    root_key: RootKey,

    // ── Sending chain ────────────────────────────────────────────────────
    self_ratchet: KeyPair,
    send_chain: Option<ChainKey>,
    send_n: u32,
    prev_send_n: u32,

    // ── Receiving chain ──────────────────────────────────────────────────
    remote_ratchet: Option<PublicKey>,
    recv_chain: Option<ChainKey>,
    recv_n: u32,

    /// Remote ratchet keys a DH step has already run against.
    consumed_remote: ConsumedRatchetKeys,
    skipped: SkippedKeyCache,
    max_skip: u32,
}

/// New root, sending chain and own ratchet pair from one DH ratchet step.
struct DhStep {
    remote: PublicKey,
    root_key: RootKey,
    self_ratchet: KeyPair,
    send_chain: ChainKey,
}

/// Everything an accepted receive changes.
enum ReceiveStep {
    /// Served from the skipped-key cache; only that entry goes.
    Cached { remote: PublicKey, n: u32 },
    Chain {
        /// Keys walked past, oldest first, to be cached.
        skipped: Vec<(PublicKey, u32, MessageKey)>,
        dh: Option<DhStep>,
        recv_chain: ChainKey,
        recv_n: u32,
    },
}

/// Receiving-chain position while a step is being planned.
struct ChainCursor {
    remote: PublicKey,
    chain: ChainKey,
    n: u32,
}

impl RatchetState {
    fn send(&mut self) -> Result<(MessageKey, Header), CryptoError> {
        let chain = self.send_chain.as_ref().ok_or_else(|| {
            CryptoError::SessionNotInitialised(
                "no sending chain before the first message from the peer".into(),
            )
        })?;
        let n = self.send_n;
        let next_n = n
            .checked_add(1)
            .ok_or_else(|| CryptoError::RatchetDesync("sending chain exhausted".into()))?;
        let (next_ck, mk) = kdf::derive_chain_and_message_keys(chain)?;

        self.send_chain = Some(next_ck);
        self.send_n = next_n;

        Ok((
            mk,
            Header {
                ratchet_public_key: self.self_ratchet.public,
                previous_chain_length: self.prev_send_n,
                message_number: n,
            },
        ))
    }

    fn plan_receive(&self, header: &Header) -> Result<(MessageKey, ReceiveStep), CryptoError> {
        let remote = header.ratchet_public_key;
        let n = header.message_number;

        // Retransmitted or delayed message whose key was cached earlier.
        if let Some(mk) = self.skipped.get(&remote, n) {
            debug!(ratchet = %remote.short_id(), n, "served skipped message key");
            return Ok((MessageKey::from_bytes(*mk.as_bytes()), ReceiveStep::Cached { remote, n }));
        }

        let mut skipped = Vec::new();
        let mut cursor = match (self.remote_ratchet, &self.recv_chain) {
            (Some(current), Some(chain)) => Some(ChainCursor {
                remote: current,
                chain: chain.clone(),
                n: self.recv_n,
            }),
            _ => None,
        };
        let mut dh = None;

        if self.remote_ratchet != Some(remote) {
            if self.consumed_remote.contains(&remote) {
                return Err(CryptoError::RatchetDesync(format!(
                    "ratchet key {} was already consumed by an earlier DH step",
                    remote.short_id()
                )));
            }
            if let Some(current) = cursor.as_mut() {
                self.walk(current, header.previous_chain_length, &mut skipped)?;
            }
            let (step, recv_chain) = self.dh_step(&remote)?;
            cursor = Some(ChainCursor {
                remote,
                chain: recv_chain,
                n: 0,
            });
            dh = Some(step);
        }

        let Some(mut cursor) = cursor else {
            return Err(CryptoError::RatchetDesync("no receiving chain for this ratchet key".into()));
        };
        if n < cursor.n {
            return Err(CryptoError::RatchetDesync(format!(
                "message {n} on chain {} already consumed or evicted (next is {})",
                remote.short_id(),
                cursor.n
            )));
        }

        self.walk(&mut cursor, n, &mut skipped)?;

        let next_n = n
            .checked_add(1)
            .ok_or_else(|| CryptoError::RatchetDesync("receiving chain exhausted".into()))?;
        let (next_ck, mk) = kdf::derive_chain_and_message_keys(&cursor.chain)?;

        Ok((
            mk,
            ReceiveStep::Chain {
                skipped,
                dh,
                recv_chain: next_ck,
                recv_n: next_n,
            },
        ))
    }

    /// Derive message keys from `cursor.n` up to (not including) `until`.
    fn walk(
        &self,
        cursor: &mut ChainCursor,
        until: u32,
        skipped: &mut Vec<(PublicKey, u32, MessageKey)>,
    ) -> Result<(), CryptoError> {
        if until <= cursor.n {
            return Ok(());
        }
        let gap = until - cursor.n;
        if gap > self.max_skip {
            return Err(CryptoError::RatchetDesync(format!(
                "header skips {gap} messages, limit is {}",
                self.max_skip
            )));
        }

        while cursor.n < until {
            let (next_ck, mk) = kdf::derive_chain_and_message_keys(&cursor.chain)?;
            skipped.push((cursor.remote, cursor.n, mk));
            cursor.chain = next_ck;
            cursor.n += 1;
        }
        debug!(ratchet = %cursor.remote.short_id(), skipped = gap, "walked receiving chain");
        Ok(())
    }

    fn dh_step(&self, remote: &PublicKey) -> Result<(DhStep, ChainKey), CryptoError> {
        // Receiving step with our current ratchet secret.
        let dh_recv = self.self_ratchet.diffie_hellman(remote)?;
        let (root_key, recv_chain) = kdf::derive_root_and_chain_keys(&self.root_key, &dh_recv[..])?;

        // Sending step with a fresh ratchet keypair.
        let next_ratchet = KeyPair::generate();
        let dh_send = next_ratchet.diffie_hellman(remote)?;
        let (root_key, send_chain) = kdf::derive_root_and_chain_keys(&root_key, &dh_send[..])?;

        Ok((
            DhStep {
                remote: *remote,
                root_key,
                self_ratchet: next_ratchet,
                send_chain,
            },
            recv_chain,
        ))
    }

    fn apply(&mut self, step: ReceiveStep) {
        let (skipped, dh, recv_chain, recv_n) = match step {
            ReceiveStep::Cached { remote, n } => {
                self.skipped.take(&remote, n);
                return;
            }
            ReceiveStep::Chain {
                skipped,
                dh,
                recv_chain,
                recv_n,
            } => (skipped, dh, recv_chain, recv_n),
        };

        let mut evicted = 0;
        for (remote, n, mk) in skipped {
            evicted += self.skipped.insert(remote, n, mk);
        }
        if evicted > 0 {
            warn!(evicted, capacity = self.skipped.capacity(), "skipped-key cache full; oldest keys evicted");
        }

        if let Some(dh) = dh {
            self.prev_send_n = self.send_n;
            self.send_n = 0;
            self.root_key = dh.root_key;
            self.send_chain = Some(dh.send_chain);
            self.self_ratchet = dh.self_ratchet;
            self.remote_ratchet = Some(dh.remote);
            self.consumed_remote.insert(dh.remote);

            debug!(
                remote = %dh.remote.short_id(),
                local = %self.self_ratchet.public.short_id(),
                previous_chain_length = self.prev_send_n,
                "DH ratchet step"
            );
        }

        self.recv_chain = Some(recv_chain);
        self.recv_n = recv_n;
    }
}

/// Complete Double Ratchet session for one conversation.
///
/// Mutating calls take `&mut self`; share across threads with
/// [`SharedSession`].
pub struct RatchetSession {
    session_id: String,
    state: SessionState,
    ratchet: RatchetState,
}

// ── Construction ─────────────────────────────────────────────────────────────

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl RatchetSession {
    /// Create a session as the INITIATOR.
    ///
    /// The initiator holds SK from X3DH and the recipient's signed prekey,
    /// which serves as the first remote ratchet key. It ratchets first, so the
    /// sending chain exists immediately.
    pub fn initiator(
        session_id: impl Into<String>,
        shared_secret: SharedSecret,
        remote_signed_pre_key: &PublicKey,
        config: &RatchetConfig,
    ) -> Result<Self, CryptoError> {
        config.validate()?;
        let session_id = session_id.into();

        let self_ratchet = KeyPair::generate();
        let dh_output = self_ratchet.diffie_hellman(remote_signed_pre_key)?;
        let root_key = RootKey::from_shared_secret(shared_secret);
        let (root_key, send_chain) = kdf::derive_root_and_chain_keys(&root_key, &dh_output[..])?;

        let mut consumed_remote = ConsumedRatchetKeys::new(config.consumed_key_capacity);
        consumed_remote.insert(*remote_signed_pre_key);

        debug!(session_id = %session_id, remote = %remote_signed_pre_key.short_id(), "ratchet session created (initiator)");

        Ok(Self {
            session_id,
            state: SessionState::Active,
            ratchet: RatchetState {
                root_key,
                self_ratchet,
                send_chain: Some(send_chain),
                send_n: 0,
                prev_send_n: 0,
                remote_ratchet: Some(*remote_signed_pre_key),
                recv_chain: None,
                recv_n: 0,
                consumed_remote,
                skipped: SkippedKeyCache::new(config.skipped_key_capacity),
                max_skip: config.max_skip,
            },
        })
    }

    /// Create a session as the RESPONDER.
    ///
    /// The signed prekey pair is the initial ratchet keypair. No sending chain
    /// exists until the initiator's first message triggers a DH step.
    pub fn responder(
        session_id: impl Into<String>,
        shared_secret: SharedSecret,
        own_signed_pre_key: KeyPair,
        config: &RatchetConfig,
    ) -> Result<Self, CryptoError> {
        config.validate()?;
        let session_id = session_id.into();
        debug!(session_id = %session_id, local = %own_signed_pre_key.public.short_id(), "ratchet session created (responder)");

        Ok(Self {
            session_id,
            state: SessionState::Active,
            ratchet: RatchetState {
                root_key: RootKey::from_shared_secret(shared_secret),
                self_ratchet: own_signed_pre_key,
                send_chain: None,
                send_n: 0,
                prev_send_n: 0,
                remote_ratchet: None,
                recv_chain: None,
                recv_n: 0,
                consumed_remote: ConsumedRatchetKeys::new(config.consumed_key_capacity),
                skipped: SkippedKeyCache::new(config.skipped_key_capacity),
                max_skip: config.max_skip,
            },
        })
    }

    // ── Send / receive ───────────────────────────────────────────────────

    /// Derive the next sending message key and its header.
    pub fn send(&mut self) -> Result<(MessageKey, Header), CryptoError> {
        self.ensure_active()?;
        // `RatchetState::send` only mutates after its last fallible step.
        let result = self.ratchet.send();
        self.observe(result)
    }

    /// Derive the message key for a received header and commit the step.
    pub fn receive(&mut self, header: &Header) -> Result<MessageKey, CryptoError> {
        let (mk, step) = self.plan_receive(header)?;
        self.ratchet.apply(step);
        Ok(mk)
    }

    /// Derive the message key for `header` and hand it to `open`.
    ///
    /// The step is committed only if `open` succeeds, so a forged header
    /// paired with a ciphertext that fails authentication changes nothing.
    /// A key served from the skipped cache is spent either way.
    pub fn receive_with<T>(
        &mut self,
        header: &Header,
        open: impl FnOnce(&MessageKey) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        let (mk, step) = self.plan_receive(header)?;
        let spent = matches!(step, ReceiveStep::Cached { .. });
        let result = open(&mk);
        if result.is_ok() || spent {
            self.ratchet.apply(step);
        }
        result
    }

    fn plan_receive(&mut self, header: &Header) -> Result<(MessageKey, ReceiveStep), CryptoError> {
        self.ensure_active()?;
        let planned = self.ratchet.plan_receive(header);
        self.observe(planned)
    }

    fn ensure_active(&self) -> Result<(), CryptoError> {
        match self.state {
            SessionState::Active => Ok(()),
            SessionState::Broken => Err(CryptoError::SessionBroken),
        }
    }

    fn observe<T>(&mut self, result: Result<T, CryptoError>) -> Result<T, CryptoError> {
        if let Err(CryptoError::RatchetDesync(reason)) = &result {
            warn!(session_id = %self.session_id, %reason, "ratchet desynchronised; session is now broken");
            self.state = SessionState::Broken;
        }
        result
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_broken(&self) -> bool {
        self.state == SessionState::Broken
    }

    /// Our current DH ratchet public key.
    pub fn local_ratchet_public(&self) -> PublicKey {
        self.ratchet.self_ratchet.public
    }

    pub fn remote_ratchet_public(&self) -> Option<PublicKey> {
        self.ratchet.remote_ratchet
    }

    pub fn skipped_key_count(&self) -> usize {
        self.ratchet.skipped.len()
    }

    pub fn has_skipped_key(&self, ratchet_key: &PublicKey, n: u32) -> bool {
        self.ratchet.skipped.contains(ratchet_key, n)
    }

    pub fn consumed_ratchet_key_count(&self) -> usize {
        self.ratchet.consumed_remote.len()
    }
}

// ── Shared handle ────────────────────────────────────────────────────────────

/// One mutex per session. Independent sessions never contend.
#[derive(Clone)]
pub struct SharedSession(Arc<Mutex<RatchetSession>>);

impl SharedSession {
    pub fn new(session: RatchetSession) -> Self {
        Self(Arc::new(Mutex::new(session)))
    }

    pub fn send(&self) -> Result<(MessageKey, Header), CryptoError> {
        self.0.lock().send()
    }

    pub fn receive(&self, header: &Header) -> Result<MessageKey, CryptoError> {
        self.0.lock().receive(header)
    }

    /// `RatchetSession::receive_with` under the session lock, so the key
    /// derivation and the cipher call that consumes it cannot interleave
    /// with another receive.
    pub fn receive_with<T>(
        &self,
        header: &Header,
        open: impl FnOnce(&MessageKey) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        self.0.lock().receive_with(header, open)
    }

    pub fn is_broken(&self) -> bool {
        self.0.lock().is_broken()
    }
}
