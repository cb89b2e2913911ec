//! Key bundles and the key-bundle collaborator
//!
//! A `KeyBundle` is what an initiator fetches for a recipient: identity key,
//! signed prekey, and at most one one-time prekey with its identifier.
//!
//! `KeyBundleProvider` is the narrow capability the responder side of the
//! handshake needs from long-term key storage. The only hard guarantee it
//! must give: `consume_one_time_pre_key` returns a given key to at most one
//! caller, ever.
//!
//! `MemoryPrekeyStore` is an in-process provider (tests, demos, single-process
//! deployments). Durable storage is left to the embedding application.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::CryptoError,
    keys::{KeyPair, PublicKey, SecretKey},
};

pub type PreKeyId = u32;

// ── Bundle ───────────────────────────────────────────────────────────────────

/// Published by the recipient, consumed by session initiators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    pub identity_key: PublicKey,
    pub signed_pre_key: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key: Option<PublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key_id: Option<PreKeyId>,
}

impl KeyBundle {
    pub fn new(
        identity_key: PublicKey,
        signed_pre_key: PublicKey,
        one_time_pre_key: Option<(PreKeyId, PublicKey)>,
    ) -> Self {
        let (one_time_pre_key_id, one_time_pre_key) = match one_time_pre_key {
            Some((id, key)) => (Some(id), Some(key)),
            None => (None, None),
        };
        Self {
            identity_key,
            signed_pre_key,
            one_time_pre_key,
            one_time_pre_key_id,
        }
    }

    pub fn has_one_time_pre_key(&self) -> bool {
        self.one_time_pre_key.is_some()
    }

    /// The one-time prekey and its identifier travel together or not at all.
    pub fn validate(&self) -> Result<(), CryptoError> {
        match (&self.one_time_pre_key, &self.one_time_pre_key_id) {
            (Some(_), None) => Err(CryptoError::HandshakeFailure(
                "bundle carries a one-time prekey without an identifier".into(),
            )),
            (None, Some(id)) => Err(CryptoError::HandshakeFailure(format!(
                "bundle names one-time prekey {id} but carries no key"
            ))),
            _ => Ok(()),
        }
    }
}

// ── Collaborator trait ───────────────────────────────────────────────────────

pub trait KeyBundleProvider {
    fn identity_key_pair(&self) -> KeyPair;

    fn signed_pre_key(&self) -> KeyPair;

    /// Remove and return the one-time prekey secret for `id`. `None` when the
    /// id is unknown or was already consumed.
    fn consume_one_time_pre_key(&self, id: PreKeyId) -> Option<SecretKey>;
}

// ── In-memory store ──────────────────────────────────────────────────────────

#[derive(Default)]
struct OneTimePool {
    next_id: PreKeyId,
    unpublished: BTreeMap<PreKeyId, KeyPair>,
    published: HashMap<PreKeyId, KeyPair>,
}

pub struct MemoryPrekeyStore {
    identity: KeyPair,
    signed_pre_key: KeyPair,
    pool: Mutex<OneTimePool>,
}

impl MemoryPrekeyStore {
    /// Fresh identity, fresh signed prekey, `one_time_count` one-time prekeys.
    pub fn generate(one_time_count: usize) -> Self {
        Self::with_keys(KeyPair::generate(), KeyPair::generate(), one_time_count)
    }

    pub fn with_keys(identity: KeyPair, signed_pre_key: KeyPair, one_time_count: usize) -> Self {
        let store = Self {
            identity,
            signed_pre_key,
            pool: Mutex::new(OneTimePool::default()),
        };
        store.replenish(one_time_count);
        store
    }

    /// Add `count` new one-time prekeys to the unpublished pool.
    pub fn replenish(&self, count: usize) {
        let mut pool = self.pool.lock();
        for _ in 0..count {
            let id = pool.next_id;
            pool.next_id = pool.next_id.wrapping_add(1);
            pool.unpublished.insert(id, KeyPair::generate());
        }
        debug!(added = count, available = pool.unpublished.len(), "one-time prekeys replenished");
    }

    /// Number of one-time prekeys not yet handed out in a bundle.
    pub fn available_one_time_pre_keys(&self) -> usize {
        self.pool.lock().unpublished.len()
    }

    pub fn identity_public(&self) -> PublicKey {
        self.identity.public
    }

    pub fn signed_pre_key_public(&self) -> PublicKey {
        self.signed_pre_key.public
    }

    /// Hand out a bundle. Each one-time prekey appears in at most one bundle;
    /// once the pool is empty, bundles carry no one-time prekey.
    pub fn publish_bundle(&self) -> KeyBundle {
        let mut pool = self.pool.lock();
        let next = pool.unpublished.pop_first();
        let one_time = match next {
            Some((id, pair)) => {
                let public = pair.public;
                pool.published.insert(id, pair);
                Some((id, public))
            }
            None => {
                warn!("one-time prekey pool exhausted; publishing bundle without one");
                None
            }
        };
        KeyBundle::new(self.identity.public, self.signed_pre_key.public, one_time)
    }
}

impl KeyBundleProvider for MemoryPrekeyStore {
    fn identity_key_pair(&self) -> KeyPair {
        self.identity.clone()
    }

    fn signed_pre_key(&self) -> KeyPair {
        self.signed_pre_key.clone()
    }

    fn consume_one_time_pre_key(&self, id: PreKeyId) -> Option<SecretKey> {
        let mut pool = self.pool.lock();
        let pair = pool
            .published
            .remove(&id)
            .or_else(|| pool.unpublished.remove(&id));
        match pair {
            Some(pair) => {
                debug!(opk_id = id, "one-time prekey consumed");
                Some(pair.secret().clone())
            }
            None => {
                warn!(opk_id = id, "one-time prekey unknown or already consumed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundles_hand_out_distinct_one_time_keys() {
        let store = MemoryPrekeyStore::generate(2);
        let a = store.publish_bundle();
        let b = store.publish_bundle();
        let c = store.publish_bundle();

        assert!(a.has_one_time_pre_key());
        assert!(b.has_one_time_pre_key());
        assert_ne!(a.one_time_pre_key_id, b.one_time_pre_key_id);
        assert_ne!(a.one_time_pre_key, b.one_time_pre_key);
        assert!(!c.has_one_time_pre_key());
        assert_eq!(c.one_time_pre_key_id, None);
        assert_eq!(store.available_one_time_pre_keys(), 0);
    }

    #[test]
    fn one_time_key_is_consumed_once() {
        let store = MemoryPrekeyStore::generate(1);
        let bundle = store.publish_bundle();
        let id = bundle.one_time_pre_key_id.unwrap();

        let secret = store.consume_one_time_pre_key(id).unwrap();
        assert_eq!(secret.public_key().unwrap(), bundle.one_time_pre_key.unwrap());
        assert!(store.consume_one_time_pre_key(id).is_none());
        assert!(store.consume_one_time_pre_key(999).is_none());
    }

    #[test]
    fn concurrent_consumers_get_at_most_one_secret() {
        use std::sync::Arc;

        let store = Arc::new(MemoryPrekeyStore::generate(1));
        let id = store.publish_bundle().one_time_pre_key_id.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.consume_one_time_pre_key(id).is_some())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn bundle_validation() {
        let store = MemoryPrekeyStore::generate(1);
        let mut bundle = store.publish_bundle();
        assert!(bundle.validate().is_ok());

        bundle.one_time_pre_key_id = None;
        assert!(matches!(bundle.validate(), Err(CryptoError::HandshakeFailure(_))));

        bundle.one_time_pre_key = None;
        bundle.one_time_pre_key_id = Some(3);
        assert!(matches!(bundle.validate(), Err(CryptoError::HandshakeFailure(_))));
    }

    #[test]
    fn bundle_serde_roundtrip_omits_absent_one_time_key() {
        let store = MemoryPrekeyStore::generate(0);
        let bundle = store.publish_bundle();
        let json = serde_json::to_string(&bundle).unwrap();
        assert!(!json.contains("one_time_pre_key"));
        let back: KeyBundle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bundle);
    }
}
