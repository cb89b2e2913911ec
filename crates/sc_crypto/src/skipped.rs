//! Bounded per-session collections.
//!
//! `SkippedKeyCache` is keyed by (remote ratchet public key, message number).
//! Insertion order is tracked separately so that, once `capacity` is reached,
//! the oldest entry is evicted first regardless of which chain it came from.
//!
//! `ConsumedRatchetKeys` remembers the most recent remote ratchet keys a DH
//! step ran against, with the same oldest-first eviction.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::{kdf::MessageKey, keys::PublicKey};

pub type SkippedKeyId = (PublicKey, u32);

pub struct SkippedKeyCache {
    capacity: usize,
    keys: HashMap<SkippedKeyId, MessageKey>,
    order: VecDeque<SkippedKeyId>,
}

impl SkippedKeyCache {
    /// `capacity` of zero is bumped to one; the config layer rejects it first.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            keys: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, ratchet_key: &PublicKey, n: u32) -> bool {
        self.keys.contains_key(&(*ratchet_key, n))
    }

    /// Store a key, evicting the oldest entries while full. Returns how many
    /// entries were evicted.
    pub fn insert(&mut self, ratchet_key: PublicKey, n: u32, key: MessageKey) -> usize {
        let id = (ratchet_key, n);
        if self.keys.insert(id, key).is_some() {
            // Re-derived duplicate: keep its original position.
            return 0;
        }
        self.order.push_back(id);

        let mut evicted = 0;
        while self.keys.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.keys.remove(&oldest).is_some() {
                evicted += 1;
                debug!(ratchet = %oldest.0.short_id(), n = oldest.1, "evicted skipped message key");
            }
        }
        evicted
    }

    pub fn get(&self, ratchet_key: &PublicKey, n: u32) -> Option<&MessageKey> {
        self.keys.get(&(*ratchet_key, n))
    }

    /// Remove and return the key for (ratchet_key, n).
    pub fn take(&mut self, ratchet_key: &PublicKey, n: u32) -> Option<MessageKey> {
        let id = (*ratchet_key, n);
        let key = self.keys.remove(&id)?;
        if let Some(pos) = self.order.iter().position(|entry| *entry == id) {
            self.order.remove(pos);
        }
        Some(key)
    }
}

pub struct ConsumedRatchetKeys {
    capacity: usize,
    keys: HashSet<PublicKey>,
    order: VecDeque<PublicKey>,
}

impl ConsumedRatchetKeys {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            keys: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, ratchet_key: &PublicKey) -> bool {
        self.keys.contains(ratchet_key)
    }

    pub fn insert(&mut self, ratchet_key: PublicKey) {
        if !self.keys.insert(ratchet_key) {
            return;
        }
        self.order.push_back(ratchet_key);
        while self.keys.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.keys.remove(&oldest);
            debug!(ratchet = %oldest.short_id(), "forgot oldest consumed ratchet key");
        }
    }
}
