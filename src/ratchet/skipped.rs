use crate::types::SymmetricKey;
use std::collections::{HashMap, VecDeque};

/// Cache key: remote ratchet public key and message number.
pub(crate) type SkippedKeyId = ([u8; 32], u32);

/// Bounded cache of message keys for messages that have not arrived yet.
///
/// Keys are evicted oldest-first once `capacity` is reached. Message keys
/// zeroize themselves when they leave the map.
///
/// Removal is O(1): the insertion order keeps a sequence number per entry and
/// entries whose sequence no longer matches the map are skipped, then
/// compacted once they outnumber the capacity.
#[derive(Clone)]
pub(crate) struct SkippedMessageKeys {
    keys: HashMap<SkippedKeyId, (u64, SymmetricKey)>,
    order: VecDeque<(u64, SkippedKeyId)>,
    next_sequence: u64,
    capacity: usize,
}

impl SkippedMessageKeys {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            keys: HashMap::new(),
            order: VecDeque::new(),
            next_sequence: 0,
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn get(&self, id: &SkippedKeyId) -> Option<&SymmetricKey> {
        self.keys.get(id).map(|(_, key)| key)
    }

    pub(crate) fn insert(&mut self, id: SkippedKeyId, message_key: SymmetricKey) {
        if self.capacity == 0 {
            return;
        }

        if let Some(entry) = self.keys.get_mut(&id) {
            entry.1 = message_key;
            return;
        }

        while self.keys.len() >= self.capacity {
            let Some((sequence, oldest)) = self.order.pop_front() else {
                break;
            };
            if self.is_live(sequence, &oldest) {
                self.keys.remove(&oldest);
                tracing::warn!(
                    message_number = oldest.1,
                    "skipped message key cache full, evicting oldest key"
                );
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.keys.insert(id, (sequence, message_key));
        self.order.push_back((sequence, id));
    }

    pub(crate) fn remove(&mut self, id: &SkippedKeyId) -> Option<SymmetricKey> {
        let (_, key) = self.keys.remove(id)?;

        if self.order.len() > self.capacity.saturating_mul(2) {
            let keys = &self.keys;
            self.order
                .retain(|(sequence, id)| keys.get(id).is_some_and(|(live, _)| live == sequence));
        }

        Some(key)
    }

    /// Entries in insertion order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&SkippedKeyId, &SymmetricKey)> {
        self.order.iter().filter_map(|(sequence, id)| match self.keys.get(id) {
            Some((live, key)) if live == sequence => Some((id, key)),
            _ => None,
        })
    }

    fn is_live(&self, sequence: u64, id: &SkippedKeyId) -> bool {
        self.keys.get(id).is_some_and(|(live, _)| *live == sequence)
    }
}
