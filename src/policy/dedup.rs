use std::collections::{HashSet, VecDeque};

use crate::message::MessageIdentity;

/// Bounded set of recently processed identities.
///
/// Insertion order is tracked so that overflow evicts the oldest entries and
/// keeps exactly the newest `capacity`. Lookups do not refresh recency.
#[derive(Debug, Clone)]
pub struct DedupCache {
    capacity: usize,
    seen: HashSet<MessageIdentity>,
    order: VecDeque<MessageIdentity>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record `identity` and return true the first time it is seen
    pub fn should_process(&mut self, identity: &MessageIdentity) -> bool {
        if self.seen.contains(identity) {
            return false;
        }

        self.seen.insert(identity.clone());
        self.order.push_back(identity.clone());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    /// Forget `identity` so a later observation can retry it
    pub fn release(&mut self, identity: &MessageIdentity) -> bool {
        if !self.seen.remove(identity) {
            return false;
        }
        self.order.retain(|entry| entry != identity);
        true
    }

    pub fn contains(&self, identity: &MessageIdentity) -> bool {
        self.seen.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}
