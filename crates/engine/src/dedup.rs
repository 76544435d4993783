//! Outcome deduplication: drops repeated feed deliveries of the same round
//!
//! Keys are `(channel, round, multiplier)` triples held in insertion order so
//! the set can be pruned oldest-first once it outgrows its capacity.

use std::collections::{HashSet, VecDeque};

use crate::types::{sanitize_multiplier, ChannelId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OutcomeKey {
    channel_id: ChannelId,
    round_id: String,
    multiplier_bits: u64,
}

impl OutcomeKey {
    fn new(channel_id: ChannelId, round_id: &str, multiplier: f64) -> Self {
        Self {
            channel_id,
            round_id: round_id.to_string(),
            multiplier_bits: sanitize_multiplier(multiplier).to_bits(),
        }
    }
}

/// Bounded "seen" set for outcome triples
#[derive(Debug)]
pub struct OutcomeDeduplicator {
    seen: HashSet<OutcomeKey>,
    order: VecDeque<OutcomeKey>,
    capacity: usize,
    retain: usize,
}

impl OutcomeDeduplicator {
    /// `capacity` is the size that triggers pruning, `retain` how many keys survive it
    pub fn new(capacity: usize, retain: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
            retain: retain.min(capacity),
        }
    }

    /// True if the triple is new; records it either way
    pub fn accept(&mut self, channel_id: ChannelId, round_id: &str, multiplier: f64) -> bool {
        let key = OutcomeKey::new(channel_id, round_id, multiplier);
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);

        if self.order.len() > self.capacity {
            self.prune();
        }
        true
    }

    pub fn contains(&self, channel_id: ChannelId, round_id: &str, multiplier: f64) -> bool {
        self.seen
            .contains(&OutcomeKey::new(channel_id, round_id, multiplier))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn prune(&mut self) {
        let excess = self.order.len().saturating_sub(self.retain);
        for key in self.order.drain(..excess) {
            self.seen.remove(&key);
        }
    }
}

impl Default for OutcomeDeduplicator {
    fn default() -> Self {
        Self::new(1000, 500)
    }
}
