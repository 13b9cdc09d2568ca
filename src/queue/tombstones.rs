//! Bounded log of intentionally deleted message ids.
//!
//! Sync consults it so a peer holding an older copy cannot resurrect a
//! message this node already delivered or removed.

use std::collections::{HashMap, VecDeque};

use crate::identity::MessageId;

#[derive(Clone, Debug)]
pub struct DeletedIdLog {
    capacity: usize,
    max_age_ms: u64,
    /// Insertion order, oldest first.
    order: VecDeque<(MessageId, u64)>,
    /// Latest deletion time per id.
    index: HashMap<MessageId, u64>,
}

impl DeletedIdLog {
    pub fn new(capacity: usize, max_age_ms: u64) -> Self {
        Self {
            capacity,
            max_age_ms,
            order: VecDeque::new(),
            index: HashMap::new(),
        }
    }

    /// Remember a deletion, evicting the oldest entry when full.
    pub fn record(&mut self, id: MessageId, current_time_ms: u64) {
        if self.capacity == 0 {
            return;
        }
        if self.index.insert(id, current_time_ms).is_some() {
            self.order.retain(|(existing, _)| *existing != id);
        }
        self.order.push_back((id, current_time_ms));
        while self.order.len() > self.capacity {
            if let Some((old, _)) = self.order.pop_front() {
                self.index.remove(&old);
            }
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    /// Forget deletions older than the max age. Returns how many.
    pub fn prune(&mut self, current_time_ms: u64) -> usize {
        let mut pruned = 0;
        while let Some((id, at)) = self.order.front().copied() {
            if current_time_ms.saturating_sub(at) < self.max_age_ms {
                break;
            }
            self.order.pop_front();
            self.index.remove(&id);
            pruned += 1;
        }
        pruned
    }

    /// Remembered ids, oldest first.
    pub fn ids(&self) -> Vec<MessageId> {
        self.order.iter().map(|(id, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
