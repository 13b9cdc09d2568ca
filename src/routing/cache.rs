//! Short-lived cache of routing decisions.

use std::collections::HashMap;

use super::RoutingDecision;
use crate::identity::PeerId;
use crate::protocol::MessagePriority;

/// A cached decision with its expiry.
#[derive(Clone, Debug)]
struct CachedRoute {
    decision: RoutingDecision,
    expires_at: u64,
}

impl CachedRoute {
    fn is_expired(&self, current_time_ms: u64) -> bool {
        current_time_ms >= self.expires_at
    }

    /// Whether a change to `node` could affect this decision.
    fn touches(&self, node: &PeerId) -> bool {
        self.decision.destination == *node
            || self.decision.next_hop.as_ref() == Some(node)
            || self.decision.path.contains(node)
    }
}

/// Route decisions keyed by destination and priority.
#[derive(Clone, Debug)]
pub struct RouteCache {
    entries: HashMap<(PeerId, MessagePriority), CachedRoute>,
    ttl_ms: u64,
}

impl RouteCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            entries: HashMap::new(),
            ttl_ms,
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    /// Insert a decision, stamped to expire after the cache TTL.
    pub fn insert(&mut self, priority: MessagePriority, decision: RoutingDecision, current_time_ms: u64) {
        let key = (decision.destination.clone(), priority);
        self.entries.insert(
            key,
            CachedRoute {
                decision,
                expires_at: current_time_ms.saturating_add(self.ttl_ms),
            },
        );
    }

    /// Look up an unexpired decision.
    pub fn get(
        &self,
        destination: &PeerId,
        priority: MessagePriority,
        current_time_ms: u64,
    ) -> Option<&RoutingDecision> {
        self.entries
            .get(&(destination.clone(), priority))
            .filter(|e| !e.is_expired(current_time_ms))
            .map(|e| &e.decision)
    }

    /// Drop decisions whose destination, next hop or path includes any of
    /// `nodes`. Returns the number removed.
    pub fn invalidate_touching(&mut self, nodes: &[PeerId]) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !nodes.iter().any(|n| entry.touches(n)));
        before - self.entries.len()
    }

    /// Drop all decisions for a destination.
    pub fn invalidate_destination(&mut self, destination: &PeerId) {
        self.entries.retain(|(dest, _), _| dest != destination);
    }

    /// Remove all expired entries.
    pub fn purge_expired(&mut self, current_time_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.is_expired(current_time_ms));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of entries (including expired).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
