//! Network Topology
//!
//! An undirected reachability graph of the mesh as seen from the local
//! node. Edges carry a link quality in [0, 1] and the time it was last
//! confirmed; reads weight the quality by recency with an exponential
//! half-life so stale measurements count for less.
//!
//! Local edges come from connect/disconnect and quality updates. Remote
//! edges come from topology announcements, which replace the announcing
//! node's neighbour set. Reachability and the network size estimate are
//! recomputed periodically; nodes silent for too long are pruned.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::identity::PeerId;

/// A link between two nodes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Link {
    /// Measured quality in [0, 1].
    pub quality: f64,
    /// When the quality was last confirmed (Unix ms).
    pub updated_at_ms: u64,
}

impl Link {
    fn new(quality: f64, current_time_ms: u64) -> Self {
        Self {
            quality: quality.clamp(0.0, 1.0),
            updated_at_ms: current_time_ms,
        }
    }

    /// Quality decayed by the age of the measurement.
    pub fn effective_quality(&self, half_life_ms: u64, current_time_ms: u64) -> f64 {
        if half_life_ms == 0 {
            return self.quality;
        }
        let age = current_time_ms.saturating_sub(self.updated_at_ms) as f64;
        self.quality * 0.5f64.powf(age / half_life_ms as f64)
    }
}

#[derive(Clone, Debug, Default)]
struct NodeEntry {
    last_seen_ms: u64,
    links: HashMap<PeerId, Link>,
}

/// Reachability graph centred on the local node.
#[derive(Clone, Debug)]
pub struct NetworkTopology {
    local: PeerId,
    half_life_ms: u64,
    nodes: HashMap<PeerId, NodeEntry>,
    /// Hop distance from the local node, as of the last recompute.
    reachable: HashMap<PeerId, usize>,
    last_recompute_ms: Option<u64>,
}

impl NetworkTopology {
    /// Create a graph containing only the local node.
    pub fn new(local: PeerId, half_life_ms: u64) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(local.clone(), NodeEntry::default());
        let mut reachable = HashMap::new();
        reachable.insert(local.clone(), 0);
        Self {
            local,
            half_life_ms,
            nodes,
            reachable,
            last_recompute_ms: None,
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    /// Whether the node is known at all.
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.nodes.contains_key(peer)
    }

    /// Number of known nodes, including the local one.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn link_both(&mut self, a: &PeerId, b: &PeerId, link: Link, current_time_ms: u64) {
        let entry = self.nodes.entry(a.clone()).or_default();
        entry.links.insert(b.clone(), link);
        entry.last_seen_ms = entry.last_seen_ms.max(current_time_ms);
        let entry = self.nodes.entry(b.clone()).or_default();
        entry.links.insert(a.clone(), link);
        entry.last_seen_ms = entry.last_seen_ms.max(current_time_ms);
    }

    fn unlink_both(&mut self, a: &PeerId, b: &PeerId) -> bool {
        let removed = self
            .nodes
            .get_mut(a)
            .and_then(|n| n.links.remove(b))
            .is_some();
        if let Some(n) = self.nodes.get_mut(b) {
            n.links.remove(a);
        }
        removed
    }

    /// Add or refresh a direct link. Returns true if the link is new.
    pub fn add_connection(&mut self, peer: &PeerId, quality: f64, current_time_ms: u64) -> bool {
        let is_new = !self.is_direct(peer);
        let local = self.local.clone();
        self.link_both(&local, peer, Link::new(quality, current_time_ms), current_time_ms);
        self.reachable.insert(peer.clone(), 1);
        is_new
    }

    /// Remove a direct link. Returns true if it existed.
    pub fn remove_connection(&mut self, peer: &PeerId) -> bool {
        let local = self.local.clone();
        let removed = self.unlink_both(&local, peer);
        if removed {
            self.recompute_reachability();
        }
        removed
    }

    /// Update the measured quality of a direct link.
    pub fn update_quality(&mut self, peer: &PeerId, quality: f64, current_time_ms: u64) -> bool {
        if !self.is_direct(peer) {
            return false;
        }
        let local = self.local.clone();
        self.link_both(&local, peer, Link::new(quality, current_time_ms), current_time_ms);
        true
    }

    /// Record that a node was heard from. Refreshes a direct link's recency.
    pub fn touch(&mut self, peer: &PeerId, current_time_ms: u64) {
        let local = self.local.clone();
        if let Some(entry) = self.nodes.get_mut(peer) {
            entry.last_seen_ms = entry.last_seen_ms.max(current_time_ms);
            if let Some(link) = entry.links.get_mut(&local) {
                link.updated_at_ms = link.updated_at_ms.max(current_time_ms);
            }
        }
        if let Some(link) = self
            .nodes
            .get_mut(&local)
            .and_then(|n| n.links.get_mut(peer))
        {
            link.updated_at_ms = link.updated_at_ms.max(current_time_ms);
        }
    }

    /// Replace `origin`'s neighbour set with an announced one.
    ///
    /// Links to the local node are kept as measured locally. Returns every
    /// node whose adjacency changed.
    pub fn apply_announcement(
        &mut self,
        origin: &PeerId,
        neighbors: &[(PeerId, f64)],
        current_time_ms: u64,
    ) -> Vec<PeerId> {
        if *origin == self.local {
            return Vec::new();
        }
        let mut changed: HashSet<PeerId> = HashSet::new();
        changed.insert(origin.clone());

        let announced: HashMap<&PeerId, f64> = neighbors
            .iter()
            .filter(|(p, _)| *p != *origin && *p != self.local)
            .map(|(p, q)| (p, *q))
            .collect();

        let previous: Vec<PeerId> = self
            .nodes
            .get(origin)
            .map(|n| {
                n.links
                    .keys()
                    .filter(|p| **p != self.local)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for old in previous {
            if !announced.contains_key(&old) {
                self.unlink_both(origin, &old);
                changed.insert(old);
            }
        }

        for (peer, quality) in announced {
            self.link_both(origin, peer, Link::new(quality, current_time_ms), current_time_ms);
            changed.insert(peer.clone());
        }

        self.recompute_reachability();
        let mut changed: Vec<PeerId> = changed.into_iter().collect();
        changed.sort();
        changed
    }

    /// Remove a node and all its links.
    pub fn remove_node(&mut self, peer: &PeerId) -> bool {
        if *peer == self.local {
            return false;
        }
        let Some(entry) = self.nodes.remove(peer) else {
            return false;
        };
        for neighbor in entry.links.keys() {
            if let Some(n) = self.nodes.get_mut(neighbor) {
                n.links.remove(peer);
            }
        }
        self.recompute_reachability();
        true
    }

    /// Whether `peer` is directly connected to the local node.
    pub fn is_direct(&self, peer: &PeerId) -> bool {
        self.nodes
            .get(&self.local)
            .is_some_and(|n| n.links.contains_key(peer))
    }

    /// Directly connected peers, sorted.
    pub fn direct_neighbors(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .nodes
            .get(&self.local)
            .map(|n| n.links.keys().cloned().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    /// Direct neighbours with their recency-weighted link quality.
    pub fn direct_links(&self, current_time_ms: u64) -> Vec<(PeerId, f64)> {
        self.direct_neighbors()
            .into_iter()
            .filter_map(|p| {
                self.direct_quality(&p, current_time_ms)
                    .map(|q| (p, q))
            })
            .collect()
    }

    /// Recency-weighted quality of the link between two nodes.
    pub fn link_quality(&self, a: &PeerId, b: &PeerId, current_time_ms: u64) -> Option<f64> {
        self.nodes
            .get(a)
            .and_then(|n| n.links.get(b))
            .map(|l| l.effective_quality(self.half_life_ms, current_time_ms))
    }

    /// Recency-weighted quality of a direct link.
    pub fn direct_quality(&self, peer: &PeerId, current_time_ms: u64) -> Option<f64> {
        self.link_quality(&self.local, peer, current_time_ms)
    }

    /// Shortest path from `from` to `to` (both inclusive) that avoids the
    /// local node unless it is an endpoint.
    pub fn path(&self, from: &PeerId, to: &PeerId) -> Option<Vec<PeerId>> {
        if !self.nodes.contains_key(from) || !self.nodes.contains_key(to) {
            return None;
        }
        if from == to {
            return Some(vec![from.clone()]);
        }

        let mut parents: HashMap<&PeerId, &PeerId> = HashMap::new();
        let mut queue = VecDeque::new();
        let mut visited: HashSet<&PeerId> = HashSet::new();
        visited.insert(from);
        queue.push_back(from);

        while let Some(current) = queue.pop_front() {
            let Some(entry) = self.nodes.get(current) else {
                continue;
            };
            // deterministic expansion order
            let mut next: Vec<&PeerId> = entry.links.keys().collect();
            next.sort();
            for neighbor in next {
                if visited.contains(neighbor) {
                    continue;
                }
                if *neighbor == self.local && neighbor != to {
                    continue;
                }
                visited.insert(neighbor);
                parents.insert(neighbor, current);
                if neighbor == to {
                    let mut path = vec![neighbor.clone()];
                    let mut cursor = neighbor;
                    while let Some(parent) = parents.get(cursor) {
                        path.push((*parent).clone());
                        cursor = parent;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(neighbor);
            }
        }
        None
    }

    /// Hop distance between two nodes, avoiding the local node.
    pub fn distance(&self, from: &PeerId, to: &PeerId) -> Option<usize> {
        self.path(from, to).map(|p| p.len() - 1)
    }

    fn recompute_reachability(&mut self) {
        let mut reachable = HashMap::new();
        reachable.insert(self.local.clone(), 0);
        let mut queue = VecDeque::new();
        queue.push_back(self.local.clone());
        while let Some(current) = queue.pop_front() {
            let hops = reachable[&current];
            if let Some(entry) = self.nodes.get(&current) {
                for neighbor in entry.links.keys() {
                    if !reachable.contains_key(neighbor) {
                        reachable.insert(neighbor.clone(), hops + 1);
                        queue.push_back(neighbor.clone());
                    }
                }
            }
        }
        self.reachable = reachable;
    }

    /// Recompute reachability and the size estimate.
    pub fn recompute(&mut self, current_time_ms: u64) {
        self.recompute_reachability();
        self.last_recompute_ms = Some(current_time_ms);
    }

    pub fn last_recompute_ms(&self) -> Option<u64> {
        self.last_recompute_ms
    }

    /// Hop count from the local node as of the last recompute.
    pub fn hops_to(&self, peer: &PeerId) -> Option<usize> {
        self.reachable.get(peer).copied()
    }

    /// Estimated network size: nodes reachable from here, including self.
    pub fn estimated_size(&self) -> usize {
        self.reachable.len()
    }

    /// Remove nodes silent for longer than `stale_after_ms`.
    ///
    /// Direct neighbours are kept while connected. Returns removed nodes.
    pub fn prune_stale(&mut self, current_time_ms: u64, stale_after_ms: u64) -> Vec<PeerId> {
        let mut stale: Vec<PeerId> = self
            .nodes
            .iter()
            .filter(|(peer, entry)| {
                **peer != self.local
                    && !self.is_direct(peer)
                    && current_time_ms.saturating_sub(entry.last_seen_ms) > stale_after_ms
            })
            .map(|(peer, _)| peer.clone())
            .collect();
        stale.sort();
        for peer in &stale {
            if let Some(entry) = self.nodes.remove(peer) {
                for neighbor in entry.links.keys() {
                    if let Some(n) = self.nodes.get_mut(neighbor) {
                        n.links.remove(peer);
                    }
                }
            }
        }
        if !stale.is_empty() {
            self.recompute_reachability();
        }
        stale
    }
}
