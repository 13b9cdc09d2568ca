//! Routing Service
//!
//! Chooses the next hop for a destination among candidate direct
//! neighbours. Each candidate is scored as a weighted sum of its
//! recency-weighted direct link quality and a distance term
//! `1 / (1 + hops)` from the candidate to the destination, with weights
//! taken from the message priority. The highest score wins; ties go to the
//! lexicographically smallest peer id.
//!
//! Decisions are cached per destination and priority for a short TTL and
//! invalidated when a topology change touches the destination, the chosen
//! next hop, or any node on the expected path. A destination the topology
//! knows nothing about yields an explicit no-route decision.

mod cache;

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::RoutingConfig;
use crate::identity::PeerId;
use crate::protocol::{MessagePriority, TopologyNeighbor};
use crate::topology::NetworkTopology;

pub use cache::RouteCache;

/// Why a routing decision came out the way it did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteReason {
    /// The destination is itself a candidate neighbour.
    Direct,
    /// Best score among candidates; `hops` from next hop to destination.
    Scored { hops: usize },
    /// No topology data for the destination.
    NoTopology,
    /// Destination known but no candidate reaches it.
    Unreachable,
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteReason::Direct => write!(f, "direct"),
            RouteReason::Scored { hops } => write!(f, "scored ({} hops)", hops),
            RouteReason::NoTopology => write!(f, "no topology"),
            RouteReason::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// A next-hop choice for one destination.
#[derive(Clone, Debug, PartialEq)]
pub struct RoutingDecision {
    pub destination: PeerId,
    /// `None` when there is no route.
    pub next_hop: Option<PeerId>,
    pub score: f64,
    pub reason: RouteReason,
    /// Expected path from the next hop to the destination, inclusive.
    pub path: Vec<PeerId>,
}

impl RoutingDecision {
    fn no_route(destination: &PeerId, reason: RouteReason) -> Self {
        Self {
            destination: destination.clone(),
            next_hop: None,
            score: 0.0,
            reason,
            path: Vec::new(),
        }
    }

    /// Whether a next hop was found.
    pub fn has_route(&self) -> bool {
        self.next_hop.is_some()
    }
}

/// Outcome of a maintenance tick.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoutingTick {
    pub recomputed: bool,
    pub pruned: Vec<PeerId>,
    pub expired_routes: usize,
}

struct RoutingInner {
    topology: NetworkTopology,
    cache: RouteCache,
}

/// Topology-aware next-hop selection.
///
/// Owns the topology graph and route cache behind one lock; callers never
/// lock them directly.
pub struct RoutingService {
    config: RoutingConfig,
    inner: Mutex<RoutingInner>,
}

impl RoutingService {
    pub fn new(local: PeerId, config: RoutingConfig) -> Self {
        let topology = NetworkTopology::new(local, config.quality_half_life_secs * 1000);
        let cache = RouteCache::new(config.cache_ttl_ms);
        Self {
            config,
            inner: Mutex::new(RoutingInner { topology, cache }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RoutingInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Record a new or refreshed direct link.
    ///
    /// A new link can open shorter routes anywhere and a refreshed one
    /// changes candidate scores, so every cached decision is dropped.
    pub fn add_connection(&self, peer: &PeerId, quality: f64, current_time_ms: u64) {
        let mut inner = self.lock();
        if inner.topology.add_connection(peer, quality, current_time_ms) {
            debug!(peer = %peer.short(), quality, "Direct link added");
        }
        inner.cache.clear();
    }

    /// Remove a direct link.
    pub fn remove_connection(&self, peer: &PeerId) {
        let mut inner = self.lock();
        if inner.topology.remove_connection(peer) {
            inner.cache.invalidate_touching(std::slice::from_ref(peer));
            debug!(peer = %peer.short(), "Direct link removed");
        }
    }

    /// Update a direct link's measured quality.
    ///
    /// Every decision that had this neighbour as a candidate may change, so
    /// the whole cache is dropped.
    pub fn update_link_quality(&self, peer: &PeerId, quality: f64, current_time_ms: u64) {
        let mut inner = self.lock();
        if inner.topology.update_quality(peer, quality, current_time_ms) {
            inner.cache.clear();
        }
    }

    /// Record that `peer` was heard from.
    pub fn observe(&self, peer: &PeerId, current_time_ms: u64) {
        self.lock().topology.touch(peer, current_time_ms);
    }

    /// Fold a topology announcement from `origin` into the graph.
    pub fn apply_announcement(
        &self,
        origin: &PeerId,
        neighbors: &[TopologyNeighbor],
        current_time_ms: u64,
    ) -> usize {
        let pairs: Vec<(PeerId, f64)> = neighbors
            .iter()
            .map(|n| (n.peer.clone(), n.quality))
            .collect();
        let mut inner = self.lock();
        let changed = inner
            .topology
            .apply_announcement(origin, &pairs, current_time_ms);
        inner.cache.invalidate_touching(&changed);
        debug!(
            origin = %origin.short(),
            neighbors = neighbors.len(),
            changed = changed.len(),
            "Applied topology announcement"
        );
        changed.len()
    }

    /// Forget a peer entirely: its node, links and cached routes.
    pub fn remove_peer(&self, peer: &PeerId) {
        let mut inner = self.lock();
        inner.topology.remove_node(peer);
        inner.cache.invalidate_touching(std::slice::from_ref(peer));
    }

    /// Choose the best next hop for `destination` among `candidates`.
    ///
    /// Candidates that are not direct neighbours are ignored.
    pub fn determine_optimal_route(
        &self,
        destination: &PeerId,
        candidates: &[PeerId],
        priority: MessagePriority,
        current_time_ms: u64,
    ) -> RoutingDecision {
        let mut inner = self.lock();

        if let Some(cached) = inner.cache.get(destination, priority, current_time_ms)
            && cached
                .next_hop
                .as_ref()
                .is_some_and(|hop| candidates.contains(hop))
        {
            return cached.clone();
        }

        if !inner.topology.contains(destination) {
            return RoutingDecision::no_route(destination, RouteReason::NoTopology);
        }

        let weights = self.config.weights.for_priority(priority);
        let mut sorted: Vec<&PeerId> = candidates.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut best: Option<(f64, &PeerId, Vec<PeerId>)> = None;
        for candidate in sorted {
            if !inner.topology.is_direct(candidate) {
                continue;
            }
            let Some(path) = inner.topology.path(candidate, destination) else {
                continue;
            };
            let hops = path.len() - 1;
            let quality = inner
                .topology
                .direct_quality(candidate, current_time_ms)
                .unwrap_or(0.0);
            let score = weights.quality * quality + weights.distance / (1.0 + hops as f64);

            let better = match &best {
                None => true,
                // candidates are visited in id order, so equal scores keep the smaller id
                Some((best_score, _, _)) => score > *best_score,
            };
            if better {
                best = Some((score, candidate, path));
            }
        }

        let decision = match best {
            Some((score, hop, path)) => {
                let reason = if hop == destination {
                    RouteReason::Direct
                } else {
                    RouteReason::Scored {
                        hops: path.len() - 1,
                    }
                };
                let decision = RoutingDecision {
                    destination: destination.clone(),
                    next_hop: Some(hop.clone()),
                    score,
                    reason,
                    path,
                };
                inner
                    .cache
                    .insert(priority, decision.clone(), current_time_ms);
                decision
            }
            None => RoutingDecision::no_route(destination, RouteReason::Unreachable),
        };

        debug!(
            destination = %destination.short(),
            next_hop = ?decision.next_hop.as_ref().map(|p| p.short()),
            reason = %decision.reason,
            "Route determined"
        );
        decision
    }

    /// Highest-quality direct neighbour not in `exclude`.
    pub fn best_direct_neighbor(&self, exclude: &[PeerId], current_time_ms: u64) -> Option<PeerId> {
        let inner = self.lock();
        let mut best: Option<(f64, PeerId)> = None;
        for (peer, quality) in inner.topology.direct_links(current_time_ms) {
            if exclude.contains(&peer) {
                continue;
            }
            if best.as_ref().is_none_or(|(q, _)| quality > *q) {
                best = Some((quality, peer));
            }
        }
        best.map(|(_, peer)| peer)
    }

    pub fn is_direct_neighbor(&self, peer: &PeerId) -> bool {
        self.lock().topology.is_direct(peer)
    }

    pub fn direct_neighbors(&self) -> Vec<PeerId> {
        self.lock().topology.direct_neighbors()
    }

    /// Whether the topology knows anything about `peer`.
    pub fn knows(&self, peer: &PeerId) -> bool {
        self.lock().topology.contains(peer)
    }

    pub fn estimated_network_size(&self) -> usize {
        self.lock().topology.estimated_size()
    }

    /// Our neighbour list as carried in a topology announcement.
    pub fn local_announcement(&self, current_time_ms: u64) -> Vec<TopologyNeighbor> {
        self.lock()
            .topology
            .direct_links(current_time_ms)
            .into_iter()
            .map(|(peer, quality)| TopologyNeighbor { peer, quality })
            .collect()
    }

    /// Cached decisions, including expired ones not yet purged.
    pub fn cached_routes(&self) -> usize {
        self.lock().cache.len()
    }

    /// Periodic maintenance: purge expired routes, and on the recompute
    /// interval prune stale nodes and recompute reachability.
    pub fn tick(&self, current_time_ms: u64) -> RoutingTick {
        let mut inner = self.lock();
        let expired_routes = inner.cache.purge_expired(current_time_ms);

        let interval_ms = self.config.recompute_interval_secs * 1000;
        let due = inner
            .topology
            .last_recompute_ms()
            .is_none_or(|last| current_time_ms.saturating_sub(last) >= interval_ms);
        if !due {
            return RoutingTick {
                recomputed: false,
                pruned: Vec::new(),
                expired_routes,
            };
        }

        let pruned = inner
            .topology
            .prune_stale(current_time_ms, self.config.stale_node_secs * 1000);
        if !pruned.is_empty() {
            inner.cache.invalidate_touching(&pruned);
            info!(count = pruned.len(), "Pruned stale topology nodes");
        }
        inner.topology.recompute(current_time_ms);

        RoutingTick {
            recomputed: true,
            pruned,
            expired_routes,
        }
    }
}

impl fmt::Debug for RoutingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("RoutingService")
            .field("nodes", &inner.topology.node_count())
            .field("cached_routes", &inner.cache.len())
            .finish()
    }
}
