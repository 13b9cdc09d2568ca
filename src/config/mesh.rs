//! Relay and routing configuration (`relay.*`, `routing.*`).

use serde::{Deserialize, Serialize};

use crate::protocol::MessagePriority;

/// Relay engine (`relay.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// TTL stamped on originated messages (`relay.default_ttl`).
    #[serde(default = "RelayConfig::default_ttl")]
    pub default_ttl: u8,
    /// Upper bound accepted on inbound envelopes (`relay.max_ttl`).
    #[serde(default = "RelayConfig::default_max_ttl")]
    pub max_ttl: u8,
    /// Dedup window in seconds (`relay.dedup_window_secs`).
    #[serde(default = "RelayConfig::default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    /// Max remembered message hashes (`relay.dedup_capacity`).
    #[serde(default = "RelayConfig::default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Originate acks for directed messages delivered locally (`relay.auto_ack`).
    #[serde(default = "RelayConfig::default_auto_ack")]
    pub auto_ack: bool,
    /// Outbound and delivery channel capacity (`relay.channel_capacity`).
    #[serde(default = "RelayConfig::default_channel_capacity")]
    pub channel_capacity: usize,
    /// Flood protection (`relay.spam.*`).
    #[serde(default)]
    pub spam: SpamConfig,
    /// Relay probability curve (`relay.probability.*`).
    #[serde(default)]
    pub probability: RelayProbabilityConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_ttl: 5,
            max_ttl: 16,
            dedup_window_secs: 300,
            dedup_capacity: 10_000,
            auto_ack: true,
            channel_capacity: 256,
            spam: SpamConfig::default(),
            probability: RelayProbabilityConfig::default(),
        }
    }
}

impl RelayConfig {
    fn default_ttl() -> u8 { 5 }
    fn default_max_ttl() -> u8 { 16 }
    fn default_dedup_window_secs() -> u64 { 300 }
    fn default_dedup_capacity() -> usize { 10_000 }
    fn default_auto_ack() -> bool { true }
    fn default_channel_capacity() -> usize { 256 }
}

/// Per-sender flood detection (`relay.spam.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamConfig {
    /// Sliding window for rate accounting in seconds (`relay.spam.window_secs`).
    #[serde(default = "SpamConfig::default_window_secs")]
    pub window_secs: u64,
    /// Messages per window at which rate suspicion saturates
    /// (`relay.spam.max_messages_per_window`).
    #[serde(default = "SpamConfig::default_max_messages_per_window")]
    pub max_messages_per_window: u32,
    /// Payload size above which a message adds suspicion (`relay.spam.max_message_size`).
    #[serde(default = "SpamConfig::default_max_message_size")]
    pub max_message_size: usize,
    /// Score at or above which a sender is blocked (`relay.spam.block_threshold`).
    #[serde(default = "SpamConfig::default_block_threshold")]
    pub block_threshold: f64,
    /// Seconds a blocked sender stays blocked (`relay.spam.block_secs`).
    #[serde(default = "SpamConfig::default_block_secs")]
    pub block_secs: u64,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_messages_per_window: 60,
            max_message_size: 32 * 1024,
            block_threshold: 1.0,
            block_secs: 600,
        }
    }
}

impl SpamConfig {
    fn default_window_secs() -> u64 { 60 }
    fn default_max_messages_per_window() -> u32 { 60 }
    fn default_max_message_size() -> usize { 32 * 1024 }
    fn default_block_threshold() -> f64 { 1.0 }
    fn default_block_secs() -> u64 { 600 }
}

/// One step of the relay probability curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityStep {
    /// Applies while the estimated network size is at most this.
    pub max_network_size: usize,
    /// Probability of relaying in that range.
    pub probability: f64,
}

/// Relay probability as a function of estimated network size
/// (`relay.probability.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayProbabilityConfig {
    /// Steps in ascending `max_network_size` order (`relay.probability.steps`).
    #[serde(default = "RelayProbabilityConfig::default_steps")]
    pub steps: Vec<ProbabilityStep>,
    /// Probability beyond the last step (`relay.probability.floor`).
    #[serde(default = "RelayProbabilityConfig::default_floor")]
    pub floor: f64,
}

impl Default for RelayProbabilityConfig {
    fn default() -> Self {
        Self {
            steps: Self::default_steps(),
            floor: Self::default_floor(),
        }
    }
}

impl RelayProbabilityConfig {
    fn default_steps() -> Vec<ProbabilityStep> {
        vec![
            ProbabilityStep { max_network_size: 10, probability: 1.0 },
            ProbabilityStep { max_network_size: 30, probability: 0.85 },
            ProbabilityStep { max_network_size: 60, probability: 0.7 },
            ProbabilityStep { max_network_size: 100, probability: 0.55 },
        ]
    }
    fn default_floor() -> f64 { 0.4 }

    /// A curve that always relays.
    pub fn always() -> Self {
        Self {
            steps: Vec::new(),
            floor: 1.0,
        }
    }
}

/// Routing service (`routing.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Route decision cache lifetime in ms (`routing.cache_ttl_ms`).
    #[serde(default = "RoutingConfig::default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    /// Reachability/size recompute period in seconds (`routing.recompute_interval_secs`).
    #[serde(default = "RoutingConfig::default_recompute_interval_secs")]
    pub recompute_interval_secs: u64,
    /// Silence after which a node is pruned, in seconds (`routing.stale_node_secs`).
    #[serde(default = "RoutingConfig::default_stale_node_secs")]
    pub stale_node_secs: u64,
    /// Half-life of link quality recency weighting, in seconds
    /// (`routing.quality_half_life_secs`).
    #[serde(default = "RoutingConfig::default_quality_half_life_secs")]
    pub quality_half_life_secs: u64,
    /// Per-priority score weights (`routing.weights.*`).
    #[serde(default)]
    pub weights: PriorityWeights,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 5_000,
            recompute_interval_secs: 10,
            stale_node_secs: 300,
            quality_half_life_secs: 60,
            weights: PriorityWeights::default(),
        }
    }
}

impl RoutingConfig {
    fn default_cache_ttl_ms() -> u64 { 5_000 }
    fn default_recompute_interval_secs() -> u64 { 10 }
    fn default_stale_node_secs() -> u64 { 300 }
    fn default_quality_half_life_secs() -> u64 { 60 }
}

/// Weights of the route score components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteWeights {
    /// Weight of recency-weighted direct link quality.
    pub quality: f64,
    /// Weight of the topological distance estimate.
    pub distance: f64,
}

/// Score weights by message priority (`routing.weights.*`).
///
/// Urgent traffic leans on distance (fewer hops, lower latency); low
/// priority leans on link quality (more reliable paths).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityWeights {
    #[serde(default = "PriorityWeights::default_urgent")]
    pub urgent: RouteWeights,
    #[serde(default = "PriorityWeights::default_high")]
    pub high: RouteWeights,
    #[serde(default = "PriorityWeights::default_normal")]
    pub normal: RouteWeights,
    #[serde(default = "PriorityWeights::default_low")]
    pub low: RouteWeights,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            urgent: Self::default_urgent(),
            high: Self::default_high(),
            normal: Self::default_normal(),
            low: Self::default_low(),
        }
    }
}

impl PriorityWeights {
    fn default_urgent() -> RouteWeights { RouteWeights { quality: 0.3, distance: 0.7 } }
    fn default_high() -> RouteWeights { RouteWeights { quality: 0.4, distance: 0.6 } }
    fn default_normal() -> RouteWeights { RouteWeights { quality: 0.5, distance: 0.5 } }
    fn default_low() -> RouteWeights { RouteWeights { quality: 0.7, distance: 0.3 } }

    /// Weights for a priority.
    pub fn for_priority(&self, priority: MessagePriority) -> RouteWeights {
        match priority {
            MessagePriority::Urgent => self.urgent,
            MessagePriority::High => self.high,
            MessagePriority::Normal => self.normal,
            MessagePriority::Low => self.low,
        }
    }
}
