//! Session and cipher dispatch configuration (`noise.*`, `dispatch.*`).

use serde::{Deserialize, Serialize};

/// Noise session policy (`noise.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseConfig {
    /// Transport messages (both directions) before a rekey is due
    /// (`noise.rekey_after_messages`).
    #[serde(default = "NoiseConfig::default_rekey_after_messages")]
    pub rekey_after_messages: u64,
    /// Session age in seconds before a rekey is due (`noise.rekey_after_secs`).
    #[serde(default = "NoiseConfig::default_rekey_after_secs")]
    pub rekey_after_secs: u64,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            rekey_after_messages: 10_000,
            rekey_after_secs: 3600,
        }
    }
}

impl NoiseConfig {
    fn default_rekey_after_messages() -> u64 { 10_000 }
    fn default_rekey_after_secs() -> u64 { 3600 }
}

/// Adaptive cipher dispatch (`dispatch.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Payloads smaller than this always run inline (`dispatch.inline_size_floor`).
    #[serde(default = "DispatchConfig::default_inline_size_floor")]
    pub inline_size_floor: usize,
    /// Latency above which an operation counts as jank (`dispatch.jank_threshold_ms`).
    #[serde(default = "DispatchConfig::default_jank_threshold_ms")]
    pub jank_threshold_ms: u64,
    /// Jank fraction above which work moves off-thread (`dispatch.max_jank_fraction`).
    #[serde(default = "DispatchConfig::default_max_jank_fraction")]
    pub max_jank_fraction: f64,
    /// Samples required before telemetry can move work off-thread
    /// (`dispatch.min_samples`).
    #[serde(default = "DispatchConfig::default_min_samples")]
    pub min_samples: u64,
    /// Operations between automatic re-evaluations (`dispatch.reevaluate_every`).
    #[serde(default = "DispatchConfig::default_reevaluate_every")]
    pub reevaluate_every: u64,
    /// Rolling telemetry window length (`dispatch.telemetry_window`).
    #[serde(default = "DispatchConfig::default_telemetry_window")]
    pub telemetry_window: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            inline_size_floor: 1024,
            jank_threshold_ms: 16,
            max_jank_fraction: 0.05,
            min_samples: 10,
            reevaluate_every: 100,
            telemetry_window: 200,
        }
    }
}

impl DispatchConfig {
    fn default_inline_size_floor() -> usize { 1024 }
    fn default_jank_threshold_ms() -> u64 { 16 }
    fn default_max_jank_fraction() -> f64 { 0.05 }
    fn default_min_samples() -> u64 { 10 }
    fn default_reevaluate_every() -> u64 { 100 }
    fn default_telemetry_window() -> usize { 200 }
}
