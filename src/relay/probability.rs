//! Relay probability as a function of estimated network size.

use rand::Rng;

use crate::config::RelayProbabilityConfig;

/// Step curve: the first step whose `max_network_size` covers the estimate
/// gives the probability, otherwise the floor.
#[derive(Clone, Debug)]
pub struct RelayProbabilityCurve {
    config: RelayProbabilityConfig,
}

impl RelayProbabilityCurve {
    pub fn new(config: RelayProbabilityConfig) -> Self {
        let mut config = config;
        config.steps.sort_by_key(|s| s.max_network_size);
        Self { config }
    }

    /// Relay probability for an estimated network size, in `[0, 1]`.
    pub fn probability(&self, network_size: usize) -> f64 {
        self.config
            .steps
            .iter()
            .find(|s| network_size <= s.max_network_size)
            .map(|s| s.probability)
            .unwrap_or(self.config.floor)
            .clamp(0.0, 1.0)
    }

    /// Flip the coin.
    pub fn should_relay<R: Rng + ?Sized>(&self, network_size: usize, rng: &mut R) -> bool {
        let p = self.probability(network_size);
        if p >= 1.0 {
            true
        } else if p <= 0.0 {
            false
        } else {
            rng.gen_bool(p)
        }
    }
}
