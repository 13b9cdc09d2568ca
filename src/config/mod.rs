//! Mesh Configuration
//!
//! Every policy knob of the transport substrate (rekey thresholds, dispatch
//! telemetry, relay probability curve, routing weights, retry table, sync
//! rate limits) lives here as a serde-derived section with defaults.
//!
//! Configuration is YAML. Several files may be layered: they are merged at
//! the document level in order, so a key present in a later file overrides
//! the same key in an earlier one while untouched keys keep their values.
//!
//! ```yaml
//! identity:
//!   secret: "0102...1f20"
//! relay:
//!   default_ttl: 7
//!   probability:
//!     floor: 0.5
//! queue:
//!   retry:
//!     normal: { max_attempts: 6, expiry_secs: 43200 }
//! ```

mod crypto;
mod delivery;
mod mesh;

use crate::identity::{IdentityError, StaticKeypair};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use crypto::{DispatchConfig, NoiseConfig};
pub use delivery::{PriorityPolicy, QueueConfig, RetryConfig, SyncConfig};
pub use mesh::{
    PriorityWeights, ProbabilityStep, RelayConfig, RelayProbabilityConfig, RouteWeights,
    RoutingConfig, SpamConfig,
};

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
}

/// Identity configuration (`identity.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Hex-encoded X25519 static secret (`identity.secret`).
    /// If not specified, a new keypair will be generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Static identity (`identity.*`).
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Noise session policy (`noise.*`).
    #[serde(default)]
    pub noise: NoiseConfig,

    /// Adaptive cipher dispatch (`dispatch.*`).
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Relay engine (`relay.*`).
    #[serde(default)]
    pub relay: RelayConfig,

    /// Routing service (`routing.*`).
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Offline queue and retry (`queue.*`).
    #[serde(default)]
    pub queue: QueueConfig,

    /// Queue synchronization (`sync.*`).
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Config {
    /// Create a configuration with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Load configuration from specific paths.
    ///
    /// Paths are processed in order, with later paths overriding earlier ones
    /// key by key. Missing files are skipped. Returns the config and the
    /// paths that were actually loaded.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut merged = Value::Mapping(Default::default());
        let mut loaded_paths = Vec::new();

        for path in paths {
            if path.exists() {
                let value = Self::read_value(path)?;
                merge_values(&mut merged, value);
                loaded_paths.push(path.clone());
            }
        }

        let config: Config =
            serde_yaml::from_value(merged).map_err(|e| ConfigError::ParseYaml {
                path: loaded_paths.last().cloned().unwrap_or_default(),
                source: e,
            })?;
        config.validate()?;
        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let value = Self::read_value(path)?;
        let config: Config = serde_yaml::from_value(value).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn read_value(path: &Path) -> Result<Value, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        // An empty file is an empty mapping, not null
        if contents.trim().is_empty() {
            return Ok(Value::Mapping(Default::default()));
        }
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.queue.direct_share) {
            return Err(ConfigError::Invalid(format!(
                "queue.direct_share must be within [0, 1], got {}",
                self.queue.direct_share
            )));
        }
        if self.relay.default_ttl > self.relay.max_ttl {
            return Err(ConfigError::Invalid(format!(
                "relay.default_ttl ({}) exceeds relay.max_ttl ({})",
                self.relay.default_ttl, self.relay.max_ttl
            )));
        }
        if self.queue.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "queue.retry.multiplier must be at least 1.0".into(),
            ));
        }
        let steps = &self.relay.probability.steps;
        if steps
            .windows(2)
            .any(|w| w[0].max_network_size >= w[1].max_network_size)
        {
            return Err(ConfigError::Invalid(
                "relay.probability.steps must be in ascending max_network_size order".into(),
            ));
        }
        Ok(())
    }

    /// Create the static keypair from this configuration.
    ///
    /// If a secret is configured, uses it; otherwise generates a new random
    /// keypair.
    pub fn create_keypair(&self) -> Result<StaticKeypair, ConfigError> {
        match &self.identity.secret {
            Some(secret) => Ok(StaticKeypair::from_secret_hex(secret)?),
            None => Ok(StaticKeypair::generate()),
        }
    }

    /// Check if an identity is configured (vs. will be generated).
    pub fn has_identity(&self) -> bool {
        self.identity.secret.is_some()
    }

    /// Serialize this configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

/// Deep-merge `overlay` into `base`. Mappings merge key by key; any other
/// value in the overlay replaces the base value.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (base, overlay) => *base = overlay,
    }
}
