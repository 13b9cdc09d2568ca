//! Persistence of the last dispatch decision.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use super::{DispatchError, DispatchMode};

/// A dispatch decision with the telemetry it was based on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedDecision {
    pub mode: DispatchMode,
    pub jank: u64,
    pub total: u64,
    pub decided_at_ms: u64,
}

/// Storage for the cached dispatch decision.
pub trait DecisionStore: Send + Sync {
    /// Load the last saved decision, if any.
    fn load(&self) -> Option<PersistedDecision>;

    /// Save a decision, replacing any previous one.
    fn save(&self, decision: &PersistedDecision) -> Result<(), DispatchError>;
}

/// In-memory store, for tests and hosts without persistence.
#[derive(Debug, Default)]
pub struct MemoryDecisionStore {
    decision: Mutex<Option<PersistedDecision>>,
}

impl MemoryDecisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with a decision.
    pub fn with_decision(decision: PersistedDecision) -> Self {
        Self {
            decision: Mutex::new(Some(decision)),
        }
    }
}

impl DecisionStore for MemoryDecisionStore {
    fn load(&self) -> Option<PersistedDecision> {
        self.decision.lock().ok().and_then(|d| d.clone())
    }

    fn save(&self, decision: &PersistedDecision) -> Result<(), DispatchError> {
        if let Ok(mut slot) = self.decision.lock() {
            *slot = Some(decision.clone());
        }
        Ok(())
    }
}

/// YAML file store.
#[derive(Debug, Clone)]
pub struct FileDecisionStore {
    path: PathBuf,
}

impl FileDecisionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DecisionStore for FileDecisionStore {
    fn load(&self) -> Option<PersistedDecision> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read dispatch decision");
                return None;
            }
        };
        match serde_yaml::from_str(&contents) {
            Ok(decision) => Some(decision),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring corrupt dispatch decision");
                None
            }
        }
    }

    fn save(&self, decision: &PersistedDecision) -> Result<(), DispatchError> {
        let yaml = serde_yaml::to_string(decision)?;
        fs::write(&self.path, yaml).map_err(|source| DispatchError::WriteDecision {
            path: self.path.clone(),
            source,
        })
    }
}
