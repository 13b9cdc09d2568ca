//! Adaptive Cipher Dispatch
//!
//! Every transport AEAD operation is routed through an
//! `AdaptiveCipherDispatcher`, which runs it either inline on the calling
//! task or on tokio's blocking pool. Small payloads always run inline.
//! Larger ones move off-thread when recent telemetry shows too many
//! operations exceeding the latency budget.
//!
//! The dispatch decision never affects output: both paths execute the same
//! owned `CipherJob`, whose nonce is the 12-byte encoding of its counter.

mod dispatcher;
mod store;
mod telemetry;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub use dispatcher::AdaptiveCipherDispatcher;
pub use store::{DecisionStore, FileDecisionStore, MemoryDecisionStore, PersistedDecision};
pub use telemetry::{CipherTelemetry, JankSample, RollingTelemetry};

/// Errors from dispatch and decision persistence.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("off-thread cipher task failed: {0}")]
    TaskFailed(String),

    #[error("failed to write dispatch decision to {path}: {source}")]
    WriteDecision {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize dispatch decision: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// Where a cipher operation executes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// On the calling task.
    #[default]
    Inline,
    /// On the blocking worker pool.
    OffThread,
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Inline => write!(f, "inline"),
            DispatchMode::OffThread => write!(f, "off_thread"),
        }
    }
}

/// Manual override for diagnostics and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchOverride {
    /// Follow telemetry.
    #[default]
    Auto,
    ForceInline,
    ForceOffThread,
}

#[cfg(test)]
mod tests;
