//! Inline vs off-thread execution of cipher jobs.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{
    CipherTelemetry, DecisionStore, DispatchError, DispatchMode, DispatchOverride, JankSample,
    MemoryDecisionStore, PersistedDecision, RollingTelemetry,
};
use crate::config::DispatchConfig;
use crate::identity::now_ms;
use crate::noise::{CipherJob, NoiseError};

#[derive(Debug)]
struct DispatcherState {
    mode: DispatchMode,
    override_mode: DispatchOverride,
    ops_since_evaluation: u64,
}

/// Chooses where each AEAD operation runs, based on recent latency.
pub struct AdaptiveCipherDispatcher {
    config: DispatchConfig,
    telemetry: Arc<dyn CipherTelemetry>,
    store: Arc<dyn DecisionStore>,
    state: Mutex<DispatcherState>,
}

impl AdaptiveCipherDispatcher {
    /// Create a dispatcher, revalidating any persisted decision against live
    /// telemetry.
    pub fn new(
        config: DispatchConfig,
        telemetry: Arc<dyn CipherTelemetry>,
        store: Arc<dyn DecisionStore>,
    ) -> Self {
        let live = telemetry.query_jank();
        let mode = Self::decide(&config, live);
        if let Some(persisted) = store.load()
            && persisted.mode != mode
        {
            debug!(
                persisted = %persisted.mode,
                live = %mode,
                samples = live.total,
                "Persisted dispatch decision not confirmed by live telemetry"
            );
        }

        Self {
            config,
            telemetry,
            store,
            state: Mutex::new(DispatcherState {
                mode,
                override_mode: DispatchOverride::Auto,
                ops_since_evaluation: 0,
            }),
        }
    }

    /// Create a dispatcher with rolling telemetry and in-memory persistence.
    pub fn from_config(config: DispatchConfig) -> Self {
        let telemetry = Arc::new(RollingTelemetry::new(
            Duration::from_millis(config.jank_threshold_ms),
            config.telemetry_window,
        ));
        Self::new(config, telemetry, Arc::new(MemoryDecisionStore::new()))
    }

    fn decide(config: &DispatchConfig, sample: JankSample) -> DispatchMode {
        if sample.total >= config.min_samples && sample.fraction() > config.max_jank_fraction {
            DispatchMode::OffThread
        } else {
            DispatchMode::Inline
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mode a payload of `size` bytes would use right now.
    pub fn mode_for(&self, size: usize) -> DispatchMode {
        let state = self.lock();
        match state.override_mode {
            DispatchOverride::ForceInline => DispatchMode::Inline,
            DispatchOverride::ForceOffThread => DispatchMode::OffThread,
            DispatchOverride::Auto if size < self.config.inline_size_floor => DispatchMode::Inline,
            DispatchOverride::Auto => state.mode,
        }
    }

    /// Telemetry-derived mode, ignoring size and override.
    pub fn current_mode(&self) -> DispatchMode {
        self.lock().mode
    }

    pub fn override_mode(&self) -> DispatchOverride {
        self.lock().override_mode
    }

    pub fn set_override(&self, override_mode: DispatchOverride) {
        self.lock().override_mode = override_mode;
        debug!(override_mode = ?override_mode, "Cipher dispatch override set");
    }

    /// Current telemetry sample.
    pub fn jank_sample(&self) -> JankSample {
        self.telemetry.query_jank()
    }

    /// Run a cipher job on the selected path.
    pub async fn run(&self, job: CipherJob) -> Result<Vec<u8>, NoiseError> {
        let size = job.len();
        let mode = self.mode_for(size);
        let start = Instant::now();

        let result = match mode {
            DispatchMode::Inline => job.run(),
            DispatchMode::OffThread => tokio::task::spawn_blocking(move || job.run())
                .await
                .map_err(|e| DispatchError::TaskFailed(e.to_string()))?,
        };

        if size >= self.config.inline_size_floor {
            self.telemetry.record_operation(start.elapsed(), size);
            self.note_operation();
        }
        result
    }

    fn note_operation(&self) {
        let due = {
            let mut state = self.lock();
            state.ops_since_evaluation += 1;
            state.ops_since_evaluation >= self.config.reevaluate_every
        };
        if due {
            self.reevaluate();
        }
    }

    /// Recompute the mode from telemetry and persist it.
    pub fn reevaluate(&self) -> DispatchMode {
        let sample = self.telemetry.query_jank();
        let mode = Self::decide(&self.config, sample);

        let previous = {
            let mut state = self.lock();
            state.ops_since_evaluation = 0;
            std::mem::replace(&mut state.mode, mode)
        };
        if previous != mode {
            info!(
                from = %previous,
                to = %mode,
                jank = sample.jank,
                samples = sample.total,
                "Cipher dispatch mode changed"
            );
        }

        let decision = PersistedDecision {
            mode,
            jank: sample.jank,
            total: sample.total,
            decided_at_ms: now_ms(),
        };
        if let Err(e) = self.store.save(&decision) {
            warn!(error = %e, "Failed to persist dispatch decision");
        }
        mode
    }
}

impl std::fmt::Debug for AdaptiveCipherDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveCipherDispatcher")
            .field("config", &self.config)
            .field("mode", &self.current_mode())
            .field("override", &self.override_mode())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poison(dispatcher: &AdaptiveCipherDispatcher) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = dispatcher.state.lock().unwrap();
            panic!("poison dispatcher state");
        }));
        assert!(result.is_err());
        assert!(dispatcher.state.is_poisoned());
    }

    #[test]
    fn test_poisoned_state_still_honours_override() {
        let d = AdaptiveCipherDispatcher::from_config(DispatchConfig::default());
        poison(&d);

        d.set_override(DispatchOverride::ForceOffThread);
        assert_eq!(d.override_mode(), DispatchOverride::ForceOffThread);
        assert_eq!(d.mode_for(1), DispatchMode::OffThread);
        assert_eq!(d.reevaluate(), DispatchMode::Inline);
        assert_eq!(d.current_mode(), DispatchMode::Inline);
    }
}
