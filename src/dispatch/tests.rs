use super::*;
use crate::config::DispatchConfig;
use crate::noise::{CipherJob, CipherOp, CipherState};
use std::sync::Arc;
use std::time::Duration;

fn telemetry() -> Arc<RollingTelemetry> {
    Arc::new(RollingTelemetry::new(Duration::from_millis(16), 200))
}

fn feed(telemetry: &RollingTelemetry, jank: usize, total: usize) {
    for i in 0..total {
        let d = if i < jank {
            Duration::from_millis(50)
        } else {
            Duration::from_millis(1)
        };
        telemetry.record_operation(d, 4096);
    }
}

fn dispatcher(telemetry: Arc<RollingTelemetry>) -> AdaptiveCipherDispatcher {
    AdaptiveCipherDispatcher::new(
        DispatchConfig::default(),
        telemetry,
        Arc::new(MemoryDecisionStore::new()),
    )
}

#[test]
fn test_jank_sample_fraction() {
    assert_eq!(JankSample::default().fraction(), 0.0);
    let s = JankSample { jank: 1, total: 4 };
    assert_eq!(s.fraction(), 0.25);
}

#[test]
fn test_rolling_window_evicts_oldest() {
    let t = RollingTelemetry::new(Duration::from_millis(10), 3);
    t.record_operation(Duration::from_millis(20), 0);
    t.record_operation(Duration::from_millis(1), 0);
    t.record_operation(Duration::from_millis(1), 0);
    assert_eq!(t.query_jank(), JankSample { jank: 1, total: 3 });

    t.record_operation(Duration::from_millis(1), 0);
    assert_eq!(t.query_jank(), JankSample { jank: 0, total: 3 });
}

#[test]
fn test_no_jank_stays_inline() {
    let t = telemetry();
    feed(&t, 0, 50);
    let d = dispatcher(t);
    assert_eq!(d.reevaluate(), DispatchMode::Inline);
    assert_eq!(d.mode_for(8192), DispatchMode::Inline);
}

#[test]
fn test_jank_over_threshold_moves_off_thread() {
    let t = telemetry();
    let d = dispatcher(t.clone());
    assert_eq!(d.current_mode(), DispatchMode::Inline);

    // 2 of 20 = 10% jank
    feed(&t, 2, 20);
    assert_eq!(d.reevaluate(), DispatchMode::OffThread);
    assert_eq!(d.mode_for(8192), DispatchMode::OffThread);
    // small payloads stay inline regardless
    assert_eq!(d.mode_for(16), DispatchMode::Inline);
}

#[test]
fn test_insufficient_samples_stays_inline() {
    let t = telemetry();
    // 100% jank but below min_samples
    feed(&t, 5, 5);
    let d = dispatcher(t);
    assert_eq!(d.reevaluate(), DispatchMode::Inline);
}

#[test]
fn test_exactly_threshold_is_not_over() {
    let t = telemetry();
    // 1 of 20 = 5%, not above
    feed(&t, 1, 20);
    let d = dispatcher(t);
    assert_eq!(d.reevaluate(), DispatchMode::Inline);
}

#[test]
fn test_override_wins() {
    let d = dispatcher(telemetry());
    d.set_override(DispatchOverride::ForceOffThread);
    assert_eq!(d.mode_for(1), DispatchMode::OffThread);
    d.set_override(DispatchOverride::ForceInline);
    assert_eq!(d.mode_for(1 << 20), DispatchMode::Inline);
    d.set_override(DispatchOverride::Auto);
    assert_eq!(d.override_mode(), DispatchOverride::Auto);
}

#[test]
fn test_persisted_decision_revalidated_on_load() {
    let store = Arc::new(MemoryDecisionStore::with_decision(PersistedDecision {
        mode: DispatchMode::OffThread,
        jank: 50,
        total: 100,
        decided_at_ms: 1,
    }));
    // No live samples: the persisted off-thread decision is not trusted.
    let d = AdaptiveCipherDispatcher::new(DispatchConfig::default(), telemetry(), store);
    assert_eq!(d.current_mode(), DispatchMode::Inline);
}

#[test]
fn test_persisted_decision_kept_when_live_agrees() {
    let t = telemetry();
    feed(&t, 10, 40);
    let store = Arc::new(MemoryDecisionStore::new());
    let d = AdaptiveCipherDispatcher::new(DispatchConfig::default(), t, store.clone());
    assert_eq!(d.current_mode(), DispatchMode::OffThread);
}

#[test]
fn test_reevaluate_persists_decision() {
    let store = Arc::new(MemoryDecisionStore::new());
    let t = telemetry();
    feed(&t, 4, 20);
    let d = AdaptiveCipherDispatcher::new(DispatchConfig::default(), t, store.clone());
    d.reevaluate();
    let saved = store.load().unwrap();
    assert_eq!(saved.mode, DispatchMode::OffThread);
    assert_eq!(saved.total, 20);
    assert_eq!(saved.jank, 4);
}

#[test]
fn test_file_store_round_trip() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = FileDecisionStore::new(dir.path().join("dispatch.yaml"));
    assert!(store.load().is_none());

    let decision = PersistedDecision {
        mode: DispatchMode::OffThread,
        jank: 3,
        total: 30,
        decided_at_ms: 42,
    };
    store.save(&decision).unwrap();
    assert_eq!(store.load(), Some(decision));
}

#[test]
fn test_file_store_ignores_corrupt_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("dispatch.yaml");
    std::fs::write(&path, "mode: [not, a, mode").unwrap();
    assert!(FileDecisionStore::new(path).load().is_none());
}

#[tokio::test]
async fn test_inline_and_off_thread_ciphertext_identical() {
    let key = [0x42u8; 32];
    let plaintext = vec![0xabu8; 4096];
    let aad = b"header".to_vec();

    let job = CipherJob::new(CipherOp::Seal, key, 7, plaintext.clone(), aad.clone());
    let direct = job.run().unwrap();

    let d = dispatcher(telemetry());
    d.set_override(DispatchOverride::ForceInline);
    let inline = d.run(job.clone()).await.unwrap();
    d.set_override(DispatchOverride::ForceOffThread);
    let off_thread = d.run(job).await.unwrap();

    assert_eq!(inline, direct);
    assert_eq!(off_thread, direct);
}

#[tokio::test]
async fn test_off_thread_decrypt_matches_cipher_state() {
    let key = [9u8; 32];
    let mut sender = CipherState::new(key);
    let ciphertext = sender.encrypt(b"offload me").unwrap();

    let receiver = CipherState::new(key);
    let job = receiver.open_job(&ciphertext, &[]).unwrap();
    let d = dispatcher(telemetry());
    d.set_override(DispatchOverride::ForceOffThread);
    assert_eq!(d.run(job).await.unwrap(), b"offload me");
}

#[tokio::test]
async fn test_run_records_telemetry_for_large_payloads_only() {
    let t = telemetry();
    let d = dispatcher(t.clone());

    let small = CipherJob::new(CipherOp::Seal, [1; 32], 0, vec![0; 10], Vec::new());
    d.run(small).await.unwrap();
    assert_eq!(t.query_jank().total, 0);

    let large = CipherJob::new(CipherOp::Seal, [1; 32], 0, vec![0; 2048], Vec::new());
    d.run(large).await.unwrap();
    assert_eq!(t.query_jank().total, 1);
}

#[tokio::test]
async fn test_periodic_reevaluation() {
    let t = telemetry();
    let config = DispatchConfig {
        reevaluate_every: 5,
        min_samples: 5,
        ..DispatchConfig::default()
    };
    let d = AdaptiveCipherDispatcher::new(config, t.clone(), Arc::new(MemoryDecisionStore::new()));

    // Pre-load jank that the next automatic evaluation will observe.
    feed(&t, 10, 10);
    assert_eq!(d.current_mode(), DispatchMode::Inline);
    for _ in 0..5 {
        let job = CipherJob::new(CipherOp::Seal, [1; 32], 0, vec![0; 2048], Vec::new());
        d.run(job).await.unwrap();
    }
    assert_eq!(d.current_mode(), DispatchMode::OffThread);
}
