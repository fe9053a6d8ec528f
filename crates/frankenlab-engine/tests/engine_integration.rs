#![forbid(unsafe_code)]
//! End-to-end scenarios over the engine boundary: ingestion through
//! evaluation to promotion, restart durability, and the concurrency
//! contract (ingestion under many writers, allocation never blocked).

use std::sync::Arc;
use std::thread;

use chrono::{DateTime, TimeZone, Utc};
use frankenlab_engine::engine::{ExperimentConfigPatch, ExperimentEngine};
use frankenlab_engine::experiment_config::{
    AutoPromoteConfig, CanaryStage, ConfidenceLevel, Direction, ExperimentConfig, ExperimentId,
    ExperimentStatus, MetricKind, SafetyConfig, SplitStrategy, SuccessCriterion, TrafficSplit,
    Variant,
};
use frankenlab_engine::metrics_aggregator::OutcomeEvent;
use frankenlab_engine::promotion::{DecisionAction, ExperimentState};
use frankenlab_engine::storage_adapter::InMemoryStorageAdapter;
use frankenlab_engine::traffic_allocator::SubjectAttributes;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("valid timestamp")
}

fn outcome(secs: i64, success: bool, latency_ms: f64) -> OutcomeEvent {
    OutcomeEvent {
        event_id: None,
        timestamp: at(secs),
        success,
        latency_ms,
        cost_usd: 0.002,
        quality_score: Some(0.9),
    }
}

fn config(id: &str) -> ExperimentConfig {
    ExperimentConfig {
        id: ExperimentId::new(id),
        name: format!("{id} rollout"),
        status: ExperimentStatus::Active,
        variant_a_ref: "prompt-v1".to_string(),
        variant_b_ref: "prompt-v2".to_string(),
        traffic_split: TrafficSplit::percentage(50.0),
        success_criteria: vec![SuccessCriterion {
            metric: MetricKind::SuccessRate,
            direction: Direction::HigherIsBetter,
            threshold: 0.95,
            weight: 1.0,
        }],
        auto_promote: AutoPromoteConfig {
            enabled: true,
            confidence_level: ConfidenceLevel::NinetyFive,
            min_samples_per_variant: 2_000,
            promotion_delay_secs: 0,
        },
        safety: SafetyConfig::default(),
        winner: None,
        started_at: None,
    }
}

fn feed(
    engine: &ExperimentEngine,
    id: &ExperimentId,
    variant: Variant,
    successes: u64,
    errors: u64,
    secs: i64,
) {
    for _ in 0..successes {
        engine
            .record(id, variant, &outcome(secs, true, 120.0), at(secs))
            .expect("record");
    }
    for _ in 0..errors {
        engine
            .record(id, variant, &outcome(secs, false, 480.0), at(secs))
            .expect("record");
    }
}

#[test]
fn textbook_promotion_end_to_end() {
    let engine = ExperimentEngine::new();
    engine.create_experiment(config("exp-e2e"), at(0)).expect("create");
    let id = ExperimentId::new("exp-e2e");

    feed(&engine, &id, Variant::A, 9_700, 300, 10);
    feed(&engine, &id, Variant::B, 9_850, 150, 10);

    let cycle = engine.run_evaluation_cycle(&id, at(700)).expect("cycle");
    assert_eq!(cycle.decision.action, DecisionAction::PromoteB);
    assert!(cycle.decision.is_significant);
    assert!(cycle.decision.p_value.expect("p-value") < 0.05);
    assert!(cycle.decision.variant_b_score > cycle.decision.variant_a_score);
    assert_eq!(cycle.decision.samples_a, 10_000);
    assert_eq!(cycle.decision.samples_b, 10_000);

    let rewrite = cycle.split_rewrite.expect("split rewrite");
    assert_eq!(rewrite.variant_b_percentage, 100.0);

    let status = engine.get_status(&id, at(710)).expect("status");
    assert_eq!(status.status, ExperimentStatus::Completed);
    assert_eq!(status.winner, Some(Variant::B));
}

#[test]
fn insufficient_samples_scenario_continues() {
    let engine = ExperimentEngine::new();
    engine.create_experiment(config("exp-small"), at(0)).expect("create");
    let id = ExperimentId::new("exp-small");

    feed(&engine, &id, Variant::A, 48, 2, 10);
    feed(&engine, &id, Variant::B, 49, 1, 10);

    let cycle = engine.run_evaluation_cycle(&id, at(700)).expect("cycle");
    assert_eq!(cycle.decision.action, DecisionAction::Continue);
    assert_eq!(cycle.decision.reason, "insufficient_samples");
    let status = engine.get_status(&id, at(710)).expect("status");
    assert_eq!(status.state, ExperimentState::Collecting);
    assert_eq!(status.winner, None);
}

#[test]
fn safety_rollback_scenario_pauses_within_one_cycle() {
    let engine = ExperimentEngine::new();
    engine.create_experiment(config("exp-spike"), at(0)).expect("create");
    let id = ExperimentId::new("exp-spike");

    // B healthy at first, then an 8% error-rate spike mid-test.
    feed(&engine, &id, Variant::A, 2_000, 20, 10);
    feed(&engine, &id, Variant::B, 1_900, 20, 10);
    feed(&engine, &id, Variant::B, 0, 160, 400);

    let cycle = engine.run_evaluation_cycle(&id, at(1_000)).expect("cycle");
    assert!(cycle.safety_tripped);
    assert_eq!(cycle.decision.action, DecisionAction::RequireManualReview);

    let status = engine.get_status(&id, at(1_010)).expect("status");
    assert_eq!(status.status, ExperimentStatus::Paused);
    let alert = status.safety_alert.expect("alert");
    assert!(alert.error_rate > 0.05);

    // Promotion state and safety stop never block the allocation path.
    engine
        .assign(&id, "user-any", &SubjectAttributes::default())
        .expect("assign");
}

#[test]
fn canary_staging_scenario_advances_percentages() {
    let mut config = config("exp-canary");
    config.traffic_split = TrafficSplit {
        strategy: SplitStrategy::Canary,
        variant_b_percentage: 0.0,
        stage_schedule: vec![
            CanaryStage { percentage: 1.0, min_samples: Some(100), min_duration_secs: None },
            CanaryStage { percentage: 25.0, min_samples: Some(1_000), min_duration_secs: None },
            CanaryStage { percentage: 100.0, min_samples: None, min_duration_secs: None },
        ],
        target_regions: Default::default(),
        target_segments: Default::default(),
    };
    engine_canary_flow(config);
}

fn engine_canary_flow(config: ExperimentConfig) {
    let engine = ExperimentEngine::new();
    let id = config.id.clone();
    engine.create_experiment(config, at(0)).expect("create");

    let before = engine.get_status(&id, at(10)).expect("status");
    assert_eq!(before.active_stage, 0);
    assert_eq!(before.effective_variant_b_percentage, 1.0);

    // 120 B samples at stage one, no safety violation.
    feed(&engine, &id, Variant::A, 500, 5, 10);
    feed(&engine, &id, Variant::B, 119, 1, 10);

    let cycle = engine.run_evaluation_cycle(&id, at(700)).expect("cycle");
    assert!(cycle.stage_advanced);

    let after = engine.get_status(&id, at(710)).expect("status");
    assert_eq!(after.active_stage, 1);
    assert_eq!(after.effective_variant_b_percentage, 25.0);
}

#[test]
fn restart_preserves_decisions_and_stickiness() {
    let engine = ExperimentEngine::new();
    engine.create_experiment(config("exp-restart"), at(0)).expect("create");
    let id = ExperimentId::new("exp-restart");

    feed(&engine, &id, Variant::A, 9_700, 300, 10);
    feed(&engine, &id, Variant::B, 9_850, 150, 10);
    let cycle = engine.run_evaluation_cycle(&id, at(700)).expect("cycle");
    assert_eq!(cycle.decision.action, DecisionAction::PromoteB);

    let mut adapter = InMemoryStorageAdapter::new();
    engine.persist(&id, &mut adapter, at(700)).expect("persist");

    let restored = ExperimentEngine::restore(&mut adapter, at(900)).expect("restore");
    let status = restored.get_status(&id, at(900)).expect("status");
    assert_eq!(status.state, ExperimentState::Promoted);
    assert_eq!(status.winner, Some(Variant::B));
    assert_eq!(status.samples_a, 10_000);

    // The promotion effect stays retrievable after the restart.
    let pending = restored
        .pending_split_rewrite(&id)
        .expect("query")
        .expect("pending rewrite");
    assert_eq!(pending.variant_b_percentage, 100.0);

    // Terminal state routes all traffic to the winner, before and after.
    for i in 0..50 {
        let key = format!("user-{i}");
        assert_eq!(
            engine.assign(&id, &key, &SubjectAttributes::default()).expect("assign"),
            restored.assign(&id, &key, &SubjectAttributes::default()).expect("assign"),
        );
    }
}

#[test]
fn concurrent_ingestion_and_allocation_do_not_interfere() {
    let engine = Arc::new(ExperimentEngine::new());
    engine.create_experiment(config("exp-conc"), at(0)).expect("create");
    let id = ExperimentId::new("exp-conc");

    let writers: Vec<_> = (0..8)
        .map(|w| {
            let engine = Arc::clone(&engine);
            let id = id.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    let variant = if (w + i) % 2 == 0 { Variant::A } else { Variant::B };
                    engine
                        .record(&id, variant, &outcome(10, true, 90.0), at(20))
                        .expect("record");
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..4)
        .map(|r| {
            let engine = Arc::clone(&engine);
            let id = id.clone();
            thread::spawn(move || {
                for i in 0..2_000 {
                    engine
                        .assign(&id, &format!("user-{r}-{i}"), &SubjectAttributes::default())
                        .expect("assign");
                }
            })
        })
        .collect();

    for handle in writers {
        handle.join().expect("writer thread");
    }
    for handle in readers {
        handle.join().expect("reader thread");
    }

    let status = engine.get_status(&id, at(700)).expect("status");
    assert_eq!(status.samples_a + status.samples_b, 8 * 500);
}

#[test]
fn exported_aggregates_round_trip_for_external_snapshots() {
    let engine = ExperimentEngine::new();
    engine.create_experiment(config("exp-export"), at(0)).expect("create");
    let id = ExperimentId::new("exp-export");

    feed(&engine, &id, Variant::B, 30, 2, 10);

    // While the bucket is open, only the provisional view sees data.
    let closed_only = engine
        .get_aggregate(&id, Variant::B, at(20), false)
        .expect("aggregate");
    assert_eq!(closed_only.request_count, 0);
    let provisional = engine
        .get_aggregate(&id, Variant::B, at(20), true)
        .expect("aggregate");
    assert_eq!(provisional.request_count, 32);
    assert!(provisional.provisional);

    // Closed aggregates serialize for out-of-process decision gates.
    let closed = engine
        .get_aggregate(&id, Variant::B, at(700), false)
        .expect("aggregate");
    assert!(!closed.provisional);
    let json = serde_json::to_string(&closed).expect("serialize");
    let back: frankenlab_engine::metrics_aggregator::VariantAggregate =
        serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, closed);
}

#[test]
fn manual_override_beats_every_gate() {
    let engine = ExperimentEngine::new();
    engine.create_experiment(config("exp-manual"), at(0)).expect("create");
    let id = ExperimentId::new("exp-manual");

    // No data at all; gates would never fire on their own.
    let rewrite = engine.force_promote(&id, Variant::B, at(50)).expect("force");
    assert_eq!(rewrite.variant_b_percentage, 100.0);

    let status = engine.get_status(&id, at(60)).expect("status");
    assert_eq!(status.status, ExperimentStatus::Completed);
    assert_eq!(status.state, ExperimentState::Promoted);
    assert_eq!(status.winner, Some(Variant::B));

    // Config is immutable after the terminal transition.
    let patch = ExperimentConfigPatch {
        name: Some("too late".to_string()),
        ..Default::default()
    };
    engine.update_config(&id, &patch).expect_err("terminal");
}
