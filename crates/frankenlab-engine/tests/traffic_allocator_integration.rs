#![forbid(unsafe_code)]
//! Integration tests for deterministic traffic assignment: stickiness,
//! convergence, and strategy overrides exercised from outside the crate.

use std::collections::BTreeSet;

use frankenlab_engine::experiment_config::{
    AutoPromoteConfig, CanaryStage, Direction, ExperimentConfig, ExperimentId, ExperimentStatus,
    MetricKind, SafetyConfig, SplitStrategy, SuccessCriterion, TrafficSplit,
};
use frankenlab_engine::traffic_allocator::{
    SubjectAttributes, assign, empirical_b_fraction, unit_interval,
};

fn base_config(id: &str, split: TrafficSplit) -> ExperimentConfig {
    ExperimentConfig {
        id: ExperimentId::new(id),
        name: "allocation integration".to_string(),
        status: ExperimentStatus::Active,
        variant_a_ref: "model-a".to_string(),
        variant_b_ref: "model-b".to_string(),
        traffic_split: split,
        success_criteria: vec![SuccessCriterion {
            metric: MetricKind::SuccessRate,
            direction: Direction::HigherIsBetter,
            threshold: 0.9,
            weight: 1.0,
        }],
        auto_promote: AutoPromoteConfig::default(),
        safety: SafetyConfig::default(),
        winner: None,
        started_at: None,
    }
}

#[test]
fn unit_interval_is_uniformly_spread() {
    // Crude uniformity check: ten equal-width cells over 10k keys.
    let mut cells = [0u32; 10];
    for i in 0..10_000 {
        let unit = unit_interval("exp-uniform", &format!("subject-{i}"));
        assert!((0.0..1.0).contains(&unit));
        cells[(unit * 10.0) as usize] += 1;
    }
    for count in cells {
        assert!(
            (700..=1_300).contains(&count),
            "cell count {count} far from uniform"
        );
    }
}

#[test]
fn convergence_holds_across_percentages() {
    for percentage in [5.0, 25.0, 50.0, 90.0] {
        let config = base_config("exp-conv", TrafficSplit::percentage(percentage));
        let keys: Vec<String> = (0..20_000).map(|i| format!("user-{i}")).collect();
        let fraction = empirical_b_fraction(&config, keys.iter().map(String::as_str))
            .expect("fraction");
        assert!(
            (fraction - percentage / 100.0).abs() < 0.02,
            "fraction {fraction} vs configured {percentage}%"
        );
    }
}

#[test]
fn stickiness_survives_config_field_changes() {
    // Percentage stays fixed; unrelated edits must not reshuffle users.
    let config = base_config("exp-sticky", TrafficSplit::percentage(40.0));
    let mut renamed = config.clone();
    renamed.name = "renamed".to_string();
    renamed.variant_b_ref = "model-b-v2".to_string();

    for i in 0..1_000 {
        let key = format!("user-{i}");
        let before = assign(&config, &key, &SubjectAttributes::default(), 0).expect("assign");
        let after = assign(&renamed, &key, &SubjectAttributes::default(), 0).expect("assign");
        assert_eq!(before, after);
    }
}

#[test]
fn geographic_targeting_composes_with_hash_fallback() {
    let mut split = TrafficSplit::percentage(50.0);
    split.strategy = SplitStrategy::Geographic;
    split.target_regions = BTreeSet::from(["eu-west".to_string(), "eu-north".to_string()]);
    let config = base_config("exp-geo", split);

    // Targeted regions always land in B.
    for i in 0..200 {
        let key = format!("user-{i}");
        let variant = assign(
            &config,
            &key,
            &SubjectAttributes::with_region("eu-north"),
            0,
        )
        .expect("assign");
        assert_eq!(variant.as_str(), "variant_b");
    }

    // The remainder follows the 50% hash rule.
    let mut to_b = 0u32;
    for i in 0..2_000 {
        let key = format!("user-{i}");
        let variant = assign(&config, &key, &SubjectAttributes::with_region("us-east"), 0)
            .expect("assign");
        if variant.as_str() == "variant_b" {
            to_b += 1;
        }
    }
    let fraction = f64::from(to_b) / 2_000.0;
    assert!((fraction - 0.5).abs() < 0.05);
}

#[test]
fn canary_ramp_percentages_apply_per_stage() {
    let split = TrafficSplit {
        strategy: SplitStrategy::Canary,
        variant_b_percentage: 0.0,
        stage_schedule: vec![
            CanaryStage { percentage: 1.0, min_samples: Some(100), min_duration_secs: None },
            CanaryStage { percentage: 25.0, min_samples: Some(1_000), min_duration_secs: None },
            CanaryStage { percentage: 100.0, min_samples: None, min_duration_secs: None },
        ],
        target_regions: BTreeSet::new(),
        target_segments: BTreeSet::new(),
    };
    let config = base_config("exp-ramp", split);
    let keys: Vec<String> = (0..20_000).map(|i| format!("user-{i}")).collect();

    for (stage, expected) in [(0usize, 0.01), (1, 0.25), (2, 1.0)] {
        let mut to_b = 0u32;
        for key in &keys {
            if assign(&config, key, &SubjectAttributes::default(), stage)
                .expect("assign")
                .as_str()
                == "variant_b"
            {
                to_b += 1;
            }
        }
        let fraction = f64::from(to_b) / keys.len() as f64;
        assert!(
            (fraction - expected).abs() < 0.02,
            "stage {stage}: fraction {fraction} vs expected {expected}"
        );
    }
}

#[test]
fn subjects_that_upgrade_stages_never_leave_variant_b() {
    // A subject assigned to B at 1% must still be in B at 25% and 100%:
    // the hash rule is a threshold on a fixed per-subject value.
    let split = TrafficSplit {
        strategy: SplitStrategy::Canary,
        variant_b_percentage: 0.0,
        stage_schedule: vec![
            CanaryStage { percentage: 1.0, min_samples: Some(10), min_duration_secs: None },
            CanaryStage { percentage: 25.0, min_samples: Some(10), min_duration_secs: None },
            CanaryStage { percentage: 100.0, min_samples: None, min_duration_secs: None },
        ],
        target_regions: BTreeSet::new(),
        target_segments: BTreeSet::new(),
    };
    let config = base_config("exp-monotone", split);

    for i in 0..5_000 {
        let key = format!("user-{i}");
        let at_one = assign(&config, &key, &SubjectAttributes::default(), 0).expect("assign");
        if at_one.as_str() == "variant_b" {
            for stage in 1..3 {
                let later = assign(&config, &key, &SubjectAttributes::default(), stage)
                    .expect("assign");
                assert_eq!(later, at_one, "stage widening must keep earlier B subjects");
            }
        }
    }
}
