//! Weighted multi-metric scoring of variant aggregates.
//!
//! Each success criterion extracts one actual value from the aggregate
//! (latency reads the p95, success rate and cost divide by requests,
//! quality divides by rated requests), normalizes it against its
//! threshold, and contributes `normalized * weight` to the composite.
//! Normalized values are clamped at zero but deliberately not capped at
//! one: a variant that beats its threshold keeps accumulating credit in
//! proportion to the margin.
//!
//! A criterion whose denominator is empty (no requests, no quality
//! ratings, unknown custom metric) contributes zero instead of faulting:
//! missing data reads as "not yet satisfied".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::experiment_config::{Direction, MetricKind, SuccessCriterion, Variant};
use crate::metrics_aggregator::VariantAggregate;

const ERROR_ZERO_TOTAL_WEIGHT: &str = "FL-SCOR-0001";

// ---------------------------------------------------------------------------
// Score artifacts
// ---------------------------------------------------------------------------

/// Per-criterion scoring row, kept for status snapshots and decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub metric: String,
    pub direction: Direction,
    pub threshold: f64,
    pub weight: f64,
    /// Extracted metric value; `None` when the aggregate has no data for it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<f64>,
    /// Clamped-at-zero, uncapped-above-one normalized value.
    pub normalized: f64,
}

impl CriterionScore {
    /// Full credit means the threshold itself is met or beaten.
    pub fn at_full_credit(&self) -> bool {
        self.actual.is_some() && self.normalized >= 1.0
    }
}

/// Weighted composite for one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeScore {
    pub variant: Variant,
    pub composite: f64,
    pub criteria: Vec<CriterionScore>,
}

/// Outcome of comparing two composites. Exact equality is a tie and a
/// tie never promotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    VariantA,
    VariantB,
    Tie,
}

impl Winner {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VariantA => "variant_a",
            Self::VariantB => "variant_b",
            Self::Tie => "tie",
        }
    }
}

// ---------------------------------------------------------------------------
// ScorerError
// ---------------------------------------------------------------------------

/// Scoring is total except for degenerate weight configuration, which is
/// a configuration error, never silently corrected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScorerError {
    #[error("success criteria weights sum to zero")]
    ZeroTotalWeight,
}

impl ScorerError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::ZeroTotalWeight => ERROR_ZERO_TOTAL_WEIGHT,
        }
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Extract the actual value a criterion reads from an aggregate.
///
/// `custom_values` carries caller-supplied named metrics; a custom
/// criterion without a supplied value reads as absent.
pub fn criterion_actual(
    criterion: &SuccessCriterion,
    aggregate: &VariantAggregate,
    custom_values: &BTreeMap<String, f64>,
) -> Option<f64> {
    match &criterion.metric {
        MetricKind::Latency => aggregate.latency_p95(),
        MetricKind::SuccessRate => aggregate.success_rate(),
        MetricKind::Cost => aggregate.cost_per_request(),
        MetricKind::QualityScore => aggregate.quality_mean(),
        MetricKind::Custom(name) => custom_values.get(name).copied(),
    }
}

/// Normalize an actual value against its threshold.
///
/// Lower-is-better: `max(0, (threshold - actual) / threshold)`.
/// Higher-is-better: `max(0, actual / threshold)`.
pub fn normalize(direction: Direction, threshold: f64, actual: f64) -> f64 {
    let raw = match direction {
        Direction::LowerIsBetter => (threshold - actual) / threshold,
        Direction::HigherIsBetter => actual / threshold,
    };
    if raw.is_finite() { raw.max(0.0) } else { 0.0 }
}

/// Score one variant's aggregate against the criteria list.
pub fn score_variant(
    variant: Variant,
    criteria: &[SuccessCriterion],
    aggregate: &VariantAggregate,
    custom_values: &BTreeMap<String, f64>,
) -> Result<CompositeScore, ScorerError> {
    let total_weight: f64 = criteria.iter().map(|c| c.weight).sum();
    if total_weight <= 0.0 || !total_weight.is_finite() {
        return Err(ScorerError::ZeroTotalWeight);
    }

    let mut rows = Vec::with_capacity(criteria.len());
    let mut weighted_sum = 0.0;
    for criterion in criteria {
        let actual = criterion_actual(criterion, aggregate, custom_values);
        let normalized = match actual {
            Some(value) => normalize(criterion.direction, criterion.threshold, value),
            None => 0.0,
        };
        weighted_sum += normalized * criterion.weight;
        rows.push(CriterionScore {
            metric: criterion.metric.name().to_string(),
            direction: criterion.direction,
            threshold: criterion.threshold,
            weight: criterion.weight,
            actual,
            normalized,
        });
    }

    Ok(CompositeScore {
        variant,
        composite: weighted_sum / total_weight,
        criteria: rows,
    })
}

/// Strict comparison: B must exceed A to win; exact equality is a tie.
pub fn determine_winner(score_a: f64, score_b: f64) -> Winner {
    if score_b > score_a {
        Winner::VariantB
    } else if score_a > score_b {
        Winner::VariantA
    } else {
        Winner::Tie
    }
}
