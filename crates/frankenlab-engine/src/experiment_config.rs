//! Experiment configuration data model and fail-closed validation.
//!
//! One [`ExperimentConfig`] describes a single A/B comparison: the two
//! opaque variant references under test, the traffic split, the weighted
//! success criteria, and the auto-promotion gates. Validation never
//! silently corrects a bad field; every rejection names the offending
//! field and carries a stable error code.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Schema version for serialized experiment configurations.
pub const EXPERIMENT_CONFIG_SCHEMA_VERSION: &str = "frankenlab.experiment-config.v1";

/// Fixed metric-bucket window width in seconds (left-closed/right-open).
pub const BUCKET_WIDTH_SECS: i64 = 300;

const ERROR_EMPTY_FIELD: &str = "FL-CONF-0001";
const ERROR_INVALID_PERCENTAGE: &str = "FL-CONF-0002";
const ERROR_EMPTY_STAGE_SCHEDULE: &str = "FL-CONF-0003";
const ERROR_STAGE_NOT_MONOTONIC: &str = "FL-CONF-0004";
const ERROR_FINAL_STAGE_NOT_FULL: &str = "FL-CONF-0005";
const ERROR_EMPTY_TARGET_SET: &str = "FL-CONF-0006";
const ERROR_NO_CRITERIA: &str = "FL-CONF-0007";
const ERROR_INVALID_WEIGHT: &str = "FL-CONF-0008";
const ERROR_INVALID_THRESHOLD: &str = "FL-CONF-0009";
const ERROR_INVALID_MIN_SAMPLES: &str = "FL-CONF-0010";
const ERROR_INVALID_PROMOTION_DELAY: &str = "FL-CONF-0011";
const ERROR_INVALID_SAFETY_CEILING: &str = "FL-CONF-0012";
const ERROR_COMPLETED_WITHOUT_WINNER: &str = "FL-CONF-0013";

// ---------------------------------------------------------------------------
// ExperimentId / Variant
// ---------------------------------------------------------------------------

/// Opaque experiment identifier. Experiments are independent units; every
/// engine operation is addressed by this id (no process-wide singleton).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(pub String);

impl ExperimentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two arms of a comparison. Closed set: the engine only ever compares
/// an incumbent (A) against a single challenger (B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    A,
    B,
}

impl Variant {
    /// Stable string name used in logs and storage keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "variant_a",
            Self::B => "variant_b",
        }
    }

    /// The opposite arm.
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ExperimentStatus
// ---------------------------------------------------------------------------

/// Administrative lifecycle of an experiment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// Authored but not live; the allocator refuses assignment.
    Draft,
    /// Live: traffic is split and evaluation cycles run.
    Active,
    /// Temporarily halted; allocation continues on the last-known split,
    /// evaluation cycles do not start.
    Paused,
    /// Terminal; `winner` must be set.
    Completed,
}

impl ExperimentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Traffic split
// ---------------------------------------------------------------------------

/// How inbound subjects are divided between the two arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    /// Flat hash-based percentage split.
    Percentage,
    /// Staged percentage ramp driven by the promotion state machine.
    Canary,
    /// Region attribute match routes to B; remainder falls back to hash.
    Geographic,
    /// Segment attribute match routes to B; remainder falls back to hash.
    Segment,
}

impl SplitStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Percentage => "percentage",
            Self::Canary => "canary",
            Self::Geographic => "geographic",
            Self::Segment => "segment",
        }
    }
}

impl fmt::Display for SplitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rung of a canary ramp. A stage holds until variant B has accumulated
/// `min_samples` requests (and `min_duration_secs`, when set) at that stage;
/// the final stage has no exit requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryStage {
    /// Percentage of traffic routed to B while this stage is active.
    pub percentage: f64,
    /// Samples B must accumulate before the ramp advances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_samples: Option<u64>,
    /// Minimum wall-clock residence in this stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_duration_secs: Option<i64>,
}

/// Traffic split configuration.
///
/// `variant_b_percentage` is the flat split for the `percentage` strategy
/// and the fallback rule for unmatched subjects under `geographic` /
/// `segment`. For `canary` the effective percentage comes from the active
/// stage of `stage_schedule`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficSplit {
    pub strategy: SplitStrategy,
    pub variant_b_percentage: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stage_schedule: Vec<CanaryStage>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub target_regions: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub target_segments: BTreeSet<String>,
}

impl TrafficSplit {
    /// Flat percentage split.
    pub fn percentage(variant_b_percentage: f64) -> Self {
        Self {
            strategy: SplitStrategy::Percentage,
            variant_b_percentage,
            stage_schedule: Vec::new(),
            target_regions: BTreeSet::new(),
            target_segments: BTreeSet::new(),
        }
    }

    /// The percentage in force for the given canary stage index. Indexes
    /// past the end clamp to the final stage.
    pub fn stage_percentage(&self, stage_index: usize) -> Option<f64> {
        if self.stage_schedule.is_empty() {
            return None;
        }
        let idx = stage_index.min(self.stage_schedule.len() - 1);
        Some(self.stage_schedule[idx].percentage)
    }
}

// ---------------------------------------------------------------------------
// Success criteria
// ---------------------------------------------------------------------------

/// Closed metric taxonomy. `Custom` metrics carry a name and are matched
/// against caller-supplied values; all others are extracted from variant
/// aggregates by the scorer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// p95 latency in milliseconds.
    Latency,
    /// successes / requests.
    SuccessRate,
    /// Cost per request in USD.
    Cost,
    /// Mean quality score over quality-rated requests.
    QualityScore,
    /// Named metric supplied out of band.
    Custom(String),
}

impl MetricKind {
    /// Stable name used in logs, events, and criterion score rows.
    pub fn name(&self) -> &str {
        match self {
            Self::Latency => "latency",
            Self::SuccessRate => "success_rate",
            Self::Cost => "cost",
            Self::QualityScore => "quality_score",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether smaller or larger metric values earn credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    LowerIsBetter,
    HigherIsBetter,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LowerIsBetter => "lower_is_better",
            Self::HigherIsBetter => "higher_is_better",
        }
    }
}

/// One weighted success criterion. Weights need not sum to 1; the scorer
/// normalizes by total weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriterion {
    pub metric: MetricKind,
    pub direction: Direction,
    pub threshold: f64,
    pub weight: f64,
}

// ---------------------------------------------------------------------------
// Auto-promotion gates
// ---------------------------------------------------------------------------

/// Supported confidence levels. Closed set so the two-sided critical value
/// is an exact constant rather than an inverse-CDF call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    #[serde(rename = "0.80")]
    Eighty,
    #[serde(rename = "0.90")]
    Ninety,
    #[serde(rename = "0.95")]
    NinetyFive,
    #[serde(rename = "0.99")]
    NinetyNine,
}

impl ConfidenceLevel {
    /// The level as a fraction.
    pub fn level(self) -> f64 {
        match self {
            Self::Eighty => 0.80,
            Self::Ninety => 0.90,
            Self::NinetyFive => 0.95,
            Self::NinetyNine => 0.99,
        }
    }

    /// Significance threshold: p-values below this reject the null.
    pub fn alpha(self) -> f64 {
        1.0 - self.level()
    }

    /// Two-sided critical value z_{alpha/2}.
    pub fn z_two_sided(self) -> f64 {
        match self {
            Self::Eighty => 1.2816,
            Self::Ninety => 1.6449,
            Self::NinetyFive => 1.9600,
            Self::NinetyNine => 2.5758,
        }
    }
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.level())
    }
}

/// Gating configuration for automatic promotion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoPromoteConfig {
    pub enabled: bool,
    pub confidence_level: ConfidenceLevel,
    pub min_samples_per_variant: u64,
    /// Gates must hold continuously for this long before promotion fires.
    pub promotion_delay_secs: i64,
}

impl Default for AutoPromoteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_level: ConfidenceLevel::NinetyFive,
            min_samples_per_variant: 1_000,
            promotion_delay_secs: 3_600,
        }
    }
}

/// Hard safety ceiling checked before any scoring or significance logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Variant B error-rate ceiling; exceeding it pauses the experiment.
    pub max_error_rate: f64,
    /// Error rate is not evaluated until B has at least this many requests.
    pub min_requests_for_check: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_error_rate: 0.05,
            min_requests_for_check: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// ExperimentConfig
// ---------------------------------------------------------------------------

/// One experiment record. The variant refs are opaque tokens owned by the
/// execution layer; the engine never interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub id: ExperimentId,
    pub name: String,
    pub status: ExperimentStatus,
    pub variant_a_ref: String,
    pub variant_b_ref: String,
    pub traffic_split: TrafficSplit,
    pub success_criteria: Vec<SuccessCriterion>,
    pub auto_promote: AutoPromoteConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    /// Set exactly once, on completion; immutable thereafter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<Variant>,
    /// Wall clock at activation; aggregates default to this lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl ExperimentConfig {
    /// The highest-weight criterion (first wins on ties). Validation
    /// guarantees at least one criterion exists.
    pub fn primary_criterion(&self) -> Option<&SuccessCriterion> {
        self.success_criteria.iter().reduce(|best, c| {
            if c.weight > best.weight { c } else { best }
        })
    }

    /// Fail-closed validation of the whole record.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("id", self.id.as_str()),
            ("name", self.name.as_str()),
            ("variant_a_ref", self.variant_a_ref.as_str()),
            ("variant_b_ref", self.variant_b_ref.as_str()),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyField {
                    field: field.to_string(),
                });
            }
        }

        validate_percentage("traffic_split.variant_b_percentage", self.traffic_split.variant_b_percentage)?;

        match self.traffic_split.strategy {
            SplitStrategy::Canary => {
                let stages = &self.traffic_split.stage_schedule;
                if stages.is_empty() {
                    return Err(ConfigError::EmptyStageSchedule);
                }
                let mut previous = f64::NEG_INFINITY;
                for (index, stage) in stages.iter().enumerate() {
                    validate_percentage("traffic_split.stage_schedule.percentage", stage.percentage)?;
                    if stage.percentage < previous {
                        return Err(ConfigError::StageNotMonotonic { index });
                    }
                    previous = stage.percentage;
                }
                let last = stages[stages.len() - 1].percentage;
                if last < 100.0 {
                    return Err(ConfigError::FinalStageNotFull { percentage: last });
                }
            }
            SplitStrategy::Geographic => {
                if self.traffic_split.target_regions.is_empty() {
                    return Err(ConfigError::EmptyTargetSet {
                        strategy: SplitStrategy::Geographic,
                    });
                }
            }
            SplitStrategy::Segment => {
                if self.traffic_split.target_segments.is_empty() {
                    return Err(ConfigError::EmptyTargetSet {
                        strategy: SplitStrategy::Segment,
                    });
                }
            }
            SplitStrategy::Percentage => {}
        }

        if self.success_criteria.is_empty() {
            return Err(ConfigError::NoCriteria);
        }
        for criterion in &self.success_criteria {
            if !criterion.weight.is_finite() || criterion.weight <= 0.0 {
                return Err(ConfigError::InvalidWeight {
                    metric: criterion.metric.name().to_string(),
                    weight: criterion.weight,
                });
            }
            if !criterion.threshold.is_finite() || criterion.threshold == 0.0 {
                return Err(ConfigError::InvalidThreshold {
                    metric: criterion.metric.name().to_string(),
                    threshold: criterion.threshold,
                });
            }
        }

        if self.auto_promote.min_samples_per_variant == 0 {
            return Err(ConfigError::InvalidMinSamples);
        }
        if self.auto_promote.promotion_delay_secs < 0 {
            return Err(ConfigError::InvalidPromotionDelay {
                secs: self.auto_promote.promotion_delay_secs,
            });
        }

        if !self.safety.max_error_rate.is_finite()
            || !(0.0..=1.0).contains(&self.safety.max_error_rate)
        {
            return Err(ConfigError::InvalidSafetyCeiling {
                value: self.safety.max_error_rate,
            });
        }

        if self.status == ExperimentStatus::Completed && self.winner.is_none() {
            return Err(ConfigError::CompletedWithoutWinner);
        }

        Ok(())
    }
}

fn validate_percentage(field: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(ConfigError::InvalidPercentage {
            field: field.to_string(),
            value,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Malformed configuration. Surfaced synchronously to the submitter with
/// the offending field; never silently corrected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("field `{field}` must be non-empty")]
    EmptyField { field: String },
    #[error("field `{field}` must be a percentage in [0, 100], got {value}")]
    InvalidPercentage { field: String, value: f64 },
    #[error("canary strategy requires a non-empty stage schedule")]
    EmptyStageSchedule,
    #[error("canary stage {index} decreases the ramp percentage")]
    StageNotMonotonic { index: usize },
    #[error("final canary stage must reach 100%, got {percentage}")]
    FinalStageNotFull { percentage: f64 },
    #[error("{strategy} strategy requires a non-empty target set")]
    EmptyTargetSet { strategy: SplitStrategy },
    #[error("at least one success criterion is required")]
    NoCriteria,
    #[error("criterion `{metric}` has non-positive weight {weight}")]
    InvalidWeight { metric: String, weight: f64 },
    #[error("criterion `{metric}` has non-finite or zero threshold {threshold}")]
    InvalidThreshold { metric: String, threshold: f64 },
    #[error("min_samples_per_variant must be positive")]
    InvalidMinSamples,
    #[error("promotion_delay_secs must be non-negative, got {secs}")]
    InvalidPromotionDelay { secs: i64 },
    #[error("safety max_error_rate must be a rate in [0, 1], got {value}")]
    InvalidSafetyCeiling { value: f64 },
    #[error("completed experiment must have a winner")]
    CompletedWithoutWinner,
}

impl ConfigError {
    /// Stable machine-readable error code.
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::EmptyField { .. } => ERROR_EMPTY_FIELD,
            Self::InvalidPercentage { .. } => ERROR_INVALID_PERCENTAGE,
            Self::EmptyStageSchedule => ERROR_EMPTY_STAGE_SCHEDULE,
            Self::StageNotMonotonic { .. } => ERROR_STAGE_NOT_MONOTONIC,
            Self::FinalStageNotFull { .. } => ERROR_FINAL_STAGE_NOT_FULL,
            Self::EmptyTargetSet { .. } => ERROR_EMPTY_TARGET_SET,
            Self::NoCriteria => ERROR_NO_CRITERIA,
            Self::InvalidWeight { .. } => ERROR_INVALID_WEIGHT,
            Self::InvalidThreshold { .. } => ERROR_INVALID_THRESHOLD,
            Self::InvalidMinSamples => ERROR_INVALID_MIN_SAMPLES,
            Self::InvalidPromotionDelay { .. } => ERROR_INVALID_PROMOTION_DELAY,
            Self::InvalidSafetyCeiling { .. } => ERROR_INVALID_SAFETY_CEILING,
            Self::CompletedWithoutWinner => ERROR_COMPLETED_WITHOUT_WINNER,
        }
    }
}
