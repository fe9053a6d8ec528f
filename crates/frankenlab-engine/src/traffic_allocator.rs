//! Deterministic traffic assignment.
//!
//! Maps a subject key to variant A or B as a pure function of
//! `(experiment id, subject key, split config)`: SHA-256 of the pair is
//! folded to the unit interval and compared against the configured
//! percentage. No in-memory random state, so the mapping is stable for
//! the lifetime of the experiment and across process restarts, and the
//! empirical split converges to the configured percentage as the subject
//! population grows.
//!
//! Attribute-targeted strategies (geographic / segment) short-circuit to
//! B on a target-set match before the hash rule handles the remainder.
//! Canary stage state is owned by the promotion state machine; the
//! allocator only reads the active stage index passed in.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::experiment_config::{
    ConfigError, ExperimentConfig, ExperimentStatus, SplitStrategy, Variant,
};

const ERROR_CONFIG: &str = "FL-ALLO-0001";
const ERROR_NOT_LIVE: &str = "FL-ALLO-0002";

// ---------------------------------------------------------------------------
// SubjectAttributes
// ---------------------------------------------------------------------------

/// Routing attributes of an inbound subject. Absent attributes never match
/// a target set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<String>,
}

impl SubjectAttributes {
    pub fn with_region(region: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            segment: None,
        }
    }

    pub fn with_segment(segment: impl Into<String>) -> Self {
        Self {
            region: None,
            segment: Some(segment.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// AllocationError
// ---------------------------------------------------------------------------

/// Allocation-path failures. Fail safe: the caller receives no assignment
/// and decides; the allocator never picks a variant arbitrarily.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AllocationError {
    #[error("malformed experiment config: {0}")]
    Config(#[from] ConfigError),
    #[error("experiment `{experiment_id}` is {status}; no traffic is allocated")]
    ExperimentNotLive {
        experiment_id: String,
        status: ExperimentStatus,
    },
}

impl AllocationError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::Config(_) => ERROR_CONFIG,
            Self::ExperimentNotLive { .. } => ERROR_NOT_LIVE,
        }
    }
}

// ---------------------------------------------------------------------------
// Assignment
// ---------------------------------------------------------------------------

/// Fold `(experiment id, subject key)` onto [0, 1) with a uniform hash.
///
/// SHA-256 keeps the fold stable across platforms and releases; the first
/// eight digest bytes are read big-endian.
pub fn unit_interval(experiment_id: &str, subject_key: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(experiment_id.as_bytes());
    hasher.update(b":");
    hasher.update(subject_key.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) as f64 / (u64::MAX as f64 + 1.0)
}

/// Assign a subject to an arm.
///
/// `active_stage` is the canary stage index currently in force (ignored
/// for other strategies). Draft experiments never receive traffic;
/// completed experiments route every subject to the recorded winner;
/// paused experiments keep allocating on the last-known split so a stalled
/// evaluator never stalls traffic.
pub fn assign(
    config: &ExperimentConfig,
    subject_key: &str,
    attributes: &SubjectAttributes,
    active_stage: usize,
) -> Result<Variant, AllocationError> {
    config.validate()?;

    match config.status {
        ExperimentStatus::Draft => {
            return Err(AllocationError::ExperimentNotLive {
                experiment_id: config.id.as_str().to_string(),
                status: config.status,
            });
        }
        ExperimentStatus::Completed => {
            // validate() guarantees a winner on completed records.
            if let Some(winner) = config.winner {
                return Ok(winner);
            }
        }
        ExperimentStatus::Active | ExperimentStatus::Paused => {}
    }

    let split = &config.traffic_split;
    match split.strategy {
        SplitStrategy::Geographic => {
            if let Some(region) = &attributes.region
                && split.target_regions.contains(region)
            {
                return Ok(Variant::B);
            }
        }
        SplitStrategy::Segment => {
            if let Some(segment) = &attributes.segment
                && split.target_segments.contains(segment)
            {
                return Ok(Variant::B);
            }
        }
        SplitStrategy::Percentage | SplitStrategy::Canary => {}
    }

    let percentage = match split.strategy {
        SplitStrategy::Canary => split
            .stage_percentage(active_stage)
            .unwrap_or(split.variant_b_percentage),
        _ => split.variant_b_percentage,
    };

    let unit = unit_interval(config.id.as_str(), subject_key);
    if unit < percentage / 100.0 {
        Ok(Variant::B)
    } else {
        Ok(Variant::A)
    }
}

/// Fraction of `subject_keys` the hash rule sends to B. Convergence
/// diagnostics only; production allocation goes through [`assign`].
pub fn empirical_b_fraction<'a>(
    config: &ExperimentConfig,
    subject_keys: impl IntoIterator<Item = &'a str>,
) -> Result<f64, AllocationError> {
    let mut total = 0u64;
    let mut to_b = 0u64;
    for key in subject_keys {
        total += 1;
        if assign(config, key, &SubjectAttributes::default(), 0)? == Variant::B {
            to_b += 1;
        }
    }
    if total == 0 {
        return Ok(0.0);
    }
    Ok(to_b as f64 / total as f64)
}
