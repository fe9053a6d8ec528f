//! Keyed experiment store and the engine's public boundary.
//!
//! Every experiment is addressed explicitly by id; there is no
//! process-wide singleton, so concurrent experiments never interfere.
//! Each entry carries its own locks:
//!
//! - the config behind a `RwLock`, read by the allocation path
//! - the aggregator behind a `Mutex`, serializing ingestion per
//!   experiment (which subsumes per-bucket atomicity)
//! - the state machine behind a `Mutex`, taken only by low-frequency
//!   evaluation cycles and admin commands
//! - the active canary stage in an atomic, so allocation reads it
//!   without touching the evaluation locks
//!
//! No method holds two entry locks at once. Allocation takes the config
//! read lock plus the stage atomic and nothing else: a stalled evaluator
//! cannot stall traffic. Evaluation clones a consistent aggregate
//! snapshot out of the ingestion lock before it computes anything.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::experiment_config::{
    AutoPromoteConfig, ConfigError, ExperimentConfig, ExperimentId, ExperimentStatus,
    SafetyConfig, SplitStrategy, SuccessCriterion, TrafficSplit, Variant,
};
use crate::metrics_aggregator::{
    AggregatorError, MetricBucket, MetricsAggregator, OutcomeEvent, RecordOutcome,
    VariantAggregate,
};
use crate::promotion::{
    CycleOutcome, ExperimentState, PromotionDecision, PromotionError, PromotionStateMachine,
    SafetyAlert, SplitRewrite,
};
use crate::storage_adapter::{StorageAdapter, StorageError, StoreKind, StoreQuery};
use crate::traffic_allocator::{self, AllocationError, SubjectAttributes};

/// Schema version for status snapshots.
pub const EXPERIMENT_STATUS_SCHEMA_VERSION: &str = "frankenlab.experiment-status.v1";

const ERROR_NOT_FOUND: &str = "FL-ENG-0001";
const ERROR_ALREADY_EXISTS: &str = "FL-ENG-0002";
const ERROR_CONFIG: &str = "FL-ENG-0003";
const ERROR_ALLOCATION: &str = "FL-ENG-0004";
const ERROR_NOT_ACTIVE: &str = "FL-ENG-0005";
const ERROR_TERMINAL: &str = "FL-ENG-0006";
const ERROR_AGGREGATOR: &str = "FL-ENG-0007";
const ERROR_PROMOTION: &str = "FL-ENG-0008";
const ERROR_STORAGE: &str = "FL-ENG-0009";
const ERROR_SERIALIZATION: &str = "FL-ENG-0010";
const ERROR_LOCK_POISONED: &str = "FL-ENG-0011";

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Boundary error taxonomy. Allocation-path failures mean "no assignment
/// made"; evaluation-path failures mean "state unchanged, retry next
/// cadence tick".
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("experiment `{experiment_id}` not found")]
    NotFound { experiment_id: String },
    #[error("experiment `{experiment_id}` already exists")]
    AlreadyExists { experiment_id: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error("experiment `{experiment_id}` is {status}; operation requires an active experiment")]
    NotActive {
        experiment_id: String,
        status: ExperimentStatus,
    },
    #[error("experiment `{experiment_id}` is terminal; configuration is immutable")]
    TerminalExperiment { experiment_id: String },
    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
    #[error(transparent)]
    Promotion(#[from] PromotionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("serialization failure: {detail}")]
    Serialization { detail: String },
    #[error("internal lock poisoned; experiment state is suspect")]
    LockPoisoned,
}

impl EngineError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => ERROR_NOT_FOUND,
            Self::AlreadyExists { .. } => ERROR_ALREADY_EXISTS,
            Self::Config(_) => ERROR_CONFIG,
            Self::Allocation(_) => ERROR_ALLOCATION,
            Self::NotActive { .. } => ERROR_NOT_ACTIVE,
            Self::TerminalExperiment { .. } => ERROR_TERMINAL,
            Self::Aggregator(_) => ERROR_AGGREGATOR,
            Self::Promotion(_) => ERROR_PROMOTION,
            Self::Storage(_) => ERROR_STORAGE,
            Self::Serialization { .. } => ERROR_SERIALIZATION,
            Self::LockPoisoned => ERROR_LOCK_POISONED,
        }
    }
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

/// Read-only view polled by dashboards. No side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStatusSnapshot {
    pub schema_version: String,
    pub experiment_id: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub state: ExperimentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<Variant>,
    pub active_stage: usize,
    /// The percentage currently steering the hash rule.
    pub effective_variant_b_percentage: f64,
    pub samples_a: u64,
    pub samples_b: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_decision: Option<PromotionDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_alert: Option<SafetyAlert>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted_reason: Option<String>,
    /// Set while evaluation cycles are failing; allocation is unaffected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_stalled_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria_first_met_at: Option<DateTime<Utc>>,
    pub generated_at: DateTime<Utc>,
}

/// Patchable subset of the configuration. Identity fields (id, variant
/// refs) and outcome fields (status, winner) are deliberately absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_split: Option<TrafficSplit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_criteria: Option<Vec<SuccessCriterion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_promote: Option<AutoPromoteConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety: Option<SafetyConfig>,
}

// ---------------------------------------------------------------------------
// ExperimentEntry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ExperimentEntry {
    config: RwLock<ExperimentConfig>,
    aggregator: Mutex<MetricsAggregator>,
    machine: Mutex<PromotionStateMachine>,
    /// Mirrors the state machine's canary stage for the allocation path.
    active_stage: AtomicUsize,
    custom_metrics: Mutex<BTreeMap<Variant, BTreeMap<String, f64>>>,
    evaluation_stalled_since: Mutex<Option<DateTime<Utc>>>,
}

impl ExperimentEntry {
    fn new(config: ExperimentConfig) -> Self {
        Self {
            config: RwLock::new(config),
            aggregator: Mutex::new(MetricsAggregator::new()),
            machine: Mutex::new(PromotionStateMachine::new()),
            active_stage: AtomicUsize::new(0),
            custom_metrics: Mutex::new(BTreeMap::new()),
            evaluation_stalled_since: Mutex::new(None),
        }
    }
}

// ---------------------------------------------------------------------------
// ExperimentEngine
// ---------------------------------------------------------------------------

/// The engine: a keyed store of independent experiments.
#[derive(Debug, Default)]
pub struct ExperimentEngine {
    experiments: RwLock<BTreeMap<ExperimentId, Arc<ExperimentEntry>>>,
}

impl ExperimentEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, experiment_id: &ExperimentId) -> Result<Arc<ExperimentEntry>, EngineError> {
        self.experiments
            .read()
            .map_err(|_| EngineError::LockPoisoned)?
            .get(experiment_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                experiment_id: experiment_id.as_str().to_string(),
            })
    }

    pub fn experiment_ids(&self) -> Vec<ExperimentId> {
        self.experiments
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    // -- lifecycle --------------------------------------------------------

    /// Register a new experiment. The config is validated fail-closed;
    /// an active config gets its start timestamp stamped here.
    pub fn create_experiment(
        &self,
        mut config: ExperimentConfig,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        config.validate()?;
        if config.status == ExperimentStatus::Active && config.started_at.is_none() {
            config.started_at = Some(now);
        }
        let id = config.id.clone();
        let mut experiments = self
            .experiments
            .write()
            .map_err(|_| EngineError::LockPoisoned)?;
        if experiments.contains_key(&id) {
            return Err(EngineError::AlreadyExists {
                experiment_id: id.as_str().to_string(),
            });
        }
        experiments.insert(id.clone(), Arc::new(ExperimentEntry::new(config)));
        info!(experiment = %id, "experiment created");
        Ok(())
    }

    /// Move a draft to active and start the clock.
    pub fn activate(
        &self,
        experiment_id: &ExperimentId,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let entry = self.entry(experiment_id)?;
        let mut config = entry.config.write().map_err(|_| EngineError::LockPoisoned)?;
        match config.status {
            ExperimentStatus::Draft => {
                config.status = ExperimentStatus::Active;
                if config.started_at.is_none() {
                    config.started_at = Some(now);
                }
                info!(experiment = %experiment_id, "experiment activated");
                Ok(())
            }
            ExperimentStatus::Active => Ok(()),
            ExperimentStatus::Paused => Err(EngineError::NotActive {
                experiment_id: experiment_id.as_str().to_string(),
                status: config.status,
            }),
            ExperimentStatus::Completed => Err(EngineError::TerminalExperiment {
                experiment_id: experiment_id.as_str().to_string(),
            }),
        }
    }

    // -- allocation path --------------------------------------------------

    /// Assign a subject to a variant. Pure hash plus a config read lock;
    /// never blocks on ingestion or evaluation state.
    pub fn assign(
        &self,
        experiment_id: &ExperimentId,
        subject_key: &str,
        attributes: &SubjectAttributes,
    ) -> Result<Variant, EngineError> {
        let entry = self.entry(experiment_id)?;
        let stage = entry.active_stage.load(Ordering::Acquire);
        let config = entry.config.read().map_err(|_| EngineError::LockPoisoned)?;
        Ok(traffic_allocator::assign(
            &config,
            subject_key,
            attributes,
            stage,
        )?)
    }

    // -- ingestion path ---------------------------------------------------

    /// Record one outcome event. Serialized per experiment by the
    /// aggregator lock; buckets of different experiments are disjoint.
    pub fn record(
        &self,
        experiment_id: &ExperimentId,
        variant: Variant,
        event: &OutcomeEvent,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, EngineError> {
        let entry = self.entry(experiment_id)?;
        {
            let config = entry.config.read().map_err(|_| EngineError::LockPoisoned)?;
            if config.status == ExperimentStatus::Draft {
                return Err(EngineError::NotActive {
                    experiment_id: experiment_id.as_str().to_string(),
                    status: config.status,
                });
            }
        }
        let mut aggregator = entry
            .aggregator
            .lock()
            .map_err(|_| EngineError::LockPoisoned)?;
        Ok(aggregator.record(variant, event, now)?)
    }

    /// Supply a named custom-metric value for one variant, read by
    /// custom success criteria on the next cycle.
    pub fn record_custom_metric(
        &self,
        experiment_id: &ExperimentId,
        variant: Variant,
        name: impl Into<String>,
        value: f64,
    ) -> Result<(), EngineError> {
        let entry = self.entry(experiment_id)?;
        let mut customs = entry
            .custom_metrics
            .lock()
            .map_err(|_| EngineError::LockPoisoned)?;
        customs.entry(variant).or_default().insert(name.into(), value);
        Ok(())
    }

    // -- evaluation path --------------------------------------------------

    /// Run one evaluation cycle. On any failure the state machine is
    /// untouched and the stall marker is set; the next cadence tick
    /// simply retries.
    pub fn run_evaluation_cycle(
        &self,
        experiment_id: &ExperimentId,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, EngineError> {
        let result = self.run_cycle_inner(experiment_id, now);
        if let Ok(entry) = self.entry(experiment_id)
            && let Ok(mut stalled) = entry.evaluation_stalled_since.lock()
        {
            match &result {
                Ok(_) => *stalled = None,
                Err(_) => {
                    stalled.get_or_insert(now);
                }
            }
        }
        if let Err(err) = &result {
            warn!(
                experiment = %experiment_id,
                code = err.stable_code(),
                "evaluation cycle failed; state unchanged"
            );
        }
        result
    }

    fn run_cycle_inner(
        &self,
        experiment_id: &ExperimentId,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, EngineError> {
        let entry = self.entry(experiment_id)?;

        let config = {
            let guard = entry.config.read().map_err(|_| EngineError::LockPoisoned)?;
            guard.clone()
        };
        if config.status != ExperimentStatus::Active {
            return Err(EngineError::NotActive {
                experiment_id: experiment_id.as_str().to_string(),
                status: config.status,
            });
        }

        // Consistent snapshot: aggregates are cloned out under the
        // ingestion lock, then the lock is released before any scoring.
        let (aggregate_a, aggregate_b) = {
            let aggregator = entry
                .aggregator
                .lock()
                .map_err(|_| EngineError::LockPoisoned)?;
            let a = aggregator.aggregate(Variant::A, config.started_at, now, true);
            let b = aggregator.aggregate(Variant::B, config.started_at, now, true);
            match (a, b) {
                (Ok(a), Ok(b)) => (a, b),
                (Err(err), _) | (_, Err(err)) => {
                    drop(aggregator);
                    if err.is_invariant_violation() {
                        // Corrupted counters stop automatic transitions;
                        // history is never auto-healed.
                        if let Ok(mut machine) = entry.machine.lock() {
                            machine.halt_automatic_transitions("bucket_counter_invariant");
                        }
                    }
                    return Err(err.into());
                }
            }
        };

        let (customs_a, customs_b) = {
            let customs = entry
                .custom_metrics
                .lock()
                .map_err(|_| EngineError::LockPoisoned)?;
            (
                customs.get(&Variant::A).cloned().unwrap_or_default(),
                customs.get(&Variant::B).cloned().unwrap_or_default(),
            )
        };

        let outcome = {
            let mut machine = entry.machine.lock().map_err(|_| EngineError::LockPoisoned)?;
            let outcome = machine.evaluate_cycle(
                &config,
                &aggregate_a,
                &aggregate_b,
                &customs_a,
                &customs_b,
                now,
            )?;
            entry
                .active_stage
                .store(machine.active_stage(), Ordering::Release);
            outcome
        };

        // Commit config-side effects after the machine lock is released;
        // locks are never nested.
        if outcome.safety_tripped {
            let mut config = entry.config.write().map_err(|_| EngineError::LockPoisoned)?;
            if !config.status.is_terminal() {
                config.status = ExperimentStatus::Paused;
            }
            warn!(
                experiment = %experiment_id,
                "safety ceiling exceeded; experiment paused"
            );
        }
        if let Some(rewrite) = &outcome.split_rewrite {
            self.commit_winner(&entry, Variant::B)?;
            info!(
                experiment = %experiment_id,
                percentage = rewrite.variant_b_percentage,
                "promotion decided; split rewrite emitted"
            );
        }
        debug!(
            experiment = %experiment_id,
            action = outcome.decision.action.as_str(),
            reason = %outcome.decision.reason,
            "evaluation cycle complete"
        );
        Ok(outcome)
    }

    fn commit_winner(
        &self,
        entry: &ExperimentEntry,
        winner: Variant,
    ) -> Result<(), EngineError> {
        let mut config = entry.config.write().map_err(|_| EngineError::LockPoisoned)?;
        config.winner = Some(winner);
        config.status = ExperimentStatus::Completed;
        Ok(())
    }

    // -- status -----------------------------------------------------------

    /// On-demand aggregate for one variant, summed from the experiment
    /// start (closed buckets, plus the open bucket flagged provisional
    /// when `include_open`).
    pub fn get_aggregate(
        &self,
        experiment_id: &ExperimentId,
        variant: Variant,
        now: DateTime<Utc>,
        include_open: bool,
    ) -> Result<VariantAggregate, EngineError> {
        let entry = self.entry(experiment_id)?;
        let since = {
            let config = entry.config.read().map_err(|_| EngineError::LockPoisoned)?;
            config.started_at
        };
        let aggregator = entry
            .aggregator
            .lock()
            .map_err(|_| EngineError::LockPoisoned)?;
        Ok(aggregator.aggregate(variant, since, now, include_open)?)
    }

    /// Read-only snapshot for dashboards.
    pub fn get_status(
        &self,
        experiment_id: &ExperimentId,
        now: DateTime<Utc>,
    ) -> Result<ExperimentStatusSnapshot, EngineError> {
        let entry = self.entry(experiment_id)?;
        let config = {
            let guard = entry.config.read().map_err(|_| EngineError::LockPoisoned)?;
            guard.clone()
        };
        let (samples_a, samples_b) = {
            let aggregator = entry
                .aggregator
                .lock()
                .map_err(|_| EngineError::LockPoisoned)?;
            let a = aggregator.aggregate(Variant::A, config.started_at, now, true)?;
            let b = aggregator.aggregate(Variant::B, config.started_at, now, true)?;
            (a.request_count, b.request_count)
        };
        let stalled = {
            let guard = entry
                .evaluation_stalled_since
                .lock()
                .map_err(|_| EngineError::LockPoisoned)?;
            *guard
        };
        let machine = entry.machine.lock().map_err(|_| EngineError::LockPoisoned)?;
        let stage = machine.active_stage();
        let effective = if config.traffic_split.strategy == SplitStrategy::Canary {
            config
                .traffic_split
                .stage_percentage(stage)
                .unwrap_or(config.traffic_split.variant_b_percentage)
        } else {
            config.traffic_split.variant_b_percentage
        };

        Ok(ExperimentStatusSnapshot {
            schema_version: EXPERIMENT_STATUS_SCHEMA_VERSION.to_string(),
            experiment_id: config.id.as_str().to_string(),
            name: config.name.clone(),
            status: config.status,
            state: machine.state(),
            winner: machine.winner().or(config.winner),
            active_stage: stage,
            effective_variant_b_percentage: effective,
            samples_a,
            samples_b,
            latest_decision: machine.latest_decision().cloned(),
            safety_alert: machine.safety_alert().cloned(),
            halted_reason: machine.halted_reason().map(str::to_string),
            evaluation_stalled_since: stalled,
            criteria_first_met_at: machine.criteria_first_met_at(),
            generated_at: now,
        })
    }

    // -- administrative commands ------------------------------------------

    /// Suspend evaluation; allocation continues on the last-known split.
    pub fn pause(&self, experiment_id: &ExperimentId) -> Result<(), EngineError> {
        let entry = self.entry(experiment_id)?;
        {
            let mut machine = entry.machine.lock().map_err(|_| EngineError::LockPoisoned)?;
            machine.pause()?;
        }
        let mut config = entry.config.write().map_err(|_| EngineError::LockPoisoned)?;
        if !config.status.is_terminal() {
            config.status = ExperimentStatus::Paused;
        }
        info!(experiment = %experiment_id, "experiment paused");
        Ok(())
    }

    /// Resume evaluation from a pause. The promotion clock restarts.
    pub fn resume(&self, experiment_id: &ExperimentId) -> Result<(), EngineError> {
        let entry = self.entry(experiment_id)?;
        {
            let mut machine = entry.machine.lock().map_err(|_| EngineError::LockPoisoned)?;
            machine.resume()?;
        }
        let mut config = entry.config.write().map_err(|_| EngineError::LockPoisoned)?;
        if !config.status.is_terminal() {
            config.status = ExperimentStatus::Active;
        }
        info!(experiment = %experiment_id, "experiment resumed");
        Ok(())
    }

    /// Operator override: promote the given variant immediately.
    pub fn force_promote(
        &self,
        experiment_id: &ExperimentId,
        variant: Variant,
        now: DateTime<Utc>,
    ) -> Result<SplitRewrite, EngineError> {
        let entry = self.entry(experiment_id)?;
        let config = {
            let guard = entry.config.read().map_err(|_| EngineError::LockPoisoned)?;
            guard.clone()
        };
        let rewrite = {
            let mut machine = entry.machine.lock().map_err(|_| EngineError::LockPoisoned)?;
            machine.force_promote(&config, variant, now)?
        };
        self.commit_winner(&entry, variant)?;
        info!(experiment = %experiment_id, winner = %variant, "manual promotion applied");
        Ok(rewrite)
    }

    /// Operator override: restore the incumbent immediately.
    pub fn force_rollback(
        &self,
        experiment_id: &ExperimentId,
        now: DateTime<Utc>,
    ) -> Result<SplitRewrite, EngineError> {
        self.force_promote(experiment_id, Variant::A, now)
    }

    /// Patch the mutable parts of a config. Refused on terminal
    /// experiments; the patched record is re-validated as a whole.
    pub fn update_config(
        &self,
        experiment_id: &ExperimentId,
        patch: &ExperimentConfigPatch,
    ) -> Result<(), EngineError> {
        let entry = self.entry(experiment_id)?;
        let mut config = entry.config.write().map_err(|_| EngineError::LockPoisoned)?;
        if config.status.is_terminal() || config.winner.is_some() {
            return Err(EngineError::TerminalExperiment {
                experiment_id: experiment_id.as_str().to_string(),
            });
        }
        let mut updated = config.clone();
        if let Some(name) = &patch.name {
            updated.name = name.clone();
        }
        if let Some(split) = &patch.traffic_split {
            updated.traffic_split = split.clone();
        }
        if let Some(criteria) = &patch.success_criteria {
            updated.success_criteria = criteria.clone();
        }
        if let Some(auto_promote) = &patch.auto_promote {
            updated.auto_promote = auto_promote.clone();
        }
        if let Some(safety) = &patch.safety {
            updated.safety = safety.clone();
        }
        updated.validate()?;
        *config = updated;
        info!(experiment = %experiment_id, "experiment config updated");
        Ok(())
    }

    /// Retrieve the pending split-rewrite instruction for a terminal
    /// experiment, for retrying delivery until acknowledged.
    pub fn pending_split_rewrite(
        &self,
        experiment_id: &ExperimentId,
    ) -> Result<Option<SplitRewrite>, EngineError> {
        let entry = self.entry(experiment_id)?;
        let machine = entry.machine.lock().map_err(|_| EngineError::LockPoisoned)?;
        Ok(machine.pending_split_rewrite(experiment_id.as_str()))
    }

    // -- persistence ------------------------------------------------------

    /// Persist one experiment: config, promotion state, closed buckets,
    /// and decisions. Open buckets are deliberately skipped; a crash
    /// loses at most one bucket width of in-flight data per variant.
    pub fn persist(
        &self,
        experiment_id: &ExperimentId,
        adapter: &mut dyn StorageAdapter,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let entry = self.entry(experiment_id)?;
        let id = experiment_id.as_str();

        let config = {
            let guard = entry.config.read().map_err(|_| EngineError::LockPoisoned)?;
            guard.clone()
        };
        let mut config_metadata = BTreeMap::new();
        config_metadata.insert(
            "schema_version".to_string(),
            crate::experiment_config::EXPERIMENT_CONFIG_SCHEMA_VERSION.to_string(),
        );
        adapter.put(
            StoreKind::ExperimentConfigs,
            id.to_string(),
            to_json(&config)?,
            config_metadata,
        )?;

        let machine_snapshot = {
            let machine = entry.machine.lock().map_err(|_| EngineError::LockPoisoned)?;
            machine.clone()
        };
        adapter.put(
            StoreKind::PromotionState,
            id.to_string(),
            to_json(&machine_snapshot)?,
            BTreeMap::new(),
        )?;
        for (index, decision) in machine_snapshot.decisions().iter().enumerate() {
            adapter.put(
                StoreKind::Decisions,
                format!("{id}/{index:08}"),
                to_json(decision)?,
                BTreeMap::new(),
            )?;
        }

        let closed: Vec<(Variant, MetricBucket)> = {
            let aggregator = entry
                .aggregator
                .lock()
                .map_err(|_| EngineError::LockPoisoned)?;
            aggregator
                .closed_buckets(now)
                .into_iter()
                .map(|(variant, bucket)| (variant, bucket.clone()))
                .collect()
        };
        for (variant, bucket) in closed {
            let mut metadata = BTreeMap::new();
            metadata.insert("variant".to_string(), variant.as_str().to_string());
            metadata.insert(
                "schema_version".to_string(),
                crate::metrics_aggregator::METRIC_BUCKET_SCHEMA_VERSION.to_string(),
            );
            adapter.put(
                StoreKind::MetricBuckets,
                format!("{id}/{}/{}", variant.as_str(), bucket.window_start.timestamp()),
                to_json(&bucket)?,
                metadata,
            )?;
        }
        debug!(experiment = %experiment_id, "experiment persisted");
        Ok(())
    }

    /// Restore every persisted experiment into a fresh engine.
    pub fn restore(
        adapter: &mut dyn StorageAdapter,
        now: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        let engine = Self::new();
        let configs = adapter.query(StoreKind::ExperimentConfigs, &StoreQuery::default())?;
        for record in configs {
            let config: ExperimentConfig = from_json(&record.value)?;
            let id = config.id.clone();
            engine.create_experiment(config, now)?;
            let entry = engine.entry(&id)?;

            if let Some(state_record) = adapter.get(StoreKind::PromotionState, id.as_str())? {
                let machine: PromotionStateMachine = from_json(&state_record.value)?;
                entry
                    .active_stage
                    .store(machine.active_stage(), Ordering::Release);
                *entry.machine.lock().map_err(|_| EngineError::LockPoisoned)? = machine;
            }

            let buckets = adapter.query(
                StoreKind::MetricBuckets,
                &StoreQuery::prefix(format!("{}/", id.as_str())),
            )?;
            let mut aggregator = entry
                .aggregator
                .lock()
                .map_err(|_| EngineError::LockPoisoned)?;
            for bucket_record in buckets {
                let variant = match bucket_record.metadata.get("variant").map(String::as_str) {
                    Some("variant_b") => Variant::B,
                    _ => Variant::A,
                };
                let bucket: MetricBucket = from_json(&bucket_record.value)?;
                aggregator.restore_bucket(variant, bucket)?;
            }
        }
        Ok(engine)
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, EngineError> {
    serde_json::to_vec(value).map_err(|err| EngineError::Serialization {
        detail: err.to_string(),
    })
}

fn from_json<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, EngineError> {
    serde_json::from_slice(bytes).map_err(|err| EngineError::Serialization {
        detail: err.to_string(),
    })
}
