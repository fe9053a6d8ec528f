//! Promotion decision state machine.
//!
//! Consumes composite scores and significance reports for the current
//! variant aggregates and decides, per evaluation cycle: continue,
//! promote B, roll back to A, or require manual review. Gates are
//! fail-closed; uncertain data never promotes.
//!
//! States: `collecting` -> `promoted` | `rolled_back`, with `paused`
//! reachable from any non-terminal state and returning to `collecting`
//! on resume. Terminal states are immutable; the winner is set exactly
//! once, and a second assignment halts all automatic transitions for
//! the experiment (manual intervention only, history is never
//! overwritten).
//!
//! The safety ceiling is a fast path: variant B's error rate is checked
//! before any scoring or significance work and is not subject to the
//! promotion delay.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::BTreeMap;
use std::fmt;

use crate::composite_scorer::{self, CriterionScore, ScorerError, Winner};
use crate::experiment_config::{ExperimentConfig, SplitStrategy, Variant};
use crate::metrics_aggregator::VariantAggregate;
use crate::significance::{ProportionSample, SignificanceOutcome, evaluate};

/// Schema version for persisted promotion decisions.
pub const PROMOTION_DECISION_SCHEMA_VERSION: &str = "frankenlab.promotion-decision.v1";

/// Schema version for emitted split-rewrite instructions.
pub const SPLIT_REWRITE_SCHEMA_VERSION: &str = "frankenlab.split-rewrite.v1";

const COMPONENT: &str = "promotion";

const ERROR_PAUSED: &str = "FL-PROM-0001";
const ERROR_TERMINAL: &str = "FL-PROM-0002";
const ERROR_WINNER_ALREADY_SET: &str = "FL-PROM-0003";
const ERROR_SCORER: &str = "FL-PROM-0004";

// ---------------------------------------------------------------------------
// ExperimentState
// ---------------------------------------------------------------------------

/// Evaluation-side lifecycle of one experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    /// Gathering data; gates are evaluated each cycle.
    Collecting,
    /// Evaluation suspended (operator action or safety stop). Traffic
    /// keeps flowing on the last-known split.
    Paused,
    /// Terminal: B won and the split was rewritten to 100% B.
    Promoted,
    /// Terminal: the incumbent was restored.
    RolledBack,
}

impl ExperimentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Collecting => "collecting",
            Self::Paused => "paused",
            Self::Promoted => "promoted",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Promoted | Self::RolledBack)
    }
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Decision artifacts
// ---------------------------------------------------------------------------

/// The action chosen by one evaluation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Continue,
    PromoteB,
    PromoteA,
    RequireManualReview,
}

impl DecisionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::PromoteB => "promote_b",
            Self::PromoteA => "promote_a",
            Self::RequireManualReview => "require_manual_review",
        }
    }
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output artifact of one evaluation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionDecision {
    pub schema_version: String,
    pub timestamp: DateTime<Utc>,
    pub variant_a_score: f64,
    pub variant_b_score: f64,
    /// Absent while either variant has zero samples.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,
    pub is_significant: bool,
    pub samples_a: u64,
    pub samples_b: u64,
    /// Monotonic once set for a sustained gate; cleared only by a gate
    /// regression before the delay elapses or by an evaluator reset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria_first_met_at: Option<DateTime<Utc>>,
    pub action: DecisionAction,
    /// Stable snake_case reason for the action.
    pub reason: String,
    /// Variant B's per-criterion rows from this cycle.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub criteria_b: Vec<CriterionScore>,
}

/// Fire-and-forget instruction for the external split store. The caller
/// retries delivery until acknowledged; applying it twice is a no-op
/// because the payload is absolute, not incremental.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitRewrite {
    pub schema_version: String,
    pub experiment_id: String,
    pub variant_b_percentage: f64,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
}

/// Alert-worthy safety condition surfaced in status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyAlert {
    pub variant: Variant,
    pub error_rate: f64,
    pub ceiling: f64,
    pub triggered_at: DateTime<Utc>,
}

/// Everything one cycle produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub decision: PromotionDecision,
    /// Present on the cycle that commits a terminal transition.
    pub split_rewrite: Option<SplitRewrite>,
    /// Canary ramp advanced during this cycle.
    pub stage_advanced: bool,
    /// Safety stop tripped during this cycle.
    pub safety_tripped: bool,
}

/// Structured operation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionEvent {
    pub component: String,
    pub event: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

// ---------------------------------------------------------------------------
// PromotionError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PromotionError {
    /// Cycles do not run while paused; resume first.
    #[error("experiment is paused; evaluation cycles are suspended")]
    Paused,
    #[error("experiment already reached terminal state {state}")]
    TerminalState { state: ExperimentState },
    /// Fatal invariant violation: the winner is written exactly once.
    #[error("winner already set to {existing}; refusing to overwrite")]
    WinnerAlreadySet { existing: Variant },
    #[error("scoring failed: {0}")]
    Scorer(#[from] ScorerError),
}

impl PromotionError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::Paused => ERROR_PAUSED,
            Self::TerminalState { .. } => ERROR_TERMINAL,
            Self::WinnerAlreadySet { .. } => ERROR_WINNER_ALREADY_SET,
            Self::Scorer(_) => ERROR_SCORER,
        }
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::WinnerAlreadySet { .. })
    }
}

// ---------------------------------------------------------------------------
// PromotionStateMachine
// ---------------------------------------------------------------------------

/// Per-experiment decision state. Serializable so closed state survives
/// restarts alongside the config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionStateMachine {
    state: ExperimentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    winner: Option<Variant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    criteria_first_met_at: Option<DateTime<Utc>>,
    active_stage: usize,
    stage_entry_samples: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stage_entered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    safety_alert: Option<SafetyAlert>,
    /// Reason automatic transitions are halted, if any. Set on invariant
    /// violations; cleared only by explicit manual override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    halted_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    decisions: Vec<PromotionDecision>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    events: Vec<PromotionEvent>,
}

impl Default for PromotionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromotionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ExperimentState::Collecting,
            winner: None,
            criteria_first_met_at: None,
            active_stage: 0,
            stage_entry_samples: 0,
            stage_entered_at: None,
            decided_at: None,
            safety_alert: None,
            halted_reason: None,
            decisions: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> ExperimentState {
        self.state
    }

    pub fn winner(&self) -> Option<Variant> {
        self.winner
    }

    pub fn active_stage(&self) -> usize {
        self.active_stage
    }

    pub fn criteria_first_met_at(&self) -> Option<DateTime<Utc>> {
        self.criteria_first_met_at
    }

    pub fn safety_alert(&self) -> Option<&SafetyAlert> {
        self.safety_alert.as_ref()
    }

    pub fn halted_reason(&self) -> Option<&str> {
        self.halted_reason.as_deref()
    }

    pub fn decisions(&self) -> &[PromotionDecision] {
        &self.decisions
    }

    pub fn latest_decision(&self) -> Option<&PromotionDecision> {
        self.decisions.last()
    }

    pub fn events(&self) -> &[PromotionEvent] {
        &self.events
    }

    pub fn drain_events(&mut self) -> Vec<PromotionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Regenerate the split-rewrite instruction while terminal, so the
    /// delivery effect can be retried until acknowledged.
    pub fn pending_split_rewrite(&self, experiment_id: &str) -> Option<SplitRewrite> {
        let winner = self.winner?;
        let decided_at = self.decided_at?;
        if !self.state.is_terminal() {
            return None;
        }
        Some(self.rewrite_for(experiment_id, winner, decided_at))
    }

    fn rewrite_for(
        &self,
        experiment_id: &str,
        winner: Variant,
        decided_at: DateTime<Utc>,
    ) -> SplitRewrite {
        SplitRewrite {
            schema_version: SPLIT_REWRITE_SCHEMA_VERSION.to_string(),
            experiment_id: experiment_id.to_string(),
            variant_b_percentage: match winner {
                Variant::B => 100.0,
                Variant::A => 0.0,
            },
            reason: match self.state {
                ExperimentState::Promoted => "promotion".to_string(),
                _ => "rollback".to_string(),
            },
            decided_at,
        }
    }

    // -- administrative transitions --------------------------------------

    /// Suspend evaluation. Idempotent; refused on terminal states.
    pub fn pause(&mut self) -> Result<(), PromotionError> {
        if self.state.is_terminal() {
            return Err(PromotionError::TerminalState { state: self.state });
        }
        self.state = ExperimentState::Paused;
        self.push_event("pause", "ok", None);
        Ok(())
    }

    /// Return to collecting. Clears a safety alert; the gate clock is
    /// also reset so a fresh full promotion delay is required.
    pub fn resume(&mut self) -> Result<(), PromotionError> {
        if self.state.is_terminal() {
            return Err(PromotionError::TerminalState { state: self.state });
        }
        self.state = ExperimentState::Collecting;
        self.safety_alert = None;
        self.criteria_first_met_at = None;
        self.push_event("resume", "ok", None);
        Ok(())
    }

    /// Clear accumulated gate state so the promotion clock restarts.
    pub fn reset_evaluation(&mut self) {
        self.criteria_first_met_at = None;
        self.push_event("reset_evaluation", "ok", None);
    }

    /// Stop all automatic transitions for this experiment. Used when a
    /// fatal invariant violation is detected outside this module (for
    /// example corrupted bucket counters); only a manual override clears
    /// the halt. History is never rewritten.
    pub fn halt_automatic_transitions(&mut self, reason: impl Into<String>) {
        self.halted_reason = Some(reason.into());
        self.push_event("halt", "invariant_violation", None);
    }

    /// Operator override: transition straight to the terminal state for
    /// `variant`, regardless of gates. Idempotent when the requested
    /// terminal outcome already holds; conflicting winners are an
    /// invariant violation and halt the experiment.
    pub fn force_promote(
        &mut self,
        config: &ExperimentConfig,
        variant: Variant,
        now: DateTime<Utc>,
    ) -> Result<SplitRewrite, PromotionError> {
        let target_state = match variant {
            Variant::B => ExperimentState::Promoted,
            Variant::A => ExperimentState::RolledBack,
        };
        if self.state.is_terminal() {
            if self.winner == Some(variant) {
                self.push_event("force_promote", "noop", None);
                return self
                    .pending_split_rewrite(config.id.as_str())
                    .ok_or(PromotionError::TerminalState { state: self.state });
            }
            let err = PromotionError::WinnerAlreadySet {
                existing: self.winner.unwrap_or(Variant::A),
            };
            self.halt(&err);
            return Err(err);
        }

        self.set_winner_once(variant)?;
        self.state = target_state;
        self.decided_at = Some(now);
        self.halted_reason = None;
        self.push_event("force_promote", "ok", None);
        Ok(self.rewrite_for(config.id.as_str(), variant, now))
    }

    /// Operator override: restore the incumbent immediately.
    pub fn force_rollback(
        &mut self,
        config: &ExperimentConfig,
        now: DateTime<Utc>,
    ) -> Result<SplitRewrite, PromotionError> {
        self.force_promote(config, Variant::A, now)
    }

    // -- evaluation cycle -------------------------------------------------

    /// Run one evaluation cycle against freshly computed aggregates.
    ///
    /// The caller fetches the aggregates (and handles storage failures by
    /// simply not calling this; a skipped cycle is retried on the next
    /// cadence tick and never advances state).
    pub fn evaluate_cycle(
        &mut self,
        config: &ExperimentConfig,
        aggregate_a: &VariantAggregate,
        aggregate_b: &VariantAggregate,
        custom_values_a: &BTreeMap<String, f64>,
        custom_values_b: &BTreeMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, PromotionError> {
        match self.state {
            ExperimentState::Paused => return Err(PromotionError::Paused),
            state if state.is_terminal() => {
                return Err(PromotionError::TerminalState { state });
            }
            _ => {}
        }

        if let Some(reason) = self.halted_reason.clone() {
            let decision = self.blank_decision(now, DecisionAction::RequireManualReview, reason);
            self.decisions.push(decision.clone());
            self.push_event("evaluate_cycle", "halted", None);
            return Ok(CycleOutcome {
                decision,
                split_rewrite: None,
                stage_advanced: false,
                safety_tripped: false,
            });
        }

        // Safety fast path: checked before scoring or significance, not
        // subject to the promotion delay.
        if let Some(error_rate) = aggregate_b.error_rate()
            && aggregate_b.request_count >= config.safety.min_requests_for_check
            && error_rate > config.safety.max_error_rate
        {
            self.state = ExperimentState::Paused;
            self.safety_alert = Some(SafetyAlert {
                variant: Variant::B,
                error_rate,
                ceiling: config.safety.max_error_rate,
                triggered_at: now,
            });
            self.criteria_first_met_at = None;
            let mut decision = self.blank_decision(
                now,
                DecisionAction::RequireManualReview,
                "safety_ceiling_exceeded".to_string(),
            );
            decision.samples_a = aggregate_a.request_count;
            decision.samples_b = aggregate_b.request_count;
            self.decisions.push(decision.clone());
            self.push_event("safety_stop", "tripped", None);
            return Ok(CycleOutcome {
                decision,
                split_rewrite: None,
                stage_advanced: false,
                safety_tripped: true,
            });
        }

        let score_a = composite_scorer::score_variant(
            Variant::A,
            &config.success_criteria,
            aggregate_a,
            custom_values_a,
        )?;
        let score_b = composite_scorer::score_variant(
            Variant::B,
            &config.success_criteria,
            aggregate_b,
            custom_values_b,
        )?;
        let winner = composite_scorer::determine_winner(score_a.composite, score_b.composite);

        let significance = evaluate(
            ProportionSample::new(aggregate_a.request_count, aggregate_a.success_count),
            ProportionSample::new(aggregate_b.request_count, aggregate_b.success_count),
            config.auto_promote.confidence_level,
        );
        let (p_value, is_significant) = match &significance {
            SignificanceOutcome::Computed(report) => (Some(report.p_value), report.is_significant),
            SignificanceOutcome::InsufficientData { .. } => (None, false),
        };

        let samples_ok = aggregate_a.request_count >= config.auto_promote.min_samples_per_variant
            && aggregate_b.request_count >= config.auto_promote.min_samples_per_variant;
        let primary_full_credit = config
            .primary_criterion()
            .and_then(|primary| {
                score_b
                    .criteria
                    .iter()
                    .find(|row| row.metric == primary.metric.name())
            })
            .is_some_and(CriterionScore::at_full_credit);

        let all_criteria_met = config.auto_promote.enabled
            && samples_ok
            && is_significant
            && winner == Winner::VariantB
            && primary_full_credit;

        let stage_advanced = self.advance_canary_stage(config, aggregate_b, now);

        let (action, reason, split_rewrite) = if all_criteria_met {
            let first_met = *self.criteria_first_met_at.get_or_insert(now);
            let delay = Duration::seconds(config.auto_promote.promotion_delay_secs);
            if now - first_met >= delay {
                if let Err(err) = self.set_winner_once(Variant::B) {
                    self.halt(&err);
                    return Err(err);
                }
                self.state = ExperimentState::Promoted;
                self.decided_at = Some(now);
                let rewrite = self
                    .pending_split_rewrite(config.id.as_str())
                    .map(|mut rewrite| {
                        rewrite.reason = "promotion_gates_sustained".to_string();
                        rewrite
                    });
                (
                    DecisionAction::PromoteB,
                    "promotion_gates_sustained".to_string(),
                    rewrite,
                )
            } else {
                (
                    DecisionAction::Continue,
                    "awaiting_promotion_delay".to_string(),
                    None,
                )
            }
        } else {
            // A regression before the delay elapses restarts the clock.
            let reason = if self.criteria_first_met_at.take().is_some() {
                "gate_regressed".to_string()
            } else if !config.auto_promote.enabled {
                "auto_promote_disabled".to_string()
            } else if p_value.is_none() || !samples_ok {
                "insufficient_samples".to_string()
            } else if !is_significant {
                "not_significant".to_string()
            } else if winner == Winner::Tie {
                "tie_never_promotes".to_string()
            } else if winner == Winner::VariantA {
                "composite_winner_is_a".to_string()
            } else {
                "primary_criterion_below_threshold".to_string()
            };
            (DecisionAction::Continue, reason, None)
        };

        let decision = PromotionDecision {
            schema_version: PROMOTION_DECISION_SCHEMA_VERSION.to_string(),
            timestamp: now,
            variant_a_score: score_a.composite,
            variant_b_score: score_b.composite,
            p_value,
            is_significant,
            samples_a: aggregate_a.request_count,
            samples_b: aggregate_b.request_count,
            criteria_first_met_at: self.criteria_first_met_at,
            action,
            reason,
            criteria_b: score_b.criteria.clone(),
        };
        self.decisions.push(decision.clone());
        self.push_event(
            "evaluate_cycle",
            decision.action.as_str(),
            None,
        );

        Ok(CycleOutcome {
            decision,
            split_rewrite,
            stage_advanced,
            safety_tripped: false,
        })
    }

    // -- internals --------------------------------------------------------

    fn advance_canary_stage(
        &mut self,
        config: &ExperimentConfig,
        aggregate_b: &VariantAggregate,
        now: DateTime<Utc>,
    ) -> bool {
        if config.traffic_split.strategy != SplitStrategy::Canary {
            return false;
        }
        let schedule = &config.traffic_split.stage_schedule;
        if self.active_stage + 1 >= schedule.len() {
            return false;
        }
        let entered_at = *self.stage_entered_at.get_or_insert(now);
        let stage = &schedule[self.active_stage];

        let samples_in_stage = aggregate_b
            .request_count
            .saturating_sub(self.stage_entry_samples);
        if let Some(min_samples) = stage.min_samples
            && samples_in_stage < min_samples
        {
            return false;
        }
        if let Some(min_duration) = stage.min_duration_secs
            && now - entered_at < Duration::seconds(min_duration)
        {
            return false;
        }

        self.active_stage += 1;
        self.stage_entry_samples = aggregate_b.request_count;
        self.stage_entered_at = Some(now);
        self.push_event("canary_stage_advanced", "ok", None);
        true
    }

    fn set_winner_once(&mut self, variant: Variant) -> Result<(), PromotionError> {
        match self.winner {
            None => {
                self.winner = Some(variant);
                Ok(())
            }
            Some(existing) if existing == variant => Ok(()),
            Some(existing) => Err(PromotionError::WinnerAlreadySet { existing }),
        }
    }

    fn halt(&mut self, err: &PromotionError) {
        if err.is_invariant_violation() {
            self.halted_reason = Some("winner_immutability_violated".to_string());
            self.push_event("halt", "invariant_violation", Some(err.stable_code()));
        }
    }

    fn blank_decision(
        &self,
        now: DateTime<Utc>,
        action: DecisionAction,
        reason: String,
    ) -> PromotionDecision {
        PromotionDecision {
            schema_version: PROMOTION_DECISION_SCHEMA_VERSION.to_string(),
            timestamp: now,
            variant_a_score: 0.0,
            variant_b_score: 0.0,
            p_value: None,
            is_significant: false,
            samples_a: 0,
            samples_b: 0,
            criteria_first_met_at: self.criteria_first_met_at,
            action,
            reason,
            criteria_b: Vec::new(),
        }
    }

    fn push_event(&mut self, event: &str, outcome: &str, error_code: Option<&str>) {
        self.events.push(PromotionEvent {
            component: COMPONENT.to_string(),
            event: event.to_string(),
            outcome: outcome.to_string(),
            error_code: error_code.map(str::to_string),
        });
    }
}
