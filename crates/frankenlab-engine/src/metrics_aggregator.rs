//! Bucketed accumulation of per-request outcome events.
//!
//! Outcomes land in fixed-width five-minute buckets per variant,
//! left-closed/right-open on the event timestamp. A bucket is open while
//! the wall clock is inside its window and immutable once the window has
//! passed; closing is a function of time, not of any explicit signal.
//! Aggregates are recomputed on demand by summing closed buckets (the
//! open bucket can be included, flagged as provisional).
//!
//! Ingestion is idempotent: callers may attach an `event_id`, and a
//! duplicate delivery inside the dedup horizon is a recorded no-op. The
//! horizon spans one bucket width plus a delivery allowance; events older
//! than that are rejected rather than silently double-counted.
//!
//! This component stores outcomes and nothing else: no promotion or
//! allocation decisions are made here.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::experiment_config::{BUCKET_WIDTH_SECS, Variant};
use crate::latency_histogram::LatencyHistogram;

/// Schema version for persisted buckets.
pub const METRIC_BUCKET_SCHEMA_VERSION: &str = "frankenlab.metric-bucket.v1";

/// Extra time after a window closes during which duplicates are still
/// detected and late arrivals still accepted.
pub const DELIVERY_ALLOWANCE_SECS: i64 = 300;

const COMPONENT: &str = "metrics_aggregator";

const ERROR_INVALID_TIMESTAMP: &str = "FL-AGG-0001";
const ERROR_INVALID_OUTCOME: &str = "FL-AGG-0002";
const ERROR_LATE_ARRIVAL: &str = "FL-AGG-0003";
const ERROR_COUNTER_INVARIANT: &str = "FL-AGG-0004";

// ---------------------------------------------------------------------------
// OutcomeEvent
// ---------------------------------------------------------------------------

/// One completed unit of work, as reported by the execution layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    /// Caller-supplied idempotency key; duplicates inside the dedup
    /// horizon are dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: f64,
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
}

// ---------------------------------------------------------------------------
// MetricBucket
// ---------------------------------------------------------------------------

/// Counters for one (variant, window) cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricBucket {
    pub window_start: DateTime<Utc>,
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub latency: LatencyHistogram,
    pub cost_sum_usd: f64,
    pub quality_score_sum: f64,
    pub quality_score_count: u64,
}

impl MetricBucket {
    fn new(window_start: DateTime<Utc>) -> Self {
        Self {
            window_start,
            request_count: 0,
            success_count: 0,
            error_count: 0,
            latency: LatencyHistogram::new(),
            cost_sum_usd: 0.0,
            quality_score_sum: 0.0,
            quality_score_count: 0,
        }
    }

    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_start + Duration::seconds(BUCKET_WIDTH_SECS)
    }

    /// Closed once the wall clock has passed the window end.
    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_end()
    }

    fn absorb(&mut self, event: &OutcomeEvent) {
        self.request_count += 1;
        if event.success {
            self.success_count += 1;
        } else {
            self.error_count += 1;
        }
        self.latency.record(event.latency_ms);
        self.cost_sum_usd += event.cost_usd;
        if let Some(quality) = event.quality_score {
            self.quality_score_sum += quality;
            self.quality_score_count += 1;
        }
    }

    fn counters_consistent(&self) -> bool {
        self.success_count + self.error_count <= self.request_count
    }
}

// ---------------------------------------------------------------------------
// VariantAggregate
// ---------------------------------------------------------------------------

/// Sum of a variant's buckets over a time range. Derived on demand and
/// never cached: new buckets arrive continuously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantAggregate {
    pub variant: Variant,
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub latency: LatencyHistogram,
    pub cost_sum_usd: f64,
    pub quality_score_sum: f64,
    pub quality_score_count: u64,
    /// Number of buckets folded in.
    pub bucket_count: u64,
    /// True when the still-open bucket is included.
    pub provisional: bool,
}

impl VariantAggregate {
    fn empty(variant: Variant) -> Self {
        Self {
            variant,
            request_count: 0,
            success_count: 0,
            error_count: 0,
            latency: LatencyHistogram::new(),
            cost_sum_usd: 0.0,
            quality_score_sum: 0.0,
            quality_score_count: 0,
            bucket_count: 0,
            provisional: false,
        }
    }

    pub fn success_rate(&self) -> Option<f64> {
        if self.request_count == 0 {
            return None;
        }
        Some(self.success_count as f64 / self.request_count as f64)
    }

    pub fn error_rate(&self) -> Option<f64> {
        if self.request_count == 0 {
            return None;
        }
        Some(self.error_count as f64 / self.request_count as f64)
    }

    pub fn cost_per_request(&self) -> Option<f64> {
        if self.request_count == 0 {
            return None;
        }
        Some(self.cost_sum_usd / self.request_count as f64)
    }

    pub fn quality_mean(&self) -> Option<f64> {
        if self.quality_score_count == 0 {
            return None;
        }
        Some(self.quality_score_sum / self.quality_score_count as f64)
    }

    pub fn latency_p95(&self) -> Option<f64> {
        self.latency.p95()
    }
}

// ---------------------------------------------------------------------------
// Structured events
// ---------------------------------------------------------------------------

/// Structured operation record for audit and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorEvent {
    pub component: String,
    pub variant: Variant,
    pub event: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

// ---------------------------------------------------------------------------
// AggregatorError
// ---------------------------------------------------------------------------

/// Ingestion-path failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregatorError {
    #[error("event timestamp {timestamp} is too far in the future of {now}")]
    InvalidTimestamp {
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    },
    #[error("outcome field `{field}` is not a finite number")]
    InvalidOutcome { field: String },
    #[error("event timestamp {timestamp} is past the late-arrival horizon")]
    LateArrival { timestamp: DateTime<Utc> },
    /// Fatal: counters can only disagree through corrupted state. The
    /// owning experiment must stop automatic transitions.
    #[error("bucket counters violated success+error <= requests for {variant} at {window_start}")]
    CounterInvariant {
        variant: Variant,
        window_start: DateTime<Utc>,
    },
}

impl AggregatorError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::InvalidTimestamp { .. } => ERROR_INVALID_TIMESTAMP,
            Self::InvalidOutcome { .. } => ERROR_INVALID_OUTCOME,
            Self::LateArrival { .. } => ERROR_LATE_ARRIVAL,
            Self::CounterInvariant { .. } => ERROR_COUNTER_INVARIANT,
        }
    }

    /// True for violations that must halt the experiment's automatic
    /// transitions rather than being retried.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::CounterInvariant { .. })
    }
}

// ---------------------------------------------------------------------------
// RecordOutcome
// ---------------------------------------------------------------------------

/// What `record` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Counted into the bucket starting at the given window.
    Recorded { window_start: DateTime<Utc> },
    /// Same `event_id` already seen inside the dedup horizon; no effect.
    Duplicate,
}

// ---------------------------------------------------------------------------
// MetricsAggregator
// ---------------------------------------------------------------------------

/// Per-experiment outcome store: both variants' buckets plus the dedup
/// window. Deterministic `BTreeMap` state throughout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsAggregator {
    /// variant -> window start (epoch seconds) -> bucket.
    buckets: BTreeMap<Variant, BTreeMap<i64, MetricBucket>>,
    /// event id -> event timestamp, pruned past the dedup horizon.
    seen_event_ids: BTreeMap<String, DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    events: Vec<AggregatorEvent>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dedup/late-arrival horizon: one bucket width plus the delivery
    /// allowance.
    pub fn dedup_horizon() -> Duration {
        Duration::seconds(BUCKET_WIDTH_SECS + DELIVERY_ALLOWANCE_SECS)
    }

    fn window_start_secs(timestamp: DateTime<Utc>) -> i64 {
        let secs = timestamp.timestamp();
        secs - secs.rem_euclid(BUCKET_WIDTH_SECS)
    }

    /// Record one outcome event at wall-clock `now`.
    pub fn record(
        &mut self,
        variant: Variant,
        event: &OutcomeEvent,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, AggregatorError> {
        let result = self.record_inner(variant, event, now);
        let (name, outcome, code) = match &result {
            Ok(RecordOutcome::Recorded { .. }) => ("record", "ok", None),
            Ok(RecordOutcome::Duplicate) => ("duplicate_skipped", "ok", None),
            Err(err) => ("record", "error", Some(err.stable_code().to_string())),
        };
        self.events.push(AggregatorEvent {
            component: COMPONENT.to_string(),
            variant,
            event: name.to_string(),
            outcome: outcome.to_string(),
            error_code: code,
        });
        result
    }

    fn record_inner(
        &mut self,
        variant: Variant,
        event: &OutcomeEvent,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, AggregatorError> {
        if event.timestamp > now + Duration::seconds(DELIVERY_ALLOWANCE_SECS) {
            return Err(AggregatorError::InvalidTimestamp {
                timestamp: event.timestamp,
                now,
            });
        }
        if event.timestamp < now - Self::dedup_horizon() {
            return Err(AggregatorError::LateArrival {
                timestamp: event.timestamp,
            });
        }
        if !event.latency_ms.is_finite() {
            return Err(AggregatorError::InvalidOutcome {
                field: "latency_ms".to_string(),
            });
        }
        if !event.cost_usd.is_finite() {
            return Err(AggregatorError::InvalidOutcome {
                field: "cost_usd".to_string(),
            });
        }
        if let Some(quality) = event.quality_score
            && !quality.is_finite()
        {
            return Err(AggregatorError::InvalidOutcome {
                field: "quality_score".to_string(),
            });
        }

        self.prune_dedup(now);
        if let Some(event_id) = &event.event_id {
            if self.seen_event_ids.contains_key(event_id) {
                return Ok(RecordOutcome::Duplicate);
            }
            self.seen_event_ids
                .insert(event_id.clone(), event.timestamp);
        }

        let window_secs = Self::window_start_secs(event.timestamp);
        let window_start = Utc
            .timestamp_opt(window_secs, 0)
            .single()
            .ok_or(AggregatorError::InvalidTimestamp {
                timestamp: event.timestamp,
                now,
            })?;
        let bucket = self
            .buckets
            .entry(variant)
            .or_default()
            .entry(window_secs)
            .or_insert_with(|| MetricBucket::new(window_start));
        bucket.absorb(event);

        Ok(RecordOutcome::Recorded { window_start })
    }

    fn prune_dedup(&mut self, now: DateTime<Utc>) {
        let horizon = now - Self::dedup_horizon();
        self.seen_event_ids.retain(|_, seen_at| *seen_at >= horizon);
    }

    /// Sum the variant's buckets from `since` (default unbounded) until
    /// `now`; a bucket counts when its window overlaps the range. Closed
    /// buckets only unless `include_open`; the result is flagged
    /// provisional when an open bucket was folded in.
    pub fn aggregate(
        &self,
        variant: Variant,
        since: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        include_open: bool,
    ) -> Result<VariantAggregate, AggregatorError> {
        let mut aggregate = VariantAggregate::empty(variant);
        let Some(windows) = self.buckets.get(&variant) else {
            return Ok(aggregate);
        };
        for bucket in windows.values() {
            if let Some(since) = since
                && bucket.window_end() <= since
            {
                continue;
            }
            if bucket.window_start >= now {
                continue;
            }
            if !bucket.counters_consistent() {
                return Err(AggregatorError::CounterInvariant {
                    variant,
                    window_start: bucket.window_start,
                });
            }
            let closed = bucket.is_closed(now);
            if !closed && !include_open {
                continue;
            }
            aggregate.request_count += bucket.request_count;
            aggregate.success_count += bucket.success_count;
            aggregate.error_count += bucket.error_count;
            aggregate.latency.merge(&bucket.latency);
            aggregate.cost_sum_usd += bucket.cost_sum_usd;
            aggregate.quality_score_sum += bucket.quality_score_sum;
            aggregate.quality_score_count += bucket.quality_score_count;
            aggregate.bucket_count += 1;
            if !closed {
                aggregate.provisional = true;
            }
        }
        Ok(aggregate)
    }

    /// Closed buckets for persistence; open buckets stay in memory and may
    /// be lost on crash (bounded to one window per variant).
    pub fn closed_buckets(&self, now: DateTime<Utc>) -> Vec<(Variant, &MetricBucket)> {
        let mut out = Vec::new();
        for (variant, windows) in &self.buckets {
            for bucket in windows.values() {
                if bucket.is_closed(now) {
                    out.push((*variant, bucket));
                }
            }
        }
        out
    }

    /// Restore a previously persisted closed bucket. Counter invariants
    /// are re-checked; corrupted history is refused, never overwritten.
    pub fn restore_bucket(
        &mut self,
        variant: Variant,
        bucket: MetricBucket,
    ) -> Result<(), AggregatorError> {
        if !bucket.counters_consistent() {
            return Err(AggregatorError::CounterInvariant {
                variant,
                window_start: bucket.window_start,
            });
        }
        self.buckets
            .entry(variant)
            .or_default()
            .insert(Self::window_start_secs(bucket.window_start), bucket);
        Ok(())
    }

    pub fn events(&self) -> &[AggregatorEvent] {
        &self.events
    }

    pub fn drain_events(&mut self) -> Vec<AggregatorEvent> {
        std::mem::take(&mut self.events)
    }
}
