//! Storage boundary for experiment state that must survive restarts.
//!
//! The engine persists experiment configurations, closed metric buckets,
//! and promotion decisions through this seam; open buckets are
//! deliberately not persisted (losing at most one bucket width of
//! in-flight data per variant on a crash). The interface is
//! store-agnostic and deterministic: stable key ordering on reads,
//! explicit schema-version checks, and structured operation events with
//! stable error codes.
//!
//! A backend outage maps to [`StorageError::BackendUnavailable`]; the
//! engine skips the affected evaluation cycle and retries on the next
//! cadence tick while allocation continues on the last-known config.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Current schema version for storage contracts.
pub const STORAGE_SCHEMA_VERSION: u32 = 1;

const COMPONENT: &str = "storage_adapter";

// ---------------------------------------------------------------------------
// StoreKind
// ---------------------------------------------------------------------------

/// The engine's persistent stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    ExperimentConfigs,
    PromotionState,
    MetricBuckets,
    Decisions,
}

impl StoreKind {
    /// Stable string name used in logs and storage keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExperimentConfigs => "experiment_configs",
            Self::PromotionState => "promotion_state",
            Self::MetricBuckets => "metric_buckets",
            Self::Decisions => "decisions",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Records and queries
// ---------------------------------------------------------------------------

/// Stored value with deterministic metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub store: StoreKind,
    pub key: String,
    pub value: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
    pub revision: u64,
}

/// Query selector for deterministic reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StoreQuery {
    /// Optional key prefix filter.
    pub key_prefix: Option<String>,
    /// Optional max result size; zero is rejected.
    pub limit: Option<usize>,
}

impl StoreQuery {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: Some(prefix.into()),
            limit: None,
        }
    }
}

/// Structured event emitted by adapter operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEvent {
    pub component: String,
    pub store: StoreKind,
    pub event: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

/// Stable error taxonomy for storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageError {
    InvalidKey { key: String },
    InvalidQuery { detail: String },
    SchemaVersionMismatch { expected: u32, actual: u32 },
    BackendUnavailable { backend: String, detail: String },
    WriteRejected { detail: String },
}

impl StorageError {
    /// Stable machine-readable error code.
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::InvalidKey { .. } => "FL-STOR-0001",
            Self::InvalidQuery { .. } => "FL-STOR-0002",
            Self::SchemaVersionMismatch { .. } => "FL-STOR-0003",
            Self::BackendUnavailable { .. } => "FL-STOR-0004",
            Self::WriteRejected { .. } => "FL-STOR-0005",
        }
    }

    /// Outage-class errors: skip the cycle, retry next tick.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::WriteRejected { .. }
        )
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKey { key } => write!(f, "invalid key: `{key}`"),
            Self::InvalidQuery { detail } => write!(f, "invalid query: {detail}"),
            Self::SchemaVersionMismatch { expected, actual } => {
                write!(
                    f,
                    "schema version mismatch: expected {expected}, got {actual}"
                )
            }
            Self::BackendUnavailable { backend, detail } => {
                write!(f, "backend unavailable ({backend}): {detail}")
            }
            Self::WriteRejected { detail } => write!(f, "write rejected: {detail}"),
        }
    }
}

impl std::error::Error for StorageError {}

// ---------------------------------------------------------------------------
// StorageAdapter
// ---------------------------------------------------------------------------

/// Generic storage adapter contract.
pub trait StorageAdapter {
    /// Adapter backend identifier.
    fn backend_name(&self) -> &'static str;
    /// Current schema version.
    fn current_schema_version(&self) -> u32;
    /// Fail-closed schema check for callers requiring a specific version.
    fn ensure_schema_version(&self, expected: u32) -> Result<(), StorageError>;

    fn put(
        &mut self,
        store: StoreKind,
        key: String,
        value: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<StoreRecord, StorageError>;

    fn get(&mut self, store: StoreKind, key: &str) -> Result<Option<StoreRecord>, StorageError>;

    fn query(
        &mut self,
        store: StoreKind,
        query: &StoreQuery,
    ) -> Result<Vec<StoreRecord>, StorageError>;

    fn delete(&mut self, store: StoreKind, key: &str) -> Result<bool, StorageError>;

    fn events(&self) -> &[StorageEvent];
}

// ---------------------------------------------------------------------------
// InMemoryStorageAdapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    next_revision: u64,
    records: BTreeMap<String, StoreRecord>,
}

impl StoreState {
    fn put(
        &mut self,
        store: StoreKind,
        key: String,
        value: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> StoreRecord {
        self.next_revision = self.next_revision.saturating_add(1);
        let record = StoreRecord {
            store,
            key: key.clone(),
            value,
            metadata,
            revision: self.next_revision,
        };
        self.records.insert(key, record.clone());
        record
    }
}

/// Deterministic in-memory adapter used for tests and local workflows.
/// Failure injection simulates an unavailable backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryStorageAdapter {
    schema_version: u32,
    stores: BTreeMap<StoreKind, StoreState>,
    events: Vec<StorageEvent>,
    fail_writes: bool,
    fail_reads: bool,
}

impl Default for InMemoryStorageAdapter {
    fn default() -> Self {
        Self {
            schema_version: STORAGE_SCHEMA_VERSION,
            stores: BTreeMap::new(),
            events: Vec::new(),
            fail_writes: false,
            fail_reads: false,
        }
    }
}

impl InMemoryStorageAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failure-injection mode: writes are rejected.
    pub fn with_fail_writes(mut self, fail_writes: bool) -> Self {
        self.fail_writes = fail_writes;
        self
    }

    /// Failure-injection mode: reads report the backend as unavailable.
    pub fn with_fail_reads(mut self, fail_reads: bool) -> Self {
        self.fail_reads = fail_reads;
        self
    }

    pub fn set_fail_reads(&mut self, fail_reads: bool) {
        self.fail_reads = fail_reads;
    }

    fn validate_key(key: &str) -> Result<(), StorageError> {
        if key.trim().is_empty() {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn read_guard(&self) -> Result<(), StorageError> {
        if self.fail_reads {
            return Err(StorageError::BackendUnavailable {
                backend: self.backend_name().to_string(),
                detail: "read failure injected".to_string(),
            });
        }
        Ok(())
    }

    fn record_event(
        &mut self,
        store: StoreKind,
        event: &str,
        outcome: &str,
        error: Option<&StorageError>,
    ) {
        self.events.push(StorageEvent {
            component: COMPONENT.to_string(),
            store,
            event: event.to_string(),
            outcome: outcome.to_string(),
            error_code: error.map(|err| err.stable_code().to_string()),
        });
    }
}

impl StorageAdapter for InMemoryStorageAdapter {
    fn backend_name(&self) -> &'static str {
        "in_memory"
    }

    fn current_schema_version(&self) -> u32 {
        self.schema_version
    }

    fn ensure_schema_version(&self, expected: u32) -> Result<(), StorageError> {
        if self.schema_version == expected {
            Ok(())
        } else {
            Err(StorageError::SchemaVersionMismatch {
                expected,
                actual: self.schema_version,
            })
        }
    }

    fn put(
        &mut self,
        store: StoreKind,
        key: String,
        value: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<StoreRecord, StorageError> {
        let result = (|| {
            if self.fail_writes {
                return Err(StorageError::WriteRejected {
                    detail: "write failure injected".to_string(),
                });
            }
            Self::validate_key(&key)?;
            Ok(self
                .stores
                .entry(store)
                .or_default()
                .put(store, key, value, metadata))
        })();

        self.record_event(
            store,
            "put",
            if result.is_ok() { "ok" } else { "error" },
            result.as_ref().err(),
        );
        result
    }

    fn get(&mut self, store: StoreKind, key: &str) -> Result<Option<StoreRecord>, StorageError> {
        let result = (|| {
            self.read_guard()?;
            Self::validate_key(key)?;
            Ok(self
                .stores
                .get(&store)
                .and_then(|state| state.records.get(key).cloned()))
        })();

        self.record_event(
            store,
            "get",
            if result.is_ok() { "ok" } else { "error" },
            result.as_ref().err(),
        );
        result
    }

    fn query(
        &mut self,
        store: StoreKind,
        query: &StoreQuery,
    ) -> Result<Vec<StoreRecord>, StorageError> {
        let result = (|| {
            self.read_guard()?;
            if matches!(query.limit, Some(0)) {
                return Err(StorageError::InvalidQuery {
                    detail: "limit cannot be zero".to_string(),
                });
            }

            let Some(state) = self.stores.get(&store) else {
                return Ok(Vec::new());
            };

            // BTreeMap iteration gives stable key order.
            let mut out: Vec<StoreRecord> = state
                .records
                .values()
                .filter(|record| {
                    query
                        .key_prefix
                        .as_ref()
                        .is_none_or(|prefix| record.key.starts_with(prefix))
                })
                .cloned()
                .collect();
            if let Some(limit) = query.limit {
                out.truncate(limit);
            }
            Ok(out)
        })();

        self.record_event(
            store,
            "query",
            if result.is_ok() { "ok" } else { "error" },
            result.as_ref().err(),
        );
        result
    }

    fn delete(&mut self, store: StoreKind, key: &str) -> Result<bool, StorageError> {
        let result = (|| {
            if self.fail_writes {
                return Err(StorageError::WriteRejected {
                    detail: "write failure injected".to_string(),
                });
            }
            Self::validate_key(key)?;
            Ok(self
                .stores
                .get_mut(&store)
                .is_some_and(|state| state.records.remove(key).is_some()))
        })();

        self.record_event(
            store,
            "delete",
            if result.is_ok() { "ok" } else { "error" },
            result.as_ref().err(),
        );
        result
    }

    fn events(&self) -> &[StorageEvent] {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crud_and_query_are_deterministic() {
        let mut adapter = InMemoryStorageAdapter::new();

        adapter
            .put(
                StoreKind::MetricBuckets,
                "exp-1/variant_b/1700000100".to_string(),
                vec![2],
                BTreeMap::new(),
            )
            .expect("put");
        adapter
            .put(
                StoreKind::MetricBuckets,
                "exp-1/variant_a/1700000100".to_string(),
                vec![1],
                BTreeMap::new(),
            )
            .expect("put");

        let rows = adapter
            .query(StoreKind::MetricBuckets, &StoreQuery::default())
            .expect("query");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, "exp-1/variant_a/1700000100");
        assert_eq!(rows[1].key, "exp-1/variant_b/1700000100");

        let filtered = adapter
            .query(
                StoreKind::MetricBuckets,
                &StoreQuery::prefix("exp-1/variant_b/"),
            )
            .expect("query");
        assert_eq!(filtered.len(), 1);

        assert!(
            adapter
                .delete(StoreKind::MetricBuckets, "exp-1/variant_b/1700000100")
                .expect("delete")
        );
        assert!(
            !adapter
                .delete(StoreKind::MetricBuckets, "exp-1/variant_b/1700000100")
                .expect("delete is idempotent")
        );
    }

    #[test]
    fn stores_are_disjoint() {
        let mut adapter = InMemoryStorageAdapter::new();
        adapter
            .put(
                StoreKind::ExperimentConfigs,
                "exp-1".to_string(),
                vec![1],
                BTreeMap::new(),
            )
            .expect("put");
        let missing = adapter
            .get(StoreKind::Decisions, "exp-1")
            .expect("get");
        assert!(missing.is_none());
    }

    #[test]
    fn blank_keys_are_rejected() {
        let mut adapter = InMemoryStorageAdapter::new();
        let err = adapter
            .put(StoreKind::Decisions, "   ".to_string(), vec![], BTreeMap::new())
            .expect_err("must reject");
        assert_eq!(err.stable_code(), "FL-STOR-0001");
    }

    #[test]
    fn zero_limit_is_an_invalid_query() {
        let mut adapter = InMemoryStorageAdapter::new();
        let err = adapter
            .query(
                StoreKind::Decisions,
                &StoreQuery { key_prefix: None, limit: Some(0) },
            )
            .expect_err("must reject");
        assert_eq!(err.stable_code(), "FL-STOR-0002");
    }

    #[test]
    fn injected_write_failure_surfaces_as_rejection() {
        let mut adapter = InMemoryStorageAdapter::new().with_fail_writes(true);
        let err = adapter
            .put(StoreKind::Decisions, "d-1".to_string(), vec![], BTreeMap::new())
            .expect_err("must fail");
        assert!(err.is_unavailable());
        assert_eq!(err.stable_code(), "FL-STOR-0005");
    }

    #[test]
    fn injected_read_failure_reads_as_outage() {
        let mut adapter = InMemoryStorageAdapter::new().with_fail_reads(true);
        let err = adapter
            .get(StoreKind::ExperimentConfigs, "exp-1")
            .expect_err("must fail");
        assert_eq!(err.stable_code(), "FL-STOR-0004");
        assert!(err.is_unavailable());
    }

    #[test]
    fn revisions_increase_per_store() {
        let mut adapter = InMemoryStorageAdapter::new();
        let first = adapter
            .put(StoreKind::Decisions, "d-1".to_string(), vec![], BTreeMap::new())
            .expect("put");
        let second = adapter
            .put(StoreKind::Decisions, "d-1".to_string(), vec![], BTreeMap::new())
            .expect("put");
        assert!(second.revision > first.revision);
    }

    #[test]
    fn schema_version_check_is_fail_closed() {
        let adapter = InMemoryStorageAdapter::new();
        adapter
            .ensure_schema_version(STORAGE_SCHEMA_VERSION)
            .expect("matching version");
        let err = adapter
            .ensure_schema_version(STORAGE_SCHEMA_VERSION + 1)
            .expect_err("mismatch");
        assert_eq!(err.stable_code(), "FL-STOR-0003");
    }

    #[test]
    fn operations_emit_structured_events() {
        let mut adapter = InMemoryStorageAdapter::new();
        adapter
            .put(StoreKind::Decisions, "d-1".to_string(), vec![], BTreeMap::new())
            .expect("put");
        let events = StorageAdapter::events(&adapter);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "put");
        assert_eq!(events[0].outcome, "ok");
        assert_eq!(events[0].error_code, None);
    }
}
