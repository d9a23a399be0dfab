//! Store capability
//!
//! The `Store` trait is the boundary between ingest/query callers and the
//! backing database. Two implementations:
//!
//! - `ClickHouseStore`: permanent tables hold aggregate *state*
//!   (`AggregatingMergeTree`). A batch is staged into `Log` tables and folded
//!   in with `INSERT ... SELECT minState(..), ...`. No transactions: a failed
//!   batch may be partially applied, and only the ledger tells.
//! - `SqliteStore`: permanent tables hold final values. A batch is upserted
//!   row by row inside one transaction, so it applies atomically.
//!
//! Test authors: both give identical lookup results after successful
//! batches. They differ only under partial failure, where ClickHouse may
//! keep a half-applied batch and SQLite never does.

pub mod clickhouse;
pub mod sqlite;

use crate::aggregation::{normalize_name, AggregationResult, AggregationSummary, Which};
use crate::config::{StoreBackend, StoreConfig};
use crate::error::StoreError;
use crate::reverse::reverse;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of `Store::update`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UpdateResult {
    pub duration: Duration,
    /// Rows written into permanent tables. ClickHouse cannot tell new keys
    /// from existing ones, so it reports every written row here.
    pub inserted: u64,
    pub updated: u64,
}

/// Merged state of one (query, type, answer) tuple
///
/// Deserializes from ClickHouse rows whose aggregate columns are aliased
/// away from the state column names (`first_seen`, `seen`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleResult {
    pub query: String,
    #[serde(rename = "type")]
    pub qtype: String,
    pub answer: String,
    #[serde(alias = "ttl_last")]
    pub ttl: u16,
    #[serde(with = "chrono::serde::ts_seconds", alias = "first_seen")]
    pub first: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds", alias = "last_seen")]
    pub last: DateTime<Utc>,
    #[serde(alias = "seen")]
    pub count: u64,
}

/// Merged state of one individual value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndividualResult {
    pub which: Which,
    pub value: String,
    #[serde(with = "chrono::serde::ts_seconds", alias = "first_seen")]
    pub first: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds", alias = "last_seen")]
    pub last: DateTime<Utc>,
    #[serde(alias = "seen")]
    pub count: u64,
}

/// One ledger row, written once per fully merged batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchRecord {
    pub filename: String,
    /// Seconds
    pub aggregation_time: f64,
    pub total_records: u64,
    pub skipped_records: u64,
    pub tuples: u64,
    pub individual: u64,
    /// Seconds
    pub store_time: f64,
    pub inserted: u64,
    pub updated: u64,
}

impl BatchRecord {
    pub fn new(batch_id: &str, agg: &AggregationSummary, upd: &UpdateResult) -> Self {
        Self {
            filename: batch_id.to_string(),
            aggregation_time: agg.duration.as_secs_f64(),
            total_records: agg.total_records,
            skipped_records: agg.skipped_records,
            tuples: agg.tuples,
            individual: agg.individuals,
            store_time: upd.duration.as_secs_f64(),
            inserted: upd.inserted,
            updated: upd.updated,
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Create the permanent tables if absent. Idempotent.
    async fn init(&self) -> Result<(), StoreError>;

    /// Delete every row of every permanent table.
    async fn clear(&self) -> Result<(), StoreError>;

    /// Callers must not rely on atomicity across calls; ClickHouse refuses.
    async fn begin(&self) -> Result<(), StoreError>;

    async fn commit(&self) -> Result<(), StoreError>;

    /// Retention. Unsupported on every backend.
    async fn delete_older_than(&self, days: u32) -> Result<u64, StoreError>;

    /// Stage and merge one batch.
    async fn update(&self, ar: AggregationResult) -> Result<UpdateResult, StoreError>;

    /// Whether `batch_id` has already been merged. Absence is `Ok(false)`.
    async fn is_indexed(&self, batch_id: &str) -> Result<bool, StoreError>;

    /// Record `batch_id` as merged. Must be the last step of a batch.
    async fn set_indexed(
        &self,
        batch_id: &str,
        agg: &AggregationSummary,
        upd: &UpdateResult,
    ) -> Result<(), StoreError>;

    /// Tuples whose query name is exactly `query`.
    async fn find_query_tuples(&self, query: &str) -> Result<Vec<TupleResult>, StoreError>;

    /// Tuples whose query or answer is exactly `name`.
    async fn find_tuples(&self, name: &str) -> Result<Vec<TupleResult>, StoreError>;

    /// Tuples whose query or answer is `suffix` or a name under it.
    async fn like_tuples(&self, suffix: &str) -> Result<Vec<TupleResult>, StoreError>;

    /// Query and Answer individuals equal to `value`.
    async fn find_individual(&self, value: &str) -> Result<Vec<IndividualResult>, StoreError>;

    /// Query and Answer individuals equal to `suffix` or under it.
    async fn like_individual(&self, suffix: &str) -> Result<Vec<IndividualResult>, StoreError>;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

/// A lookup term in the forms stored keys are compared against
///
/// Names are stored normalized, so query-side and host-name comparisons use
/// `name`/`reversed`. Non-name rdata is stored as logged, so exact answer
/// comparisons also accept `literal`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LookupTerm {
    pub name: String,
    pub reversed: String,
    pub literal: String,
}

impl LookupTerm {
    pub fn new(term: &str) -> Self {
        let name = normalize_name(term);
        Self {
            reversed: reverse(&name),
            literal: term.to_string(),
            name,
        }
    }
}

/// Restore natural order of stored tuple query names.
pub(crate) fn unreverse_tuples(rows: &mut [TupleResult]) {
    for row in rows {
        row.query = reverse(&row.query);
    }
}

/// Restore natural order of Query-typed individual values. Answer values are
/// stored in natural order already.
pub(crate) fn unreverse_individuals(rows: &mut [IndividualResult]) {
    for row in rows.iter_mut().filter(|r| r.which == Which::Query) {
        row.value = reverse(&row.value);
    }
}

/// Open the store named by `config` and check it is reachable.
pub async fn open_store(config: &StoreConfig) -> Result<Box<dyn Store>, StoreError> {
    match &config.backend {
        StoreBackend::ClickHouse { .. } => {
            let store = clickhouse::ClickHouseStore::connect(config).await?;
            Ok(Box::new(store))
        }
        StoreBackend::Sqlite { path } => {
            let store = sqlite::SqliteStore::open(path)?;
            Ok(Box::new(store))
        }
    }
}
