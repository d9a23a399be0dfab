//! ClickHouse store
//!
//! ```text
//! AggregationResult
//!     ↓ codec (reversed keys, JSONEachRow)
//! StagingLoader  → tuples_temp, individual_temp   (Log)
//!     ↓
//! MergeCommitter → tuples, individual             (AggregatingMergeTree)
//!     ↓
//! IndexingLedger → filenames                      (MergeTree)
//! ```
//!
//! ClickHouse has no multi-statement transactions for these engines and no
//! row-level delete we want to rely on. Recovery is ledger-gated: the ledger
//! row is the last write of a batch, so an interrupted batch is re-run from
//! scratch.

pub mod client;
pub mod ledger;
pub mod merge;
pub mod query;
pub mod schema;
pub mod staging;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{Engine, HttpEngine, QuerySummary};
pub use ledger::IndexingLedger;
pub use merge::{MergeCommitter, MergeResult};
pub use query::QueryEngine;
pub use staging::StagingLoader;

use crate::aggregation::{AggregationResult, AggregationSummary};
use crate::codec::{individual_rows, tuple_rows, JsonLines};
use crate::config::{StoreBackend, StoreConfig};
use crate::error::{Stage, StageExt, StoreError};
use crate::store::{IndividualResult, Store, TupleResult, UpdateResult};
use async_trait::async_trait;
use std::time::Instant;

pub struct ClickHouseStore {
    engine: Box<dyn Engine>,
}

impl ClickHouseStore {
    /// Connect over HTTP and verify the server answers.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let (url, database, user, password) = match &config.backend {
            StoreBackend::ClickHouse {
                url,
                database,
                user,
                password,
            } => (url.clone(), database.clone(), user.clone(), password.clone()),
            StoreBackend::Sqlite { .. } => {
                return Err(StoreError::InvalidUri(
                    "ClickHouseStore needs a clickhouse:// URI".to_string(),
                ))
            }
        };

        let engine = HttpEngine::new(
            url.clone(),
            database.clone(),
            user,
            password,
            config.query_timeout,
            config.bulk_timeout,
        )?;
        let version = engine.ping().await?;
        log::info!("✅ Connected to ClickHouse {} at {} (database: {})", version, url, database);

        Ok(Self::with_engine(Box::new(engine)))
    }

    pub fn with_engine(engine: Box<dyn Engine>) -> Self {
        Self { engine }
    }

    /// Stream `rows` into `table` through the bulk insert endpoint.
    pub async fn send_bulk(
        &self,
        table: &str,
        rows: JsonLines,
    ) -> Result<QuerySummary, StoreError> {
        self.engine.send_bulk(table, rows).await
    }
}

#[async_trait]
impl Store for ClickHouseStore {
    async fn init(&self) -> Result<(), StoreError> {
        for ddl in schema::permanent_tables() {
            self.engine.exec(&ddl).await.at(Stage::Init)?;
        }
        log::info!("✅ ClickHouse schema ready");
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        for table in [schema::LEDGER, schema::INDIVIDUAL, schema::TUPLES] {
            self.engine
                .exec(&format!("TRUNCATE TABLE IF EXISTS {}", table))
                .await
                .at(Stage::Clear)?;
        }
        Ok(())
    }

    async fn begin(&self) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("ClickHouse does not support transactions"))
    }

    async fn commit(&self) -> Result<(), StoreError> {
        log::warn!("⚠️  ClickHouse does not support transactions, commit is a no-op");
        Ok(())
    }

    async fn delete_older_than(&self, _days: u32) -> Result<u64, StoreError> {
        Err(StoreError::Unsupported("ClickHouse store does not support deleting old records"))
    }

    async fn update(&self, ar: AggregationResult) -> Result<UpdateResult, StoreError> {
        let start = Instant::now();
        let AggregationResult {
            tuples, individuals, ..
        } = ar;

        StagingLoader::new(self.engine.as_ref())
            .stage(tuple_rows(tuples, true), individual_rows(individuals, true))
            .await?;
        let merged = MergeCommitter::new(self.engine.as_ref()).commit().await?;

        log::debug!(
            "Merged {} tuple rows, {} individual rows in {:?}",
            merged.tuples_written,
            merged.individuals_written,
            merged.duration
        );

        Ok(UpdateResult {
            duration: start.elapsed(),
            inserted: merged.rows_written(),
            updated: 0,
        })
    }

    async fn is_indexed(&self, batch_id: &str) -> Result<bool, StoreError> {
        IndexingLedger::new(self.engine.as_ref()).is_indexed(batch_id).await
    }

    async fn set_indexed(
        &self,
        batch_id: &str,
        agg: &AggregationSummary,
        upd: &UpdateResult,
    ) -> Result<(), StoreError> {
        IndexingLedger::new(self.engine.as_ref())
            .set_indexed(batch_id, agg, upd)
            .await
    }

    async fn find_query_tuples(&self, query: &str) -> Result<Vec<TupleResult>, StoreError> {
        QueryEngine::new(self.engine.as_ref()).find_query_tuples(query).await
    }

    async fn find_tuples(&self, name: &str) -> Result<Vec<TupleResult>, StoreError> {
        QueryEngine::new(self.engine.as_ref()).find_tuples(name).await
    }

    async fn like_tuples(&self, suffix: &str) -> Result<Vec<TupleResult>, StoreError> {
        QueryEngine::new(self.engine.as_ref()).like_tuples(suffix).await
    }

    async fn find_individual(&self, value: &str) -> Result<Vec<IndividualResult>, StoreError> {
        QueryEngine::new(self.engine.as_ref()).find_individual(value).await
    }

    async fn like_individual(&self, suffix: &str) -> Result<Vec<IndividualResult>, StoreError> {
        QueryEngine::new(self.engine.as_ref()).like_individual(suffix).await
    }

    fn backend_type(&self) -> &'static str {
        "ClickHouse"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{Aggregator, DnsObservation};
    use crate::error::ErrorKind;
    use crate::indexer::{IndexOutcome, Indexer};
    use std::sync::Arc;
    use std::time::Duration;
    use testing::ScriptedEngine;

    fn fast_retries(retries: u32) -> StoreConfig {
        let mut config = StoreConfig::from_uri("clickhouse://localhost:8123/default").unwrap();
        config.max_retries = retries;
        config.retry_initial_delay = Duration::from_millis(1);
        config.retry_max_delay = Duration::from_millis(2);
        config
    }

    fn positions(log: &[String], prefix: &str) -> Vec<usize> {
        log.iter()
            .enumerate()
            .filter(|(_, line)| line.starts_with(prefix))
            .map(|(i, _)| i)
            .collect()
    }

    fn batch() -> AggregationResult {
        let mut agg = Aggregator::new();
        for _ in 0..2 {
            agg.observe(&DnsObservation {
                ts: 1_700_000_000,
                query: "example.com".into(),
                qtype: "A".into(),
                answers: vec!["1.2.3.4".into()],
                ttls: vec![300],
            });
        }
        agg.finish()
    }

    #[tokio::test]
    async fn test_update_stages_then_merges() {
        let engine = std::sync::Arc::new(ScriptedEngine::new().with_written_rows(3));
        let store = ClickHouseStore::with_engine(Box::new(SharedEngine(engine.clone())));
        let result = store.update(batch()).await.unwrap();

        let log = engine.log();
        assert_eq!(log.len(), 8);
        assert_eq!(log[0], "EXEC DROP TABLE IF EXISTS tuples_temp");
        assert_eq!(log[1], "EXEC DROP TABLE IF EXISTS individual_temp");
        assert!(log[2].starts_with("EXEC CREATE TABLE tuples_temp"));
        assert!(log[3].starts_with("EXEC CREATE TABLE individual_temp"));
        assert_eq!(log[4], "BULK tuples_temp 1");
        assert_eq!(log[5], "BULK individual_temp 2");
        assert!(log[6].starts_with("EXEC INSERT INTO tuples "));
        assert!(log[7].starts_with("EXEC INSERT INTO individual "));

        assert_eq!(result.inserted, 6);
        assert_eq!(result.updated, 0);

        let staged = engine.bulk_rows("tuples_temp");
        assert_eq!(staged[0]["count"], 2);
        assert_eq!(staged[0]["query"], "moc.elpmaxe");
    }

    #[tokio::test]
    async fn test_stage_failure_skips_merge() {
        let engine = std::sync::Arc::new(ScriptedEngine::new().fail_on("BULK tuples_temp"));
        let store = ClickHouseStore::with_engine(Box::new(SharedEngine(engine.clone())));
        let err = store.update(batch()).await.unwrap_err();

        assert_eq!(err.stage(), Some(Stage::LoadTuples));
        assert!(!engine.log().iter().any(|l| l.contains("INSERT INTO tuples")));
    }

    #[tokio::test]
    async fn test_transactions_and_retention_unsupported() {
        let store = ClickHouseStore::with_engine(Box::new(ScriptedEngine::new()));

        assert_eq!(store.begin().await.unwrap_err().kind(), ErrorKind::Unsupported);
        assert!(store.commit().await.is_ok());
        assert_eq!(
            store.delete_older_than(30).await.unwrap_err().kind(),
            ErrorKind::Unsupported
        );
    }

    #[tokio::test]
    async fn test_init_and_clear_statements() {
        let engine = std::sync::Arc::new(ScriptedEngine::new());
        let store = ClickHouseStore::with_engine(Box::new(SharedEngine(engine.clone())));
        store.init().await.unwrap();
        store.clear().await.unwrap();

        let log = engine.log();
        assert_eq!(log.len(), 6);
        assert!(log[0].contains("CREATE TABLE IF NOT EXISTS tuples"));
        assert!(log[1].contains("CREATE TABLE IF NOT EXISTS individual"));
        assert!(log[2].contains("CREATE TABLE IF NOT EXISTS filenames"));
        assert_eq!(log[3], "EXEC TRUNCATE TABLE IF EXISTS filenames");
        assert_eq!(log[5], "EXEC TRUNCATE TABLE IF EXISTS tuples");
    }

    #[tokio::test]
    async fn test_send_bulk_streams_rows() {
        let engine = std::sync::Arc::new(ScriptedEngine::new());
        let store = ClickHouseStore::with_engine(Box::new(SharedEngine(engine.clone())));
        let rows = vec![
            serde_json::json!({"filename": "a.log"}),
            serde_json::json!({"filename": "b.log"}),
        ];
        let summary = store
            .send_bulk(schema::LEDGER, JsonLines::from_rows(rows))
            .await
            .unwrap();

        assert_eq!(summary.written_rows, 2);
        assert_eq!(engine.log(), vec!["BULK filenames 2"]);
    }

    #[tokio::test]
    async fn test_init_failure_is_schema_error() {
        let engine = ScriptedEngine::new().fail_on("CREATE TABLE IF NOT EXISTS individual");
        let store = ClickHouseStore::with_engine(Box::new(engine));
        let err = store.init().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[tokio::test]
    async fn test_indexer_restages_after_load_timeout() {
        let engine = Arc::new(ScriptedEngine::new().timeout_on("BULK individual_temp", 1));
        let store = ClickHouseStore::with_engine(Box::new(SharedEngine(engine.clone())));
        let indexer = Indexer::new(&store).with_retry_policy(&fast_retries(2));

        let outcome = indexer.index_batch("dns.log", batch()).await.unwrap();
        assert!(matches!(outcome, IndexOutcome::Indexed(_)));

        let log = engine.log();
        let loads = positions(&log, "BULK individual_temp");
        let merges = positions(&log, "EXEC INSERT INTO tuples ");
        assert_eq!(loads.len(), 2);
        assert_eq!(merges.len(), 1);
        assert!(merges[0] > loads[1]);
        assert_eq!(positions(&log, "EXEC DROP TABLE IF EXISTS tuples_temp").len(), 2);
        assert_eq!(log.last().map(String::as_str), Some("BULK filenames 1"));
    }

    #[tokio::test]
    async fn test_indexer_does_not_retry_merge_timeout() {
        let engine = Arc::new(ScriptedEngine::new().timeout_on("INSERT INTO individual", 1));
        let store = ClickHouseStore::with_engine(Box::new(SharedEngine(engine.clone())));
        let indexer = Indexer::new(&store).with_retry_policy(&fast_retries(2));

        let err = indexer.index_batch("dns.log", batch()).await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(err.stage(), Some(Stage::MergeIndividuals));

        let log = engine.log();
        assert_eq!(positions(&log, "EXEC INSERT INTO tuples ").len(), 1);
        assert_eq!(positions(&log, "EXEC INSERT INTO individual ").len(), 1);
        assert!(positions(&log, "BULK filenames").is_empty());
    }

    /// Lets a test keep a handle on the engine the store owns.
    struct SharedEngine(std::sync::Arc<ScriptedEngine>);

    #[async_trait]
    impl Engine for SharedEngine {
        async fn exec(&self, sql: &str) -> Result<QuerySummary, StoreError> {
            self.0.exec(sql).await
        }

        async fn send_bulk(
            &self,
            table: &str,
            rows: JsonLines,
        ) -> Result<QuerySummary, StoreError> {
            self.0.send_bulk(table, rows).await
        }

        async fn select(
            &self,
            sql: &str,
            params: &[(&str, String)],
        ) -> Result<Vec<serde_json::Value>, StoreError> {
            self.0.select(sql, params).await
        }
    }

    /// Needs a ClickHouse server on localhost:8123.
    #[tokio::test]
    #[ignore]
    async fn test_live_roundtrip() {
        let config = StoreConfig::from_uri("clickhouse://localhost:8123/default").unwrap();
        let store = ClickHouseStore::connect(&config).await.unwrap();
        store.init().await.unwrap();
        store.clear().await.unwrap();

        let ar = batch();
        let summary = ar.summary();
        let upd = store.update(ar).await.unwrap();
        store.set_indexed("live-test", &summary, &upd).await.unwrap();

        let rows = store.find_query_tuples("example.com").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, 2);
        assert!(store.is_indexed("live-test").await.unwrap());

        store.clear().await.unwrap();
        assert!(store.like_tuples("example.com").await.unwrap().is_empty());
    }
}
