//! Batch indexer
//!
//! Runs one batch through the store as a saga:
//!
//! ```text
//! is_indexed? ──yes──→ Skipped
//!     │ no
//!     ↓
//! update (stage → merge)   retried only on timeouts before any merge
//!     ↓
//! set_indexed              always last; retried on timeouts
//!     ↓
//! Indexed(UpdateResult)
//! ```
//!
//! Idempotence comes from the ledger, not from the merge. Calling
//! `Store::update` twice with the same batch doubles its counts; going
//! through `Indexer` does not, as long as batches are not indexed
//! concurrently.

use crate::aggregation::{AggregationResult, AggregationSummary};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::retry::ExponentialBackoff;
use crate::store::{Store, UpdateResult};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndexOutcome {
    /// The ledger already holds the batch; nothing was written.
    Skipped,
    Indexed(UpdateResult),
}

pub struct Indexer<'a> {
    store: &'a dyn Store,
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl<'a> Indexer<'a> {
    /// Indexer with no retries
    pub fn new(store: &'a dyn Store) -> Self {
        Self {
            store,
            max_retries: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }

    /// Take the retry policy from `config`.
    pub fn with_retry_policy(mut self, config: &StoreConfig) -> Self {
        self.max_retries = config.max_retries;
        self.initial_delay = config.retry_initial_delay;
        self.max_delay = config.retry_max_delay;
        self
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.initial_delay, self.max_delay, self.max_retries)
    }

    pub async fn is_indexed(&self, batch_id: &str) -> Result<bool, StoreError> {
        self.store.is_indexed(batch_id).await
    }

    /// Merge `ar` under `batch_id` unless the ledger already has it.
    pub async fn index_batch(
        &self,
        batch_id: &str,
        ar: AggregationResult,
    ) -> Result<IndexOutcome, StoreError> {
        if self.store.is_indexed(batch_id).await? {
            log::info!("⏭️  {} already indexed, skipping", batch_id);
            return Ok(IndexOutcome::Skipped);
        }

        let summary = ar.summary();
        log::info!(
            "📦 Indexing {} ({} records, {} tuples, {} individuals) into {}",
            batch_id,
            summary.total_records,
            summary.tuples,
            summary.individuals,
            self.store.backend_type()
        );

        let upd = self.update_with_retry(batch_id, ar).await?;
        self.set_indexed_with_retry(batch_id, &summary, &upd).await?;

        log::info!(
            "✅ Indexed {} in {:.2}s ({} inserted, {} updated)",
            batch_id,
            (summary.duration + upd.duration).as_secs_f64(),
            upd.inserted,
            upd.updated
        );
        Ok(IndexOutcome::Indexed(upd))
    }

    async fn update_with_retry(
        &self,
        batch_id: &str,
        mut ar: AggregationResult,
    ) -> Result<UpdateResult, StoreError> {
        let mut backoff = self.backoff();
        loop {
            // The last permitted attempt consumes the batch instead of copying it.
            let batch = if backoff.attempts() >= self.max_retries {
                std::mem::take(&mut ar)
            } else {
                ar.clone()
            };

            match self.store.update(batch).await {
                Ok(upd) => return Ok(upd),
                Err(e) if e.is_retriable() && e.merge_untouched() => {
                    log::warn!("⚠️  {} failed before merge: {}", batch_id, e);
                    if backoff.sleep().await.is_err() {
                        return Err(e);
                    }
                }
                Err(e) => {
                    log::error!("❌ {} not indexed: {}", batch_id, e);
                    return Err(e);
                }
            }
        }
    }

    async fn set_indexed_with_retry(
        &self,
        batch_id: &str,
        summary: &AggregationSummary,
        upd: &UpdateResult,
    ) -> Result<(), StoreError> {
        let mut backoff = self.backoff();
        loop {
            match self.store.set_indexed(batch_id, summary, upd).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retriable() => {
                    log::warn!("⚠️  Ledger write for {} timed out: {}", batch_id, e);
                    if backoff.sleep().await.is_err() {
                        return Err(e);
                    }
                }
                Err(e) => {
                    log::error!("❌ {} merged but not recorded in ledger: {}", batch_id, e);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{Aggregator, DnsObservation};
    use crate::error::Stage;
    use crate::store::sqlite::SqliteStore;
    use crate::store::{IndividualResult, TupleResult};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn batch() -> AggregationResult {
        let mut agg = Aggregator::new();
        agg.observe(&DnsObservation {
            ts: 1_700_000_000,
            query: "example.com".into(),
            qtype: "A".into(),
            answers: vec!["1.2.3.4".into()],
            ttls: vec![60],
        });
        agg.finish()
    }

    fn fast_retries(retries: u32) -> StoreConfig {
        let mut config = StoreConfig::from_uri("sqlite://:memory:").unwrap();
        config.max_retries = retries;
        config.retry_initial_delay = Duration::from_millis(1);
        config.retry_max_delay = Duration::from_millis(2);
        config
    }

    /// Wraps a real store and fails `update` a scripted number of times.
    struct FlakyStore {
        inner: SqliteStore,
        failures: Mutex<Vec<StoreError>>,
        updates: Mutex<u32>,
    }

    impl FlakyStore {
        async fn new(failures: Vec<StoreError>) -> Self {
            let inner = SqliteStore::open(":memory:").unwrap();
            inner.init().await.unwrap();
            Self {
                inner,
                failures: Mutex::new(failures),
                updates: Mutex::new(0),
            }
        }

        fn updates(&self) -> u32 {
            *self.updates.lock().unwrap()
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn init(&self) -> Result<(), StoreError> {
            self.inner.init().await
        }
        async fn clear(&self) -> Result<(), StoreError> {
            self.inner.clear().await
        }
        async fn begin(&self) -> Result<(), StoreError> {
            self.inner.begin().await
        }
        async fn commit(&self) -> Result<(), StoreError> {
            self.inner.commit().await
        }
        async fn delete_older_than(&self, days: u32) -> Result<u64, StoreError> {
            self.inner.delete_older_than(days).await
        }
        async fn update(&self, ar: AggregationResult) -> Result<UpdateResult, StoreError> {
            *self.updates.lock().unwrap() += 1;
            let failure = self.failures.lock().unwrap().pop();
            match failure {
                Some(e) => Err(e),
                None => self.inner.update(ar).await,
            }
        }
        async fn is_indexed(&self, batch_id: &str) -> Result<bool, StoreError> {
            self.inner.is_indexed(batch_id).await
        }
        async fn set_indexed(
            &self,
            batch_id: &str,
            agg: &AggregationSummary,
            upd: &UpdateResult,
        ) -> Result<(), StoreError> {
            self.inner.set_indexed(batch_id, agg, upd).await
        }
        async fn find_query_tuples(&self, query: &str) -> Result<Vec<TupleResult>, StoreError> {
            self.inner.find_query_tuples(query).await
        }
        async fn find_tuples(&self, name: &str) -> Result<Vec<TupleResult>, StoreError> {
            self.inner.find_tuples(name).await
        }
        async fn like_tuples(&self, suffix: &str) -> Result<Vec<TupleResult>, StoreError> {
            self.inner.like_tuples(suffix).await
        }
        async fn find_individual(&self, value: &str) -> Result<Vec<IndividualResult>, StoreError> {
            self.inner.find_individual(value).await
        }
        async fn like_individual(&self, suffix: &str) -> Result<Vec<IndividualResult>, StoreError> {
            self.inner.like_individual(suffix).await
        }
        fn backend_type(&self) -> &'static str {
            "Flaky"
        }
    }

    fn staging_timeout() -> StoreError {
        StoreError::Timeout("bulk load".into()).at(Stage::LoadTuples)
    }

    #[tokio::test]
    async fn test_second_run_is_skipped() {
        let store = FlakyStore::new(vec![]).await;
        let indexer = Indexer::new(&store);

        let first = indexer.index_batch("dns.log", batch()).await.unwrap();
        assert!(matches!(first, IndexOutcome::Indexed(_)));
        let second = indexer.index_batch("dns.log", batch()).await.unwrap();
        assert_eq!(second, IndexOutcome::Skipped);

        assert_eq!(store.updates(), 1);
        assert_eq!(store.find_query_tuples("example.com").await.unwrap()[0].count, 1);
    }

    #[tokio::test]
    async fn test_timeout_before_merge_is_retried() {
        let store = FlakyStore::new(vec![staging_timeout(), staging_timeout()]).await;
        let indexer = Indexer::new(&store).with_retry_policy(&fast_retries(3));

        let outcome = indexer.index_batch("dns.log", batch()).await.unwrap();
        assert!(matches!(outcome, IndexOutcome::Indexed(_)));
        assert_eq!(store.updates(), 3);
        assert!(store.is_indexed("dns.log").await.unwrap());
        assert_eq!(store.find_query_tuples("example.com").await.unwrap()[0].count, 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let store = FlakyStore::new(vec![staging_timeout(), staging_timeout()]).await;
        let indexer = Indexer::new(&store).with_retry_policy(&fast_retries(1));

        let err = indexer.index_batch("dns.log", batch()).await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(store.updates(), 2);
        assert!(!store.is_indexed("dns.log").await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_after_merge_is_not_retried() {
        let failure = StoreError::Timeout("merge".into()).at(Stage::MergeIndividuals);
        let store = FlakyStore::new(vec![failure]).await;
        let indexer = Indexer::new(&store).with_retry_policy(&fast_retries(3));

        let err = indexer.index_batch("dns.log", batch()).await.unwrap_err();
        assert_eq!(err.stage(), Some(Stage::MergeIndividuals));
        assert_eq!(store.updates(), 1);
        assert!(!store.is_indexed("dns.log").await.unwrap());
    }

    #[tokio::test]
    async fn test_non_retriable_error_fails_fast() {
        let failure = StoreError::Http {
            status: 500,
            body: "Code: 60".into(),
        }
        .at(Stage::CreateTuples);
        let store = FlakyStore::new(vec![failure]).await;
        let indexer = Indexer::new(&store).with_retry_policy(&fast_retries(3));

        assert!(indexer.index_batch("dns.log", batch()).await.is_err());
        assert_eq!(store.updates(), 1);
    }
}
