//! Merge committer
//!
//! Folds the staged raw rows into the permanent `AggregatingMergeTree`
//! tables as aggregate state. min/max/sum state combines associatively, so
//! the order in which batches land does not change the merged result.
//!
//! Staging tables are left in place on success; the next batch drops them.
//! There is no rollback: if tuples merge and individuals fail, the tuples
//! stay merged and the batch is simply not written to the ledger.

use super::client::Engine;
use super::schema::{INDIVIDUAL, INDIVIDUAL_STAGING, TUPLES, TUPLES_STAGING};
use crate::aggregation::{MergeFn, AGGREGATE_COLUMNS};
use crate::error::{Stage, StageExt, StoreError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MergeResult {
    pub duration: Duration,
    pub tuples_written: u64,
    pub individuals_written: u64,
}

impl MergeResult {
    pub fn rows_written(&self) -> u64 {
        self.tuples_written + self.individuals_written
    }
}

fn state_exprs() -> Vec<String> {
    AGGREGATE_COLUMNS
        .iter()
        .map(|(column, merge)| merge.state(column))
        .collect()
}

pub fn merge_tuples_sql() -> String {
    format!(
        "INSERT INTO {} (query, type, answer, ttl, first, last, count) \
         SELECT query, type, answer, {}, {} FROM {} GROUP BY query, type, answer",
        TUPLES,
        MergeFn::AnyLast.state("ttl"),
        state_exprs().join(", "),
        TUPLES_STAGING
    )
}

pub fn merge_individuals_sql() -> String {
    format!(
        "INSERT INTO {} (which, value, first, last, count) \
         SELECT which, value, {} FROM {} GROUP BY which, value",
        INDIVIDUAL,
        state_exprs().join(", "),
        INDIVIDUAL_STAGING
    )
}

pub struct MergeCommitter<'a> {
    engine: &'a dyn Engine,
}

impl<'a> MergeCommitter<'a> {
    pub fn new(engine: &'a dyn Engine) -> Self {
        Self { engine }
    }

    /// Merge staged tuples, then staged individuals.
    ///
    /// Takes no batch id: the batch is whatever `StagingLoader::stage` last
    /// loaded into the staging tables. The ledger names it afterwards.
    pub async fn commit(&self) -> Result<MergeResult, StoreError> {
        let start = Instant::now();

        let tuples = self
            .engine
            .exec(&merge_tuples_sql())
            .await
            .at(Stage::MergeTuples)?;
        let individuals = self
            .engine
            .exec(&merge_individuals_sql())
            .await
            .at(Stage::MergeIndividuals)?;

        Ok(MergeResult {
            duration: start.elapsed(),
            tuples_written: tuples.written_rows,
            individuals_written: individuals.written_rows,
        })
    }
}
