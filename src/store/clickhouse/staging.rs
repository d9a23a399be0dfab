//! Staging loader
//!
//! Recreates the per-batch staging tables and bulk-loads the batch into
//! them. Staging tables are dropped *before* each batch, never after, so a
//! failed batch leaves its raw rows behind for inspection.

use super::client::Engine;
use super::schema::{individual_staging, tuples_staging, INDIVIDUAL_STAGING, TUPLES_STAGING};
use crate::codec::{IndividualRow, RowStream, TupleRow};
use crate::error::{Stage, StageExt, StoreError};

pub struct StagingLoader<'a> {
    engine: &'a dyn Engine,
}

impl<'a> StagingLoader<'a> {
    pub fn new(engine: &'a dyn Engine) -> Self {
        Self { engine }
    }

    /// Drop, recreate and fill both staging tables. Any failure aborts the
    /// batch with the failing step named in the error.
    pub async fn stage(
        &self,
        tuples: RowStream<TupleRow>,
        individuals: RowStream<IndividualRow>,
    ) -> Result<(), StoreError> {
        self.drop_staging().await;

        self.engine.exec(&tuples_staging()).await.at(Stage::CreateTuples)?;
        self.engine
            .exec(&individual_staging())
            .await
            .at(Stage::CreateIndividuals)?;

        let tuple_count = tuples.len();
        self.engine
            .send_bulk(TUPLES_STAGING, tuples.into_json_lines())
            .await
            .at(Stage::LoadTuples)?;

        let individual_count = individuals.len();
        self.engine
            .send_bulk(INDIVIDUAL_STAGING, individuals.into_json_lines())
            .await
            .at(Stage::LoadIndividuals)?;

        log::debug!(
            "Staged {} tuples, {} individuals",
            tuple_count,
            individual_count
        );
        Ok(())
    }

    /// Best effort: a missing table is not an error.
    async fn drop_staging(&self) {
        for table in [TUPLES_STAGING, INDIVIDUAL_STAGING] {
            let sql = format!("DROP TABLE IF EXISTS {}", table);
            if let Err(e) = self.engine.exec(&sql).await {
                log::warn!(
                    "⚠️  Failed to drop staging table {}: {}",
                    table,
                    e.at(Stage::DropStaging)
                );
            }
        }
    }
}
