//! Indexing ledger
//!
//! One immutable `filenames` row per fully merged batch. A batch without a
//! row is unprocessed, however much of it reached the aggregate tables.

use super::client::Engine;
use super::schema::LEDGER;
use crate::aggregation::AggregationSummary;
use crate::codec::JsonLines;
use crate::error::{Stage, StageExt, StoreError};
use crate::store::{BatchRecord, UpdateResult};

pub struct IndexingLedger<'a> {
    engine: &'a dyn Engine,
}

impl<'a> IndexingLedger<'a> {
    pub fn new(engine: &'a dyn Engine) -> Self {
        Self { engine }
    }

    pub async fn is_indexed(&self, batch_id: &str) -> Result<bool, StoreError> {
        let sql = format!(
            "SELECT filename FROM {} WHERE filename = {{filename:String}} LIMIT 1",
            LEDGER
        );
        let rows = self
            .engine
            .select(&sql, &[("filename", batch_id.to_string())])
            .await
            .at(Stage::IsIndexed)?;
        Ok(!rows.is_empty())
    }

    pub async fn set_indexed(
        &self,
        batch_id: &str,
        agg: &AggregationSummary,
        upd: &UpdateResult,
    ) -> Result<(), StoreError> {
        let record = BatchRecord::new(batch_id, agg, upd);
        self.engine
            .send_bulk(LEDGER, JsonLines::from_rows(vec![record]))
            .await
            .at(Stage::SetIndexed)?;
        Ok(())
    }
}
