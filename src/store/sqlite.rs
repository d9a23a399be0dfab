//! SQLite store
//!
//! Permanent tables hold final values keyed like the ClickHouse tables.
//! A batch is applied with row-level upserts inside one savepoint, so it
//! lands completely or not at all. Key orientation matches ClickHouse:
//! tuple queries and Query-typed individual values are stored reversed.

use crate::aggregation::{AggregationResult, AggregationSummary, MergeFn, Which, AGGREGATE_COLUMNS};
use crate::codec::{individual_rows, tuple_rows};
use crate::error::{Stage, StageExt, StoreError};
use crate::reverse::{natural_suffix_pattern, reversed_suffix_pattern};
use crate::store::{
    unreverse_individuals, unreverse_tuples, BatchRecord, IndividualResult, LookupTerm, Store,
    TupleResult, UpdateResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tuples (
    query TEXT NOT NULL,
    type TEXT NOT NULL,
    answer TEXT NOT NULL,
    ttl INTEGER NOT NULL,
    first INTEGER NOT NULL,
    last INTEGER NOT NULL,
    count INTEGER NOT NULL,
    PRIMARY KEY (query, type, answer)
);
CREATE INDEX IF NOT EXISTS idx_tuples_answer ON tuples(answer);
CREATE TABLE IF NOT EXISTS individual (
    which TEXT NOT NULL,
    value TEXT NOT NULL,
    first INTEGER NOT NULL,
    last INTEGER NOT NULL,
    count INTEGER NOT NULL,
    PRIMARY KEY (which, value)
);
CREATE TABLE IF NOT EXISTS filenames (
    ts INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    filename TEXT NOT NULL,
    aggregation_time REAL NOT NULL,
    total_records INTEGER NOT NULL,
    skipped_records INTEGER NOT NULL,
    tuples INTEGER NOT NULL,
    individual INTEGER NOT NULL,
    store_time REAL NOT NULL,
    inserted INTEGER NOT NULL,
    updated INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_filenames_filename ON filenames(filename);
";

const TUPLE_SELECT: &str = "SELECT query, type, answer, ttl, first, last, count FROM tuples";
const TUPLE_ORDER: &str = "ORDER BY query, answer, type";

const INDIVIDUAL_SELECT: &str = "SELECT which, value, first, last, count FROM individual";
const INDIVIDUAL_ORDER: &str = "ORDER BY value, CASE which WHEN 'Q' THEN 0 ELSE 1 END";

fn upsert_set(with_ttl: bool) -> String {
    let mut sets = Vec::new();
    if with_ttl {
        sets.push(format!("ttl = {}", MergeFn::AnyLast.upsert("ttl")));
    }
    for (column, merge) in AGGREGATE_COLUMNS {
        sets.push(format!("{} = {}", column, merge.upsert(column)));
    }
    sets.join(", ")
}

fn upsert_tuple_sql() -> String {
    format!(
        "INSERT INTO tuples (query, type, answer, ttl, first, last, count) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT(query, type, answer) DO UPDATE SET {}",
        upsert_set(true)
    )
}

fn upsert_individual_sql() -> String {
    format!(
        "INSERT INTO individual (which, value, first, last, count) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(which, value) DO UPDATE SET {}",
        upsert_set(false)
    )
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn count_from_sql(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn count_to_sql(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn tuple_from_row(row: &Row<'_>) -> rusqlite::Result<TupleResult> {
    let ttl: i64 = row.get(3)?;
    Ok(TupleResult {
        query: row.get(0)?,
        qtype: row.get(1)?,
        answer: row.get(2)?,
        ttl: u16::try_from(ttl).unwrap_or(u16::MAX),
        first: timestamp(row.get(4)?),
        last: timestamp(row.get(5)?),
        count: count_from_sql(row.get(6)?),
    })
}

fn individual_from_row(row: &Row<'_>) -> rusqlite::Result<IndividualResult> {
    let which: String = row.get(0)?;
    let which = which.parse::<Which>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(IndividualResult {
        which,
        value: row.get(1)?,
        first: timestamp(row.get(2)?),
        last: timestamp(row.get(3)?),
        count: count_from_sql(row.get(4)?),
    })
}

fn table_rows(conn: &Connection, table: &str) -> rusqlite::Result<u64> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
    Ok(count_from_sql(n))
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`. `:memory:` opens a private
    /// in-memory database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = if path == Path::new(":memory:") {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Connection(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
            Connection::open(path)?
        };

        // Non-name rdata keeps its case; LIKE must not fold it.
        conn.execute_batch("PRAGMA case_sensitive_like = ON;")?;

        log::info!("✅ SQLite store opened at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Connection("SQLite connection lock poisoned".to_string()))
    }

    fn tuples(
        &self,
        predicate: &str,
        params: &[&dyn rusqlite::ToSql],
        stage: Stage,
    ) -> Result<Vec<TupleResult>, StoreError> {
        let conn = self.conn()?;
        let sql = format!("{} WHERE {} {}", TUPLE_SELECT, predicate, TUPLE_ORDER);
        let mut stmt = conn.prepare(&sql).at(stage)?;
        let mut rows = stmt
            .query_map(params, tuple_from_row)
            .at(stage)?
            .collect::<Result<Vec<_>, _>>()
            .at(stage)?;
        unreverse_tuples(&mut rows);
        Ok(rows)
    }

    fn individuals(
        &self,
        predicate: &str,
        params: &[&dyn rusqlite::ToSql],
        stage: Stage,
    ) -> Result<Vec<IndividualResult>, StoreError> {
        let conn = self.conn()?;
        let sql = format!("{} WHERE {} {}", INDIVIDUAL_SELECT, predicate, INDIVIDUAL_ORDER);
        let mut stmt = conn.prepare(&sql).at(stage)?;
        let mut rows = stmt
            .query_map(params, individual_from_row)
            .at(stage)?
            .collect::<Result<Vec<_>, _>>()
            .at(stage)?;
        unreverse_individuals(&mut rows);
        Ok(rows)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn init(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(SCHEMA).at(Stage::Init)?;
        log::info!("✅ SQLite schema ready");
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.conn()?
            .execute_batch("DELETE FROM filenames; DELETE FROM individual; DELETE FROM tuples;")
            .at(Stage::Clear)
    }

    async fn begin(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch("BEGIN")?;
        Ok(())
    }

    async fn commit(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch("COMMIT")?;
        Ok(())
    }

    async fn delete_older_than(&self, _days: u32) -> Result<u64, StoreError> {
        Err(StoreError::Unsupported("SQLite store does not support deleting old records"))
    }

    async fn update(&self, ar: AggregationResult) -> Result<UpdateResult, StoreError> {
        let start = Instant::now();
        let AggregationResult {
            tuples, individuals, ..
        } = ar;
        let processed = (tuples.len() + individuals.len()) as u64;

        let mut conn = self.conn()?;
        // A savepoint nests inside a caller's BEGIN as well as standing alone.
        let sp = conn.savepoint()?;

        let before = table_rows(&sp, "tuples")? + table_rows(&sp, "individual")?;
        {
            let mut stmt = sp.prepare(&upsert_tuple_sql()).at(Stage::MergeTuples)?;
            for row in tuple_rows(tuples, true) {
                stmt.execute(params![
                    row.query,
                    row.qtype,
                    row.answer,
                    row.ttl,
                    row.first,
                    row.last,
                    count_to_sql(row.count),
                ])
                .at(Stage::MergeTuples)?;
            }

            let mut stmt = sp
                .prepare(&upsert_individual_sql())
                .at(Stage::MergeIndividuals)?;
            for row in individual_rows(individuals, true) {
                stmt.execute(params![
                    row.which.as_str(),
                    row.value,
                    row.first,
                    row.last,
                    count_to_sql(row.count),
                ])
                .at(Stage::MergeIndividuals)?;
            }
        }
        let after = table_rows(&sp, "tuples")? + table_rows(&sp, "individual")?;
        sp.commit()?;

        let inserted = after.saturating_sub(before);
        log::debug!(
            "✅ Upserted {} rows into SQLite ({} new)",
            processed,
            inserted
        );

        Ok(UpdateResult {
            duration: start.elapsed(),
            inserted,
            updated: processed.saturating_sub(inserted),
        })
    }

    async fn is_indexed(&self, batch_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT 1 FROM filenames WHERE filename = ?1 LIMIT 1")
            .at(Stage::IsIndexed)?;
        stmt.exists([batch_id]).at(Stage::IsIndexed)
    }

    async fn set_indexed(
        &self,
        batch_id: &str,
        agg: &AggregationSummary,
        upd: &UpdateResult,
    ) -> Result<(), StoreError> {
        let rec = BatchRecord::new(batch_id, agg, upd);
        self.conn()?
            .execute(
                "INSERT INTO filenames
                 (filename, aggregation_time, total_records, skipped_records, tuples,
                  individual, store_time, inserted, updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    rec.filename,
                    rec.aggregation_time,
                    count_to_sql(rec.total_records),
                    count_to_sql(rec.skipped_records),
                    count_to_sql(rec.tuples),
                    count_to_sql(rec.individual),
                    rec.store_time,
                    count_to_sql(rec.inserted),
                    count_to_sql(rec.updated),
                ],
            )
            .at(Stage::SetIndexed)?;
        Ok(())
    }

    async fn find_query_tuples(&self, query: &str) -> Result<Vec<TupleResult>, StoreError> {
        let term = LookupTerm::new(query);
        self.tuples("query = ?1", &[&term.reversed], Stage::FindQueryTuples)
    }

    async fn find_tuples(&self, name: &str) -> Result<Vec<TupleResult>, StoreError> {
        let term = LookupTerm::new(name);
        self.tuples(
            "query = ?1 OR answer IN (?2, ?3)",
            &[&term.reversed, &term.name, &term.literal],
            Stage::FindTuples,
        )
    }

    async fn like_tuples(&self, suffix: &str) -> Result<Vec<TupleResult>, StoreError> {
        let term = LookupTerm::new(suffix);
        let rq_like = reversed_suffix_pattern(&term.reversed);
        let q_like = natural_suffix_pattern(&term.name);
        self.tuples(
            "query = ?1 OR query LIKE ?2 ESCAPE '\\' \
             OR answer IN (?3, ?4) OR answer LIKE ?5 ESCAPE '\\'",
            &[&term.reversed, &rq_like, &term.name, &term.literal, &q_like],
            Stage::LikeTuples,
        )
    }

    async fn find_individual(&self, value: &str) -> Result<Vec<IndividualResult>, StoreError> {
        let term = LookupTerm::new(value);
        self.individuals(
            "(which = 'A' AND value IN (?1, ?2)) OR (which = 'Q' AND value = ?3)",
            &[&term.name, &term.literal, &term.reversed],
            Stage::FindIndividual,
        )
    }

    async fn like_individual(&self, suffix: &str) -> Result<Vec<IndividualResult>, StoreError> {
        let term = LookupTerm::new(suffix);
        let v_like = natural_suffix_pattern(&term.name);
        let rv_like = reversed_suffix_pattern(&term.reversed);
        self.individuals(
            "(which = 'A' AND (value IN (?1, ?2) OR value LIKE ?3 ESCAPE '\\')) \
             OR (which = 'Q' AND (value = ?4 OR value LIKE ?5 ESCAPE '\\'))",
            &[&term.name, &term.literal, &v_like, &term.reversed, &rv_like],
            Stage::LikeIndividual,
        )
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}
