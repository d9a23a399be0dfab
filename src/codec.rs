//! Aggregate row codec
//!
//! Turns an `AggregationResult` into staging rows, one per key, and from
//! there into a `JSONEachRow` byte stream for ClickHouse bulk inserts.
//!
//! Rows are produced lazily while the source map is consumed, so a bulk load
//! only ever holds one serialized row in memory. The stream is single pass.
//!
//! Key orientation is fixed here for every backend: tuple `query` and
//! Query-typed individual values are reversed, tuple `answer` and
//! Answer-typed individual values keep natural order.

use crate::aggregation::{AggregateState, IndividualKey, TupleKey, TupleState, Which};
use crate::reverse::reverse;
use serde::Serialize;
use std::collections::HashMap;

/// Staging row of the tuples table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TupleRow {
    pub query: String,
    #[serde(rename = "type")]
    pub qtype: String,
    pub answer: String,
    pub ttl: u16,
    /// Unix seconds
    pub first: i64,
    pub last: i64,
    pub count: u64,
}

/// Staging row of the individual table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndividualRow {
    pub which: Which,
    pub value: String,
    pub first: i64,
    pub last: i64,
    pub count: u64,
}

impl TupleRow {
    pub fn from_state(key: TupleKey, state: TupleState, reversed: bool) -> Self {
        Self {
            query: if reversed { reverse(&key.query) } else { key.query },
            qtype: key.qtype,
            answer: key.answer,
            ttl: state.ttl.0,
            first: state.state.first.0,
            last: state.state.last.0,
            count: state.state.count.0,
        }
    }
}

impl IndividualRow {
    pub fn from_state(key: IndividualKey, state: AggregateState, reversed: bool) -> Self {
        let value = match key.which {
            Which::Query if reversed => reverse(&key.value),
            _ => key.value,
        };
        Self {
            which: key.which,
            value,
            first: state.first.0,
            last: state.last.0,
            count: state.count.0,
        }
    }
}

/// Lazy, single-pass sequence of typed rows
pub struct RowStream<R> {
    inner: Box<dyn Iterator<Item = R> + Send + Sync>,
    len: usize,
}

impl<R> Iterator for RowStream<R> {
    type Item = R;

    fn next(&mut self) -> Option<R> {
        let row = self.inner.next()?;
        self.len = self.len.saturating_sub(1);
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.len, Some(self.len))
    }
}

impl<R> ExactSizeIterator for RowStream<R> {}

impl<R: Serialize + 'static> RowStream<R> {
    /// Serialize each row as one `JSONEachRow` line.
    pub fn into_json_lines(self) -> JsonLines {
        let len = self.len;
        JsonLines {
            inner: Box::new(self.map(|row| -> Result<Vec<u8>, serde_json::Error> {
                let mut line = serde_json::to_vec(&row)?;
                line.push(b'\n');
                Ok(line)
            })),
            len,
        }
    }
}

/// Stream tuple rows out of `tuples`.
pub fn tuple_rows(tuples: HashMap<TupleKey, TupleState>, reversed: bool) -> RowStream<TupleRow> {
    let len = tuples.len();
    RowStream {
        inner: Box::new(
            tuples
                .into_iter()
                .map(move |(k, s)| TupleRow::from_state(k, s, reversed)),
        ),
        len,
    }
}

/// Stream individual rows out of `individuals`.
pub fn individual_rows(
    individuals: HashMap<IndividualKey, AggregateState>,
    reversed: bool,
) -> RowStream<IndividualRow> {
    let len = individuals.len();
    RowStream {
        inner: Box::new(
            individuals
                .into_iter()
                .map(move |(k, s)| IndividualRow::from_state(k, s, reversed)),
        ),
        len,
    }
}

/// Newline-delimited JSON rows, produced one at a time
pub struct JsonLines {
    inner: Box<dyn Iterator<Item = Result<Vec<u8>, serde_json::Error>> + Send + Sync>,
    len: usize,
}

impl JsonLines {
    /// Lines from rows that are already materialized (single ledger rows).
    pub fn from_rows<R: Serialize + Send + Sync + 'static>(rows: Vec<R>) -> Self {
        let len = rows.len();
        RowStream {
            inner: Box::new(rows.into_iter()),
            len,
        }
        .into_json_lines()
    }

    /// Rows not yet produced
    pub fn remaining(&self) -> usize {
        self.len
    }
}

impl Iterator for JsonLines {
    type Item = Result<Vec<u8>, serde_json::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = self.inner.next()?;
        self.len = self.len.saturating_sub(1);
        Some(line)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.len, Some(self.len))
    }
}

impl ExactSizeIterator for JsonLines {}
