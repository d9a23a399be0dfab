//! # passivedns
//!
//! Running, mergeable statistics over observed DNS query/answer pairs.
//!
//! # Architecture
//!
//! ```text
//! dns.log → Aggregator → AggregationResult
//!     ↓
//! Row codec (JSONEachRow, reversed keys)
//!     ↓
//! Staging loader (ephemeral Log tables)
//!     ↓
//! Merge committer (minState / maxState / sumState / anyLastState)
//!     ↓
//! Indexing ledger (one row per batch, written last)
//! ```
//!
//! Lookups run against the merged aggregate tables at any time through the
//! [`Store`] trait. Two backends implement it: [`ClickHouseStore`] (merged
//! aggregate state, no transactions) and [`SqliteStore`] (row-level upserts
//! inside a transaction).

pub mod aggregation;
pub mod codec;
pub mod config;
pub mod error;
pub mod indexer;
pub mod retry;
pub mod reverse;
pub mod store;

pub use aggregation::{
    AggregateState, AggregationResult, AggregationSummary, Aggregator, DnsObservation,
    IndividualKey, TupleKey, TupleState, Which,
};
pub use config::{ConfigError, StoreBackend, StoreConfig};
pub use error::{ErrorKind, Stage, StoreError};
pub use indexer::{IndexOutcome, Indexer};
pub use reverse::reverse;
pub use store::{
    clickhouse::ClickHouseStore, open_store, sqlite::SqliteStore, IndividualResult, Store,
    TupleResult, UpdateResult,
};
