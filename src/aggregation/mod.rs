//! Aggregation of raw DNS observations into mergeable batch state
//!
//! ```text
//! dns.log line → DnsObservation → Aggregator → AggregationResult
//! ```

pub mod aggregator;
pub mod merge_state;
pub mod observation;

pub use aggregator::{
    AggregationResult, AggregationSummary, Aggregator, IndividualKey, TupleKey, Which,
};
pub use merge_state::{
    AggregateState, Combine, LastState, MaxState, MergeFn, MinState, SumState, TupleState,
    AGGREGATE_COLUMNS,
};
pub use observation::{normalize_answer, normalize_name, DnsObservation};
