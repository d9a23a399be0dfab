//! Mergeable aggregate state
//!
//! Every aggregate column is a partial summary with an associative,
//! commutative `combine`. Combining two partial states gives the state that
//! would have been computed over the union of their inputs, so batches can
//! be merged in any order and any grouping.
//!
//! | Tag | Column | ClickHouse state | combine |
//! |---|---|---|---|
//! | `MinState` | first-seen | `minState` / `minMerge` | min |
//! | `MaxState` | last-seen | `maxState` / `maxMerge` | max |
//! | `SumState` | count | `sumState` / `sumMerge` | saturating add |
//! | `LastState` | ttl | `anyLastState` / `anyLastMerge` | right side wins |

use chrono::{DateTime, Utc};

/// Associative combine of two partial states of the same tag
pub trait Combine: Sized {
    fn combine(self, other: Self) -> Self;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinState(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxState(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SumState(pub u64);

/// Last-write-wins. Only associative, not commutative: the later batch wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastState(pub u16);

impl Combine for MinState {
    fn combine(self, other: Self) -> Self {
        MinState(self.0.min(other.0))
    }
}

impl Combine for MaxState {
    fn combine(self, other: Self) -> Self {
        MaxState(self.0.max(other.0))
    }
}

impl Combine for SumState {
    fn combine(self, other: Self) -> Self {
        SumState(self.0.saturating_add(other.0))
    }
}

impl Combine for LastState {
    fn combine(self, other: Self) -> Self {
        other
    }
}

/// Merge function attached to a stored column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeFn {
    Min,
    Max,
    Sum,
    AnyLast,
}

impl MergeFn {
    /// ClickHouse aggregate function name
    pub fn name(&self) -> &'static str {
        match self {
            MergeFn::Min => "min",
            MergeFn::Max => "max",
            MergeFn::Sum => "sum",
            MergeFn::AnyLast => "anyLast",
        }
    }

    /// `AggregateFunction(min, DateTime)`
    pub fn column_type(&self, inner: &str) -> String {
        format!("AggregateFunction({}, {})", self.name(), inner)
    }

    /// `minState(first)`: raw column to aggregate state
    pub fn state(&self, column: &str) -> String {
        format!("{}State({})", self.name(), column)
    }

    /// `minMerge(first)`: aggregate state to final value
    pub fn merge(&self, column: &str) -> String {
        format!("{}Merge({})", self.name(), column)
    }

    /// Row-level upsert expression for relational stores
    /// (`INSERT ... ON CONFLICT DO UPDATE SET column = <this>`).
    pub fn upsert(&self, column: &str) -> String {
        match self {
            MergeFn::Min => format!("min({0}, excluded.{0})", column),
            MergeFn::Max => format!("max({0}, excluded.{0})", column),
            MergeFn::Sum => format!("{0} + excluded.{0}", column),
            MergeFn::AnyLast => format!("excluded.{}", column),
        }
    }
}

/// Merge functions of the columns shared by both aggregate tables
pub const AGGREGATE_COLUMNS: [(&str, MergeFn); 3] = [
    ("first", MergeFn::Min),
    ("last", MergeFn::Max),
    ("count", MergeFn::Sum),
];

/// first-seen, last-seen and count for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateState {
    pub first: MinState,
    pub last: MaxState,
    pub count: SumState,
}

impl AggregateState {
    /// State of a single observation at `ts` (unix seconds).
    pub fn observed(ts: i64) -> Self {
        Self {
            first: MinState(ts),
            last: MaxState(ts),
            count: SumState(1),
        }
    }

    pub fn first_seen(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.first.0, 0)
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.last.0, 0)
    }

    pub fn count(&self) -> u64 {
        self.count.0
    }
}

impl Combine for AggregateState {
    fn combine(self, other: Self) -> Self {
        Self {
            first: self.first.combine(other.first),
            last: self.last.combine(other.last),
            count: self.count.combine(other.count),
        }
    }
}

/// Aggregate state of a (query, type, answer) tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleState {
    pub ttl: LastState,
    pub state: AggregateState,
}

impl TupleState {
    pub fn observed(ts: i64, ttl: u16) -> Self {
        Self {
            ttl: LastState(ttl),
            state: AggregateState::observed(ts),
        }
    }
}

impl Combine for TupleState {
    fn combine(self, other: Self) -> Self {
        Self {
            ttl: self.ttl.combine(other.ttl),
            state: self.state.combine(other.state),
        }
    }
}
