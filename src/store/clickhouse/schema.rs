//! Table definitions
//!
//! Permanent tables keep aggregate state per key; staging tables keep raw
//! per-batch rows in a plain `Log` engine and are recreated for every batch.

use crate::aggregation::{MergeFn, AGGREGATE_COLUMNS};

pub const TUPLES: &str = "tuples";
pub const INDIVIDUAL: &str = "individual";
pub const LEDGER: &str = "filenames";

pub const TUPLES_STAGING: &str = "tuples_temp";
pub const INDIVIDUAL_STAGING: &str = "individual_temp";

const WHICH_ENUM: &str = "Enum8('Q' = 0, 'A' = 1)";

fn inner_type(column: &str) -> &'static str {
    match column {
        "count" => "UInt64",
        "ttl" => "UInt16",
        _ => "DateTime",
    }
}

fn state_columns(with_ttl: bool) -> String {
    let mut cols = Vec::new();
    if with_ttl {
        cols.push(format!("    ttl {}", MergeFn::AnyLast.column_type(inner_type("ttl"))));
    }
    for (name, merge) in AGGREGATE_COLUMNS {
        cols.push(format!("    {} {}", name, merge.column_type(inner_type(name))));
    }
    cols.join(",\n")
}

/// `CREATE TABLE IF NOT EXISTS` for the three permanent tables
pub fn permanent_tables() -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    query String,\n    type String,\n    answer String,\n{}\n) ENGINE = AggregatingMergeTree ORDER BY (query, type, answer)",
            TUPLES,
            state_columns(true)
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    which {},\n    value String,\n{}\n) ENGINE = AggregatingMergeTree ORDER BY (which, value)",
            INDIVIDUAL,
            WHICH_ENUM,
            state_columns(false)
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
    ts DateTime DEFAULT now(),
    filename String,
    aggregation_time Float64,
    total_records UInt64,
    skipped_records UInt64,
    tuples UInt64,
    individual UInt64,
    store_time Float64,
    inserted UInt64,
    updated UInt64
) ENGINE = MergeTree ORDER BY filename",
            LEDGER
        ),
    ]
}

pub fn tuples_staging() -> String {
    format!(
        "CREATE TABLE {} (
    query String,
    type String,
    answer String,
    ttl UInt16,
    first DateTime,
    last DateTime,
    count UInt64
) ENGINE = Log",
        TUPLES_STAGING
    )
}

pub fn individual_staging() -> String {
    format!(
        "CREATE TABLE {} (
    which {},
    value String,
    first DateTime,
    last DateTime,
    count UInt64
) ENGINE = Log",
        INDIVIDUAL_STAGING, WHICH_ENUM
    )
}
