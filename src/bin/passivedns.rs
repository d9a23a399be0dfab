//! passivedns - Store Driver
//!
//! Indexes Zeek JSON `dns.log` files into the aggregate store and runs
//! lookups against it.
//!
//! ## Usage
//!
//! ```bash
//! passivedns init
//! passivedns index dns.00:00:00-01:00:00.log dns.01:00:00-02:00:00.log
//! passivedns find example.com
//! passivedns like example.com
//! ```
//!
//! Commands: `init`, `clear`, `index <file>...`, `find <name>`,
//! `find-query <name>`, `like <suffix>`, `individual <value>`,
//! `like-individual <suffix>`. Results are printed to stdout as JSON lines.
//!
//! ## Environment Variables
//!
//! - PASSIVEDNS_STORE - Store URI (default: clickhouse://localhost:8123/default)
//! - CLICKHOUSE_QUERY_TIMEOUT_SECS - DDL/query timeout (default: 5)
//! - CLICKHOUSE_BULK_TIMEOUT_SECS - Bulk load timeout (default: 60)
//! - INDEX_MAX_RETRIES - Retries of a batch that timed out before merge (default: 3)
//! - RETRY_INITIAL_DELAY_MS / RETRY_MAX_DELAY_MS - Backoff bounds (default: 500 / 30000)
//! - RUST_LOG - Logging level (optional, default: info)

use passivedns::{open_store, Aggregator, IndexOutcome, Indexer, Store, StoreConfig};
use serde::Serialize;
use std::env;
use std::fs::File;
use std::io::{BufReader, Write};

const USAGE: &str = "usage: passivedns <init | clear | index <file>... | find <name> | \
find-query <name> | like <suffix> | individual <value> | like-individual <suffix>>";

#[derive(Debug)]
enum Command {
    Init,
    Clear,
    Index(Vec<String>),
    Find(String),
    FindQuery(String),
    Like(String),
    Individual(String),
    LikeIndividual(String),
}

fn parse_command_from_args() -> Result<Command, String> {
    let args: Vec<String> = env::args().skip(1).collect();
    let (name, rest) = args.split_first().ok_or_else(|| USAGE.to_string())?;

    let single = |rest: &[String]| -> Result<String, String> {
        match rest {
            [value] => Ok(value.clone()),
            _ => Err(format!("'{}' takes exactly one argument\n{}", name, USAGE)),
        }
    };

    match name.as_str() {
        "init" => Ok(Command::Init),
        "clear" => Ok(Command::Clear),
        "index" if !rest.is_empty() => Ok(Command::Index(rest.to_vec())),
        "index" => Err(format!("'index' needs at least one file\n{}", USAGE)),
        "find" => single(rest).map(Command::Find),
        "find-query" => single(rest).map(Command::FindQuery),
        "like" => single(rest).map(Command::Like),
        "individual" => single(rest).map(Command::Individual),
        "like-individual" => single(rest).map(Command::LikeIndividual),
        other => Err(format!("unknown command '{}'\n{}", other, USAGE)),
    }
}

fn print_rows<T: Serialize>(rows: &[T]) -> Result<(), Box<dyn std::error::Error>> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for row in rows {
        serde_json::to_writer(&mut out, row)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    log::info!("📊 {} rows", rows.len());
    Ok(())
}

async fn index_files(
    store: &dyn Store,
    config: &StoreConfig,
    files: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let indexer = Indexer::new(store).with_retry_policy(config);
    let mut indexed = 0;
    let mut skipped = 0;

    for path in files {
        // Check the ledger before spending time on aggregation.
        if indexer.is_indexed(path).await? {
            log::info!("⏭️  {} already indexed, skipping", path);
            skipped += 1;
            continue;
        }

        let mut aggregator = Aggregator::new();
        aggregator.ingest_reader(BufReader::new(File::open(path)?))?;
        let ar = aggregator.finish();

        match indexer.index_batch(path, ar).await? {
            IndexOutcome::Indexed(_) => indexed += 1,
            IndexOutcome::Skipped => skipped += 1,
        }
    }

    log::info!("✅ Done: {} indexed, {} skipped", indexed, skipped);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    dotenv::dotenv().ok();

    let command = match parse_command_from_args() {
        Ok(command) => command,
        Err(usage) => {
            eprintln!("{}", usage);
            std::process::exit(2);
        }
    };

    let config = StoreConfig::from_env()?;
    let store = open_store(&config).await?;
    log::info!("🚀 passivedns using {} store", store.backend_type());

    match command {
        Command::Init => store.init().await?,
        Command::Clear => {
            store.clear().await?;
            log::info!("🧹 Store cleared");
        }
        Command::Index(files) => index_files(store.as_ref(), &config, &files).await?,
        Command::Find(name) => print_rows(&store.find_tuples(&name).await?)?,
        Command::FindQuery(name) => print_rows(&store.find_query_tuples(&name).await?)?,
        Command::Like(suffix) => print_rows(&store.like_tuples(&suffix).await?)?,
        Command::Individual(value) => print_rows(&store.find_individual(&value).await?)?,
        Command::LikeIndividual(suffix) => print_rows(&store.like_individual(&suffix).await?)?,
    }

    Ok(())
}
