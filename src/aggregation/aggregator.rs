//! Batch aggregation of DNS observations
//!
//! Folds raw observations into one mergeable state per tuple and per
//! individual value. The result is what the store ingests as a single batch.

use super::merge_state::{AggregateState, Combine, TupleState};
use super::observation::{normalize_answer, normalize_name, DnsObservation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::BufRead;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Role of an individual value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Which {
    #[serde(rename = "Q")]
    Query,
    #[serde(rename = "A")]
    Answer,
}

impl Which {
    pub fn as_str(&self) -> &'static str {
        match self {
            Which::Query => "Q",
            Which::Answer => "A",
        }
    }
}

impl FromStr for Which {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Q" => Ok(Which::Query),
            "A" => Ok(Which::Answer),
            other => Err(format!("unknown which '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TupleKey {
    pub query: String,
    pub qtype: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndividualKey {
    pub which: Which,
    pub value: String,
}

/// In-memory aggregation of one batch
#[derive(Debug, Clone, Default)]
pub struct AggregationResult {
    pub tuples: HashMap<TupleKey, TupleState>,
    pub individuals: HashMap<IndividualKey, AggregateState>,
    pub total_records: u64,
    pub skipped_records: u64,
    pub duration: Duration,
}

/// Aggregation statistics recorded in the ledger
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregationSummary {
    pub duration: Duration,
    pub total_records: u64,
    pub skipped_records: u64,
    pub tuples: u64,
    pub individuals: u64,
}

impl AggregationResult {
    pub fn summary(&self) -> AggregationSummary {
        AggregationSummary {
            duration: self.duration,
            total_records: self.total_records,
            skipped_records: self.skipped_records,
            tuples: self.tuples.len() as u64,
            individuals: self.individuals.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty() && self.individuals.is_empty()
    }

    /// Fold another batch into this one.
    pub fn merge(&mut self, other: AggregationResult) {
        for (key, state) in other.tuples {
            merge_into(&mut self.tuples, key, state);
        }
        for (key, state) in other.individuals {
            merge_into(&mut self.individuals, key, state);
        }
        self.total_records += other.total_records;
        self.skipped_records += other.skipped_records;
        self.duration += other.duration;
    }
}

fn merge_into<K, S>(map: &mut HashMap<K, S>, key: K, state: S)
where
    K: std::hash::Hash + Eq,
    S: Combine + Copy,
{
    map.entry(key)
        .and_modify(|existing| *existing = existing.combine(state))
        .or_insert(state);
}

/// Builds an `AggregationResult` one observation at a time.
pub struct Aggregator {
    result: AggregationResult,
    started: Instant,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            result: AggregationResult::default(),
            started: Instant::now(),
        }
    }

    pub fn observe(&mut self, obs: &DnsObservation) {
        self.result.total_records += 1;

        let query = normalize_name(&obs.query);
        if query.is_empty() || obs.answers.is_empty() {
            self.result.skipped_records += 1;
            return;
        }

        merge_into(
            &mut self.result.individuals,
            IndividualKey {
                which: Which::Query,
                value: query.clone(),
            },
            AggregateState::observed(obs.ts),
        );

        for (idx, answer) in obs.answers.iter().enumerate() {
            let answer = normalize_answer(&obs.qtype, answer);
            if answer.trim().is_empty() {
                continue;
            }

            merge_into(
                &mut self.result.tuples,
                TupleKey {
                    query: query.clone(),
                    qtype: obs.qtype.clone(),
                    answer: answer.clone(),
                },
                TupleState::observed(obs.ts, obs.ttl_at(idx)),
            );
            merge_into(
                &mut self.result.individuals,
                IndividualKey {
                    which: Which::Answer,
                    value: answer,
                },
                AggregateState::observed(obs.ts),
            );
        }
    }

    /// Count a line that could not be parsed.
    pub fn skip(&mut self) {
        self.result.total_records += 1;
        self.result.skipped_records += 1;
    }

    /// Aggregate every JSON line of `reader`. Blank and `#` lines are ignored.
    pub fn ingest_reader<R: BufRead>(&mut self, reader: R) -> std::io::Result<()> {
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match DnsObservation::from_json_line(trimmed) {
                Ok(obs) => self.observe(&obs),
                Err(e) => {
                    log::debug!("Skipping unparseable record: {}", e);
                    self.skip();
                }
            }
        }
        Ok(())
    }

    pub fn finish(mut self) -> AggregationResult {
        self.result.duration = self.started.elapsed();
        log::debug!(
            "Aggregated {} records ({} skipped) into {} tuples, {} individuals",
            self.result.total_records,
            self.result.skipped_records,
            self.result.tuples.len(),
            self.result.individuals.len()
        );
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(ts: i64, query: &str, qtype: &str, answers: &[&str]) -> DnsObservation {
        DnsObservation {
            ts,
            query: query.to_string(),
            qtype: qtype.to_string(),
            answers: answers.iter().map(|s| s.to_string()).collect(),
            ttls: vec![300; answers.len()],
        }
    }

    #[test]
    fn test_same_tuple_twice() {
        let mut agg = Aggregator::new();
        agg.observe(&obs(1_700_000_000, "example.com", "A", &["1.2.3.4"]));
        agg.observe(&obs(1_700_000_000, "example.com", "A", &["1.2.3.4"]));
        let ar = agg.finish();

        assert_eq!(ar.tuples.len(), 1);
        let state = ar.tuples.values().next().unwrap();
        assert_eq!(state.state.count(), 2);
        assert_eq!(state.state.first.0, 1_700_000_000);
        assert_eq!(state.state.last.0, 1_700_000_000);
        assert_eq!(ar.total_records, 2);
        assert_eq!(ar.skipped_records, 0);
    }

    #[test]
    fn test_individuals_by_role() {
        let mut agg = Aggregator::new();
        agg.observe(&obs(10, "www.example.com", "CNAME", &["example.com"]));
        agg.observe(&obs(20, "example.com", "A", &["1.2.3.4", "5.6.7.8"]));
        let ar = agg.finish();

        assert_eq!(ar.tuples.len(), 3);
        let q = IndividualKey {
            which: Which::Query,
            value: "example.com".into(),
        };
        let a = IndividualKey {
            which: Which::Answer,
            value: "example.com".into(),
        };
        assert_eq!(ar.individuals[&q].count(), 1);
        assert_eq!(ar.individuals[&q].first.0, 20);
        assert_eq!(ar.individuals[&a].count(), 1);
        assert_eq!(ar.individuals[&a].first.0, 10);
        // www.example.com(Q), example.com(Q), example.com(A), 1.2.3.4, 5.6.7.8
        assert_eq!(ar.individuals.len(), 5);
    }

    #[test]
    fn test_skips_unanswered() {
        let mut agg = Aggregator::new();
        agg.observe(&obs(1, "nx.example.com", "A", &[]));
        agg.observe(&obs(1, "", "A", &["1.1.1.1"]));
        let ar = agg.finish();

        assert!(ar.is_empty());
        assert_eq!(ar.total_records, 2);
        assert_eq!(ar.skipped_records, 2);
    }

    #[test]
    fn test_ingest_reader() {
        let input = "\
#separator \\x09
{\"ts\":100.5,\"query\":\"Mail.Example.com.\",\"qtype_name\":\"A\",\"answers\":[\"9.9.9.9\"],\"TTLs\":[60.0]}
not json

{\"ts\":200.0,\"query\":\"mail.example.com\",\"qtype_name\":\"A\",\"answers\":[\"9.9.9.9\"],\"TTLs\":[120.0]}
";
        let mut agg = Aggregator::new();
        agg.ingest_reader(input.as_bytes()).unwrap();
        let ar = agg.finish();

        assert_eq!(ar.total_records, 3);
        assert_eq!(ar.skipped_records, 1);
        let key = TupleKey {
            query: "mail.example.com".into(),
            qtype: "A".into(),
            answer: "9.9.9.9".into(),
        };
        let state = ar.tuples[&key];
        assert_eq!(state.state.count(), 2);
        assert_eq!((state.state.first.0, state.state.last.0), (100, 200));
        assert_eq!(state.ttl.0, 120);

        let summary = ar.summary();
        assert_eq!(summary.tuples, 1);
        assert_eq!(summary.individuals, 2);
    }

    #[test]
    fn test_merge_results() {
        let mut a = Aggregator::new();
        a.observe(&obs(50, "example.com", "A", &["1.2.3.4"]));
        let mut b = Aggregator::new();
        b.observe(&obs(10, "example.com", "A", &["1.2.3.4"]));
        b.observe(&obs(90, "example.com", "A", &["1.2.3.4"]));

        let mut merged = a.finish();
        merged.merge(b.finish());

        let state = merged.tuples.values().next().unwrap().state;
        assert_eq!((state.first.0, state.last.0, state.count()), (10, 90, 3));
        assert_eq!(merged.total_records, 3);
    }

    #[test]
    fn test_which_serde() {
        assert_eq!(serde_json::to_string(&Which::Query).unwrap(), "\"Q\"");
        assert_eq!(serde_json::from_str::<Which>("\"A\"").unwrap(), Which::Answer);
        assert_eq!("Q".parse::<Which>(), Ok(Which::Query));
        assert!("X".parse::<Which>().is_err());
    }

    #[test]
    fn test_rdata_answers_keep_case() {
        let mut agg = Aggregator::new();
        agg.observe(&obs(1, "Example.COM", "TXT", &["v=spf1 include:_spf.Google.com"]));
        agg.observe(&obs(1, "Alias.Example.COM", "CNAME", &["Target.Example.COM."]));
        let ar = agg.finish();

        let txt = TupleKey {
            query: "example.com".into(),
            qtype: "TXT".into(),
            answer: "v=spf1 include:_spf.Google.com".into(),
        };
        let cname = TupleKey {
            query: "alias.example.com".into(),
            qtype: "CNAME".into(),
            answer: "target.example.com".into(),
        };
        assert!(ar.tuples.contains_key(&txt));
        assert!(ar.tuples.contains_key(&cname));
    }
}
