//! Scripted `Engine` for unit tests: records every call, fails on demand,
//! and answers selects from a queue.

use super::client::{Engine, QuerySummary};
use crate::codec::JsonLines;
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

enum FailMode {
    Http,
    Timeout,
}

struct Failure {
    pattern: String,
    mode: FailMode,
    /// Calls left to fail; `None` fails every time.
    remaining: Option<u32>,
}

pub(crate) struct ScriptedEngine {
    log: Mutex<Vec<String>>,
    bulk: Mutex<Vec<(String, Vec<serde_json::Value>)>>,
    params: Mutex<Vec<Vec<(String, String)>>>,
    replies: Mutex<VecDeque<Vec<serde_json::Value>>>,
    failures: Mutex<Vec<Failure>>,
    written_rows: u64,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            bulk: Mutex::new(Vec::new()),
            params: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::new()),
            failures: Mutex::new(Vec::new()),
            written_rows: 0,
        }
    }

    /// Fail with HTTP 500 on any call whose log line contains `pattern`.
    pub fn fail_on(self, pattern: &str) -> Self {
        self.push_failure(pattern, FailMode::Http, None)
    }

    /// Time out on the first `times` calls whose log line contains `pattern`.
    pub fn timeout_on(self, pattern: &str, times: u32) -> Self {
        self.push_failure(pattern, FailMode::Timeout, Some(times))
    }

    fn push_failure(self, pattern: &str, mode: FailMode, remaining: Option<u32>) -> Self {
        self.failures.lock().unwrap().push(Failure {
            pattern: pattern.to_string(),
            mode,
            remaining,
        });
        self
    }

    /// Rows every exec reports as written
    pub fn with_written_rows(mut self, n: u64) -> Self {
        self.written_rows = n;
        self
    }

    /// Queue the reply of the next select.
    pub fn reply(&self, rows: Vec<serde_json::Value>) {
        self.replies.lock().unwrap().push_back(rows);
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn bulk_rows(&self, table: &str) -> Vec<serde_json::Value> {
        self.bulk
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == table)
            .flat_map(|(_, rows)| rows.clone())
            .collect()
    }

    pub fn last_params(&self) -> Vec<(String, String)> {
        self.params.lock().unwrap().last().cloned().unwrap_or_default()
    }

    fn record(&self, line: String) -> Result<(), StoreError> {
        let mut failures = self.failures.lock().unwrap();
        let failure = failures
            .iter_mut()
            .find(|f| line.contains(f.pattern.as_str()) && f.remaining != Some(0));
        self.log.lock().unwrap().push(line);

        let failure = match failure {
            Some(failure) => failure,
            None => return Ok(()),
        };
        if let Some(left) = failure.remaining.as_mut() {
            *left -= 1;
        }
        match failure.mode {
            FailMode::Http => Err(StoreError::Http {
                status: 500,
                body: format!("scripted failure on '{}'", failure.pattern),
            }),
            FailMode::Timeout => Err(StoreError::Timeout(format!(
                "scripted timeout on '{}'",
                failure.pattern
            ))),
        }
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn exec(&self, sql: &str) -> Result<QuerySummary, StoreError> {
        self.record(format!("EXEC {}", sql.trim()))?;
        Ok(QuerySummary {
            read_rows: 0,
            written_rows: self.written_rows,
        })
    }

    async fn send_bulk(&self, table: &str, rows: JsonLines) -> Result<QuerySummary, StoreError> {
        let mut parsed = Vec::new();
        for line in rows {
            parsed.push(serde_json::from_slice(&line?)?);
        }
        let count = parsed.len() as u64;
        self.record(format!("BULK {} {}", table, count))?;
        self.bulk.lock().unwrap().push((table.to_string(), parsed));
        Ok(QuerySummary {
            read_rows: 0,
            written_rows: count,
        })
    }

    async fn select(
        &self,
        sql: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<serde_json::Value>, StoreError> {
        self.params.lock().unwrap().push(
            params
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        );
        self.record(format!("QUERY {}", sql.trim()))?;
        Ok(self.replies.lock().unwrap().pop_front().unwrap_or_default())
    }
}
