//! ClickHouse HTTP interface
//!
//! Three primitives are enough for the whole store: run a statement, stream
//! `JSONEachRow` rows into a table, and select rows back as JSON. Query
//! values travel as `param_<name>` URL parameters bound to `{name:String}`
//! placeholders, never spliced into SQL text.

use crate::codec::JsonLines;
use crate::error::StoreError;
use async_trait::async_trait;
use reqwest::{Body, Client, RequestBuilder, Response, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Row counts ClickHouse reports in the `X-ClickHouse-Summary` header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuerySummary {
    pub read_rows: u64,
    pub written_rows: u64,
}

impl QuerySummary {
    /// Parse `{"read_rows":"1","written_rows":"1",...}`. Values are quoted
    /// integers; missing or malformed fields count as 0.
    pub fn from_header(raw: &str) -> Self {
        let fields: HashMap<String, serde_json::Value> = match serde_json::from_str(raw) {
            Ok(fields) => fields,
            Err(_) => return Self::default(),
        };
        let get = |name: &str| -> u64 {
            match fields.get(name) {
                Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
                Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
                _ => 0,
            }
        };
        Self {
            read_rows: get("read_rows"),
            written_rows: get("written_rows"),
        }
    }
}

/// Database engine capability used by the ClickHouse store components
#[async_trait]
pub trait Engine: Send + Sync {
    /// Run one statement that returns no rows.
    async fn exec(&self, sql: &str) -> Result<QuerySummary, StoreError>;

    /// Stream newline-delimited JSON rows into `table`.
    async fn send_bulk(&self, table: &str, rows: JsonLines) -> Result<QuerySummary, StoreError>;

    /// Run a `SELECT`, binding `params` to `{name:String}` placeholders.
    async fn select(
        &self,
        sql: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<serde_json::Value>, StoreError>;
}

/// `Engine` over the ClickHouse HTTP port (8123)
pub struct HttpEngine {
    client: Client,
    url: Url,
    database: String,
    user: Option<String>,
    password: Option<String>,
    query_timeout: Duration,
    bulk_timeout: Duration,
}

#[derive(Deserialize)]
struct VersionRow {
    version: String,
}

impl HttpEngine {
    pub fn new(
        url: Url,
        database: String,
        user: Option<String>,
        password: Option<String>,
        query_timeout: Duration,
        bulk_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::builder()
            .connect_timeout(query_timeout)
            .build()
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            url,
            database,
            user,
            password,
            query_timeout,
            bulk_timeout,
        })
    }

    /// Check the server answers and the credentials work. Returns the
    /// server version.
    pub async fn ping(&self) -> Result<String, StoreError> {
        let rows = self
            .select("SELECT version() AS version", &[])
            .await
            .map_err(|e| match e {
                StoreError::Transport(msg) | StoreError::Timeout(msg) => {
                    StoreError::Connection(msg)
                }
                other => other,
            })?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Connection("empty reply to version()".to_string()))?;
        let row: VersionRow = serde_json::from_value(row)?;
        Ok(row.version)
    }

    fn request(&self, timeout: Duration) -> RequestBuilder {
        let mut req = self
            .client
            .post(self.url.clone())
            .timeout(timeout)
            .query(&[("database", self.database.as_str())]);
        if let Some(user) = &self.user {
            req = req.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.password {
            req = req.header("X-ClickHouse-Key", password);
        }
        req
    }

    async fn check(resp: Response) -> Result<Response, StoreError> {
        let status = resp.status();
        if status.as_u16() >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    fn summary(resp: &Response) -> QuerySummary {
        resp.headers()
            .get("X-ClickHouse-Summary")
            .and_then(|v| v.to_str().ok())
            .map(QuerySummary::from_header)
            .unwrap_or_default()
    }
}

#[async_trait]
impl Engine for HttpEngine {
    async fn exec(&self, sql: &str) -> Result<QuerySummary, StoreError> {
        log::debug!("ClickHouse exec: {}", sql.trim());

        let resp = self
            .request(self.query_timeout)
            .body(sql.to_string())
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let summary = Self::summary(&resp);
        // Drain so the connection can be reused.
        resp.bytes().await?;
        Ok(summary)
    }

    async fn send_bulk(&self, table: &str, rows: JsonLines) -> Result<QuerySummary, StoreError> {
        log::debug!("ClickHouse bulk insert: {} ({} rows)", table, rows.remaining());

        let insert = format!("INSERT INTO {} FORMAT JSONEachRow", table);
        let resp = self
            .request(self.bulk_timeout)
            .query(&[
                ("query", insert.as_str()),
                ("date_time_input_format", "best_effort"),
            ])
            .header("Content-Type", "application/x-ndjson")
            .body(Body::wrap_stream(futures::stream::iter(rows)))
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let summary = Self::summary(&resp);
        resp.bytes().await?;
        Ok(summary)
    }

    async fn select(
        &self,
        sql: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<serde_json::Value>, StoreError> {
        log::debug!("ClickHouse select: {}", sql.trim());

        let mut query: Vec<(String, String)> = vec![
            ("default_format".to_string(), "JSONEachRow".to_string()),
            (
                "output_format_json_quote_64bit_integers".to_string(),
                "0".to_string(),
            ),
        ];
        for (name, value) in params {
            query.push((format!("param_{}", name), escape_param(value)));
        }

        let resp = self
            .request(self.query_timeout)
            .query(&query)
            .body(sql.to_string())
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let body = resp.text().await?;

        body.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StoreError::from))
            .collect()
    }
}

/// Query parameter values are read as TSV-escaped text.
fn escape_param(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}
