use reqwest::Url;
use std::env;
use std::time::Duration;

const DEFAULT_STORE_URI: &str = "clickhouse://localhost:8123/default";
const CLICKHOUSE_HTTP_PORT: u16 = 8123;

/// Which database backs the store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreBackend {
    ClickHouse {
        /// HTTP interface base URL, e.g. `http://localhost:8123/`
        url: Url,
        database: String,
        user: Option<String>,
        password: Option<String>,
    },
    Sqlite {
        path: String,
    },
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// DDL, merge and lookup statements
    pub query_timeout: Duration,
    /// `INSERT ... FORMAT JSONEachRow` uploads
    pub bulk_timeout: Duration,
    pub max_retries: u32,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl StoreBackend {
    /// Parse a store URI.
    ///
    /// - `clickhouse://[user[:password]@]host[:port][/database]` (HTTP, port 8123)
    /// - `http(s)://...` same, scheme kept
    /// - `sqlite://<path>` or `sqlite://:memory:`
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        if let Some(path) = uri.strip_prefix("sqlite://") {
            if path.is_empty() {
                return Err(ConfigError::InvalidValue(
                    "sqlite:// URI needs a path".to_string(),
                ));
            }
            return Ok(StoreBackend::Sqlite {
                path: path.to_string(),
            });
        }

        let parsed = Url::parse(uri)
            .map_err(|e| ConfigError::InvalidValue(format!("store URI '{}': {}", uri, e)))?;

        let scheme = match parsed.scheme() {
            "clickhouse" | "http" => "http",
            "https" => "https",
            other => {
                return Err(ConfigError::InvalidValue(format!(
                    "unsupported store scheme '{}' (expected clickhouse, http, https or sqlite)",
                    other
                )))
            }
        };

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::InvalidValue(format!("store URI '{}' has no host", uri)))?;
        let port = parsed.port().unwrap_or(CLICKHOUSE_HTTP_PORT);

        let url = Url::parse(&format!("{}://{}:{}/", scheme, host, port))
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;

        let database = parsed.path().trim_matches('/');
        let database = if database.is_empty() { "default" } else { database };

        let user = Some(parsed.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);

        Ok(StoreBackend::ClickHouse {
            url,
            database: database.to_string(),
            user,
            password: parsed.password().map(str::to_string),
        })
    }
}

impl StoreConfig {
    /// Configuration for `uri` with default timeouts and retry policy
    pub fn from_uri(uri: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            backend: StoreBackend::parse(uri)?,
            query_timeout: Duration::from_secs(5),
            bulk_timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_initial_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_millis(30_000),
        })
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `PASSIVEDNS_STORE` (default: clickhouse://localhost:8123/default)
    /// - `CLICKHOUSE_QUERY_TIMEOUT_SECS` (default: 5)
    /// - `CLICKHOUSE_BULK_TIMEOUT_SECS` (default: 60)
    /// - `INDEX_MAX_RETRIES` (default: 3)
    /// - `RETRY_INITIAL_DELAY_MS` (default: 500)
    /// - `RETRY_MAX_DELAY_MS` (default: 30000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let uri = env::var("PASSIVEDNS_STORE").unwrap_or_else(|_| DEFAULT_STORE_URI.to_string());
        let mut config = Self::from_uri(&uri)?;

        config.query_timeout = Duration::from_secs(parse_var("CLICKHOUSE_QUERY_TIMEOUT_SECS", 5)?);
        config.bulk_timeout = Duration::from_secs(parse_var("CLICKHOUSE_BULK_TIMEOUT_SECS", 60)?);
        config.max_retries = parse_var("INDEX_MAX_RETRIES", 3)?;
        config.retry_initial_delay =
            Duration::from_millis(parse_var("RETRY_INITIAL_DELAY_MS", 500)?);
        config.retry_max_delay = Duration::from_millis(parse_var("RETRY_MAX_DELAY_MS", 30_000)?);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.query_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "CLICKHOUSE_QUERY_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }
        if self.bulk_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "CLICKHOUSE_BULK_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }
        if self.retry_initial_delay > self.retry_max_delay {
            return Err(ConfigError::InvalidValue(
                "RETRY_INITIAL_DELAY_MS must not exceed RETRY_MAX_DELAY_MS".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{}='{}'", name, raw))),
        Err(_) => Ok(default),
    }
}
