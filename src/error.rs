//! Store error taxonomy
//!
//! Every failure that crosses the `Store` boundary is a `StoreError`. Pipeline
//! stages wrap the underlying cause in `StoreError::Stage` so the message names
//! the step that broke (`load-tuples: HTTP 500: ...`).

use std::fmt;

/// Coarse classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Store unreachable or refused credentials. Fatal to the run.
    Connection,
    /// Permanent table DDL failed. Fatal to `init`.
    Schema,
    /// Staging, bulk load, merge or ledger write failed. Fatal to the batch.
    Ingest,
    /// Lookup failed. Never mutates state.
    Query,
    /// The backing engine does not offer this operation.
    Unsupported,
}

/// Operation in which a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Clear,
    DropStaging,
    CreateTuples,
    CreateIndividuals,
    LoadTuples,
    LoadIndividuals,
    MergeTuples,
    MergeIndividuals,
    IsIndexed,
    SetIndexed,
    FindQueryTuples,
    FindTuples,
    LikeTuples,
    FindIndividual,
    LikeIndividual,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Clear => "clear",
            Stage::DropStaging => "drop-staging",
            Stage::CreateTuples => "create-tuples",
            Stage::CreateIndividuals => "create-individuals",
            Stage::LoadTuples => "load-tuples",
            Stage::LoadIndividuals => "load-individuals",
            Stage::MergeTuples => "merge-tuples",
            Stage::MergeIndividuals => "merge-individuals",
            Stage::IsIndexed => "is-indexed",
            Stage::SetIndexed => "set-indexed",
            Stage::FindQueryTuples => "find-query-tuples",
            Stage::FindTuples => "find-tuples",
            Stage::LikeTuples => "like-tuples",
            Stage::FindIndividual => "find-individual",
            Stage::LikeIndividual => "like-individual",
        }
    }

    /// True for steps that run before any permanent table is written.
    pub fn precedes_merge(&self) -> bool {
        matches!(
            self,
            Stage::DropStaging
                | Stage::CreateTuples
                | Stage::CreateIndividuals
                | Stage::LoadTuples
                | Stage::LoadIndividuals
                | Stage::IsIndexed
        )
    }

    fn kind(&self) -> ErrorKind {
        match self {
            Stage::Init => ErrorKind::Schema,
            Stage::FindQueryTuples
            | Stage::FindTuples
            | Stage::LikeTuples
            | Stage::FindIndividual
            | Stage::LikeIndividual => ErrorKind::Query,
            _ => ErrorKind::Ingest,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum StoreError {
    Connection(String),
    Timeout(String),
    Http { status: u16, body: String },
    Transport(String),
    Serialization(serde_json::Error),
    Sqlite(rusqlite::Error),
    Unsupported(&'static str),
    InvalidUri(String),
    Stage { stage: Stage, source: Box<StoreError> },
}

impl StoreError {
    /// Wrap `self` with the name of the stage that failed.
    pub fn at(self, stage: Stage) -> Self {
        StoreError::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// Innermost stage recorded on this error, if any
    pub fn stage(&self) -> Option<Stage> {
        match self {
            StoreError::Stage { stage, source } => source.stage().or(Some(*stage)),
            _ => None,
        }
    }

    /// Root cause with all stage wrappers removed
    pub fn root(&self) -> &StoreError {
        match self {
            StoreError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            StoreError::Connection(_) => return ErrorKind::Connection,
            StoreError::Unsupported(_) => return ErrorKind::Unsupported,
            StoreError::Http { status, .. } if *status == 401 || *status == 403 => {
                return ErrorKind::Connection
            }
            _ => {}
        }
        match self.stage() {
            Some(stage) => stage.kind(),
            None => ErrorKind::Ingest,
        }
    }

    /// A timeout is worth retrying. Everything else needs a human.
    pub fn is_retriable(&self) -> bool {
        matches!(self.root(), StoreError::Timeout(_))
    }

    /// True when the failure happened before any merge into permanent
    /// tables, so re-running the whole batch cannot double-count.
    pub fn merge_untouched(&self) -> bool {
        self.stage().map_or(false, |s| s.precedes_merge())
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Connection(e) => write!(f, "Connection error: {}", e),
            StoreError::Timeout(e) => write!(f, "Timed out: {}", e),
            StoreError::Http { status, body } => {
                write!(f, "ClickHouse error (HTTP {}): {}", status, body.trim_end())
            }
            StoreError::Transport(e) => write!(f, "Transport error: {}", e),
            StoreError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StoreError::Sqlite(e) => write!(f, "Database error: {}", e),
            StoreError::Unsupported(what) => write!(f, "Unsupported: {}", what),
            StoreError::InvalidUri(e) => write!(f, "Invalid store URI: {}", e),
            StoreError::Stage { stage, source } => write!(f, "{}: {}", stage, source),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Serialization(e) => Some(e),
            StoreError::Sqlite(e) => Some(e),
            StoreError::Stage { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sqlite(err)
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Timeout(err.to_string())
        } else if err.is_connect() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Transport(err.to_string())
        }
    }
}

/// Attach a stage to the error side of a `Result`.
pub trait StageExt<T> {
    fn at(self, stage: Stage) -> Result<T, StoreError>;
}

impl<T, E: Into<StoreError>> StageExt<T> for Result<T, E> {
    fn at(self, stage: Stage) -> Result<T, StoreError> {
        self.map_err(|e| e.into().at(stage))
    }
}
