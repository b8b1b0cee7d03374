use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CubeflowError>;

#[derive(Debug, Error)]
pub enum CubeflowError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Build(#[from] BuildFailure),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("pre-aggregation error: {0}")]
    PreAggregation(String),
    #[error("pre-aggregation {id} needs more than {max} partitions for the requested range")]
    TooManyPartitions { id: String, max: usize },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised while turning a query into SQL. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("unknown cube '{0}'")]
    UnknownCube(String),
    #[error("unresolved member '{member}': {reason}")]
    UnresolvedMember { member: String, reason: String },
    #[error("cyclic measure reference involving {0}")]
    CyclicMeasure(String),
    #[error("cyclic dimension reference involving {0}")]
    CyclicDimension(String),
    #[error("measure '{0}' cannot be referenced in a WHERE position; filter it through HAVING")]
    MeasureInWhere(String),
    #[error("can't find join path to join {}", quoted_list(.0))]
    NoJoinPath(Vec<String>),
    #[error("ambiguous join path to '{target}': {}", .paths.join(" | "))]
    AmbiguousJoinPath { target: String, paths: Vec<String> },
    #[error("malformed filter: {0}")]
    MalformedFilter(String),
    #[error("malformed query: {0}")]
    MalformedQuery(String),
}

fn quoted_list(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("'{i}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Classification of a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverErrorKind {
    Timeout,
    ConnectionLost,
    Syntax,
    PermissionDenied,
    Unsupported,
    Other,
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::ConnectionLost => "connection lost",
            DriverErrorKind::Syntax => "syntax error",
            DriverErrorKind::PermissionDenied => "permission denied",
            DriverErrorKind::Unsupported => "unsupported",
            DriverErrorKind::Other => "driver error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Timeout, message)
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::ConnectionLost, message)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Syntax, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Unsupported, message)
    }

    /// Timeouts and dropped connections are worth another attempt; everything
    /// else will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            DriverErrorKind::Timeout | DriverErrorKind::ConnectionLost
        )
    }
}

/// A partition build that gave up. Cloned to every caller waiting on the build.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("build of partition {partition} failed after {attempts} attempt(s): {message}")]
pub struct BuildFailure {
    pub partition: String,
    pub sql: Option<String>,
    pub kind: Option<DriverErrorKind>,
    pub message: String,
    pub attempts: u32,
}

impl BuildFailure {
    pub fn retriable(&self) -> bool {
        matches!(
            self.kind,
            Some(DriverErrorKind::Timeout | DriverErrorKind::ConnectionLost)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("build lock for partition {partition} is held by {holder}")]
    Held { partition: String, holder: String },
    #[error("orchestrator state has not been recovered; run the startup sweep first")]
    NotRecovered,
    #[error("state store error: {0}")]
    Store(String),
}

/// How a failure should be surfaced to an API caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request itself is wrong (4xx).
    User,
    /// Something downstream failed; retrying later may succeed (5xx).
    Retriable,
    /// Internal or configuration failure (5xx, not worth retrying).
    Internal,
}

impl CubeflowError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CubeflowError::Compile(_)
            | CubeflowError::Json(_)
            | CubeflowError::TooManyPartitions { .. } => ErrorClass::User,
            CubeflowError::Driver(_) | CubeflowError::Build(_) | CubeflowError::Lock(_) => {
                ErrorClass::Retriable
            }
            _ => ErrorClass::Internal,
        }
    }

    /// Partition identifier for build failures, so callers can report which
    /// slice of a rollup is unavailable.
    pub fn partition(&self) -> Option<&str> {
        match self {
            CubeflowError::Build(failure) => Some(&failure.partition),
            CubeflowError::Lock(LockError::Held { partition, .. }) => Some(partition),
            _ => None,
        }
    }
}
