use std::fmt;

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

/// Substring markers the remote store uses in aggregate-cap failures. The
/// structured code is checked first; these cover stores that only report text.
const AGGREGATE_CAP_MARKERS: &[&str] = &[
    "AggregateQueryRecordLimit",
    "aggregate operation exceeded",
    "maximum record limit of 50000",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    ParseError {
        message: String,
        line: u64,
        column: u64,
    },
    PlanBuildError(String),
    NotSupported(String),
    TypeMismatch {
        expected: String,
        actual: String,
    },
    AggregateLimitExceeded(String),
    DmlBlocked(String),
    DmlRowCapExceeded {
        cap: usize,
        submitted: usize,
    },
    Throttled(String),
    TransientRemote(String),
    Unauthorized(String),
    NotFound(String),
    BadQuery(String),
    Cancelled,
    ExecutionFailed(String),
}

impl Error {
    pub fn parse_error(message: impl Into<String>, line: u64, column: u64) -> Self {
        Error::ParseError {
            message: message.into(),
            line,
            column,
        }
    }

    pub fn plan(message: impl Into<String>) -> Self {
        Error::PlanBuildError(message.into())
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Error::NotSupported(message.into())
    }

    pub fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Error::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn aggregate_limit(message: impl Into<String>) -> Self {
        Error::AggregateLimitExceeded(message.into())
    }

    pub fn dml_blocked(message: impl Into<String>) -> Self {
        Error::DmlBlocked(message.into())
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Error::Throttled(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Error::TransientRemote(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Error::Unauthorized(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    pub fn bad_query(message: impl Into<String>) -> Self {
        Error::BadQuery(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Error::ExecutionFailed(message.into())
    }

    /// Stable machine-readable code, dotted-namespace form.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ParseError { .. } => "Query.ParseError",
            Error::PlanBuildError(_) => "Query.PlanBuildError",
            Error::NotSupported(_) => "Query.NotSupported",
            Error::TypeMismatch { .. } => "Query.TypeMismatch",
            Error::AggregateLimitExceeded(_) => "Query.AggregateLimitExceeded",
            Error::DmlBlocked(_) => "Query.DmlBlocked",
            Error::DmlRowCapExceeded { .. } => "Query.DmlRowCapExceeded",
            Error::Throttled(_) => "Remote.Throttled",
            Error::TransientRemote(_) => "Remote.Transient",
            Error::Unauthorized(_) => "Remote.Unauthorized",
            Error::NotFound(_) => "Remote.NotFound",
            Error::BadQuery(_) => "Remote.BadQuery",
            Error::Cancelled => "Query.Cancelled",
            Error::ExecutionFailed(_) => "Query.ExecutionFailed",
        }
    }

    /// Short kind name for the wire payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ParseError { .. } => "ParseError",
            Error::PlanBuildError(_) => "PlanBuildError",
            Error::NotSupported(_) => "NotSupported",
            Error::TypeMismatch { .. } => "TypeMismatch",
            Error::AggregateLimitExceeded(_) => "AggregateLimitExceeded",
            Error::DmlBlocked(_) => "DmlBlocked",
            Error::DmlRowCapExceeded { .. } => "DmlRowCapExceeded",
            Error::Throttled(_) => "Throttled",
            Error::TransientRemote(_) => "TransientRemote",
            Error::Unauthorized(_) => "Unauthorized",
            Error::NotFound(_) => "NotFound",
            Error::BadQuery(_) => "BadQuery",
            Error::Cancelled => "Cancelled",
            Error::ExecutionFailed(_) => "ExecutionFailed",
        }
    }

    /// Pool-level retry eligibility. The engine itself never retries; the
    /// remote access layer owns backoff for these two kinds.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Throttled(_) | Error::TransientRemote(_))
    }

    /// Whether a remote failure is the store's aggregate record cap. Matches
    /// the structured code or any of the documented text markers.
    pub fn is_aggregate_cap(code: Option<&str>, message: &str) -> bool {
        if code.is_some_and(|c| c.contains("AggregateQueryRecordLimit")) {
            return true;
        }
        AGGREGATE_CAP_MARKERS.iter().any(|m| message.contains(m))
    }

    pub fn payload(&self) -> ErrorPayload {
        let (line, column) = match self {
            Error::ParseError { line, column, .. } => (Some(*line), Some(*column)),
            _ => (None, None),
        };
        ErrorPayload {
            kind: self.kind().to_string(),
            code: self.code().to_string(),
            message: self.to_string(),
            line,
            column,
            target: None,
        }
    }
}

/// Stable wire shape for errors surfaced at the statement entry points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ParseError {
                message,
                line,
                column,
            } => write!(f, "Parse error at line {}, column {}: {}", line, column, message),
            Error::PlanBuildError(msg) => write!(f, "Plan build error: {}", msg),
            Error::NotSupported(msg) => write!(f, "Not supported: {}", msg),
            Error::TypeMismatch { expected, actual } => {
                write!(f, "Type mismatch: expected {}, got {}", expected, actual)
            }
            Error::AggregateLimitExceeded(msg) => {
                write!(f, "Aggregate record limit exceeded: {}", msg)
            }
            Error::DmlBlocked(msg) => write!(f, "DML blocked: {}", msg),
            Error::DmlRowCapExceeded { cap, submitted } => write!(
                f,
                "DML row cap of {} exceeded after {} rows were submitted",
                cap, submitted
            ),
            Error::Throttled(msg) => write!(f, "Throttled by remote store: {}", msg),
            Error::TransientRemote(msg) => write!(f, "Transient remote failure: {}", msg),
            Error::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::BadQuery(msg) => write!(f, "Rejected by remote store: {}", msg),
            Error::Cancelled => write!(f, "Cancelled"),
            Error::ExecutionFailed(msg) => write!(f, "Execution failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
