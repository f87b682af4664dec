use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flat classification of everything that can go wrong in a run.
/// This is what the presentation layer sees in a `FailureReport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidRange,
    TransientFetch,
    TerminalFetch,
    Parse,
    AggregationInvariant,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::InvalidRange => "InvalidRangeError",
            ErrorKind::TransientFetch => "TransientFetchError",
            ErrorKind::TerminalFetch => "TerminalFetchError",
            ErrorKind::Parse => "ParseError",
            ErrorKind::AggregationInvariant => "AggregationInvariantError",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// Error from a single fetch attempt, or the terminal error of a task.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("server error: HTTP {status}")]
    Server { status: u16, body: String },

    #[error("rate limited: HTTP 429")]
    RateLimited { retry_after: Option<std::time::Duration> },

    #[error("client error: HTTP {status} - {body}")]
    Client { status: u16, body: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("cancelled before attempt {attempt}")]
    Cancelled { attempt: u32 },
}

impl FetchError {
    /// Transient errors are retried, everything else ends the task.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout(_)
                | FetchError::Connection(_)
                | FetchError::Server { .. }
                | FetchError::RateLimited { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Timeout(_)
            | FetchError::Connection(_)
            | FetchError::Server { .. }
            | FetchError::RateLimited { .. } => ErrorKind::TransientFetch,
            FetchError::Client { .. } | FetchError::InvalidRequest(_) | FetchError::Panicked(_) => {
                ErrorKind::TerminalFetch
            }
            FetchError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }
}

/// Reasons a payload or a single record inside it was rejected.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(String),

    #[error("records path '{0}' not found or not an array")]
    MissingRecords(String),

    #[error("record {index}: required field '{field}' is absent")]
    MissingField { index: usize, field: String },

    #[error("record {index}: timestamp '{raw}' is not a calendar date")]
    BadTimestamp { index: usize, raw: String },
}

impl ParseError {
    /// Payload-level errors lose the whole sub-range, record-level ones only that record.
    pub fn is_payload_level(&self) -> bool {
        matches!(self, ParseError::InvalidPayload(_) | ParseError::MissingRecords(_))
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid range: start {start} is not before end {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("aggregation invariant violated: {0}")]
    AggregationInvariant(String),

    #[error("fetch pool terminated unexpectedly: {0}")]
    Pool(String),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(FetchError::Server { status: 503, body: String::new() }.is_transient());
        assert!(FetchError::RateLimited { retry_after: None }.is_transient());
        assert!(!FetchError::Client { status: 404, body: String::new() }.is_transient());
        assert!(!FetchError::Panicked("boom".into()).is_transient());
    }

    #[test]
    fn test_kind_display_names() {
        assert_eq!(ErrorKind::TransientFetch.to_string(), "TransientFetchError");
        assert_eq!(
            FetchError::Client { status: 400, body: String::new() }.kind(),
            ErrorKind::TerminalFetch
        );
    }
}
