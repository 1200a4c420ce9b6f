//! DoH error types

use std::io;

use thiserror::Error;

/// DoH operation result type
pub type Result<T> = std::result::Result<T, DohError>;

/// Outcome classification of a DNS transaction, reported in summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum QueryStatus {
    /// Transaction completed successfully
    Complete = 0,
    /// Failed to send the query
    SendFailed = 1,
    /// Got a non-2xx HTTP status
    HttpError = 2,
    /// Malformed input
    BadQuery = 3,
    /// Response was invalid
    BadResponse = 4,
    /// This should never happen
    InternalError = 5,
}

impl QueryStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// DoH error types
#[derive(Error, Debug)]
pub enum DohError {
    #[error("invalid DoH configuration: {0}")]
    Config(String),

    #[error("query too short: {0} bytes")]
    BadQuery(usize),

    #[error("failed to send query: {0}")]
    SendFailed(String),

    #[error("DoH server returned HTTP {0}")]
    HttpStatus(u16),

    #[error("bad DoH response: {0}")]
    BadResponse(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DohError {
    /// Map the error onto the summary status taxonomy.
    pub fn status(&self) -> QueryStatus {
        match self {
            DohError::BadQuery(_) => QueryStatus::BadQuery,
            DohError::SendFailed(_) | DohError::Io(_) => QueryStatus::SendFailed,
            DohError::HttpStatus(_) => QueryStatus::HttpError,
            DohError::BadResponse(_) => QueryStatus::BadResponse,
            DohError::Config(_) | DohError::Internal(_) => QueryStatus::InternalError,
        }
    }
}

impl From<hickory_proto::ProtoError> for DohError {
    fn from(e: hickory_proto::ProtoError) -> Self {
        DohError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_stable() {
        assert_eq!(QueryStatus::Complete.code(), 0);
        assert_eq!(QueryStatus::SendFailed.code(), 1);
        assert_eq!(QueryStatus::HttpError.code(), 2);
        assert_eq!(QueryStatus::BadQuery.code(), 3);
        assert_eq!(QueryStatus::BadResponse.code(), 4);
        assert_eq!(QueryStatus::InternalError.code(), 5);
    }

    #[test]
    fn errors_classify() {
        assert_eq!(DohError::BadQuery(1).status(), QueryStatus::BadQuery);
        assert_eq!(DohError::HttpStatus(500).status(), QueryStatus::HttpError);
        assert_eq!(
            DohError::SendFailed("x".into()).status(),
            QueryStatus::SendFailed
        );
    }
}
