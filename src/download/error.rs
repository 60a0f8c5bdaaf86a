use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fetch::{FetchError, NotFoundError};
use crate::retry::RetryError;

/// Coarse failure category, written to the failure journal and summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidReference,
    NotFound,
    Timeout,
    Connection,
    HttpStatus,
    Decode,
    Io,
    Exhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidReference => "invalid_reference",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::HttpStatus => "http_status",
            ErrorKind::Decode => "decode",
            ErrorKind::Io => "io",
            ErrorKind::Exhausted => "exhausted",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single target failed. None of these stop the batch.
#[derive(Debug, Error)]
pub enum TargetError {
    /// The reference cannot be stored in a line-based ledger.
    #[error("Reference contains control characters: {0:?}")]
    InvalidReference(String),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error("Gave up on {url} after {attempts} attempt(s): {last_error}")]
    Exhausted {
        url: String,
        attempts: u32,
        last_error: FetchError,
    },

    /// A permanent HTTP answer, surfaced after one attempt.
    #[error(transparent)]
    Fetch(FetchError),

    #[error("Disk error writing {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl TargetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TargetError::InvalidReference(_) => ErrorKind::InvalidReference,
            TargetError::NotFound(_) => ErrorKind::NotFound,
            TargetError::Exhausted { .. } => ErrorKind::Exhausted,
            TargetError::Fetch(e) => match e {
                FetchError::Timeout { .. } => ErrorKind::Timeout,
                FetchError::Connection { .. } => ErrorKind::Connection,
                FetchError::HttpStatus { .. } => ErrorKind::HttpStatus,
                FetchError::Decode { .. } => ErrorKind::Decode,
            },
            TargetError::Io { .. } => ErrorKind::Io,
        }
    }

    /// Fold the retry controller's outcome into the per-target taxonomy.
    pub fn from_retry(url: &str, err: RetryError<FetchError>) -> Self {
        match err {
            RetryError::Exhausted {
                attempts,
                last_error,
            } => TargetError::Exhausted {
                url: url.to_string(),
                attempts,
                last_error,
            },
            RetryError::Aborted { error, .. } => TargetError::Fetch(error),
        }
    }
}
