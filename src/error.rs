//! Canonical error taxonomy for the database layer.
//!
//! Backend-specific failures are folded into [`ErrorCode`], the stable,
//! vendor-independent outcome callers branch on. Internal fallible paths use
//! [`DbError`] and are converted into a code + message at the executor
//! boundary.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Upper bound (in bytes) for a result set's human-readable message.
pub const MAX_MESSAGE_LEN: usize = 512;

/// Stable outcome code carried by every result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Query succeeded and produced at least one row.
    Ok,
    /// Query succeeded but returned no rows.
    ZeroResults,
    UniqueViolation,
    /// A parameter or value did not match the expected type.
    InvalidType,
    /// A value was too long or too short for its field.
    InvalidRange,
    ConnectionError,
    /// The handle's vendor has no registered driver.
    InvalidDb,
    /// Transient backend status; should not escape a completed call.
    Processing,
    /// Catch-all, including fatal backend errors and pool exhaustion.
    Unknown,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Ok => "ok",
            ErrorCode::ZeroResults => "zero_results",
            ErrorCode::UniqueViolation => "unique_violation",
            ErrorCode::InvalidType => "invalid_type",
            ErrorCode::InvalidRange => "invalid_range",
            ErrorCode::ConnectionError => "connection_error",
            ErrorCode::InvalidDb => "invalid_db",
            ErrorCode::Processing => "processing",
            ErrorCode::Unknown => "unknown",
        }
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised inside the layer before they are folded into a result set.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    ConnectionError(String),

    #[error("Handle is not connected (state: {0})")]
    NotConnected(&'static str),

    #[error("Invalid database vendor: {0}")]
    InvalidDb(String),

    #[error("Invalid query parameter at position {index}: {reason}")]
    InvalidParam { index: usize, reason: &'static str },

    #[error("Could not decode value: {0}")]
    Decode(String),

    #[error("Pool error: {0}")]
    PoolError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Transport-level failure: no response object was produced.
    #[error("Query response was null: {0}")]
    NoResponse(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DbError {
    /// The canonical code this error surfaces as.
    pub fn code(&self) -> ErrorCode {
        match self {
            DbError::ConnectionError(_) | DbError::NotConnected(_) => ErrorCode::ConnectionError,
            DbError::InvalidDb(_) => ErrorCode::InvalidDb,
            DbError::InvalidParam { .. } | DbError::Decode(_) => ErrorCode::InvalidType,
            DbError::PoolError(_)
            | DbError::ConfigError(_)
            | DbError::NoResponse(_)
            | DbError::IoError(_) => ErrorCode::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Render `"<summary>. (<vendor>): <detail>"`, capped at [`MAX_MESSAGE_LEN`].
/// An empty detail drops the trailing `": "`.
pub fn format_message(summary: &str, vendor: &str, detail: &str) -> String {
    let detail = detail.trim_end();
    let mut msg = if detail.is_empty() {
        format!("{}. ({})", summary, vendor)
    } else {
        format!("{}. ({}): {}", summary, vendor, detail)
    };
    truncate_on_char_boundary(&mut msg, MAX_MESSAGE_LEN);
    msg
}

pub(crate) fn truncate_on_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}
