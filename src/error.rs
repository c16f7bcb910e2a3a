//! Error types and Result aliases for the B-tree engine
//!
//! Errors carry a primary [`ErrorCode`] modeled on SQLite's result codes plus
//! an optional message. Low-level failures are never retried internally; they
//! travel back to the caller with the name of the operation that failed.

use std::fmt;

use thiserror::Error as ThisError;

/// Primary result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Generic error
    Error = 1,
    /// Internal logic error
    Internal = 2,
    /// Access permission denied
    Perm = 3,
    /// Operation aborted (cursor tripped by a rollback)
    Abort = 4,
    /// Database file is locked by another connection or process
    Busy = 5,
    /// A table in the shared cache is locked by another connection
    Locked = 6,
    /// Allocation failed
    NoMem = 7,
    /// Attempt to write a read-only database
    ReadOnly = 8,
    /// Disk I/O error
    IoErr = 10,
    /// Database disk image is malformed
    Corrupt = 11,
    /// Database is full
    Full = 13,
    /// Unable to open the database file
    CantOpen = 14,
    /// Database is empty
    Empty = 16,
    /// String or blob exceeds size limit
    TooBig = 18,
    /// Constraint violation (duplicate index key)
    Constraint = 19,
    /// Library used incorrectly
    Misuse = 21,
    /// Parameter out of range
    Range = 25,
}

impl ErrorCode {
    /// Default message for this code (sqlite3ErrStr)
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Error => "SQL logic error",
            ErrorCode::Internal => "internal error",
            ErrorCode::Perm => "access permission denied",
            ErrorCode::Abort => "query aborted",
            ErrorCode::Busy => "database is locked",
            ErrorCode::Locked => "database table is locked",
            ErrorCode::NoMem => "out of memory",
            ErrorCode::ReadOnly => "attempt to write a readonly database",
            ErrorCode::IoErr => "disk I/O error",
            ErrorCode::Corrupt => "database disk image is malformed",
            ErrorCode::Full => "database or disk is full",
            ErrorCode::CantOpen => "unable to open database file",
            ErrorCode::Empty => "database is empty",
            ErrorCode::TooBig => "string or blob too big",
            ErrorCode::Constraint => "constraint failed",
            ErrorCode::Misuse => "bad parameter or other API misuse",
            ErrorCode::Range => "column index out of range",
        }
    }

    /// Errors the caller may retry by re-running the whole statement.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::Busy | ErrorCode::Locked)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine error: a result code plus optional detail.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("{}", self.render())]
pub struct Error {
    pub code: ErrorCode,
    pub message: Option<String>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// Corruption detected while reading `pgno`.
    pub fn corrupt_page(pgno: u32, detail: impl fmt::Display) -> Self {
        tracing::warn!(pgno, %detail, "corruption detected");
        Self::with_message(ErrorCode::Corrupt, format!("page {}: {}", pgno, detail))
    }

    /// Prefix the message with the name of the operation that failed.
    pub fn context(mut self, op: &str) -> Self {
        self.message = Some(match self.message.take() {
            Some(msg) => format!("{}: {}", op, msg),
            None => format!("{}: {}", op, self.code.as_str()),
        });
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    fn render(&self) -> String {
        match &self.message {
            Some(msg) => msg.clone(),
            None => self.code.as_str().to_string(),
        }
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::new(code)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::PermissionDenied => ErrorCode::ReadOnly,
            std::io::ErrorKind::OutOfMemory => ErrorCode::NoMem,
            _ => ErrorCode::IoErr,
        };
        Error::with_message(code, err.to_string())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;
