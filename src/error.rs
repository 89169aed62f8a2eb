//! Error types for the session and stream subsystem
//!
//! Errors carry a kind that callers can match on: configuration problems,
//! malformed input, missing or duplicate catalog state, timeouts, and the
//! terminal stream conditions. Database driver errors are captured with their
//! SQLSTATE code so catalog races (unique violations) can be recognized.

use tokio_postgres::error::SqlState;

/// Result alias used throughout the db subsystem
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds for the session/stream core
#[derive(Debug, Clone)]
pub enum Error {
    /// Invalid or incomplete configuration
    Config(String),

    /// Malformed capture, timestamp, or option string
    Parse(String),

    /// A session, entity, node, or table that should exist does not
    NotFound(String),

    /// A resource (session ID, catalog row) already exists
    AlreadyExists(String),

    /// A statement exceeded its deadline
    Timeout,

    /// The operation was aborted by a cancel signal
    Cancelled,

    /// The stream was closed underneath the caller
    StreamClosed,

    /// The requested backend or feature is not supported
    NotSupported(String),

    /// Internal invariant violation
    Programmer(String),

    /// Database driver error with optional SQLSTATE code
    Db {
        code: Option<String>,
        message: String,
    },

    /// Connection pool error
    Pool(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        Error::AlreadyExists(what.into())
    }

    pub fn not_supported(what: impl Into<String>) -> Self {
        Error::NotSupported(what.into())
    }

    pub fn programmer(msg: impl Into<String>) -> Self {
        Error::Programmer(msg.into())
    }

    /// True if this is a driver error for a violated unique constraint.
    ///
    /// The schema manager uses this to recognize the loser of a catalog
    /// creation race.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Error::Db { code: Some(c), .. } if c == SqlState::UNIQUE_VIOLATION.code())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::NotFound(what) => write!(f, "not found: {}", what),
            Error::AlreadyExists(what) => write!(f, "already exists: {}", what),
            Error::Timeout => write!(f, "statement timed out"),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::StreamClosed => write!(f, "stream closed"),
            Error::NotSupported(what) => write!(f, "not supported: {}", what),
            Error::Programmer(msg) => write!(f, "internal error: {}", msg),
            Error::Db { code, message } => match code {
                Some(c) => write!(f, "database error ({}): {}", c, message),
                None => write!(f, "database error: {}", message),
            },
            Error::Pool(msg) => write!(f, "connection pool error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        Error::Db {
            code: err.code().map(|c| c.code().to_string()),
            message: err.to_string(),
        }
    }
}

impl From<deadpool_postgres::PoolError> for Error {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Error::Pool(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_violation_detection() {
        let err = Error::Db {
            code: Some("23505".to_string()),
            message: "duplicate key value violates unique constraint".to_string(),
        };
        assert!(err.is_unique_violation());

        let err = Error::Db {
            code: Some("42P01".to_string()),
            message: "relation does not exist".to_string(),
        };
        assert!(!err.is_unique_violation());

        assert!(!Error::Timeout.is_unique_violation());
    }

    #[test]
    fn test_display() {
        let err = Error::not_found("session abc");
        assert_eq!(err.to_string(), "not found: session abc");
    }
}
