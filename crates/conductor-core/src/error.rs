//! The single error sum type the engine surfaces.
//!
//! Every error carries a kind (used by the HTTP adapter to pick a status
//! code), a stable machine-readable code, a human message, and structured
//! details. Transport adapters never invent their own error shapes.

use std::fmt;

use serde_json::Value;

/// Classification of an error, mapped to a status code at the HTTP
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input; rejected at the boundary.
    Validation,
    /// A referenced entity does not exist.
    NotFound,
    /// An illegal transition or duplicate operation.
    Conflict,
    /// Missing or invalid credentials.
    Unauthorized,
    /// Authenticated but not allowed.
    Forbidden,
    /// No capacity to serve the request (e.g. no eligible workers).
    Unavailable,
    /// A deadline elapsed.
    Timeout,
    /// Too many requests.
    RateLimited,
    /// A retryable failure (network, worker blip).
    Transient,
    /// Retries exhausted or an explicitly fatal worker error.
    Fatal,
    /// The store or bus is unhealthy; fail fast.
    Infrastructure,
}

impl ErrorKind {
    /// Stable machine-readable code for this kind.
    pub fn code(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::Infrastructure => "infrastructure",
        }
    }

    /// Whether the operation may be retried as-is.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout | Self::Unavailable)
    }
}

/// The engine-wide error type.
#[derive(Debug, thiserror::Error)]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    /// Contextual values: ids, limits, offending fields.
    pub details: Value,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Value::Null,
        }
    }

    /// Attach structured details (ids, values) to the error.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Infrastructure, message)
    }

    /// Stable code string, e.g. `"not_found"`.
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(ErrorKind::Infrastructure, format!("{err:#}"))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::new(ErrorKind::Infrastructure, err.to_string())
    }
}
