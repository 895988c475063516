//! Error types for configuration and per-request failures.
//!
//! Configuration errors are fatal and surface before any virtual user
//! starts. Request errors never leave the iteration that produced them; the
//! executor folds them into a failed sample.

use std::path::PathBuf;

use thiserror::Error;

/// A scenario that cannot be run as written.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("[CFG-1001] stage timeline is empty: at least one stage is required")]
    EmptyTimeline,

    #[error("[CFG-1002] stage {index} has a zero duration")]
    ZeroStageDuration { index: usize },

    #[error("[CFG-1003] invalid duration '{value}' for {field}")]
    InvalidDuration { field: String, value: String },

    #[error("[CFG-1004] stage '{value}' must be written as DURATION:TARGET (e.g. 30s:100)")]
    InvalidStage { value: String },

    #[error("[CFG-2001] invalid threshold '{expression}' on {metric}: {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("[CFG-2002] unknown threshold metric '{metric}'")]
    UnknownMetric { metric: String },

    #[error("[CFG-3001] request is missing a url")]
    MissingUrl,

    #[error("[CFG-3002] invalid request {field}: {reason}")]
    InvalidRequest { field: &'static str, reason: String },

    #[error("[CFG-3003] invalid check '{name}': {reason}")]
    InvalidCheck { name: String, reason: String },

    #[error("[CFG-4001] {field} must be at least {min}")]
    OutOfRange { field: &'static str, min: String },

    #[error("[CFG-5001] cannot read scenario {path}: {details}")]
    Unreadable { path: PathBuf, details: String },

    #[error("[CFG-5002] cannot parse scenario {path}: {details}")]
    Parse { path: PathBuf, details: String },
}

impl ConfigError {
    pub(crate) fn duration(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidDuration {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Why a single HTTP call did not yield a response.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to read response body: {0}")]
    Body(String),
}

impl RequestError {
    /// The stable, low-cardinality marker stored on a failed sample.
    pub fn kind(&self) -> RequestErrorKind {
        match self {
            Self::Timeout => RequestErrorKind::Timeout,
            Self::Connect(_) => RequestErrorKind::Connect,
            Self::Http(_) => RequestErrorKind::Http,
            Self::InvalidRequest(_) => RequestErrorKind::InvalidRequest,
            Self::Body(_) => RequestErrorKind::Body,
        }
    }
}

/// Error marker recorded on a sample in place of a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestErrorKind {
    Timeout,
    Connect,
    Http,
    InvalidRequest,
    Body,
}

impl RequestErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Http => "http",
            Self::InvalidRequest => "invalid_request",
            Self::Body => "body",
        }
    }
}

impl std::fmt::Display for RequestErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
