//! Error types for reliability operations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of an operation failure
///
/// Retry policies select which kinds are worth another attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Connection,
    Unavailable,
    RateLimited,
    InvalidInput,
    NotFound,
    PermissionDenied,
    Internal,
    /// Collaborator-defined kind
    Custom(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Connection => write!(f, "connection"),
            ErrorKind::Unavailable => write!(f, "unavailable"),
            ErrorKind::RateLimited => write!(f, "rate_limited"),
            ErrorKind::InvalidInput => write!(f, "invalid_input"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::PermissionDenied => write!(f, "permission_denied"),
            ErrorKind::Internal => write!(f, "internal"),
            ErrorKind::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// Failure reported by a protected operation
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl OperationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

/// Rejected configuration
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be at least {min} (got {value})")]
    BelowMinimum {
        field: &'static str,
        min: u64,
        value: u64,
    },

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("{field} must be a finite number in {range} (got {value})")]
    OutOfRange {
        field: &'static str,
        range: &'static str,
        value: f64,
    },

    #[error("custom retry strategy requires at least one custom delay")]
    MissingCustomDelays,

    #[error("{fallback} fallback requires {field}")]
    MissingFallbackField {
        fallback: &'static str,
        field: &'static str,
    },
}

/// Errors returned by standalone [`crate::CircuitBreaker::call`]
#[derive(Debug, Error)]
pub enum CircuitError<E = OperationError> {
    /// Circuit is open, calls are being rejected
    #[error("circuit '{circuit}' is open (retry after {retry_after:?})")]
    Open {
        circuit: String,
        retry_after: Duration,
    },

    /// The wrapped operation failed
    #[error("circuit execution failed: {0}")]
    Execution(E),
}

/// Layer of the composed call that produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Configuration,
    CircuitBreaker,
    Retry,
    Fallback,
}

/// Errors surfaced by the [`crate::ReliabilityCoordinator`]
#[derive(Debug, Clone, Error)]
pub enum ReliabilityError {
    /// Invalid configuration, never retried
    #[error("invalid configuration for '{key}': {source}")]
    Configuration {
        key: String,
        #[source]
        source: ConfigError,
    },

    /// The breaker rejected the call without invoking the operation
    #[error("circuit '{key}' is open, retry after {retry_after:?}")]
    CircuitOpen { key: String, retry_after: Duration },

    /// The operation failed on every permitted attempt
    #[error("operation '{key}' failed after {attempts} attempt(s): {source}")]
    Operation {
        key: String,
        attempts: u32,
        #[source]
        source: OperationError,
    },

    /// Both the primary call and its fallback failed
    #[error("operation '{key}' failed ({primary}) and its fallback failed too ({fallback})")]
    FallbackExhausted {
        key: String,
        primary: Box<ReliabilityError>,
        fallback: OperationError,
    },

    /// The caller cancelled between attempts
    #[error("operation '{key}' cancelled after {attempts} attempt(s)")]
    Cancelled { key: String, attempts: u32 },
}

impl ReliabilityError {
    /// Stable identifier for the collaborator boundary
    pub fn code(&self) -> &'static str {
        match self {
            ReliabilityError::Configuration { .. } => "CONFIGURATION_ERROR",
            ReliabilityError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            ReliabilityError::Operation { .. } => "OPERATION_FAILED",
            ReliabilityError::FallbackExhausted { .. } => "FALLBACK_EXHAUSTED",
            ReliabilityError::Cancelled { .. } => "CANCELLED",
        }
    }

    /// The layer that failed last
    pub fn layer(&self) -> Layer {
        match self {
            ReliabilityError::Configuration { .. } => Layer::Configuration,
            ReliabilityError::CircuitOpen { .. } => Layer::CircuitBreaker,
            ReliabilityError::Operation { .. } | ReliabilityError::Cancelled { .. } => {
                Layer::Retry
            }
            ReliabilityError::FallbackExhausted { .. } => Layer::Fallback,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            ReliabilityError::Configuration { key, .. }
            | ReliabilityError::CircuitOpen { key, .. }
            | ReliabilityError::Operation { key, .. }
            | ReliabilityError::FallbackExhausted { key, .. }
            | ReliabilityError::Cancelled { key, .. } => key,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ReliabilityError::CircuitOpen { .. })
    }
}
