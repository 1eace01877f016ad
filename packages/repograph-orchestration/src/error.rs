use chrono::{DateTime, Utc};
use repograph_store::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Resource exhausted: requested {requested} tokens, {available}/{max} available")]
    ResourceExhausted {
        requested: u32,
        available: usize,
        max: usize,
    },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("DAG cycle detected among nodes: {}", .0.join(", "))]
    DagCycleDetected(Vec<String>),

    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn transient<E: std::fmt::Display>(e: E) -> Self {
        Self::Transient(e.to_string())
    }

    pub fn fatal<E: std::fmt::Display>(e: E) -> Self {
        Self::Fatal(e.to_string())
    }

    pub fn invalid_options<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidOptions(e.to_string())
    }

    /// Classify this error for retry logic
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transient(_) | Self::Timeout(_) => ErrorCategory::Transient,
            Self::ResourceExhausted { .. } => ErrorCategory::ResourceExhausted,
            Self::JobNotFound(_) => ErrorCategory::NotFound,
            Self::Cancelled(_) => ErrorCategory::Cancelled,
            Self::Storage(e) if e.is_transient() => ErrorCategory::Transient,
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionRefused => ErrorCategory::Transient,
                _ => ErrorCategory::Fatal,
            },
            Self::Fatal(_)
            | Self::StageNotFound(_)
            | Self::InvalidStateTransition { .. }
            | Self::InvalidOptions(_)
            | Self::DagCycleDetected(_)
            | Self::MissingDependency(_)
            | Self::Config(_)
            | Self::Storage(_)
            | Self::Other(_) => ErrorCategory::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Snapshot of this error for the job status surface
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord::new(self.category(), self.to_string())
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Timeouts, contention, rate limiting - retried per policy
    Transient,
    /// Invalid input, configuration or credentials - never retried
    Fatal,
    /// Throttle saturated - callers may treat it as transient
    ResourceExhausted,
    /// Unknown job or step identifier
    NotFound,
    /// Deliberate stop, not a failure
    Cancelled,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Fatal => "fatal",
            ErrorCategory::ResourceExhausted => "resource_exhausted",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Cancelled => "cancelled",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Transient | ErrorCategory::ResourceExhausted
        )
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "fatal" => Ok(ErrorCategory::Fatal),
            "resource_exhausted" => Ok(ErrorCategory::ResourceExhausted),
            "not_found" => Ok(ErrorCategory::NotFound),
            "cancelled" => Ok(ErrorCategory::Cancelled),
            _ => Err(OrchestratorError::fatal(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error as recorded on a step or job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            at: Utc::now(),
        }
    }
}
