//! Error types for repograph-store

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Backend temporarily unreachable (connection refused, timeout)
    Unavailable,
    /// Concurrent write conflict, safe to retry
    Conflict,
    /// Serialization/deserialization errors
    Serialization,
    /// Node not found
    NodeNotFound,
    /// Relationship endpoint missing
    DanglingRelationship,
    /// Malformed query pattern or identifier
    InvalidQuery,
    /// Authentication / authorization failure
    Unauthorized,
    /// I/O errors
    IO,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Serialization => "serialization",
            ErrorKind::NodeNotFound => "node_not_found",
            ErrorKind::DanglingRelationship => "dangling_relationship",
            ErrorKind::InvalidQuery => "invalid_query",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::IO => "io",
        }
    }

    /// Whether a write that failed with this kind may be retried as-is
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Unavailable | ErrorKind::Conflict | ErrorKind::IO)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    // Convenience constructors
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn node_not_found(node_id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::NodeNotFound,
            format!("Node not found: {}", node_id.into()),
        )
    }

    pub fn dangling_relationship(from: &str, to: &str, rel_type: &str) -> Self {
        Self::new(
            ErrorKind::DanglingRelationship,
            format!("Cannot upsert {} -[{}]-> {}: endpoint missing", from, rel_type, to),
        )
    }

    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidQuery, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }
}

// JSON error conversions
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::new(ErrorKind::IO, format!("IO error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_error_display() {
        let err = StorageError::node_not_found("file:src/lib.rs");
        let msg = format!("{}", err);
        assert!(msg.contains("node_not_found"));
        assert!(msg.contains("file:src/lib.rs"));
    }

    #[test]
    fn test_unavailable_error() {
        let err = StorageError::unavailable("Connection refused");
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert!(err.source.is_none());
        assert!(err.is_transient());
        assert_eq!(format!("{}", err), "[unavailable] Connection refused");
    }

    #[test]
    fn test_dangling_relationship_message() {
        let err = StorageError::dangling_relationship("dir:src", "file:x", "CONTAINS");
        assert_eq!(err.kind, ErrorKind::DanglingRelationship);
        assert!(err.message.contains("CONTAINS"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ErrorKind::Unavailable.is_transient());
        assert!(ErrorKind::Conflict.is_transient());
        assert!(!ErrorKind::Unauthorized.is_transient());
        assert!(!ErrorKind::InvalidQuery.is_transient());
        assert!(!ErrorKind::Serialization.is_transient());
    }

    #[test]
    fn test_with_source() {
        use std::io;

        let io_err = io::Error::new(io::ErrorKind::NotFound, "socket missing");
        let err = StorageError::unavailable("backend down").with_source(io_err);

        let source = err.source().unwrap();
        assert!(source.to_string().contains("socket missing"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json")
            .err()
            .unwrap();
        let err: StorageError = json_err.into();

        assert_eq!(err.kind, ErrorKind::Serialization);
        assert!(err.message.contains("JSON error"));
        assert!(err.source.is_some());
    }
}
