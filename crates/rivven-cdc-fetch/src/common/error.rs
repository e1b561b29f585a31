//! Error types for split fetching
//!
//! Every error carries an [`ErrorClass`] so the orchestration layer can decide
//! between "retry on a fresh context" and "operator must reconfigure" without
//! looking at messages.

use crate::common::resilience::RetriableErrorType;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use thiserror::Error;

/// How the caller must react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Offset no longer available, purged history, duplicate schema
    /// registration, invalid settings. Never retried.
    Configuration,
    /// Connection drop, refused connection, timeout. Retry on a fresh context
    /// from the last checkpointed offset.
    Transient,
    /// Missing schema for a position, malformed log record, illegal state
    /// transition. Indicates a planning or persistence bug upstream.
    InternalConsistency,
    /// The context was closed while a producer or consumer was waiting.
    Cancelled,
}

/// Coarse grouping used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Binlog and GTID decoding
    Replication,
    Schema,
    Configuration,
    /// Connection, stream and timeout failures
    Network,
    Serialization,
    Other,
}

#[derive(Error, Debug)]
pub enum CdcError {
    /// The requested starting offset can no longer be served by the source
    #[error("offset {offset} cannot be served: {reason}")]
    OffsetNotAvailable { offset: String, reason: String },

    /// A single configure call tried to register two schema records for one table
    #[error("table {0} registered twice in one schema history batch")]
    DuplicateSchemaRegistration(String),

    #[error("no schema for table {table} at position {position}")]
    SchemaUnknown { table: String, position: String },

    #[error("malformed log record: {0}")]
    MalformedRecord(String),

    #[error("invalid fetch configuration: {0}")]
    Config(String),

    #[error("schema: {0}")]
    Schema(String),

    #[error("cannot encode or decode: {0}")]
    Serialization(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Failure reported by the replication client
    #[error("log connection: {0}")]
    Connection(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// The log stream ended while the split still expected records
    #[error("log connection closed")]
    ConnectionClosed,

    #[error("log connection refused: {0}")]
    ConnectionRefused(String),

    #[error("illegal state: {0}")]
    InvalidState(String),

    #[error("event queue closed")]
    QueueClosed,
}

impl CdcError {
    pub fn offset_not_available(offset: impl ToString, reason: impl Into<String>) -> Self {
        Self::OffsetNotAvailable {
            offset: offset.to_string(),
            reason: reason.into(),
        }
    }

    pub fn schema_unknown(table: impl ToString, position: impl ToString) -> Self {
        Self::SchemaUnknown {
            table: table.to_string(),
            position: position.to_string(),
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedRecord(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn connection_refused(msg: impl Into<String>) -> Self {
        Self::ConnectionRefused(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::OffsetNotAvailable { .. }
            | Self::DuplicateSchemaRegistration(_)
            | Self::Config(_) => ErrorClass::Configuration,
            Self::Connection(_)
            | Self::Timeout(_)
            | Self::ConnectionClosed
            | Self::ConnectionRefused(_) => ErrorClass::Transient,
            Self::Io(e) if is_transient_io(e.kind()) => ErrorClass::Transient,
            Self::QueueClosed => ErrorClass::Cancelled,
            Self::Io(_)
            | Self::SchemaUnknown { .. }
            | Self::MalformedRecord(_)
            | Self::Schema(_)
            | Self::Serialization(_)
            | Self::Json(_)
            | Self::InvalidState(_) => ErrorClass::InternalConsistency,
        }
    }

    /// Transient errors only; a fresh context may succeed.
    pub fn is_retriable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Configuration and consistency errors; retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Configuration | ErrorClass::InternalConsistency
        )
    }

    /// Which retry bucket a transient error falls into.
    pub fn retriable_error_type(&self) -> Option<RetriableErrorType> {
        if !self.is_retriable() {
            return None;
        }
        Some(match self {
            Self::ConnectionClosed | Self::Connection(_) => RetriableErrorType::ConnectionLost,
            Self::ConnectionRefused(_) => RetriableErrorType::ConnectionRefused,
            Self::Timeout(_) => RetriableErrorType::Timeout,
            Self::Io(e) if e.kind() == ErrorKind::TimedOut => RetriableErrorType::Timeout,
            _ => RetriableErrorType::TemporaryFailure,
        })
    }

    pub fn category(&self) -> ErrorCategory {
        self.label().0
    }

    /// Stable snake_case code for metrics labels.
    pub fn error_code(&self) -> &'static str {
        self.label().1
    }

    fn label(&self) -> (ErrorCategory, &'static str) {
        use ErrorCategory::*;
        match self {
            Self::OffsetNotAvailable { .. } => (Configuration, "offset_not_available"),
            Self::DuplicateSchemaRegistration(_) => (Schema, "duplicate_schema_registration"),
            Self::SchemaUnknown { .. } => (Schema, "schema_unknown"),
            Self::MalformedRecord(_) => (Replication, "malformed_record"),
            Self::Config(_) => (Configuration, "config_error"),
            Self::Schema(_) => (Schema, "schema_error"),
            Self::Serialization(_) => (Serialization, "serialization_error"),
            Self::Json(_) => (Serialization, "json_error"),
            Self::Io(_) => (Network, "io_error"),
            Self::Connection(_) => (Network, "connection_error"),
            Self::Timeout(_) => (Network, "timeout"),
            Self::ConnectionClosed => (Network, "connection_closed"),
            Self::ConnectionRefused(_) => (Network, "connection_refused"),
            Self::InvalidState(_) => (Other, "invalid_state"),
            Self::QueueClosed => (Other, "queue_closed"),
        }
    }
}

fn is_transient_io(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::UnexpectedEof
    )
}

pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn io(kind: ErrorKind) -> CdcError {
        CdcError::Io(std::io::Error::from(kind))
    }

    #[test]
    fn test_messages_name_the_subject() {
        let err = CdcError::offset_not_available("mysql-bin.000001:4", "purged");
        assert_eq!(
            err.to_string(),
            "offset mysql-bin.000001:4 cannot be served: purged"
        );

        let err = CdcError::schema_unknown("shop.orders", "mysql-bin.000002:120");
        assert!(err.to_string().contains("shop.orders"));
        assert!(err.to_string().contains("mysql-bin.000002:120"));
    }

    #[test]
    fn test_classes() {
        let cases = [
            (CdcError::offset_not_available("x", "y"), ErrorClass::Configuration),
            (
                CdcError::DuplicateSchemaRegistration("a.b".into()),
                ErrorClass::Configuration,
            ),
            (CdcError::config("bad"), ErrorClass::Configuration),
            (CdcError::schema_unknown("a.b", "x"), ErrorClass::InternalConsistency),
            (CdcError::malformed("bad"), ErrorClass::InternalConsistency),
            (CdcError::invalid_state("x"), ErrorClass::InternalConsistency),
            (CdcError::ConnectionClosed, ErrorClass::Transient),
            (CdcError::connection("reset by peer"), ErrorClass::Transient),
            (io(ErrorKind::BrokenPipe), ErrorClass::Transient),
            (io(ErrorKind::NotFound), ErrorClass::InternalConsistency),
            (CdcError::QueueClosed, ErrorClass::Cancelled),
        ];
        for (err, class) in cases {
            assert_eq!(err.class(), class, "{err}");
            assert_eq!(err.is_retriable(), class == ErrorClass::Transient, "{err}");
        }
    }

    #[test]
    fn test_fatal_excludes_transient_and_cancelled() {
        assert!(CdcError::offset_not_available("x", "y").is_fatal());
        assert!(CdcError::malformed("x").is_fatal());
        assert!(!CdcError::ConnectionClosed.is_fatal());
        assert!(!CdcError::QueueClosed.is_fatal());
    }

    #[test]
    fn test_retry_buckets() {
        assert_eq!(
            CdcError::ConnectionClosed.retriable_error_type(),
            Some(RetriableErrorType::ConnectionLost)
        );
        assert_eq!(
            CdcError::connection_refused("db:3306").retriable_error_type(),
            Some(RetriableErrorType::ConnectionRefused)
        );
        assert_eq!(
            io(ErrorKind::TimedOut).retriable_error_type(),
            Some(RetriableErrorType::Timeout)
        );
        assert_eq!(
            io(ErrorKind::UnexpectedEof).retriable_error_type(),
            Some(RetriableErrorType::TemporaryFailure)
        );
        assert_eq!(CdcError::config("x").retriable_error_type(), None);
        assert_eq!(io(ErrorKind::NotFound).retriable_error_type(), None);
    }

    #[test]
    fn test_labels() {
        assert_eq!(
            CdcError::offset_not_available("x", "y").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(CdcError::malformed("x").category(), ErrorCategory::Replication);
        assert_eq!(
            CdcError::DuplicateSchemaRegistration("a.b".into()).error_code(),
            "duplicate_schema_registration"
        );
        assert_eq!(CdcError::QueueClosed.error_code(), "queue_closed");
    }
}
