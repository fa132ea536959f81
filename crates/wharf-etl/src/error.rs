//! Error types for the ETL pipeline

use std::fmt;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Which side of the pipeline an operation talked to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum System {
    Source,
    Sink,
}

impl fmt::Display for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            System::Source => f.write_str("source"),
            System::Sink => f.write_str("sink"),
        }
    }
}

/// Kind of statement that failed, kept apart for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Count,
    Extract,
    Ddl,
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKind::Count => f.write_str("count"),
            QueryKind::Extract => f.write_str("extract"),
            QueryKind::Ddl => f.write_str("ddl"),
        }
    }
}

/// Pipeline error taxonomy
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid descriptor for table '{table}': {reason}")]
    InvalidDescriptor { table: String, reason: String },

    #[error("Secret retrieval failed for '{secret_id}': {message}")]
    Secret { secret_id: String, message: String },

    #[error("Connection to {system} failed: {message}")]
    Connection { system: System, message: String },

    #[error("{kind} query against {system} failed: {message}")]
    QueryExecution {
        system: System,
        kind: QueryKind,
        message: String,
    },

    #[error("Table initialization failed for '{table}': {message}")]
    TableInit { table: String, message: String },

    #[error("Staging write to '{locator}' failed: {message}")]
    StagingWrite { locator: String, message: String },

    #[error("Staging read of '{locator}' failed: {message}")]
    StagingRead { locator: String, message: String },

    #[error("Load of chunk {chunk} into '{table}' failed: {message}")]
    Load {
        chunk: u64,
        table: String,
        /// Staged copy of the chunk, kept for manual replay
        staged: Option<String>,
        message: String,
    },
}

impl EtlError {
    pub fn invalid_descriptor(table: impl Into<String>, reason: impl Into<String>) -> Self {
        EtlError::InvalidDescriptor {
            table: table.into(),
            reason: reason.into(),
        }
    }

    pub fn query(system: System, kind: QueryKind, message: impl fmt::Display) -> Self {
        EtlError::QueryExecution {
            system,
            kind,
            message: message.to_string(),
        }
    }

    /// Map a sqlx error to the taxonomy, splitting connectivity from SQL failures
    pub(crate) fn from_sqlx(system: System, kind: QueryKind, err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => EtlError::Connection {
                system,
                message: err.to_string(),
            },
            other => EtlError::query(system, kind, other),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_descriptor_names_the_table() {
        let err = EtlError::invalid_descriptor("table_one", "no watermark");
        assert!(err.to_string().contains("table_one"), "{}", err);
        assert!(err.to_string().contains("no watermark"), "{}", err);
    }

    #[test]
    fn test_sqlx_mapping_separates_connection_errors() {
        let err = EtlError::from_sqlx(System::Source, QueryKind::Count, sqlx::Error::PoolTimedOut);
        assert!(matches!(err, EtlError::Connection { system: System::Source, .. }));

        let err = EtlError::from_sqlx(System::Source, QueryKind::Extract, sqlx::Error::RowNotFound);
        assert!(matches!(
            err,
            EtlError::QueryExecution {
                kind: QueryKind::Extract,
                ..
            }
        ));
    }

    #[test]
    fn test_display_names_the_query_kind() {
        let err = EtlError::query(System::Sink, QueryKind::Count, "syntax error");
        assert_eq!(err.to_string(), "count query against sink failed: syntax error");
    }
}
