//! Error types for replication operations
//!
//! Tagged errors so callers can distinguish fatal configuration problems
//! from transient I/O that the writers retry internally.

use thiserror::Error;

/// Replication-pipeline errors.
#[derive(Error, Debug)]
pub enum CdcError {
    /// Bad consistent level / storage / sink URI / query parameter. Fatal
    /// for the changefeed, surfaced at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The S3 URI for redo storage did not parse. Fatal.
    #[error("invalid S3 URI: {0}")]
    InvalidS3Uri(String),

    /// Redo writer I/O failure. The writers retry transient cases
    /// internally; this surfaces only after retries are exhausted.
    #[error("redo writer I/O error: {0}")]
    WriterIo(#[from] std::io::Error),

    /// Object storage failure during segment upload or listing.
    #[error("object storage error: {0}")]
    Storage(#[from] object_store::Error),

    /// Downstream MySQL failure (probe or connection).
    #[error("MySQL error: {0}")]
    MySql(String),

    /// A redo record failed to encode or decode.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A redo log frame failed validation (bad magic or CRC mismatch).
    #[error("redo log corrupted: {0}")]
    Corrupted(String),

    /// A pipeline stage failed.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// The surrounding operation was cancelled. Not an error for logging
    /// purposes.
    #[error("operation cancelled")]
    Cancelled,

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl CdcError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn pipeline(msg: impl Into<String>) -> Self {
        Self::Pipeline(msg.into())
    }

    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    pub fn mysql(msg: impl Into<String>) -> Self {
        Self::MySql(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether a retry may succeed. Configuration and corruption errors
    /// never clear on retry; transient I/O may.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::WriterIo(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                        | ErrorKind::WouldBlock
                )
            }
            Self::Storage(_) => true,
            Self::MySql(msg) => {
                msg.contains("Lost connection")
                    || msg.contains("connection reset")
                    || msg.contains("timed out")
            }
            Self::InvalidConfig(_)
            | Self::InvalidS3Uri(_)
            | Self::Json(_)
            | Self::Corrupted(_)
            | Self::Pipeline(_)
            | Self::Cancelled
            | Self::Other(_) => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(feature = "mysql")]
impl From<mysql_async::Error> for CdcError {
    fn from(e: mysql_async::Error) -> Self {
        Self::MySql(e.to_string())
    }
}

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, CdcError>;
