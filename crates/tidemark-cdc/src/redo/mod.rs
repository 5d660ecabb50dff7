//! Redo log: crash-consistent persistence ahead of the sink
//!
//! The redo log records every row mutation and DDL before the sink
//! acknowledges it, so a crashed changefeed can reconstruct the sink
//! without loss. [`RedoLogManager`] buffers emission, tracks per-table
//! resolved timestamps and publishes the global minimum; the
//! [`writer::RedoLogWriter`] backends provide the actual durability.

mod manager;
pub mod record;
pub mod writer;

pub use manager::{ManagerOptions, RedoLogManager, RedoRuntimeContext};
pub use record::RedoRecord;

use crate::common::{CdcError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Subdirectory of the data dir holding redo segments.
pub const DEFAULT_REDO_DIR: &str = "redo";

/// Default rotation threshold (64 MiB).
pub const DEFAULT_MAX_LOG_SIZE: u64 = 64 * 1024 * 1024;

/// Default background flush cadence.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;

/// Consistency level of a changefeed.
///
/// `Normal` disables the redo log entirely; `Eventual` persists redo
/// records ahead of sink acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistentLevel {
    Normal,
    Eventual,
}

impl FromStr for ConsistentLevel {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(Self::Normal),
            "eventual" => Ok(Self::Eventual),
            other => Err(CdcError::invalid_config(format!(
                "unknown consistent level {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ConsistentLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::Eventual => f.write_str("eventual"),
        }
    }
}

/// Backing storage for the redo log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistentStorage {
    Local,
    S3,
    Blackhole,
}

impl FromStr for ConsistentStorage {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            "blackhole" => Ok(Self::Blackhole),
            other => Err(CdcError::invalid_config(format!(
                "unknown consistent storage {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ConsistentStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::S3 => f.write_str("s3"),
            Self::Blackhole => f.write_str("blackhole"),
        }
    }
}

/// Whether a level string names a valid consistent level.
pub fn is_valid_consistent_level(level: &str) -> bool {
    ConsistentLevel::from_str(level).is_ok()
}

/// Whether a storage string names a valid consistent storage.
pub fn is_valid_consistent_storage(storage: &str) -> bool {
    ConsistentStorage::from_str(storage).is_ok()
}

/// Redo configuration of one changefeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConsistentConfig {
    pub level: ConsistentLevel,
    pub storage: ConsistentStorage,
    /// Segment rotation threshold in bytes.
    pub max_log_size: u64,
    pub flush_interval_in_ms: u64,
    /// Required iff `storage` is `s3`.
    pub s3_uri: String,
}

impl Default for ConsistentConfig {
    fn default() -> Self {
        Self {
            level: ConsistentLevel::Normal,
            storage: ConsistentStorage::Local,
            max_log_size: DEFAULT_MAX_LOG_SIZE,
            flush_interval_in_ms: DEFAULT_FLUSH_INTERVAL_MS,
            s3_uri: String::new(),
        }
    }
}

impl ConsistentConfig {
    /// Validate the combination; called by the manager constructor.
    pub fn validate(&self) -> Result<()> {
        if self.level == ConsistentLevel::Normal {
            return Ok(());
        }
        if self.max_log_size == 0 {
            return Err(CdcError::invalid_config("max-log-size must be positive"));
        }
        if self.storage == ConsistentStorage::S3 {
            if self.s3_uri.is_empty() {
                return Err(CdcError::invalid_config(
                    "s3 storage requires a non-empty s3-uri",
                ));
            }
            self.parsed_s3_uri()?;
        }
        Ok(())
    }

    /// Parse `s3_uri`, mapping failures to [`CdcError::InvalidS3Uri`].
    pub fn parsed_s3_uri(&self) -> Result<Url> {
        Url::parse(&self.s3_uri).map_err(|e| CdcError::InvalidS3Uri(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_and_storage_validation() {
        assert!(is_valid_consistent_level("normal"));
        assert!(is_valid_consistent_level("eventual"));
        assert!(!is_valid_consistent_level("strong"));
        assert!(is_valid_consistent_storage("local"));
        assert!(is_valid_consistent_storage("s3"));
        assert!(is_valid_consistent_storage("blackhole"));
        assert!(!is_valid_consistent_storage("gcs"));
    }

    #[test]
    fn s3_storage_requires_uri() {
        let config = ConsistentConfig {
            level: ConsistentLevel::Eventual,
            storage: ConsistentStorage::S3,
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            CdcError::InvalidConfig(_)
        ));

        let config = ConsistentConfig {
            s3_uri: "s3://bucket/redo".into(),
            ..config
        };
        config.validate().unwrap();

        let config = ConsistentConfig {
            s3_uri: "::not a uri::".into(),
            ..config
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            CdcError::InvalidS3Uri(_)
        ));
    }

    #[test]
    fn normal_level_skips_validation() {
        let config = ConsistentConfig {
            level: ConsistentLevel::Normal,
            storage: ConsistentStorage::S3,
            s3_uri: String::new(),
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn config_deserializes_from_kebab_case() {
        let config: ConsistentConfig = serde_json::from_str(
            r#"{"level":"eventual","storage":"s3","max-log-size":1048576,
                "flush-interval-in-ms":500,"s3-uri":"s3://bucket/redo"}"#,
        )
        .unwrap();
        assert_eq!(config.level, ConsistentLevel::Eventual);
        assert_eq!(config.storage, ConsistentStorage::S3);
        assert_eq!(config.max_log_size, 1048576);
        assert_eq!(config.flush_interval_in_ms, 500);
    }

    #[test]
    fn bad_level_fails_deserialization() {
        let result: std::result::Result<ConsistentConfig, _> =
            serde_json::from_str(r#"{"level":"strong","storage":"local"}"#);
        assert!(result.is_err());
    }
}
