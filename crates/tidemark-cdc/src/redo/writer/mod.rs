//! Redo log writer backends
//!
//! The manager talks to a [`RedoLogWriter`]; three backends exist:
//!
//! - [`BlackholeLogWriter`] - accepts and drops everything; for tests and
//!   for benchmarking upstream throughput.
//! - [`FileLogWriter`] - rotating, CRC-framed segments on local disk.
//! - [`S3LogWriter`] - the file discipline locally, plus upload of closed
//!   segments to an S3-compatible object store.

mod blackhole;
mod file;
mod s3;

pub use blackhole::BlackholeLogWriter;
pub use file::{ClosedSegment, FileLogWriter, LogWriterConfig};
pub use s3::S3LogWriter;

use crate::common::{Result, TableId, Ts};
use crate::redo::record::RedoRecord;
use async_trait::async_trait;
use std::collections::HashMap;

/// Durable sink for redo records.
///
/// Implementations serialize appends internally; one in-flight append per
/// segment at a time. A table's resolved ts must only be reported through
/// [`RedoLogWriter::current_resolved_ts`] once the covering writes are
/// durable for this backend's definition of durability.
#[async_trait]
pub trait RedoLogWriter: Send + Sync {
    /// Append row records for one table.
    async fn write_log(&self, table_id: TableId, records: Vec<RedoRecord>) -> Result<()>;

    /// Make everything up to `resolved_ts` for `table_id` durable.
    async fn flush_log(&self, table_id: TableId, resolved_ts: Ts) -> Result<()>;

    /// Append a DDL record.
    async fn send_ddl(&self, record: RedoRecord) -> Result<()>;

    /// Append the changefeed-wide resolved watermark.
    async fn emit_resolved_ts(&self, ts: Ts) -> Result<()>;

    /// Append the changefeed-wide checkpoint watermark.
    async fn emit_checkpoint_ts(&self, ts: Ts) -> Result<()>;

    /// Durable resolved ts per table, for the tables the writer knows.
    /// Tables that never flushed are absent from the result.
    async fn current_resolved_ts(
        &self,
        table_ids: &[TableId],
    ) -> Result<HashMap<TableId, Ts>>;

    /// Stop tracking a removed table.
    async fn remove_table(&self, table_id: TableId) -> Result<()>;

    /// Flush outstanding state and stop background work.
    async fn close(&self) -> Result<()>;
}
