//! Accept-and-drop writer

use crate::common::{Result, TableId, Ts};
use crate::redo::record::RedoRecord;
use crate::redo::writer::RedoLogWriter;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Writer that drops every record but still tracks per-table resolved
/// timestamps, so the manager's watermark machinery works unchanged.
#[derive(Debug, Default)]
pub struct BlackholeLogWriter {
    rts: RwLock<HashMap<TableId, Ts>>,
    rows_dropped: AtomicU64,
    ddls_dropped: AtomicU64,
}

impl BlackholeLogWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows accepted (and dropped) so far.
    pub fn rows_dropped(&self) -> u64 {
        self.rows_dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RedoLogWriter for BlackholeLogWriter {
    async fn write_log(&self, table_id: TableId, records: Vec<RedoRecord>) -> Result<()> {
        trace!(table_id, count = records.len(), "blackhole dropped rows");
        self.rows_dropped
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn flush_log(&self, table_id: TableId, resolved_ts: Ts) -> Result<()> {
        self.rts.write().insert(table_id, resolved_ts);
        Ok(())
    }

    async fn send_ddl(&self, _record: RedoRecord) -> Result<()> {
        self.ddls_dropped.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn emit_resolved_ts(&self, _ts: Ts) -> Result<()> {
        Ok(())
    }

    async fn emit_checkpoint_ts(&self, _ts: Ts) -> Result<()> {
        Ok(())
    }

    async fn current_resolved_ts(
        &self,
        table_ids: &[TableId],
    ) -> Result<HashMap<TableId, Ts>> {
        let rts = self.rts.read();
        Ok(table_ids
            .iter()
            .filter_map(|id| rts.get(id).map(|ts| (*id, *ts)))
            .collect())
    }

    async fn remove_table(&self, table_id: TableId) -> Result<()> {
        self.rts.write().remove(&table_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_resolved_ts_and_drops_rows() {
        let writer = BlackholeLogWriter::new();
        writer
            .write_log(1, vec![RedoRecord::Checkpoint { ts: 1 }])
            .await
            .unwrap();
        assert_eq!(writer.rows_dropped(), 1);

        writer.flush_log(1, 120).await.unwrap();
        writer.flush_log(2, 220).await.unwrap();
        let rts = writer.current_resolved_ts(&[1, 2, 3]).await.unwrap();
        assert_eq!(rts.get(&1), Some(&120));
        assert_eq!(rts.get(&2), Some(&220));
        assert!(!rts.contains_key(&3));

        writer.remove_table(1).await.unwrap();
        let rts = writer.current_resolved_ts(&[1]).await.unwrap();
        assert!(rts.is_empty());
    }
}
