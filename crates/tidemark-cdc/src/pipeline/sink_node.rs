//! Sink stage
//!
//! Terminal stage of a table pipeline. Buffers rows, pushes them to the
//! sink driver, advances the sink's checkpoint on resolved ticks and
//! enforces the emission barrier: no row with `commit_ts` above the
//! barrier leaves the pipeline until the barrier is raised. A copy of
//! every row and resolved advance also goes to the redo manager so the
//! sink can be reconstructed after a crash.

use crate::common::{CdcError, Result, RowChangedEvent, TableId, Ts};
use crate::pipeline::{ChangefeedContext, DataNode, Handled, PipelineMessage, SinkDataNode};
use crate::redo::RedoLogManager;
use crate::sink::Sink;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Rows buffered before an eager emit.
const DEFAULT_EMIT_BATCH: usize = 256;

/// Drives a [`Sink`] under barrier control.
pub struct SinkNode {
    table_id: TableId,
    sink: Arc<dyn Sink>,
    redo: Option<Arc<RedoLogManager>>,
    barrier_ts: Ts,
    resolved_ts: Ts,
    /// Highest ts flushed to the sink.
    flushed_ts: Ts,
    /// Replication stops once this ts is reached; `u64::MAX` = never.
    target_ts: Ts,
    buffer: Vec<RowChangedEvent>,
    emit_batch: usize,
    closed: bool,
}

impl SinkNode {
    pub fn new(
        table_id: TableId,
        sink: Arc<dyn Sink>,
        start_ts: Ts,
        target_ts: Ts,
        redo: Option<Arc<RedoLogManager>>,
    ) -> Self {
        Self {
            table_id,
            sink,
            redo,
            barrier_ts: start_ts,
            resolved_ts: start_ts,
            flushed_ts: start_ts,
            target_ts,
            buffer: Vec::new(),
            emit_batch: DEFAULT_EMIT_BATCH,
            closed: false,
        }
    }

    pub fn barrier_ts(&self) -> Ts {
        self.barrier_ts
    }

    pub fn resolved_ts(&self) -> Ts {
        self.resolved_ts
    }

    async fn emit_buffered(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.buffer);
        if let Some(redo) = &self.redo {
            if let Err(e) = redo
                .emit_row_changed_events(self.table_id, rows.clone())
                .await
            {
                self.hold_rows(rows);
                return Err(e);
            }
        }
        // A batch retried after a sink failure re-appends to the redo log;
        // redo replay is idempotent, so duplication is safe.
        if let Err(e) = self.sink.emit_rows(rows.clone()).await {
            self.hold_rows(rows);
            return Err(e);
        }
        Ok(())
    }

    /// Put a batch back at the front of the buffer after a failed emit so
    /// nothing is dropped; rows accepted during the await stay behind it.
    fn hold_rows(&mut self, mut rows: Vec<RowChangedEvent>) {
        rows.append(&mut self.buffer);
        self.buffer = rows;
    }

    /// Flush the sink up to `min(resolved, barrier, target)`.
    async fn flush_sink(&mut self) -> Result<()> {
        let ts = self
            .resolved_ts
            .min(self.barrier_ts)
            .min(self.target_ts);
        if ts <= self.flushed_ts {
            return Ok(());
        }
        self.emit_buffered().await?;
        if let Some(redo) = &self.redo {
            redo.flush_log(self.table_id, ts).await?;
        }
        self.sink.flush(ts).await?;
        self.flushed_ts = ts;
        Ok(())
    }
}

#[async_trait]
impl DataNode for SinkNode {
    async fn start(&mut self, ctx: &ChangefeedContext) -> Result<()> {
        debug!(
            table_id = self.table_id,
            changefeed = %ctx.changefeed_id,
            start_ts = self.flushed_ts,
            "sink node started"
        );
        Ok(())
    }

    async fn try_handle_data_message(&mut self, msg: PipelineMessage) -> Result<Handled> {
        if self.closed {
            return Err(CdcError::pipeline("sink node is closed"));
        }
        match msg {
            PipelineMessage::Row(row) => {
                if row.commit_ts > self.barrier_ts {
                    // Held back until a barrier raise; rejecting is the
                    // backpressure that stops the pump.
                    return Ok(Handled::Rejected(PipelineMessage::Row(row)));
                }
                if self.buffer.len() >= self.emit_batch {
                    // A full batch is still held after a failed emit. Retry
                    // it, and refuse new input while it will not drain.
                    match self.emit_buffered().await {
                        Ok(()) => {}
                        Err(e) if e.is_retriable() => {
                            warn!(
                                table_id = self.table_id,
                                error = %e,
                                held_rows = self.buffer.len(),
                                "emit retry failed, refusing input"
                            );
                            return Ok(Handled::Rejected(PipelineMessage::Row(row)));
                        }
                        Err(e) => return Err(e),
                    }
                }
                self.buffer.push(row);
                if self.buffer.len() >= self.emit_batch {
                    self.emit_buffered().await?;
                }
                Ok(Handled::Accepted)
            }
            PipelineMessage::Resolved(ts) => {
                if ts > self.resolved_ts {
                    self.resolved_ts = ts;
                }
                self.flush_sink().await?;
                Ok(Handled::Accepted)
            }
            PipelineMessage::Barrier(ts) => {
                self.barrier(ts).await?;
                Ok(Handled::Accepted)
            }
            PipelineMessage::Ddl(ddl) => {
                self.emit_buffered().await?;
                if let Some(redo) = &self.redo {
                    redo.emit_ddl_event(ddl.clone()).await?;
                }
                self.sink.emit_ddl(&ddl).await?;
                Ok(Handled::Accepted)
            }
        }
    }

    fn try_get_processed_message(&mut self) -> Option<PipelineMessage> {
        // Terminal stage; nothing flows past the sink.
        None
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.emit_buffered().await?;
        self.flush_sink().await?;
        self.sink.close().await?;
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl SinkDataNode for SinkNode {
    async fn barrier(&mut self, ts: Ts) -> Result<()> {
        if ts < self.barrier_ts {
            warn!(
                table_id = self.table_id,
                barrier_ts = ts,
                current = self.barrier_ts,
                "ignoring regressed barrier"
            );
            return Ok(());
        }
        self.barrier_ts = ts;
        self.flush_sink().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redo::record::RedoRecord;
    use crate::redo::writer::{BlackholeLogWriter, RedoLogWriter};
    use crate::sink::MemorySink;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Sink that fails the first `failures_left` row emissions with a
    /// transient error, then behaves like a memory sink.
    struct FlakySink {
        inner: MemorySink,
        failures_left: AtomicU32,
    }

    impl FlakySink {
        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                inner: MemorySink::new(),
                failures_left: AtomicU32::new(times),
            })
        }

        fn take_failure(&self) -> bool {
            self.failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }

        fn rows(&self) -> Vec<RowChangedEvent> {
            self.inner.rows()
        }
    }

    #[async_trait]
    impl Sink for FlakySink {
        async fn emit_rows(&self, rows: Vec<RowChangedEvent>) -> Result<()> {
            if self.take_failure() {
                return Err(CdcError::mysql("Lost connection to MySQL server during query"));
            }
            self.inner.emit_rows(rows).await
        }

        async fn emit_ddl(&self, ddl: &crate::common::DdlEvent) -> Result<()> {
            self.inner.emit_ddl(ddl).await
        }

        async fn flush(&self, resolved_ts: Ts) -> Result<Ts> {
            self.inner.flush(resolved_ts).await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    /// Redo writer that fails the first `failures_left` row appends.
    struct FlakyRedoWriter {
        inner: BlackholeLogWriter,
        failures_left: AtomicU32,
    }

    impl FlakyRedoWriter {
        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                inner: BlackholeLogWriter::new(),
                failures_left: AtomicU32::new(times),
            })
        }
    }

    #[async_trait]
    impl RedoLogWriter for FlakyRedoWriter {
        async fn write_log(&self, table_id: TableId, records: Vec<RedoRecord>) -> Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CdcError::WriterIo(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "disk stall",
                )));
            }
            self.inner.write_log(table_id, records).await
        }

        async fn flush_log(&self, table_id: TableId, resolved_ts: Ts) -> Result<()> {
            self.inner.flush_log(table_id, resolved_ts).await
        }

        async fn send_ddl(&self, record: RedoRecord) -> Result<()> {
            self.inner.send_ddl(record).await
        }

        async fn emit_resolved_ts(&self, ts: Ts) -> Result<()> {
            self.inner.emit_resolved_ts(ts).await
        }

        async fn emit_checkpoint_ts(&self, ts: Ts) -> Result<()> {
            self.inner.emit_checkpoint_ts(ts).await
        }

        async fn current_resolved_ts(
            &self,
            table_ids: &[TableId],
        ) -> Result<HashMap<TableId, Ts>> {
            self.inner.current_resolved_ts(table_ids).await
        }

        async fn remove_table(&self, table_id: TableId) -> Result<()> {
            self.inner.remove_table(table_id).await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    fn row(commit_ts: Ts) -> RowChangedEvent {
        RowChangedEvent {
            table_id: 1,
            commit_ts,
            start_ts: commit_ts - 1,
            schema: "s".into(),
            table: "t".into(),
            pre_row: None,
            post_row: Some(json!({"id": commit_ts})),
            columns: vec![],
        }
    }

    fn node(sink: Arc<MemorySink>) -> SinkNode {
        SinkNode::new(1, sink, 0, u64::MAX, None)
    }

    #[tokio::test]
    async fn rows_above_barrier_are_rejected() {
        let sink = Arc::new(MemorySink::new());
        let mut node = node(Arc::clone(&sink));
        node.barrier(10).await.unwrap();

        assert!(node
            .try_handle_data_message(PipelineMessage::Row(row(5)))
            .await
            .unwrap()
            .is_accepted());
        match node
            .try_handle_data_message(PipelineMessage::Row(row(15)))
            .await
            .unwrap()
        {
            Handled::Rejected(PipelineMessage::Row(r)) => assert_eq!(r.commit_ts, 15),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolved_flushes_up_to_barrier() {
        let sink = Arc::new(MemorySink::new());
        let mut node = node(Arc::clone(&sink));
        node.barrier(10).await.unwrap();

        node.try_handle_data_message(PipelineMessage::Row(row(5)))
            .await
            .unwrap();
        node.try_handle_data_message(PipelineMessage::Resolved(20))
            .await
            .unwrap();
        // Flush is clamped to the barrier.
        assert_eq!(sink.flushed_ts(), 10);
        assert_eq!(sink.rows().len(), 1);

        // Raising the barrier releases the rest of the resolved range.
        node.barrier(30).await.unwrap();
        assert_eq!(sink.flushed_ts(), 20);
    }

    #[tokio::test]
    async fn regressed_barrier_is_ignored() {
        let sink = Arc::new(MemorySink::new());
        let mut node = node(Arc::clone(&sink));
        node.barrier(10).await.unwrap();
        node.barrier(5).await.unwrap();
        assert_eq!(node.barrier_ts(), 10);
    }

    #[tokio::test]
    async fn ddl_reaches_the_sink() {
        let sink = Arc::new(MemorySink::new());
        let mut node = node(Arc::clone(&sink));
        node.barrier(100).await.unwrap();
        let ddl = crate::common::DdlEvent {
            commit_ts: 50,
            schema: "s".into(),
            table: "t".into(),
            query: "alter table t add column c int".into(),
            ddl_type: crate::common::DdlType::Alter,
        };
        node.try_handle_data_message(PipelineMessage::Ddl(ddl.clone()))
            .await
            .unwrap();
        assert_eq!(sink.ddls(), vec![ddl]);
    }

    #[tokio::test]
    async fn failed_emit_holds_rows_for_retry() {
        let sink = FlakySink::failing(1);
        let mut node = SinkNode::new(1, Arc::clone(&sink) as Arc<dyn Sink>, 0, u64::MAX, None);
        node.emit_batch = 2;
        node.barrier(100).await.unwrap();

        assert!(node
            .try_handle_data_message(PipelineMessage::Row(row(5)))
            .await
            .unwrap()
            .is_accepted());
        // The second row fills the batch; the emit fails but both rows stay
        // held in the buffer.
        let err = node
            .try_handle_data_message(PipelineMessage::Row(row(6)))
            .await
            .unwrap_err();
        assert!(err.is_retriable());
        assert!(sink.rows().is_empty());

        // The next offer retries the held batch, which now drains, and the
        // new row is accepted behind it.
        assert!(node
            .try_handle_data_message(PipelineMessage::Row(row(7)))
            .await
            .unwrap()
            .is_accepted());
        assert_eq!(
            sink.rows().iter().map(|r| r.commit_ts).collect::<Vec<_>>(),
            vec![5, 6]
        );

        node.try_handle_data_message(PipelineMessage::Resolved(50))
            .await
            .unwrap();
        assert_eq!(
            sink.rows().iter().map(|r| r.commit_ts).collect::<Vec<_>>(),
            vec![5, 6, 7]
        );
    }

    #[tokio::test]
    async fn input_is_refused_while_the_held_batch_will_not_drain() {
        let sink = FlakySink::failing(2);
        let mut node = SinkNode::new(1, Arc::clone(&sink) as Arc<dyn Sink>, 0, u64::MAX, None);
        node.emit_batch = 1;
        node.barrier(100).await.unwrap();

        let err = node
            .try_handle_data_message(PipelineMessage::Row(row(5)))
            .await
            .unwrap_err();
        assert!(err.is_retriable());

        // The retry fails too: the new row comes back rejected and nothing
        // is dropped.
        match node
            .try_handle_data_message(PipelineMessage::Row(row(6)))
            .await
            .unwrap()
        {
            Handled::Rejected(PipelineMessage::Row(r)) => assert_eq!(r.commit_ts, 6),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(sink.rows().is_empty());

        // The third attempt drains the held batch and takes the new row.
        assert!(node
            .try_handle_data_message(PipelineMessage::Row(row(6)))
            .await
            .unwrap()
            .is_accepted());
        assert_eq!(
            sink.rows().iter().map(|r| r.commit_ts).collect::<Vec<_>>(),
            vec![5, 6]
        );
    }

    #[tokio::test]
    async fn redo_failure_holds_rows_too() {
        let writer = FlakyRedoWriter::failing(1);
        let redo = RedoLogManager::with_writer(Arc::clone(&writer) as Arc<dyn RedoLogWriter>);
        let sink = Arc::new(MemorySink::new());
        let mut node = SinkNode::new(
            1,
            Arc::clone(&sink) as Arc<dyn Sink>,
            0,
            u64::MAX,
            Some(redo),
        );
        node.emit_batch = 1;
        node.barrier(100).await.unwrap();

        let err = node
            .try_handle_data_message(PipelineMessage::Row(row(5)))
            .await
            .unwrap_err();
        assert!(err.is_retriable());
        // Neither the redo log nor the sink saw the row, but it is held.
        assert_eq!(writer.inner.rows_dropped(), 0);
        assert!(sink.rows().is_empty());

        // A resolved tick retries the batch through both paths.
        node.try_handle_data_message(PipelineMessage::Resolved(50))
            .await
            .unwrap();
        assert_eq!(writer.inner.rows_dropped(), 1);
        assert_eq!(
            sink.rows().iter().map(|r| r.commit_ts).collect::<Vec<_>>(),
            vec![5]
        );
    }

    #[tokio::test]
    async fn close_flushes_and_closes_the_sink() {
        let sink = Arc::new(MemorySink::new());
        let mut node = node(Arc::clone(&sink));
        node.barrier(10).await.unwrap();
        node.try_handle_data_message(PipelineMessage::Row(row(5)))
            .await
            .unwrap();
        node.close().await.unwrap();
        assert_eq!(sink.rows().len(), 1);
        assert!(sink.is_closed());
        assert!(node
            .try_handle_data_message(PipelineMessage::Resolved(1))
            .await
            .is_err());
    }
}
