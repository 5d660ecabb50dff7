//! Local-disk redo writer with rotating segments
//!
//! Layout: `{dir}/{capture_id}/{changefeed_id}/{create_time}/` holding
//! segment files named by a zero-padded monotonic index. Appends go to the
//! open segment; the segment rotates once it exceeds `max_log_size`. A
//! background task syncs the open segment every `flush_interval`;
//! `flush_log` syncs eagerly before advancing a table's resolved ts.

use crate::common::{CdcError, Result, TableId, Ts};
use crate::redo::record::RedoRecord;
use crate::redo::writer::RedoLogWriter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for the file-backed writer.
#[derive(Debug, Clone)]
pub struct LogWriterConfig {
    /// Base redo directory (`{data_dir}/redo`).
    pub dir: PathBuf,
    pub capture_id: String,
    pub changefeed_id: String,
    /// Creation time; becomes the last path component so restarts never
    /// append to an older incarnation's segments.
    pub create_time: DateTime<Utc>,
    /// Rotation threshold in bytes.
    pub max_log_size: u64,
    /// Cadence of the background sync.
    pub flush_interval: Duration,
}

impl LogWriterConfig {
    /// Directory all segments of this incarnation live in.
    pub fn segment_dir(&self) -> PathBuf {
        self.dir
            .join(&self.capture_id)
            .join(&self.changefeed_id)
            .join(self.create_time.format("%Y%m%dT%H%M%S%.3f").to_string())
    }
}

/// A rotated-out segment, announced to the optional rotation listener
/// (the S3 writer uploads these).
#[derive(Debug, Clone)]
pub struct ClosedSegment {
    pub index: u64,
    pub path: PathBuf,
}

struct OpenSegment {
    file: File,
    path: PathBuf,
    index: u64,
    written: u64,
}

/// Rotating segment writer on local disk.
pub struct FileLogWriter {
    config: LogWriterConfig,
    segment: Mutex<OpenSegment>,
    rts: parking_lot::RwLock<HashMap<TableId, Ts>>,
    rotation_tx: Option<mpsc::UnboundedSender<ClosedSegment>>,
    cancel: CancellationToken,
}

impl FileLogWriter {
    /// Open the writer, creating the segment directory and the first
    /// segment.
    pub async fn new(config: LogWriterConfig) -> Result<Arc<Self>> {
        Self::with_rotation_listener(config, None).await
    }

    /// Like [`FileLogWriter::new`], announcing every closed segment on the
    /// given channel.
    pub async fn with_rotation_listener(
        config: LogWriterConfig,
        rotation_tx: Option<mpsc::UnboundedSender<ClosedSegment>>,
    ) -> Result<Arc<Self>> {
        if config.max_log_size == 0 {
            return Err(CdcError::invalid_config("max_log_size must be positive"));
        }
        let dir = config.segment_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let segment = Self::open_segment(&dir, 1).await?;
        debug!(dir = %dir.display(), "redo file writer opened");

        let writer = Arc::new(Self {
            config,
            segment: Mutex::new(segment),
            rts: parking_lot::RwLock::new(HashMap::new()),
            rotation_tx,
            cancel: CancellationToken::new(),
        });
        writer.clone().spawn_flush_task();
        Ok(writer)
    }

    async fn open_segment(dir: &std::path::Path, index: u64) -> Result<OpenSegment> {
        let path = dir.join(format!("{index:020}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(OpenSegment {
            file,
            path,
            index,
            written: 0,
        })
    }

    fn spawn_flush_task(self: Arc<Self>) {
        let cancel = self.cancel.clone();
        let interval = self.config.flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let mut segment = self.segment.lock().await;
                        if let Err(e) = segment.file.sync_data().await {
                            warn!(error = %e, "periodic redo flush failed");
                        }
                    }
                }
            }
        });
    }

    /// Append frames, rotating when the open segment is over the size
    /// threshold.
    async fn append_records(&self, records: &[RedoRecord]) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CdcError::Cancelled);
        }
        let mut segment = self.segment.lock().await;
        for record in records {
            let frame = record.encode()?;
            if segment.written > 0
                && segment.written + frame.len() as u64 > self.config.max_log_size
            {
                self.rotate(&mut segment).await?;
            }
            segment.file.write_all(&frame).await?;
            segment.written += frame.len() as u64;
        }
        Ok(())
    }

    async fn rotate(&self, segment: &mut OpenSegment) -> Result<()> {
        segment.file.sync_all().await?;
        let closed = ClosedSegment {
            index: segment.index,
            path: segment.path.clone(),
        };
        debug!(index = closed.index, path = %closed.path.display(), "redo segment rotated");
        if let Some(tx) = &self.rotation_tx {
            let _ = tx.send(closed);
        }
        let dir = self.config.segment_dir();
        *segment = Self::open_segment(&dir, segment.index + 1).await?;
        Ok(())
    }

    /// Index of the currently open segment.
    pub async fn current_segment_index(&self) -> u64 {
        self.segment.lock().await.index
    }

    /// Paths of all segments of this incarnation, ascending by index.
    pub async fn segment_paths(&self) -> Result<Vec<PathBuf>> {
        let dir = self.config.segment_dir();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "log") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

#[async_trait]
impl RedoLogWriter for FileLogWriter {
    async fn write_log(&self, _table_id: TableId, records: Vec<RedoRecord>) -> Result<()> {
        self.append_records(&records).await
    }

    async fn flush_log(&self, table_id: TableId, resolved_ts: Ts) -> Result<()> {
        {
            let mut segment = self.segment.lock().await;
            segment.file.sync_data().await?;
        }
        self.rts.write().insert(table_id, resolved_ts);
        Ok(())
    }

    async fn send_ddl(&self, record: RedoRecord) -> Result<()> {
        self.append_records(std::slice::from_ref(&record)).await
    }

    async fn emit_resolved_ts(&self, ts: Ts) -> Result<()> {
        self.append_records(&[RedoRecord::Resolved { table_id: 0, ts }])
            .await?;
        self.segment.lock().await.file.sync_data().await?;
        Ok(())
    }

    async fn emit_checkpoint_ts(&self, ts: Ts) -> Result<()> {
        self.append_records(&[RedoRecord::Checkpoint { ts }]).await?;
        self.segment.lock().await.file.sync_data().await?;
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
        if self.rts.write().remove(&table_id).is_none() {
            warn!(table_id, "removing a table the redo writer never tracked");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let mut segment = self.segment.lock().await;
        segment.file.sync_all().await?;
        Ok(())
    }
}
