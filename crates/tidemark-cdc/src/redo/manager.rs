//! Redo log manager
//!
//! One manager per changefeed. It turns row/DDL events into redo records,
//! hands them to the configured writer, tracks each table's resolved
//! timestamp and publishes the global minimum through an atomic word so
//! the hot read path never takes a lock.

use crate::common::{CdcError, DdlEvent, Result, RowChangedEvent, TableId, Ts};
use crate::redo::record::RedoRecord;
use crate::redo::writer::{
    BlackholeLogWriter, FileLogWriter, LogWriterConfig, RedoLogWriter, S3LogWriter,
};
use crate::redo::{ConsistentConfig, ConsistentLevel, ConsistentStorage, DEFAULT_REDO_DIR};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cadence of the background resolved-ts refresh.
const UPDATE_RTS_INTERVAL: Duration = Duration::from_secs(1);

/// Identity of the hosting capture and changefeed, used for the redo
/// directory layout.
#[derive(Debug, Clone)]
pub struct RedoRuntimeContext {
    pub data_dir: PathBuf,
    pub capture_id: String,
    pub changefeed_id: String,
}

/// Options for manager construction.
#[derive(Debug, Default)]
pub struct ManagerOptions {
    /// Run the background task that refreshes per-table resolved ts.
    pub enable_bg_runner: bool,
    /// Channel fatal writer errors surface on.
    pub error_tx: Option<mpsc::UnboundedSender<CdcError>>,
}

struct TableRtsState {
    /// Sorted ascending; exactly the keys of `rts_map`.
    table_ids: Vec<TableId>,
    rts_map: HashMap<TableId, Ts>,
}

/// Manages the redo log of one changefeed.
pub struct RedoLogManager {
    enabled: bool,
    level: ConsistentLevel,
    storage: ConsistentStorage,
    writer: Option<Arc<dyn RedoLogWriter>>,
    min_resolved_ts: AtomicU64,
    state: RwLock<TableRtsState>,
    cancel: CancellationToken,
}

impl RedoLogManager {
    /// Build a manager from the changefeed's consistent config.
    ///
    /// A missing config or `normal` level yields a disabled manager whose
    /// operations are all no-ops.
    pub async fn new(
        config: Option<&ConsistentConfig>,
        runtime: RedoRuntimeContext,
        opts: ManagerOptions,
    ) -> Result<Arc<Self>> {
        let config = match config {
            Some(config) if config.level != ConsistentLevel::Normal => config,
            _ => return Ok(Arc::new(Self::disabled())),
        };
        config.validate()?;

        let writer: Arc<dyn RedoLogWriter> = match config.storage {
            ConsistentStorage::Blackhole => Arc::new(BlackholeLogWriter::new()),
            ConsistentStorage::Local | ConsistentStorage::S3 => {
                let writer_config = LogWriterConfig {
                    dir: runtime.data_dir.join(DEFAULT_REDO_DIR),
                    capture_id: runtime.capture_id.clone(),
                    changefeed_id: runtime.changefeed_id.clone(),
                    create_time: Utc::now(),
                    max_log_size: config.max_log_size,
                    flush_interval: Duration::from_millis(config.flush_interval_in_ms),
                };
                if config.storage == ConsistentStorage::S3 {
                    let s3_uri = config.parsed_s3_uri()?;
                    S3LogWriter::new(writer_config, &s3_uri).await? as Arc<dyn RedoLogWriter>
                } else {
                    FileLogWriter::new(writer_config).await? as Arc<dyn RedoLogWriter>
                }
            }
        };

        let manager = Arc::new(Self {
            enabled: true,
            level: config.level,
            storage: config.storage,
            writer: Some(writer),
            min_resolved_ts: AtomicU64::new(0),
            state: RwLock::new(TableRtsState {
                table_ids: Vec::new(),
                rts_map: HashMap::new(),
            }),
            cancel: CancellationToken::new(),
        });

        if opts.enable_bg_runner {
            tokio::spawn(Arc::clone(&manager).run(opts.error_tx));
        }
        debug!(
            level = %config.level,
            storage = %config.storage,
            changefeed = %runtime.changefeed_id,
            "redo log manager started"
        );
        Ok(manager)
    }

    /// A permanently disabled manager.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            level: ConsistentLevel::Normal,
            storage: ConsistentStorage::Blackhole,
            writer: None,
            min_resolved_ts: AtomicU64::new(0),
            state: RwLock::new(TableRtsState {
                table_ids: Vec::new(),
                rts_map: HashMap::new(),
            }),
            cancel: CancellationToken::new(),
        }
    }

    /// Build a manager over an explicit writer, without a background task.
    /// Tests drive [`RedoLogManager::update_table_resolved_ts`] manually.
    pub fn with_writer(writer: Arc<dyn RedoLogWriter>) -> Arc<Self> {
        Arc::new(Self {
            enabled: true,
            level: ConsistentLevel::Eventual,
            storage: ConsistentStorage::Blackhole,
            writer: Some(writer),
            min_resolved_ts: AtomicU64::new(0),
            state: RwLock::new(TableRtsState {
                table_ids: Vec::new(),
                rts_map: HashMap::new(),
            }),
            cancel: CancellationToken::new(),
        })
    }

    /// Whether this manager persists anything.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn level(&self) -> ConsistentLevel {
        self.level
    }

    pub fn storage(&self) -> ConsistentStorage {
        self.storage
    }

    /// Wrap rows as redo records and hand them to the writer. Writer
    /// errors come back verbatim.
    pub async fn emit_row_changed_events(
        &self,
        table_id: TableId,
        rows: Vec<RowChangedEvent>,
    ) -> Result<()> {
        let writer = match &self.writer {
            Some(writer) => writer,
            None => return Ok(()),
        };
        let records = rows.into_iter().map(RedoRecord::Row).collect();
        writer.write_log(table_id, records).await
    }

    /// Ask the writer to make one table durable up to `resolved_ts`.
    pub async fn flush_log(&self, table_id: TableId, resolved_ts: Ts) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.flush_log(table_id, resolved_ts).await,
            None => Ok(()),
        }
    }

    /// Persist a DDL event.
    pub async fn emit_ddl_event(&self, ddl: DdlEvent) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.send_ddl(RedoRecord::Ddl(ddl)).await,
            None => Ok(()),
        }
    }

    /// Persist the changefeed-wide resolved and checkpoint watermarks.
    /// Failure of the resolved emission short-circuits.
    pub async fn flush_resolved_and_checkpoint_ts(
        &self,
        resolved_ts: Ts,
        checkpoint_ts: Ts,
    ) -> Result<()> {
        let writer = match &self.writer {
            Some(writer) => writer,
            None => return Ok(()),
        };
        writer.emit_resolved_ts(resolved_ts).await?;
        writer.emit_checkpoint_ts(checkpoint_ts).await
    }

    /// Start tracking a table at `start_ts`. A duplicate add is warned and
    /// ignored.
    pub fn add_table(&self, table_id: TableId, start_ts: Ts) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.write();
        match state.table_ids.binary_search(&table_id) {
            Ok(_) => {
                warn!(table_id, "adding a duplicated table to the redo log manager");
            }
            Err(pos) => {
                state.table_ids.insert(pos, table_id);
                state.rts_map.insert(table_id, start_ts);
            }
        }
    }

    /// Stop tracking a table; the writer is told to drop it too. A missing
    /// table is warned.
    pub fn remove_table(&self, table_id: TableId) {
        if !self.enabled {
            return;
        }
        {
            let mut state = self.state.write();
            match state.table_ids.binary_search(&table_id) {
                Ok(pos) => {
                    state.table_ids.remove(pos);
                    state.rts_map.remove(&table_id);
                }
                Err(_) => {
                    warn!(table_id, "removing a table the redo log manager never tracked");
                    return;
                }
            }
        }
        if let Some(writer) = self.writer.clone() {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = writer.remove_table(table_id) => {
                        if let Err(e) = result {
                            warn!(table_id, error = %e, "redo writer failed to drop table");
                        }
                    }
                }
            });
        }
    }

    /// Minimum resolved ts across all tracked tables. Wait-free;
    /// `u64::MAX` when no table is tracked.
    pub fn min_resolved_ts(&self) -> Ts {
        self.min_resolved_ts.load(Ordering::Acquire)
    }

    /// Tables currently tracked, ascending.
    pub fn table_ids(&self) -> Vec<TableId> {
        self.state.read().table_ids.clone()
    }

    /// Refresh per-table resolved ts from the writer and publish the new
    /// minimum. Newly added tables contribute their start ts until the
    /// writer reports for them, so the published minimum never ignores a
    /// table.
    pub async fn update_table_resolved_ts(&self) -> Result<()> {
        let writer = match &self.writer {
            Some(writer) => writer,
            None => return Ok(()),
        };
        let table_ids = { self.state.read().table_ids.clone() };
        let updates = writer.current_resolved_ts(&table_ids).await?;

        let mut state = self.state.write();
        for (table_id, ts) in updates {
            // A table removed while the writer was answering stays removed.
            if let Some(entry) = state.rts_map.get_mut(&table_id) {
                *entry = ts;
            }
        }
        let min = state
            .rts_map
            .values()
            .copied()
            .min()
            .unwrap_or(u64::MAX);
        self.min_resolved_ts.store(min, Ordering::Release);
        Ok(())
    }

    async fn run(self: Arc<Self>, error_tx: Option<mpsc::UnboundedSender<CdcError>>) {
        let mut ticker = tokio::time::interval(UPDATE_RTS_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.update_table_resolved_ts().await {
                        warn!(error = %e, "redo resolved-ts refresh failed, stopping");
                        if let Some(tx) = &error_tx {
                            let _ = tx.send(e);
                        }
                        return;
                    }
                }
            }
        }
    }

    /// Stop background work and close the writer.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        match &self.writer {
            Some(writer) => writer.close().await,
            None => Ok(()),
        }
    }
}
