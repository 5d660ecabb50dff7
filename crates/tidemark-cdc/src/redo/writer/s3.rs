//! S3-backed redo writer
//!
//! Wraps the local [`FileLogWriter`] and uploads every closed segment to an
//! S3-compatible object store, mirroring the local layout under the URI
//! prefix. Upload failures retry with exponential backoff; a table's
//! resolved ts is only reported once every closed segment below the open
//! one has been uploaded, so a reported watermark is always backed by
//! durable remote data.

use crate::common::{CdcError, Result, TableId, Ts};
use crate::redo::record::RedoRecord;
use crate::redo::writer::file::{ClosedSegment, FileLogWriter, LogWriterConfig};
use crate::redo::writer::RedoLogWriter;
use async_trait::async_trait;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

/// Retry pacing for one segment upload: the delay doubles per failed
/// attempt up to a cap, with jitter so the changefeeds of a capture do not
/// hammer the object store in lockstep after an outage. After the attempt
/// limit the segment is abandoned and the writer is marked failed.
struct UploadBackoff {
    failed_attempts: u32,
}

impl UploadBackoff {
    const BASE: Duration = Duration::from_millis(100);
    const CAP: Duration = Duration::from_secs(10);
    const MAX_ATTEMPTS: u32 = 8;

    fn new() -> Self {
        Self { failed_attempts: 0 }
    }

    /// Delay before the next retry, or `None` once the upload should be
    /// given up on.
    fn next_delay(&mut self) -> Option<Duration> {
        self.failed_attempts += 1;
        if self.failed_attempts >= Self::MAX_ATTEMPTS {
            return None;
        }
        let doubled = Self::BASE.saturating_mul(1u32 << (self.failed_attempts - 1).min(16));
        let capped = doubled.min(Self::CAP);
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..=capped / 4);
        Some(capped + jitter)
    }

    fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }
}

struct PendingResolved {
    /// All closed segments up to this index must be uploaded first.
    required_index: u64,
    table_id: TableId,
    ts: Ts,
}

/// State shared between the writer facade and the upload task.
struct UploadState {
    uploaded_index: AtomicU64,
    pending: parking_lot::Mutex<Vec<PendingResolved>>,
    published: parking_lot::RwLock<HashMap<TableId, Ts>>,
    failure: parking_lot::Mutex<Option<String>>,
}

impl UploadState {
    /// Move pending watermarks whose segments are now durable into the
    /// published map, preserving emission order.
    fn publish_ready(&self) {
        let uploaded = self.uploaded_index.load(Ordering::Acquire);
        let mut pending = self.pending.lock();
        let mut published = self.published.write();
        pending.retain(|entry| {
            if entry.required_index <= uploaded {
                published.insert(entry.table_id, entry.ts);
                false
            } else {
                true
            }
        });
    }
}

/// Redo writer that makes segments durable in object storage.
pub struct S3LogWriter {
    inner: Arc<FileLogWriter>,
    state: Arc<UploadState>,
    cancel: CancellationToken,
}

impl S3LogWriter {
    /// Build the object store from an `s3://bucket/prefix?region=…` URI and
    /// open the writer.
    pub async fn new(config: LogWriterConfig, s3_uri: &Url) -> Result<Arc<Self>> {
        let (store, prefix) = build_store(s3_uri)?;
        Self::with_store(config, store, prefix).await
    }

    /// Open over an explicit store; tests use an in-memory store here.
    pub async fn with_store(
        config: LogWriterConfig,
        store: Arc<dyn ObjectStore>,
        prefix: ObjectPath,
    ) -> Result<Arc<Self>> {
        let (rotation_tx, rotation_rx) = mpsc::unbounded_channel();
        let remote_dir = prefix
            .child(config.capture_id.as_str())
            .child(config.changefeed_id.as_str())
            .child(
                config
                    .create_time
                    .format("%Y%m%dT%H%M%S%.3f")
                    .to_string()
                    .as_str(),
            );
        let inner = FileLogWriter::with_rotation_listener(config, Some(rotation_tx)).await?;

        let state = Arc::new(UploadState {
            uploaded_index: AtomicU64::new(0),
            pending: parking_lot::Mutex::new(Vec::new()),
            published: parking_lot::RwLock::new(HashMap::new()),
            failure: parking_lot::Mutex::new(None),
        });
        let cancel = CancellationToken::new();

        tokio::spawn(upload_task(
            store,
            remote_dir,
            rotation_rx,
            Arc::clone(&state),
            cancel.clone(),
        ));

        Ok(Arc::new(Self {
            inner,
            state,
            cancel,
        }))
    }

    fn check_failure(&self) -> Result<()> {
        if let Some(msg) = self.state.failure.lock().clone() {
            return Err(CdcError::other(format!("redo segment upload failed: {msg}")));
        }
        Ok(())
    }
}

async fn upload_task(
    store: Arc<dyn ObjectStore>,
    remote_dir: ObjectPath,
    mut rotation_rx: mpsc::UnboundedReceiver<ClosedSegment>,
    state: Arc<UploadState>,
    cancel: CancellationToken,
) {
    loop {
        let closed = tokio::select! {
            _ = cancel.cancelled() => return,
            segment = rotation_rx.recv() => match segment {
                Some(segment) => segment,
                None => return,
            },
        };
        let name = closed
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{:020}.log", closed.index));
        let target = remote_dir.child(name.as_str());

        let mut backoff = UploadBackoff::new();
        loop {
            let upload = async {
                let data = tokio::fs::read(&closed.path).await?;
                store
                    .put(&target, PutPayload::from(data))
                    .await
                    .map_err(CdcError::from)?;
                Ok::<(), CdcError>(())
            };
            match upload.await {
                Ok(()) => {
                    debug!(index = closed.index, target = %target, "redo segment uploaded");
                    state.uploaded_index.store(closed.index, Ordering::Release);
                    state.publish_ready();
                    break;
                }
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            index = closed.index,
                            error = %e,
                            attempt = backoff.failed_attempts(),
                            retry_in_ms = delay.as_millis() as u64,
                            "redo segment upload failed, retrying"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        error!(
                            index = closed.index,
                            attempts = backoff.failed_attempts(),
                            error = %e,
                            "redo segment upload gave up"
                        );
                        *state.failure.lock() = Some(e.to_string());
                        return;
                    }
                },
            }
        }
    }
}

fn build_store(uri: &Url) -> Result<(Arc<dyn ObjectStore>, ObjectPath)> {
    use object_store::aws::AmazonS3Builder;

    if uri.scheme() != "s3" {
        return Err(CdcError::InvalidS3Uri(format!(
            "expected s3 scheme, got {}",
            uri.scheme()
        )));
    }
    let bucket = uri
        .host_str()
        .ok_or_else(|| CdcError::InvalidS3Uri("missing bucket".into()))?;
    let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
    for (key, value) in uri.query_pairs() {
        match key.as_ref() {
            "region" => builder = builder.with_region(value.as_ref()),
            "endpoint" => builder = builder.with_endpoint(value.as_ref()),
            "access-key-id" => builder = builder.with_access_key_id(value.as_ref()),
            "secret-access-key" => builder = builder.with_secret_access_key(value.as_ref()),
            other => warn!(param = other, "ignoring unsupported s3 uri parameter"),
        }
    }
    let store = builder
        .build()
        .map_err(|e| CdcError::InvalidS3Uri(e.to_string()))?;
    let prefix = ObjectPath::from(uri.path().trim_matches('/'));
    Ok((Arc::new(store), prefix))
}

#[async_trait]
impl RedoLogWriter for S3LogWriter {
    async fn write_log(&self, table_id: TableId, records: Vec<RedoRecord>) -> Result<()> {
        self.check_failure()?;
        self.inner.write_log(table_id, records).await
    }

    async fn flush_log(&self, table_id: TableId, resolved_ts: Ts) -> Result<()> {
        self.check_failure()?;
        self.inner.flush_log(table_id, resolved_ts).await?;
        let open_index = self.inner.current_segment_index().await;
        let required_index = open_index.saturating_sub(1);
        if self.state.uploaded_index.load(Ordering::Acquire) >= required_index {
            self.state.published.write().insert(table_id, resolved_ts);
        } else {
            self.state.pending.lock().push(PendingResolved {
                required_index,
                table_id,
                ts: resolved_ts,
            });
        }
        Ok(())
    }

    async fn send_ddl(&self, record: RedoRecord) -> Result<()> {
        self.check_failure()?;
        self.inner.send_ddl(record).await
    }

    async fn emit_resolved_ts(&self, ts: Ts) -> Result<()> {
        self.check_failure()?;
        self.inner.emit_resolved_ts(ts).await
    }

    async fn emit_checkpoint_ts(&self, ts: Ts) -> Result<()> {
        self.check_failure()?;
        self.inner.emit_checkpoint_ts(ts).await
    }

    async fn current_resolved_ts(
        &self,
        table_ids: &[TableId],
    ) -> Result<HashMap<TableId, Ts>> {
        self.check_failure()?;
        let published = self.state.published.read();
        Ok(table_ids
            .iter()
            .filter_map(|id| published.get(id).map(|ts| (*id, *ts)))
            .collect())
    }

    async fn remove_table(&self, table_id: TableId) -> Result<()> {
        self.inner.remove_table(table_id).await?;
        self.state.published.write().remove(&table_id);
        self.state
            .pending
            .lock()
            .retain(|entry| entry.table_id != table_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.inner.close().await
    }
}
