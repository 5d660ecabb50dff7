//! Downstream sinks
//!
//! The pipeline drives a [`Sink`]; concrete drivers (MySQL, blob storage)
//! live behind this trait and honor the parameter contract in
//! [`params`]. A [`BlackholeSink`] and an in-memory [`MemorySink`] ship
//! here for tests and throughput benchmarking.

pub mod params;
pub mod probe;

pub use params::{DsnConfig, SinkParams, TlsTriple, TxnMode};
#[cfg(feature = "mysql")]
pub use probe::MySqlProbe;
pub use probe::{check_variable, SessionVariableProbe};

use crate::common::{DdlEvent, Result, RowChangedEvent, Ts};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// A downstream sink.
///
/// Calls must not block on I/O; drivers enqueue work internally and make
/// it durable by `flush`, which returns the checkpoint ts the sink has
/// durably applied.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn emit_rows(&self, rows: Vec<RowChangedEvent>) -> Result<()>;

    async fn emit_ddl(&self, ddl: &DdlEvent) -> Result<()>;

    /// Make everything up to `resolved_ts` durable; returns the new
    /// checkpoint ts.
    async fn flush(&self, resolved_ts: Ts) -> Result<Ts>;

    async fn close(&self) -> Result<()>;
}

/// Sink that drops everything; for benchmarking the upstream path.
#[derive(Debug, Default)]
pub struct BlackholeSink {
    rows: AtomicU64,
    ddls: AtomicU64,
}

impl BlackholeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows_accepted(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Sink for BlackholeSink {
    async fn emit_rows(&self, rows: Vec<RowChangedEvent>) -> Result<()> {
        trace!(count = rows.len(), "blackhole sink dropped rows");
        self.rows.fetch_add(rows.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn emit_ddl(&self, _ddl: &DdlEvent) -> Result<()> {
        self.ddls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self, resolved_ts: Ts) -> Result<Ts> {
        Ok(resolved_ts)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Recording sink for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: Mutex<Vec<RowChangedEvent>>,
    ddls: Mutex<Vec<DdlEvent>>,
    flushed_ts: AtomicU64,
    closed: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<RowChangedEvent> {
        self.rows.lock().clone()
    }

    pub fn ddls(&self) -> Vec<DdlEvent> {
        self.ddls.lock().clone()
    }

    pub fn flushed_ts(&self) -> Ts {
        self.flushed_ts.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) > 0
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn emit_rows(&self, rows: Vec<RowChangedEvent>) -> Result<()> {
        self.rows.lock().extend(rows);
        Ok(())
    }

    async fn emit_ddl(&self, ddl: &DdlEvent) -> Result<()> {
        self.ddls.lock().push(ddl.clone());
        Ok(())
    }

    async fn flush(&self, resolved_ts: Ts) -> Result<Ts> {
        self.flushed_ts.store(resolved_ts, Ordering::Release);
        Ok(resolved_ts)
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
