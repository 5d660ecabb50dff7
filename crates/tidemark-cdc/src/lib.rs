//! # tidemark-cdc - Change Data Capture pipeline
//!
//! The replication core of Tidemark: per-table actor pipelines, a durable
//! redo log, and the sink parameter layer.
//!
//! ## Architecture
//!
//! ```text
//! upstream events ──► ┌────────────────────────────────────────────┐
//!                     │ table actor (one per table, single poller) │
//!                     │  puller ─► sorter ─► [cyclic] ─► sink node │
//!                     └──────────────┬─────────────────────────────┘
//!                                    │ rows + resolved ts
//!                                    ▼
//!                     ┌────────────────────────────────────────────┐
//!                     │ redo log manager                           │
//!                     │  per-table resolved ts ─► global minimum   │
//!                     │  writer: file │ s3 │ blackhole             │
//!                     └────────────────────────────────────────────┘
//! ```
//!
//! Downstream connections are configured through a sink URI
//! (`mysql://…?worker-count=16&…`) parsed by [`sink::SinkParams`] and
//! rendered into a driver DSN.

pub mod common;
pub mod pipeline;
pub mod redo;
pub mod sink;

pub use common::{CdcError, DdlEvent, Result, RowChangedEvent, RowKind, TableId, Ts};
pub use pipeline::{DataNode, NodeFactory, PipelineMessage, SinkDataNode, TableActor};
pub use redo::{ConsistentConfig, ConsistentLevel, ConsistentStorage, RedoLogManager};
pub use sink::{DsnConfig, SinkParams, TxnMode};
