//! Per-table dataflow pipeline
//!
//! Each replicated table runs one [`TableActor`] whose stages are
//! [`DataNode`]s composed as an ordered list:
//!
//! ```text
//! puller ─► sorter ─► [cyclic filter] ─► sink node
//! ```
//!
//! The actor pulls a processed message from stage `i` and offers it to
//! stage `i+1`; a stage signals backpressure by rejecting the offer, which
//! is how the actor learns to stop pulling upstream. Nothing is buffered
//! silently on refusal.

mod cyclic;
mod puller;
mod sink_node;
mod sorter;
mod table_actor;

pub use cyclic::CyclicFilterNode;
pub use puller::PullerNode;
pub use sink_node::SinkNode;
pub use sorter::SorterNode;
pub use table_actor::{DefaultNodeFactory, NodeFactory, TableActor, TableActorConfig};

use crate::common::{DdlEvent, Result, RowChangedEvent, Ts};
use async_trait::async_trait;

/// A message traversing a table pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineMessage {
    Row(RowChangedEvent),
    /// No further row with `commit_ts <= ts` will arrive for this table.
    Resolved(Ts),
    /// Do not emit rows with `commit_ts > ts` past the sink until raised.
    Barrier(Ts),
    Ddl(DdlEvent),
}

impl PipelineMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineMessage::Row(_) => "row",
            PipelineMessage::Resolved(_) => "resolved",
            PipelineMessage::Barrier(_) => "barrier",
            PipelineMessage::Ddl(_) => "ddl",
        }
    }
}

/// Outcome of offering a message to a node.
///
/// `Rejected` returns the message to the caller untouched; it is the
/// pipeline's backpressure primitive, not an error.
#[derive(Debug)]
pub enum Handled {
    Accepted,
    Rejected(PipelineMessage),
}

impl Handled {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Handled::Accepted)
    }
}

/// Cyclic-replication settings of a changefeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclicConfig {
    pub enable: bool,
    /// Id of the local cluster; rows tagged with it are dropped.
    pub replica_id: u64,
    /// Additional origin clusters to filter.
    pub filter_replica_ids: Vec<u64>,
}

/// Changefeed-scoped context handed to pipeline stages at start.
#[derive(Debug, Clone)]
pub struct ChangefeedContext {
    pub changefeed_id: String,
    pub capture_id: String,
    /// Epoch fencing token of the changefeed incarnation.
    pub epoch: u64,
    pub cyclic: Option<CyclicConfig>,
}

/// One stage of a table pipeline.
///
/// All methods must be non-blocking: `start` performs no I/O and is
/// idempotent; `try_handle_data_message` either takes the message or hands
/// it back as [`Handled::Rejected`]. On `Err` the message counts as
/// consumed - a stage that cannot make progress must hold it internally
/// and keep rejecting further input rather than drop it.
#[async_trait]
pub trait DataNode: Send {
    async fn start(&mut self, ctx: &ChangefeedContext) -> Result<()>;

    async fn try_handle_data_message(&mut self, msg: PipelineMessage) -> Result<Handled>;

    /// Non-blocking drain of the stage's output.
    fn try_get_processed_message(&mut self) -> Option<PipelineMessage>;

    /// Release stage resources. Called in reverse pipeline order on stop.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The terminal stage: additionally understands barriers.
#[async_trait]
pub trait SinkDataNode: DataNode {
    /// Raise the emission barrier. A regressing barrier is ignored with a
    /// warning.
    async fn barrier(&mut self, ts: Ts) -> Result<()>;
}
