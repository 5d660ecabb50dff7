//! Table actor
//!
//! Owns one table's pipeline. Each poll handles control messages first
//! (stop, barrier), then pumps data between adjacent stages until a stage
//! refuses or the per-poll budget runs out. The refusal is deliberate
//! backpressure: the actor stops pulling upstream instead of buffering.

use crate::common::{CdcError, Result, TableId, TableReplicaInfo, Ts};
use crate::pipeline::{
    ChangefeedContext, CyclicConfig, CyclicFilterNode, DataNode, Handled, PipelineMessage,
    PullerNode, SinkDataNode, SinkNode, SorterNode,
};
use crate::redo::RedoLogManager;
use crate::sink::Sink;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tidemark_core::actor::{Actor, ActorContext, Message};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Builds pipeline stages. Injectable so tests can substitute doubles for
/// everything but the contract.
pub trait NodeFactory: Send + Sync {
    fn new_puller_node(
        &self,
        table_id: TableId,
        replica_info: &TableReplicaInfo,
        table_name: &str,
    ) -> Box<dyn DataNode>;

    fn new_sorter_node(
        &self,
        table_name: &str,
        table_id: TableId,
        start_ts: Ts,
    ) -> Box<dyn DataNode>;

    fn new_cyclic_node(&self, mark_table_id: TableId, config: &CyclicConfig)
        -> Box<dyn DataNode>;

    fn new_sink_node(
        &self,
        table_id: TableId,
        sink: Arc<dyn Sink>,
        start_ts: Ts,
        target_ts: Ts,
        redo: Option<Arc<RedoLogManager>>,
    ) -> Box<dyn SinkDataNode>;
}

/// Factory wiring the production stages.
#[derive(Debug, Default)]
pub struct DefaultNodeFactory;

impl NodeFactory for DefaultNodeFactory {
    fn new_puller_node(
        &self,
        table_id: TableId,
        _replica_info: &TableReplicaInfo,
        table_name: &str,
    ) -> Box<dyn DataNode> {
        Box::new(PullerNode::new(table_id, table_name))
    }

    fn new_sorter_node(
        &self,
        table_name: &str,
        table_id: TableId,
        start_ts: Ts,
    ) -> Box<dyn DataNode> {
        Box::new(SorterNode::new(table_name, table_id, start_ts))
    }

    fn new_cyclic_node(
        &self,
        mark_table_id: TableId,
        config: &CyclicConfig,
    ) -> Box<dyn DataNode> {
        Box::new(CyclicFilterNode::new(mark_table_id, config))
    }

    fn new_sink_node(
        &self,
        table_id: TableId,
        sink: Arc<dyn Sink>,
        start_ts: Ts,
        target_ts: Ts,
        redo: Option<Arc<RedoLogManager>>,
    ) -> Box<dyn SinkDataNode> {
        Box::new(SinkNode::new(table_id, sink, start_ts, target_ts, redo))
    }
}

/// Tuning knobs for one table actor.
#[derive(Debug, Clone)]
pub struct TableActorConfig {
    /// Stage-to-stage transfers allowed per poll.
    pub max_transfers_per_poll: usize,
    /// Bound on messages parked from the mailbox awaiting the first stage.
    pub inbound_capacity: usize,
}

impl Default for TableActorConfig {
    fn default() -> Self {
        Self {
            max_transfers_per_poll: 128,
            inbound_capacity: 256,
        }
    }
}

/// One table's pipeline, hosted as an actor.
pub struct TableActor {
    table_id: TableId,
    table_name: String,
    start_ts: Ts,
    mark_table_id: TableId,
    changefeed_epoch: u64,
    barrier_ts: Ts,
    stopped: bool,
    stopped_flag: Arc<AtomicBool>,
    nodes: Vec<Box<dyn DataNode>>,
    sink: Box<dyn SinkDataNode>,
    /// Per-link holding slot for a message the next stage refused.
    held: Vec<Option<PipelineMessage>>,
    /// Mailbox data awaiting the first stage.
    inbound: VecDeque<PipelineMessage>,
    error_tx: mpsc::UnboundedSender<CdcError>,
    config: TableActorConfig,
}

impl TableActor {
    /// Build and start the pipeline: puller, sorter, cyclic filter when the
    /// replica carries a mark table and the changefeed enables cyclic
    /// replication, then the sink node.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        ctx: &ChangefeedContext,
        table_id: TableId,
        table_name: &str,
        replica_info: &TableReplicaInfo,
        sink: Arc<dyn Sink>,
        target_ts: Ts,
        changefeed_epoch: u64,
        redo: Option<Arc<RedoLogManager>>,
        factory: &dyn NodeFactory,
        error_tx: mpsc::UnboundedSender<CdcError>,
    ) -> Result<Self> {
        let mut nodes: Vec<Box<dyn DataNode>> = Vec::with_capacity(3);
        nodes.push(factory.new_puller_node(table_id, replica_info, table_name));
        nodes.push(factory.new_sorter_node(table_name, table_id, replica_info.start_ts));
        if replica_info.mark_table_id != 0 {
            if let Some(cyclic) = ctx.cyclic.as_ref().filter(|c| c.enable) {
                nodes.push(factory.new_cyclic_node(replica_info.mark_table_id, cyclic));
            }
        }
        let mut sink_node = factory.new_sink_node(
            table_id,
            sink,
            replica_info.start_ts,
            target_ts,
            redo,
        );

        for node in nodes.iter_mut() {
            node.start(ctx).await?;
        }
        sink_node.start(ctx).await?;

        let mut held = Vec::with_capacity(nodes.len());
        held.resize_with(nodes.len(), || None);

        info!(
            table_id,
            table = table_name,
            start_ts = replica_info.start_ts,
            mark_table_id = replica_info.mark_table_id,
            changefeed = %ctx.changefeed_id,
            "table actor created"
        );
        Ok(Self {
            table_id,
            table_name: table_name.to_string(),
            start_ts: replica_info.start_ts,
            mark_table_id: replica_info.mark_table_id,
            changefeed_epoch,
            barrier_ts: replica_info.start_ts,
            stopped: false,
            stopped_flag: Arc::new(AtomicBool::new(false)),
            nodes,
            sink: sink_node,
            held,
            inbound: VecDeque::new(),
            error_tx,
            config: TableActorConfig::default(),
        })
    }

    /// Shared flag observers use to see the one-way stopped transition.
    pub fn stopped_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped_flag)
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn start_ts(&self) -> Ts {
        self.start_ts
    }

    /// Mark table joined by the cyclic stage; 0 when cyclic replication is
    /// off for this table.
    pub fn mark_table_id(&self) -> TableId {
        self.mark_table_id
    }

    pub fn barrier_ts(&self) -> Ts {
        self.barrier_ts
    }

    pub fn changefeed_epoch(&self) -> u64 {
        self.changefeed_epoch
    }

    async fn handle_barrier(&mut self, ts: Ts) -> Result<()> {
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
        self.sink.barrier(ts).await
    }

    /// One-way stop: close stages in reverse pipeline order.
    async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.stopped_flag.store(true, Ordering::Release);
        if let Err(e) = self.sink.close().await {
            warn!(table_id = self.table_id, error = %e, "sink node close failed");
        }
        for node in self.nodes.iter_mut().rev() {
            if let Err(e) = node.close().await {
                warn!(table_id = self.table_id, error = %e, "pipeline node close failed");
            }
        }
        debug!(table_id = self.table_id, table = %self.table_name, "table actor stopped");
    }

    async fn fail(&mut self, err: CdcError) {
        warn!(table_id = self.table_id, error = %err, "table actor failed");
        let _ = self.error_tx.send(err);
        self.stop().await;
    }

    /// Transfer messages between adjacent stages until nothing moves, a
    /// stage refuses, or the budget is exhausted.
    async fn pump(&mut self) -> Result<()> {
        let mut transferred = 0usize;
        loop {
            let mut progressed = false;

            // Mailbox data enters the first stage.
            if let Some(msg) = self.inbound.pop_front() {
                match self.nodes[0].try_handle_data_message(msg).await? {
                    Handled::Accepted => {
                        progressed = true;
                        transferred += 1;
                    }
                    Handled::Rejected(msg) => self.inbound.push_front(msg),
                }
            }

            // Stage i feeds stage i+1; the last stage feeds the sink node.
            for i in 0..self.nodes.len() {
                let msg = match self.held[i].take() {
                    Some(msg) => Some(msg),
                    None => self.nodes[i].try_get_processed_message(),
                };
                let Some(msg) = msg else { continue };
                let outcome = if i + 1 < self.nodes.len() {
                    self.nodes[i + 1].try_handle_data_message(msg).await?
                } else {
                    self.sink.try_handle_data_message(msg).await?
                };
                match outcome {
                    Handled::Accepted => {
                        progressed = true;
                        transferred += 1;
                    }
                    Handled::Rejected(msg) => {
                        self.held[i] = Some(msg);
                    }
                }
            }

            if !progressed || transferred >= self.config.max_transfers_per_poll {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl Actor for TableActor {
    type Payload = PipelineMessage;

    async fn poll(
        &mut self,
        _ctx: &ActorContext,
        msgs: Vec<Message<PipelineMessage>>,
    ) -> bool {
        for msg in msgs {
            if self.stopped {
                return false;
            }
            match msg {
                Message::Stop => {
                    self.stop().await;
                    return false;
                }
                Message::Barrier(ts) => {
                    if let Err(e) = self.handle_barrier(ts).await {
                        self.fail(e).await;
                        return false;
                    }
                }
                Message::Tick => {}
                Message::Value(data) => {
                    if self.inbound.len() < self.config.inbound_capacity {
                        self.inbound.push_back(data);
                    } else {
                        // The mailbox bound is the real backpressure edge;
                        // an overflowing park queue means the sender ignored
                        // MailboxFull. Drop with a warning.
                        warn!(
                            table_id = self.table_id,
                            "inbound overflow, dropping pipeline message"
                        );
                    }
                }
            }
        }
        if self.stopped {
            return false;
        }
        match self.pump().await {
            Ok(()) => true,
            Err(e) if e.is_retriable() => {
                // The refusing stage holds the message; nothing is lost.
                warn!(table_id = self.table_id, error = %e, "retryable pipeline error");
                true
            }
            Err(e) => {
                self.fail(e).await;
                false
            }
        }
    }

    async fn on_close(&mut self) {
        self.stop().await;
    }
}
