//! Puller stage
//!
//! Entry point of a table pipeline. Upstream mutation events and resolved
//! ticks arrive either through the actor mailbox (offered to this node by
//! the actor) or through an optional channel handed over at construction;
//! both paths meet in one bounded buffer so downstream backpressure
//! reaches the upstream producer.

use crate::common::{Result, TableId};
use crate::pipeline::{ChangefeedContext, DataNode, Handled, PipelineMessage};
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::debug;

/// Default buffer capacity of a puller stage.
pub const DEFAULT_PULLER_BUFFER: usize = 128;

/// Adapts the upstream event stream into pipeline messages.
pub struct PullerNode {
    table_id: TableId,
    table_name: String,
    buffer: VecDeque<PipelineMessage>,
    capacity: usize,
    source: Option<mpsc::Receiver<PipelineMessage>>,
    started: bool,
}

impl PullerNode {
    pub fn new(table_id: TableId, table_name: impl Into<String>) -> Self {
        Self::with_source(table_id, table_name, None, DEFAULT_PULLER_BUFFER)
    }

    /// A puller that also drains a dedicated upstream channel.
    pub fn with_source(
        table_id: TableId,
        table_name: impl Into<String>,
        source: Option<mpsc::Receiver<PipelineMessage>>,
        capacity: usize,
    ) -> Self {
        Self {
            table_id,
            table_name: table_name.into(),
            buffer: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            source,
            started: false,
        }
    }

    fn fill_from_source(&mut self) {
        if let Some(source) = &mut self.source {
            while self.buffer.len() < self.capacity {
                match source.try_recv() {
                    Ok(msg) => self.buffer.push_back(msg),
                    Err(_) => break,
                }
            }
        }
    }
}

#[async_trait]
impl DataNode for PullerNode {
    async fn start(&mut self, _ctx: &ChangefeedContext) -> Result<()> {
        if !self.started {
            debug!(table_id = self.table_id, table = %self.table_name, "puller started");
            self.started = true;
        }
        Ok(())
    }

    async fn try_handle_data_message(&mut self, msg: PipelineMessage) -> Result<Handled> {
        if self.buffer.len() >= self.capacity {
            return Ok(Handled::Rejected(msg));
        }
        self.buffer.push_back(msg);
        Ok(Handled::Accepted)
    }

    fn try_get_processed_message(&mut self) -> Option<PipelineMessage> {
        self.fill_from_source();
        self.buffer.pop_front()
    }

    async fn close(&mut self) -> Result<()> {
        self.source = None;
        self.buffer.clear();
        Ok(())
    }
}
