//! Cyclic replication filter
//!
//! In a bidirectional topology every cluster writes a mark-table row per
//! transaction carrying the origin cluster id. This stage indexes those
//! marks by transaction start ts and drops data rows whose origin is the
//! local cluster (or any explicitly filtered replica), which is what stops
//! a change from circulating forever. The index is bounded and evicts the
//! least recently used transaction.

use crate::common::{Result, TableId, Ts};
use crate::pipeline::{ChangefeedContext, CyclicConfig, DataNode, Handled, PipelineMessage};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

/// Mark-table column carrying the origin cluster id.
pub const MARK_COLUMN_REPLICA_ID: &str = "replica-id";

/// Default capacity of the txn-origin index.
pub const DEFAULT_TXN_INDEX_CAPACITY: usize = 10_000;

/// Bounded map from transaction start ts to origin cluster id with LRU
/// eviction. Recency bookkeeping is lazy: each touch appends a generation
/// entry and eviction skips entries whose generation is stale.
struct TxnOriginIndex {
    capacity: usize,
    map: HashMap<Ts, (u64, u64)>,
    order: VecDeque<(Ts, u64)>,
    next_generation: u64,
}

impl TxnOriginIndex {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
            next_generation: 0,
        }
    }

    fn insert(&mut self, start_ts: Ts, replica_id: u64) {
        let generation = self.bump();
        if self.map.insert(start_ts, (replica_id, generation)).is_none()
            && self.map.len() > self.capacity
        {
            self.evict_one();
        }
        self.order.push_back((start_ts, generation));
    }

    fn get(&mut self, start_ts: Ts) -> Option<u64> {
        let generation = self.bump();
        let entry = self.map.get_mut(&start_ts)?;
        entry.1 = generation;
        let replica_id = entry.0;
        self.order.push_back((start_ts, generation));
        Some(replica_id)
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn evict_one(&mut self) {
        while let Some((key, generation)) = self.order.pop_front() {
            match self.map.get(&key) {
                Some((_, current)) if *current == generation => {
                    self.map.remove(&key);
                    return;
                }
                // Stale recency entry; the key was touched more recently
                // or already evicted.
                _ => continue,
            }
        }
    }
}

/// Drops rows that originated from filtered clusters.
pub struct CyclicFilterNode {
    mark_table_id: TableId,
    local_replica_id: u64,
    filter_replica_ids: Vec<u64>,
    index: TxnOriginIndex,
    out: VecDeque<PipelineMessage>,
    out_capacity: usize,
    dropped: u64,
}

impl CyclicFilterNode {
    pub fn new(mark_table_id: TableId, config: &CyclicConfig) -> Self {
        Self::with_index_capacity(mark_table_id, config, DEFAULT_TXN_INDEX_CAPACITY)
    }

    pub fn with_index_capacity(
        mark_table_id: TableId,
        config: &CyclicConfig,
        index_capacity: usize,
    ) -> Self {
        Self {
            mark_table_id,
            local_replica_id: config.replica_id,
            filter_replica_ids: config.filter_replica_ids.clone(),
            index: TxnOriginIndex::new(index_capacity),
            out: VecDeque::new(),
            out_capacity: 1024,
            dropped: 0,
        }
    }

    /// Rows dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn origin_of(row: &crate::common::RowChangedEvent) -> Option<u64> {
        let image = row.post_row.as_ref()?;
        image.get(MARK_COLUMN_REPLICA_ID)?.as_u64()
    }

    fn is_filtered(&self, origin: u64) -> bool {
        origin == self.local_replica_id || self.filter_replica_ids.contains(&origin)
    }
}

#[async_trait]
impl DataNode for CyclicFilterNode {
    async fn start(&mut self, ctx: &ChangefeedContext) -> Result<()> {
        debug!(
            mark_table_id = self.mark_table_id,
            replica_id = self.local_replica_id,
            changefeed = %ctx.changefeed_id,
            "cyclic filter started"
        );
        Ok(())
    }

    async fn try_handle_data_message(&mut self, msg: PipelineMessage) -> Result<Handled> {
        match msg {
            PipelineMessage::Row(row) if row.table_id == self.mark_table_id => {
                // Mark rows feed the index and are swallowed.
                match Self::origin_of(&row) {
                    Some(origin) => self.index.insert(row.start_ts, origin),
                    None => warn!(
                        start_ts = row.start_ts,
                        "mark-table row without an origin tag"
                    ),
                }
                Ok(Handled::Accepted)
            }
            PipelineMessage::Row(row) => {
                if self.out.len() >= self.out_capacity {
                    return Ok(Handled::Rejected(PipelineMessage::Row(row)));
                }
                match self.index.get(row.start_ts) {
                    Some(origin) if self.is_filtered(origin) => {
                        self.dropped += 1;
                        Ok(Handled::Accepted)
                    }
                    _ => {
                        self.out.push_back(PipelineMessage::Row(row));
                        Ok(Handled::Accepted)
                    }
                }
            }
            passthrough => {
                self.out.push_back(passthrough);
                Ok(Handled::Accepted)
            }
        }
    }

    fn try_get_processed_message(&mut self) -> Option<PipelineMessage> {
        self.out.pop_front()
    }

    async fn close(&mut self) -> Result<()> {
        self.out.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RowChangedEvent;
    use serde_json::json;

    const MARK_TABLE: TableId = 900;

    fn config() -> CyclicConfig {
        CyclicConfig {
            enable: true,
            replica_id: 1,
            filter_replica_ids: vec![3],
        }
    }

    fn mark_row(start_ts: Ts, origin: u64) -> PipelineMessage {
        PipelineMessage::Row(RowChangedEvent {
            table_id: MARK_TABLE,
            commit_ts: start_ts + 1,
            start_ts,
            schema: "tidemark".into(),
            table: "repl_mark".into(),
            pre_row: None,
            post_row: Some(json!({ MARK_COLUMN_REPLICA_ID: origin })),
            columns: vec![],
        })
    }

    fn data_row(start_ts: Ts) -> PipelineMessage {
        PipelineMessage::Row(RowChangedEvent {
            table_id: 5,
            commit_ts: start_ts + 1,
            start_ts,
            schema: "shop".into(),
            table: "orders".into(),
            pre_row: None,
            post_row: Some(json!({"id": start_ts})),
            columns: vec![],
        })
    }

    async fn offer(node: &mut CyclicFilterNode, msg: PipelineMessage) {
        assert!(node.try_handle_data_message(msg).await.unwrap().is_accepted());
    }

    #[tokio::test]
    async fn drops_rows_tagged_with_local_replica() {
        let mut node = CyclicFilterNode::new(MARK_TABLE, &config());
        offer(&mut node, mark_row(100, 1)).await;
        offer(&mut node, mark_row(200, 2)).await;
        // Mark rows never come out.
        assert_eq!(node.try_get_processed_message(), None);

        offer(&mut node, data_row(100)).await;
        offer(&mut node, data_row(200)).await;
        // Txn 100 originated locally and is dropped; txn 200 passes.
        assert_eq!(node.try_get_processed_message(), Some(data_row(200)));
        assert_eq!(node.try_get_processed_message(), None);
        assert_eq!(node.dropped(), 1);
    }

    #[tokio::test]
    async fn drops_rows_from_filtered_replicas() {
        let mut node = CyclicFilterNode::new(MARK_TABLE, &config());
        offer(&mut node, mark_row(100, 3)).await;
        offer(&mut node, data_row(100)).await;
        assert_eq!(node.try_get_processed_message(), None);
        assert_eq!(node.dropped(), 1);
    }

    #[tokio::test]
    async fn untagged_rows_pass() {
        let mut node = CyclicFilterNode::new(MARK_TABLE, &config());
        offer(&mut node, data_row(700)).await;
        assert_eq!(node.try_get_processed_message(), Some(data_row(700)));
    }

    #[tokio::test]
    async fn resolved_and_barrier_pass_through() {
        let mut node = CyclicFilterNode::new(MARK_TABLE, &config());
        offer(&mut node, PipelineMessage::Resolved(9)).await;
        offer(&mut node, PipelineMessage::Barrier(10)).await;
        assert_eq!(
            node.try_get_processed_message(),
            Some(PipelineMessage::Resolved(9))
        );
        assert_eq!(
            node.try_get_processed_message(),
            Some(PipelineMessage::Barrier(10))
        );
    }

    #[tokio::test]
    async fn index_is_bounded_with_lru_eviction() {
        let mut node = CyclicFilterNode::with_index_capacity(MARK_TABLE, &config(), 2);
        offer(&mut node, mark_row(1, 2)).await;
        offer(&mut node, mark_row(2, 2)).await;
        // Touch txn 1 so txn 2 is the least recently used.
        offer(&mut node, data_row(1)).await;
        offer(&mut node, mark_row(3, 2)).await;
        assert!(node.index.map.len() <= 2);
        assert_eq!(node.index.get(2), None);
        assert_eq!(node.index.get(1), Some(2));
        assert_eq!(node.index.get(3), Some(2));
    }
}
