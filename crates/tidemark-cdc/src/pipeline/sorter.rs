//! Sorter stage
//!
//! Buffers row events and releases them in commit-ts order once a resolved
//! tick covers them. The resolved message itself is forwarded after the
//! rows it covers, so downstream stages observe rows before the watermark
//! that promises their completeness.

use crate::common::{Result, RowChangedEvent, TableId, Ts};
use crate::pipeline::{ChangefeedContext, DataNode, Handled, PipelineMessage};
use async_trait::async_trait;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use tracing::{debug, warn};

/// Default bound on the sorter's output queue; once reached the sorter
/// rejects further rows.
pub const DEFAULT_SORTER_OUT_CAPACITY: usize = 1024;

struct SortEntry {
    commit_ts: Ts,
    /// Arrival order; keeps the sort stable for equal commit timestamps.
    seq: u64,
    row: RowChangedEvent,
}

impl PartialEq for SortEntry {
    fn eq(&self, other: &Self) -> bool {
        self.commit_ts == other.commit_ts && self.seq == other.seq
    }
}

impl Eq for SortEntry {}

impl PartialOrd for SortEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.commit_ts, self.seq).cmp(&(other.commit_ts, other.seq))
    }
}

/// Orders rows by commit ts under resolved-tick control.
pub struct SorterNode {
    table_id: TableId,
    table_name: String,
    start_ts: Ts,
    heap: BinaryHeap<Reverse<SortEntry>>,
    out: VecDeque<PipelineMessage>,
    out_capacity: usize,
    max_resolved_ts: Ts,
    next_seq: u64,
}

impl SorterNode {
    pub fn new(table_name: impl Into<String>, table_id: TableId, start_ts: Ts) -> Self {
        Self {
            table_id,
            table_name: table_name.into(),
            start_ts,
            heap: BinaryHeap::new(),
            out: VecDeque::new(),
            out_capacity: DEFAULT_SORTER_OUT_CAPACITY,
            max_resolved_ts: start_ts,
            next_seq: 0,
        }
    }

    /// Rows buffered and not yet released.
    pub fn pending_rows(&self) -> usize {
        self.heap.len()
    }

    fn release_up_to(&mut self, ts: Ts) {
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.commit_ts > ts {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                self.out.push_back(PipelineMessage::Row(entry.row));
            }
        }
    }
}

#[async_trait]
impl DataNode for SorterNode {
    async fn start(&mut self, _ctx: &ChangefeedContext) -> Result<()> {
        debug!(
            table_id = self.table_id,
            table = %self.table_name,
            start_ts = self.start_ts,
            "sorter started"
        );
        Ok(())
    }

    async fn try_handle_data_message(&mut self, msg: PipelineMessage) -> Result<Handled> {
        match msg {
            PipelineMessage::Row(row) => {
                if self.out.len() >= self.out_capacity {
                    return Ok(Handled::Rejected(PipelineMessage::Row(row)));
                }
                if row.commit_ts <= self.max_resolved_ts {
                    // Late row below the watermark; upstream violated the
                    // resolved promise. Forward it right away rather than
                    // bury it behind newer rows.
                    warn!(
                        table_id = self.table_id,
                        commit_ts = row.commit_ts,
                        resolved_ts = self.max_resolved_ts,
                        "row arrived below the resolved watermark"
                    );
                    self.out.push_back(PipelineMessage::Row(row));
                    return Ok(Handled::Accepted);
                }
                self.heap.push(Reverse(SortEntry {
                    commit_ts: row.commit_ts,
                    seq: self.next_seq,
                    row,
                }));
                self.next_seq += 1;
                Ok(Handled::Accepted)
            }
            PipelineMessage::Resolved(ts) => {
                if ts > self.max_resolved_ts {
                    self.max_resolved_ts = ts;
                }
                self.release_up_to(ts);
                self.out.push_back(PipelineMessage::Resolved(ts));
                Ok(Handled::Accepted)
            }
            passthrough @ (PipelineMessage::Barrier(_) | PipelineMessage::Ddl(_)) => {
                self.out.push_back(passthrough);
                Ok(Handled::Accepted)
            }
        }
    }

    fn try_get_processed_message(&mut self) -> Option<PipelineMessage> {
        self.out.pop_front()
    }

    async fn close(&mut self) -> Result<()> {
        self.heap.clear();
        self.out.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(commit_ts: Ts) -> RowChangedEvent {
        RowChangedEvent {
            table_id: 1,
            commit_ts,
            start_ts: commit_ts.saturating_sub(1),
            schema: "s".into(),
            table: "t".into(),
            pre_row: None,
            post_row: Some(json!({"id": commit_ts})),
            columns: vec![],
        }
    }

    async fn offer(sorter: &mut SorterNode, msg: PipelineMessage) {
        assert!(sorter
            .try_handle_data_message(msg)
            .await
            .unwrap()
            .is_accepted());
    }

    #[tokio::test]
    async fn releases_in_commit_ts_order_on_resolved() {
        let mut sorter = SorterNode::new("t1", 1, 0);
        offer(&mut sorter, PipelineMessage::Row(row(30))).await;
        offer(&mut sorter, PipelineMessage::Row(row(10))).await;
        offer(&mut sorter, PipelineMessage::Row(row(20))).await;
        // Nothing comes out before a resolved tick.
        assert_eq!(sorter.try_get_processed_message(), None);

        offer(&mut sorter, PipelineMessage::Resolved(20)).await;
        assert_eq!(
            sorter.try_get_processed_message(),
            Some(PipelineMessage::Row(row(10)))
        );
        assert_eq!(
            sorter.try_get_processed_message(),
            Some(PipelineMessage::Row(row(20)))
        );
        assert_eq!(
            sorter.try_get_processed_message(),
            Some(PipelineMessage::Resolved(20))
        );
        assert_eq!(sorter.try_get_processed_message(), None);
        assert_eq!(sorter.pending_rows(), 1);

        offer(&mut sorter, PipelineMessage::Resolved(40)).await;
        assert_eq!(
            sorter.try_get_processed_message(),
            Some(PipelineMessage::Row(row(30)))
        );
        assert_eq!(
            sorter.try_get_processed_message(),
            Some(PipelineMessage::Resolved(40))
        );
    }

    #[tokio::test]
    async fn equal_commit_ts_stays_in_arrival_order() {
        let mut sorter = SorterNode::new("t1", 1, 0);
        let mut first = row(10);
        first.start_ts = 1;
        let mut second = row(10);
        second.start_ts = 2;
        offer(&mut sorter, PipelineMessage::Row(first.clone())).await;
        offer(&mut sorter, PipelineMessage::Row(second.clone())).await;
        offer(&mut sorter, PipelineMessage::Resolved(10)).await;
        assert_eq!(
            sorter.try_get_processed_message(),
            Some(PipelineMessage::Row(first))
        );
        assert_eq!(
            sorter.try_get_processed_message(),
            Some(PipelineMessage::Row(second))
        );
    }

    #[tokio::test]
    async fn barrier_and_ddl_pass_through() {
        let mut sorter = SorterNode::new("t1", 1, 0);
        offer(&mut sorter, PipelineMessage::Barrier(5)).await;
        assert_eq!(
            sorter.try_get_processed_message(),
            Some(PipelineMessage::Barrier(5))
        );
    }

    #[tokio::test]
    async fn rejects_rows_when_output_is_full() {
        let mut sorter = SorterNode::new("t1", 1, 0);
        sorter.out_capacity = 1;
        offer(&mut sorter, PipelineMessage::Resolved(1)).await;
        match sorter
            .try_handle_data_message(PipelineMessage::Row(row(10)))
            .await
            .unwrap()
        {
            Handled::Rejected(PipelineMessage::Row(_)) => {}
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
