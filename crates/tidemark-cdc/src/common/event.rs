//! Change event model
//!
//! Row mutations arrive from the upstream with a total order over commit
//! timestamps. A [`RowChangedEvent`] carries the pre/post images of the
//! row; which of the two is present implies the operation kind.

use serde::{Deserialize, Serialize};

/// Upstream table identifier.
pub type TableId = i64;

/// Commit timestamp assigned by the upstream. Ordering is total.
pub type Ts = u64;

/// Operation implied by the pre/post images of a row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Insert,
    Update,
    Delete,
}

/// One column of a row image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub value: serde_json::Value,
}

impl Column {
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A row-level mutation.
///
/// Invariant: at least one of `pre_row` / `post_row` is present, and the
/// combination implies exactly one [`RowKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChangedEvent {
    pub table_id: TableId,
    /// Commit timestamp of the owning transaction.
    pub commit_ts: Ts,
    /// Start timestamp of the owning transaction; doubles as the
    /// transaction id for the cyclic-replication join.
    pub start_ts: Ts,
    pub schema: String,
    pub table: String,
    /// Row image before the change (UPDATE / DELETE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_row: Option<serde_json::Value>,
    /// Row image after the change (INSERT / UPDATE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_row: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<Column>,
}

impl RowChangedEvent {
    /// Operation kind, or `None` when neither image is present (a
    /// malformed event).
    pub fn kind(&self) -> Option<RowKind> {
        match (&self.pre_row, &self.post_row) {
            (None, Some(_)) => Some(RowKind::Insert),
            (Some(_), Some(_)) => Some(RowKind::Update),
            (Some(_), None) => Some(RowKind::Delete),
            (None, None) => None,
        }
    }
}

/// Kind of schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DdlType {
    Create,
    Drop,
    Alter,
    Rename,
    Truncate,
    Other,
}

/// A schema-change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdlEvent {
    pub commit_ts: Ts,
    pub schema: String,
    pub table: String,
    pub query: String,
    pub ddl_type: DdlType,
}

/// Upstream assertion that no further event for `table_id` with
/// `commit_ts <= ts` will arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTick {
    pub table_id: TableId,
    pub ts: Ts,
}

/// Replica metadata the processor hands to a table pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableReplicaInfo {
    pub start_ts: Ts,
    /// Mark table for cyclic replication; 0 means none.
    pub mark_table_id: TableId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pre: Option<serde_json::Value>, post: Option<serde_json::Value>) -> RowChangedEvent {
        RowChangedEvent {
            table_id: 1,
            commit_ts: 100,
            start_ts: 99,
            schema: "test".into(),
            table: "t1".into(),
            pre_row: pre,
            post_row: post,
            columns: vec![],
        }
    }

    #[test]
    fn kind_from_images() {
        assert_eq!(row(None, Some(json!({"id": 1}))).kind(), Some(RowKind::Insert));
        assert_eq!(
            row(Some(json!({"id": 1})), Some(json!({"id": 2}))).kind(),
            Some(RowKind::Update)
        );
        assert_eq!(row(Some(json!({"id": 1})), None).kind(), Some(RowKind::Delete));
        assert_eq!(row(None, None).kind(), None);
    }

    #[test]
    fn event_round_trips_through_json() {
        let event = row(Some(json!({"id": 1})), Some(json!({"id": 2})));
        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: RowChangedEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(event, decoded);
    }
}
