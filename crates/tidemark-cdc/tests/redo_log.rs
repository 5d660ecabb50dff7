//! End-to-end tests for the file-backed redo log.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tidemark_cdc::common::{RowChangedEvent, Ts};
use tidemark_cdc::redo::record::{read_segment, RedoRecord};
use tidemark_cdc::redo::{
    ConsistentConfig, ConsistentLevel, ConsistentStorage, ManagerOptions, RedoLogManager,
    RedoRuntimeContext,
};

fn row(table_id: i64, commit_ts: Ts) -> RowChangedEvent {
    RowChangedEvent {
        table_id,
        commit_ts,
        start_ts: commit_ts - 1,
        schema: "shop".into(),
        table: "orders".into(),
        pre_row: None,
        post_row: Some(json!({"id": commit_ts})),
        columns: vec![],
    }
}

fn collect_segments(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_segments(&path, out);
        } else if path.extension().is_some_and(|e| e == "log") {
            out.push(path);
        }
    }
}

async fn manager_in(
    data_dir: &Path,
    storage: ConsistentStorage,
) -> Arc<RedoLogManager> {
    let config = ConsistentConfig {
        level: ConsistentLevel::Eventual,
        storage,
        ..Default::default()
    };
    RedoLogManager::new(
        Some(&config),
        RedoRuntimeContext {
            data_dir: data_dir.to_path_buf(),
            capture_id: "capture-1".into(),
            changefeed_id: "feed-1".into(),
        },
        ManagerOptions::default(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn rows_are_durable_and_crc_checked() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(dir.path(), ConsistentStorage::Local).await;
    assert!(manager.enabled());

    manager.add_table(1, 100);
    manager
        .emit_row_changed_events(1, vec![row(1, 110), row(1, 120)])
        .await
        .unwrap();
    manager
        .emit_ddl_event(tidemark_cdc::common::DdlEvent {
            commit_ts: 130,
            schema: "shop".into(),
            table: "orders".into(),
            query: "alter table orders add column note text".into(),
            ddl_type: tidemark_cdc::common::DdlType::Alter,
        })
        .await
        .unwrap();
    manager.flush_log(1, 120).await.unwrap();
    manager.flush_resolved_and_checkpoint_ts(120, 100).await.unwrap();
    manager.close().await.unwrap();

    // The layout is {data_dir}/redo/{capture}/{changefeed}/{create_time}.
    let feed_dir = dir.path().join("redo").join("capture-1").join("feed-1");
    assert!(feed_dir.is_dir(), "missing redo layout at {feed_dir:?}");

    let mut segments = Vec::new();
    collect_segments(dir.path(), &mut segments);
    assert!(!segments.is_empty());

    let mut records = Vec::new();
    for segment in &segments {
        records.extend(read_segment(segment).await.unwrap());
    }
    let rows: Vec<Ts> = records
        .iter()
        .filter_map(|r| match r {
            RedoRecord::Row(row) => Some(row.commit_ts),
            _ => None,
        })
        .collect();
    assert_eq!(rows, vec![110, 120]);
    assert!(records
        .iter()
        .any(|r| matches!(r, RedoRecord::Ddl(ddl) if ddl.commit_ts == 130)));
    assert!(records
        .iter()
        .any(|r| matches!(r, RedoRecord::Resolved { table_id: 0, ts: 120 })));
    assert!(records
        .iter()
        .any(|r| matches!(r, RedoRecord::Checkpoint { ts: 100 })));
}

#[tokio::test]
async fn min_resolved_ts_scenario_over_file_writer() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(dir.path(), ConsistentStorage::Local).await;

    manager.add_table(1, 100);
    manager.add_table(2, 200);
    manager.add_table(3, 150);

    manager.flush_log(1, 120).await.unwrap();
    manager.flush_log(2, 220).await.unwrap();
    manager.flush_log(3, 160).await.unwrap();
    manager.update_table_resolved_ts().await.unwrap();
    assert_eq!(manager.min_resolved_ts(), 120);

    manager.remove_table(1);
    manager.update_table_resolved_ts().await.unwrap();
    assert_eq!(manager.min_resolved_ts(), 160);

    manager.close().await.unwrap();
}

#[tokio::test]
async fn blackhole_storage_accepts_everything() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_in(dir.path(), ConsistentStorage::Blackhole).await;
    manager.add_table(9, 50);
    manager
        .emit_row_changed_events(9, vec![row(9, 60)])
        .await
        .unwrap();
    manager.flush_log(9, 60).await.unwrap();
    manager.update_table_resolved_ts().await.unwrap();
    assert_eq!(manager.min_resolved_ts(), 60);
    // Nothing lands on disk.
    let mut segments = Vec::new();
    collect_segments(dir.path(), &mut segments);
    assert!(segments.is_empty());
    manager.close().await.unwrap();
}
