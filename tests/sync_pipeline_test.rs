mod common;

use common::{read_lines, row};
use schema_sync::sink::FileSink;
use schema_sync::sync::{
    BackfillOutcome, BackfillSource, ControllerConfig, MemorySource, SyncController,
};
use schema_sync::types::{TableOperation, TableRef};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn account() -> TableRef {
    TableRef::new("public", "account")
}

fn insert(id: i64, name: &str) -> TableOperation {
    TableOperation::insert(&account(), vec!["id".to_string()], row(json!({"id": id, "name": name})))
}

#[tokio::test]
async fn test_backfill_through_file_sink() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("objects.jsonl");

    let source = Arc::new(MemorySource::new());
    let sink = Arc::new(FileSink::new(path.to_str().unwrap()));
    let controller = SyncController::new(source.clone(), sink, ControllerConfig::default());
    controller.start().await.unwrap();

    source.set_backfill_rows(vec![
        row(json!({"id": 1, "name": "stale"})),
        row(json!({"id": 2, "name": "b"})),
    ]);
    source.hold_backfill();

    let backfill = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .start_backfill(
                    vec![BackfillSource::new("public.account", [("id", "id")])],
                    "SELECT id, name FROM account",
                    &[],
                )
                .await
        })
    };

    source.backfill_started().await;
    assert!(source.emit(vec![insert(1, "fresh")]).await);
    source.release_backfill();

    let outcome = tokio::time::timeout(Duration::from_secs(5), backfill)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(
        outcome,
        BackfillOutcome::Completed { emitted: 1, dropped: 1, .. }
    ));
    controller.stop().await;

    let lines = read_lines(&path).await;
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["type"], "insert");
    assert_eq!(lines[0]["object"], json!({"id": 1, "name": "fresh"}));
    assert_eq!(lines[1]["type"], "insert");
    assert_eq!(lines[1]["object"], json!({"id": 2, "name": "b"}));
    assert_eq!(lines[1]["keyColumns"], json!(["id"]));
}

#[tokio::test]
async fn test_second_backfill_is_rejected_while_one_is_open() {
    let source = Arc::new(MemorySource::new());
    let temp_dir = TempDir::new().unwrap();
    let sink = Arc::new(FileSink::new(
        temp_dir.path().join("out.jsonl").to_str().unwrap(),
    ));
    let controller = SyncController::new(source.clone(), sink, ControllerConfig::default());
    controller.start().await.unwrap();

    source.hold_backfill();
    let first = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .start_backfill(
                    vec![BackfillSource::new("public.account", [("id", "id")])],
                    "SELECT 1",
                    &[],
                )
                .await
        })
    };
    source.backfill_started().await;

    let second = controller
        .start_backfill(
            vec![BackfillSource::new("public.account", [("id", "id")])],
            "SELECT 2",
            &[],
        )
        .await;
    assert!(matches!(
        second,
        Err(schema_sync::Error::BackfillInProgress { .. })
    ));

    source.release_backfill();
    assert!(first.await.unwrap().is_ok());
    controller.stop().await;
}
