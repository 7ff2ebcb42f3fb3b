mod common;

use common::{postgres_config, read_lines};
use schema_sync::postgres::PostgresSource;
use schema_sync::sink::FileSink;
use schema_sync::sync::{BackfillOutcome, BackfillSource, ControllerConfig, SyncController};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tokio_postgres::{Client, NoTls};
use tracing::info;

async fn start_postgres() -> (ContainerAsync<GenericImage>, String, u16) {
    let container = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_cmd(vec!["postgres", "-c", "wal_level=logical"])
        .start()
        .await
        .expect("postgres container");
    let host = container.get_host().await.unwrap().to_string();
    let port = container.get_host_port_ipv4(5432).await.unwrap();
    (container, host, port)
}

async fn connect(host: &str, port: u16) -> Client {
    let conn_str = format!(
        "host={} port={} user=postgres password=postgres dbname=postgres",
        host, port
    );
    // The server restarts once after initdb.
    for _ in 0..30 {
        if let Ok((client, connection)) = tokio_postgres::connect(&conn_str, NoTls).await {
            tokio::spawn(async move {
                let _ = connection.await;
            });
            return client;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("postgres did not accept connections");
}

async fn wait_for_lines(path: &Path, count: usize) -> Vec<Value> {
    for _ in 0..100 {
        let lines = read_lines(path).await;
        if lines.len() >= count {
            return lines;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    read_lines(path).await
}

#[tokio::test]
#[ignore] // Requires Docker: cargo test --test postgres_integration_test -- --ignored
async fn test_live_changes_and_backfill() {
    tracing_subscriber::fmt()
        .with_env_filter("schema_sync=debug")
        .try_init()
        .ok();

    let (_container, host, port) = start_postgres().await;
    let client = connect(&host, port).await;
    client
        .batch_execute(
            "CREATE TABLE public.account (id INT PRIMARY KEY, name TEXT NOT NULL);
             INSERT INTO public.account VALUES (1, 'alice'), (2, 'bob');",
        )
        .await
        .unwrap();

    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("objects.jsonl");
    let source = Arc::new(PostgresSource::new(postgres_config(&host, port), 16));
    let sink = Arc::new(FileSink::new(path.to_str().unwrap()));
    let controller = SyncController::new(
        source,
        sink,
        ControllerConfig {
            backfill_timeout: Some(Duration::from_secs(30)),
        },
    );
    controller.start().await.unwrap();
    info!("Controller started");

    client
        .batch_execute(
            "INSERT INTO public.account VALUES (3, 'carol');
             UPDATE public.account SET name = 'bobby' WHERE id = 2;
             DELETE FROM public.account WHERE id = 1;",
        )
        .await
        .unwrap();

    let lines = wait_for_lines(&path, 3).await;
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["type"], "insert");
    assert_eq!(lines[0]["object"], json!({"id": 3, "name": "CAROL"}));
    assert_eq!(lines[1]["type"], "update");
    assert_eq!(lines[1]["object"], json!({"id": 2, "name": "BOBBY"}));
    assert_eq!(lines[2]["type"], "delete");
    assert_eq!(lines[2]["objectKeys"], json!({"id": 1}));

    let outcome = controller
        .start_backfill(
            vec![BackfillSource::new("public.account", [("id", "id")])],
            "SELECT id, upper(name) AS name FROM public.account WHERE id > $1 ORDER BY id",
            &[json!(0)],
        )
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        BackfillOutcome::Completed { emitted: 2, dropped: 0, .. }
    ));

    let lines = wait_for_lines(&path, 5).await;
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[3]["object"], json!({"id": 2, "name": "BOBBY"}));
    assert_eq!(lines[4]["object"], json!({"id": 3, "name": "CAROL"}));

    controller.stop().await;
}
