#![allow(dead_code)]

use schema_sync::config::{PostgresConfig, TransformationConfig};
use schema_sync::types::Row;
use serde_json::Value;
use std::path::Path;

pub fn row(value: Value) -> Row {
    value.as_object().cloned().expect("object literal")
}

/// Postgres source settings for a test database; names are unique per process.
pub fn postgres_config(host: &str, port: u16) -> PostgresConfig {
    PostgresConfig {
        host: host.to_string(),
        port,
        database: "postgres".to_string(),
        username: "postgres".to_string(),
        password: "postgres".to_string(),
        publication: format!("test_publication_{}", std::process::id()),
        slot_name: format!("test_slot_{}", std::process::id()),
        create_publication: true,
        create_slot: true,
        proto_version: 1,
        connect_timeout_secs: 30,
        status_interval_secs: 1,
        watermark_schema: "schema_sync".to_string(),
        watermark_table: "watermarks".to_string(),
        transformations: vec![TransformationConfig {
            table: "public.account".to_string(),
            sql: "SELECT id, upper(name) AS name FROM public.account WHERE id = $1".to_string(),
        }],
    }
}

/// Reads a JSON-lines sink file.
pub async fn read_lines(path: &Path) -> Vec<Value> {
    let contents = tokio::fs::read_to_string(path).await.unwrap_or_default();
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).expect("valid JSON line"))
        .collect()
}
