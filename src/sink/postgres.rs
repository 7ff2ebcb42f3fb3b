use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info};

use crate::config::PostgresSinkConfig;
use crate::postgres::sql::JsonParam;
use crate::sync::Sink;
use crate::types::TransformedOperation;
use crate::{Error, Result};

/// Applies operations to a Postgres database through consumer-provided
/// statements.
///
/// `upsert_sql` receives the object as `$1`; `delete_sql` receives the key
/// object. Both are usually written against `$1::jsonb`.
pub struct PostgresSink {
    config: PostgresSinkConfig,
    client: OnceCell<Client>,
}

impl PostgresSink {
    pub fn new(config: PostgresSinkConfig) -> Self {
        Self {
            config,
            client: OnceCell::new(),
        }
    }

    async fn connect(&self) -> Result<Client> {
        let (client, connection) = tokio_postgres::connect(&self.config.url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "Postgres sink connection error");
            }
        });
        Ok(client)
    }

    /// The statement for an operation, or `None` when deletes are not mapped.
    fn statement_for(&self, operation: &TransformedOperation) -> Option<&str> {
        if operation.is_delete() {
            self.config.delete_sql.as_deref()
        } else {
            Some(self.config.upsert_sql.as_str())
        }
    }
}

#[async_trait]
impl Sink for PostgresSink {
    async fn prepare(&self) -> Result<()> {
        self.client.get_or_try_init(|| self.connect()).await?;
        info!("Postgres sink connected");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn write_data(&self, operation: &TransformedOperation) -> Result<()> {
        let Some(sql) = self.statement_for(operation) else {
            debug!("No delete statement configured, skipping delete");
            return Ok(());
        };
        let client = self
            .client
            .get()
            .ok_or_else(|| Error::Connection("postgres sink is not prepared".to_string()))?;

        let object = Value::Object(operation.payload().clone());
        let param = JsonParam(&object);
        let params: [&(dyn ToSql + Sync); 1] = [&param];
        let affected = client.execute(sql, &params).await?;
        debug!(rows = affected, delete = operation.is_delete(), "Applied operation");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sink(delete_sql: Option<&str>) -> PostgresSink {
        PostgresSink::new(PostgresSinkConfig {
            url: "postgres://localhost/target".to_string(),
            upsert_sql: "SELECT upsert_object($1::jsonb)".to_string(),
            delete_sql: delete_sql.map(str::to_string),
        })
    }

    fn op(delete: bool) -> TransformedOperation {
        let row = json!({"id": 1}).as_object().cloned().unwrap();
        if delete {
            TransformedOperation::Delete {
                key_columns: vec!["id".to_string()],
                object_keys: row,
            }
        } else {
            TransformedOperation::Update {
                key_columns: vec!["id".to_string()],
                object: row,
            }
        }
    }

    #[test]
    fn test_statement_selection() {
        let with_delete = sink(Some("SELECT delete_object($1::jsonb)"));
        assert_eq!(
            with_delete.statement_for(&op(false)),
            Some("SELECT upsert_object($1::jsonb)")
        );
        assert_eq!(
            with_delete.statement_for(&op(true)),
            Some("SELECT delete_object($1::jsonb)")
        );
        assert_eq!(sink(None).statement_for(&op(true)), None);
    }

    #[tokio::test]
    async fn test_write_before_prepare_fails() {
        let result = sink(None).write_data(&op(false)).await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn test_unmapped_delete_is_skipped() {
        assert!(sink(None).write_data(&op(true)).await.is_ok());
    }
}
