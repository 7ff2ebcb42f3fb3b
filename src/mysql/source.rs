use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Params, Pool, Row as MyRow};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::listener::MysqlBinlogListener;
use super::{json_to_value, opts, quote_ident, row_to_json};
use crate::config::MysqlConfig;
use crate::sync::{Source, Subscription, Watermark};
use crate::types::{Row, RowChange, TableOperation, TableRef, TransformedOperation};
use crate::{Error, Result};

/// MySQL change source reading the binary log as a replica.
pub struct MysqlSource {
    config: MysqlConfig,
    queue_capacity: usize,
    pool: Pool,
    transformations: HashMap<String, String>,
    watermark_table: TableRef,
    listener: Mutex<Option<Arc<MysqlBinlogListener>>>,
    cancel: CancellationToken,
}

impl MysqlSource {
    pub fn new(config: MysqlConfig, queue_capacity: usize) -> Self {
        let transformations = config
            .transformations
            .iter()
            .map(|t| {
                let table = TableRef::parse(&t.table);
                // Unqualified names live in the configured database.
                let table = if table.schema.is_empty() {
                    TableRef::new(config.database.clone(), table.table)
                } else {
                    table
                };
                (table.to_string(), t.sql.clone())
            })
            .collect();
        let watermark_table = TableRef::new(config.database.clone(), config.watermark_table.clone());
        let pool = Pool::new(opts(&config));
        Self {
            config,
            queue_capacity,
            pool,
            transformations,
            watermark_table,
            listener: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    async fn variable(&self, name: &str) -> Result<Option<String>> {
        let mut conn = self.pool.get_conn().await?;
        let row: Option<(String, String)> = conn
            .query_first(format!("SHOW VARIABLES LIKE '{}'", name))
            .await?;
        Ok(row.map(|(_, value)| value))
    }

    async fn check_prerequisites(&self) -> Result<()> {
        let log_bin = self.variable("log_bin").await?;
        if !matches!(log_bin.as_deref(), Some(v) if v.eq_ignore_ascii_case("ON")) {
            return Err(Error::Prerequisite(
                "binary logging is not enabled on the MySQL server".to_string(),
            ));
        }

        let format = self.variable("binlog_format").await?;
        if !matches!(format.as_deref(), Some(v) if v.eq_ignore_ascii_case("ROW")) {
            return Err(Error::Prerequisite(format!(
                "binlog_format must be ROW, found {}",
                format.unwrap_or_else(|| "unknown".to_string())
            )));
        }

        let mut conn = self.pool.get_conn().await?;
        let grants: Vec<String> = conn.query("SHOW GRANTS FOR CURRENT_USER()").await?;
        let allowed = grants
            .iter()
            .any(|g| g.contains("REPLICATION SLAVE") || g.contains("ALL PRIVILEGES"));
        if !allowed {
            return Err(Error::Prerequisite(
                "current MySQL user lacks the REPLICATION SLAVE privilege".to_string(),
            ));
        }
        Ok(())
    }

    fn watermark_table_sql(&self) -> String {
        format!(
            "{}.{}",
            quote_ident(&self.watermark_table.schema),
            quote_ident(&self.watermark_table.table)
        )
    }

    async fn ensure_watermark_table(&self) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.query_drop(format!(
            "CREATE TABLE IF NOT EXISTS {} (
                 id INT AUTO_INCREMENT PRIMARY KEY,
                 backfill VARCHAR(64) NOT NULL,
                 type VARCHAR(4) NOT NULL,
                 CHECK (type IN ('low', 'high'))
             )",
            self.watermark_table_sql()
        ))
        .await?;
        debug!(table = %self.watermark_table, "Watermark table ready");
        Ok(())
    }

    async fn query_rows(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut conn = self.pool.get_conn().await?;
        let params = if params.is_empty() {
            Params::Empty
        } else {
            Params::Positional(params.iter().map(json_to_value).collect())
        };
        let rows: Vec<MyRow> = conn.exec(sql, params).await?;
        Ok(rows.iter().map(row_to_json).collect())
    }
}

#[async_trait]
impl Source for MysqlSource {
    async fn prepare(&self) -> Result<()> {
        self.check_prerequisites().await?;
        self.ensure_watermark_table().await?;
        info!(database = %self.config.database, "MySQL source prepared");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(listener) = listener {
            listener.stop();
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let listener = {
            let mut slot = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return Err(Error::Connection(
                    "mysql source is already subscribed".to_string(),
                ));
            }
            let listener = Arc::new(MysqlBinlogListener::new(
                self.config.clone(),
                self.pool.clone(),
                self.queue_capacity,
                self.cancel.child_token(),
            ));
            *slot = Some(listener.clone());
            listener
        };
        listener.start().await
    }

    async fn apply_transformations(
        &self,
        operation: &TableOperation,
    ) -> Option<TransformedOperation> {
        let table = operation.table_ref().to_string();
        let Some(sql) = self.transformations.get(&table) else {
            debug!(table = %table, "No transformation for table");
            return None;
        };

        let key_columns = operation.key_columns.clone();
        if let RowChange::Delete { old_keys } = &operation.change {
            return Some(TransformedOperation::Delete {
                key_columns,
                object_keys: old_keys.clone(),
            });
        }

        let mut rows = match self.query_rows(sql, &operation.key_values()).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(table = %table, error = %e, "Transformation failed");
                return None;
            }
        };
        if rows.len() != 1 {
            warn!(
                table = %table,
                rows = rows.len(),
                "Expected exactly one row from transformation"
            );
            return None;
        }
        let object = rows.pop()?;
        Some(match operation.change {
            RowChange::Insert { .. } => TransformedOperation::Insert {
                key_columns,
                object,
            },
            _ => TransformedOperation::Update {
                key_columns,
                object,
            },
        })
    }

    async fn get_backfill_records(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let rows = self.query_rows(sql, params).await?;
        debug!(rows = rows.len(), "Backfill query returned");
        Ok(rows)
    }

    async fn write_watermark(&self, watermark: &Watermark) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(
            format!(
                "INSERT INTO {} (type, backfill) VALUES (?, ?)",
                self.watermark_table_sql()
            ),
            (watermark.kind.as_str(), watermark.backfill_id.as_str()),
        )
        .await?;
        debug!(kind = %watermark.kind, backfill_id = %watermark.backfill_id, "Wrote watermark");
        Ok(())
    }

    fn watermark_table(&self) -> TableRef {
        self.watermark_table.clone()
    }
}
